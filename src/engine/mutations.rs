use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::schedule::{validate_note, validate_station, validate_weekday, validate_windows};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Register a station or replace its record.
    ///
    /// Shrinking a station may not strand anything: every live booking and
    /// every schedule window must still name an existing slot.
    pub async fn upsert_station(&self, station: Station) -> Result<(), EngineError> {
        validate_station(&station)?;
        let event = Event::StationUpserted {
            station: station.clone(),
        };

        if let Some(shared) = self.get_station_state(&station.id) {
            let mut guard = shared.write().await;
            if let Some(stranded) = guard
                .bookings
                .values()
                .find(|b| b.status.holds_claim() && !station.has_slot(&b.slot))
            {
                return Err(EngineError::Validation(format!(
                    "booking {} still holds slot {}",
                    stranded.id, stranded.slot
                )));
            }
            let scheduled = guard
                .template
                .values()
                .chain(guard.exceptions.values().map(|e| &e.windows))
                .flatten()
                .flat_map(|w| w.slot_ids.iter())
                .find(|s| !station.has_slot(s));
            if let Some(slot) = scheduled {
                return Err(EngineError::Validation(format!(
                    "schedule still opens slot {slot}"
                )));
            }
            self.persist_and_apply(&mut guard, &event).await?;
            info!(station = %station.id, status = ?station.status, "station updated");
            return Ok(());
        }

        let _registering = self.registry.read().await;
        if self.stations.len() >= MAX_STATIONS {
            return Err(EngineError::LimitExceeded("too many stations"));
        }
        self.wal_append(&event).await?;
        // A concurrent first upsert of the same id may have won the insert;
        // both events are in the WAL and the later record applies.
        let shared = self
            .stations
            .entry(station.id)
            .or_insert_with(|| Arc::new(RwLock::new(StationState::new(station.clone()))))
            .clone();
        shared.write().await.station = station.clone();
        self.notify.send(station.id, &event);
        metrics::gauge!(crate::observability::STATIONS_LOADED).set(self.stations.len() as f64);
        info!(station = %station.id, ac = station.ac_slots, dc = station.dc_slots, "station registered");
        Ok(())
    }

    /// Replace the weekly template for one weekday. Existing bookings are kept.
    pub async fn set_template(&self, entry: WeeklyTemplateEntry) -> Result<(), EngineError> {
        validate_weekday(entry.weekday)?;
        let shared = self.station_state(&entry.station_id)?;
        let mut guard = shared.write().await;
        let windows = validate_windows(&guard.station, &entry.windows)?;

        let event = Event::TemplateSet {
            station_id: entry.station_id,
            weekday: entry.weekday,
            windows,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Remove the template for a weekday, closing the station on that day.
    /// Returns false if there was nothing to remove.
    pub async fn clear_template(&self, station_id: Ulid, weekday: u8) -> Result<bool, EngineError> {
        validate_weekday(weekday)?;
        let shared = self.station_state(&station_id)?;
        let mut guard = shared.write().await;
        if !guard.template.contains_key(&weekday) {
            return Ok(false);
        }
        let event = Event::TemplateCleared { station_id, weekday };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Set the exception for a date, replacing any earlier one for that date.
    pub async fn set_exception(&self, exception: ScheduleException) -> Result<(), EngineError> {
        validate_note(exception.note.as_deref(), "exception note too long")?;
        let shared = self.station_state(&exception.station_id)?;
        let mut guard = shared.write().await;
        if !guard.exceptions.contains_key(&exception.date)
            && guard.exceptions.len() >= MAX_EXCEPTIONS_PER_STATION
        {
            return Err(EngineError::LimitExceeded("too many schedule exceptions"));
        }
        let windows = validate_windows(&guard.station, &exception.windows)?;

        let (station_id, date, closed) = (exception.station_id, exception.date, windows.is_empty());
        let event = Event::ExceptionSet {
            exception: ScheduleException { windows, ..exception },
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(station = %station_id, %date, closed, "schedule exception set");
        Ok(())
    }

    /// Drop the exception for a date so the weekly template applies again.
    /// Returns false if there was none.
    pub async fn remove_exception(&self, station_id: Ulid, date: NaiveDate) -> Result<bool, EngineError> {
        let shared = self.station_state(&station_id)?;
        let mut guard = shared.write().await;
        if !guard.exceptions.contains_key(&date) {
            return Ok(false);
        }
        let event = Event::ExceptionRemoved { station_id, date };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    ///
    /// The registry gate and read locks on every station are held until the
    /// rewritten file is in place, so no commit or new station can land in
    /// the old file after the snapshot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let registry = self.registry.write().await;
        let mut station_ids: Vec<Ulid> = self.stations.iter().map(|e| *e.key()).collect();
        // Same order as pair locking in the lifecycle, so this cannot deadlock.
        station_ids.sort();

        let mut guards = Vec::with_capacity(station_ids.len());
        for id in &station_ids {
            if let Some(shared) = self.get_station_state(id) {
                guards.push(shared.read_owned().await);
            }
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::StationUpserted {
                station: guard.station.clone(),
            });
            for (weekday, windows) in &guard.template {
                events.push(Event::TemplateSet {
                    station_id: guard.station.id,
                    weekday: *weekday,
                    windows: windows.clone(),
                });
            }
            for exception in guard.exceptions.values() {
                events.push(Event::ExceptionSet {
                    exception: exception.clone(),
                });
            }
            let mut bookings: Vec<&Booking> = guard.bookings.values().collect();
            bookings.sort_by_key(|b| (b.created_at, b.id));
            for booking in bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        drop(registry);

        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

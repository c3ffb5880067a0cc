use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::allocator::free_slots;
use super::schedule::{booking_day, resolve, span_on_date};
use super::{Engine, EngineError};

impl Engine {
    /// Free slots of `kind` at a station for a minute-of-day range on a local
    /// date, lowest ordinal first.
    ///
    /// `Err(Closed)` when the station is not open for the whole range;
    /// `Ok(vec![])` when it is open but every matching slot is claimed.
    /// `exclude` names a booking being edited so its own claim is ignored.
    pub async fn find_available(
        &self,
        station_id: Ulid,
        date: NaiveDate,
        start_minute: u16,
        end_minute: u16,
        kind: SlotType,
        exclude: Option<Ulid>,
    ) -> Result<Vec<SlotId>, EngineError> {
        let shared = self.station_state(&station_id)?;
        let guard = shared.read().await;
        let span = span_on_date(&guard.station, date, start_minute, end_minute)?;
        free_slots(&guard, date, &span, kind, exclude)
    }

    /// Same as `find_available`, for an absolute time range.
    pub async fn find_available_at(
        &self,
        station_id: Ulid,
        span: Span,
        kind: SlotType,
        exclude: Option<Ulid>,
    ) -> Result<Vec<SlotId>, EngineError> {
        let shared = self.station_state(&station_id)?;
        let guard = shared.read().await;
        let date = booking_day(&guard.station, &span)?;
        free_slots(&guard, date, &span, kind, exclude)
    }

    /// Resolved windows for a station on a local date. Empty means closed.
    pub async fn effective_availability(&self, station_id: Ulid, date: NaiveDate) -> Result<Vec<Window>, EngineError> {
        let shared = self.station_state(&station_id)?;
        let guard = shared.read().await;
        Ok(resolve(&guard, date).to_vec())
    }

    pub async fn get_station(&self, station_id: Ulid) -> Result<Station, EngineError> {
        let shared = self.station_state(&station_id)?;
        let guard = shared.read().await;
        Ok(guard.station.clone())
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let station_id = self
            .station_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let shared = self.station_state(&station_id)?;
        let guard = shared.read().await;
        guard
            .bookings
            .get(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Every booking at a station, cancelled ones included, ordered by start.
    pub async fn list_bookings(&self, station_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let shared = self.station_state(&station_id)?;
        let guard = shared.read().await;
        let mut bookings: Vec<Booking> = guard.bookings.values().cloned().collect();
        bookings.sort_by_key(|b| (b.span.start, b.slot, b.id));
        Ok(bookings)
    }

    /// Bookings of one owner across all stations, ordered by start.
    pub async fn list_owner_bookings(&self, owner_id: &str) -> Vec<Booking> {
        let mut out = Vec::new();
        for shared in self.station_handles() {
            let guard = shared.read().await;
            out.extend(
                guard
                    .bookings
                    .values()
                    .filter(|b| b.owner_id == owner_id)
                    .cloned(),
            );
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        out
    }

    pub async fn list_stations(&self) -> Vec<StationSummary> {
        let mut out = Vec::with_capacity(self.stations.len());
        for shared in self.station_handles() {
            let guard = shared.read().await;
            out.push(StationSummary {
                id: guard.station.id,
                name: guard.station.name.clone(),
                ac_slots: guard.station.ac_slots,
                dc_slots: guard.station.dc_slots,
                status: guard.station.status,
                template_days: guard.template.len(),
                exceptions: guard.exceptions.len(),
                active_bookings: guard.active_booking_count(),
            });
        }
        out.sort_by_key(|s| s.id);
        out
    }

    /// Snapshot of the station handles so no map shard stays locked across an await.
    fn station_handles(&self) -> Vec<super::SharedStationState> {
        self.stations.iter().map(|e| e.value().clone()).collect()
    }
}

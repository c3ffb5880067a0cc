mod allocator;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod rules;
mod schedule;

pub use allocator::{check_claim, free_slots};
pub use error::{EngineError, LifecycleRule};
pub use lifecycle::{BookingChanges, NewBooking};
pub use rules::{
    check_creation_horizon, check_modification_cutoff, meets_modification_cutoff, within_creation_horizon,
    CREATION_HORIZON_MS, MODIFICATION_CUTOFF_MS,
};
pub use schedule::{covering_window, resolve};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::directory::{AcceptAllOwners, OwnerDirectory};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedStationState = Arc<RwLock<StationState>>;

pub(super) const MAX_RELOCK_ATTEMPTS: usize = 3;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                commit_batch(&mut wal, &mut batch);
                // Non-append commands run after the batch they interrupted.
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(ref e) = result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, &mut vec![(event, response)]),
    }
}

pub struct Engine {
    pub(super) stations: DashMap<Ulid, SharedStationState>,
    /// Held shared while a new station is registered and exclusively while
    /// the WAL is compacted, so no registration slips past a snapshot.
    pub(super) registry: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → station id
    pub(super) booking_to_station: DashMap<Ulid, Ulid>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) owners: Arc<dyn OwnerDirectory>,
    replayed_events: usize,
}

/// Apply an event directly to a StationState (no locking; the caller holds the lock).
///
/// A `BookingModified` that moves a booking between stations is applied to both
/// stations: the previous one releases it, the new one takes it.
fn apply_to_station(state: &mut StationState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    let station_id = state.station.id;
    match event {
        Event::StationUpserted { station } => {
            state.station = station.clone();
        }
        Event::TemplateSet { weekday, windows, .. } => {
            state.template.insert(*weekday, windows.clone());
        }
        Event::TemplateCleared { weekday, .. } => {
            state.template.remove(weekday);
        }
        Event::ExceptionSet { exception } => {
            state.exceptions.insert(exception.date, exception.clone());
        }
        Event::ExceptionRemoved { date, .. } => {
            state.exceptions.remove(date);
        }
        Event::BookingCreated { booking } => {
            booking_index.insert(booking.id, station_id);
            state.insert_booking(booking.clone());
        }
        Event::BookingModified {
            previous_station_id,
            booking,
        } => {
            if *previous_station_id == station_id {
                state.remove_booking(booking.id);
            }
            if booking.station_id == station_id {
                booking_index.insert(booking.id, station_id);
                state.insert_booking(booking.clone());
            }
        }
        Event::BookingStatusChanged {
            id,
            status,
            reason,
            at,
            ..
        } => {
            if let Some(mut booking) = state.remove_booking(*id) {
                booking.status = *status;
                booking.updated_at = *at;
                if *status == BookingStatus::Cancelled {
                    booking.cancel_reason = reason.clone();
                }
                state.insert_booking(booking);
            }
        }
    }
}

/// Stations an event touches; a cross-station move touches two.
fn event_station_ids(event: &Event) -> Vec<Ulid> {
    match event {
        Event::StationUpserted { station } => vec![station.id],
        Event::TemplateSet { station_id, .. }
        | Event::TemplateCleared { station_id, .. }
        | Event::ExceptionRemoved { station_id, .. }
        | Event::BookingStatusChanged { station_id, .. } => vec![*station_id],
        Event::ExceptionSet { exception } => vec![exception.station_id],
        Event::BookingCreated { booking } => vec![booking.station_id],
        Event::BookingModified {
            previous_station_id,
            booking,
        } => {
            if *previous_station_id == booking.station_id {
                vec![booking.station_id]
            } else {
                vec![*previous_station_id, booking.station_id]
            }
        }
    }
}

impl Engine {
    /// Open (or create) the store backed by the WAL at `wal_path`, using the
    /// wall clock and accepting every non-empty owner id.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_collaborators(wal_path, notify, Arc::new(SystemClock), Arc::new(AcceptAllOwners))
    }

    pub fn with_collaborators(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        owners: Arc<dyn OwnerDirectory>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            stations: DashMap::new(),
            registry: RwLock::new(()),
            wal_tx,
            notify,
            booking_to_station: DashMap::new(),
            clock,
            owners,
            replayed_events: events.len(),
        };

        // Replay events. We're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never use blocking_write here because this may run
        // inside an async context.
        for event in &events {
            engine.replay_event(event);
        }

        metrics::gauge!(crate::observability::STATIONS_LOADED).set(engine.stations.len() as f64);
        tracing::debug!(
            "replayed {} events into {} stations, {} bookings",
            events.len(),
            engine.stations.len(),
            engine.booking_to_station.len()
        );
        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        if let Event::StationUpserted { station } = event
            && !self.stations.contains_key(&station.id)
        {
            let state = StationState::new(station.clone());
            self.stations.insert(station.id, Arc::new(RwLock::new(state)));
            return;
        }
        for station_id in event_station_ids(event) {
            let Some(entry) = self.stations.get(&station_id) else {
                tracing::warn!("replay: event for unknown station {station_id} skipped");
                continue;
            };
            let shared = entry.value().clone();
            drop(entry);
            match shared.try_write() {
                Ok(mut guard) => apply_to_station(&mut guard, event, &self.booking_to_station),
                Err(_) => tracing::warn!("replay: station {station_id} unexpectedly locked"),
            }
        }
    }

    /// Number of events read from the WAL when the engine was opened.
    pub fn replayed_events(&self) -> usize {
        self.replayed_events
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn get_station_state(&self, id: &Ulid) -> Option<SharedStationState> {
        self.stations.get(id).map(|e| e.value().clone())
    }

    pub(super) fn station_state(&self, id: &Ulid) -> Result<SharedStationState, EngineError> {
        self.get_station_state(id).ok_or(EngineError::NotFound(*id))
    }

    pub fn station_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_station.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        state: &mut StationState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_station(state, event, &self.booking_to_station);
        self.notify.send(state.station.id, event);
        Ok(())
    }

    /// Same as `persist_and_apply`, for an event that touches two stations.
    /// Both write locks are held by the caller, so the move is all-or-nothing.
    pub(super) async fn persist_and_apply_pair(
        &self,
        first: &mut StationState,
        second: &mut StationState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_station(first, event, &self.booking_to_station);
        apply_to_station(second, event, &self.booking_to_station);
        self.notify.send(first.station.id, event);
        self.notify.send(second.station.id, event);
        Ok(())
    }

    /// Lookup booking → station, get station, acquire write lock.
    ///
    /// A booking can move to another station between the lookup and the lock;
    /// the lookup is repeated until the locked station actually holds it.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<StationState>, EngineError> {
        for _ in 0..MAX_RELOCK_ATTEMPTS {
            let station_id = self
                .station_for_booking(booking_id)
                .ok_or(EngineError::NotFound(*booking_id))?;
            let shared = self.station_state(&station_id)?;
            let guard = shared.write_owned().await;
            if guard.bookings.contains_key(booking_id) {
                return Ok(guard);
            }
        }
        Err(EngineError::NotFound(*booking_id))
    }

    /// Reject owners the owner directory does not know.
    pub async fn verify_owner(&self, owner_id: &str) -> Result<(), EngineError> {
        if owner_id.len() > crate::limits::MAX_OWNER_ID_LEN {
            return Err(EngineError::LimitExceeded("owner id too long"));
        }
        if !self.owners.is_known_owner(owner_id).await {
            return Err(EngineError::Validation(format!("unknown owner: {owner_id}")));
        }
        Ok(())
    }
}

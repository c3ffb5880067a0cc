use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::allocator::check_claim;
use super::error::LifecycleRule;
use super::rules::{check_creation_horizon, check_modifiable, check_modification_cutoff, check_transition};
use super::schedule::{booking_day, validate_note};
use super::{Engine, EngineError, MAX_RELOCK_ATTEMPTS};

/// A request to create a booking on a specific slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub owner_id: String,
    pub station_id: Ulid,
    pub slot: SlotId,
    pub span: Span,
    pub notes: Option<String>,
    /// PENDING, or APPROVED for flows that validated availability up front.
    pub status: BookingStatus,
}

impl NewBooking {
    pub fn pending(owner_id: impl Into<String>, station_id: Ulid, slot: SlotId, span: Span) -> Self {
        Self {
            owner_id: owner_id.into(),
            station_id,
            slot,
            span,
            notes: None,
            status: BookingStatus::Pending,
        }
    }
}

/// Fields to change on an existing booking. `None` keeps the current value;
/// `notes: Some(None)` clears the notes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingChanges {
    pub station_id: Option<Ulid>,
    pub slot: Option<SlotId>,
    pub span: Option<Span>,
    pub notes: Option<Option<String>>,
}

fn validate_span_shape(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Validation(format!(
            "start {} must be before end {}",
            span.start, span.end
        )));
    }
    Ok(())
}

/// Work out the modified booking, checking every rule against the locked
/// state. `to` is the destination station when the booking changes station.
fn plan_modification(
    from: &StationState,
    to: Option<&StationState>,
    id: Ulid,
    changes: &BookingChanges,
    now: Ms,
) -> Result<Booking, EngineError> {
    let current = from.bookings.get(&id).ok_or(EngineError::NotFound(id))?;
    check_modifiable(current.status)?;
    check_modification_cutoff(current.span.start, now)?;

    let target = to.unwrap_or(from);
    let slot = changes.slot.unwrap_or(current.slot);
    let span = changes.span.unwrap_or(current.span);
    let relocates = to.is_some() || slot != current.slot || span != current.span;

    if relocates {
        if span != current.span {
            check_creation_horizon(span.start, now)?;
        }
        let date = booking_day(&target.station, &span)?;
        // Within one station the booking's own claim must not block its new one.
        let exclude = to.is_none().then_some(id);
        check_claim(target, date, &span, &slot, exclude)?;
    }

    let mut updated = current.clone();
    updated.station_id = target.station.id;
    updated.slot = slot;
    updated.span = span;
    if let Some(notes) = &changes.notes {
        updated.notes = notes.clone();
    }
    updated.updated_at = now;
    Ok(updated)
}

fn record_conflict(result: &Result<Booking, EngineError>) {
    if let Err(EngineError::Conflict { slot, booking }) = result {
        metrics::counter!(crate::observability::CLAIM_CONFLICTS_TOTAL).increment(1);
        debug!("claim on {slot} lost to booking {booking}");
    }
}

impl Engine {
    /// Create a booking. The start must lie in `(now, now + 7d]` and the slot
    /// must be free for the whole range at commit time.
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        if !matches!(req.status, BookingStatus::Pending | BookingStatus::Approved) {
            return Err(LifecycleRule::InvalidInitialStatus { status: req.status }.into());
        }
        validate_span_shape(&req.span)?;
        validate_note(req.notes.as_deref(), "notes too long")?;
        self.verify_owner(&req.owner_id).await?;

        let now = self.clock.now_ms();
        check_creation_horizon(req.span.start, now)?;

        let result = self.claim(req, now).await;
        record_conflict(&result);
        result
    }

    /// Commit step of the allocator: re-validate the requested slot under the
    /// station's write lock and record the booking.
    async fn claim(&self, req: NewBooking, now: Ms) -> Result<Booking, EngineError> {
        let shared = self.station_state(&req.station_id)?;
        let mut guard = shared.write().await;
        let date = booking_day(&guard.station, &req.span)?;
        if guard.open_booking_count() >= MAX_BOOKINGS_PER_STATION {
            return Err(EngineError::LimitExceeded("too many bookings on station"));
        }
        check_claim(&guard, date, &req.span, &req.slot, None)?;

        let booking = Booking {
            id: Ulid::new(),
            owner_id: req.owner_id,
            station_id: req.station_id,
            slot: req.slot,
            span: req.span,
            status: req.status,
            created_at: now,
            updated_at: now,
            cancel_reason: None,
            notes: req.notes,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!(
            booking = %booking.id,
            station = %booking.station_id,
            slot = %booking.slot,
            status = %booking.status,
            "booking created"
        );
        Ok(booking)
    }

    /// Change station, slot, time range or notes of an open booking.
    ///
    /// Needs status PENDING or APPROVED and at least 12 hours before the
    /// current start. The new claim and the release of the old one are a single
    /// WAL event applied under the write lock of every station involved, so a
    /// failed modification leaves the original claim untouched.
    pub async fn modify_booking(&self, id: Ulid, changes: BookingChanges) -> Result<Booking, EngineError> {
        if let Some(span) = &changes.span {
            validate_span_shape(span)?;
        }
        if let Some(Some(notes)) = &changes.notes {
            validate_note(Some(notes), "notes too long")?;
        }
        let now = self.clock.now_ms();

        let result = self.apply_modification(id, &changes, now).await;
        record_conflict(&result);
        let booking = result?;

        metrics::counter!(crate::observability::BOOKINGS_MODIFIED_TOTAL).increment(1);
        info!(
            booking = %booking.id,
            station = %booking.station_id,
            slot = %booking.slot,
            "booking modified"
        );
        Ok(booking)
    }

    async fn apply_modification(&self, id: Ulid, changes: &BookingChanges, now: Ms) -> Result<Booking, EngineError> {
        for _ in 0..MAX_RELOCK_ATTEMPTS {
            let from_id = self.station_for_booking(&id).ok_or(EngineError::NotFound(id))?;
            let to_id = changes.station_id.unwrap_or(from_id);
            let from_shared = self.station_state(&from_id)?;

            if to_id == from_id {
                let mut guard = from_shared.write_owned().await;
                if !guard.bookings.contains_key(&id) {
                    continue; // moved while we waited for the lock
                }
                let updated = plan_modification(&guard, None, id, changes, now)?;
                let event = Event::BookingModified {
                    previous_station_id: from_id,
                    booking: updated.clone(),
                };
                self.persist_and_apply(&mut guard, &event).await?;
                return Ok(updated);
            }

            let to_shared = self.station_state(&to_id)?;
            // Lock in station-id order to prevent deadlocks.
            let (mut from_guard, mut to_guard) = if from_id < to_id {
                let f = from_shared.write_owned().await;
                let t = to_shared.write_owned().await;
                (f, t)
            } else {
                let t = to_shared.write_owned().await;
                let f = from_shared.write_owned().await;
                (f, t)
            };
            if !from_guard.bookings.contains_key(&id) {
                continue;
            }
            let updated = plan_modification(&from_guard, Some(&*to_guard), id, changes, now)?;
            if to_guard.open_booking_count() >= MAX_BOOKINGS_PER_STATION {
                return Err(EngineError::LimitExceeded("too many bookings on station"));
            }
            let event = Event::BookingModified {
                previous_station_id: from_id,
                booking: updated.clone(),
            };
            self.persist_and_apply_pair(&mut from_guard, &mut to_guard, &event)
                .await?;
            return Ok(updated);
        }
        Err(EngineError::NotFound(id))
    }

    /// PENDING → APPROVED.
    pub async fn approve(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition(id, BookingStatus::Approved, None).await
    }

    /// APPROVED → COMPLETED. Whether the booking has actually ended is the
    /// caller's concern.
    pub async fn complete(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition(id, BookingStatus::Completed, None).await
    }

    /// PENDING/APPROVED → CANCELLED, at least 12 hours before start. Releases
    /// the slot.
    pub async fn cancel(&self, id: Ulid, reason: &str) -> Result<Booking, EngineError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EngineError::Validation(
                "cancellation requires a reason".into(),
            ));
        }
        validate_note(Some(reason), "cancel reason too long")?;
        self.transition(id, BookingStatus::Cancelled, Some(reason.to_string()))
            .await
    }

    async fn transition(
        &self,
        id: Ulid,
        to: BookingStatus,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        let now = self.clock.now_ms();
        let mut guard = self.resolve_booking_write(&id).await?;
        let current = guard.bookings.get(&id).ok_or(EngineError::NotFound(id))?;
        check_transition(current.status, to)?;
        if to == BookingStatus::Cancelled {
            check_modification_cutoff(current.span.start, now)?;
        }

        let station_id = guard.station.id;
        let event = Event::BookingStatusChanged {
            id,
            station_id,
            status: to,
            reason,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(crate::observability::BOOKING_TRANSITIONS_TOTAL, "status" => to.to_string())
            .increment(1);
        info!(booking = %id, station = %station_id, status = %to, "booking status changed");
        guard.bookings.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }
}

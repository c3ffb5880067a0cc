//! Operator-console facade over the engine: the query and command shapes the
//! console screens call, plus the "retry once on a lost claim" policy.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;
use ulid::Ulid;

use crate::engine::{BookingChanges, Engine, EngineError, NewBooking};
use crate::model::*;

const NO_SLOTS: &str = "no slots available";

fn all_taken(kind: SlotType) -> EngineError {
    EngineError::Closed(format!("every {kind} slot is taken"))
}

/// Who is asking, and which booking they are editing (if any). The edited
/// booking's own claim does not count against availability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerContext {
    pub owner_id: String,
    pub editing: Option<Ulid>,
}

impl OwnerContext {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            editing: None,
        }
    }

    pub fn editing(mut self, booking_id: Ulid) -> Self {
        self.editing = Some(booking_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityReport {
    pub is_available: bool,
    pub available_slot_ids: Vec<SlotId>,
    pub message: String,
}

impl AvailabilityReport {
    fn unavailable() -> Self {
        Self {
            is_available: false,
            available_slot_ids: Vec::new(),
            message: NO_SLOTS.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub owner_id: String,
    pub station_id: Ulid,
    pub slot_type: SlotType,
    /// A specific slot, or `None` to take the lowest free one.
    pub slot: Option<SlotId>,
    pub span: Span,
    pub notes: Option<String>,
    /// Create directly as APPROVED.
    pub approve: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingOutcome {
    pub booking: Booking,
    pub message: String,
}

/// Changes requested from the edit screen. `slot_type` without `slot` picks a
/// free slot of that type; the booking's current slot is kept when it is still
/// free.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModifyRequest {
    pub station_id: Option<Ulid>,
    pub slot_type: Option<SlotType>,
    pub slot: Option<SlotId>,
    pub span: Option<Span>,
    pub notes: Option<Option<String>>,
}

pub struct Console {
    engine: Arc<Engine>,
}

impl Console {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Availability of `kind` slots at a station for a minute-of-day range.
    /// Closed stations and fully booked windows both report "no slots available".
    pub async fn check_availability(
        &self,
        station_id: Ulid,
        date: NaiveDate,
        start_minute: u16,
        end_minute: u16,
        kind: SlotType,
        ctx: &OwnerContext,
    ) -> Result<AvailabilityReport, EngineError> {
        self.engine.verify_owner(&ctx.owner_id).await?;
        if let Some(editing) = ctx.editing {
            self.check_owns(editing, &ctx.owner_id).await?;
        }
        let found = self
            .engine
            .find_available(station_id, date, start_minute, end_minute, kind, ctx.editing)
            .await;
        match found {
            Ok(slots) if slots.is_empty() => Ok(AvailabilityReport::unavailable()),
            Ok(slots) => Ok(AvailabilityReport {
                is_available: true,
                message: format!("{} {kind} slot(s) available", slots.len()),
                available_slot_ids: slots,
            }),
            Err(e) if e.is_unavailable() => {
                debug!(station = %station_id, %date, "availability check: {e}");
                Ok(AvailabilityReport::unavailable())
            }
            Err(e) => Err(e),
        }
    }

    /// Book a slot. With no slot named, the lowest free slot is proposed and
    /// claimed; if another booking takes it first the proposal is re-run once.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<BookingOutcome, EngineError> {
        if let Some(slot) = req.slot
            && slot.kind != req.slot_type
        {
            return Err(EngineError::Validation(format!(
                "slot {slot} is not of type {}",
                req.slot_type
            )));
        }
        let status = if req.approve {
            BookingStatus::Approved
        } else {
            BookingStatus::Pending
        };

        let mut retried = false;
        let booking = loop {
            let slot = match req.slot {
                Some(slot) => slot,
                None => self.first_free(req.station_id, req.span, req.slot_type).await?,
            };
            let attempt = NewBooking {
                owner_id: req.owner_id.clone(),
                station_id: req.station_id,
                slot,
                span: req.span,
                notes: req.notes.clone(),
                status,
            };
            match self.engine.create_booking(attempt).await {
                Err(EngineError::Conflict { .. }) if req.slot.is_none() && !retried => {
                    retried = true;
                    metrics::counter!(crate::observability::CLAIM_RETRIES_TOTAL).increment(1);
                }
                Err(EngineError::Conflict { .. }) if req.slot.is_none() => {
                    return Err(all_taken(req.slot_type));
                }
                other => break other?,
            }
        };

        let message = match booking.status {
            BookingStatus::Approved => format!("booking approved on {}", booking.slot),
            _ => format!("booking requested on {}", booking.slot),
        };
        Ok(BookingOutcome { booking, message })
    }

    /// Edit a booking. Changing time, station or type without naming a slot
    /// picks one: the current slot if it is still free there, otherwise the
    /// lowest free one.
    pub async fn modify_booking(&self, id: Ulid, req: ModifyRequest) -> Result<Booking, EngineError> {
        let current = self.engine.get_booking(id).await?;
        let kind = req
            .slot
            .map(|s| s.kind)
            .or(req.slot_type)
            .unwrap_or(current.slot.kind);
        if let (Some(slot), Some(wanted)) = (req.slot, req.slot_type)
            && slot.kind != wanted
        {
            return Err(EngineError::Validation(format!("slot {slot} is not of type {wanted}")));
        }

        let station_id = req.station_id.unwrap_or(current.station_id);
        let span = req.span.unwrap_or(current.span);
        let same_station = station_id == current.station_id;
        let needs_pick = req.slot.is_none()
            && (!same_station || span != current.span || kind != current.slot.kind);

        let mut retried = false;
        loop {
            let slot = if needs_pick {
                let exclude = same_station.then_some(id);
                let free = self.engine.find_available_at(station_id, span, kind, exclude).await?;
                if same_station && free.contains(&current.slot) {
                    Some(current.slot)
                } else {
                    Some(*free.first().ok_or_else(|| all_taken(kind))?)
                }
            } else {
                req.slot
            };
            let changes = BookingChanges {
                station_id: req.station_id,
                slot,
                span: req.span,
                notes: req.notes.clone(),
            };
            match self.engine.modify_booking(id, changes).await {
                Err(EngineError::Conflict { .. }) if needs_pick && !retried => {
                    retried = true;
                    metrics::counter!(crate::observability::CLAIM_RETRIES_TOTAL).increment(1);
                }
                Err(EngineError::Conflict { .. }) if needs_pick => {
                    return Err(all_taken(kind));
                }
                other => return other,
            }
        }
    }

    pub async fn approve(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.engine.approve(id).await
    }

    pub async fn complete(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.engine.complete(id).await
    }

    pub async fn cancel(&self, id: Ulid, reason: &str) -> Result<Booking, EngineError> {
        self.engine.cancel(id, reason).await
    }

    async fn first_free(&self, station_id: Ulid, span: Span, kind: SlotType) -> Result<SlotId, EngineError> {
        let free = self.engine.find_available_at(station_id, span, kind, None).await?;
        free.first().copied().ok_or_else(|| all_taken(kind))
    }

    async fn check_owns(&self, booking_id: Ulid, owner_id: &str) -> Result<(), EngineError> {
        let booking = self.engine.get_booking(booking_id).await?;
        if booking.owner_id != owner_id {
            return Err(EngineError::Validation(format!(
                "booking {booking_id} belongs to another owner"
            )));
        }
        Ok(())
    }
}

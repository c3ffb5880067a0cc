use ulid::Ulid;

use crate::model::{BookingStatus, Ms, SlotId};

/// The specific lifecycle rule a rejected operation violated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleRule {
    /// `startAt` must be strictly after now.
    StartNotInFuture { start_at: Ms, now: Ms },
    /// `startAt` must be no later than now + 7 days.
    BeyondCreationHorizon { start_at: Ms, latest: Ms },
    /// Modify and cancel need at least 12 hours before `startAt`.
    InsideModificationCutoff { start_at: Ms, now: Ms },
    /// The state machine has no edge `from → to`.
    IllegalTransition { from: BookingStatus, to: BookingStatus },
    /// Only PENDING and APPROVED bookings can be modified.
    NotModifiable { status: BookingStatus },
    /// Bookings can only be created as PENDING or APPROVED.
    InvalidInitialStatus { status: BookingStatus },
}

impl std::fmt::Display for LifecycleRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleRule::StartNotInFuture { start_at, now } => {
                write!(f, "start {start_at} is not after now ({now})")
            }
            LifecycleRule::BeyondCreationHorizon { start_at, latest } => {
                write!(f, "start {start_at} is beyond the 7-day creation horizon (latest {latest})")
            }
            LifecycleRule::InsideModificationCutoff { start_at, now } => {
                let lead_min = (start_at - now) / 60_000;
                write!(
                    f,
                    "start {start_at} is {lead_min} min away; changes require at least 12 hours notice"
                )
            }
            LifecycleRule::IllegalTransition { from, to } => {
                write!(f, "cannot move booking from {from} to {to}")
            }
            LifecycleRule::NotModifiable { status } => {
                write!(f, "booking in status {status} cannot be modified")
            }
            LifecycleRule::InvalidInitialStatus { status } => {
                write!(f, "bookings cannot be created in status {status}")
            }
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    Validation(String),
    NotFound(Ulid),
    /// No effective availability covers the request.
    Closed(String),
    /// The slot was claimed by another booking first.
    Conflict { slot: SlotId, booking: Ulid },
    InvalidTransition(LifecycleRule),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Both mean the caller gets "no slots available".
    pub fn is_unavailable(&self) -> bool {
        matches!(self, EngineError::Closed(_) | EngineError::Conflict { .. })
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Closed(reason) => write!(f, "no slots available: {reason}"),
            EngineError::Conflict { slot, booking } => {
                write!(f, "slot {slot} already claimed by booking {booking}")
            }
            EngineError::InvalidTransition(rule) => write!(f, "invalid transition: {rule}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<LifecycleRule> for EngineError {
    fn from(rule: LifecycleRule) -> Self {
        EngineError::InvalidTransition(rule)
    }
}

//! Temporal guards for the booking lifecycle. Pure functions over explicit
//! instants so they can be checked against any fixed "now".

use crate::model::*;

use super::error::LifecycleRule;

/// Furthest ahead a booking may start at creation time.
pub const CREATION_HORIZON_MS: Ms = 7 * DAY_MS;

/// Minimum lead time before start to modify or cancel.
pub const MODIFICATION_CUTOFF_MS: Ms = 12 * HOUR_MS;

/// `now < start_at <= now + 7d`
pub fn within_creation_horizon(start_at: Ms, now: Ms) -> bool {
    now < start_at && start_at <= now + CREATION_HORIZON_MS
}

/// `start_at - now >= 12h`
pub fn meets_modification_cutoff(start_at: Ms, now: Ms) -> bool {
    start_at - now >= MODIFICATION_CUTOFF_MS
}

pub fn check_creation_horizon(start_at: Ms, now: Ms) -> Result<(), LifecycleRule> {
    if start_at <= now {
        return Err(LifecycleRule::StartNotInFuture { start_at, now });
    }
    if !within_creation_horizon(start_at, now) {
        return Err(LifecycleRule::BeyondCreationHorizon {
            start_at,
            latest: now + CREATION_HORIZON_MS,
        });
    }
    Ok(())
}

pub fn check_modification_cutoff(start_at: Ms, now: Ms) -> Result<(), LifecycleRule> {
    if meets_modification_cutoff(start_at, now) {
        Ok(())
    } else {
        Err(LifecycleRule::InsideModificationCutoff { start_at, now })
    }
}

pub fn check_transition(from: BookingStatus, to: BookingStatus) -> Result<(), LifecycleRule> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(LifecycleRule::IllegalTransition { from, to })
    }
}

pub fn check_modifiable(status: BookingStatus) -> Result<(), LifecycleRule> {
    match status {
        BookingStatus::Pending | BookingStatus::Approved => Ok(()),
        other => Err(LifecycleRule::NotModifiable { status: other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: Ms = 1_792_000_000_000;
    const S: Ms = 1_000;

    #[test]
    fn horizon_boundary() {
        assert!(within_creation_horizon(NOW + CREATION_HORIZON_MS - S, NOW));
        assert!(within_creation_horizon(NOW + CREATION_HORIZON_MS, NOW));
        assert!(!within_creation_horizon(NOW + CREATION_HORIZON_MS + S, NOW));
    }

    #[test]
    fn horizon_rejects_now_and_past() {
        assert!(!within_creation_horizon(NOW, NOW));
        assert!(!within_creation_horizon(NOW - S, NOW));
        assert!(within_creation_horizon(NOW + 1, NOW));
    }

    #[test]
    fn horizon_errors_name_the_rule() {
        assert!(matches!(
            check_creation_horizon(NOW, NOW),
            Err(LifecycleRule::StartNotInFuture { .. })
        ));
        assert!(matches!(
            check_creation_horizon(NOW + 8 * DAY_MS, NOW),
            Err(LifecycleRule::BeyondCreationHorizon { latest, .. }) if latest == NOW + 7 * DAY_MS
        ));
        assert!(check_creation_horizon(NOW + HOUR_MS, NOW).is_ok());
    }

    #[test]
    fn cutoff_boundary() {
        assert!(!meets_modification_cutoff(NOW + 11 * HOUR_MS + 59 * MINUTE_MS, NOW));
        assert!(meets_modification_cutoff(NOW + 12 * HOUR_MS, NOW));
        assert!(meets_modification_cutoff(NOW + 2 * DAY_MS, NOW));
        assert!(!meets_modification_cutoff(NOW - HOUR_MS, NOW));
    }

    #[test]
    fn cutoff_error_carries_instants() {
        let start = NOW + HOUR_MS;
        assert_eq!(
            check_modification_cutoff(start, NOW),
            Err(LifecycleRule::InsideModificationCutoff { start_at: start, now: NOW })
        );
    }

    #[test]
    fn transitions_out_of_terminal_states_fail() {
        use BookingStatus::*;
        assert!(check_transition(Pending, Approved).is_ok());
        assert!(check_transition(Approved, Completed).is_ok());
        assert_eq!(
            check_transition(Completed, Cancelled),
            Err(LifecycleRule::IllegalTransition { from: Completed, to: Cancelled })
        );
        assert!(check_transition(Cancelled, Cancelled).is_err());
        assert!(check_transition(Pending, Completed).is_err());
    }

    #[test]
    fn only_open_bookings_are_modifiable() {
        use BookingStatus::*;
        assert!(check_modifiable(Pending).is_ok());
        assert!(check_modifiable(Approved).is_ok());
        assert!(check_modifiable(Completed).is_err());
        assert!(check_modifiable(Cancelled).is_err());
    }
}

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::schedule::covering_window;
use super::EngineError;

// ── Slot Allocator ────────────────────────────────────────────────

/// Free slots of `kind` for `span` on `date`, lowest ordinal first.
///
/// `Err(Closed)` when no single effective window covers the whole span (or
/// covers it but opens no slot of `kind`); `Ok(vec![])` when the window is open
/// but every matching slot is already claimed. `exclude` ignores one booking's
/// own claim so a booking can be re-timed over itself.
pub fn free_slots(
    state: &StationState,
    date: NaiveDate,
    span: &Span,
    kind: SlotType,
    exclude: Option<Ulid>,
) -> Result<Vec<SlotId>, EngineError> {
    let window = open_window(state, date, span)?;
    let mut offered = window
        .slot_ids
        .iter()
        .filter(|s| s.kind == kind && state.station.has_slot(s))
        .peekable();
    if offered.peek().is_none() {
        return Err(EngineError::Closed(format!(
            "no {kind} slots open between {} and {}",
            fmt_minute(window.start),
            fmt_minute(window.end)
        )));
    }
    let mut free: Vec<SlotId> = offered
        .filter(|s| state.conflicting_claim(s, span, exclude).is_none())
        .copied()
        .collect();
    free.sort();
    free.dedup();
    Ok(free)
}

/// Commit-time re-check for one specific slot. Runs under the station's write
/// lock, so a pass here cannot be invalidated before the claim is applied.
pub fn check_claim(
    state: &StationState,
    date: NaiveDate,
    span: &Span,
    slot: &SlotId,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    if !state.station.has_slot(slot) {
        return Err(EngineError::Validation(format!(
            "slot {slot} does not exist on station {}",
            state.station.id
        )));
    }
    let window = open_window(state, date, span)?;
    if !window.slot_ids.contains(slot) {
        return Err(EngineError::Closed(format!(
            "slot {slot} is not open between {} and {}",
            fmt_minute(window.start),
            fmt_minute(window.end)
        )));
    }
    if let Some(booking) = state.conflicting_claim(slot, span, exclude) {
        return Err(EngineError::Conflict { slot: *slot, booking });
    }
    Ok(())
}

fn open_window<'a>(state: &'a StationState, date: NaiveDate, span: &Span) -> Result<&'a Window, EngineError> {
    if !state.station.is_active() {
        return Err(EngineError::Closed(format!(
            "station {} is deactivated",
            state.station.id
        )));
    }
    covering_window(state, date, span).ok_or_else(|| {
        EngineError::Closed(format!(
            "station {} has no availability covering the requested time on {date}",
            state.station.id
        ))
    })
}

fn fmt_minute(m: u16) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

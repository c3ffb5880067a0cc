use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

// ── Schedule Resolver ─────────────────────────────────────────────

/// Effective availability of a station on a local calendar date.
///
/// An exception for the date replaces the weekly template outright, including
/// an empty exception (closed all day). Without an exception the template entry
/// for the weekday applies; a weekday without an entry is closed. A deactivated
/// station is closed every day.
pub fn resolve(state: &StationState, date: NaiveDate) -> &[Window] {
    if !state.station.is_active() {
        return &[];
    }
    if let Some(exception) = state.exceptions.get(&date) {
        return &exception.windows;
    }
    state
        .template
        .get(&weekday_index(date))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// The one effective window that fully contains `span`, if any.
/// Bookings never straddle a gap between windows.
pub fn covering_window<'a>(state: &'a StationState, date: NaiveDate, span: &Span) -> Option<&'a Window> {
    let day_start = state.station.day_start(date);
    resolve(state, date)
        .iter()
        .find(|w| w.span_on(day_start).contains_span(span))
}

// ── Validation ───────────────────────────────────────────────────

pub(crate) fn validate_station(station: &Station) -> Result<(), EngineError> {
    if station.ac_slots == 0 && station.dc_slots == 0 {
        return Err(EngineError::Validation(
            "station needs at least one AC or DC slot".into(),
        ));
    }
    if station.ac_slots > MAX_SLOTS_PER_TYPE || station.dc_slots > MAX_SLOTS_PER_TYPE {
        return Err(EngineError::LimitExceeded("too many slots of one type"));
    }
    if station.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
        return Err(EngineError::Validation(format!(
            "utc offset {} min out of range",
            station.utc_offset_minutes
        )));
    }
    if let Some(ref n) = station.name
        && n.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("station name too long"));
        }
    Ok(())
}

pub(crate) fn validate_weekday(weekday: u8) -> Result<(), EngineError> {
    if weekday > 6 {
        return Err(EngineError::Validation(format!(
            "weekday {weekday} out of range 0-6"
        )));
    }
    Ok(())
}

/// Check a day's window list against a station and return it normalised:
/// windows ordered by start, slot ids sorted and deduplicated.
pub(crate) fn validate_windows(station: &Station, windows: &[Window]) -> Result<Vec<Window>, EngineError> {
    if windows.len() > MAX_WINDOWS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many windows in one day"));
    }
    let mut normalised = Vec::with_capacity(windows.len());
    for w in windows {
        if w.start >= w.end {
            return Err(EngineError::Validation(format!(
                "window start {} must be before end {}",
                w.start, w.end
            )));
        }
        if w.end > MINUTES_PER_DAY {
            return Err(EngineError::Validation(format!(
                "window end {} is past the end of the day",
                w.end
            )));
        }
        if let Some(unknown) = w.slot_ids.iter().find(|s| !station.has_slot(s)) {
            return Err(EngineError::Validation(format!(
                "slot {unknown} does not exist on station {}",
                station.id
            )));
        }
        let mut slot_ids = w.slot_ids.clone();
        slot_ids.sort();
        slot_ids.dedup();
        normalised.push(Window::new(w.start, w.end, slot_ids));
    }
    normalised.sort_by_key(|w| w.start);
    for pair in normalised.windows(2) {
        if pair[0].end > pair[1].start {
            return Err(EngineError::Validation(format!(
                "windows [{}, {}) and [{}, {}) overlap",
                pair[0].start, pair[0].end, pair[1].start, pair[1].end
            )));
        }
    }
    Ok(normalised)
}

pub(crate) fn validate_note(note: Option<&str>, what: &'static str) -> Result<(), EngineError> {
    if let Some(n) = note
        && n.len() > MAX_NOTE_LEN {
            return Err(EngineError::LimitExceeded(what));
        }
    Ok(())
}

/// Validate a booking range and return the local date it falls on.
/// The range must sit inside one local calendar day; it may end exactly at
/// the following midnight.
pub(crate) fn booking_day(station: &Station, span: &Span) -> Result<NaiveDate, EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Validation(format!(
            "start {} must be before end {}",
            span.start, span.end
        )));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let date = station
        .local_date(span.start)
        .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
    if span.end > station.day_start(date) + DAY_MS {
        return Err(EngineError::Validation(
            "booking must start and end on the same local day".into(),
        ));
    }
    Ok(date)
}

/// Absolute span of a minute-of-day range on `date`.
pub(crate) fn span_on_date(station: &Station, date: NaiveDate, start: u16, end: u16) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::Validation(format!(
            "window start {start} must be before end {end}"
        )));
    }
    if end > MINUTES_PER_DAY {
        return Err(EngineError::Validation(format!(
            "window end {end} is past the end of the day"
        )));
    }
    Ok(Window::new(start, end, Vec::new()).span_on(station.day_start(date)))
}

//! Metric names. The library records through the `metrics` facade and installs
//! no exporter; whoever embeds it picks one.

// ── Booking activity ────────────────────────────────────────────

/// Counter: bookings created.
pub const BOOKINGS_CREATED_TOTAL: &str = "evslot_bookings_created_total";

/// Counter: successful modifications (re-slot, re-time, move, notes).
pub const BOOKINGS_MODIFIED_TOTAL: &str = "evslot_bookings_modified_total";

/// Counter: status transitions. Labels: status.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "evslot_booking_transitions_total";

/// Counter: claims rejected because another booking got the slot first.
pub const CLAIM_CONFLICTS_TOTAL: &str = "evslot_claim_conflicts_total";

/// Counter: console retries after a lost claim.
pub const CLAIM_RETRIES_TOTAL: &str = "evslot_claim_retries_total";

// ── Store ───────────────────────────────────────────────────────

/// Gauge: stations held in memory.
pub const STATIONS_LOADED: &str = "evslot_stations_loaded";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "evslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "evslot_wal_flush_batch_size";

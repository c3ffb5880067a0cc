//! Hard limits applied to caller input before it reaches shared state.

use crate::model::Ms;

pub const MAX_STATIONS: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTE_LEN: usize = 2_048;
pub const MAX_OWNER_ID_LEN: usize = 128;
pub const MAX_SLOTS_PER_TYPE: u16 = 512;
pub const MAX_WINDOWS_PER_DAY: usize = 96;
pub const MAX_EXCEPTIONS_PER_STATION: usize = 4_096;
/// Open (PENDING or APPROVED) bookings per station.
pub const MAX_BOOKINGS_PER_STATION: usize = 500_000;

/// UTC-14:00 .. UTC+14:00 covers every real-world zone.
pub const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

/// 1970-01-01 .. 9999-12-31, the range every calendar helper can represent.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Minutes in a day; a window may end exactly at local midnight.
pub const MINUTES_PER_DAY: u16 = 1440;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Zero-width spans never overlap anything.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Slots ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlotType {
    Ac,
    Dc,
}

impl SlotType {
    pub fn prefix(self) -> &'static str {
        match self {
            SlotType::Ac => "AC",
            SlotType::Dc => "DC",
        }
    }
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// One physical charging point: `AC-1`, `DC-3`, ...
///
/// Ordering is by type, then by ordinal, so a sorted list of same-type slots
/// is in ascending numeric order (`AC-2` before `AC-10`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SlotId {
    pub kind: SlotType,
    pub index: u16,
}

impl SlotId {
    pub fn new(kind: SlotType, index: u16) -> Self {
        Self { kind, index }
    }

    pub fn ac(index: u16) -> Self {
        Self::new(SlotType::Ac, index)
    }

    pub fn dc(index: u16) -> Self {
        Self::new(SlotType::Dc, index)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind.prefix(), self.index)
    }
}

impl FromStr for SlotId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, index) = s
            .split_once('-')
            .ok_or_else(|| format!("malformed slot id: {s}"))?;
        let kind = match prefix {
            "AC" => SlotType::Ac,
            "DC" => SlotType::Dc,
            _ => return Err(format!("unknown slot type in: {s}")),
        };
        let index: u16 = index
            .parse()
            .map_err(|_| format!("malformed slot index in: {s}"))?;
        if index == 0 {
            return Err(format!("slot index starts at 1: {s}"));
        }
        Ok(Self { kind, index })
    }
}

impl From<SlotId> for String {
    fn from(id: SlotId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for SlotId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// ── Stations ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StationStatus {
    Active,
    Deactivated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Station {
    pub id: Ulid,
    pub name: Option<String>,
    pub ac_slots: u16,
    pub dc_slots: u16,
    pub status: StationStatus,
    /// Fixed offset of the station's local time from UTC.
    pub utc_offset_minutes: i32,
}

impl Station {
    pub fn new(id: Ulid, ac_slots: u16, dc_slots: u16) -> Self {
        Self {
            id,
            name: None,
            ac_slots,
            dc_slots,
            status: StationStatus::Active,
            utc_offset_minutes: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == StationStatus::Active
    }

    pub fn slot_count(&self, kind: SlotType) -> u16 {
        match kind {
            SlotType::Ac => self.ac_slots,
            SlotType::Dc => self.dc_slots,
        }
    }

    pub fn has_slot(&self, slot: &SlotId) -> bool {
        slot.index >= 1 && slot.index <= self.slot_count(slot.kind)
    }

    /// All slot ids in canonical order: `AC-1..n`, then `DC-1..m`.
    pub fn slot_ids(&self) -> impl Iterator<Item = SlotId> + '_ {
        (1..=self.ac_slots)
            .map(SlotId::ac)
            .chain((1..=self.dc_slots).map(SlotId::dc))
    }

    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    fn offset_ms(&self) -> Ms {
        self.utc_offset_minutes as Ms * MINUTE_MS
    }

    /// Local calendar date of an instant. `None` if the instant is out of chrono's range.
    pub fn local_date(&self, at: Ms) -> Option<NaiveDate> {
        DateTime::<Utc>::from_timestamp_millis(at).map(|dt| dt.with_timezone(&self.offset()).date_naive())
    }

    /// Instant of local midnight at the start of `date`.
    pub fn day_start(&self, date: NaiveDate) -> Ms {
        date.and_time(NaiveTime::MIN).and_utc().timestamp_millis() - self.offset_ms()
    }
}

/// Weekday index with Sunday = 0.
pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

// ── Schedules ────────────────────────────────────────────────────

/// A bookable window in minute-of-day, with the slots open during it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: u16,
    pub end: u16,
    pub slot_ids: Vec<SlotId>,
}

impl Window {
    pub fn new(start: u16, end: u16, slot_ids: Vec<SlotId>) -> Self {
        Self { start, end, slot_ids }
    }

    /// Number of slots open in this window; zero means unavailable.
    pub fn capacity(&self) -> usize {
        self.slot_ids.len()
    }

    /// The window as an absolute span on the day starting at `day_start`.
    pub fn span_on(&self, day_start: Ms) -> Span {
        Span::new(
            day_start + self.start as Ms * MINUTE_MS,
            day_start + self.end as Ms * MINUTE_MS,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyTemplateEntry {
    pub station_id: Ulid,
    /// 0–6, Sunday = 0.
    pub weekday: u8,
    pub windows: Vec<Window>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleException {
    pub station_id: Ulid,
    pub date: NaiveDate,
    /// Empty means closed all day.
    pub windows: Vec<Window>,
    pub note: Option<String>,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BookingStatus {
    Pending,
    Approved,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    /// Every booking except a cancelled one keeps its slot occupied.
    pub fn holds_claim(self) -> bool {
        self != BookingStatus::Cancelled
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Cancelled) | (Approved, Completed) | (Approved, Cancelled)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Approved => "APPROVED",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub owner_id: String,
    pub station_id: Ulid,
    pub slot: SlotId,
    pub span: Span,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub cancel_reason: Option<String>,
    pub notes: Option<String>,
}

impl Booking {
    pub fn slot_type(&self) -> SlotType {
        self.slot.kind
    }
}

// ── Per-station state ────────────────────────────────────────────

/// A committed claim of one slot by one booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub booking_id: Ulid,
    pub span: Span,
}

/// Claims on a single slot, sorted by `span.start`. Claims on one slot never
/// overlap, so the order by `span.end` is the same.
#[derive(Debug, Clone, Default)]
pub struct SlotLedger {
    claims: Vec<Claim>,
}

impl SlotLedger {
    /// Insert claim maintaining sort order by span.start.
    pub fn insert(&mut self, claim: Claim) {
        let pos = self
            .claims
            .binary_search_by_key(&claim.span.start, |c| c.span.start)
            .unwrap_or_else(|e| e);
        self.claims.insert(pos, claim);
    }

    pub fn remove(&mut self, booking_id: Ulid) -> Option<Claim> {
        let pos = self.claims.iter().position(|c| c.booking_id == booking_id)?;
        Some(self.claims.remove(pos))
    }

    /// Return only claims whose span overlaps the query window.
    /// Both ends are found by binary search, so past claims are never scanned.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Claim> {
        // Before left_bound everything ends at or before query.start.
        let left_bound = self.claims.partition_point(|c| c.span.end <= query.start);
        // From right_bound on everything starts at or after query.end.
        let right_bound = self
            .claims
            .partition_point(|c| c.span.start < query.end)
            .max(left_bound);
        let query = *query;
        self.claims[left_bound..right_bound]
            .iter()
            .filter(move |c| c.span.overlaps(&query))
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct StationState {
    pub station: Station,
    /// Weekday (Sunday = 0) → windows. A missing weekday is closed.
    pub template: BTreeMap<u8, Vec<Window>>,
    pub exceptions: BTreeMap<NaiveDate, ScheduleException>,
    /// Slot → non-cancelled claims on it.
    pub ledger: HashMap<SlotId, SlotLedger>,
    pub bookings: HashMap<Ulid, Booking>,
    open_bookings: usize,
}

impl StationState {
    pub fn new(station: Station) -> Self {
        Self {
            station,
            template: BTreeMap::new(),
            exceptions: BTreeMap::new(),
            ledger: HashMap::new(),
            bookings: HashMap::new(),
            open_bookings: 0,
        }
    }

    /// Claims on `slot` overlapping `span`, optionally ignoring one booking.
    pub fn conflicting_claim(&self, slot: &SlotId, span: &Span, ignore: Option<Ulid>) -> Option<Ulid> {
        self.ledger.get(slot).and_then(|ledger| {
            ledger
                .overlapping(span)
                .find(|c| Some(c.booking_id) != ignore)
                .map(|c| c.booking_id)
        })
    }

    /// Store a booking, claiming its slot if its status holds one.
    pub fn insert_booking(&mut self, booking: Booking) {
        if booking.status.holds_claim() {
            self.ledger.entry(booking.slot).or_default().insert(Claim {
                booking_id: booking.id,
                span: booking.span,
            });
        }
        if !booking.status.is_terminal() {
            self.open_bookings += 1;
        }
        if let Some(previous) = self.bookings.insert(booking.id, booking)
            && !previous.status.is_terminal()
        {
            self.open_bookings -= 1;
        }
    }

    /// Remove a booking and release any claim it holds.
    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let booking = self.bookings.remove(&id)?;
        if !booking.status.is_terminal() {
            self.open_bookings -= 1;
        }
        self.release_claim(&booking);
        Some(booking)
    }

    pub fn release_claim(&mut self, booking: &Booking) {
        if let Some(ledger) = self.ledger.get_mut(&booking.slot) {
            ledger.remove(booking.id);
        }
    }

    /// PENDING and APPROVED bookings; the per-station limit counts only these.
    pub fn open_booking_count(&self) -> usize {
        self.open_bookings
    }

    /// Number of bookings currently holding a claim.
    pub fn active_booking_count(&self) -> usize {
        self.bookings.values().filter(|b| b.status.holds_claim()).count()
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    StationUpserted {
        station: Station,
    },
    TemplateSet {
        station_id: Ulid,
        weekday: u8,
        windows: Vec<Window>,
    },
    TemplateCleared {
        station_id: Ulid,
        weekday: u8,
    },
    ExceptionSet {
        exception: ScheduleException,
    },
    ExceptionRemoved {
        station_id: Ulid,
        date: NaiveDate,
    },
    BookingCreated {
        booking: Booking,
    },
    /// Replaces a booking record. Releasing the old claim and taking the new
    /// one happen in the same event.
    BookingModified {
        previous_station_id: Ulid,
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        station_id: Ulid,
        status: BookingStatus,
        reason: Option<String>,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationSummary {
    pub id: Ulid,
    pub name: Option<String>,
    pub ac_slots: u16,
    pub dc_slots: u16,
    pub status: StationStatus,
    pub template_days: usize,
    pub exceptions: usize,
    pub active_bookings: usize,
}

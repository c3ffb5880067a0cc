//! End-to-end flows through the console facade: availability checks, booking
//! with automatic slot choice, edits, and the change feed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use chrono::NaiveDate;
use ulid::Ulid;

use evslot::clock::{Clock, ManualClock};
use evslot::console::{BookingRequest, Console, ModifyRequest, OwnerContext};
use evslot::directory::{AcceptAllOwners, OwnerDirectory};
use evslot::engine::{Engine, EngineError, NewBooking};
use evslot::model::*;
use evslot::notify::NotifyHub;

const H: Ms = HOUR_MS;

fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
}

fn at(h: Ms) -> Ms {
    monday().and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis() + h * H
}

fn wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("evslot_test_flow");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

struct Setup {
    console: Console,
    notify: Arc<NotifyHub>,
    clock: Arc<ManualClock>,
    station: Station,
}

/// AC=2, DC=1, open Monday 09:00–17:00 on every slot; now is Sunday noon.
async fn setup(name: &str) -> Setup {
    setup_with(name, |clock| clock as Arc<dyn Clock>, Arc::new(AcceptAllOwners)).await
}

async fn setup_with(
    name: &str,
    engine_clock: impl FnOnce(Arc<ManualClock>) -> Arc<dyn Clock>,
    owners: Arc<dyn OwnerDirectory>,
) -> Setup {
    let notify = Arc::new(NotifyHub::new());
    let clock = Arc::new(ManualClock::new(at(-12)));
    let engine = Engine::with_collaborators(wal_path(name), notify.clone(), engine_clock(clock.clone()), owners).unwrap();
    let mut station = Station::new(Ulid::new(), 2, 1);
    station.name = Some("Harbour Road".into());
    engine.upsert_station(station.clone()).await.unwrap();
    engine
        .set_template(WeeklyTemplateEntry {
            station_id: station.id,
            weekday: 1,
            windows: vec![Window::new(9 * 60, 17 * 60, station.slot_ids().collect())],
        })
        .await
        .unwrap();
    Setup {
        console: Console::new(Arc::new(engine)),
        notify,
        clock,
        station,
    }
}

fn request(s: &Setup, owner: &str, kind: SlotType, start: Ms, end: Ms) -> BookingRequest {
    BookingRequest {
        owner_id: owner.into(),
        station_id: s.station.id,
        slot_type: kind,
        slot: None,
        span: Span::new(start, end),
        notes: None,
        approve: false,
    }
}

#[tokio::test]
async fn check_then_book_lowest_free_slot() {
    let s = setup("check_then_book.wal").await;
    let ctx = OwnerContext::new("owner-1");

    let report = s
        .console
        .check_availability(s.station.id, monday(), 10 * 60, 11 * 60, SlotType::Ac, &ctx)
        .await
        .unwrap();
    assert!(report.is_available);
    assert_eq!(report.available_slot_ids, vec![SlotId::ac(1), SlotId::ac(2)]);

    let first = s.console.create_booking(request(&s, "owner-1", SlotType::Ac, at(10), at(11))).await.unwrap();
    assert_eq!(first.booking.slot, SlotId::ac(1));
    assert_eq!(first.booking.status, BookingStatus::Pending);

    let second = s.console.create_booking(request(&s, "owner-2", SlotType::Ac, at(10), at(11))).await.unwrap();
    assert_eq!(second.booking.slot, SlotId::ac(2));

    let third = s.console.create_booking(request(&s, "owner-3", SlotType::Ac, at(10), at(11))).await;
    assert!(matches!(third, Err(EngineError::Closed(_))));

    let report = s
        .console
        .check_availability(s.station.id, monday(), 10 * 60, 11 * 60, SlotType::Ac, &ctx)
        .await
        .unwrap();
    assert!(!report.is_available);
    assert_eq!(report.message, "no slots available");
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["isAvailable"], false);
    assert_eq!(json["availableSlotIds"], serde_json::json!([]));
}

#[tokio::test]
async fn closed_day_reports_unavailable() {
    let s = setup("closed_day.wal").await;
    s.console
        .engine()
        .set_exception(ScheduleException {
            station_id: s.station.id,
            date: monday(),
            windows: vec![],
            note: Some("public holiday".into()),
        })
        .await
        .unwrap();

    let report = s
        .console
        .check_availability(s.station.id, monday(), 10 * 60, 11 * 60, SlotType::Dc, &OwnerContext::new("owner-1"))
        .await
        .unwrap();
    assert!(!report.is_available);
    assert!(report.available_slot_ids.is_empty());
}

#[tokio::test]
async fn editing_context_ignores_own_claim() {
    let s = setup("editing_context.wal").await;
    let out = s.console.create_booking(request(&s, "owner-1", SlotType::Dc, at(10), at(11))).await.unwrap();
    let id = out.booking.id;

    let plain = s
        .console
        .check_availability(s.station.id, monday(), 10 * 60 + 30, 11 * 60 + 30, SlotType::Dc, &OwnerContext::new("owner-1"))
        .await
        .unwrap();
    assert!(!plain.is_available);

    let editing = OwnerContext::new("owner-1").editing(id);
    let report = s
        .console
        .check_availability(s.station.id, monday(), 10 * 60 + 30, 11 * 60 + 30, SlotType::Dc, &editing)
        .await
        .unwrap();
    assert_eq!(report.available_slot_ids, vec![SlotId::dc(1)]);

    let someone_else = OwnerContext::new("owner-2").editing(id);
    let denied = s
        .console
        .check_availability(s.station.id, monday(), 10 * 60, 11 * 60, SlotType::Dc, &someone_else)
        .await;
    assert!(matches!(denied, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn explicit_slot_must_match_type_and_be_free() {
    let s = setup("explicit_slot.wal").await;
    let mut req = request(&s, "owner-1", SlotType::Dc, at(10), at(11));
    req.slot = Some(SlotId::ac(2));
    assert!(matches!(s.console.create_booking(req).await, Err(EngineError::Validation(_))));

    let mut req = request(&s, "owner-1", SlotType::Ac, at(10), at(11));
    req.slot = Some(SlotId::ac(2));
    req.approve = true;
    let out = s.console.create_booking(req.clone()).await.unwrap();
    assert_eq!(out.booking.slot, SlotId::ac(2));
    assert_eq!(out.booking.status, BookingStatus::Approved);
    assert!(out.message.contains("AC-2"));

    // A named slot that is taken is reported as a conflict, not substituted.
    assert!(matches!(
        s.console.create_booking(req).await,
        Err(EngineError::Conflict { .. })
    ));
}

#[tokio::test]
async fn modify_keeps_current_slot_when_still_free() {
    let s = setup("modify_keep_slot.wal").await;
    let a = s.console.create_booking(request(&s, "owner-1", SlotType::Ac, at(10), at(11))).await.unwrap().booking;
    let b = s.console.create_booking(request(&s, "owner-2", SlotType::Ac, at(10), at(11))).await.unwrap().booking;
    assert_eq!(b.slot, SlotId::ac(2));

    let moved = s
        .console
        .modify_booking(
            b.id,
            ModifyRequest {
                span: Some(Span::new(at(13), at(14))),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(moved.slot, SlotId::ac(2));

    // Switching type picks the lowest free slot of the new type.
    let switched = s
        .console
        .modify_booking(
            a.id,
            ModifyRequest {
                slot_type: Some(SlotType::Dc),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(switched.slot, SlotId::dc(1));
    assert_eq!(switched.span, a.span);

    // Nothing of that type left at that time.
    let blocked = s
        .console
        .modify_booking(
            b.id,
            ModifyRequest {
                slot_type: Some(SlotType::Dc),
                span: Some(Span::new(at(10), at(11))),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(blocked, Err(EngineError::Closed(_))));
    assert_eq!(s.console.engine().get_booking(b.id).await.unwrap(), moved);
}

#[tokio::test]
async fn lifecycle_through_console_with_change_feed() {
    let s = setup("console_lifecycle.wal").await;
    let mut feed = s.notify.subscribe(s.station.id);

    let booking = s.console.create_booking(request(&s, "owner-1", SlotType::Ac, at(15), at(16))).await.unwrap().booking;
    let approved = s.console.approve(booking.id).await.unwrap();
    assert_eq!(approved.status, BookingStatus::Approved);

    s.clock.set(at(15) - 11 * H);
    assert!(matches!(
        s.console.cancel(booking.id, "running late").await,
        Err(EngineError::InvalidTransition(_))
    ));

    s.clock.set(at(17));
    let completed = s.console.complete(booking.id).await.unwrap();
    assert_eq!(completed.status, BookingStatus::Completed);

    let mut statuses = Vec::new();
    while let Ok(event) = feed.try_recv() {
        match event {
            Event::BookingCreated { booking } => statuses.push(booking.status),
            Event::BookingStatusChanged { status, .. } => statuses.push(status),
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(
        statuses,
        vec![BookingStatus::Pending, BookingStatus::Approved, BookingStatus::Completed]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_console_bookings_fill_every_slot_once() {
    let s = Arc::new(setup("console_concurrent.wal").await);

    let mut handles = Vec::new();
    for i in 0..6 {
        let s = s.clone();
        handles.push(tokio::spawn(async move {
            let req = request(&s, &format!("owner-{i}"), SlotType::Ac, at(12), at(13));
            s.console.create_booking(req).await
        }));
    }

    let mut slots = Vec::new();
    let mut unavailable = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(out) => slots.push(out.booking.slot),
            Err(e) if e.is_unavailable() => unavailable += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    slots.sort();
    assert_eq!(slots, vec![SlotId::ac(1), SlotId::ac(2)]);
    assert_eq!(unavailable, 4);
}

// ── Losing a proposed slot between proposal and claim ───

const RIVAL: &str = "rival";

/// Books the lowest free slot of a target range for another owner, from
/// inside the engine call that is about to claim the console's proposal.
#[derive(Default)]
struct Rival {
    engine: OnceLock<Weak<Engine>>,
    target: OnceLock<(Ulid, Span, SlotType)>,
    steals: AtomicUsize,
    busy: AtomicBool,
}

impl Rival {
    fn arm(&self, s: &Setup, span: Span, kind: SlotType, steals: usize) {
        let _ = self.engine.set(Arc::downgrade(s.console.engine()));
        let _ = self.target.set((s.station.id, span, kind));
        self.steals.store(steals, Ordering::SeqCst);
    }

    fn armed(&self) -> bool {
        self.steals.load(Ordering::SeqCst) > 0 && !self.busy.load(Ordering::SeqCst)
    }

    async fn steal(&self) {
        if self.busy.swap(true, Ordering::SeqCst) {
            return;
        }
        let take = self.steals.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok();
        let engine = self.engine.get().and_then(Weak::upgrade);
        if let (true, Some(engine), Some(&(station, span, kind))) = (take, engine, self.target.get()) {
            let free = engine.find_available_at(station, span, kind, None).await.unwrap();
            engine
                .create_booking(NewBooking::pending(RIVAL, station, free[0], span))
                .await
                .unwrap();
        }
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Steals while the engine checks the booking owner.
struct RivalDirectory(Arc<Rival>);

#[async_trait]
impl OwnerDirectory for RivalDirectory {
    async fn is_known_owner(&self, owner_id: &str) -> bool {
        if owner_id != RIVAL {
            self.0.steal().await;
        }
        true
    }
}

/// Steals when the engine reads the time, which modify does before locking.
struct RivalClock {
    rival: Arc<Rival>,
    inner: Arc<ManualClock>,
}

impl Clock for RivalClock {
    fn now_ms(&self) -> Ms {
        if self.rival.armed() {
            tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(self.rival.steal()));
        }
        self.inner.now_ms()
    }
}

fn rival_owners(name: &'static str) -> (Arc<Rival>, impl Future<Output = Setup>) {
    let rival = Arc::new(Rival::default());
    let setup = setup_with(name, |clock| clock as Arc<dyn Clock>, Arc::new(RivalDirectory(rival.clone())));
    (rival, setup)
}

fn rival_clock(name: &'static str) -> (Arc<Rival>, impl Future<Output = Setup>) {
    let rival = Arc::new(Rival::default());
    let for_clock = rival.clone();
    let setup = setup_with(
        name,
        move |inner| Arc::new(RivalClock { rival: for_clock, inner }) as Arc<dyn Clock>,
        Arc::new(AcceptAllOwners),
    );
    (rival, setup)
}

fn rival_slots(bookings: &[Booking]) -> Vec<SlotId> {
    bookings.iter().filter(|b| b.owner_id == RIVAL).map(|b| b.slot).collect()
}

#[tokio::test]
async fn create_retries_once_after_losing_proposed_slot() {
    let (rival, setup) = rival_owners("create_retry_once.wal");
    let s = setup.await;
    let span = Span::new(at(10), at(11));
    rival.arm(&s, span, SlotType::Ac, 1);

    let out = s.console.create_booking(request(&s, "owner-1", SlotType::Ac, at(10), at(11))).await.unwrap();
    assert_eq!(out.booking.slot, SlotId::ac(2));
    let bookings = s.console.engine().list_bookings(s.station.id).await.unwrap();
    assert_eq!(rival_slots(&bookings), vec![SlotId::ac(1)]);
}

#[tokio::test]
async fn create_reports_no_slots_after_second_loss() {
    let (rival, setup) = rival_owners("create_retry_exhausted.wal");
    let s = setup.await;
    rival.arm(&s, Span::new(at(10), at(11)), SlotType::Ac, 2);

    let err = s
        .console
        .create_booking(request(&s, "owner-1", SlotType::Ac, at(10), at(11)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Closed(_)), "got {err:?}");
    assert!(err.to_string().starts_with("no slots available"));
    let bookings = s.console.engine().list_bookings(s.station.id).await.unwrap();
    assert_eq!(rival_slots(&bookings), vec![SlotId::ac(1), SlotId::ac(2)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn modify_retries_once_after_losing_proposed_slot() {
    let (rival, setup) = rival_clock("modify_retry_once.wal");
    let s = setup.await;
    let booking = s.console.create_booking(request(&s, "owner-1", SlotType::Ac, at(10), at(11))).await.unwrap().booking;
    assert_eq!(booking.slot, SlotId::ac(1));

    let later = Span::new(at(13), at(14));
    rival.arm(&s, later, SlotType::Ac, 1);
    let moved = s
        .console
        .modify_booking(booking.id, ModifyRequest { span: Some(later), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(moved.slot, SlotId::ac(2));
    assert_eq!(moved.span, later);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn modify_reports_no_slots_after_second_loss() {
    let (rival, setup) = rival_clock("modify_retry_exhausted.wal");
    let s = setup.await;
    let booking = s.console.create_booking(request(&s, "owner-1", SlotType::Ac, at(10), at(11))).await.unwrap().booking;

    let later = Span::new(at(13), at(14));
    rival.arm(&s, later, SlotType::Ac, 2);
    let err = s
        .console
        .modify_booking(booking.id, ModifyRequest { span: Some(later), ..Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Closed(_)), "got {err:?}");
    // The original claim is untouched.
    assert_eq!(s.console.engine().get_booking(booking.id).await.unwrap(), booking);
}

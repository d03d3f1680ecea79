use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime, Weekday};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

use super::*;
use crate::calendar::FixedClock;
use crate::notify::NotifyHub;
use crate::outbox::{Notice, NoticeKind, Outbox};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("larder_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// March 2026: the 2nd is a Monday.
fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn open_engine(path: PathBuf, today: NaiveDate) -> (Engine, mpsc::Receiver<Notice>) {
    let (outbox, rx) = Outbox::channel(1024);
    let engine = Engine::new(path, Arc::new(NotifyHub::new()), outbox, Arc::new(FixedClock(today))).unwrap();
    (engine, rx)
}

/// Fresh engine whose "today" is Monday 2026-03-02.
fn engine(name: &str) -> (Engine, mpsc::Receiver<Notice>) {
    open_engine(test_wal_path(name), day(2))
}

async fn role(engine: &Engine, name: &str, audience: RequesterKind, weekends: bool) -> Ulid {
    let id = Ulid::new();
    engine
        .create_role(Role {
            id,
            name: name.into(),
            audience,
            weekends,
        })
        .await
        .unwrap();
    id
}

async fn slot_on(
    engine: &Engine,
    role_id: Ulid,
    start: NaiveTime,
    end: NaiveTime,
    capacity: u32,
    weekday: Option<Weekday>,
) -> Ulid {
    let id = Ulid::new();
    engine
        .create_slot(Slot {
            id,
            role_id,
            window: TimeWindow::new(start, end),
            max_capacity: capacity,
            is_active: true,
            weekday,
        })
        .await
        .unwrap();
    id
}

async fn slot(engine: &Engine, role_id: Ulid, start: NaiveTime, end: NaiveTime, capacity: u32) -> Ulid {
    slot_on(engine, role_id, start, end, capacity, None).await
}

fn request(requester: Requester, slot_id: Ulid, date: &str) -> BookingRequest {
    BookingRequest {
        id: Ulid::new(),
        requester,
        slot_id,
        date: date.into(),
        note: None,
        origin: Origin::SelfService,
    }
}

fn staff_request(requester: Requester, slot_id: Ulid, date: &str, force: bool, allow_past: bool) -> BookingRequest {
    BookingRequest {
        origin: Origin::Staff { force, allow_past },
        ..request(requester, slot_id, date)
    }
}

fn drain(rx: &mut mpsc::Receiver<Notice>) -> Vec<Notice> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

// ── Admission ────────────────────────────────────────────

#[tokio::test]
async fn self_service_client_is_pending_and_volunteer_is_approved() {
    let (engine, _rx) = engine("initial_status.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let sorting = role(&engine, "Sorting", RequesterKind::Volunteer, false).await;
    let pantry_am = slot(&engine, pantry, t(9, 0), t(11, 0), 4).await;
    let sorting_pm = slot(&engine, sorting, t(13, 0), t(16, 0), 4).await;

    let client = Requester::client(Ulid::new());
    let booking = engine.book(request(client, pantry_am, "2026-03-03")).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Pending);
    assert_eq!(booking.created_on, day(2));
    assert_eq!(booking.reschedule_token.len(), crate::limits::RESCHEDULE_TOKEN_LEN);

    let volunteer = Requester::volunteer(Ulid::new());
    engine.grant_training(volunteer.id, sorting).await.unwrap();
    let shift = engine.book(request(volunteer, sorting_pm, "2026-03-03")).await.unwrap();
    assert_eq!(shift.status, BookingStatus::Approved);

    assert_eq!(engine.get_booking(booking.id).await, Some(booking));
}

#[tokio::test]
async fn malformed_date_is_invalid_date() {
    let (engine, _rx) = engine("invalid_date.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let am = slot(&engine, pantry, t(9, 0), t(11, 0), 4).await;

    for raw in ["2026-02-30", "03/03/2026", ""] {
        let err = engine
            .book(request(Requester::client(Ulid::new()), am, raw))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDate, "{raw:?}");
    }
}

#[tokio::test]
async fn past_date_needs_staff_override() {
    let (engine, _rx) = engine("past_date.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let am = slot(&engine, pantry, t(9, 0), t(11, 0), 4).await;
    let friday = NaiveDate::from_ymd_opt(2026, 2, 27).unwrap();

    let client = Requester::client(Ulid::new());
    let err = assert_err!(engine.book(request(client, am, "2026-02-27")).await);
    assert_eq!(err, EngineError::PastDate(friday));

    let err = assert_err!(engine.book(staff_request(client, am, "2026-02-27", false, false)).await);
    assert_eq!(err.kind(), ErrorKind::PastDate);

    let booking = assert_ok!(engine.book(staff_request(client, am, "2026-02-27", false, true)).await);
    assert_eq!(booking.date, friday);
    assert_eq!(booking.status, BookingStatus::Approved);

    // Today is not in the past.
    assert_ok!(engine.book(request(Requester::client(Ulid::new()), am, "2026-03-02")).await);
}

#[tokio::test]
async fn volunteers_need_training_and_audience_must_match() {
    let (engine, _rx) = engine("eligibility.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let sorting = role(&engine, "Sorting", RequesterKind::Volunteer, false).await;
    let pantry_am = slot(&engine, pantry, t(9, 0), t(11, 0), 4).await;
    let sorting_am = slot(&engine, sorting, t(9, 0), t(12, 0), 4).await;

    let volunteer = Requester::volunteer(Ulid::new());
    let err = assert_err!(engine.book(request(volunteer, sorting_am, "2026-03-03")).await);
    assert_eq!(err.kind(), ErrorKind::NotTrained);
    assert_eq!(err.to_string(), format!("{volunteer} is not eligible for role Sorting"));

    engine.grant_training(volunteer.id, sorting).await.unwrap();
    assert_ok!(engine.book(request(volunteer, sorting_am, "2026-03-03")).await);

    let err = assert_err!(engine.book(request(volunteer, pantry_am, "2026-03-04")).await);
    assert_eq!(err.kind(), ErrorKind::NotTrained);

    let client = Requester::client(Ulid::new());
    let err = assert_err!(engine.book(request(client, sorting_am, "2026-03-04")).await);
    assert_eq!(err.kind(), ErrorKind::NotTrained);

    // Training only applies to volunteer roles.
    let err = assert_err!(engine.grant_training(volunteer.id, pantry).await);
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn holidays_and_weekends_close_the_day() {
    let (engine, _rx) = engine("closed_day.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let market = role(&engine, "Saturday Market", RequesterKind::Client, true).await;
    let am = slot(&engine, pantry, t(9, 0), t(11, 0), 4).await;
    let market_am = slot(&engine, market, t(9, 0), t(11, 0), 4).await;
    engine.add_holiday("2026-03-03", Some("Staff training".into())).await.unwrap();

    let client = Requester::client(Ulid::new());
    for date in ["2026-03-03", "2026-03-07", "2026-03-08"] {
        let err = assert_err!(engine.book(request(client, am, date)).await);
        assert_eq!(err.kind(), ErrorKind::ClosedDay);
        assert_eq!(err.to_string(), "Role not bookable on holidays or weekends");
    }

    // Weekend-enabled roles still close on holidays.
    assert_ok!(engine.book(request(client, market_am, "2026-03-07")).await);
    let err = assert_err!(engine.book(request(Requester::client(Ulid::new()), market_am, "2026-03-03")).await);
    assert_eq!(err.kind(), ErrorKind::ClosedDay);

    engine.remove_holiday("2026-03-03").await.unwrap();
    assert_ok!(engine.book(request(client, am, "2026-03-03")).await);
}

#[tokio::test]
async fn weekday_restricted_slot() {
    let (engine, _rx) = engine("weekday_slot.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let evening = slot_on(&engine, pantry, t(17, 0), t(19, 0), 10, Some(Weekday::Wed)).await;

    let client = Requester::client(Ulid::new());
    let err = assert_err!(engine.book(request(client, evening, "2026-03-03")).await);
    assert_eq!(err, EngineError::ClosedDay(Closure::WrongWeekday(Weekday::Wed)));
    assert_eq!(err.to_string(), "Slot only bookable on Wednesday");

    assert_ok!(engine.book(request(client, evening, "2026-03-04")).await);
}

#[tokio::test]
async fn duplicate_is_rejected_without_writing() {
    let (engine, mut rx) = engine("duplicate.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let am = slot(&engine, pantry, t(9, 0), t(11, 0), 4).await;
    let client = Requester::client(Ulid::new());

    let first = engine.book(request(client, am, "2026-03-03")).await.unwrap();
    drain(&mut rx);
    for _ in 0..3 {
        let err = assert_err!(engine.book(request(client, am, "2026-03-03")).await);
        assert_eq!(err, EngineError::Duplicate(first.id));
    }
    assert_eq!(engine.counted_reservations(am, day(3)).await.unwrap(), 1);
    assert!(drain(&mut rx).is_empty());

    // Once cancelled the seat can be taken again.
    engine.cancel_booking(first.id).await.unwrap();
    assert_ok!(engine.book(request(client, am, "2026-03-03")).await);
}

#[tokio::test]
async fn reusing_a_booking_id_is_already_exists() {
    let (engine, _rx) = engine("reused_id.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let am = slot(&engine, pantry, t(9, 0), t(11, 0), 4).await;

    let req = request(Requester::client(Ulid::new()), am, "2026-03-03");
    engine.book(req.clone()).await.unwrap();
    let again = BookingRequest {
        requester: Requester::client(Ulid::new()),
        ..req
    };
    let err = assert_err!(engine.book(again).await);
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}

#[tokio::test]
async fn overlap_conflict_is_symmetric() {
    let (engine, _rx) = engine("overlap.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let produce = role(&engine, "Produce", RequesterKind::Client, false).await;
    let pantry_am = slot(&engine, pantry, t(9, 0), t(11, 0), 4).await;
    let produce_am = slot(&engine, produce, t(10, 0), t(12, 0), 4).await;

    let a = Requester::client(Ulid::new());
    let first = engine.book(request(a, pantry_am, "2026-03-03")).await.unwrap();
    let err = assert_err!(engine.book(request(a, produce_am, "2026-03-03")).await);
    let EngineError::Conflict(detail) = &err else {
        panic!("expected conflict, got {err:?}");
    };
    assert_eq!(detail.existing.booking_id, Some(first.id));
    assert_eq!(detail.existing.role_name, "Pantry");
    assert_eq!(detail.attempted.booking_id, None);
    assert_eq!(detail.attempted.slot_id, produce_am);
    assert_eq!(err.to_string(), "overlaps existing booking: Pantry 09:00-11:00 on 2026-03-03");

    let b = Requester::client(Ulid::new());
    engine.book(request(b, produce_am, "2026-03-03")).await.unwrap();
    let err = assert_err!(engine.book(request(b, pantry_am, "2026-03-03")).await);
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // Different day, no overlap.
    assert_ok!(engine.book(request(a, produce_am, "2026-03-04")).await);
}

#[tokio::test]
async fn full_slot_rejects_and_force_grows_capacity() {
    let (engine, _rx) = engine("full_force.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let am = slot(&engine, pantry, t(9, 0), t(11, 0), 1).await;

    engine.book(request(Requester::client(Ulid::new()), am, "2026-03-03")).await.unwrap();
    let err = assert_err!(engine.book(request(Requester::client(Ulid::new()), am, "2026-03-03")).await);
    assert_eq!(err, EngineError::Full { slot_id: am, capacity: 1 });

    let forced = engine
        .book(staff_request(Requester::client(Ulid::new()), am, "2026-03-03", true, false))
        .await
        .unwrap();
    assert_eq!(forced.status, BookingStatus::Approved);
    assert_eq!(engine.counted_reservations(am, day(3)).await.unwrap(), 2);

    let state = engine.get_slot_state(&am).unwrap();
    assert_eq!(state.read().await.slot.max_capacity, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_on_single_seat() {
    let (engine, _rx) = engine("concurrent_one.wal");
    let engine = Arc::new(engine);
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let am = slot(&engine, pantry, t(9, 0), t(11, 0), 1).await;

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .book(request(Requester::client(Ulid::new()), am, "2026-03-03"))
                    .await
            })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::Full),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(engine.counted_reservations(am, day(3)).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_never_exceed_capacity() {
    let (engine, _rx) = engine("concurrent_many.wal");
    let engine = Arc::new(engine);
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let am = slot(&engine, pantry, t(9, 0), t(11, 0), 3).await;

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .book(request(Requester::client(Ulid::new()), am, "2026-03-03"))
                    .await
            })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 3);
    assert_eq!(engine.counted_reservations(am, day(3)).await.unwrap(), 3);
}

// ── Catalog ──────────────────────────────────────────────

#[tokio::test]
async fn same_role_slots_may_not_overlap() {
    let (engine, _rx) = engine("slot_overlap.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let am = slot(&engine, pantry, t(9, 0), t(11, 0), 4).await;

    let clash = Slot {
        id: Ulid::new(),
        role_id: pantry,
        window: TimeWindow::new(t(10, 0), t(12, 0)),
        max_capacity: 4,
        is_active: true,
        weekday: None,
    };
    let err = assert_err!(engine.create_slot(clash.clone()).await);
    assert_eq!(err, EngineError::SlotOverlap(am));
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    // Touching windows are fine.
    slot(&engine, pantry, t(11, 0), t(13, 0), 4).await;

    let wednesday = slot_on(&engine, pantry, t(17, 0), t(19, 0), 4, Some(Weekday::Wed)).await;
    let thursday = Slot {
        id: Ulid::new(),
        window: TimeWindow::new(t(18, 0), t(20, 0)),
        weekday: Some(Weekday::Thu),
        ..clash.clone()
    };
    assert_eq!(assert_err!(engine.create_slot(thursday).await), EngineError::SlotOverlap(wednesday));

    let unknown_role = Slot {
        role_id: Ulid::new(),
        ..clash
    };
    assert_eq!(assert_err!(engine.create_slot(unknown_role).await).kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn editing_capacity_below_count_keeps_bookings() {
    let (engine, _rx) = engine("edit_slot.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let am = slot(&engine, pantry, t(9, 0), t(11, 0), 3).await;
    for _ in 0..3 {
        engine.book(request(Requester::client(Ulid::new()), am, "2026-03-03")).await.unwrap();
    }

    let edited = engine
        .edit_slot(SlotEdit {
            slot_id: am,
            max_capacity: Some(1),
            ..SlotEdit::default()
        })
        .await
        .unwrap();
    assert_eq!(edited.max_capacity, 1);
    assert_eq!(edited.window, TimeWindow::new(t(9, 0), t(11, 0)));
    assert_eq!(engine.counted_reservations(am, day(3)).await.unwrap(), 3);

    let err = assert_err!(engine.book(request(Requester::client(Ulid::new()), am, "2026-03-03")).await);
    assert_eq!(err.kind(), ErrorKind::Full);

    let bad = SlotEdit {
        slot_id: am,
        end_time: Some(t(8, 0)),
        ..SlotEdit::default()
    };
    assert_eq!(assert_err!(engine.edit_slot(bad).await).kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn inactive_slot_is_not_bookable() {
    let (engine, _rx) = engine("inactive.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let am = slot(&engine, pantry, t(9, 0), t(11, 0), 3).await;
    engine
        .edit_slot(SlotEdit {
            slot_id: am,
            is_active: Some(false),
            ..SlotEdit::default()
        })
        .await
        .unwrap();

    let err = assert_err!(engine.book(request(Requester::client(Ulid::new()), am, "2026-03-03")).await);
    assert_eq!(err, EngineError::SlotInactive(am));
    assert!(engine.slot_availability(day(3), None).await.is_empty());
}

#[tokio::test]
async fn availability_lists_remaining_and_closed() {
    let (engine, _rx) = engine("availability.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let sorting = role(&engine, "Sorting", RequesterKind::Volunteer, false).await;
    let pantry_am = slot(&engine, pantry, t(9, 0), t(11, 0), 2).await;
    let sorting_am = slot(&engine, sorting, t(8, 0), t(12, 0), 5).await;
    let wednesday_only = slot_on(&engine, pantry, t(17, 0), t(19, 0), 3, Some(Weekday::Wed)).await;
    engine.book(request(Requester::client(Ulid::new()), pantry_am, "2026-03-03")).await.unwrap();

    let rows = engine.slot_availability(day(3), None).await;
    let ids: Vec<Ulid> = rows.iter().map(|r| r.slot.id).collect();
    assert_eq!(ids, vec![sorting_am, pantry_am, wednesday_only]);
    assert_eq!((rows[1].counted, rows[1].available, rows[1].closed), (1, 1, false));
    assert_eq!(rows[1].role_name, "Pantry");
    assert!(rows[2].closed);

    let pantry_only = engine.slot_availability(day(3), Some(pantry)).await;
    assert_eq!(pantry_only.len(), 2);

    let saturday = engine.slot_availability(day(7), None).await;
    assert!(saturday.iter().all(|r| r.closed));
}

// ── Recurring series ─────────────────────────────────────

async fn trained_volunteer(engine: &Engine, role_id: Ulid) -> Requester {
    let volunteer = Requester::volunteer(Ulid::new());
    engine.grant_training(volunteer.id, role_id).await.unwrap();
    volunteer
}

fn series(requester: Requester, slot_id: Ulid, start: &str, end: &str, pattern: Pattern) -> SeriesRequest {
    SeriesRequest {
        id: Ulid::new(),
        requester,
        slot_id,
        start_date: start.into(),
        end_date: end.into(),
        pattern,
        origin: Origin::SelfService,
    }
}

#[tokio::test]
async fn recurring_skips_holiday_with_reason() {
    let (engine, _rx) = engine("recurring_holiday.wal");
    let sorting = role(&engine, "Sorting", RequesterKind::Volunteer, false).await;
    let am = slot(&engine, sorting, t(9, 0), t(12, 0), 4).await;
    let volunteer = trained_volunteer(&engine, sorting).await;
    engine.add_holiday("2026-03-09", None).await.unwrap();

    let weekly = Pattern::Weekly {
        days: vec![Weekday::Mon, Weekday::Wed],
    };
    let req = series(volunteer, am, "2026-03-02", "2026-03-13", weekly);
    let series_id = req.id;
    let outcome = engine.create_series(req).await.unwrap();

    assert_eq!(outcome.recurring_id, series_id);
    assert_eq!(outcome.successes, vec![day(2), day(4), day(11)]);
    assert_eq!(
        outcome.skipped,
        vec![SkippedDate {
            date: day(9),
            reason: "Role not bookable on holidays or weekends".into(),
        }]
    );

    let booked = engine.series_bookings(series_id).await.unwrap();
    assert_eq!(booked.len(), 3);
    assert!(booked.iter().all(|b| b.recurring_id == Some(series_id)));
    assert!(booked.iter().all(|b| b.status == BookingStatus::Approved));
    assert_eq!(engine.get_series(series_id).unwrap().end_date, day(13));
}

#[tokio::test]
async fn recurring_accounts_for_every_matching_date() {
    let (engine, _rx) = engine("recurring_daily.wal");
    let sorting = role(&engine, "Sorting", RequesterKind::Volunteer, false).await;
    let am = slot(&engine, sorting, t(9, 0), t(12, 0), 1).await;
    let volunteer = trained_volunteer(&engine, sorting).await;
    // Wednesday is already taken by someone else.
    let other = trained_volunteer(&engine, sorting).await;
    engine.book(request(other, am, "2026-03-04")).await.unwrap();

    let outcome = engine
        .create_series(series(volunteer, am, "2026-03-02", "2026-03-08", Pattern::Daily))
        .await
        .unwrap();
    assert_eq!(outcome.successes.len() + outcome.skipped.len(), 7);
    assert_eq!(outcome.successes, vec![day(2), day(3), day(5), day(6)]);
    let reasons: Vec<(NaiveDate, &str)> = outcome.skipped.iter().map(|s| (s.date, s.reason.as_str())).collect();
    assert_eq!(
        reasons,
        vec![
            (day(4), "slot is full (capacity 1)"),
            (day(7), "Role not bookable on holidays or weekends"),
            (day(8), "Role not bookable on holidays or weekends"),
        ]
    );
}

#[tokio::test]
async fn recurring_rejects_bad_requests_whole() {
    let (engine, _rx) = engine("recurring_bad.wal");
    let sorting = role(&engine, "Sorting", RequesterKind::Volunteer, false).await;
    let am = slot(&engine, sorting, t(9, 0), t(12, 0), 4).await;
    let volunteer = trained_volunteer(&engine, sorting).await;

    let backwards = series(volunteer, am, "2026-03-10", "2026-03-02", Pattern::Daily);
    assert_eq!(assert_err!(engine.create_series(backwards).await).kind(), ErrorKind::InvalidInput);

    let no_days = series(volunteer, am, "2026-03-02", "2026-03-10", Pattern::Weekly { days: vec![] });
    assert_eq!(assert_err!(engine.create_series(no_days).await).kind(), ErrorKind::InvalidInput);

    let too_long = series(volunteer, am, "2026-03-02", "2027-03-10", Pattern::Daily);
    assert_eq!(assert_err!(engine.create_series(too_long).await).kind(), ErrorKind::LimitExceeded);

    let bad_date = series(volunteer, am, "2026-03-32", "2026-04-10", Pattern::Daily);
    assert_eq!(assert_err!(engine.create_series(bad_date).await).kind(), ErrorKind::InvalidDate);

    assert!(engine.bookings_for_requester(volunteer.id).await.is_empty());
}

#[tokio::test]
async fn cancelling_a_series_keeps_earlier_occurrences() {
    let (engine, _rx) = engine("recurring_cancel.wal");
    let sorting = role(&engine, "Sorting", RequesterKind::Volunteer, false).await;
    let am = slot(&engine, sorting, t(9, 0), t(12, 0), 4).await;
    let volunteer = trained_volunteer(&engine, sorting).await;
    let weekly = Pattern::Weekly {
        days: vec![Weekday::Tue],
    };
    let req = series(volunteer, am, "2026-03-03", "2026-03-24", weekly);
    let series_id = req.id;
    engine.create_series(req).await.unwrap();

    let cancelled = engine.cancel_series(series_id, Some("2026-03-12")).await.unwrap();
    assert_eq!(cancelled, 2);

    let statuses: Vec<(NaiveDate, BookingStatus)> = engine
        .series_bookings(series_id)
        .await
        .unwrap()
        .into_iter()
        .map(|b| (b.date, b.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            (day(3), BookingStatus::Approved),
            (day(10), BookingStatus::Approved),
            (day(17), BookingStatus::Cancelled),
            (day(24), BookingStatus::Cancelled),
        ]
    );

    // Already-cancelled occurrences are not counted twice.
    assert_eq!(engine.cancel_series(series_id, Some("2026-03-01")).await.unwrap(), 2);
    assert_eq!(assert_err!(engine.cancel_series(Ulid::new(), None).await).kind(), ErrorKind::NotFound);
}

// ── Conflict resolution ──────────────────────────────────

/// Client with a Pantry booking at 09:00-11:00 and an overlapping Produce slot.
async fn conflicted(name: &str) -> (Engine, mpsc::Receiver<Notice>, Booking, Ulid) {
    let (engine, rx) = engine(name);
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let produce = role(&engine, "Produce", RequesterKind::Client, false).await;
    let pantry_am = slot(&engine, pantry, t(9, 0), t(11, 0), 4).await;
    let produce_am = slot(&engine, produce, t(10, 0), t(12, 0), 1).await;
    let client = Requester::client(Ulid::new());
    let existing = engine.book(request(client, pantry_am, "2026-03-03")).await.unwrap();
    let err = assert_err!(engine.book(request(client, produce_am, "2026-03-03")).await);
    assert_eq!(err.kind(), ErrorKind::Conflict);
    (engine, rx, existing, produce_am)
}

#[tokio::test]
async fn keep_existing_writes_nothing() {
    let (engine, mut rx, existing, _produce_am) = conflicted("keep_existing.wal").await;
    drain(&mut rx);

    let resolution = engine.resolve_conflict(existing.id, Keep::Existing, None).await.unwrap();
    assert_eq!(resolution, Resolution::KeptExisting(existing.clone()));
    assert_eq!(engine.get_booking(existing.id).await, Some(existing.clone()));
    assert_eq!(engine.bookings_for_requester(existing.requester.id).await.len(), 1);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn keep_new_cancels_existing_and_books_replacement() {
    let (engine, _rx, existing, produce_am) = conflicted("keep_new.wal").await;
    let new_id = Ulid::new();

    let resolution = engine
        .resolve_conflict(
            existing.id,
            Keep::New,
            Some(Replacement {
                id: new_id,
                slot_id: produce_am,
                date: "2026-03-03".into(),
                note: None,
            }),
        )
        .await
        .unwrap();
    assert_eq!(resolution.keep(), Keep::New);
    assert_eq!(resolution.booking().id, new_id);
    assert_eq!(resolution.booking().requester, existing.requester);

    let old = engine.get_booking(existing.id).await.unwrap();
    assert_eq!(old.status, BookingStatus::Cancelled);
    assert_eq!(old.reason.as_deref(), Some("conflict"));
    assert_eq!(engine.counted_reservations(existing.slot_id, day(3)).await.unwrap(), 0);
    assert_eq!(engine.counted_reservations(produce_am, day(3)).await.unwrap(), 1);

    // The cancelled side cannot be resolved again.
    let err = assert_err!(engine.resolve_conflict(existing.id, Keep::Existing, None).await);
    assert_eq!(err, EngineError::AlreadyResolved(existing.id));
}

#[tokio::test]
async fn keep_new_is_all_or_nothing() {
    let (engine, _rx, existing, produce_am) = conflicted("keep_new_full.wal").await;
    engine
        .book(request(Requester::client(Ulid::new()), produce_am, "2026-03-03"))
        .await
        .unwrap();

    let err = assert_err!(
        engine
            .resolve_conflict(
                existing.id,
                Keep::New,
                Some(Replacement {
                    id: Ulid::new(),
                    slot_id: produce_am,
                    date: "2026-03-03".into(),
                    note: None,
                }),
            )
            .await
    );
    assert_eq!(err.kind(), ErrorKind::Full);
    assert_eq!(engine.get_booking(existing.id).await.unwrap().status, BookingStatus::Pending);

    let err = assert_err!(engine.resolve_conflict(existing.id, Keep::New, None).await);
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(
        assert_err!(engine.resolve_conflict(Ulid::new(), Keep::Existing, None).await).kind(),
        ErrorKind::NotFound
    );
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn status_transitions_follow_the_table() {
    let (engine, _rx) = engine("transitions.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let am = slot(&engine, pantry, t(9, 0), t(11, 0), 4).await;
    let booking = engine.book(request(Requester::client(Ulid::new()), am, "2026-03-03")).await.unwrap();

    let err = assert_err!(engine.decide(booking.id, Decision::Complete, None).await);
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);

    let approved = engine.decide(booking.id, Decision::Approve, None).await.unwrap();
    assert_eq!(approved.status, BookingStatus::Approved);
    let completed = engine.decide(booking.id, Decision::Complete, None).await.unwrap();
    assert_eq!(completed.status, BookingStatus::Completed);

    let err = assert_err!(engine.cancel_booking(booking.id).await);
    assert_eq!(err.to_string(), "cannot cancel a completed booking");
    assert_eq!(engine.counted_reservations(am, day(3)).await.unwrap(), 0);

    let other = engine.book(request(Requester::client(Ulid::new()), am, "2026-03-03")).await.unwrap();
    let rejected = engine
        .decide(other.id, Decision::Reject, Some("outside service area".into()))
        .await
        .unwrap();
    assert_eq!(rejected.status, BookingStatus::Rejected);
    assert_eq!(rejected.reason.as_deref(), Some("outside service area"));
}

#[tokio::test]
async fn reschedule_token_cancels_and_moves() {
    let (engine, _rx) = engine("token.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let am = slot(&engine, pantry, t(9, 0), t(11, 0), 4).await;
    let client = Requester::client(Ulid::new());

    let first = engine.book(request(client, am, "2026-03-03")).await.unwrap();
    let cancelled = engine.cancel_by_token(&first.reschedule_token).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.reason.as_deref(), Some("cancelled via link"));
    let err = assert_err!(engine.cancel_by_token(&first.reschedule_token).await);
    assert_eq!(err.kind(), ErrorKind::AlreadyResolved);

    let second = engine.book(request(client, am, "2026-03-04")).await.unwrap();
    let new_id = Ulid::new();
    let moved = engine
        .reschedule_by_token(&second.reschedule_token, new_id, am, "2026-03-05")
        .await
        .unwrap();
    assert_eq!(moved.id, new_id);
    assert_eq!(moved.date, day(5));
    assert_eq!(moved.requester, client);
    assert_ne!(moved.reschedule_token, second.reschedule_token);

    let old = engine.get_booking(second.id).await.unwrap();
    assert_eq!(old.status, BookingStatus::Cancelled);
    assert_eq!(old.reason.as_deref(), Some("rescheduled"));

    let err = assert_err!(engine.cancel_by_token("no-such-token").await);
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn commits_enqueue_notices() {
    let (engine, mut rx) = engine("notices.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let am = slot(&engine, pantry, t(9, 0), t(11, 0), 4).await;
    let client = Requester::client(Ulid::new());

    let booking = engine.book(request(client, am, "2026-03-03")).await.unwrap();
    engine.decide(booking.id, Decision::Approve, None).await.unwrap();
    engine
        .decide(booking.id, Decision::Cancel, Some("family emergency".into()))
        .await
        .unwrap();

    let notices = drain(&mut rx);
    let kinds: Vec<NoticeKind> = notices.iter().map(|n| n.kind).collect();
    assert_eq!(kinds, vec![NoticeKind::Requested, NoticeKind::Approved, NoticeKind::Cancelled]);
    assert!(notices.iter().all(|n| n.requester == client));
    assert_eq!(notices[0].booking.role_name, "Pantry");
    assert_eq!(notices[0].booking.start_time, t(9, 0));
    assert_eq!(notices[2].reason.as_deref(), Some("family emergency"));
}

// ── Transactions & durability ────────────────────────────

#[tokio::test]
async fn dropped_transaction_leaves_no_rows() {
    let (engine, mut rx) = engine("rollback.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let am = slot(&engine, pantry, t(9, 0), t(11, 0), 4).await;
    let booking = Booking {
        id: Ulid::new(),
        requester: Requester::client(Ulid::new()),
        slot_id: am,
        date: day(3),
        status: BookingStatus::Approved,
        note: None,
        recurring_id: None,
        reschedule_token: "rollback-token".into(),
        reason: None,
        created_on: day(2),
    };

    {
        let mut txn = engine.begin(&[am]).await.unwrap();
        txn.stage(Event::BookingCreated {
            booking: booking.clone(),
        });
        // Reads inside the transaction see the staged row.
        assert_eq!(txn.counted(am, day(3)), 1);
        assert_eq!(txn.booking(am, day(3), booking.id), Some(booking.clone()));
    }

    assert!(engine.bookings_for_slot(am, day(3)).await.unwrap().is_empty());
    assert_eq!(engine.get_booking(booking.id).await, None);
    assert!(drain(&mut rx).is_empty());
    assert_eq!(assert_err!(engine.cancel_by_token("rollback-token").await).kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn begin_on_unknown_slot_is_not_found() {
    let (engine, _rx) = engine("begin_unknown.wal");
    let Err(err) = engine.begin(&[Ulid::new()]).await else {
        panic!("begin on an unknown slot should fail");
    };
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let (booking_id, forced_id, cancelled_token, am, volunteer, sorting) = {
        let (engine, _rx) = open_engine(path.clone(), day(2));
        let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
        let sorting = role(&engine, "Sorting", RequesterKind::Volunteer, false).await;
        let am = slot(&engine, pantry, t(9, 0), t(11, 0), 1).await;
        let volunteer = trained_volunteer(&engine, sorting).await;
        engine.add_holiday("2026-03-09", Some("closure".into())).await.unwrap();

        let booking = engine.book(request(Requester::client(Ulid::new()), am, "2026-03-03")).await.unwrap();
        engine.decide(booking.id, Decision::Approve, None).await.unwrap();
        let forced = engine
            .book(staff_request(Requester::client(Ulid::new()), am, "2026-03-03", true, false))
            .await
            .unwrap();
        let to_cancel = engine.book(request(Requester::client(Ulid::new()), am, "2026-03-04")).await.unwrap();
        engine.cancel_by_token(&to_cancel.reschedule_token).await.unwrap();
        (booking.id, forced.id, to_cancel.reschedule_token, am, volunteer, sorting)
    };

    let (engine, _rx) = open_engine(path, day(2));
    assert_eq!(engine.get_booking(booking_id).await.unwrap().status, BookingStatus::Approved);
    assert_eq!(engine.get_booking(forced_id).await.unwrap().status, BookingStatus::Approved);
    assert_eq!(engine.counted_reservations(am, day(3)).await.unwrap(), 2);
    assert_eq!(engine.get_slot_state(&am).unwrap().read().await.slot.max_capacity, 2);
    assert_eq!(engine.list_holidays().len(), 1);
    assert_eq!(engine.list_roles().len(), 2);

    // Indexes are rebuilt too.
    let err = assert_err!(engine.cancel_by_token(&cancelled_token).await);
    assert_eq!(err.kind(), ErrorKind::AlreadyResolved);
    let shift = slot(&engine, sorting, t(13, 0), t(15, 0), 2).await;
    assert_ok!(engine.book(request(volunteer, shift, "2026-03-03")).await);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let (kept, cancelled, am, series_id) = {
        let (engine, _rx) = open_engine(path.clone(), day(2));
        let sorting = role(&engine, "Sorting", RequesterKind::Volunteer, false).await;
        let am = slot(&engine, sorting, t(9, 0), t(12, 0), 3).await;
        let a = trained_volunteer(&engine, sorting).await;
        let b = trained_volunteer(&engine, sorting).await;
        let kept = engine.book(request(a, am, "2026-03-03")).await.unwrap();
        let cancelled = engine.book(request(b, am, "2026-03-03")).await.unwrap();
        engine.cancel_booking(cancelled.id).await.unwrap();
        let req = series(b, am, "2026-03-04", "2026-03-06", Pattern::Daily);
        let series_id = req.id;
        engine.create_series(req).await.unwrap();

        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        (kept.id, cancelled.id, am, series_id)
    };

    let (engine, _rx) = open_engine(path, day(2));
    assert_eq!(engine.get_booking(kept).await.unwrap().status, BookingStatus::Approved);
    assert_eq!(engine.get_booking(cancelled).await.unwrap().status, BookingStatus::Cancelled);
    assert_eq!(engine.counted_reservations(am, day(3)).await.unwrap(), 1);
    assert_eq!(engine.series_bookings(series_id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn listeners_see_committed_events() {
    let (engine, _rx) = engine("listen.wal");
    let pantry = role(&engine, "Pantry", RequesterKind::Client, false).await;
    let am = slot(&engine, pantry, t(9, 0), t(11, 0), 4).await;
    let mut events = engine.notify.subscribe(am);

    let booking = engine.book(request(Requester::client(Ulid::new()), am, "2026-03-03")).await.unwrap();
    match events.recv().await.unwrap() {
        Event::BookingCreated { booking: seen } => assert_eq!(seen, booking),
        other => panic!("expected BookingCreated, got {other:?}"),
    }

    // Rejected admissions publish nothing.
    let _ = engine.book(request(booking.requester, am, "2026-03-03")).await;
    assert!(events.try_recv().is_err());
}

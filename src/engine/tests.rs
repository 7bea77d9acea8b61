use super::*;
use crate::audit::MemoryAuditSink;

const H: Ms = 3_600_000;
const M: Ms = 60_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("labdesk_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open_engine(path: PathBuf) -> (Arc<Engine>, Arc<MemoryAuditSink>) {
    let audit = Arc::new(MemoryAuditSink::new());
    let engine = Engine::new(
        path,
        Arc::new(NotifyHub::new()),
        audit.clone(),
        EngineSettings::default(),
    )
    .unwrap();
    (Arc::new(engine), audit)
}

fn test_engine(name: &str) -> (Arc<Engine>, Arc<MemoryAuditSink>) {
    open_engine(test_wal_path(name))
}

fn at(s: &str) -> Ms {
    parse_timestamp(s).unwrap()
}

async fn add_user(engine: &Engine, name: &str, roles: &[Role]) -> Uuid {
    let user = engine
        .upsert_user(User {
            id: Uuid::new_v4(),
            full_name: name.into(),
            roles: roles.to_vec(),
            status: UserStatus::Active,
        })
        .await
        .unwrap();
    user.id
}

async fn add_room(engine: &Engine, name: &str) -> Uuid {
    engine
        .create_room(None, name, 10, RoomStatus::Available)
        .await
        .unwrap()
        .id
}

fn booking_req(room_id: Uuid, start: Ms, end: Ms) -> NewBooking {
    NewBooking {
        room_id,
        start,
        end,
        purpose: "Lab session".into(),
        event_id: None,
        notes: None,
    }
}

fn to(status: BookingStatus) -> BookingStatusChange {
    BookingStatusChange {
        status,
        notes: None,
        force: false,
    }
}

fn event_req(title: &str, start: Ms, end: Ms) -> NewEvent {
    NewEvent {
        title: title.into(),
        start_date: Some(start),
        end_date: Some(end),
        ..Default::default()
    }
}

async fn approved_booking(engine: &Engine, room: Uuid, user: Uuid, start: Ms, end: Ms) -> Booking {
    let b = engine
        .create_booking(user, booking_req(room, start, end))
        .await
        .unwrap();
    engine
        .update_booking_status(b.id, user, to(BookingStatus::Approved))
        .await
        .unwrap()
}

// ── Conflict checking ────────────────────────────────────

#[tokio::test]
async fn overlapping_request_rejected_back_to_back_accepted() {
    let (engine, _) = test_engine("scenario_room.wal");
    let user = add_user(&engine, "Mai Nguyen", &[Role::Lecturer]).await;
    let room = add_room(&engine, "R").await;
    let nine = at("2025-01-10T09:00:00Z");

    approved_booking(&engine, room, user, nine, nine + H).await;

    let err = engine
        .create_booking(user, booking_req(room, nine + 30 * M, nine + 90 * M))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)), "got {err}");

    let next = engine
        .create_booking(user, booking_req(room, nine + H, nine + 2 * H))
        .await
        .unwrap();
    assert_eq!(next.status, BookingStatus::Pending);
}

#[tokio::test]
async fn only_approved_bookings_block() {
    let (engine, _) = test_engine("pending_no_block.wal");
    let user = add_user(&engine, "Mai Nguyen", &[Role::Student]).await;
    let room = add_room(&engine, "Lab 2").await;
    let nine = at("2025-01-10 09:00:00");

    let first = engine
        .create_booking(user, booking_req(room, nine, nine + H))
        .await
        .unwrap();
    engine
        .create_booking(user, booking_req(room, nine, nine + H))
        .await
        .unwrap();

    engine
        .update_booking_status(first.id, user, to(BookingStatus::Rejected))
        .await
        .unwrap();
    assert!(!engine.has_conflict(room, TimeInterval::new(nine, nine + H), None).await);
}

#[tokio::test]
async fn has_conflict_matches_overlap_rule() {
    let (engine, _) = test_engine("has_conflict.wal");
    let user = add_user(&engine, "Mai Nguyen", &[]).await;
    let room = add_room(&engine, "Lab 3").await;
    let t = at("2025-02-01T08:00:00Z");
    let approved = approved_booking(&engine, room, user, t + H, t + 2 * H).await;

    let cases = [
        (t, t + H, false),
        (t + 2 * H, t + 3 * H, false),
        (t + H - M, t + H + M, true),
        (t + 90 * M, t + 3 * H, true),
        (t, t + 4 * H, true),
        (t + H + M, t + 2 * H - M, true),
    ];
    for (start, end, expected) in cases {
        let got = engine
            .has_conflict(room, TimeInterval::new(start, end), None)
            .await;
        assert_eq!(got, expected, "[{start}, {end})");
    }
    assert!(
        !engine
            .has_conflict(room, approved.interval, Some(approved.id))
            .await
    );
    assert!(!engine.has_conflict(Uuid::new_v4(), approved.interval, None).await);
}

#[tokio::test]
async fn booking_validation_errors() {
    let (engine, _) = test_engine("booking_validation.wal");
    let user = add_user(&engine, "Mai Nguyen", &[]).await;
    let room = add_room(&engine, "Lab 4").await;
    let t = at("2025-03-01T10:00:00Z");

    let inverted = engine
        .create_booking(user, booking_req(room, t, t))
        .await
        .unwrap_err();
    assert!(matches!(inverted, EngineError::Validation(_)));

    let mut blank = booking_req(room, t, t + H);
    blank.purpose = "   ".into();
    assert!(matches!(
        engine.create_booking(user, blank).await,
        Err(EngineError::Validation(_))
    ));

    let ghost_room = Uuid::new_v4();
    assert!(matches!(
        engine.create_booking(user, booking_req(ghost_room, t, t + H)).await,
        Err(EngineError::NotFound(Entity::Room, id)) if id == ghost_room
    ));

    let mut ghost_event = booking_req(room, t, t + H);
    ghost_event.event_id = Some(Uuid::new_v4());
    assert!(matches!(
        engine.create_booking(user, ghost_event).await,
        Err(EngineError::NotFound(Entity::Event, _))
    ));
}

#[tokio::test]
async fn room_under_maintenance_refuses_bookings() {
    let (engine, _) = test_engine("maintenance.wal");
    let user = add_user(&engine, "Mai Nguyen", &[]).await;
    let room = add_room(&engine, "Lab 5").await;
    engine
        .update_room(
            room,
            RoomPatch {
                status: Some(RoomStatus::Maintenance),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let t = at("2025-03-01T10:00:00Z");
    assert!(matches!(
        engine.create_booking(user, booking_req(room, t, t + H)).await,
        Err(EngineError::InvalidState(_))
    ));
}

#[tokio::test]
async fn available_rooms_skip_booked_and_maintenance_rooms() {
    let (engine, _) = test_engine("available_rooms.wal");
    let user = add_user(&engine, "Mai Nguyen", &[Role::Lecturer]).await;
    let booked = add_room(&engine, "Lab A").await;
    let free = add_room(&engine, "Lab B").await;
    let closed = add_room(&engine, "Lab C").await;
    engine
        .update_room(
            closed,
            RoomPatch {
                status: Some(RoomStatus::Maintenance),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let nine = at("2025-03-03T09:00:00Z");
    approved_booking(&engine, booked, user, nine, nine + H).await;
    // Pending requests never take a room out of the list.
    engine
        .create_booking(user, booking_req(free, nine, nine + H))
        .await
        .unwrap();

    let ids = |rooms: Vec<Room>| rooms.into_iter().map(|r| r.id).collect::<Vec<_>>();
    let overlapping = TimeInterval::new(nine + 30 * M, nine + 90 * M);
    assert_eq!(ids(engine.available_rooms(overlapping).await), vec![free]);
    let back_to_back = TimeInterval::new(nine + H, nine + 2 * H);
    assert_eq!(ids(engine.available_rooms(back_to_back).await), vec![booked, free]);

    assert!(!engine.is_room_available(booked, overlapping).await);
    assert!(engine.is_room_available(booked, back_to_back).await);
    assert!(!engine.is_room_available(closed, back_to_back).await);
    assert!(!engine.is_room_available(Uuid::new_v4(), back_to_back).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_approvals_exactly_one_wins() {
    let (engine, _) = test_engine("approval_race.wal");
    let user = add_user(&engine, "Mai Nguyen", &[]).await;
    let room = add_room(&engine, "Lab 6").await;
    let t = at("2025-04-01T09:00:00Z");

    let mut pending = Vec::new();
    for i in 0..16 {
        let b = engine
            .create_booking(user, booking_req(room, t + i * M, t + H + i * M))
            .await
            .unwrap();
        pending.push(b.id);
    }

    let mut handles = Vec::new();
    for id in pending {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .update_booking_status(id, user, to(BookingStatus::Approved))
                .await
        }));
    }
    let mut approved = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => approved += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(approved, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(engine.list_approved_bookings(room).await.len(), 1);
}

// ── Booking lifecycle ────────────────────────────────────

#[tokio::test]
async fn terminal_statuses_need_force() {
    let (engine, audit) = test_engine("transitions.wal");
    let admin = add_user(&engine, "Ada Admin", &[Role::Admin]).await;
    let room = add_room(&engine, "Lab 7").await;
    let t = at("2025-05-01T09:00:00Z");
    let b = engine
        .create_booking(admin, booking_req(room, t, t + H))
        .await
        .unwrap();
    engine
        .update_booking_status(b.id, admin, to(BookingStatus::Rejected))
        .await
        .unwrap();

    let err = engine
        .update_booking_status(b.id, admin, to(BookingStatus::Approved))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)), "got {err}");

    let forced = engine
        .update_booking_status(
            b.id,
            admin,
            BookingStatusChange {
                status: BookingStatus::Approved,
                notes: Some("override by lab manager".into()),
                force: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(forced.status, BookingStatus::Approved);
    assert_eq!(forced.notes.as_deref(), Some("override by lab manager"));

    let summaries: Vec<_> = audit
        .entries()
        .into_iter()
        .filter(|e| e.subject_id == b.id && e.action == AuditAction::Update)
        .filter_map(|e| e.change_summary)
        .collect();
    assert_eq!(
        summaries,
        vec!["Status: Pending -> Rejected", "Status: Rejected -> Approved"]
    );
}

#[tokio::test]
async fn forced_approval_still_checks_conflicts() {
    let (engine, _) = test_engine("force_conflict.wal");
    let user = add_user(&engine, "Mai Nguyen", &[]).await;
    let room = add_room(&engine, "Lab 8").await;
    let t = at("2025-05-02T09:00:00Z");
    let loser = engine
        .create_booking(user, booking_req(room, t, t + H))
        .await
        .unwrap();
    approved_booking(&engine, room, user, t, t + H).await;

    let err = engine
        .update_booking_status(
            loser.id,
            user,
            BookingStatusChange {
                status: BookingStatus::Approved,
                notes: None,
                force: true,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn delete_booking_any_status() {
    let (engine, audit) = test_engine("delete_booking.wal");
    let user = add_user(&engine, "Mai Nguyen", &[]).await;
    let room = add_room(&engine, "Lab 9").await;
    let t = at("2025-05-03T09:00:00Z");
    let b = approved_booking(&engine, room, user, t, t + H).await;

    engine.delete_booking(b.id, user).await.unwrap();
    assert!(engine.find_booking(b.id).await.is_none());
    assert!(matches!(
        engine.delete_booking(b.id, user).await,
        Err(EngineError::NotFound(Entity::Booking, _))
    ));
    assert!(
        audit
            .entries()
            .iter()
            .any(|e| e.subject_id == b.id && e.action == AuditAction::Delete)
    );
}

// ── Events ───────────────────────────────────────────────

#[tokio::test]
async fn event_end_must_follow_start() {
    let (engine, _) = test_engine("event_dates.wal");
    let admin = add_user(&engine, "Ada Admin", &[Role::Admin]).await;
    let t = at("2025-06-01T09:00:00Z");

    for end in [t - H, t] {
        let err = engine
            .create_event(admin, event_req("Open Lab", t, end))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "end={end}: {err}");
    }

    let missing_start = NewEvent {
        title: "Open Lab".into(),
        end_date: Some(t),
        ..Default::default()
    };
    assert!(matches!(
        engine.create_event(admin, missing_start).await,
        Err(EngineError::Validation(msg)) if msg == "start date is required"
    ));
    assert!(engine.list_events(&EventFilter::default()).await.is_empty());
}

#[tokio::test]
async fn duplicate_title_is_per_calendar_day() {
    let (engine, _) = test_engine("event_titles.wal");
    let admin = add_user(&engine, "Ada Admin", &[Role::Admin]).await;
    let d10 = at("2025-01-10T09:00:00Z");
    let d11 = at("2025-01-11T09:00:00Z");

    engine
        .create_event(admin, event_req("Demo Day", d10, d10 + 2 * H))
        .await
        .unwrap();
    let err = engine
        .create_event(admin, event_req("Demo Day", d10 + 5 * H, d10 + 6 * H))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)), "got {err}");

    let next_day = engine
        .create_event(admin, event_req("Demo Day", d11, d11 + 2 * H))
        .await
        .unwrap();

    let moved = engine
        .update_event(
            next_day.id,
            admin,
            EventPatch {
                start_date: Some(d10 + 3 * H),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(moved, EngineError::Conflict(_)));
}

#[tokio::test]
async fn delete_event_needs_confirmation_and_no_active_bookings() {
    let (engine, _) = test_engine("event_delete.wal");
    let admin = add_user(&engine, "Ada Admin", &[Role::Admin]).await;
    let room = add_room(&engine, "Hall A").await;
    let t = at("2025-07-01T09:00:00Z");
    let event = engine
        .create_event(admin, event_req("Robotics Expo", t, t + 4 * H))
        .await
        .unwrap();

    let mut req = booking_req(room, t, t + 4 * H);
    req.event_id = Some(event.id);
    let booking = engine.create_booking(admin, req).await.unwrap();
    engine
        .update_booking_status(booking.id, admin, to(BookingStatus::Approved))
        .await
        .unwrap();

    assert!(matches!(
        engine.delete_event(event.id, admin, false).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.delete_event(event.id, admin, true).await,
        Err(EngineError::InvalidState(_))
    ));

    engine
        .update_booking_status(booking.id, admin, to(BookingStatus::Cancelled))
        .await
        .unwrap();
    assert!(matches!(
        engine.delete_event(event.id, admin, false).await,
        Err(EngineError::Validation(_))
    ));
    let deleted = engine.delete_event(event.id, admin, true).await.unwrap();
    assert_eq!(deleted.id, event.id);
    assert!(engine.find_event(event.id).await.is_none());
    assert!(matches!(
        engine.delete_event(event.id, admin, true).await,
        Err(EngineError::NotFound(Entity::Event, _))
    ));
}

#[tokio::test]
async fn linked_booking_status_change_waits_for_calendar() {
    let (engine, _) = test_engine("event_link_lock.wal");
    let admin = add_user(&engine, "Ada Admin", &[Role::Admin]).await;
    let room = add_room(&engine, "Hall B").await;
    let t = at("2025-07-02T09:00:00Z");
    let event = engine
        .create_event(admin, event_req("Open Lab", t, t + 2 * H))
        .await
        .unwrap();
    let mut req = booking_req(room, t, t + 2 * H);
    req.event_id = Some(event.id);
    let booking = engine.create_booking(admin, req).await.unwrap();
    engine
        .update_booking_status(booking.id, admin, to(BookingStatus::Cancelled))
        .await
        .unwrap();

    let calendar = engine.calendar.write().await;
    let revive = tokio::spawn({
        let engine = engine.clone();
        async move {
            let change = BookingStatusChange {
                status: BookingStatus::Approved,
                notes: None,
                force: true,
            };
            engine.update_booking_status(booking.id, admin, change).await
        }
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!revive.is_finished());
    assert_eq!(
        engine.find_booking(booking.id).await.map(|b| b.status),
        Some(BookingStatus::Cancelled)
    );
    drop(calendar);

    let revived = revive.await.unwrap().unwrap();
    assert_eq!(revived.status, BookingStatus::Approved);
}

#[tokio::test]
async fn update_event_records_diff_and_announces_once() {
    let (engine, audit) = test_engine("event_update.wal");
    let admin = add_user(&engine, "Ada Admin", &[Role::Admin]).await;
    let t = at("2025-08-01T09:00:00Z");
    let event = engine
        .create_event(admin, event_req("Hackathon", t, t + 8 * H))
        .await
        .unwrap();

    let updated = engine
        .update_event(
            event.id,
            admin,
            EventPatch {
                title: Some("Spring Hackathon".into()),
                location: Some("Hall B".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.title, "Spring Hackathon");
    assert_eq!(updated.location.as_deref(), Some("Hall B"));

    let summary = audit
        .entries()
        .into_iter()
        .rev()
        .find(|e| e.subject_id == event.id && e.action == AuditAction::Update)
        .and_then(|e| e.change_summary)
        .unwrap();
    assert!(summary.contains("Title"), "{summary}");
    assert!(summary.contains("Location"), "{summary}");
    assert!(!summary.contains("Description"), "{summary}");

    // Created + Updated.
    let titles: Vec<String> = engine
        .list_notifications()
        .await
        .into_iter()
        .map(|n| n.title)
        .collect();
    assert_eq!(titles.len(), 2);
    assert!(titles.contains(&"Event Updated".to_string()));
}

#[tokio::test]
async fn noop_event_update_is_audited_but_not_announced() {
    let (engine, audit) = test_engine("event_noop.wal");
    let admin = add_user(&engine, "Ada Admin", &[Role::Admin]).await;
    let t = at("2025-08-02T09:00:00Z");
    let event = engine
        .create_event(admin, event_req("Seminar", t, t + H))
        .await
        .unwrap();

    let same = engine
        .update_event(
            event.id,
            admin,
            EventPatch {
                title: Some("Seminar".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(same, event);
    assert_eq!(engine.list_notifications().await.len(), 1);

    let last = audit.entries().pop().unwrap();
    assert_eq!(last.action, AuditAction::Update);
    assert_eq!(last.change_summary, None);

    assert!(matches!(
        engine
            .update_event(
                event.id,
                admin,
                EventPatch {
                    title: Some(" ".into()),
                    ..Default::default()
                },
            )
            .await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn event_update_rechecks_dates_after_merging() {
    let (engine, _) = test_engine("event_update_dates.wal");
    let admin = add_user(&engine, "Ada Admin", &[Role::Admin]).await;
    let t = at("2025-08-03T09:00:00Z");
    let event = engine
        .create_event(admin, event_req("Workshop", t, t + 2 * H))
        .await
        .unwrap();

    let end_before_start = EventPatch {
        end_date: Some(t),
        ..Default::default()
    };
    let start_after_end = EventPatch {
        start_date: Some(t + 3 * H),
        ..Default::default()
    };
    for patch in [end_before_start, start_after_end] {
        let err = engine.update_event(event.id, admin, patch).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "got {err}");
    }

    assert_eq!(engine.find_event(event.id).await, Some(event));
    let titles: Vec<String> = engine
        .list_notifications()
        .await
        .into_iter()
        .map(|n| n.title)
        .collect();
    assert_eq!(titles, vec!["New Event Created".to_string()]);
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn fanout_stores_one_notification_for_the_audience() {
    let (engine, _) = test_engine("fanout.wal");
    let admin = add_user(&engine, "Ada Admin", &[Role::Admin]).await;
    let student = add_user(&engine, "Sam Student", &[Role::Student]).await;
    let lecturer = add_user(&engine, "Lee Lecturer", &[Role::Lecturer]).await;
    add_user(&engine, "Sue Student", &[Role::Student]).await;

    let mut rx = engine.notify.subscribe(TargetGroup::Student);
    let t = at("2025-09-01T09:00:00Z");
    engine
        .create_event(
            admin,
            NewEvent {
                audience: Some(TargetGroup::Student),
                ..event_req("Study Jam", t, t + H)
            },
        )
        .await
        .unwrap();

    let all = engine.list_notifications().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].target_group, TargetGroup::Student);
    assert_eq!(all[0].content, "A new event 'Study Jam' has been created.");

    let live = rx.try_recv().unwrap();
    assert_eq!(live.id, all[0].id);

    assert_eq!(engine.unread_count(student).await.unwrap(), 1);
    assert_eq!(engine.unread_count(lecturer).await.unwrap(), 0);

    let report = engine
        .fanout(admin, TargetGroup::Student, "Reminder", "Bring laptops")
        .await
        .unwrap();
    assert_eq!(report.recipients, 2);
    assert_eq!(report.delivered, 1);
}

#[tokio::test]
async fn mark_all_read_zeroes_unread_until_next_notification() {
    let (engine, _) = test_engine("mark_all.wal");
    let admin = add_user(&engine, "Ada Admin", &[Role::Admin]).await;
    let user = add_user(&engine, "Lee Lecturer", &[Role::Lecturer]).await;

    engine.fanout(admin, TargetGroup::All, "Welcome", "Term starts").await.unwrap();
    engine.fanout(admin, TargetGroup::Lecturer, "Staff", "Meeting").await.unwrap();
    engine.fanout(admin, TargetGroup::Student, "Students", "Quiz").await.unwrap();
    assert_eq!(engine.unread_count(user).await.unwrap(), 2);

    assert_eq!(engine.mark_all_as_read(user).await.unwrap(), 2);
    assert_eq!(engine.unread_count(user).await.unwrap(), 0);
    assert_eq!(engine.mark_all_as_read(user).await.unwrap(), 0);

    engine.fanout(admin, TargetGroup::Lecturer, "Staff", "Again").await.unwrap();
    assert_eq!(engine.unread_count(user).await.unwrap(), 1);

    let inbox = engine.list_user_notifications(user).await.unwrap();
    assert_eq!(inbox.len(), 3);
    assert_eq!(inbox.iter().filter(|n| !n.is_read).count(), 1);
}

#[tokio::test]
async fn mark_as_read_is_idempotent() {
    let (engine, _) = test_engine("mark_one.wal");
    let admin = add_user(&engine, "Ada Admin", &[Role::Admin]).await;
    let user = add_user(&engine, "Sam Student", &[Role::Student]).await;
    let report = engine.fanout(admin, TargetGroup::All, "Hi", "Hello").await.unwrap();
    let id = report.notification.id;

    assert!(engine.mark_as_read(id, user).await.unwrap());
    assert!(!engine.mark_as_read(id, user).await.unwrap());
    assert_eq!(engine.unread_count(user).await.unwrap(), 0);

    assert!(matches!(
        engine.mark_as_read(Uuid::new_v4(), user).await,
        Err(EngineError::NotFound(Entity::Notification, _))
    ));
    assert!(matches!(
        engine.mark_as_read(id, Uuid::new_v4()).await,
        Err(EngineError::NotFound(Entity::User, _))
    ));
}

#[tokio::test]
async fn window_and_expiry_control_visibility() {
    let (engine, _) = test_engine("expiry.wal");
    let admin = add_user(&engine, "Ada Admin", &[Role::Admin]).await;
    let user = add_user(&engine, "Sam Student", &[Role::Student]).await;
    let now = now_ms();
    let notice = |title: &str, start: Ms, end: Ms| NewNotification {
        title: title.into(),
        content: "details".into(),
        target_group: TargetGroup::All,
        start_date: start,
        end_date: end,
    };

    engine
        .create_notification(admin, notice("current", now - H, now + H))
        .await
        .unwrap();
    engine
        .create_notification(admin, notice("future", now + H, now + 2 * H))
        .await
        .unwrap();
    let lapsed = engine
        .create_notification(admin, notice("lapsed", now - 2 * H, now - H))
        .await
        .unwrap();
    assert_eq!(engine.unread_count(user).await.unwrap(), 1);

    assert_eq!(engine.expire_notifications(now).await.unwrap(), 1);
    assert_eq!(engine.expire_notifications(now).await.unwrap(), 0);
    let stored = engine.list_notifications().await;
    let status_of = |id: Uuid| stored.iter().find(|n| n.id == id).unwrap().status;
    assert_eq!(status_of(lapsed.id), NotificationStatus::Expired);
    assert_eq!(
        stored
            .iter()
            .filter(|n| n.status == NotificationStatus::Active)
            .count(),
        2
    );
}

#[tokio::test]
async fn notification_admin_crud() {
    let (engine, _) = test_engine("notification_crud.wal");
    let admin = add_user(&engine, "Ada Admin", &[Role::Admin]).await;
    let now = now_ms();
    let n = engine
        .create_notification(
            admin,
            NewNotification {
                title: "Power outage".into(),
                content: "Building C".into(),
                target_group: TargetGroup::All,
                start_date: now,
                end_date: now + H,
            },
        )
        .await
        .unwrap();

    let updated = engine
        .update_notification(
            n.id,
            NotificationPatch {
                target_group: Some(TargetGroup::Lecturer),
                status: Some(NotificationStatus::Inactive),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.target_group, TargetGroup::Lecturer);
    assert_eq!(updated.status, NotificationStatus::Inactive);

    engine.delete_notification(n.id).await.unwrap();
    assert!(engine.list_notifications().await.is_empty());
    assert!(matches!(
        engine.delete_notification(n.id).await,
        Err(EngineError::NotFound(Entity::Notification, _))
    ));

    assert!(matches!(
        engine
            .create_notification(
                Uuid::new_v4(),
                NewNotification {
                    title: "x".into(),
                    content: "y".into(),
                    target_group: TargetGroup::All,
                    start_date: now,
                    end_date: now + H,
                },
            )
            .await,
        Err(EngineError::NotFound(Entity::User, _))
    ));
}

// ── Audit ────────────────────────────────────────────────

#[tokio::test]
async fn audit_falls_back_to_unknown_admin() {
    let (engine, audit) = test_engine("audit_unknown.wal");
    let stranger = Uuid::new_v4();
    let t = at("2025-10-01T09:00:00Z");
    let event = engine
        .create_event(stranger, event_req("Orientation", t, t + H))
        .await
        .unwrap();

    let entry = audit.entries().pop().unwrap();
    assert_eq!(entry.actor_id, stranger);
    assert_eq!(entry.actor_name, UNKNOWN_ACTOR);
    assert_eq!(entry.subject_id, event.id);
    assert_eq!(entry.subject_type, SubjectType::Event);
    assert_eq!(entry.action, AuditAction::Create);
    assert!(entry.to_string().contains("Changes: N/A"));
}

// ── Rooms ────────────────────────────────────────────────

#[tokio::test]
async fn room_with_active_bookings_cannot_be_deleted() {
    let (engine, _) = test_engine("room_delete.wal");
    let user = add_user(&engine, "Mai Nguyen", &[]).await;
    let room = add_room(&engine, "Lab 10").await;
    let t = at("2025-11-01T09:00:00Z");
    let b = engine
        .create_booking(user, booking_req(room, t, t + H))
        .await
        .unwrap();

    assert!(matches!(
        engine.delete_room(room).await,
        Err(EngineError::InvalidState(_))
    ));
    engine
        .update_booking_status(b.id, user, to(BookingStatus::Cancelled))
        .await
        .unwrap();
    engine.delete_room(room).await.unwrap();
    assert!(engine.find_room(room).await.is_none());
    assert!(engine.find_booking(b.id).await.is_none());
}

#[tokio::test]
async fn duplicate_room_id_conflicts() {
    let (engine, _) = test_engine("room_dup.wal");
    let id = Uuid::new_v4();
    engine
        .create_room(Some(id), "Lab 11", 20, RoomStatus::Available)
        .await
        .unwrap();
    assert!(matches!(
        engine
            .create_room(Some(id), "Lab 11b", 20, RoomStatus::Available)
            .await,
        Err(EngineError::Conflict(_))
    ));
    assert_eq!(engine.list_rooms().await.len(), 1);
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let t = at("2025-12-01T09:00:00Z");
    let (user, room, booking, event, read_id) = {
        let (engine, _) = open_engine(path.clone());
        let user = add_user(&engine, "Mai Nguyen", &[Role::Lecturer]).await;
        let room = add_room(&engine, "Lab 12").await;
        let booking = approved_booking(&engine, room, user, t, t + H).await;
        let event = engine
            .create_event(user, event_req("Defense", t, t + H))
            .await
            .unwrap();
        let read_id = engine.list_notifications().await[0].id;
        engine.mark_as_read(read_id, user).await.unwrap();
        (user, room, booking, event, read_id)
    };

    let (engine, _) = open_engine(path);
    assert_eq!(engine.find_user(user).unwrap().full_name, "Mai Nguyen");
    assert_eq!(engine.find_room(room).await.unwrap().name, "Lab 12");
    let restored = engine.find_booking(booking.id).await.unwrap();
    assert_eq!(restored.status, BookingStatus::Approved);
    assert_eq!(engine.find_event(event.id).await.unwrap().title, "Defense");
    assert_eq!(engine.unread_count(user).await.unwrap(), 0);
    assert!(engine.list_notifications().await.iter().any(|n| n.id == read_id));

    // Restored approvals still block.
    assert!(matches!(
        engine.create_booking(user, booking_req(room, t + M, t + 2 * M)).await,
        Err(EngineError::Conflict(_))
    ));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact.wal");
    let t = at("2026-01-05T09:00:00Z");
    let (user, room, kept, removed) = {
        let (engine, _) = open_engine(path.clone());
        let admin = add_user(&engine, "Ada Admin", &[Role::Admin]).await;
        let user = add_user(&engine, "Sam Student", &[Role::Student]).await;
        let room = add_room(&engine, "Lab 13").await;
        let kept = approved_booking(&engine, room, user, t, t + H).await;
        let removed = engine
            .create_booking(user, booking_req(room, t + H, t + 2 * H))
            .await
            .unwrap();
        engine.delete_booking(removed.id, admin).await.unwrap();
        engine.fanout(admin, TargetGroup::All, "One", "1").await.unwrap();
        engine.fanout(admin, TargetGroup::Student, "Two", "2").await.unwrap();
        engine.mark_all_as_read(user).await.unwrap();

        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        (user, room, kept, removed)
    };

    let (engine, _) = open_engine(path);
    assert_eq!(engine.find_booking(kept.id).await.unwrap().status, BookingStatus::Approved);
    assert!(engine.find_booking(removed.id).await.is_none());
    assert_eq!(engine.list_bookings(&BookingFilter { room_id: Some(room), ..Default::default() }).await.len(), 1);
    assert_eq!(engine.list_notifications().await.len(), 2);
    assert_eq!(engine.unread_count(user).await.unwrap(), 0);
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn booking_filters_combine() {
    let (engine, _) = test_engine("booking_filters.wal");
    let a = add_user(&engine, "Ann", &[]).await;
    let b = add_user(&engine, "Ben", &[]).await;
    let room = add_room(&engine, "Lab 14").await;
    let other = add_room(&engine, "Lab 15").await;
    let t = at("2026-02-01T09:00:00Z");

    engine.create_booking(a, booking_req(room, t, t + H)).await.unwrap();
    engine.create_booking(b, booking_req(room, t + 2 * H, t + 3 * H)).await.unwrap();
    engine.create_booking(a, booking_req(other, t, t + H)).await.unwrap();

    let by_room = engine
        .list_bookings(&BookingFilter { room_id: Some(room), ..Default::default() })
        .await;
    assert_eq!(by_room.len(), 2);
    assert!(by_room[0].interval.start > by_room[1].interval.start);

    let mine = engine
        .list_bookings(&BookingFilter { user_id: Some(a), ..Default::default() })
        .await;
    assert_eq!(mine.len(), 2);

    let late = engine
        .list_bookings(&BookingFilter { from: Some(t + 90 * M), ..Default::default() })
        .await;
    assert_eq!(late.len(), 1);
    assert_eq!(late[0].user_id, b);
}

#[tokio::test]
async fn upcoming_events_exclude_past_and_inactive() {
    let (engine, _) = test_engine("upcoming.wal");
    let admin = add_user(&engine, "Ada Admin", &[Role::Admin]).await;
    let now = now_ms();
    engine
        .create_event(admin, event_req("Past", now - 48 * H, now - 47 * H))
        .await
        .unwrap();
    engine
        .create_event(admin, event_req("Soon", now + 24 * H, now + 25 * H))
        .await
        .unwrap();
    engine
        .create_event(
            admin,
            NewEvent {
                status: Some(EventStatus::Inactive),
                ..event_req("Shelved", now + 48 * H, now + 49 * H)
            },
        )
        .await
        .unwrap();

    let upcoming = engine
        .list_events(&EventFilter { upcoming_only: true, ..Default::default() })
        .await;
    assert_eq!(upcoming.len(), 1);
    assert_eq!(upcoming[0].title, "Soon");
    assert_eq!(engine.list_events(&EventFilter::default()).await.len(), 3);
}

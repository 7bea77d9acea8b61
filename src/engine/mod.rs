mod booking;
mod conflict;
mod error;
mod event;
mod lifecycle;
mod mutations;
mod notification;
mod queries;
mod store;
#[cfg(test)]
mod tests;

pub use conflict::now_ms;
pub use error::{EngineError, Entity};
pub use lifecycle::allowed_transitions;
pub use notification::FanoutReport;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry, AuditSink, SubjectType, UNKNOWN_ACTOR};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Record, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Each wake-up drains every append already queued and commits
/// them with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { record, response } => batch.push((record, response)),
                        other => {
                            deferred = Some(other);
                            break;
                        }
                    }
                }
                commit_batch(&mut wal, batch);
                if let Some(other) = deferred {
                    handle_command(&mut wal, other);
                }
            }
            other => handle_command(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let append_result = batch
        .iter()
        .try_for_each(|(record, _)| wal.append_buffered(record));
    // Flush even after a failed append so partial bytes never join the next batch.
    let result = append_result.and(wal.flush_sync());
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL commit of {} records failed: {e}", batch.len());
    }
    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_command(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Append { record, response } => commit_batch(wal, vec![(record, response)]),
        WalCommand::Compact { records, response } => {
            let _ = response.send(wal.compact(&records));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

// ── Engine state ─────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// How long a fanned-out notification stays visible.
    pub notification_ttl_ms: Ms,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            notification_ttl_ms: 30 * DAY_MS,
        }
    }
}

/// All events. Title-per-day uniqueness is checked against this under its write lock.
#[derive(Debug, Default)]
pub(super) struct Calendar {
    pub(super) events: HashMap<Uuid, Event>,
}

impl Calendar {
    pub(super) fn title_taken(&self, title: &str, day: i64, exclude: Option<Uuid>) -> bool {
        self.events.values().any(|e| {
            Some(e.id) != exclude && e.title == title && calendar_day(e.start_date) == day
        })
    }
}

#[derive(Debug, Default)]
pub(super) struct NotificationBoard {
    pub(super) notifications: HashMap<Uuid, Notification>,
    /// user id → notification id → read_at
    pub(super) reads: HashMap<Uuid, HashMap<Uuid, Ms>>,
}

impl NotificationBoard {
    pub(super) fn is_read(&self, user_id: Uuid, notification_id: Uuid) -> bool {
        self.reads
            .get(&user_id)
            .is_some_and(|read| read.contains_key(&notification_id))
    }

    /// Notifications visible at `now` and addressed to one of `groups`.
    pub(super) fn visible_for<'a>(
        &'a self,
        groups: &'a [TargetGroup],
        now: Ms,
    ) -> impl Iterator<Item = &'a Notification> + 'a {
        self.notifications
            .values()
            .filter(move |n| groups.contains(&n.target_group) && n.is_visible_at(now))
    }
}

pub struct Engine {
    pub(super) rooms: DashMap<Uuid, SharedRoomState>,
    /// booking id → room id
    pub(super) booking_to_room: DashMap<Uuid, Uuid>,
    /// event id → ids of bookings linked to it
    pub(super) event_bookings: DashMap<Uuid, Vec<Uuid>>,
    pub(super) calendar: RwLock<Calendar>,
    pub(super) board: RwLock<NotificationBoard>,
    pub(super) users: DashMap<Uuid, User>,
    /// Held shared by every mutation from first lock to last apply, and
    /// exclusively by compaction so its snapshot matches the log.
    pub(super) commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) audit: Arc<dyn AuditSink>,
    pub(super) settings: EngineSettings,
}

/// Apply a booking or room record. Caller holds the room lock.
fn apply_to_room(
    rs: &mut RoomState,
    record: &Record,
    booking_to_room: &DashMap<Uuid, Uuid>,
    event_bookings: &DashMap<Uuid, Vec<Uuid>>,
) {
    match record {
        Record::BookingCreated { booking } => {
            booking_to_room.insert(booking.id, booking.room_id);
            if let Some(event_id) = booking.event_id {
                event_bookings.entry(event_id).or_default().push(booking.id);
            }
            rs.insert_booking(booking.clone());
        }
        Record::BookingStatusChanged {
            id,
            status,
            notes,
            at,
            ..
        } => {
            if let Some(booking) = rs.booking_mut(*id) {
                booking.status = *status;
                if notes.is_some() {
                    booking.notes = notes.clone();
                }
                booking.last_updated_at = *at;
            }
        }
        Record::BookingDeleted { id, .. } => {
            if let Some(booking) = rs.remove_booking(*id) {
                booking_to_room.remove(id);
                if let Some(event_id) = booking.event_id
                    && let Some(mut linked) = event_bookings.get_mut(&event_id)
                {
                    linked.retain(|b| b != id);
                }
            }
        }
        Record::RoomUpdated { room } => rs.room = room.clone(),
        _ => {}
    }
}

fn apply_to_calendar(
    calendar: &mut Calendar,
    record: &Record,
    event_bookings: &DashMap<Uuid, Vec<Uuid>>,
) {
    match record {
        Record::EventCreated { event } | Record::EventUpdated { event } => {
            calendar.events.insert(event.id, event.clone());
        }
        Record::EventDeleted { id } => {
            calendar.events.remove(id);
            event_bookings.remove(id);
        }
        _ => {}
    }
}

fn apply_to_board(board: &mut NotificationBoard, record: &Record) {
    match record {
        Record::NotificationCreated { notification } | Record::NotificationUpdated { notification } => {
            board
                .notifications
                .insert(notification.id, notification.clone());
        }
        Record::NotificationDeleted { id } => {
            board.notifications.remove(id);
            for read in board.reads.values_mut() {
                read.remove(id);
            }
        }
        Record::NotificationsExpired { ids } => {
            for id in ids {
                if let Some(n) = board.notifications.get_mut(id) {
                    n.status = NotificationStatus::Expired;
                }
            }
        }
        Record::NotificationsRead {
            user_id,
            notification_ids,
            read_at,
        } => {
            let read = board.reads.entry(*user_id).or_default();
            for id in notification_ids {
                read.entry(*id).or_insert(*read_at);
            }
        }
        _ => {}
    }
}

/// Room a booking-level record belongs to.
fn record_room_id(record: &Record) -> Option<Uuid> {
    match record {
        Record::BookingCreated { booking } => Some(booking.room_id),
        Record::BookingStatusChanged { room_id, .. } | Record::BookingDeleted { room_id, .. } => {
            Some(*room_id)
        }
        Record::RoomUpdated { room } => Some(room.id),
        _ => None,
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        audit: Arc<dyn AuditSink>,
        settings: EngineSettings,
    ) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut engine = Self {
            rooms: DashMap::new(),
            booking_to_room: DashMap::new(),
            event_bookings: DashMap::new(),
            calendar: RwLock::new(Calendar::default()),
            board: RwLock::new(NotificationBoard::default()),
            users: DashMap::new(),
            commit_gate: RwLock::new(()),
            wal_tx,
            notify,
            audit,
            settings,
        };
        for record in &replay.records {
            engine.replay_record(record);
        }
        tracing::info!(
            records = replay.records.len(),
            rooms = engine.rooms.len(),
            users = engine.users.len(),
            "restored state from {}",
            wal_path.display()
        );
        Ok(engine)
    }

    /// We are the sole owner of every lock during replay, so `try_*` always succeeds.
    fn replay_record(&mut self, record: &Record) {
        match record {
            Record::RoomCreated { room } => {
                self.rooms
                    .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
            }
            Record::RoomDeleted { id } => {
                if let Some(rs) = self.get_room(id)
                    && let Ok(guard) = rs.try_read()
                {
                    self.forget_room(&guard);
                }
            }
            Record::UserUpserted { user } => {
                self.users.insert(user.id, user.clone());
            }
            Record::EventCreated { .. } | Record::EventUpdated { .. } | Record::EventDeleted { .. } => {
                apply_to_calendar(self.calendar.get_mut(), record, &self.event_bookings);
            }
            Record::NotificationCreated { .. }
            | Record::NotificationUpdated { .. }
            | Record::NotificationDeleted { .. }
            | Record::NotificationsExpired { .. }
            | Record::NotificationsRead { .. } => apply_to_board(self.board.get_mut(), record),
            other => {
                if let Some(room_id) = record_room_id(other)
                    && let Some(rs) = self.get_room(&room_id)
                    && let Ok(mut guard) = rs.try_write()
                {
                    apply_to_room(&mut guard, other, &self.booking_to_room, &self.event_bookings);
                }
            }
        }
    }

    /// Write a record through the background group-commit writer.
    async fn wal_append(&self, record: &Record) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record: record.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_room(&self, id: &Uuid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn room_for_booking(&self, booking_id: &Uuid) -> Option<Uuid> {
        self.booking_to_room.get(booking_id).map(|e| *e.value())
    }

    /// Drop a room and every index entry pointing into it.
    fn forget_room(&self, rs: &RoomState) {
        for booking in &rs.bookings {
            self.booking_to_room.remove(&booking.id);
            if let Some(event_id) = booking.event_id
                && let Some(mut linked) = self.event_bookings.get_mut(&event_id)
            {
                linked.retain(|b| *b != booking.id);
            }
        }
        self.rooms.remove(&rs.room.id);
    }

    pub(super) async fn persist_room(
        &self,
        rs: &mut RoomState,
        record: &Record,
    ) -> Result<(), EngineError> {
        self.wal_append(record).await?;
        apply_to_room(rs, record, &self.booking_to_room, &self.event_bookings);
        Ok(())
    }

    pub(super) async fn persist_calendar(
        &self,
        calendar: &mut Calendar,
        record: &Record,
    ) -> Result<(), EngineError> {
        self.wal_append(record).await?;
        apply_to_calendar(calendar, record, &self.event_bookings);
        Ok(())
    }

    pub(super) async fn persist_board(
        &self,
        board: &mut NotificationBoard,
        record: &Record,
    ) -> Result<(), EngineError> {
        self.wal_append(record).await?;
        apply_to_board(board, record);
        Ok(())
    }

    /// Lookup booking → room, acquire the room's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Uuid,
    ) -> Result<(Uuid, OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let room_id = self
            .room_for_booking(booking_id)
            .ok_or(EngineError::NotFound(Entity::Booking, *booking_id))?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(Entity::Room, room_id))?;
        Ok((room_id, rs.write_owned().await))
    }

    /// Hand an entry to the audit sink, resolving the actor's display name.
    pub(super) fn record_audit(
        &self,
        actor_id: Uuid,
        subject_type: SubjectType,
        subject_id: Uuid,
        subject_title: &str,
        action: AuditAction,
        change_summary: Option<String>,
    ) {
        let actor_name = self
            .users
            .get(&actor_id)
            .map(|u| u.full_name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| UNKNOWN_ACTOR.to_string());
        metrics::counter!(
            observability::AUDIT_ENTRIES_TOTAL,
            "action" => format!("{action:?}"),
        )
        .increment(1);
        self.audit.record(AuditEntry {
            actor_id,
            actor_name,
            subject_id,
            subject_type,
            subject_title: subject_title.to_string(),
            action,
            timestamp: now_ms(),
            change_summary,
        });
    }
}

use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use tracing::info;
use uuid::Uuid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, Entity, WalCommand};

fn room_name(name: &str) -> Result<String, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::Validation("room name is required".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("room name too long"));
    }
    Ok(name.to_string())
}

impl Engine {
    pub async fn create_room(
        &self,
        id: Option<Uuid>,
        name: &str,
        capacity: u32,
        status: RoomStatus,
    ) -> Result<Room, EngineError> {
        let name = room_name(name)?;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        let id = id.unwrap_or_else(Uuid::new_v4);

        let _commit = self.commit_gate.read().await;
        if self.rooms.contains_key(&id) {
            return Err(EngineError::Conflict(format!("room {id} already exists")));
        }
        let room = Room {
            id,
            name,
            capacity,
            status,
        };
        self.wal_append(&Record::RoomCreated { room: room.clone() })
            .await?;
        self.rooms
            .insert(id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
        info!(room_id = %id, name = %room.name, "room created");
        Ok(room)
    }

    pub async fn update_room(&self, id: Uuid, patch: RoomPatch) -> Result<Room, EngineError> {
        let _commit = self.commit_gate.read().await;
        let rs = self
            .get_room(&id)
            .ok_or(EngineError::NotFound(Entity::Room, id))?;
        let mut guard = rs.write().await;
        if !self.rooms.contains_key(&id) {
            return Err(EngineError::NotFound(Entity::Room, id));
        }
        let mut room = guard.room.clone();
        if let Some(name) = patch.name {
            room.name = room_name(&name)?;
        }
        if let Some(capacity) = patch.capacity {
            room.capacity = capacity;
        }
        if let Some(status) = patch.status {
            room.status = status;
        }
        self.persist_room(&mut guard, &Record::RoomUpdated { room: room.clone() })
            .await?;
        Ok(room)
    }

    /// Rooms holding Pending or Approved bookings cannot be removed.
    pub async fn delete_room(&self, id: Uuid) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        let rs = self
            .get_room(&id)
            .ok_or(EngineError::NotFound(Entity::Room, id))?;
        let guard = rs.write().await;
        if !self.rooms.contains_key(&id) {
            return Err(EngineError::NotFound(Entity::Room, id));
        }
        if guard.has_active_bookings() {
            return Err(EngineError::InvalidState(
                "room has pending or approved bookings".into(),
            ));
        }
        self.wal_append(&Record::RoomDeleted { id }).await?;
        self.forget_room(&guard);
        info!(room_id = %id, "room deleted");
        Ok(())
    }

    /// Insert or replace a directory entry.
    pub async fn upsert_user(&self, user: User) -> Result<User, EngineError> {
        if user.full_name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("user name too long"));
        }
        if self.users.len() >= MAX_USERS && !self.users.contains_key(&user.id) {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        let _commit = self.commit_gate.read().await;
        self.wal_append(&Record::UserUpserted { user: user.clone() })
            .await?;
        self.users.insert(user.id, user.clone());
        Ok(user)
    }

    /// Rewrite the WAL as the minimal record set that rebuilds current state.
    /// Returns the number of records in the snapshot.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        // Exclusive gate: no mutation is between its WAL append and its apply.
        let _gate = self.commit_gate.write().await;
        let mut records = Vec::new();

        for user in self.users.iter() {
            records.push(Record::UserUpserted {
                user: user.value().clone(),
            });
        }

        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in rooms {
            let guard = rs.read().await;
            records.push(Record::RoomCreated {
                room: guard.room.clone(),
            });
            records.extend(guard.bookings.iter().map(|b| Record::BookingCreated {
                booking: b.clone(),
            }));
        }

        {
            let calendar = self.calendar.read().await;
            records.extend(
                calendar
                    .events
                    .values()
                    .map(|e| Record::EventCreated { event: e.clone() }),
            );
        }

        {
            let board = self.board.read().await;
            records.extend(board.notifications.values().map(|n| {
                Record::NotificationCreated {
                    notification: n.clone(),
                }
            }));
            for (user_id, read) in &board.reads {
                // Replay keeps the first read_at, so one record per instant preserves them all.
                let mut by_instant: Vec<(Ms, Uuid)> =
                    read.iter().map(|(id, at)| (*at, *id)).collect();
                by_instant.sort();
                for chunk in by_instant.chunk_by(|a, b| a.0 == b.0) {
                    records.push(Record::NotificationsRead {
                        user_id: *user_id,
                        notification_ids: chunk.iter().map(|(_, id)| *id).collect(),
                        read_at: chunk[0].0,
                    });
                }
            }
        }

        let count = records.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                records,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(records = count, "WAL compacted");
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

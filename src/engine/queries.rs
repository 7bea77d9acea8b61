use uuid::Uuid;

use crate::model::*;

use super::conflict::{find_conflict, now_ms};
use super::{Engine, SharedRoomState};

impl Engine {
    /// All rooms, by name.
    pub async fn list_rooms(&self) -> Vec<Room> {
        let shared: Vec<SharedRoomState> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::with_capacity(shared.len());
        for rs in shared {
            rooms.push(rs.read().await.room.clone());
        }
        rooms.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        rooms
    }

    /// Rooms with status Available and no approved booking overlapping `window`, by name.
    pub async fn available_rooms(&self, window: TimeInterval) -> Vec<Room> {
        let shared: Vec<SharedRoomState> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::new();
        for rs in shared {
            let guard = rs.read().await;
            if is_open(&guard, &window) {
                rooms.push(guard.room.clone());
            }
        }
        rooms.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        rooms
    }

    /// False for an unknown room or one that is not Available.
    pub async fn is_room_available(&self, room_id: Uuid, window: TimeInterval) -> bool {
        let Some(rs) = self.get_room(&room_id) else {
            return false;
        };
        let guard = rs.read().await;
        is_open(&guard, &window)
    }

    /// Bookings matching every set filter, latest start first.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Vec<Booking> {
        let shared: Vec<SharedRoomState> = match filter.room_id {
            Some(room_id) => self.get_room(&room_id).into_iter().collect(),
            None => self.rooms.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for rs in shared {
            let guard = rs.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| booking_matches(b, filter))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| {
            b.interval
                .start
                .cmp(&a.interval.start)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    /// Events matching `filter`, earliest start first.
    pub async fn list_events(&self, filter: &EventFilter) -> Vec<Event> {
        let now = now_ms();
        let calendar = self.calendar.read().await;
        let mut events: Vec<Event> = calendar
            .events
            .values()
            .filter(|e| filter.status.is_none_or(|s| e.status == s))
            .filter(|e| {
                !filter.upcoming_only || (e.status == EventStatus::Active && e.start_date > now)
            })
            .filter(|e| filter.from.is_none_or(|from| e.end_date >= from))
            .filter(|e| filter.to.is_none_or(|to| e.start_date <= to))
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            a.start_date
                .cmp(&b.start_date)
                .then_with(|| a.title.cmp(&b.title))
        });
        events
    }

    /// Every stored notification regardless of window or status, newest first.
    pub async fn list_notifications(&self) -> Vec<Notification> {
        let board = self.board.read().await;
        let mut all: Vec<Notification> = board.notifications.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }
}

fn is_open(rs: &RoomState, window: &TimeInterval) -> bool {
    rs.room.status == RoomStatus::Available && find_conflict(rs, window, None).is_none()
}

fn booking_matches(b: &Booking, filter: &BookingFilter) -> bool {
    filter.user_id.is_none_or(|id| b.user_id == id)
        && filter.event_id.is_none_or(|id| b.event_id == Some(id))
        && filter.status.is_none_or(|s| b.status == s)
        && filter.from.is_none_or(|from| b.interval.end >= from)
        && filter.to.is_none_or(|to| b.interval.start <= to)
}

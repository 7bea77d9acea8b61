//! Point lookups the lifecycle code and outer layers read through.

use uuid::Uuid;

use crate::model::*;

use super::Engine;

impl Engine {
    pub async fn find_room(&self, id: Uuid) -> Option<Room> {
        let rs = self.get_room(&id)?;
        let guard = rs.read().await;
        Some(guard.room.clone())
    }

    /// Approved bookings of a room in start order. Empty for an unknown room.
    pub async fn list_approved_bookings(&self, room_id: Uuid) -> Vec<Booking> {
        let Some(rs) = self.get_room(&room_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        guard
            .bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Approved)
            .cloned()
            .collect()
    }

    pub async fn find_booking(&self, id: Uuid) -> Option<Booking> {
        let rs = self.get_room(&self.room_for_booking(&id)?)?;
        let guard = rs.read().await;
        guard.booking(id).cloned()
    }

    pub async fn find_event(&self, id: Uuid) -> Option<Event> {
        self.calendar.read().await.events.get(&id).cloned()
    }

    pub fn find_user(&self, id: Uuid) -> Option<User> {
        self.users.get(&id).map(|u| u.value().clone())
    }

    pub fn list_active_users(&self) -> Vec<User> {
        self.users
            .iter()
            .filter(|u| u.is_active())
            .map(|u| u.value().clone())
            .collect()
    }

    /// Active users holding at least one of `roles`.
    pub fn list_users_by_roles(&self, roles: &[Role]) -> Vec<User> {
        self.users
            .iter()
            .filter(|u| u.is_active() && roles.iter().any(|r| u.has_role(*r)))
            .map(|u| u.value().clone())
            .collect()
    }
}

use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditAction, SubjectType};
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, find_conflict, now_ms, validate_interval};
use super::lifecycle::{allowed_transitions, check_transition};
use super::{Engine, EngineError, Entity};

impl Engine {
    /// Read-only conflict query. An unknown room has no conflicts.
    pub async fn has_conflict(
        &self,
        room_id: Uuid,
        candidate: TimeInterval,
        exclude: Option<Uuid>,
    ) -> bool {
        let Some(rs) = self.get_room(&room_id) else {
            return false;
        };
        let guard = rs.read().await;
        find_conflict(&guard, &candidate, exclude).is_some()
    }

    /// Request a room. The booking starts out Pending.
    pub async fn create_booking(
        &self,
        user_id: Uuid,
        req: NewBooking,
    ) -> Result<Booking, EngineError> {
        let purpose = req.purpose.trim();
        if purpose.is_empty() {
            return Err(EngineError::Validation("booking purpose is required".into()));
        }
        if purpose.len() > MAX_PURPOSE_LEN {
            return Err(EngineError::LimitExceeded("purpose too long"));
        }
        if req.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        let interval = TimeInterval::try_new(req.start, req.end).ok_or_else(|| {
            EngineError::Validation("end time must be after start time".into())
        })?;
        validate_interval(&interval)?;

        let _commit = self.commit_gate.read().await;
        // Holding the calendar keeps a linked event alive until the booking is committed.
        let _calendar = match req.event_id {
            Some(event_id) => {
                let calendar = self.calendar.read().await;
                if !calendar.events.contains_key(&event_id) {
                    return Err(EngineError::NotFound(Entity::Event, event_id));
                }
                Some(calendar)
            }
            None => None,
        };

        let rs = self
            .get_room(&req.room_id)
            .ok_or(EngineError::NotFound(Entity::Room, req.room_id))?;
        let mut guard = rs.write().await;
        // The room may have been deleted while we waited for its lock.
        if !self.rooms.contains_key(&req.room_id) {
            return Err(EngineError::NotFound(Entity::Room, req.room_id));
        }
        if guard.room.status != RoomStatus::Available {
            return Err(EngineError::InvalidState(format!(
                "room '{}' is {}, not available",
                guard.room.name, guard.room.status
            )));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        if let Err(e) = check_no_conflict(&guard, &interval, None) {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let now = now_ms();
        let booking = Booking {
            id: Uuid::new_v4(),
            room_id: req.room_id,
            user_id,
            event_id: req.event_id,
            interval,
            status: BookingStatus::Pending,
            purpose: purpose.to_string(),
            notes: req.notes,
            created_at: now,
            last_updated_at: now,
        };
        self.persist_room(
            &mut guard,
            &Record::BookingCreated {
                booking: booking.clone(),
            },
        )
        .await?;
        drop(guard);

        metrics::counter!(observability::BOOKING_TRANSITIONS_TOTAL, "status" => "Pending")
            .increment(1);
        info!(booking_id = %booking.id, room_id = %booking.room_id, %user_id, "booking requested");
        self.record_audit(
            user_id,
            SubjectType::Booking,
            booking.id,
            &booking.purpose,
            AuditAction::Create,
            Some(format!(
                "Room: {}; Time: {} -> {}",
                booking.room_id,
                format_ms(booking.interval.start),
                format_ms(booking.interval.end)
            )),
        );
        Ok(booking)
    }

    /// Move a booking through its lifecycle. Approval re-checks the room under its
    /// write lock, so two overlapping bookings can never both end up Approved.
    pub async fn update_booking_status(
        &self,
        id: Uuid,
        actor_id: Uuid,
        change: BookingStatusChange,
    ) -> Result<Booking, EngineError> {
        if change.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }

        let _commit = self.commit_gate.read().await;
        // Event links are immutable. Linked bookings change status under the calendar read lock.
        let linked_event = self.find_booking(id).await.and_then(|b| b.event_id);
        let _calendar = match linked_event {
            Some(_) => Some(self.calendar.read().await),
            None => None,
        };
        let (room_id, mut guard) = self.resolve_booking_write(&id).await?;
        let current = guard
            .booking(id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Booking, id))?;
        check_transition(current.status, change.status, change.force)?;
        if change.status == BookingStatus::Approved && current.status != BookingStatus::Approved {
            if let Err(e) = check_no_conflict(&guard, &current.interval, Some(id)) {
                metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                return Err(e);
            }
        }
        if change.force
            && current.status != change.status
            && !allowed_transitions(current.status).contains(&change.status)
        {
            warn!(booking_id = %id, %actor_id, "forced booking transition {} -> {}", current.status, change.status);
        }

        let record = Record::BookingStatusChanged {
            id,
            room_id,
            status: change.status,
            notes: change.notes,
            at: now_ms(),
        };
        self.persist_room(&mut guard, &record).await?;
        let updated = guard
            .booking(id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Booking, id))?;
        drop(guard);

        metrics::counter!(
            observability::BOOKING_TRANSITIONS_TOTAL,
            "status" => updated.status.as_str(),
        )
        .increment(1);
        info!(booking_id = %id, %room_id, "booking {} -> {}", current.status, updated.status);
        self.record_audit(
            actor_id,
            SubjectType::Booking,
            id,
            &updated.purpose,
            AuditAction::Update,
            Some(format!("Status: {} -> {}", current.status, updated.status)),
        );
        Ok(updated)
    }

    /// Remove a booking regardless of its status.
    pub async fn delete_booking(&self, id: Uuid, actor_id: Uuid) -> Result<Booking, EngineError> {
        let _commit = self.commit_gate.read().await;
        let (room_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard
            .booking(id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Booking, id))?;
        self.persist_room(&mut guard, &Record::BookingDeleted { id, room_id })
            .await?;
        drop(guard);

        info!(booking_id = %id, %room_id, status = %booking.status, "booking deleted");
        self.record_audit(
            actor_id,
            SubjectType::Booking,
            id,
            &booking.purpose,
            AuditAction::Delete,
            None,
        );
        Ok(booking)
    }
}

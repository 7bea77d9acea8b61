use std::fmt::Display;

use chrono::DateTime;
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditAction, SubjectType};
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::now_ms;
use super::{Engine, EngineError, Entity};

/// `Field: old -> new` entries joined with `"; "`.
#[derive(Debug, Default)]
struct ChangeSet(Vec<String>);

impl ChangeSet {
    fn quoted(&mut self, field: &str, old: Option<&str>, new: &str) {
        self.0
            .push(format!("{field}: '{}' -> '{new}'", old.unwrap_or_default()));
    }

    fn plain(&mut self, field: &str, old: impl Display, new: impl Display) {
        self.0.push(format!("{field}: {old} -> {new}"));
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn summary(&self) -> String {
        self.0.join("; ")
    }
}

fn check_len(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn duplicate_title(title: &str, start_date: Ms) -> EngineError {
    let day = DateTime::from_timestamp_millis(start_date)
        .map(|dt| dt.date_naive().to_string())
        .unwrap_or_else(|| start_date.to_string());
    EngineError::Conflict(format!(
        "event with title '{title}' already exists on {day}"
    ))
}

impl Engine {
    pub async fn create_event(&self, admin_id: Uuid, req: NewEvent) -> Result<Event, EngineError> {
        let title = req.title.trim();
        if title.is_empty() {
            return Err(EngineError::Validation("event title is required".into()));
        }
        let start_date = req
            .start_date
            .ok_or_else(|| EngineError::Validation("start date is required".into()))?;
        let end_date = req
            .end_date
            .ok_or_else(|| EngineError::Validation("end date is required".into()))?;
        if end_date <= start_date {
            return Err(EngineError::Validation(
                "end date must be after start date".into(),
            ));
        }
        check_len(Some(title), MAX_TITLE_LEN, "title too long")?;
        check_len(req.description.as_deref(), MAX_DESCRIPTION_LEN, "description too long")?;
        check_len(req.location.as_deref(), MAX_LOCATION_LEN, "location too long")?;
        check_len(
            req.recurrence_rule.as_deref(),
            MAX_RECURRENCE_RULE_LEN,
            "recurrence rule too long",
        )?;

        let _commit = self.commit_gate.read().await;
        let mut calendar = self.calendar.write().await;
        if calendar.events.len() >= MAX_EVENTS {
            return Err(EngineError::LimitExceeded("too many events"));
        }
        if calendar.title_taken(title, calendar_day(start_date), None) {
            return Err(duplicate_title(title, start_date));
        }

        let now = now_ms();
        let event = Event {
            id: Uuid::new_v4(),
            title: title.to_string(),
            description: req.description,
            start_date,
            end_date,
            location: req.location,
            status: req.status.unwrap_or(EventStatus::Active),
            visibility: req.visibility.unwrap_or(true),
            audience: req.audience.unwrap_or(TargetGroup::All),
            recurrence_rule: req.recurrence_rule,
            created_by: admin_id,
            created_at: now,
            last_updated_at: now,
        };
        self.persist_calendar(
            &mut calendar,
            &Record::EventCreated {
                event: event.clone(),
            },
        )
        .await?;
        drop(calendar);

        metrics::counter!(observability::EVENTS_TOTAL, "action" => "create").increment(1);
        info!(event_id = %event.id, title = %event.title, "event created");
        self.announce(
            admin_id,
            event.audience,
            "New Event Created",
            format!("A new event '{}' has been created.", event.title),
        )
        .await;
        self.record_audit(
            admin_id,
            SubjectType::Event,
            event.id,
            &event.title,
            AuditAction::Create,
            None,
        );
        Ok(event)
    }

    /// Apply the present fields of `patch`. Announces only real changes; the
    /// audit entry is written either way.
    pub async fn update_event(
        &self,
        id: Uuid,
        admin_id: Uuid,
        patch: EventPatch,
    ) -> Result<Event, EngineError> {
        if patch.title.as_ref().is_some_and(|t| t.trim().is_empty()) {
            return Err(EngineError::Validation("event title cannot be empty".into()));
        }
        check_len(patch.title.as_deref(), MAX_TITLE_LEN, "title too long")?;
        check_len(patch.description.as_deref(), MAX_DESCRIPTION_LEN, "description too long")?;
        check_len(patch.location.as_deref(), MAX_LOCATION_LEN, "location too long")?;
        check_len(
            patch.recurrence_rule.as_deref(),
            MAX_RECURRENCE_RULE_LEN,
            "recurrence rule too long",
        )?;

        let _commit = self.commit_gate.read().await;
        let mut calendar = self.calendar.write().await;
        let current = calendar
            .events
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Event, id))?;

        let mut next = current.clone();
        let mut changes = ChangeSet::default();
        if let Some(title) = patch.title.map(|t| t.trim().to_string())
            && title != current.title
        {
            changes.quoted("Title", Some(&current.title), &title);
            next.title = title;
        }
        if let Some(description) = patch.description
            && current.description.as_deref() != Some(description.as_str())
        {
            changes.quoted("Description", current.description.as_deref(), &description);
            next.description = Some(description);
        }
        if let Some(start_date) = patch.start_date
            && start_date != current.start_date
        {
            changes.plain("StartDate", format_ms(current.start_date), format_ms(start_date));
            next.start_date = start_date;
        }
        if let Some(end_date) = patch.end_date
            && end_date != current.end_date
        {
            changes.plain("EndDate", format_ms(current.end_date), format_ms(end_date));
            next.end_date = end_date;
        }
        if let Some(location) = patch.location
            && current.location.as_deref() != Some(location.as_str())
        {
            changes.quoted("Location", current.location.as_deref(), &location);
            next.location = Some(location);
        }
        if let Some(status) = patch.status
            && status != current.status
        {
            changes.plain("Status", current.status, status);
            next.status = status;
        }
        if let Some(visibility) = patch.visibility
            && visibility != current.visibility
        {
            changes.plain("Visibility", current.visibility, visibility);
            next.visibility = visibility;
        }
        if let Some(audience) = patch.audience
            && audience != current.audience
        {
            changes.plain("Audience", current.audience, audience);
            next.audience = audience;
        }
        if let Some(rule) = patch.recurrence_rule
            && current.recurrence_rule.as_deref() != Some(rule.as_str())
        {
            changes.quoted("RecurrenceRule", current.recurrence_rule.as_deref(), &rule);
            next.recurrence_rule = Some(rule);
        }

        if next.end_date <= next.start_date {
            return Err(EngineError::Validation(
                "end date must be after start date".into(),
            ));
        }
        let day = calendar_day(next.start_date);
        let key_changed = next.title != current.title || day != calendar_day(current.start_date);
        if key_changed && calendar.title_taken(&next.title, day, Some(id)) {
            return Err(duplicate_title(&next.title, next.start_date));
        }

        let summary = changes.summary();
        if !changes.is_empty() {
            next.last_updated_at = now_ms();
            self.persist_calendar(&mut calendar, &Record::EventUpdated { event: next.clone() })
                .await?;
        }
        drop(calendar);

        metrics::counter!(observability::EVENTS_TOTAL, "action" => "update").increment(1);
        if !changes.is_empty() {
            info!(event_id = %id, changes = %summary, "event updated");
            self.announce(
                admin_id,
                next.audience,
                "Event Updated",
                format!("Event '{}' has been updated. Changes: {summary}", next.title),
            )
            .await;
        }
        self.record_audit(
            admin_id,
            SubjectType::Event,
            id,
            &next.title,
            AuditAction::Update,
            (!summary.is_empty()).then_some(summary),
        );
        Ok(next)
    }

    /// Delete an event that has no Pending or Approved bookings.
    pub async fn delete_event(
        &self,
        id: Uuid,
        admin_id: Uuid,
        confirm: bool,
    ) -> Result<Event, EngineError> {
        let _commit = self.commit_gate.read().await;
        let mut calendar = self.calendar.write().await;
        let event = calendar
            .events
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Event, id))?;
        if !confirm {
            return Err(EngineError::Validation("deletion must be confirmed".into()));
        }

        // New links need the calendar read lock, so this list is stable while we hold it.
        let linked: Vec<Uuid> = self
            .event_bookings
            .get(&id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        for booking_id in linked {
            let Some(rs) = self
                .room_for_booking(&booking_id)
                .and_then(|room_id| self.get_room(&room_id))
            else {
                continue;
            };
            let guard = rs.read().await;
            if guard.booking(booking_id).is_some_and(|b| b.status.is_active()) {
                return Err(EngineError::InvalidState(
                    "cannot delete event with active bookings".into(),
                ));
            }
        }

        self.persist_calendar(&mut calendar, &Record::EventDeleted { id })
            .await?;
        drop(calendar);

        metrics::counter!(observability::EVENTS_TOTAL, "action" => "delete").increment(1);
        info!(event_id = %id, title = %event.title, "event deleted");
        self.announce(
            admin_id,
            event.audience,
            "Event Cancelled",
            format!("Event '{}' has been cancelled.", event.title),
        )
        .await;
        self.record_audit(
            admin_id,
            SubjectType::Event,
            id,
            &event.title,
            AuditAction::Delete,
            None,
        );
        Ok(event)
    }
}

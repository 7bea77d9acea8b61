use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::now_ms;
use super::{Engine, EngineError, Entity};

/// Outcome of a fan-out: the single stored notification and who it reaches.
#[derive(Debug, Clone)]
pub struct FanoutReport {
    pub notification: Notification,
    /// Active users in the target group when the notification was created.
    pub recipients: usize,
    /// Live subscribers woken by the broadcast.
    pub delivered: usize,
}

fn require_text(value: &str, what: &str, max: usize) -> Result<String, EngineError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EngineError::Validation(format!("notification {what} is required")));
    }
    if value.len() > max {
        return Err(EngineError::LimitExceeded("notification text too long"));
    }
    Ok(value.to_string())
}

impl Engine {
    /// Store one notification for `target_group`, visible from now for the configured TTL.
    pub async fn fanout(
        &self,
        created_by: Uuid,
        target_group: TargetGroup,
        title: &str,
        content: &str,
    ) -> Result<FanoutReport, EngineError> {
        let title = require_text(title, "title", MAX_TITLE_LEN)?;
        let content = require_text(content, "content", MAX_CONTENT_LEN)?;
        let _commit = self.commit_gate.read().await;
        self.publish(created_by, target_group, title, content, None)
            .await
    }

    /// Fan-out from inside another operation. Failures are logged, never returned.
    pub(super) async fn announce(
        &self,
        created_by: Uuid,
        audience: TargetGroup,
        title: &str,
        content: String,
    ) {
        if let Err(e) = self
            .publish(created_by, audience, title.to_string(), content, None)
            .await
        {
            metrics::counter!(observability::FANOUT_FAILURES_TOTAL).increment(1);
            warn!(%audience, "notification fan-out failed: {e}");
        }
    }

    /// Caller holds the commit gate.
    async fn publish(
        &self,
        created_by: Uuid,
        target_group: TargetGroup,
        title: String,
        content: String,
        window: Option<(Ms, Ms)>,
    ) -> Result<FanoutReport, EngineError> {
        let now = now_ms();
        let (start_date, end_date) =
            window.unwrap_or((now, now + self.settings.notification_ttl_ms));
        let notification = Notification {
            id: Uuid::new_v4(),
            title,
            content,
            target_group,
            start_date,
            end_date,
            status: NotificationStatus::Active,
            created_by,
            created_at: now,
        };
        {
            let mut board = self.board.write().await;
            if board.notifications.len() >= MAX_NOTIFICATIONS {
                return Err(EngineError::LimitExceeded("too many notifications"));
            }
            self.persist_board(
                &mut board,
                &Record::NotificationCreated {
                    notification: notification.clone(),
                },
            )
            .await?;
        }

        let recipients = match target_group.role() {
            None => self.list_active_users().len(),
            Some(role) => self.list_users_by_roles(&[role]).len(),
        };
        let delivered = if notification.is_visible_at(now) {
            self.notify.send(&notification)
        } else {
            0
        };
        metrics::counter!(
            observability::NOTIFICATIONS_TOTAL,
            "target_group" => target_group.as_str(),
        )
        .increment(1);
        debug!(
            notification_id = %notification.id,
            %target_group,
            recipients,
            delivered,
            "notification published: {}",
            notification.title
        );
        Ok(FanoutReport {
            notification,
            recipients,
            delivered,
        })
    }

    pub async fn create_notification(
        &self,
        admin_id: Uuid,
        req: NewNotification,
    ) -> Result<Notification, EngineError> {
        let title = require_text(&req.title, "title", MAX_TITLE_LEN)?;
        let content = require_text(&req.content, "content", MAX_CONTENT_LEN)?;
        if req.end_date <= req.start_date {
            return Err(EngineError::Validation(
                "end date must be after start date".into(),
            ));
        }
        if self.find_user(admin_id).is_none() {
            return Err(EngineError::NotFound(Entity::User, admin_id));
        }
        let _commit = self.commit_gate.read().await;
        let report = self
            .publish(
                admin_id,
                req.target_group,
                title,
                content,
                Some((req.start_date, req.end_date)),
            )
            .await?;
        Ok(report.notification)
    }

    pub async fn update_notification(
        &self,
        id: Uuid,
        patch: NotificationPatch,
    ) -> Result<Notification, EngineError> {
        let _commit = self.commit_gate.read().await;
        let mut board = self.board.write().await;
        let mut next = board
            .notifications
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Notification, id))?;
        if let Some(title) = patch.title {
            next.title = require_text(&title, "title", MAX_TITLE_LEN)?;
        }
        if let Some(content) = patch.content {
            next.content = require_text(&content, "content", MAX_CONTENT_LEN)?;
        }
        if let Some(group) = patch.target_group {
            next.target_group = group;
        }
        if let Some(start_date) = patch.start_date {
            next.start_date = start_date;
        }
        if let Some(end_date) = patch.end_date {
            next.end_date = end_date;
        }
        if let Some(status) = patch.status {
            next.status = status;
        }
        if next.end_date <= next.start_date {
            return Err(EngineError::Validation(
                "end date must be after start date".into(),
            ));
        }
        self.persist_board(
            &mut board,
            &Record::NotificationUpdated {
                notification: next.clone(),
            },
        )
        .await?;
        Ok(next)
    }

    pub async fn delete_notification(&self, id: Uuid) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        let mut board = self.board.write().await;
        if !board.notifications.contains_key(&id) {
            return Err(EngineError::NotFound(Entity::Notification, id));
        }
        self.persist_board(&mut board, &Record::NotificationDeleted { id })
            .await
    }

    /// Idempotent. Returns whether this call changed anything.
    pub async fn mark_as_read(
        &self,
        notification_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, EngineError> {
        if self.find_user(user_id).is_none() {
            return Err(EngineError::NotFound(Entity::User, user_id));
        }
        let _commit = self.commit_gate.read().await;
        let mut board = self.board.write().await;
        if !board.notifications.contains_key(&notification_id) {
            return Err(EngineError::NotFound(Entity::Notification, notification_id));
        }
        if board.is_read(user_id, notification_id) {
            return Ok(false);
        }
        self.persist_board(
            &mut board,
            &Record::NotificationsRead {
                user_id,
                notification_ids: vec![notification_id],
                read_at: now_ms(),
            },
        )
        .await?;
        Ok(true)
    }

    /// Mark every notification the user currently sees as read. Returns how many changed.
    pub async fn mark_all_as_read(&self, user_id: Uuid) -> Result<usize, EngineError> {
        let user = self
            .find_user(user_id)
            .ok_or(EngineError::NotFound(Entity::User, user_id))?;
        let groups = TargetGroup::eligible_for(&user.roles);

        let _commit = self.commit_gate.read().await;
        let mut board = self.board.write().await;
        let now = now_ms();
        let unread: Vec<Uuid> = board
            .visible_for(&groups, now)
            .filter(|n| !board.is_read(user_id, n.id))
            .map(|n| n.id)
            .collect();
        if unread.is_empty() {
            return Ok(0);
        }
        let count = unread.len();
        self.persist_board(
            &mut board,
            &Record::NotificationsRead {
                user_id,
                notification_ids: unread,
                read_at: now,
            },
        )
        .await?;
        debug!(%user_id, count, "marked notifications read");
        Ok(count)
    }

    /// Visible, eligible notifications the user has not read. Recomputed per call.
    pub async fn unread_count(&self, user_id: Uuid) -> Result<usize, EngineError> {
        let user = self
            .find_user(user_id)
            .ok_or(EngineError::NotFound(Entity::User, user_id))?;
        let groups = TargetGroup::eligible_for(&user.roles);
        let board = self.board.read().await;
        let now = now_ms();
        Ok(board
            .visible_for(&groups, now)
            .filter(|n| !board.is_read(user_id, n.id))
            .count())
    }

    /// The user's visible notifications, newest first, with read flags.
    pub async fn list_user_notifications(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<UserNotification>, EngineError> {
        let user = self
            .find_user(user_id)
            .ok_or(EngineError::NotFound(Entity::User, user_id))?;
        let groups = TargetGroup::eligible_for(&user.roles);
        let board = self.board.read().await;
        let now = now_ms();
        let mut list: Vec<UserNotification> = board
            .visible_for(&groups, now)
            .map(|n| UserNotification {
                notification: n.clone(),
                is_read: board.is_read(user_id, n.id),
            })
            .collect();
        list.sort_by(|a, b| {
            b.notification
                .created_at
                .cmp(&a.notification.created_at)
                .then_with(|| a.notification.id.cmp(&b.notification.id))
        });
        Ok(list)
    }

    /// Active notifications whose window ended before `now` become Expired.
    pub async fn expire_notifications(&self, now: Ms) -> Result<usize, EngineError> {
        let _commit = self.commit_gate.read().await;
        let mut board = self.board.write().await;
        let ids: Vec<Uuid> = board
            .notifications
            .values()
            .filter(|n| n.status == NotificationStatus::Active && n.end_date < now)
            .map(|n| n.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len();
        self.persist_board(&mut board, &Record::NotificationsExpired { ids })
            .await?;
        metrics::counter!(observability::NOTIFICATIONS_EXPIRED_TOTAL).increment(count as u64);
        info!(count, "expired notifications");
        Ok(count)
    }
}

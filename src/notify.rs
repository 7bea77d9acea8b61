use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Notification, TargetGroup};

const CHANNEL_CAPACITY: usize = 256;

/// Live delivery of freshly fanned-out notifications, one channel per target group.
///
/// Persistence is the engine's job; the hub only wakes up in-process subscribers.
/// A subscriber that lags past `CHANNEL_CAPACITY` sees `RecvError::Lagged` and
/// should fall back to listing its notifications.
pub struct NotifyHub {
    channels: DashMap<TargetGroup, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to one target group. Creates the channel if needed.
    pub fn subscribe(&self, group: TargetGroup) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(group)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Returns the number of receivers reached. No-op without subscribers.
    pub fn send(&self, notification: &Notification) -> usize {
        self.channels
            .get(&notification.target_group)
            .and_then(|sender| sender.send(notification.clone()).ok())
            .unwrap_or(0)
    }
}

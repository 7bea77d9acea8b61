//! Append-only record of administrative actions.
//!
//! The engine builds an [`AuditEntry`] for every create, update and delete of an
//! event or booking and hands it to an [`AuditSink`]. Sinks must not fail the
//! operation that produced the entry, so `record` has no error channel.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Ms, format_ms};

/// Display name used when the acting user is not in the directory.
pub const UNKNOWN_ACTOR: &str = "Unknown Admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubjectType {
    Event,
    Booking,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub actor_id: Uuid,
    pub actor_name: String,
    pub subject_id: Uuid,
    pub subject_type: SubjectType,
    pub subject_title: String,
    pub action: AuditAction,
    pub timestamp: Ms,
    pub change_summary: Option<String>,
}

impl std::fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} - Admin: {} ({}) - {:?} - {:?}: {} ({}) - Changes: {}",
            format_ms(self.timestamp),
            self.actor_name,
            self.actor_id,
            self.action,
            self.subject_type,
            self.subject_title,
            self.subject_id,
            self.change_summary.as_deref().unwrap_or("N/A"),
        )
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Emits each entry as a structured `tracing` event under the `audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        match serde_json::to_string(&entry) {
            Ok(json) => tracing::info!(
                target: "audit",
                actor_id = %entry.actor_id,
                subject_id = %entry.subject_id,
                action = ?entry.action,
                payload = %json,
                "{entry}"
            ),
            Err(e) => tracing::warn!(target: "audit", "failed to encode audit entry: {e}"),
        }
    }
}

/// Keeps entries in memory. Used by tests and embedders that read the log back.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        match self.entries.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditEntry) {
        match self.entries.lock() {
            Ok(mut guard) => guard.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}

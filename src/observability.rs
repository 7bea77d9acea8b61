use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "labdesk_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "labdesk_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: bookings entering a status (Pending on create). Labels: status.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "labdesk_booking_transitions_total";

/// Counter: create/approve attempts rejected for overlapping an approved booking.
pub const BOOKING_CONFLICTS_TOTAL: &str = "labdesk_booking_conflicts_total";

/// Counter: event lifecycle operations. Labels: action.
pub const EVENTS_TOTAL: &str = "labdesk_events_total";

/// Counter: notifications published. Labels: target_group.
pub const NOTIFICATIONS_TOTAL: &str = "labdesk_notifications_total";

/// Counter: notifications moved to Expired by the sweep.
pub const NOTIFICATIONS_EXPIRED_TOTAL: &str = "labdesk_notifications_expired_total";

/// Counter: fan-outs that failed after their triggering operation committed.
pub const FANOUT_FAILURES_TOTAL: &str = "labdesk_fanout_failures_total";

/// Counter: audit entries handed to the sink. Labels: action.
pub const AUDIT_ENTRIES_TOTAL: &str = "labdesk_audit_entries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "labdesk_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "labdesk_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "labdesk_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "labdesk_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "labdesk_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRoom { .. } => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::UpsertUser { .. } => "upsert_user",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBookingStatus { .. } => "update_booking_status",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::InsertEvent { .. } => "insert_event",
        Command::UpdateEvent { .. } => "update_event",
        Command::DeleteEvent { .. } => "delete_event",
        Command::InsertNotification { .. } => "insert_notification",
        Command::UpdateNotification { .. } => "update_notification",
        Command::DeleteNotification { .. } => "delete_notification",
        Command::MarkRead { .. } => "mark_read",
        Command::MarkAllRead { .. } => "mark_all_read",
        Command::ExpireNotifications => "expire_notifications",
        Command::SelectRooms => "select_rooms",
        Command::SelectAvailableRooms { .. } => "select_available_rooms",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectEvents { .. } => "select_events",
        Command::SelectNotifications { .. } => "select_notifications",
        Command::SelectUnreadCount { .. } => "select_unread_count",
        Command::SelectConflicts { .. } => "select_conflicts",
    }
}

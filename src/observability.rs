use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotd_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotd_connections_rejected_total";

/// Gauge: number of loaded conferences.
pub const TENANTS_ACTIVE: &str = "slotd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: schedule versions frozen.
pub const SCHEDULES_RELEASED_TOTAL: &str = "slotd_schedules_released_total";

/// Counter: notifications delivered to LISTENing connections.
pub const NOTIFICATIONS_DELIVERED_TOTAL: &str = "slotd_notifications_delivered_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
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
        Command::ConfigureConference { .. } => "configure_conference",
        Command::InsertOwner { .. } => "insert_owner",
        Command::DeleteOwner { .. } => "delete_owner",
        Command::InsertSubmission { .. } => "insert_submission",
        Command::UpdateSubmissionState { .. } => "update_submission_state",
        Command::InsertAvailability { .. } => "insert_availability",
        Command::BatchInsertAvailabilities { .. } => "batch_insert_availabilities",
        Command::DeleteAvailability { .. } => "delete_availability",
        Command::InsertSlot { .. } => "insert_slot",
        Command::UpdateSlot { .. } => "update_slot",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::Freeze { .. } => "freeze",
        Command::Unfreeze { .. } => "unfreeze",
        Command::SelectConference => "select_conference",
        Command::SelectOwners { .. } => "select_owners",
        Command::SelectSubmissions => "select_submissions",
        Command::SelectSchedules => "select_schedules",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectCommonAvailability { .. } => "select_common_availability",
        Command::SelectFreeTime { .. } => "select_free_time",
        Command::SelectChanges { .. } => "select_changes",
        Command::SelectNotifications { .. } => "select_notifications",
        Command::SelectWarnings { .. } => "select_warnings",
        Command::SelectTimetable { .. } => "select_timetable",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}

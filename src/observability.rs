use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "larder_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "larder_query_duration_seconds";

/// Counter: booking admissions. Labels: outcome (`admitted` or an error kind).
pub const ADMISSIONS_TOTAL: &str = "larder_admissions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "larder_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "larder_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "larder_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "larder_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "larder_wal_flush_batch_size";

// ── Outbox ──────────────────────────────────────────────────────

/// Counter: notices handed to the mailer. Labels: kind.
pub const NOTICES_DELIVERED_TOTAL: &str = "larder_notices_delivered_total";

/// Counter: notices given up on after retries. Labels: kind.
pub const NOTICES_FAILED_TOTAL: &str = "larder_notices_failed_total";

/// Counter: notices dropped because the outbox queue was full or closed.
pub const NOTICES_DROPPED_TOTAL: &str = "larder_notices_dropped_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRole { .. } => "insert_role",
        Command::InsertSlot { .. } => "insert_slot",
        Command::EditSlot { .. } => "edit_slot",
        Command::GrantTraining { .. } => "grant_training",
        Command::RevokeTraining { .. } => "revoke_training",
        Command::InsertHoliday { .. } => "insert_holiday",
        Command::DeleteHoliday { .. } => "delete_holiday",
        Command::InsertBooking { origin, .. } => match origin {
            crate::model::Origin::SelfService => "insert_booking",
            crate::model::Origin::Staff { .. } => "insert_staff_booking",
        },
        Command::InsertSeries { .. } => "insert_series",
        Command::DeleteSeries { .. } => "delete_series",
        Command::ResolveConflict { .. } => "resolve_conflict",
        Command::DecideBooking { .. } => "decide_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::CancelByToken { .. } => "cancel_by_token",
        Command::Reschedule { .. } => "reschedule",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectRequesterBookings { .. } => "select_requester_bookings",
        Command::SelectSlotBookings { .. } => "select_slot_bookings",
        Command::SelectCapacity { .. } => "select_capacity",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectRoles => "select_roles",
        Command::SelectSlots => "select_slots",
        Command::SelectHolidays => "select_holidays",
        Command::SelectSeries { .. } => "select_series",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}

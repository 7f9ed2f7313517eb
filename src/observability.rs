use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotkeeper_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotkeeper_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: appointments booked.
pub const BOOKINGS_TOTAL: &str = "slotkeeper_bookings_total";

/// Counter: booking attempts refused. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "slotkeeper_bookings_rejected_total";

/// Counter: availability windows touched by reconciliation. Labels: action.
pub const SLOT_MUTATIONS_TOTAL: &str = "slotkeeper_slot_mutations_total";

/// Counter: windows whose reservations exceeded the roster and were clamped.
pub const CAPACITY_CLAMPED_TOTAL: &str = "slotkeeper_capacity_clamped_total";

/// Counter: appointments processed by worker reassignment. Labels: outcome.
pub const REASSIGNMENTS_TOTAL: &str = "slotkeeper_reassignments_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotkeeper_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotkeeper_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotkeeper_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotkeeper_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "slotkeeper_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotkeeper_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotkeeper_wal_flush_batch_size";

/// Counter: journal compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotkeeper_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::GenerateSlots { .. } => "generate_slots",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectSlot { .. } => "select_slot",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectAppointment { .. } => "select_appointment",
        Command::SelectInternalEvents { .. } => "select_internal_events",
        Command::SelectInternalEvent { .. } => "select_internal_event",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::InsertReschedule { .. } => "reschedule",
        Command::InsertInternalEvent { .. } => "insert_internal_event",
        Command::DeleteInternalEvent { .. } => "delete_internal_event",
        Command::InsertAbsence { .. } => "reassign_worker",
    }
}

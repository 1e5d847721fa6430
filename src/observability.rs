use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "teesheet_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "teesheet_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "teesheet_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "teesheet_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "teesheet_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "teesheet_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "teesheet_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "teesheet_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "teesheet_wal_flush_batch_size";

// ── Slot ledger ─────────────────────────────────────────────────

/// Counter: slots created by materialization.
pub const SLOTS_MATERIALIZED_TOTAL: &str = "teesheet_slots_materialized_total";

/// Counter: capacity changes attempted. Labels: outcome
/// (applied, violation, busy, unknown_slot, error).
pub const CAPACITY_CHANGES_TOTAL: &str = "teesheet_capacity_changes_total";

/// Counter: slot lock acquisitions that gave up with `Busy`.
pub const LEDGER_BUSY_TOTAL: &str = "teesheet_ledger_busy_total";

// ── Capacity events ─────────────────────────────────────────────

/// Counter: redelivered capacity events skipped by the dedup ledger.
pub const DUPLICATE_EVENTS_TOTAL: &str = "teesheet_duplicate_events_total";

/// Counter: capacity events parked in the dead-letter list.
pub const DEAD_LETTERED_TOTAL: &str = "teesheet_dead_lettered_total";

/// Counter: capacity events refused because the tenant's queue was full.
pub const EVENTS_REJECTED_TOTAL: &str = "teesheet_events_rejected_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource { .. } => "insert_resource",
        Command::DeleteResource { .. } => "delete_resource",
        Command::SelectResources => "select_resources",
        Command::InsertTemplate { .. } => "insert_template",
        Command::UpdateTemplate { .. } => "update_template",
        Command::DeleteTemplate { .. } => "delete_template",
        Command::SelectTemplates { .. } => "select_templates",
        Command::GenerateSlots { .. } => "generate_slots",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectSlotDetail { .. } => "select_slot_detail",
        Command::InsertCapacityChange { .. } => "capacity_change",
        Command::InsertReservation { .. } => "reserve",
        Command::InsertRelease { .. } => "release",
        Command::InsertCapacityEvent { .. } => "capacity_event",
        Command::SelectDeadLetters => "select_dead_letters",
        Command::DeleteDeadLetter { .. } => "ack_dead_letter",
    }
}

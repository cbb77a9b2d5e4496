use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: op, status.
pub const COMMANDS_TOTAL: &str = "labgate_commands_total";

/// Histogram: command latency in seconds. Labels: op.
pub const COMMAND_DURATION_SECONDS: &str = "labgate_command_duration_seconds";

// ── Arbitration ─────────────────────────────────────────────────

/// Counter: requests filed. Labels: kind (booking, component).
pub const REQUESTS_SUBMITTED_TOTAL: &str = "labgate_requests_submitted_total";

/// Counter: committed status changes. Labels: kind, to.
pub const TRANSITIONS_TOTAL: &str = "labgate_transitions_total";

/// Counter: final approvals refused because the slot was taken.
pub const SLOT_CONFLICTS_TOTAL: &str = "labgate_slot_conflicts_total";

/// Counter: approvals or issues refused for lack of stock.
pub const INVENTORY_REJECTIONS_TOTAL: &str = "labgate_inventory_rejections_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "labgate_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "labgate_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "labgate_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "labgate_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "labgate_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "labgate_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

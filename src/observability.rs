use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "interlock_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "interlock_query_duration_seconds";

/// Counter: booking requests by outcome. Labels: outcome.
pub const BOOKING_REQUESTS_TOTAL: &str = "interlock_booking_requests_total";

/// Histogram: lock-to-durable time of a successful commit, in seconds.
pub const COMMIT_DURATION_SECONDS: &str = "interlock_commit_duration_seconds";

/// Histogram: time spent waiting for a resource's exclusion scope.
pub const LOCK_WAIT_SECONDS: &str = "interlock_lock_wait_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "interlock_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "interlock_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "interlock_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "interlock_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "interlock_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "interlock_wal_compactions_total";

/// Counter: confirmations the notifier failed to deliver.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "interlock_notifications_failed_total";

/// Counter: confirmations dropped because the queue was full or closed.
pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "interlock_notifications_dropped_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RequestBooking(_) => "request_booking",
        Command::ListBookings { .. } => "list_bookings",
        Command::ListResources => "list_resources",
        Command::CancelBooking { .. } => "cancel_booking",
    }
}

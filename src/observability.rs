use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "artslot_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "artslot_http_request_duration_seconds";

// ── Scheduling outcomes ─────────────────────────────────────────

/// Counter: holds placed.
pub const HOLDS_CREATED_TOTAL: &str = "artslot_holds_created_total";

/// Counter: requests rejected because the span was taken. Labels: op.
pub const CONFLICTS_TOTAL: &str = "artslot_conflicts_total";

/// Counter: holds turned into bookings.
pub const HOLDS_COMMITTED_TOTAL: &str = "artslot_holds_committed_total";

/// Counter: expired holds deleted by the sweeper.
pub const HOLDS_REAPED_TOTAL: &str = "artslot_holds_reaped_total";

/// Counter: booking status changes. Labels: from, to.
pub const TRANSITIONS_TOTAL: &str = "artslot_transitions_total";

/// Counter: bookings and sessions moved.
pub const RESCHEDULES_TOTAL: &str = "artslot_reschedules_total";

/// Counter: store calls retried after an infrastructure error. Labels: op.
pub const STORE_RETRIES_TOTAL: &str = "artslot_store_retries_total";

/// Counter: notifications the sink refused.
pub const NOTIFY_FAILURES_TOTAL: &str = "artslot_notify_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "artslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "artslot_wal_flush_batch_size";

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

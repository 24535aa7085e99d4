use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: route, status.
pub const REQUESTS_TOTAL: &str = "trimslot_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const REQUEST_DURATION_SECONDS: &str = "trimslot_request_duration_seconds";

/// Counter: bookings committed.
pub const BOOKINGS_TOTAL: &str = "trimslot_bookings_total";

/// Counter: allocation attempts rejected. Labels: reason.
pub const ALLOCATION_FAILURES_TOTAL: &str = "trimslot_allocation_failures_total";

/// Counter: approvals and cancellations. Labels: action.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "trimslot_booking_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: allocation attempts that lost the slot-lock race.
pub const LOCK_CONTENTION_TOTAL: &str = "trimslot_lock_contention_total";

/// Counter: expired slot locks swept by the reaper.
pub const LOCKS_REAPED_TOTAL: &str = "trimslot_locks_reaped_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "trimslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "trimslot_wal_flush_batch_size";

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

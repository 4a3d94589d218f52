use std::net::SocketAddr;

use crate::coordinator::BookingError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking attempts resolved. Labels: outcome.
pub const BOOKING_ATTEMPTS_TOTAL: &str = "pitstop_booking_attempts_total";

/// Histogram: booking attempt latency in seconds.
pub const BOOKING_ATTEMPT_DURATION_SECONDS: &str = "pitstop_booking_attempt_duration_seconds";

/// Counter: HTTP requests. Labels: op, status.
pub const HTTP_REQUESTS_TOTAL: &str = "pitstop_http_requests_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: day slot sets materialized.
pub const DAYS_MATERIALIZED_TOTAL: &str = "pitstop_days_materialized_total";

/// Counter: appointments committed.
pub const APPOINTMENTS_BOOKED_TOTAL: &str = "pitstop_appointments_booked_total";

/// Counter: appointments cancelled (slots released).
pub const APPOINTMENTS_CANCELLED_TOTAL: &str = "pitstop_appointments_cancelled_total";

/// Counter: provisional holds taken.
pub const HOLDS_TOTAL: &str = "pitstop_holds_total";

/// Counter: expired holds swept by the reaper.
pub const HOLDS_EXPIRED_TOTAL: &str = "pitstop_holds_expired_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "pitstop_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "pitstop_wal_flush_batch_size";

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

/// Map a booking outcome to a short label for metrics.
pub fn outcome_label(result: &Result<crate::model::Appointment, BookingError>) -> &'static str {
    match result {
        Ok(_) => "committed",
        Err(BookingError::SlotUnavailable) => "slot_unavailable",
        Err(BookingError::InsufficientConsecutiveCapacity { .. }) => "insufficient_consecutive",
        Err(BookingError::NonContiguousSlots) => "non_contiguous",
        Err(BookingError::UnknownStartSlot(_)) => "unknown_start_slot",
        Err(BookingError::InvalidRequest(_)) => "invalid_request",
        Err(BookingError::AttemptTimeout) => "attempt_timeout",
        Err(BookingError::Store(_)) => "store_error",
        Err(BookingError::Arbiter(_)) => "arbiter_error",
    }
}

use std::net::SocketAddr;
use std::time::Instant;

use crate::engine::EngineError;

// ── RED metrics (operation-driven) ──────────────────────────────

/// Counter: engine operations executed. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "torque_operations_total";

/// Histogram: operation latency in seconds, lock wait included. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "torque_operation_duration_seconds";

/// Counter: scheduling attempts rejected because a resource was busy.
pub const SCHEDULING_CONFLICTS_TOTAL: &str = "torque_scheduling_conflicts_total";

/// Counter: reservations rejected for lack of stock.
pub const STOCK_SHORTAGES_TOTAL: &str = "torque_stock_shortages_total";

/// Counter: work order state changes. Labels: to.
pub const JOB_TRANSITIONS_TOTAL: &str = "torque_job_transitions_total";

// ── USE metrics (journal) ───────────────────────────────────────

/// Histogram: journal group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "torque_wal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "torque_wal_flush_batch_size";

/// Counter: journal compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "torque_wal_compactions_total";

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

/// Count an engine operation by outcome and record its latency.
pub fn record_operation<T>(op: &'static str, started: Instant, result: &Result<T, EngineError>) {
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "status" => status_label(result)).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    match result {
        Err(EngineError::Conflict(_)) => {
            metrics::counter!(SCHEDULING_CONFLICTS_TOTAL).increment(1);
        }
        Err(EngineError::InsufficientStock { .. }) => {
            metrics::counter!(STOCK_SHORTAGES_TOTAL).increment(1);
        }
        _ => {}
    }
}

/// Short label for the `status` dimension of an operation outcome.
pub fn status_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => error_label(e),
    }
}

pub fn error_label(err: &EngineError) -> &'static str {
    match err {
        EngineError::NotFound(_) => "not_found",
        EngineError::AlreadyExists(_) => "already_exists",
        EngineError::Conflict(_) => "conflict",
        EngineError::InsufficientStock { .. } => "insufficient_stock",
        EngineError::WouldUnderflow { .. } => "would_underflow",
        EngineError::IllegalTransition { .. } => "illegal_transition",
        EngineError::ReservationsIncomplete(_) => "reservations_incomplete",
        EngineError::InvalidState { .. } => "invalid_state",
        EngineError::MissingCapability(_) => "missing_capability",
        EngineError::InvalidRequest(_) => "invalid_request",
        EngineError::LimitExceeded(_) => "limit_exceeded",
        EngineError::WalError(_) => "wal_error",
    }
}

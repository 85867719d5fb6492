use std::net::SocketAddr;

// ── Booking flow ────────────────────────────────────────────────

/// Counter: booking attempts by outcome. Labels: status
/// (`confirmed`, `invalid`, `not_found`, `conflict`, `error`).
pub const BOOKINGS_TOTAL: &str = "loaner_bookings_total";

/// Counter: availability searches answered. Labels: scope (`item`, `all`).
pub const AVAILABILITY_CHECKS_TOTAL: &str = "loaner_availability_checks_total";

// ── Store ───────────────────────────────────────────────────────

/// Histogram: store call latency in seconds. Labels: op.
pub const STORE_OP_DURATION_SECONDS: &str = "loaner_store_op_duration_seconds";

/// Counter: store calls that failed with a persistence error. Labels: op.
pub const STORE_OP_ERRORS_TOTAL: &str = "loaner_store_op_errors_total";

/// Counter: store calls cut off by the deadline. Labels: op.
pub const STORE_TIMEOUTS_TOTAL: &str = "loaner_store_timeouts_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "loaner_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "loaner_journal_flush_batch_size";

/// Counter: journal compactions run by the background compactor.
pub const JOURNAL_COMPACTIONS_TOTAL: &str = "loaner_journal_compactions_total";

// ── Mail ────────────────────────────────────────────────────────

/// Counter: messages accepted onto the queue.
pub const MAIL_ENQUEUED_TOTAL: &str = "loaner_mail_enqueued_total";

/// Counter: messages dropped because the queue was full or closed.
pub const MAIL_DROPPED_TOTAL: &str = "loaner_mail_dropped_total";

/// Counter: deliveries by outcome. Labels: status (`sent`, `failed`).
pub const MAIL_DELIVERIES_TOTAL: &str = "loaner_mail_deliveries_total";

// ── Calendar ────────────────────────────────────────────────────

/// Counter: manual blocks created by reconciliation.
pub const CALENDAR_BLOCKS_ADDED_TOTAL: &str = "loaner_calendar_blocks_added_total";

/// Counter: manual blocks removed by reconciliation.
pub const CALENDAR_BLOCKS_REMOVED_TOTAL: &str = "loaner_calendar_blocks_removed_total";

// ── Sessions ────────────────────────────────────────────────────

/// Gauge: live browsing sessions.
pub const SESSIONS_ACTIVE: &str = "loaner_sessions_active";

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

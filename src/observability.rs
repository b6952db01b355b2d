use std::net::SocketAddr;

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: appointments created. Labels: source (`panel` or `link`).
pub const APPOINTMENTS_CREATED_TOTAL: &str = "agenda_appointments_created_total";

/// Counter: bookings refused because of a padded overlap or a taken start.
pub const CONFLICTS_TOTAL: &str = "agenda_conflicts_total";

/// Counter: status transitions applied. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "agenda_transitions_total";

/// Counter: booking-link refusals. Labels: reason.
pub const LINK_REJECTIONS_TOTAL: &str = "agenda_link_rejections_total";

/// Counter: payment attempts. Labels: outcome (`recorded`, `duplicate`, `replayed`).
pub const PAYMENTS_TOTAL: &str = "agenda_payments_total";

// ── Locking ─────────────────────────────────────────────────────

/// Counter: day-lock acquisitions that hit their deadline.
pub const LOCK_TIMEOUTS_TOTAL: &str = "agenda_lock_timeouts_total";

/// Histogram: time spent acquiring day locks, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "agenda_lock_wait_seconds";

/// Gauge: day locks currently tracked across all tenants.
pub const DAY_LOCKS_TRACKED: &str = "agenda_day_locks_tracked";

// ── Storage ─────────────────────────────────────────────────────

/// Gauge: number of loaded tenants (engines).
pub const TENANTS_ACTIVE: &str = "agenda_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "agenda_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "agenda_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "agenda_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

//! Prometheus metrics for registration-service.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "registration_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Registrations by outcome (created, out_of_stock, cancelled, expired)
pub static REGISTRATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("registration_registrations_total", "Registrations by outcome"),
        &["outcome"]
    )
    .expect("Failed to register REGISTRATIONS_TOTAL")
});

/// Inventory movements (reserved, released, rejected)
pub static RESERVATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("registration_reservations_total", "Batch inventory movements"),
        &["action"]
    )
    .expect("Failed to register RESERVATIONS_TOTAL")
});

/// Applied payment transitions by source and target status
pub static PAYMENT_TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "registration_payment_transitions_total",
            "Payment attempt transitions"
        ),
        &["source", "status"]
    )
    .expect("Failed to register PAYMENT_TRANSITIONS_TOTAL")
});

/// Webhooks by provider and outcome (applied, duplicate, out_of_order, unknown, error)
pub static WEBHOOKS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("registration_webhooks_total", "Gateway webhooks received"),
        &["provider", "outcome"]
    )
    .expect("Failed to register WEBHOOKS_TOTAL")
});

/// Outbound gateway calls
pub static GATEWAY_CALLS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("registration_gateway_calls_total", "Outbound gateway calls"),
        &["operation", "outcome"]
    )
    .expect("Failed to register GATEWAY_CALLS_TOTAL")
});

/// Outbound gateway call duration
pub static GATEWAY_CALL_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "registration_gateway_call_duration_seconds",
            "Outbound gateway call duration",
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
        ),
        &["operation"]
    )
    .expect("Failed to register GATEWAY_CALL_DURATION")
});

/// Commission payouts by outcome (sent, failed, skipped)
pub static COMMISSIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("registration_commissions_total", "Commission payouts"),
        &["outcome"]
    )
    .expect("Failed to register COMMISSIONS_TOTAL")
});

/// Sweeper passes and the rows each one touched
pub static SWEEPER_RUNS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("registration_sweeper_runs_total", "Sweeper passes"),
        &["pass", "outcome"]
    )
    .expect("Failed to register SWEEPER_RUNS_TOTAL")
});

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&REGISTRATIONS_TOTAL);
    Lazy::force(&RESERVATIONS_TOTAL);
    Lazy::force(&PAYMENT_TRANSITIONS_TOTAL);
    Lazy::force(&WEBHOOKS_TOTAL);
    Lazy::force(&GATEWAY_CALLS_TOTAL);
    Lazy::force(&GATEWAY_CALL_DURATION);
    Lazy::force(&COMMISSIONS_TOTAL);
    Lazy::force(&SWEEPER_RUNS_TOTAL);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_registration(outcome: &str) {
    REGISTRATIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_reservation(action: &str, count: u64) {
    RESERVATIONS_TOTAL.with_label_values(&[action]).inc_by(count);
}

pub fn record_payment_transition(source: &str, status: &str) {
    PAYMENT_TRANSITIONS_TOTAL
        .with_label_values(&[source, status])
        .inc();
}

pub fn record_webhook(provider: &str, outcome: &str) {
    WEBHOOKS_TOTAL.with_label_values(&[provider, outcome]).inc();
}

pub fn record_gateway_call(operation: &str, outcome: &str, duration_secs: f64) {
    GATEWAY_CALLS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
    GATEWAY_CALL_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}

pub fn record_commission(outcome: &str) {
    COMMISSIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_sweep(pass: &str, outcome: &str, count: u64) {
    SWEEPER_RUNS_TOTAL
        .with_label_values(&[pass, outcome])
        .inc_by(count);
}

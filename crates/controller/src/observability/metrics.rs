//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `stoker_reconciliations_total` - Total number of reconciliations
//! - `stoker_reconciliation_errors_total` - Total number of reconciliation errors
//! - `stoker_reconciliation_duration_seconds` - Duration of reconciliation work units
//! - `stoker_requeues_total` - Requeues by trigger source
//! - `stoker_ref_resolutions_total` - Ref resolutions by outcome
//! - `stoker_ref_resolution_duration_seconds` - Duration of advertise-refs exchanges
//! - `stoker_webhook_requests_total` - Push receiver requests by status code
//! - `stoker_admission_reviews_total` - Admission reviews by decision
//! - `stoker_token_exchanges_total` - GitHub App token exchanges by outcome
//! - `stoker_discovered_gateways` - Gateways currently discovered across resources

use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stoker_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stoker_reconciliation_errors_total",
        "Total number of reconciliation errors",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "stoker_reconciliation_duration_seconds",
            "Duration of reconciliation work units in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new("stoker_requeues_total", "Requeues by trigger source"),
        &["trigger"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static REF_RESOLUTIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "stoker_ref_resolutions_total",
            "Git ref resolutions by outcome",
        ),
        &["outcome"],
    )
    .expect("Failed to create REF_RESOLUTIONS_TOTAL metric - this should never happen")
});

static REF_RESOLUTION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "stoker_ref_resolution_duration_seconds",
            "Duration of advertise-refs exchanges in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create REF_RESOLUTION_DURATION metric - this should never happen")
});

static WEBHOOK_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "stoker_webhook_requests_total",
            "Push receiver requests by response code",
        ),
        &["code"],
    )
    .expect("Failed to create WEBHOOK_REQUESTS_TOTAL metric - this should never happen")
});

static ADMISSION_REVIEWS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "stoker_admission_reviews_total",
            "Pod admission reviews by decision",
        ),
        &["decision"],
    )
    .expect("Failed to create ADMISSION_REVIEWS_TOTAL metric - this should never happen")
});

static TOKEN_EXCHANGES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "stoker_token_exchanges_total",
            "GitHub App token exchanges by outcome",
        ),
        &["outcome"],
    )
    .expect("Failed to create TOKEN_EXCHANGES_TOTAL metric - this should never happen")
});

static DISCOVERED_GATEWAYS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "stoker_discovered_gateways",
        "Gateways currently discovered across all resources",
    )
    .expect("Failed to create DISCOVERED_GATEWAYS metric - this should never happen")
});

/// Register every metric with the process registry; call once at startup
pub fn register_metrics() {
    let registry = &REGISTRY;
    let _ = registry.register(Box::new(RECONCILIATIONS_TOTAL.clone()));
    let _ = registry.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()));
    let _ = registry.register(Box::new(RECONCILIATION_DURATION.clone()));
    let _ = registry.register(Box::new(REQUEUES_TOTAL.clone()));
    let _ = registry.register(Box::new(REF_RESOLUTIONS_TOTAL.clone()));
    let _ = registry.register(Box::new(REF_RESOLUTION_DURATION.clone()));
    let _ = registry.register(Box::new(WEBHOOK_REQUESTS_TOTAL.clone()));
    let _ = registry.register(Box::new(ADMISSION_REVIEWS_TOTAL.clone()));
    let _ = registry.register(Box::new(TOKEN_EXCHANGES_TOTAL.clone()));
    let _ = registry.register(Box::new(DISCOVERED_GATEWAYS.clone()));
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(seconds: f64) {
    RECONCILIATION_DURATION.observe(seconds);
}

pub fn increment_requeues_total(trigger: &str) {
    REQUEUES_TOTAL.with_label_values(&[trigger]).inc();
}

pub fn increment_ref_resolutions(outcome: &str) {
    REF_RESOLUTIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn observe_ref_resolution_duration(seconds: f64) {
    REF_RESOLUTION_DURATION.observe(seconds);
}

pub fn increment_webhook_requests(code: u16) {
    WEBHOOK_REQUESTS_TOTAL
        .with_label_values(&[&code.to_string()])
        .inc();
}

pub fn increment_admission_reviews(decision: &str) {
    ADMISSION_REVIEWS_TOTAL.with_label_values(&[decision]).inc();
}

pub fn increment_token_exchanges(outcome: &str) {
    TOKEN_EXCHANGES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn set_discovered_gateways(count: i64) {
    DISCOVERED_GATEWAYS.set(count);
}

//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Swap lifecycle outcomes
//! - Ledger call latency and failures
//! - Rollback step outcomes
//! - Cache invalidation activity

use crate::error::EngineResult;

use axum::{routing::get, Json, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Swap lifecycle metrics
    pub static ref SWAPS_STARTED: CounterVec = register_counter_vec!(
        "bookswap_swaps_started_total",
        "Total swap executions started",
        &[]
    ).unwrap();

    pub static ref SWAPS_COMPLETED: CounterVec = register_counter_vec!(
        "bookswap_swaps_completed_total",
        "Total swap executions completed successfully",
        &[]
    ).unwrap();

    pub static ref SWAPS_ROLLED_BACK: CounterVec = register_counter_vec!(
        "bookswap_swaps_rolled_back_total",
        "Total swap executions fully rolled back",
        &[]
    ).unwrap();

    pub static ref SWAPS_STUCK: CounterVec = register_counter_vec!(
        "bookswap_swaps_stuck_total",
        "Total swap executions stuck awaiting manual intervention",
        &[]
    ).unwrap();

    pub static ref ACTIVE_SWAPS: GaugeVec = register_gauge_vec!(
        "bookswap_active_swaps",
        "Currently tracked non-terminal swap executions",
        &[]
    ).unwrap();

    // Step metrics
    pub static ref STEP_FAILURES: CounterVec = register_counter_vec!(
        "bookswap_step_failures_total",
        "Total forward step failures by step",
        &["step"]
    ).unwrap();

    pub static ref VALIDATION_FAILURES: CounterVec = register_counter_vec!(
        "bookswap_validation_failures_total",
        "Total precondition validation failures by rule",
        &["rule"]
    ).unwrap();

    // Ledger metrics
    pub static ref LEDGER_CALLS: CounterVec = register_counter_vec!(
        "bookswap_ledger_calls_total",
        "Total ledger gateway calls by operation and outcome",
        &["operation", "outcome"]
    ).unwrap();

    pub static ref LEDGER_LATENCY: HistogramVec = register_histogram_vec!(
        "bookswap_ledger_call_latency_seconds",
        "Ledger call latency",
        &["operation"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    // Rollback metrics
    pub static ref ROLLBACK_STEPS: CounterVec = register_counter_vec!(
        "bookswap_rollback_steps_total",
        "Total rollback steps by kind and outcome",
        &["kind", "outcome"]
    ).unwrap();

    // Cache metrics
    pub static ref CACHE_INVALIDATIONS: CounterVec = register_counter_vec!(
        "bookswap_cache_invalidations_total",
        "Total cache invalidations by cache",
        &["cache"]
    ).unwrap();

    pub static ref CACHE_INVALIDATION_FAILURES: CounterVec = register_counter_vec!(
        "bookswap_cache_invalidation_failures_total",
        "Total failed cache invalidations",
        &[]
    ).unwrap();

    // Alert metrics
    pub static ref CRITICAL_ALERTS: CounterVec = register_counter_vec!(
        "bookswap_critical_alerts_total",
        "Total critical alerts dispatched by kind",
        &["kind"]
    ).unwrap();

    // Sweep metrics
    pub static ref EXECUTIONS_CLEANED: CounterVec = register_counter_vec!(
        "bookswap_executions_cleaned_total",
        "Total settled executions removed by cleanup",
        &[]
    ).unwrap();

    pub static ref PROPOSALS_EXPIRED: CounterVec = register_counter_vec!(
        "bookswap_proposals_expired_total",
        "Total proposals marked expired by the sweep",
        &[]
    ).unwrap();
}

/// Prometheus metrics server with a basic health endpoint
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> EngineResult<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::error::SwapError::Internal(e.to_string()))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::error::SwapError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// Helper functions to record metrics

pub fn record_swap_started() {
    SWAPS_STARTED.with_label_values(&[]).inc();
}

pub fn record_swap_completed() {
    SWAPS_COMPLETED.with_label_values(&[]).inc();
}

pub fn record_swap_rolled_back() {
    SWAPS_ROLLED_BACK.with_label_values(&[]).inc();
}

pub fn record_swap_stuck() {
    SWAPS_STUCK.with_label_values(&[]).inc();
}

pub fn record_active_swaps(count: usize) {
    ACTIVE_SWAPS.with_label_values(&[]).set(count as f64);
}

pub fn record_step_failure(step: &str) {
    STEP_FAILURES.with_label_values(&[step]).inc();
}

pub fn record_validation_failure(rule: &str) {
    VALIDATION_FAILURES.with_label_values(&[rule]).inc();
}

pub fn record_ledger_call(operation: &str, outcome: &str, latency_secs: f64) {
    LEDGER_CALLS.with_label_values(&[operation, outcome]).inc();
    LEDGER_LATENCY
        .with_label_values(&[operation])
        .observe(latency_secs);
}

pub fn record_rollback_step(kind: &str, outcome: &str) {
    ROLLBACK_STEPS.with_label_values(&[kind, outcome]).inc();
}

pub fn record_cache_invalidation(cache: &str) {
    CACHE_INVALIDATIONS.with_label_values(&[cache]).inc();
}

pub fn record_cache_invalidation_failure() {
    CACHE_INVALIDATION_FAILURES.with_label_values(&[]).inc();
}

pub fn record_critical_alert(kind: &str) {
    CRITICAL_ALERTS.with_label_values(&[kind]).inc();
}

pub fn record_executions_cleaned(count: usize) {
    EXECUTIONS_CLEANED.with_label_values(&[]).inc_by(count as f64);
}

pub fn record_proposals_expired(count: u64) {
    PROPOSALS_EXPIRED.with_label_values(&[]).inc_by(count as f64);
}

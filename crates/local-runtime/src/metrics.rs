use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    static ref RUNS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::opts!("runs_total", "Finished runs per model and outcome"),
        &["model", "status"]
    )
    .expect("valid runs_total metric");
    static ref ACTIVE_RUNS: IntGaugeVec = IntGaugeVec::new(
        prometheus::opts!("active_runs", "Runs currently holding a concurrency slot"),
        &["model"]
    )
    .expect("valid active_runs metric");
    static ref MODEL_LOAD_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("model_load_seconds", "Time to launch, load and warm up a model")
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 180.0, 600.0]),
        &["model"]
    )
    .expect("valid model_load_seconds metric");
    static ref SLOT_WAIT_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("slot_wait_seconds", "Time spent waiting for a concurrency slot"),
        &["model"]
    )
    .expect("valid slot_wait_seconds metric");
}

static INIT: Once = Once::new();

/// Register every collector with the exported registry. Idempotent.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY.register(Box::new(RUNS_TOTAL.clone())).ok();
        REGISTRY.register(Box::new(ACTIVE_RUNS.clone())).ok();
        REGISTRY.register(Box::new(MODEL_LOAD_SECONDS.clone())).ok();
        REGISTRY.register(Box::new(SLOT_WAIT_SECONDS.clone())).ok();
    });
}

pub fn inc_runs(model: &str, status: &str) {
    RUNS_TOTAL.with_label_values(&[model, status]).inc();
}

pub fn runs(model: &str, status: &str) -> u64 {
    RUNS_TOTAL.with_label_values(&[model, status]).get()
}

pub fn inc_active_runs(model: &str) {
    ACTIVE_RUNS.with_label_values(&[model]).inc();
}

pub fn dec_active_runs(model: &str) {
    ACTIVE_RUNS.with_label_values(&[model]).dec();
}

pub fn active_runs(model: &str) -> i64 {
    ACTIVE_RUNS.with_label_values(&[model]).get()
}

pub fn observe_load(model: &str, seconds: f64) {
    MODEL_LOAD_SECONDS.with_label_values(&[model]).observe(seconds);
}

pub fn observe_slot_wait(model: &str, seconds: f64) {
    SLOT_WAIT_SECONDS.with_label_values(&[model]).observe(seconds);
}

/// Prometheus text exposition of everything registered.
pub fn gather() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_registered_metrics() {
        init_metrics();
        init_metrics();
        inc_runs("metrics-test-model", "completed");
        observe_load("metrics-test-model", 0.25);
        let text = gather().unwrap();
        assert!(text.contains("runs_total"));
        assert!(text.contains("model_load_seconds"));
        assert!(text.contains("metrics-test-model"));
    }

    #[test]
    fn test_active_runs_gauge_balances() {
        inc_active_runs("gauge-test-model");
        inc_active_runs("gauge-test-model");
        dec_active_runs("gauge-test-model");
        assert_eq!(active_runs("gauge-test-model"), 1);
        dec_active_runs("gauge-test-model");
        assert_eq!(active_runs("gauge-test-model"), 0);
    }
}

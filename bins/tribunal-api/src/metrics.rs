// Prometheus metrics for the judging endpoints
use lazy_static::lazy_static;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;
use tracing::error;
use tribunal_common::types::OutcomeKind;

struct Metrics {
    registry: Registry,
    requests_total: IntCounterVec,
    judge_duration: HistogramVec,
    internal_faults: IntCounter,
}

impl Metrics {
    fn register() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("tribunal_requests_total", "Judging requests by endpoint and outcome"),
            &["endpoint", "outcome"],
        )?;
        let judge_duration = HistogramVec::new(
            HistogramOpts::new("tribunal_judge_duration_seconds", "Wall-clock time spent judging a request")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["endpoint"],
        )?;
        let internal_faults = IntCounter::new(
            "tribunal_internal_faults_total",
            "Requests that ended in an internal judge fault",
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(judge_duration.clone()))?;
        registry.register(Box::new(internal_faults.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            judge_duration,
            internal_faults,
        })
    }
}

lazy_static! {
    static ref METRICS: Option<Metrics> = match Metrics::register() {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            error!(error = %e, "Failed to register metrics, continuing without them");
            None
        }
    };
}

pub fn observe(endpoint: &str, outcome: OutcomeKind, elapsed: Duration) {
    let Some(metrics) = METRICS.as_ref() else {
        return;
    };
    metrics
        .requests_total
        .with_label_values(&[endpoint, outcome.as_str()])
        .inc();
    metrics
        .judge_duration
        .with_label_values(&[endpoint])
        .observe(elapsed.as_secs_f64());
    if outcome == OutcomeKind::JudgeError {
        metrics.internal_faults.inc();
    }
}

/// Text exposition format
pub fn render() -> String {
    let Some(metrics) = METRICS.as_ref() else {
        return String::new();
    };
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metrics.registry.gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

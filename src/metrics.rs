//! Prometheus metrics for predictions and drawing storage.
//!
//! Names live in [`MetricName`] so call sites never spell them out by hand.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::fmt;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    PredictionsTotal,
    PredictionErrors,
    InferenceDuration,
    PersistenceErrors,
    DrawingsCreated,
    DrawingsDeleted,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::PredictionsTotal => "digit_predictions_total",
            MetricName::PredictionErrors => "digit_prediction_errors_total",
            MetricName::InferenceDuration => "digit_inference_duration_seconds",
            MetricName::PersistenceErrors => "digit_persistence_errors_total",
            MetricName::DrawingsCreated => "digit_drawings_created_total",
            MetricName::DrawingsDeleted => "digit_drawings_deleted_total",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Install the Prometheus recorder. Returns `None` if a recorder is already
/// installed (e.g. a second router in the same test binary).
pub fn init_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("Prometheus recorder installed, exposed at /metrics");
            Some(handle)
        }
        Err(e) => {
            warn!("Prometheus recorder install failed (possibly already installed): {}", e);
            None
        }
    }
}

pub fn record_prediction(digit: u8) {
    metrics::counter!(MetricName::PredictionsTotal.as_str(), "digit" => digit.to_string())
        .increment(1);
}

pub fn record_prediction_error(kind: &'static str) {
    metrics::counter!(MetricName::PredictionErrors.as_str(), "kind" => kind).increment(1);
}

pub fn record_persistence_error(operation: &'static str) {
    metrics::counter!(MetricName::PersistenceErrors.as_str(), "operation" => operation)
        .increment(1);
}

pub fn record_drawing_created(source: &'static str) {
    metrics::counter!(MetricName::DrawingsCreated.as_str(), "source" => source).increment(1);
}

pub fn record_drawing_deleted() {
    metrics::counter!(MetricName::DrawingsDeleted.as_str()).increment(1);
}

/// Records elapsed seconds into a histogram when dropped.
pub struct TimingGuard {
    name: MetricName,
    start: Instant,
}

impl TimingGuard {
    pub fn new(name: MetricName) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        metrics::histogram!(self.name.as_str()).record(self.start.elapsed().as_secs_f64());
    }
}

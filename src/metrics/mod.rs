//! Metric samples and the emitter that turns check results into them.

mod summary;

pub use summary::*;

use crate::probe::CheckResult;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Namespace for per-target samples.
pub const TARGET_NAMESPACE: &str = "WebsiteMonitor";
/// Namespace for run-level samples.
pub const RUN_NAMESPACE: &str = "WebsiteMonitorCrawler";
/// Dimension that identifies a target.
pub const URL_DIMENSION: &str = "URL";

pub const LATENCY: &str = "Latency";
pub const RESPONSE_SIZE: &str = "ResponseSize";
pub const STATUS_CODE: &str = "StatusCode";
pub const IS_SUCCESS: &str = "IsSuccess";
pub const RUN_TIME_MS: &str = "RunTimeMs";
pub const SITES_CHECKED: &str = "SitesChecked";
pub const MEMORY_UTILIZATION: &str = "MemoryUtilization";

pub type Dimensions = BTreeMap<String, String>;

/// Sink error types.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("metrics sink unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    Seconds,
    Milliseconds,
    Bytes,
    Count,
    Percent,
    None,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Seconds => "Seconds",
            Unit::Milliseconds => "Milliseconds",
            Unit::Bytes => "Bytes",
            Unit::Count => "Count",
            Unit::Percent => "Percent",
            Unit::None => "None",
        }
    }
}

/// One timestamped observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub namespace: String,
    pub metric_name: String,
    pub dimensions: Dimensions,
    pub value: f64,
    pub unit: Unit,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    pub fn new(
        namespace: &str,
        metric_name: &str,
        value: f64,
        unit: Unit,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            metric_name: metric_name.to_string(),
            dimensions: Dimensions::new(),
            value,
            unit,
            timestamp,
        }
    }

    pub fn with_dimension(mut self, name: &str, value: &str) -> Self {
        self.dimensions.insert(name.to_string(), value.to_string());
        self
    }
}

/// Destination for metric samples. Callers do not rely on per-sample
/// acknowledgement; the return value is the number of samples accepted.
pub trait MetricsSink: Send + Sync {
    fn put_metric_data(&self, samples: &[MetricSample]) -> Result<usize, SinkError>;
}

/// Read side used by the threshold evaluator.
pub trait SampleSource: Send + Sync {
    /// Values for one metric series with `start <= timestamp <= end`.
    fn sample_values(
        &self,
        namespace: &str,
        metric_name: &str,
        dimensions: &Dimensions,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<f64>, SinkError>;
}

/// Dimensions that identify a target's series.
pub fn target_dimensions(url: &str) -> Dimensions {
    let mut dims = Dimensions::new();
    dims.insert(URL_DIMENSION.to_string(), url.to_string());
    dims
}

/// Build the samples for one check result.
pub fn check_samples(result: &CheckResult) -> Vec<MetricSample> {
    let ts = result.timestamp;
    let sample = |name: &str, value: f64, unit: Unit| {
        MetricSample::new(TARGET_NAMESPACE, name, value, unit, ts)
            .with_dimension(URL_DIMENSION, &result.url)
    };

    let mut samples = vec![sample(LATENCY, result.latency_seconds, Unit::Seconds)];
    if result.success {
        samples.push(sample(RESPONSE_SIZE, result.content_length as f64, Unit::Bytes));
        if let Some(status) = result.http_status {
            samples.push(sample(STATUS_CODE, f64::from(status), Unit::None));
        }
    }
    samples.push(sample(IS_SUCCESS, if result.success { 1.0 } else { 0.0 }, Unit::Count));
    samples
}

/// Emit the samples for one check result. Sink failures are logged, never
/// returned; the result is the number of samples written.
pub fn emit_check(sink: &dyn MetricsSink, result: &CheckResult) -> usize {
    let samples = check_samples(result);
    put_or_log(sink, &samples, &result.url)
}

/// Emit the run-level summary samples.
pub fn emit_run_summary(
    sink: &dyn MetricsSink,
    run_time_ms: u64,
    sites_checked: usize,
    memory_percent: Option<f64>,
    timestamp: DateTime<Utc>,
) -> usize {
    let mut samples = vec![
        MetricSample::new(RUN_NAMESPACE, RUN_TIME_MS, run_time_ms as f64, Unit::Milliseconds, timestamp),
        MetricSample::new(RUN_NAMESPACE, SITES_CHECKED, sites_checked as f64, Unit::Count, timestamp),
    ];
    if let Some(pct) = memory_percent {
        samples.push(MetricSample::new(RUN_NAMESPACE, MEMORY_UTILIZATION, pct, Unit::Percent, timestamp));
    }
    put_or_log(sink, &samples, "run")
}

fn put_or_log(sink: &dyn MetricsSink, samples: &[MetricSample], series: &str) -> usize {
    match sink.put_metric_data(samples) {
        Ok(n) => n,
        Err(e) => {
            tracing::error!(series = %series, count = samples.len(), "Failed to publish metrics: {}", e);
            0
        }
    }
}

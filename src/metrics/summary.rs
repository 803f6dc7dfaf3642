//! Latency percentile summaries for stored samples.

use serde::Serialize;
use tdigests::TDigest;

/// Percentile summary of a series of latency samples, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

/// Summarize a set of values; `None` when there are none.
pub fn summarize(values: &[f64]) -> Option<LatencySummary> {
    let values: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return None;
    }

    let min = values.iter().copied().fold(f64::MAX, f64::min);
    let max = values.iter().copied().fold(f64::MIN, f64::max);
    let avg = values.iter().sum::<f64>() / values.len() as f64;
    let count = values.len();

    let mut td = TDigest::from_values(values);
    td.compress(100);

    Some(LatencySummary {
        count,
        min,
        max,
        avg,
        p50: sanitize_float(td.estimate_quantile(0.50)),
        p90: sanitize_float(td.estimate_quantile(0.90)),
        p99: sanitize_float(td.estimate_quantile(0.99)),
    })
}

fn sanitize_float(f: f64) -> f64 {
    if f.is_nan() || f.is_infinite() {
        0.0
    } else {
        f
    }
}

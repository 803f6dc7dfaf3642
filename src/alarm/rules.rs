//! Threshold rule definitions.

use crate::metrics::{
    Dimensions, IS_SUCCESS, LATENCY, MEMORY_UTILIZATION, RUN_NAMESPACE, RUN_TIME_MS, TARGET_NAMESPACE,
};

use serde::Serialize;
use std::time::Duration;

/// Default evaluation window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComparisonOperator {
    GreaterThan,
    LessThan,
}

impl ComparisonOperator {
    pub fn breaches(&self, value: f64, threshold: f64) -> bool {
        match self {
            ComparisonOperator::GreaterThan => value > threshold,
            ComparisonOperator::LessThan => value < threshold,
        }
    }

    pub fn phrase(&self) -> &'static str {
        match self {
            ComparisonOperator::GreaterThan => "greater than",
            ComparisonOperator::LessThan => "less than",
        }
    }

    /// Operator name in alarm notification payloads.
    pub fn payload_name(&self) -> &'static str {
        match self {
            ComparisonOperator::GreaterThan => "GreaterThanThreshold",
            ComparisonOperator::LessThan => "LessThanThreshold",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Aggregation {
    Average,
    Minimum,
}

impl Aggregation {
    /// Aggregate a window of values; `None` when the window is empty.
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        match self {
            Aggregation::Average => Some(values.iter().sum::<f64>() / values.len() as f64),
            Aggregation::Minimum => values.iter().copied().reduce(f64::min),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Average => "Average",
            Aggregation::Minimum => "Minimum",
        }
    }
}

/// Whether a rule is instantiated once per target or once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Target,
    Run,
}

/// A consecutive-breach threshold rule over one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmRule {
    pub name: String,
    pub namespace: String,
    pub metric_name: String,
    pub comparison: ComparisonOperator,
    pub threshold: f64,
    pub evaluation_periods: u32,
    pub aggregation: Aggregation,
    #[serde(skip)]
    pub window: Duration,
    pub scope: RuleScope,
}

impl AlarmRule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        namespace: &str,
        metric_name: &str,
        comparison: ComparisonOperator,
        threshold: f64,
        evaluation_periods: u32,
        aggregation: Aggregation,
        scope: RuleScope,
    ) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            metric_name: metric_name.to_string(),
            comparison,
            threshold,
            evaluation_periods: evaluation_periods.max(1),
            aggregation,
            window: DEFAULT_WINDOW,
            scope,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Target is down: the worst IsSuccess sample in the window is below 1,
    /// two windows in a row.
    pub fn availability() -> Self {
        Self::new(
            "Availability",
            TARGET_NAMESPACE,
            IS_SUCCESS,
            ComparisonOperator::LessThan,
            1.0,
            2,
            Aggregation::Minimum,
            RuleScope::Target,
        )
    }

    /// Target is slow: average latency above one second, three windows in a row.
    pub fn latency() -> Self {
        Self::new(
            "Latency",
            TARGET_NAMESPACE,
            LATENCY,
            ComparisonOperator::GreaterThan,
            1.0,
            3,
            Aggregation::Average,
            RuleScope::Target,
        )
    }

    /// A whole check cycle took longer than two seconds, twice in a row.
    pub fn run_time() -> Self {
        Self::new(
            "CrawlerRunTime",
            RUN_NAMESPACE,
            RUN_TIME_MS,
            ComparisonOperator::GreaterThan,
            2000.0,
            2,
            Aggregation::Average,
            RuleScope::Run,
        )
    }

    /// Checker memory above 80% of its budget.
    pub fn memory() -> Self {
        Self::new(
            "CrawlerMemory",
            RUN_NAMESPACE,
            MEMORY_UTILIZATION,
            ComparisonOperator::GreaterThan,
            80.0,
            1,
            Aggregation::Average,
            RuleScope::Run,
        )
    }

    /// Name of the alarm this rule produces for a set of dimensions.
    pub fn alarm_name(&self, dimensions: &Dimensions) -> String {
        if dimensions.is_empty() {
            return self.name.clone();
        }
        let values: Vec<&str> = dimensions.values().map(String::as_str).collect();
        format!("{}:{}", self.name, values.join(","))
    }
}

/// Rules evaluated for every checked target.
pub fn target_rules(window: Duration) -> Vec<AlarmRule> {
    vec![
        AlarmRule::availability().with_window(window),
        AlarmRule::latency().with_window(window),
    ]
}

/// Rules evaluated once per run.
pub fn run_rules(window: Duration) -> Vec<AlarmRule> {
    vec![
        AlarmRule::run_time().with_window(window),
        AlarmRule::memory().with_window(window),
    ]
}

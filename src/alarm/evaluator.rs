//! Threshold evaluator.
//!
//! Reads the current window of samples for a rule, advances the persisted
//! alarm state, and returns an [`AlarmEvent`] when the state changed.

use super::event::AlarmEvent;
use super::rules::AlarmRule;
use super::state::AlarmState;
use crate::db::DbError;
use crate::metrics::{Dimensions, SampleSource, SinkError};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use thiserror::Error;

/// Persistence for live alarm states.
pub trait AlarmStateStore: Send + Sync {
    fn get_alarm_state(&self, alarm_name: &str) -> Result<Option<AlarmState>, DbError>;

    /// Write `state` only if the stored row still matches `expected`
    /// (state and breach count), or does not exist when `expected` is `None`.
    /// Returns `DbError::Conflict` otherwise.
    fn put_alarm_state(&self, state: &AlarmState, expected: Option<&AlarmState>) -> Result<(), DbError>;

    fn list_alarm_states(&self) -> Result<Vec<AlarmState>, DbError>;
}

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("failed to read samples: {0}")]
    Samples(#[from] SinkError),
    #[error("failed to persist alarm state: {0}")]
    Store(#[from] DbError),
}

pub struct ThresholdEvaluator {
    samples: Arc<dyn SampleSource>,
    states: Arc<dyn AlarmStateStore>,
}

impl ThresholdEvaluator {
    pub fn new(samples: Arc<dyn SampleSource>, states: Arc<dyn AlarmStateStore>) -> Self {
        Self { samples, states }
    }

    /// Evaluate one rule for one series at `now` over the rule's full window.
    pub fn evaluate(
        &self,
        rule: &AlarmRule,
        dimensions: &Dimensions,
        now: DateTime<Utc>,
    ) -> Result<Option<AlarmEvent>, EvalError> {
        self.evaluate_since(rule, dimensions, None, now)
    }

    /// Evaluate one rule with the window clipped to start no earlier than
    /// `since`. The scheduler passes the cycle start so that a window only
    /// ever holds samples from the cycle being evaluated.
    pub fn evaluate_since(
        &self,
        rule: &AlarmRule,
        dimensions: &Dimensions,
        since: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<AlarmEvent>, EvalError> {
        let alarm_name = rule.alarm_name(dimensions);
        let previous = self.states.get_alarm_state(&alarm_name)?;
        let mut state = previous
            .clone()
            .unwrap_or_else(|| AlarmState::new(&alarm_name, &rule.metric_name, dimensions.clone()));

        let window = ChronoDuration::from_std(rule.window).unwrap_or_else(|_| ChronoDuration::minutes(5));
        let mut start = now - window;
        if let Some(since) = since {
            start = start.max(since);
        }
        let values = self.samples.sample_values(
            &rule.namespace,
            &rule.metric_name,
            dimensions,
            start,
            now,
        )?;
        let aggregate = rule.aggregation.apply(&values);

        let transition = state.apply(rule, aggregate, now);

        // State is persisted before any event exists for it
        self.states.put_alarm_state(&state, previous.as_ref())?;

        Ok(transition.map(|t| {
            tracing::info!(
                alarm = %alarm_name,
                from = %t.from,
                to = %t.to,
                "Alarm state changed"
            );
            AlarmEvent::from_transition(rule, &state, &t, now)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::state::StateValue;
    use crate::db::Store;
    use crate::metrics::{
        target_dimensions, MetricSample, MetricsSink, Unit, IS_SUCCESS, MEMORY_UTILIZATION, RUN_NAMESPACE,
        RUN_TIME_MS, TARGET_NAMESPACE,
    };
    use tempfile::NamedTempFile;

    fn setup() -> (NamedTempFile, Arc<Store>, ThresholdEvaluator) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let evaluator = ThresholdEvaluator::new(store.clone(), store.clone());
        (tmp, store, evaluator)
    }

    fn push(store: &Store, url: &str, value: f64, at: DateTime<Utc>) {
        let sample = MetricSample::new(TARGET_NAMESPACE, IS_SUCCESS, value, Unit::Count, at)
            .with_dimension("URL", url);
        store.put_metric_data(&[sample]).unwrap();
    }

    #[test]
    fn test_alarm_after_two_failed_windows() {
        let (_tmp, store, evaluator) = setup();
        let rule = AlarmRule::availability();
        let url = "https://example.com";
        let dims = target_dimensions(url);
        let t0 = Utc::now();

        push(&store, url, 0.0, t0);
        assert!(evaluator.evaluate(&rule, &dims, t0).unwrap().is_none());

        let t1 = t0 + ChronoDuration::minutes(5);
        push(&store, url, 0.0, t1);
        let event = evaluator.evaluate(&rule, &dims, t1).unwrap().unwrap();
        assert_eq!(event.new_state, "ALARM");
        assert_eq!(event.alarm_name, "Availability:https://example.com");

        let state = store.get_alarm_state(&event.alarm_name).unwrap().unwrap();
        assert_eq!(state.state, StateValue::Alarm);
        assert_eq!(state.consecutive_breach_count, 2);
    }

    #[test]
    fn test_state_survives_new_evaluator() {
        let (_tmp, store, evaluator) = setup();
        let rule = AlarmRule::availability();
        let url = "https://example.com";
        let dims = target_dimensions(url);
        let t0 = Utc::now();

        push(&store, url, 0.0, t0);
        evaluator.evaluate(&rule, &dims, t0).unwrap();
        drop(evaluator);

        let fresh = ThresholdEvaluator::new(store.clone(), store.clone());
        let t1 = t0 + ChronoDuration::minutes(5);
        push(&store, url, 0.0, t1);
        let event = fresh.evaluate(&rule, &dims, t1).unwrap();
        assert!(event.is_some());
    }

    #[test]
    fn test_samples_outside_window_ignored() {
        let (_tmp, store, evaluator) = setup();
        let rule = AlarmRule::availability();
        let url = "https://example.com";
        let dims = target_dimensions(url);
        let t0 = Utc::now();

        push(&store, url, 1.0, t0 - ChronoDuration::minutes(30));
        assert!(evaluator.evaluate(&rule, &dims, t0).unwrap().is_none());
        let state = store.get_alarm_state(&rule.alarm_name(&dims)).unwrap().unwrap();
        assert_eq!(state.state, StateValue::InsufficientData);
    }

    fn push_run(store: &Store, metric: &str, value: f64, unit: Unit, at: DateTime<Utc>) {
        store
            .put_metric_data(&[MetricSample::new(RUN_NAMESPACE, metric, value, unit, at)])
            .unwrap();
    }

    /// Feed one run-level sample per cycle and collect the events.
    fn feed_run(rule: &AlarmRule, metric: &str, unit: Unit, values: &[f64]) -> Vec<AlarmEvent> {
        let (_tmp, store, evaluator) = setup();
        let dims = Dimensions::new();
        let t0 = Utc::now();
        let mut events = Vec::new();

        for (i, value) in values.iter().enumerate() {
            let cycle_start = t0 + ChronoDuration::minutes(i as i64);
            let at = cycle_start + ChronoDuration::seconds(1);
            push_run(&store, metric, *value, unit, at);
            if let Some(event) = evaluator
                .evaluate_since(rule, &dims, Some(cycle_start), at)
                .unwrap()
            {
                events.push(event);
            }
        }
        events
    }

    #[test]
    fn test_run_time_alarms_on_second_slow_run() {
        let rule = AlarmRule::run_time();
        let events = feed_run(&rule, RUN_TIME_MS, Unit::Milliseconds, &[2500.0, 2500.0]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].alarm_name, "CrawlerRunTime");
        assert_eq!(events[0].new_state, "ALARM");
    }

    #[test]
    fn test_run_time_fast_run_resets() {
        let rule = AlarmRule::run_time();
        let events = feed_run(&rule, RUN_TIME_MS, Unit::Milliseconds, &[2500.0, 100.0]);
        assert!(events.iter().all(|e| e.new_state != "ALARM"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].new_state, "OK");
    }

    #[test]
    fn test_memory_alarms_on_first_sample() {
        let rule = AlarmRule::memory();
        let events = feed_run(&rule, MEMORY_UTILIZATION, Unit::Percent, &[90.0]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].alarm_name, "CrawlerMemory");
        assert_eq!(events[0].new_state, "ALARM");
    }

    #[test]
    fn test_since_excludes_earlier_cycle() {
        let (_tmp, store, evaluator) = setup();
        let rule = AlarmRule::availability();
        let url = "https://example.com";
        let dims = target_dimensions(url);
        let t0 = Utc::now();

        push(&store, url, 0.0, t0);
        assert!(evaluator.evaluate_since(&rule, &dims, Some(t0), t0).unwrap().is_none());

        // Next cycle well inside the 5 minute window: only its own sample counts
        let t1 = t0 + ChronoDuration::seconds(30);
        push(&store, url, 1.0, t1);
        let event = evaluator.evaluate_since(&rule, &dims, Some(t1), t1).unwrap().unwrap();
        assert_eq!(event.new_state, "OK");
        let state = store.get_alarm_state(&event.alarm_name).unwrap().unwrap();
        assert_eq!(state.consecutive_breach_count, 0);
    }
}

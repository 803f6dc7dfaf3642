//! Alarm state machine.

use super::rules::AlarmRule;
use crate::metrics::Dimensions;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateValue {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ALARM")]
    Alarm,
    #[serde(rename = "INSUFFICIENT_DATA")]
    InsufficientData,
}

impl StateValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateValue::Ok => "OK",
            StateValue::Alarm => "ALARM",
            StateValue::InsufficientData => "INSUFFICIENT_DATA",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(StateValue::Ok),
            "ALARM" => Some(StateValue::Alarm),
            "INSUFFICIENT_DATA" => Some(StateValue::InsufficientData),
            _ => None,
        }
    }
}

impl std::fmt::Display for StateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live state of one alarm, keyed by alarm name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmState {
    pub alarm_name: String,
    pub metric_name: String,
    pub dimensions: Dimensions,
    pub state: StateValue,
    pub consecutive_breach_count: u32,
    pub last_evaluated_at: Option<DateTime<Utc>>,
}

/// A change of `AlarmState::state`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: StateValue,
    pub to: StateValue,
    pub reason: String,
}

impl AlarmState {
    /// A never-evaluated alarm starts in INSUFFICIENT_DATA.
    pub fn new(alarm_name: &str, metric_name: &str, dimensions: Dimensions) -> Self {
        Self {
            alarm_name: alarm_name.to_string(),
            metric_name: metric_name.to_string(),
            dimensions,
            state: StateValue::InsufficientData,
            consecutive_breach_count: 0,
            last_evaluated_at: None,
        }
    }

    /// Advance the state by one evaluation tick.
    ///
    /// `aggregate` is the rule's aggregation over the current window, `None`
    /// when the window held no samples. Returns the transition, if any.
    pub fn apply(
        &mut self,
        rule: &AlarmRule,
        aggregate: Option<f64>,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        self.last_evaluated_at = Some(now);
        let from = self.state;

        let (to, reason) = match aggregate {
            None => {
                self.consecutive_breach_count = 0;
                (
                    StateValue::InsufficientData,
                    format!(
                        "Insufficient Data: no {} samples in the last {}s",
                        rule.metric_name,
                        rule.window.as_secs()
                    ),
                )
            }
            Some(value) if rule.comparison.breaches(value, rule.threshold) => {
                self.consecutive_breach_count = self.consecutive_breach_count.saturating_add(1);
                if self.consecutive_breach_count < rule.evaluation_periods {
                    return None;
                }
                (
                    StateValue::Alarm,
                    format!(
                        "Threshold Crossed: {} consecutive periods with {} {} [{}] {} the threshold ({})",
                        self.consecutive_breach_count,
                        rule.aggregation.as_str(),
                        rule.metric_name,
                        value,
                        rule.comparison.phrase(),
                        rule.threshold
                    ),
                )
            }
            Some(value) => {
                self.consecutive_breach_count = 0;
                (
                    StateValue::Ok,
                    format!(
                        "Threshold Crossed: {} {} [{}] was not {} the threshold ({})",
                        rule.aggregation.as_str(),
                        rule.metric_name,
                        value,
                        rule.comparison.phrase(),
                        rule.threshold
                    ),
                )
            }
        };

        if to == from {
            return None;
        }

        self.state = to;
        Some(Transition { from, to, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::target_dimensions;

    fn feed(rule: &AlarmRule, values: &[f64]) -> (AlarmState, Vec<Transition>) {
        let dims = target_dimensions("https://example.com");
        let mut state = AlarmState::new(&rule.alarm_name(&dims), &rule.metric_name, dims);
        let transitions = values
            .iter()
            .filter_map(|v| state.apply(rule, Some(*v), Utc::now()))
            .collect();
        (state, transitions)
    }

    #[test]
    fn test_availability_all_up() {
        let (state, transitions) = feed(&AlarmRule::availability(), &[1.0, 1.0]);
        assert_eq!(state.state, StateValue::Ok);
        // Only the initial INSUFFICIENT_DATA -> OK change
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, StateValue::Ok);
    }

    #[test]
    fn test_availability_alarms_on_second_failure() {
        let rule = AlarmRule::availability();
        let dims = target_dimensions("https://example.com");
        let mut state = AlarmState::new("a", &rule.metric_name, dims);

        assert!(state.apply(&rule, Some(0.0), Utc::now()).is_none());
        assert_eq!(state.consecutive_breach_count, 1);

        let t = state.apply(&rule, Some(0.0), Utc::now()).unwrap();
        assert_eq!(t.to, StateValue::Alarm);
        assert_eq!(state.state, StateValue::Alarm);

        // Staying in ALARM is not a transition
        assert!(state.apply(&rule, Some(0.0), Utc::now()).is_none());
        assert_eq!(state.consecutive_breach_count, 3);
    }

    #[test]
    fn test_availability_recovery_resets_counter() {
        let (state, transitions) = feed(&AlarmRule::availability(), &[0.0, 1.0]);
        assert!(transitions.iter().all(|t| t.to != StateValue::Alarm));
        assert_eq!(state.consecutive_breach_count, 0);
        assert_eq!(state.state, StateValue::Ok);
    }

    #[test]
    fn test_latency_needs_three_breaches() {
        let (state, transitions) = feed(&AlarmRule::latency(), &[0.2, 1.5, 2.0]);
        assert_eq!(state.state, StateValue::Ok);
        assert_eq!(state.consecutive_breach_count, 2);
        assert_eq!(transitions.len(), 1);

        let (state, transitions) = feed(&AlarmRule::latency(), &[0.2, 1.5, 2.0, 3.0, 0.1]);
        let states: Vec<StateValue> = transitions.iter().map(|t| t.to).collect();
        assert_eq!(states, vec![StateValue::Ok, StateValue::Alarm, StateValue::Ok]);
        assert_eq!(state.state, StateValue::Ok);
    }

    #[test]
    fn test_missing_data() {
        let rule = AlarmRule::availability();
        let mut state = AlarmState::new("a", &rule.metric_name, Dimensions::new());
        assert!(state.apply(&rule, None, Utc::now()).is_none());

        state.apply(&rule, Some(1.0), Utc::now());
        let t = state.apply(&rule, None, Utc::now()).unwrap();
        assert_eq!(t.from, StateValue::Ok);
        assert_eq!(t.to, StateValue::InsufficientData);
    }

    #[test]
    fn test_state_value_roundtrip() {
        for v in [StateValue::Ok, StateValue::Alarm, StateValue::InsufficientData] {
            assert_eq!(StateValue::parse(v.as_str()), Some(v));
        }
        assert_eq!(StateValue::parse("UNKNOWN"), None);
    }
}

//! Alarm history records and the notification payload format.

use super::rules::AlarmRule;
use super::state::{AlarmState, Transition};
use crate::metrics::Dimensions;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Alarm name stored for payloads that carry none.
pub const UNKNOWN: &str = "UNKNOWN";
/// Stored in place of a missing namespace or metric name.
pub const NOT_AVAILABLE: &str = "N/A";

/// One alarm state transition, keyed by `(alarm_name, state_change_time)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub alarm_name: String,
    pub state_change_time: String,
    pub new_state: String,
    pub reason: String,
    pub metric_namespace: String,
    pub metric_name: String,
    pub dimensions: Dimensions,
    pub raw: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AlarmPayload {
    #[serde(default)]
    alarm_name: Option<String>,
    #[serde(default)]
    new_state_value: Option<String>,
    #[serde(default)]
    new_state_reason: Option<String>,
    #[serde(default)]
    state_change_time: Option<String>,
    #[serde(default)]
    trigger: Option<TriggerPayload>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TriggerPayload {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    metric_name: Option<String>,
    #[serde(default)]
    dimensions: Option<Vec<Value>>,
}

/// Why a payload could not be parsed.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
}

/// History key format: UTC with a fixed nine-digit fraction, so string
/// order is time order.
pub fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Rewrite a payload timestamp into the history key format. Accepts RFC3339
/// and the `+0000` offset form alarm payloads use; `None` if neither parses.
pub fn normalize_time(s: &str) -> Option<String> {
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
        .map(|dt| format_time(dt.with_timezone(&Utc)))
}

impl AlarmEvent {
    /// Record for a transition produced by the evaluator.
    pub fn from_transition(
        rule: &AlarmRule,
        state: &AlarmState,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Self {
        let state_change_time = format_time(now);
        let dims: Vec<Value> = state
            .dimensions
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        let raw = json!({
            "AlarmName": state.alarm_name,
            "NewStateValue": transition.to.as_str(),
            "OldStateValue": transition.from.as_str(),
            "NewStateReason": transition.reason,
            "StateChangeTime": state_change_time,
            "Trigger": {
                "Namespace": rule.namespace,
                "MetricName": rule.metric_name,
                "Dimensions": dims,
                "Statistic": rule.aggregation.as_str(),
                "ComparisonOperator": rule.comparison.payload_name(),
                "Threshold": rule.threshold,
                "EvaluationPeriods": rule.evaluation_periods,
                "Period": rule.window.as_secs(),
            },
        });

        Self {
            alarm_name: state.alarm_name.clone(),
            state_change_time,
            new_state: transition.to.as_str().to_string(),
            reason: transition.reason.clone(),
            metric_namespace: rule.namespace.clone(),
            metric_name: rule.metric_name.clone(),
            dimensions: state.dimensions.clone(),
            raw,
        }
    }

    /// Parse an alarm notification message. Missing fields take defaults;
    /// a missing `StateChangeTime` becomes `now`.
    pub fn parse_payload(message: &str, now: DateTime<Utc>) -> Result<Self, PayloadError> {
        let raw: Value = serde_json::from_str(message)?;
        if !raw.is_object() {
            return Err(PayloadError::NotAnObject);
        }
        let payload: AlarmPayload = serde_json::from_value(raw.clone())?;
        let trigger = payload.trigger.unwrap_or_default();

        // Dimensions arrive as [{"name": .., "value": ..}]
        let dimensions = trigger
            .dimensions
            .unwrap_or_default()
            .iter()
            .filter_map(|d| {
                let name = d.get("name")?.as_str()?;
                let value = d.get("value").and_then(Value::as_str).unwrap_or_default();
                Some((name.to_string(), value.to_string()))
            })
            .collect();

        Ok(Self {
            alarm_name: payload.alarm_name.unwrap_or_else(|| UNKNOWN.to_string()),
            state_change_time: payload
                .state_change_time
                .filter(|t| !t.is_empty())
                .map(|t| normalize_time(&t).unwrap_or(t))
                .unwrap_or_else(|| format_time(now)),
            new_state: payload.new_state_value.unwrap_or_else(|| UNKNOWN.to_string()),
            reason: payload.new_state_reason.unwrap_or_default(),
            metric_namespace: trigger.namespace.unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            metric_name: trigger.metric_name.unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            dimensions,
            raw,
        })
    }

    /// Record kept for a message that could not be parsed.
    pub fn fallback(message: &str, now: DateTime<Utc>) -> Self {
        Self {
            alarm_name: UNKNOWN.to_string(),
            state_change_time: format_time(now),
            new_state: UNKNOWN.to_string(),
            reason: String::new(),
            metric_namespace: NOT_AVAILABLE.to_string(),
            metric_name: NOT_AVAILABLE.to_string(),
            dimensions: Dimensions::new(),
            raw: json!({ "RawMessage": message }),
        }
    }

    /// The notification message for this event.
    pub fn to_payload(&self) -> String {
        self.raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::state::StateValue;
    use crate::metrics::target_dimensions;

    #[test]
    fn test_parse_full_payload() {
        let msg = r#"{
            "AlarmName": "Availability:https://example.com",
            "NewStateValue": "ALARM",
            "NewStateReason": "Threshold Crossed",
            "StateChangeTime": "2024-05-01T10:00:00.000+0000",
            "Trigger": {
                "Namespace": "WebsiteMonitor",
                "MetricName": "IsSuccess",
                "Dimensions": [{"name": "URL", "value": "https://example.com"}]
            }
        }"#;
        let event = AlarmEvent::parse_payload(msg, Utc::now()).unwrap();
        assert_eq!(event.alarm_name, "Availability:https://example.com");
        assert_eq!(event.new_state, "ALARM");
        assert_eq!(event.state_change_time, "2024-05-01T10:00:00.000000000Z");
        // The original value stays in the raw payload
        assert_eq!(event.raw["StateChangeTime"], "2024-05-01T10:00:00.000+0000");
        assert_eq!(event.metric_name, "IsSuccess");
        assert_eq!(event.dimensions.get("URL").unwrap(), "https://example.com");
    }

    #[test]
    fn test_parse_defaults() {
        let now = Utc::now();
        let event = AlarmEvent::parse_payload(r#"{"AlarmName": "x"}"#, now).unwrap();
        assert_eq!(event.new_state, UNKNOWN);
        assert_eq!(event.metric_namespace, NOT_AVAILABLE);
        assert_eq!(event.state_change_time, format_time(now));
    }

    #[test]
    fn test_normalize_time() {
        assert_eq!(
            normalize_time("2024-05-01T12:30:00.250+0200").unwrap(),
            "2024-05-01T10:30:00.250000000Z"
        );
        assert_eq!(
            normalize_time("2024-05-01T10:30:00Z").unwrap(),
            "2024-05-01T10:30:00.000000000Z"
        );
        assert_eq!(normalize_time("yesterday"), None);

        // Unparseable times are kept as given
        let event = AlarmEvent::parse_payload(r#"{"AlarmName": "x", "StateChangeTime": "yesterday"}"#, Utc::now())
            .unwrap();
        assert_eq!(event.state_change_time, "yesterday");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(AlarmEvent::parse_payload("not json {", Utc::now()).is_err());
        assert!(matches!(
            AlarmEvent::parse_payload("[1, 2]", Utc::now()),
            Err(PayloadError::NotAnObject)
        ));
    }

    #[test]
    fn test_fallback_keeps_raw() {
        let event = AlarmEvent::fallback("garbage", Utc::now());
        assert_eq!(event.alarm_name, UNKNOWN);
        assert_eq!(event.raw["RawMessage"], "garbage");
    }

    #[test]
    fn test_engine_payload_parses_back() {
        let rule = AlarmRule::availability();
        let dims = target_dimensions("https://example.com");
        let mut state = AlarmState::new(&rule.alarm_name(&dims), &rule.metric_name, dims);
        state.state = StateValue::Alarm;
        let transition = Transition {
            from: StateValue::Ok,
            to: StateValue::Alarm,
            reason: "down".to_string(),
        };
        let event = AlarmEvent::from_transition(&rule, &state, &transition, Utc::now());

        let parsed = AlarmEvent::parse_payload(&event.to_payload(), Utc::now()).unwrap();
        assert_eq!(parsed, event);
    }
}

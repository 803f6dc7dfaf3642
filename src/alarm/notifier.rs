//! Alarm notification delivery and history logging.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::event::AlarmEvent;
use crate::db::DbError;

/// Append-only alarm history keyed by `(alarm_name, state_change_time)`.
/// Writing an existing key overwrites it.
pub trait AlarmHistory: Send + Sync {
    fn put_alarm_event(&self, event: &AlarmEvent) -> Result<(), DbError>;

    /// Events for one alarm with `start <= state_change_time <= end`, oldest first.
    fn alarm_events(&self, alarm_name: &str, start: &str, end: &str) -> Result<Vec<AlarmEvent>, DbError>;
}

/// Notification subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NotifyTarget {
    /// Log to tracing
    Log,
    /// HTTP webhook receiving the alarm payload
    Webhook {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Email recipients, sent through an HTTP mail relay when one is configured
    Email {
        to: Vec<String>,
        #[serde(default)]
        relay_url: Option<String>,
    },
}

/// Counts for one batch of inbound notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    /// Records stored, fallback records included
    pub written: usize,
    /// Records stored as raw fallbacks
    pub fallback: usize,
    /// Empty messages
    pub skipped: usize,
    /// Records whose write failed
    pub failed: usize,
}

pub struct Notifier {
    client: reqwest::Client,
    targets: Vec<NotifyTarget>,
    history: Arc<dyn AlarmHistory>,
}

impl Notifier {
    /// Build a notifier whose webhook and mail relay requests give up after `timeout`.
    pub fn new(
        targets: Vec<NotifyTarget>,
        history: Arc<dyn AlarmHistory>,
        timeout: Duration,
    ) -> Result<Self, NotifierError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| NotifierError::Config(e.to_string()))?;

        Ok(Self {
            client,
            targets,
            history,
        })
    }

    /// Deliver an engine-produced event to every subscriber, then log it.
    /// Returns whether the history write succeeded.
    pub async fn notify(&self, event: &AlarmEvent) -> bool {
        if let Err(e) = self.deliver(event).await {
            tracing::error!(alarm = %event.alarm_name, error = %e, "Failed to deliver alarm notification");
        }

        match self.record(event) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(alarm = %event.alarm_name, error = %e, "Failed to record alarm event");
                false
            }
        }
    }

    /// Send to all subscribers; one failing subscriber does not stop the rest.
    pub async fn deliver(&self, event: &AlarmEvent) -> Result<(), NotifierError> {
        let mut errors = Vec::new();

        for target in &self.targets {
            if let Err(e) = self.deliver_to(target, event).await {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NotifierError::Multiple(errors))
        }
    }

    async fn deliver_to(&self, target: &NotifyTarget, event: &AlarmEvent) -> Result<(), NotifierError> {
        match target {
            NotifyTarget::Log => {
                tracing::warn!(
                    alarm = %event.alarm_name,
                    state = %event.new_state,
                    "Alarm transition: {}",
                    event.reason
                );
                Ok(())
            }
            NotifyTarget::Webhook { url, headers } => {
                let mut request = self.client.post(url).json(&event.raw);
                for (key, value) in headers {
                    request = request.header(key, value);
                }

                let response = request
                    .send()
                    .await
                    .map_err(|e| NotifierError::Webhook(format!("Failed to send webhook: {}", e)))?;

                if !response.status().is_success() {
                    return Err(NotifierError::Webhook(format!(
                        "Webhook returned status {}",
                        response.status()
                    )));
                }
                tracing::debug!(alarm = %event.alarm_name, url = %url, "Webhook notification sent");
                Ok(())
            }
            NotifyTarget::Email { to, relay_url } => {
                let subject = format!("{}: \"{}\"", event.new_state, event.alarm_name);
                let Some(relay) = relay_url else {
                    tracing::info!(
                        alarm = %event.alarm_name,
                        recipients = ?to,
                        "No mail relay configured, email not sent: {}",
                        subject
                    );
                    return Ok(());
                };

                let body = serde_json::json!({
                    "to": to,
                    "subject": subject,
                    "body": format!("{}\n\n{}", event.reason, event.to_payload()),
                });
                let response = self
                    .client
                    .post(relay)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| NotifierError::Email(format!("Failed to reach mail relay: {}", e)))?;

                if !response.status().is_success() {
                    return Err(NotifierError::Email(format!(
                        "Mail relay returned status {}",
                        response.status()
                    )));
                }
                tracing::debug!(alarm = %event.alarm_name, recipients = ?to, "Email notification sent");
                Ok(())
            }
        }
    }

    /// Append one event to the history log.
    pub fn record(&self, event: &AlarmEvent) -> Result<(), NotifierError> {
        self.history.put_alarm_event(event)?;
        tracing::info!(
            alarm = %event.alarm_name,
            time = %event.state_change_time,
            state = %event.new_state,
            "Wrote alarm event"
        );
        Ok(())
    }

    /// Log a batch of inbound alarm notification messages. Each record is
    /// handled independently; unparseable messages are kept as raw fallbacks.
    pub fn record_batch(&self, messages: &[String]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for (idx, message) in messages.iter().enumerate() {
            if message.trim().is_empty() {
                tracing::warn!(index = idx, "Alarm notification had empty message; skipping");
                outcome.skipped += 1;
                continue;
            }

            let now = Utc::now();
            let (event, is_fallback) = match AlarmEvent::parse_payload(message, now) {
                Ok(event) => (event, false),
                Err(e) => {
                    tracing::warn!(index = idx, error = %e, "Alarm notification was not valid; storing raw message");
                    (AlarmEvent::fallback(message, now), true)
                }
            };

            match self.record(&event) {
                Ok(()) => {
                    outcome.written += 1;
                    if is_fallback {
                        outcome.fallback += 1;
                    }
                }
                Err(e) => {
                    tracing::error!(index = idx, alarm = %event.alarm_name, error = %e, "Failed to write alarm event");
                    outcome.failed += 1;
                }
            }
        }

        outcome
    }
}

/// Notifier errors
#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    #[error("Webhook error: {0}")]
    Webhook(String),

    #[error("Email error: {0}")]
    Email(String),

    #[error("History error: {0}")]
    History(#[from] DbError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Multiple notification failures: {0:?}")]
    Multiple(Vec<NotifierError>),
}

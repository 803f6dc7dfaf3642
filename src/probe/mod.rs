//! HTTP checker for monitored targets.
//!
//! A check is exactly one bounded GET. Transport failures never escape a
//! check; they are folded into a failed [`CheckResult`].

mod http;

pub use http::*;

use crate::db::Target;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Outcome of one check attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub target_id: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub http_status: Option<u16>,
    pub latency_seconds: f64,
    pub content_length: u64,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Shared checker holding one HTTP client for all targets.
#[derive(Clone)]
pub struct Checker {
    client: reqwest::Client,
    timeout: Duration,
}

impl Checker {
    /// Build a checker whose client sends `user_agent` and gives up after `timeout`.
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;

        Ok(Self { client, timeout })
    }

    /// Check one target.
    pub async fn check(&self, target: &Target) -> CheckResult {
        self.check_url(&target.id, &target.url).await
    }

    pub async fn check_url(&self, target_id: &str, address: &str) -> CheckResult {
        let url = normalize_url(address);
        let timestamp = Utc::now();
        let start = Instant::now();

        let outcome = fetch(&self.client, &url, self.timeout).await;
        let latency_seconds = start.elapsed().as_secs_f64();

        let mut result = CheckResult {
            target_id: target_id.to_string(),
            url: address.to_string(),
            timestamp,
            http_status: None,
            latency_seconds,
            content_length: 0,
            success: false,
            error_message: None,
        };

        match outcome {
            Ok(resp) => {
                result.http_status = Some(resp.status);
                result.content_length = resp.content_length;
                result.success = (200..300).contains(&resp.status);
                if !result.success {
                    result.error_message = Some("request returned non-2xx status".to_string());
                }
                tracing::debug!(url = %address, status = resp.status, latency = latency_seconds, "Check completed");
            }
            Err(e) => {
                tracing::warn!(url = %address, "Check failed: {}", e);
                result.error_message = Some(e.to_string());
            }
        }

        result
    }
}

/// Prefix bare hosts with `http://`.
pub fn normalize_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

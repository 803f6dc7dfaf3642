//! HTTP request execution.

use std::time::Duration;
use super::ProbeError;

/// Status and body size of a completed response.
#[derive(Debug, Clone, Copy)]
pub struct HttpResponse {
    pub status: u16,
    pub content_length: u64,
}

/// Send one GET and read the full body.
pub async fn fetch(client: &reqwest::Client, url: &str, timeout: Duration) -> Result<HttpResponse, ProbeError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| classify(e, timeout))?;

    let status = response.status().as_u16();

    // Read the full body to measure complete transfer time
    let body = response
        .bytes()
        .await
        .map_err(|e| classify(e, timeout))?;

    Ok(HttpResponse {
        status,
        content_length: body.len() as u64,
    })
}

fn classify(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(timeout)
    } else if e.is_connect() {
        ProbeError::Network(format!("connection failed: {}", e))
    } else {
        ProbeError::Network(e.to_string())
    }
}

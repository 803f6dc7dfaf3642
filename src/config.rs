//! Configuration module for sitewatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::alarm::NotifyTarget;

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "sitewatch.db")
    pub db_path: String,
    /// Time between check cycles (default: 300s)
    pub check_interval: Duration,
    /// Per-request timeout (default: 10s)
    pub check_timeout: Duration,
    /// Maximum checks in flight at once (default: 5)
    pub max_concurrent_checks: usize,
    /// Upper bound for one whole cycle (default: 240s)
    pub run_ceiling: Duration,
    pub user_agent: String,
    /// Memory the checker process is allowed, in bytes (default: 128 MiB)
    pub memory_budget_bytes: u64,
    /// How long metric samples are kept (default: 7 days)
    pub sample_retention: Duration,
    pub notify_emails: Vec<String>,
    pub mail_relay_url: Option<String>,
    pub webhook_url: Option<String>,
    /// URLs inserted when the store has no targets
    pub seed_targets: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "sitewatch.db".to_string(),
            check_interval: Duration::from_secs(300),
            check_timeout: Duration::from_secs(10),
            max_concurrent_checks: 5,
            run_ceiling: Duration::from_secs(240),
            user_agent: format!("Mozilla/5.0 (compatible; sitewatch/{})", env!("CARGO_PKG_VERSION")),
            memory_budget_bytes: 128 * 1024 * 1024,
            sample_retention: Duration::from_secs(7 * 24 * 3600),
            notify_emails: Vec::new(),
            mail_relay_url: None,
            webhook_url: None,
            seed_targets: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SITEWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `SITEWATCH_DB_PATH`: Database file path (default: "sitewatch.db")
    /// - `SITEWATCH_CHECK_INTERVAL_SECS`: cycle interval (default: 300)
    /// - `SITEWATCH_CHECK_TIMEOUT_SECS`: per-check timeout (default: 10)
    /// - `SITEWATCH_MAX_CONCURRENT_CHECKS`: parallel checks (default: 5)
    /// - `SITEWATCH_RUN_CEILING_SECS`: cycle ceiling (default: 240)
    /// - `SITEWATCH_USER_AGENT`: User-Agent header for checks
    /// - `SITEWATCH_MEMORY_BUDGET_MB`: memory budget (default: 128)
    /// - `SITEWATCH_SAMPLE_RETENTION_DAYS`: sample retention (default: 7)
    /// - `SITEWATCH_NOTIFY_EMAILS`: comma-separated alarm recipients
    /// - `SITEWATCH_MAIL_RELAY_URL`: HTTP mail relay for alarm emails
    /// - `SITEWATCH_WEBHOOK_URL`: webhook receiving alarm payloads
    /// - `SITEWATCH_SEED_TARGETS`: comma-separated URLs for an empty store
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(port) = parse(&lookup, "SITEWATCH_HTTP_PORT") {
            cfg.http_port = port;
        }
        if let Some(db_path) = lookup("SITEWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "SITEWATCH_CHECK_INTERVAL_SECS").filter(|s| *s > 0) {
            cfg.check_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "SITEWATCH_CHECK_TIMEOUT_SECS").filter(|s| *s > 0) {
            cfg.check_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse::<usize, _>(&lookup, "SITEWATCH_MAX_CONCURRENT_CHECKS").filter(|n| *n > 0) {
            cfg.max_concurrent_checks = n;
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "SITEWATCH_RUN_CEILING_SECS").filter(|s| *s > 0) {
            cfg.run_ceiling = Duration::from_secs(secs);
        }
        if let Some(ua) = lookup("SITEWATCH_USER_AGENT").filter(|s| !s.trim().is_empty()) {
            cfg.user_agent = ua;
        }
        if let Some(mb) = parse::<u64, _>(&lookup, "SITEWATCH_MEMORY_BUDGET_MB").filter(|m| *m > 0) {
            cfg.memory_budget_bytes = mb * 1024 * 1024;
        }
        if let Some(days) = parse::<u64, _>(&lookup, "SITEWATCH_SAMPLE_RETENTION_DAYS").filter(|d| *d > 0) {
            cfg.sample_retention = Duration::from_secs(days * 24 * 3600);
        }
        if let Some(emails) = lookup("SITEWATCH_NOTIFY_EMAILS") {
            cfg.notify_emails = split_list(&emails);
        }
        cfg.mail_relay_url = lookup("SITEWATCH_MAIL_RELAY_URL").filter(|s| !s.is_empty());
        cfg.webhook_url = lookup("SITEWATCH_WEBHOOK_URL").filter(|s| !s.is_empty());
        if let Some(urls) = lookup("SITEWATCH_SEED_TARGETS") {
            cfg.seed_targets = split_list(&urls);
        }

        cfg
    }

    /// Alarm subscribers described by this configuration.
    pub fn notify_targets(&self) -> Vec<NotifyTarget> {
        let mut targets = vec![NotifyTarget::Log];
        if let Some(url) = &self.webhook_url {
            targets.push(NotifyTarget::Webhook {
                url: url.clone(),
                headers: Default::default(),
            });
        }
        if !self.notify_emails.is_empty() {
            targets.push(NotifyTarget::Email {
                to: self.notify_emails.clone(),
                relay_url: self.mail_relay_url.clone(),
            });
        }
        targets
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

//! Scheduler module for running check cycles and evaluating alarms.

mod resources;
mod retention;

pub use resources::*;
pub use retention::*;

use crate::alarm::{rules, AlarmRule, Notifier, ThresholdEvaluator};
use crate::config::ServerConfig;
use crate::db::{Store, Target};
use crate::metrics::{self, target_dimensions, Dimensions};
use crate::probe::{CheckResult, Checker};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;

/// Knobs for one check cycle.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub interval: Duration,
    pub max_concurrent_checks: usize,
    pub run_ceiling: Duration,
    /// Evaluation window for alarm rules
    pub window: Duration,
    pub memory_budget_bytes: u64,
    pub sample_retention: Duration,
}

impl From<&ServerConfig> for RunSettings {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            interval: cfg.check_interval,
            max_concurrent_checks: cfg.max_concurrent_checks.max(1),
            run_ceiling: cfg.run_ceiling,
            window: cfg.check_interval,
            memory_budget_bytes: cfg.memory_budget_bytes,
            sample_retention: cfg.sample_retention,
        }
    }
}

/// Per-run statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub sites_checked: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub run_time_ms: u64,
    pub samples_written: usize,
    pub transitions: usize,
}

/// The main scheduler that orchestrates check cycles.
pub struct Scheduler {
    store: Arc<Store>,
    checker: Checker,
    evaluator: ThresholdEvaluator,
    notifier: Arc<Notifier>,
    settings: RunSettings,
    retention_manager: RetentionManager,
    stop_tx: broadcast::Sender<()>,
}

impl Scheduler {
    /// Create a new scheduler with the given store, checker and notifier.
    pub fn new(store: Arc<Store>, checker: Checker, notifier: Arc<Notifier>, settings: RunSettings) -> Self {
        let evaluator = ThresholdEvaluator::new(store.clone(), store.clone());
        let retention_manager = RetentionManager::new(store.clone(), settings.sample_retention);
        let (stop_tx, _) = broadcast::channel(1);

        Self {
            store,
            checker,
            evaluator,
            notifier,
            settings,
            retention_manager,
            stop_tx,
        }
    }

    /// Start the periodic check loop. The first cycle runs immediately.
    pub fn start(self: &Arc<Self>) {
        tracing::info!(
            "Starting scheduler: every {:?}, up to {} concurrent checks",
            self.settings.interval,
            self.settings.max_concurrent_checks
        );

        self.retention_manager.start(self.stop_tx.subscribe());

        let scheduler = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.settings.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        tracing::info!("Scheduler shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        scheduler.run_cycle().await;
                    }
                }
            }
        });
    }

    /// Stop the check loop and the retention manager.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    /// Run one cycle over all active targets.
    pub async fn run_cycle(&self) -> RunSummary {
        let started = Instant::now();
        // Alarm windows never reach back past the start of this cycle
        let cycle_start = Utc::now();

        let targets = match self.store.list_targets(Some(true)) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!("Scheduler: Failed to get targets: {}", e);
                Vec::new()
            }
        };

        let results = self.check_all(targets).await;

        let mut summary = RunSummary {
            sites_checked: results.len(),
            ..Default::default()
        };
        for result in &results {
            if result.success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            summary.samples_written += metrics::emit_check(self.store.as_ref(), result);
        }

        let eval_time = Utc::now();
        let urls: BTreeSet<&str> = results.iter().map(|r| r.url.as_str()).collect();
        for url in urls {
            let dims = target_dimensions(url);
            for rule in rules::target_rules(self.settings.window) {
                summary.transitions += self.evaluate(&rule, &dims, cycle_start, eval_time).await;
            }
        }

        summary.run_time_ms = started.elapsed().as_millis() as u64;
        let memory = memory_utilization(self.settings.memory_budget_bytes);
        let run_time = Utc::now();
        summary.samples_written += metrics::emit_run_summary(
            self.store.as_ref(),
            summary.run_time_ms,
            summary.sites_checked,
            memory,
            run_time,
        );

        let no_dims = Dimensions::new();
        for rule in rules::run_rules(self.settings.window) {
            summary.transitions += self.evaluate(&rule, &no_dims, cycle_start, run_time).await;
        }

        tracing::info!(
            sites = summary.sites_checked,
            succeeded = summary.succeeded,
            failed = summary.failed,
            run_time_ms = summary.run_time_ms,
            transitions = summary.transitions,
            "Check cycle complete"
        );

        summary
    }

    /// Check targets in parallel, bounded by the semaphore and the run ceiling.
    /// Results arrive in completion order.
    async fn check_all(&self, targets: Vec<Target>) -> Vec<CheckResult> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_checks));
        let mut tasks = JoinSet::new();
        let total = targets.len();

        for target in targets {
            let checker = self.checker.clone();
            let semaphore = semaphore.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;

                // Add jitter to avoid thundering herd
                let jitter = rand::random::<u64>() % 100;
                tokio::time::sleep(Duration::from_millis(jitter)).await;

                Some(checker.check(&target).await)
            });
        }

        let mut results = Vec::with_capacity(total);
        let deadline = tokio::time::sleep(self.settings.run_ceiling);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(Some(result))) => results.push(result),
                    Some(Ok(None)) => {}
                    Some(Err(e)) => tracing::error!("Check task failed: {}", e),
                    None => break,
                },
                _ = &mut deadline => {
                    tracing::warn!(
                        "Run ceiling of {:?} reached; abandoning {} of {} checks",
                        self.settings.run_ceiling,
                        tasks.len(),
                        total
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        results
    }

    /// Evaluate one rule and notify on transition. Returns 1 on transition.
    async fn evaluate(&self, rule: &AlarmRule, dims: &Dimensions, since: DateTime<Utc>, now: DateTime<Utc>) -> usize {
        match self.evaluator.evaluate_since(rule, dims, Some(since), now) {
            Ok(Some(event)) => {
                self.notifier.notify(&event).await;
                1
            }
            Ok(None) => 0,
            Err(e) => {
                tracing::error!(alarm = %rule.alarm_name(dims), "Alarm evaluation failed: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{AlarmHistory, AlarmStateStore, NotifyTarget, StateValue};
    use crate::db::NewTarget;
    use crate::metrics::{RUN_NAMESPACE, SITES_CHECKED};
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn settings() -> RunSettings {
        RunSettings {
            interval: Duration::from_secs(300),
            max_concurrent_checks: 2,
            run_ceiling: Duration::from_secs(10),
            window: Duration::from_secs(300),
            memory_budget_bytes: 128 * 1024 * 1024,
            sample_retention: Duration::from_secs(3600),
        }
    }

    fn scheduler(settings: RunSettings, timeout: Duration) -> (NamedTempFile, Arc<Store>, Scheduler) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let checker = Checker::new(timeout, "Mozilla/5.0 (test)").unwrap();
        let notifier = Arc::new(Notifier::new(vec![NotifyTarget::Log], store.clone(), timeout).unwrap());
        let scheduler = Scheduler::new(store.clone(), checker, notifier, settings);
        (tmp, store, scheduler)
    }

    /// Serve `200 OK` to every connection.
    async fn serve_ok() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                        .await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    const OK: &str = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";
    const UNAVAILABLE: &str = "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

    /// Answer the n-th connection with `script[n]` after its delay; the last
    /// entry repeats.
    async fn serve_script(script: Vec<(u64, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut n = 0;
            while let Ok((mut socket, _)) = listener.accept().await {
                let (delay_ms, response) = script[n.min(script.len() - 1)];
                n += 1;
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    async fn unreachable_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_cycle_checks_only_active_targets() {
        let (_tmp, store, scheduler) = scheduler(settings(), Duration::from_secs(2));
        let url_a = serve_ok().await;
        store.add_target(&NewTarget::new(url_a.clone())).unwrap();
        store
            .add_target(&NewTarget {
                url: unreachable_url().await,
                active: Some(false),
                ..Default::default()
            })
            .unwrap();

        let summary = scheduler.run_cycle().await;
        assert_eq!(summary.sites_checked, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 0);

        let now = Utc::now();
        let sites = store
            .get_sample_values(
                RUN_NAMESPACE,
                SITES_CHECKED,
                &Dimensions::new(),
                now - ChronoDuration::hours(1),
                now + ChronoDuration::minutes(1),
            )
            .unwrap();
        assert_eq!(sites, vec![1.0]);

        let availability = store
            .get_alarm_state(&format!("Availability:{}", url_a))
            .unwrap()
            .unwrap();
        assert_eq!(availability.state, StateValue::Ok);
    }

    #[tokio::test]
    async fn test_failing_target_alarms_on_second_cycle() {
        let (_tmp, store, scheduler) = scheduler(settings(), Duration::from_secs(1));
        let down = unreachable_url().await;
        let up = serve_ok().await;
        store.add_target(&NewTarget::new(down.clone())).unwrap();
        store.add_target(&NewTarget::new(up.clone())).unwrap();

        let first = scheduler.run_cycle().await;
        assert_eq!(first.sites_checked, 2);
        assert_eq!(first.failed, 1);

        let alarm_name = format!("Availability:{}", down);
        assert!(store.alarm_events(&alarm_name, "0000", "9999").unwrap().is_empty());

        scheduler.run_cycle().await;
        let events = store.alarm_events(&alarm_name, "0000", "9999").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].new_state, "ALARM");

        // The healthy target is unaffected
        let healthy = store.get_alarm_state(&format!("Availability:{}", up)).unwrap().unwrap();
        assert_eq!(healthy.state, StateValue::Ok);
    }

    #[tokio::test]
    async fn test_single_failure_then_recovery_does_not_alarm() {
        let mut s = settings();
        s.interval = Duration::from_secs(1);
        s.window = Duration::from_secs(1);
        s.max_concurrent_checks = 1;
        let (_tmp, store, scheduler) = scheduler(s, Duration::from_secs(2));

        // The slow target is checked first, so the flaky target's first sample
        // lands late in cycle one.
        let slow = serve_script(vec![(500, OK), (0, OK)]).await;
        let flaky = serve_script(vec![(0, UNAVAILABLE), (0, OK)]).await;
        store.add_target(&NewTarget::new(slow)).unwrap();
        store.add_target(&NewTarget::new(flaky.clone())).unwrap();

        let started = tokio::time::Instant::now();
        let first = scheduler.run_cycle().await;
        assert_eq!(first.failed, 1);

        tokio::time::sleep_until(started + Duration::from_secs(1)).await;
        let second = scheduler.run_cycle().await;
        assert_eq!(second.failed, 0);

        let alarm_name = format!("Availability:{}", flaky);
        let events = store.alarm_events(&alarm_name, "0000", "9999").unwrap();
        assert!(events.iter().all(|e| e.new_state != "ALARM"));
        let state = store.get_alarm_state(&alarm_name).unwrap().unwrap();
        assert_eq!(state.state, StateValue::Ok);
        assert_eq!(state.consecutive_breach_count, 0);
    }

    #[tokio::test]
    async fn test_run_ceiling_abandons_slow_checks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut s = settings();
        s.run_ceiling = Duration::from_millis(300);
        let (_tmp, store, scheduler) = scheduler(s, Duration::from_secs(10));
        store.add_target(&NewTarget::new(format!("http://{}", addr))).unwrap();

        let started = Instant::now();
        let summary = scheduler.run_cycle().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(summary.sites_checked, 0);
        // Run-level samples are still written
        assert!(summary.samples_written >= 2);
    }

    #[tokio::test]
    async fn test_empty_store() {
        let (_tmp, _store, scheduler) = scheduler(settings(), Duration::from_secs(1));
        let summary = scheduler.run_cycle().await;
        assert_eq!(summary.sites_checked, 0);
        assert!(summary.samples_written >= 2);
    }
}

//! Retention manager for pruning old metric samples.

use crate::db::Store;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Manager for deleting samples past their retention period.
pub struct RetentionManager {
    store: Arc<Store>,
    retention: Duration,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, retention: Duration) -> Self {
        Self { store, retention }
    }

    /// Start the retention manager background task.
    pub fn start(&self, mut stop_rx: broadcast::Receiver<()>) {
        let store = self.store.clone();
        let retention = self.retention;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&store, retention);
                    }
                }
            }
        });
    }
}

/// Delete samples older than `retention`. Returns the number removed.
pub fn process_retention(store: &Store, retention: Duration) -> usize {
    let keep = ChronoDuration::from_std(retention).unwrap_or_else(|_| ChronoDuration::days(7));
    let cutoff = Utc::now() - keep;

    match store.delete_samples_before(cutoff) {
        Ok(removed) => {
            if removed > 0 {
                tracing::debug!("RetentionManager: Deleted {} samples", removed);
            }
            removed
        }
        Err(e) => {
            tracing::error!("RetentionManager: Failed to delete samples: {}", e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricSample, Unit};
    use tempfile::NamedTempFile;

    #[test]
    fn test_process_retention() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let now = Utc::now();
        store
            .add_metric_samples(&[
                MetricSample::new("ns", "m", 1.0, Unit::Count, now - ChronoDuration::days(10)),
                MetricSample::new("ns", "m", 1.0, Unit::Count, now),
            ])
            .unwrap();

        assert_eq!(process_retention(&store, Duration::from_secs(7 * 24 * 3600)), 1);
        assert_eq!(process_retention(&store, Duration::from_secs(7 * 24 * 3600)), 0);
    }
}

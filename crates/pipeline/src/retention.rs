//! Periodic eviction of finished tasks.
//!
//! Terminal tasks remain queryable for the configured retention period
//! after they finish, then a background loop driven by
//! `tokio::time::interval` drops them from the tracker. Tasks that have
//! not finished are never evicted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use miktos_core::tracker::TaskTracker;
use tokio_util::sync::CancellationToken;

/// Evict every task that finished more than `retention` ago. Returns the
/// number of tasks removed.
pub fn sweep(tracker: &TaskTracker, retention: Duration) -> usize {
    // Retentions beyond chrono's range keep everything.
    let Ok(retention) = chrono::Duration::from_std(retention) else {
        return 0;
    };
    let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
        return 0;
    };
    tracker.evict_finished_before(cutoff)
}

/// Run the retention loop until `cancel` is triggered.
pub async fn run(
    tracker: Arc<TaskTracker>,
    retention: Duration,
    every: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        retention_secs = retention.as_secs(),
        interval_secs = every.as_secs(),
        "Task retention job started"
    );

    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Task retention job stopping");
                break;
            }
            _ = interval.tick() => {
                let evicted = sweep(&tracker, retention);
                if evicted > 0 {
                    tracing::info!(evicted, remaining = tracker.len(), "Task retention: evicted finished tasks");
                } else {
                    tracing::debug!("Task retention: nothing to evict");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use miktos_core::task::TaskError;

    use super::*;

    fn finished(tracker: &TaskTracker) {
        let task = tracker.create("basic_texture", Default::default());
        tracker.transition_to_running(task.id).unwrap();
        tracker.fail(task.id, TaskError::cancelled()).unwrap();
    }

    #[test]
    fn sweep_respects_retention() {
        let tracker = TaskTracker::new();
        finished(&tracker);
        let active = tracker.create("basic_texture", Default::default());

        assert_eq!(sweep(&tracker, Duration::from_secs(3600)), 0);
        assert_eq!(tracker.len(), 2);

        assert_eq!(sweep(&tracker, Duration::ZERO), 1);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.get(active.id).is_ok());
    }

    #[test]
    fn huge_retention_never_overflows() {
        let tracker = TaskTracker::new();
        finished(&tracker);
        assert_eq!(sweep(&tracker, Duration::MAX), 0);
    }

    #[tokio::test]
    async fn loop_stops_on_cancel() {
        let tracker = Arc::new(TaskTracker::new());
        finished(&tracker);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run(
            Arc::clone(&tracker),
            Duration::ZERO,
            Duration::from_millis(5),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(tracker.is_empty());
    }
}

//! Delayed, unconditional sandbox deletion.
//!
//! Every created sandbox is handed to the [`CleanupScheduler`] with the
//! configured TTL. The deletion fires whether or not the run was stopped or
//! polled in the meantime; the platform treats an already-absent sandbox as
//! success, so a re-delete after an operator stop is harmless.
//!
//! Scheduled tasks are detached from the request that created them, but
//! they are tied to the scheduler's shutdown token: on shutdown every
//! pending deletion fires immediately instead of waiting out its delay.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::PlatformError;
use crate::platform::SandboxPlatform;

/// Owns the set of pending TTL deletions.
pub struct CleanupScheduler {
    platform: Arc<dyn SandboxPlatform>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl CleanupScheduler {
    pub fn new(platform: Arc<dyn SandboxPlatform>) -> Self {
        Self {
            platform,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Delete `sandbox_id` after `delay`.
    ///
    /// Scheduling after [`shutdown`](Self::shutdown) deletes immediately.
    pub fn schedule(&self, namespace: &str, sandbox_id: &str, delay: Duration) {
        let platform = Arc::clone(&self.platform);
        let shutdown = self.shutdown.clone();
        let namespace = namespace.to_string();
        let sandbox_id = sandbox_id.to_string();

        self.tasks.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => {
                    tracing::debug!(sandbox_id = %sandbox_id, "Shutting down, deleting sandbox early");
                }
            }

            match platform.delete(&namespace, &sandbox_id).await {
                Ok(()) | Err(PlatformError::NotFound { .. }) => {
                    tracing::info!(sandbox_id = %sandbox_id, namespace = %namespace, "TTL cleanup deleted sandbox");
                }
                Err(e) => {
                    tracing::warn!(sandbox_id = %sandbox_id, error = %e, "TTL cleanup failed to delete sandbox");
                }
            }
        });
    }

    /// Number of deletions that have not completed yet.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Fire every pending deletion now and wait up to `grace` for them.
    pub async fn shutdown(&self, grace: Duration) {
        let pending = self.tasks.len();
        self.shutdown.cancel();
        self.tasks.close();

        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            tracing::warn!(
                pending = self.tasks.len(),
                "Cleanup did not finish before the shutdown grace period"
            );
        } else if pending > 0 {
            tracing::info!(pending, "Flushed pending sandbox cleanups");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubPlatform;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletes_only_after_delay() {
        let platform = Arc::new(StubPlatform::new());
        platform.insert("ns", "sbx-1");
        let scheduler = CleanupScheduler::new(platform.clone());

        scheduler.schedule("ns", "sbx-1", Duration::from_secs(120));
        settle().await;

        tokio::time::advance(Duration::from_secs(119)).await;
        settle().await;
        assert_eq!(platform.delete_calls(), 0);
        assert!(platform.exists("sbx-1"));

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(platform.delete_calls(), 1);
        assert!(!platform.exists("sbx-1"));
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_deleted_sandbox_is_harmless() {
        let platform = Arc::new(StubPlatform::new());
        let scheduler = CleanupScheduler::new(platform.clone());

        scheduler.schedule("ns", "gone", Duration::from_secs(1));
        settle().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;

        assert_eq!(platform.delete_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_failure_is_swallowed() {
        let platform = Arc::new(StubPlatform::new());
        platform.fail_delete(true);
        let scheduler = CleanupScheduler::new(platform.clone());

        scheduler.schedule("ns", "sbx-1", Duration::from_secs(1));
        settle().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;

        assert_eq!(platform.delete_calls(), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fires_pending_deletions() {
        let platform = Arc::new(StubPlatform::new());
        platform.insert("ns", "sbx-1");
        platform.insert("ns", "sbx-2");
        let scheduler = CleanupScheduler::new(platform.clone());

        scheduler.schedule("ns", "sbx-1", Duration::from_secs(3600));
        scheduler.schedule("ns", "sbx-2", Duration::from_secs(7200));
        assert_eq!(scheduler.pending(), 2);

        scheduler.shutdown(Duration::from_secs(5)).await;

        assert_eq!(platform.delete_calls(), 2);
        assert!(!platform.exists("sbx-1"));
        assert!(!platform.exists("sbx-2"));
    }
}

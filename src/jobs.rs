//! Background job execution.
//!
//! Jobs are fire-and-forget: `submit` schedules the work on its own task and
//! returns immediately, so the request that submitted it can respond without
//! waiting. Job inputs must be owned values captured at submission time,
//! never references to request-scoped state.
//!
//! Errors and panics are caught at the job boundary and logged; they never
//! crash the process and never propagate to the submitter. Compensating
//! actions (ledger refunds) are the job's own responsibility.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::metrics;

/// Spawns background jobs and tracks them for graceful shutdown.
///
/// There is no queue depth limit or backpressure: every submission spawns a
/// task immediately.
#[derive(Clone)]
pub struct JobRunner {
    active: Arc<AtomicUsize>,
    draining: Arc<AtomicBool>,
    idle: Arc<Notify>,
}

impl JobRunner {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            draining: Arc::new(AtomicBool::new(false)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Schedule `job` to run on an independent task and return immediately.
    ///
    /// The job's `Err` is logged, a panic is caught and logged; neither
    /// reaches the caller. Returns `false` if the runner is draining and the
    /// job was rejected.
    pub fn submit<F>(&self, name: &'static str, job: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        if self.draining.load(Ordering::SeqCst) {
            warn!(job = name, "Job rejected: runner is draining");
            return false;
        }

        self.active.fetch_add(1, Ordering::SeqCst);
        metrics::inc_active_jobs();
        metrics::record_job_submitted(name);

        let active = Arc::clone(&self.active);
        let idle = Arc::clone(&self.idle);

        tokio::spawn(async move {
            match AssertUnwindSafe(job).catch_unwind().await {
                Ok(Ok(())) => {
                    debug!(job = name, "Job completed");
                    metrics::record_job_finished(name, "completed");
                }
                Ok(Err(e)) => {
                    error!(job = name, error = %e, "Job failed");
                    metrics::record_job_finished(name, "failed");
                }
                Err(_) => {
                    error!(job = name, "Job panicked");
                    metrics::record_job_finished(name, "panicked");
                }
            }

            active.fetch_sub(1, Ordering::SeqCst);
            metrics::dec_active_jobs();
            idle.notify_waiters();
        });

        true
    }

    /// Number of jobs currently running.
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop accepting new jobs.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Wait until all in-flight jobs finish, up to `timeout`.
    /// Returns `true` when the runner drained fully.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.active_jobs() == 0 {
                return true;
            }
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register interest before re-checking, so a completion between
            // the check and the await cannot be missed.
            notified.as_mut().enable();
            if self.active_jobs() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let drained = self.active_jobs() == 0;
                if !drained {
                    warn!(
                        remaining = self.active_jobs(),
                        "Drain timed out with jobs still running"
                    );
                }
                return drained;
            }
        }
    }
}

impl Default for JobRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_submit_returns_before_job_finishes() {
        let runner = JobRunner::new();
        let accepted = runner.submit("slow", async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });
        assert!(accepted);
        assert_eq!(runner.active_jobs(), 1);
        assert!(runner.drain(Duration::from_secs(1)).await);
        assert_eq!(runner.active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_failed_job_does_not_crash_runner() {
        let runner = JobRunner::new();
        runner.submit("failing", async {
            Err(Error::Upstream("generation failed".to_string()))
        });
        assert!(runner.drain(Duration::from_secs(1)).await);

        // Runner keeps accepting work after a failure
        assert!(runner.submit("after-failure", async { Ok(()) }));
        assert!(runner.drain(Duration::from_secs(1)).await);
    }

    async fn explode() -> crate::Result<()> {
        panic!("boom");
    }

    #[tokio::test]
    async fn test_panicking_job_is_contained() {
        let runner = JobRunner::new();
        runner.submit("panicking", explode());
        assert!(runner.drain(Duration::from_secs(1)).await);
        assert!(runner.submit("survivor", async { Ok(()) }));
        assert!(runner.drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_drain_rejects_new_jobs() {
        let runner = JobRunner::new();
        runner.begin_drain();
        assert!(!runner.submit("late", async { Ok(()) }));
        assert_eq!(runner.active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_jobs_all_finish() {
        let runner = JobRunner::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            runner.submit("batch", async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert!(runner.drain(Duration::from_secs(1)).await);
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }
}

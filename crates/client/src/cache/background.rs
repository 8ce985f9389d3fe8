//! Bounded pool for fire-and-forget cache work.
//!
//! Saves, refreshes and pre-warms run here so the caller of `load` never waits
//! on them. When every permit is taken new jobs are dropped with a warning
//! instead of piling up.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use outpost_core::Error;

#[derive(Debug)]
pub struct BackgroundPool {
    permits: Arc<Semaphore>,
    limit: usize,
    done: Arc<Notify>,
}

impl BackgroundPool {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self { permits: Arc::new(Semaphore::new(limit)), limit, done: Arc::new(Notify::new()) }
    }

    /// Run `job` in the background. Returns false if the pool is saturated
    /// and the job was dropped.
    pub fn spawn<F>(&self, label: &'static str, job: F) -> bool
    where
        F: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            tracing::warn!(job = label, limit = self.limit, "background pool saturated, dropping job");
            return false;
        };

        let guard = JobGuard { permit: Some(permit), done: Arc::clone(&self.done) };
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = job.await {
                tracing::warn!(job = label, error = %e, "background job failed");
            }
        });
        true
    }

    /// Number of jobs currently running.
    pub fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    /// Wait until no job is running, including jobs spawned by other jobs.
    pub async fn idle(&self) {
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Releases the job's permit, then wakes anyone waiting in [`BackgroundPool::idle`].
struct JobGuard {
    permit: Option<OwnedSemaphorePermit>,
    done: Arc<Notify>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.done.notify_waiters();
    }
}

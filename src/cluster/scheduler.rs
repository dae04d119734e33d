//! Delayed and immediate task execution.
//!
//! Fault detection never blocks a worker waiting for the next ping: every
//! ping round is handed to a [`Scheduler`] as a one-shot task, and failure
//! listeners run through [`Scheduler::execute`] so they never execute inline
//! on the transport's completion path.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;

use crate::errors::SchedulerError;

/// A unit of work handed to a [`Scheduler`].
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// One-shot task execution contract.
pub trait Scheduler: Send + Sync + 'static {
    /// Run `task` once after `delay`.  A zero delay runs it as soon as
    /// possible, but never inline.
    fn schedule(&self, delay: Duration, task: Task) -> Result<(), SchedulerError>;

    /// Run `task` on the generic executor.
    fn execute(&self, task: Task) -> Result<(), SchedulerError>;
}

/// [`Scheduler`] backed by a tokio runtime.
///
/// After [`TokioScheduler::close`] every submission is rejected, which is
/// how a node shutting down refuses new work.
pub struct TokioScheduler {
    handle: Handle,
    closed: AtomicBool,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            closed: AtomicBool::new(false),
        }
    }

    /// Scheduler on the runtime the caller is running in.
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Reject all further submissions.  Tasks already submitted still run.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn ensure_open(&self) -> Result<(), SchedulerError> {
        if self.closed.load(Ordering::Acquire) {
            Err(SchedulerError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> Result<(), SchedulerError> {
        self.ensure_open()?;
        self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task.await;
        });
        Ok(())
    }

    fn execute(&self, task: Task) -> Result<(), SchedulerError> {
        self.ensure_open()?;
        self.handle.spawn(task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_runs_after_delay() {
        let scheduler = TokioScheduler::current();
        let start = Instant::now();
        let (tx, rx) = tokio::sync::oneshot::channel();

        scheduler
            .schedule(
                Duration::from_secs(5),
                Box::pin(async move {
                    let _ = tx.send(Instant::now());
                }),
            )
            .unwrap();

        let ran_at = rx.await.unwrap();
        assert_eq!(ran_at - start, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_execute_runs_task() {
        let scheduler = TokioScheduler::current();
        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler
            .execute(Box::pin(async move {
                let _ = tx.send(42);
            }))
            .unwrap();
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_closed_scheduler_rejects_tasks() {
        let scheduler = TokioScheduler::current();
        let ran = Arc::new(AtomicUsize::new(0));
        scheduler.close();

        let counter = Arc::clone(&ran);
        let result = scheduler.execute(Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(result, Err(SchedulerError::Closed));
        assert_eq!(
            scheduler.schedule(Duration::ZERO, Box::pin(async {})),
            Err(SchedulerError::Closed)
        );

        tokio::task::yield_now().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}

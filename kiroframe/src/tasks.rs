//! Dispatch-now, join-later execution of I/O units.
//!
//! Each unit runs in its own tokio task but holds a semaphore permit while it works, so at
//! most `max_concurrent` units do I/O at the same time no matter how many were dispatched.
//! Failures are kept inside the task until [`TaskRunner::join`], which waits for every
//! recorded unit and only then reports the first failure in dispatch order.
//!
//! A runner is one batch. [`TaskRunner::batch`] opens another batch under the same bound, so
//! an operation joins exactly the units it dispatched.

use std::{
    fmt,
    future::Future,
    num::NonZeroU16,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::{
    sync::{Mutex as AsyncMutex, Semaphore},
    task::{JoinError, JoinHandle},
};
use tracing::{debug, warn};

pub struct TaskRunner<E> {
    semaphore: Arc<Semaphore>,
    pending: Mutex<Vec<JoinHandle<Result<(), E>>>>,
    /// Held for the whole of a join, so a second joiner returns only once the first is done.
    joining: AsyncMutex<()>,
}

impl<E> fmt::Debug for TaskRunner<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("available_permits", &self.semaphore.available_permits())
            .field("pending", &self.lock().len())
            .finish()
    }
}

impl<E> TaskRunner<E> {
    fn lock(&self) -> MutexGuard<'_, Vec<JoinHandle<Result<(), E>>>> {
        // handles stay valid even if a holder panicked
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of units dispatched and not yet joined.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }
}

impl<E> TaskRunner<E>
where
    E: fmt::Display + Send + 'static,
{
    pub fn new(max_concurrent: NonZeroU16) -> Self {
        Self::with_semaphore(Arc::new(Semaphore::new(max_concurrent.get() as usize)))
    }

    fn with_semaphore(semaphore: Arc<Semaphore>) -> Self {
        Self { semaphore, pending: Mutex::new(Vec::new()), joining: AsyncMutex::new(()) }
    }

    /// An empty batch sharing this runner's concurrency bound.
    pub fn batch(&self) -> Self {
        Self::with_semaphore(Arc::clone(&self.semaphore))
    }

    /// Start `unit` in the background. Never waits for a permit.
    pub fn spawn<F>(&self, unit: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let handle = tokio::spawn(async move {
            // the semaphore is never closed, a missing permit only lifts the bound
            let _permit = semaphore.acquire_owned().await.ok();
            unit.await
        });
        self.lock().push(handle);
    }

    /// Wait for every unit dispatched so far, then return the first failure, if any.
    pub async fn join(&self) -> Result<(), E>
    where
        E: From<JoinError>,
    {
        let _joining = self.joining.lock().await;
        let handles = std::mem::take(&mut *self.lock());
        if handles.is_empty() {
            return Ok(());
        }
        debug!(units = handles.len(), "joining units");

        let mut first_error = None;
        let mut failures = 0usize;
        for handle in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(err) => Err(E::from(err)),
            };
            if let Err(err) = outcome {
                failures += 1;
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    warn!(error = %err, "unit failed, reporting the first failure only");
                }
            }
        }

        match first_error {
            Some(err) => {
                debug!(failures, "batch failed");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use pretty_assertions::assert_eq;
    use thiserror::Error;

    use super::*;

    #[derive(Debug, Error)]
    enum UnitError {
        #[error("unit {0} failed")]
        Failed(usize),
        #[error("unit panicked")]
        Join(#[from] JoinError),
    }

    fn runner(max: u16) -> TaskRunner<UnitError> {
        TaskRunner::new(NonZeroU16::new(max).unwrap())
    }

    #[kiroframe_macros::tokio_test]
    async fn test_join_empty() {
        assert!(runner(4).join().await.is_ok());
    }

    #[kiroframe_macros::tokio_test]
    async fn test_first_failure_after_all_finished() {
        let runner = runner(8);
        let finished = Arc::new(AtomicUsize::new(0));
        for i in 0..6usize {
            let finished = Arc::clone(&finished);
            runner.spawn(async move {
                // early failures return first, later units are slower
                tokio::time::sleep(Duration::from_millis(5 * i as u64)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                if i == 1 || i == 4 { Err(UnitError::Failed(i)) } else { Ok(()) }
            });
        }
        assert_eq!(runner.pending(), 6);

        let res = runner.join().await;
        assert!(matches!(res, Err(UnitError::Failed(1))));
        assert_eq!(finished.load(Ordering::SeqCst), 6);
        assert_eq!(runner.pending(), 0);
        // joined failures are not reported twice
        assert!(runner.join().await.is_ok());
    }

    #[kiroframe_macros::tokio_test]
    async fn test_concurrency_is_bounded() {
        let runner = runner(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            runner.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        runner.join().await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[kiroframe_macros::tokio_test]
    async fn test_panics_become_errors() {
        let runner = runner(1);
        runner.spawn(async { Ok(()) });
        let fail = true;
        runner.spawn(async move {
            if fail {
                panic!("boom");
            }
            Ok(())
        });
        assert!(matches!(runner.join().await, Err(UnitError::Join(_))));
    }

    #[kiroframe_macros::tokio_test]
    async fn test_batches_join_their_own_units() {
        let runner = runner(2);
        let batch = runner.batch();
        batch.spawn(async { Err(UnitError::Failed(7)) });
        runner.spawn(async { Ok(()) });

        assert!(runner.join().await.is_ok());
        assert_eq!(batch.pending(), 1);
        assert!(matches!(batch.join().await, Err(UnitError::Failed(7))));
    }

    #[kiroframe_macros::tokio_test]
    async fn test_batches_share_the_bound() {
        let runner = runner(1);
        let batch = runner.batch();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for target in [&runner, &batch, &runner, &batch] {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            target.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let (a, b) = tokio::join!(runner.join(), batch.join());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[kiroframe_macros::tokio_test]
    async fn test_concurrent_joiners_wait_for_the_batch() {
        let runner = Arc::new(runner(4));
        let finished = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let finished = Arc::clone(&finished);
            runner.spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let first = tokio::spawn({
            let runner = Arc::clone(&runner);
            async move { runner.join().await }
        });
        tokio::task::yield_now().await;
        runner.join().await.unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        first.await.unwrap().unwrap();
    }
}

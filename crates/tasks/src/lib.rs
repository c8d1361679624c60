//! Bounded-concurrency execution for token manufacture (spec §4.3: batches
//! are filled by manufacturing up to `batchTokenCount` tokens concurrently,
//! but concurrency is capped rather than left unbounded).
//!
//! [`TaskExecutor`] is deliberately narrower than a general-purpose spawner:
//! it runs a fixed pool of jobs against a [`tokio::sync::Semaphore`] gate and
//! collects every result, rather than exposing fire-and-forget `spawn`. The
//! orchestrator needs "run these N closures, wait for all of them, bounded to
//! C in flight" — it does not need detached background tasks or a shutdown
//! protocol.

mod metrics;

use std::{future::Future, sync::Arc};

use metrics::TaskExecutorMetrics;
use tokio::sync::Semaphore;

/// Default bound on concurrently in-flight jobs when none is configured.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Runs futures with a bounded number concurrently in flight.
#[derive(Clone)]
pub struct TaskExecutor {
    semaphore: Arc<Semaphore>,
    metrics: TaskExecutorMetrics,
}

impl TaskExecutor {
    /// A new executor allowing up to `concurrency` jobs in flight at once.
    ///
    /// `concurrency` is clamped to at least 1.
    pub fn new(concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            metrics: TaskExecutorMetrics::default(),
        }
    }

    /// Runs every job in `jobs` on the current runtime, bounded by this
    /// executor's concurrency limit, returning results in the same order as
    /// the input. A job whose future panics contributes `None` in its slot
    /// rather than poisoning the rest of the batch.
    pub async fn run_bounded<I, F, T>(&self, jobs: I) -> Vec<Option<T>>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let permit = self.semaphore.clone();
                let metrics = self.metrics.clone();
                tokio::spawn(async move {
                    let _permit = permit
                        .acquire_owned()
                        .await
                        .expect("executor semaphore is never closed");
                    metrics.inc_spawned();
                    let out = job.await;
                    metrics.inc_finished();
                    out
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(value) => results.push(Some(value)),
                Err(join_err) => {
                    self.metrics.inc_panicked();
                    tracing::error!(error = %join_err, "token manufacture job panicked");
                    results.push(None);
                }
            }
        }
        results
    }
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_every_job_and_preserves_order() {
        let executor = TaskExecutor::new(2);
        let jobs = (0..10).map(|i| async move { i * 2 });
        let results = executor.run_bounded(jobs).await;
        let expected: Vec<Option<i32>> = (0..10).map(|i| Some(i * 2)).collect();
        assert_eq!(results, expected);
    }

    #[tokio::test]
    async fn never_exceeds_configured_concurrency() {
        let executor = TaskExecutor::new(3);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let jobs = (0..20).map(|_| {
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        });
        executor.run_bounded(jobs).await;
        assert!(max_seen.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn a_panicking_job_does_not_take_down_the_batch() {
        let executor = TaskExecutor::new(4);
        let jobs: Vec<std::pin::Pin<Box<dyn Future<Output = i32> + Send>>> = vec![
            Box::pin(async { 1 }),
            Box::pin(async {
                panic!("boom");
            }),
            Box::pin(async { 3 }),
        ];
        let results = executor.run_bounded(jobs).await;
        assert_eq!(results[0], Some(1));
        assert_eq!(results[1], None);
        assert_eq!(results[2], Some(3));
    }
}

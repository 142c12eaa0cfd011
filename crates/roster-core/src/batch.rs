//! Settle-all batch executor
//!
//! Fans a set of independent calls out concurrently and captures every
//! outcome. A failing item never cancels its siblings and never surfaces as
//! an error of [`BatchExecutor::run`] itself; the caller inspects
//! [`BatchResults`] and decides what to log.

use futures::future::join_all;
use std::fmt::Display;
use std::future::Future;

/// Outcome of a single batch item
#[derive(Debug, Clone)]
pub struct Settled<I, T, E> {
    /// The input item
    pub item: I,
    /// What the call returned
    pub result: Result<T, E>,
}

/// Per-item outcomes of one batch, in no particular order
#[derive(Debug, Clone)]
pub struct BatchResults<I, T, E> {
    outcomes: Vec<Settled<I, T, E>>,
}

impl<I, T, E> BatchResults<I, T, E> {
    /// Number of items dispatched
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Whether nothing was dispatched
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Number of failed items
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
    }

    /// Successful items with their values
    pub fn succeeded(&self) -> impl Iterator<Item = (&I, &T)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|v| (&o.item, v)))
    }

    /// Failed items with their errors
    pub fn failed(&self) -> impl Iterator<Item = (&I, &E)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (&o.item, e)))
    }

    /// Split into successes and failures
    #[must_use]
    pub fn into_parts(self) -> (Vec<(I, T)>, Vec<(I, E)>) {
        let mut ok = Vec::new();
        let mut failed = Vec::new();
        for outcome in self.outcomes {
            match outcome.result {
                Ok(value) => ok.push((outcome.item, value)),
                Err(err) => failed.push((outcome.item, err)),
            }
        }
        (ok, failed)
    }

    /// Emit one warning per failed item
    pub fn log_failures(&self, operation: &str)
    where
        I: std::fmt::Debug,
        E: Display,
    {
        for (item, err) in self.failed() {
            tracing::warn!(operation, item = ?item, error = %err, "batch item failed");
        }
    }
}

/// Bounded concurrent fan-out with per-item failure isolation
#[derive(Debug, Clone, Copy)]
pub struct BatchExecutor {
    chunk_size: usize,
}

impl BatchExecutor {
    /// Create an executor; a zero chunk size is treated as one
    #[inline]
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Configured chunk size
    #[inline]
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Run `f` for every item
    ///
    /// Items are split into chunks of `chunk_size`; all chunks are dispatched
    /// concurrently and so are the items within a chunk. Every outcome is
    /// captured.
    pub async fn run<I, T, E, F, Fut>(&self, items: Vec<I>, f: F) -> BatchResults<I, T, E>
    where
        I: Clone,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if items.is_empty() {
            return BatchResults {
                outcomes: Vec::new(),
            };
        }

        let f = &f;
        let chunks = items.chunks(self.chunk_size).map(|chunk| {
            join_all(chunk.iter().cloned().map(|item| async move {
                let result = f(item.clone()).await;
                Settled { item, result }
            }))
        });

        let outcomes = join_all(chunks).await.into_iter().flatten().collect();
        BatchResults { outcomes }
    }
}

impl Default for BatchExecutor {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Split `items` into vectors of at most `size` elements
#[must_use]
pub fn chunked<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items.chunks(size.max(1)).map(<[T]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn runs_every_item() {
        let executor = BatchExecutor::new(3);
        let results = executor
            .run((0..10).collect(), |n: u32| async move { Ok::<_, String>(n * 2) })
            .await;

        assert_eq!(results.len(), 10);
        assert_eq!(results.failure_count(), 0);
        let mut doubled: Vec<u32> = results.succeeded().map(|(_, v)| *v).collect();
        doubled.sort_unstable();
        assert_eq!(doubled, (0..10).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failures_do_not_abort_siblings() {
        let executor = BatchExecutor::new(2);
        let calls = Arc::new(AtomicUsize::new(0));

        let results = executor
            .run((0..7).collect(), |n: u32| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if n == 1 {
                        Err(format!("item {n} failed"))
                    } else {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 7);
        assert_eq!(results.failure_count(), 1);

        let (ok, failed) = results.into_parts();
        assert_eq!(ok.len(), 6);
        assert_eq!(failed, vec![(1, "item 1 failed".to_string())]);
    }

    #[tokio::test]
    async fn chunks_run_concurrently() {
        let executor = BatchExecutor::new(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        executor
            .run((0..6).collect(), |_n: u32| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, ()>(())
                }
            })
            .await;

        assert_eq!(peak.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn empty_input() {
        let results = BatchExecutor::default()
            .run(Vec::<u8>::new(), |n| async move { Ok::<_, ()>(n) })
            .await;
        assert!(results.is_empty());
    }

    #[test]
    fn chunked_splits_evenly() {
        let chunks = chunked(&[1, 2, 3, 4, 5], 2);
        assert_eq!(chunks, vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert_eq!(BatchExecutor::new(0).chunk_size(), 1);
    }
}

//! Call deadlines and bounded-concurrency batch dispatch.

use std::future::Future;
use std::pin::pin;
use std::time::Duration;

use cachet_core::{StorageError, StorageResult};
use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use tokio::time::{timeout_at, Instant};
use tracing::trace;

/// Overall deadline of one backend call. `Deadline::none()` never expires.
///
/// A deadline may also cap how many sub-operations a batch call keeps in
/// flight. The cap only ever lowers the backend's own limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
    concurrency: Option<usize>,
}

impl Deadline {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn at(instant: Instant) -> Self {
        Self {
            at: Some(instant),
            concurrency: None,
        }
    }

    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    /// Cap batch fan-out at `limit` in-flight sub-operations.
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit.max(1));
        self
    }

    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    /// Effective fan-out given the backend's own `limit`.
    pub fn concurrency(&self, limit: usize) -> usize {
        match self.concurrency {
            Some(cap) => cap.min(limit),
            None => limit,
        }
        .max(1)
    }

    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Run `fut`, failing with `Timeout` if it does not finish in time.
    pub async fn run<T, F>(&self, backend: &str, fut: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        match self.at {
            None => fut.await,
            Some(at) => timeout_at(at, fut)
                .await
                .unwrap_or_else(|_| Err(StorageError::timeout(backend))),
        }
    }
}

/// Apply `op` to every item with at most `limit` calls in flight, lowered
/// further by the deadline's concurrency cap.
///
/// Results come back in input order. When the deadline passes, pending calls
/// are dropped and reported as `Timeout`; results that already arrived are
/// kept.
pub async fn dispatch<I, T, F, Fut>(
    backend: &str,
    items: Vec<I>,
    limit: usize,
    deadline: Deadline,
    op: F,
) -> Vec<StorageResult<T>>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let total = items.len();
    let mut results: Vec<Option<StorageResult<T>>> = (0..total).map(|_| None).collect();

    let mut pending = pin!(stream::iter(items.into_iter().enumerate())
        .map(|(index, item)| op(item).map(move |result| (index, result)))
        .buffer_unordered(deadline.concurrency(limit)));

    loop {
        let next = match deadline.instant() {
            None => pending.next().await,
            Some(at) => match timeout_at(at, pending.next()).await {
                Ok(next) => next,
                Err(_) => break,
            },
        };
        match next {
            Some((index, result)) => results[index] = Some(result),
            None => break,
        }
    }

    let completed = results.iter().filter(|r| r.is_some()).count();
    trace!(backend, total, completed, "Batch dispatched");

    results
        .into_iter()
        .map(|result| result.unwrap_or_else(|| Err(StorageError::timeout(backend))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_dispatch_preserves_order() {
        let results = dispatch("test", vec![3u64, 1, 2], 2, Deadline::none(), |n| async move {
            tokio::time::sleep(Duration::from_millis(n)).await;
            Ok(n * 10)
        })
        .await;
        let values: Vec<u64> = results
            .into_iter()
            .map(|r| r.expect("op should succeed"))
            .collect();
        assert_eq!(values, vec![30, 10, 20]);
    }

    #[tokio::test]
    async fn test_dispatch_isolates_failures() {
        let results = dispatch("test", vec![1, 2, 3], 4, Deadline::none(), |n| async move {
            if n == 2 {
                Err(StorageError::unavailable("test", "boom"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(results[0], Ok(1));
        assert!(matches!(results[1], Err(StorageError::Unavailable { .. })));
        assert_eq!(results[2], Ok(3));
    }

    #[tokio::test]
    async fn test_dispatch_respects_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let results = dispatch("test", (0..20).collect(), 3, Deadline::none(), |_: u32| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;
        assert_eq!(results.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_deadline_concurrency_caps_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let deadline = Deadline::none().with_concurrency(2);
        let results = dispatch("test", (0..20).collect(), 8, deadline, |_: u32| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;
        assert_eq!(results.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 2);

        assert_eq!(deadline.concurrency(8), 2);
        assert_eq!(deadline.concurrency(1), 1);
        assert_eq!(Deadline::none().concurrency(8), 8);
        assert_eq!(Deadline::none().with_concurrency(0).concurrency(8), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_deadline_keeps_completed() {
        let deadline = Deadline::after(Duration::from_millis(50));
        let results = dispatch("test", vec![10u64, 1000, 20], 3, deadline, |ms| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        })
        .await;
        assert_eq!(results[0], Ok(10));
        assert_eq!(results[1], Err(StorageError::timeout("test")));
        assert_eq!(results[2], Ok(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_run() {
        let deadline = Deadline::after(Duration::from_millis(5));
        let slow = deadline
            .run("test", async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;
        assert_eq!(slow, Err(StorageError::timeout("test")));
        assert!(deadline.is_expired());

        let fast = Deadline::none().run("test", async { Ok(7) }).await;
        assert_eq!(fast, Ok(7));
    }
}

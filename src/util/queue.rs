//! Keyed FIFO task queue with request coalescing.
//!
//! Exactly one item is in its critical section at any time, items run in
//! enqueue order across distinct ids, and a second `enqueue` for an id that
//! is still pending or in flight attaches to the first caller's outcome
//! instead of running the task again. This is the backbone primitive for
//! every scarce-resource assignment in the bridge: without the coalescing,
//! two near-simultaneous requests for the same user could be handed the
//! same ident or IPv6 address.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors surfaced to queue callers.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The queue was killed before this item ran.
    #[error("queue killed")]
    Killed,

    /// The critical-section task failed. Every caller coalesced onto the
    /// same id observes the same failure.
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),
}

impl QueueError {
    /// The underlying task error, if this was a task failure.
    pub fn task_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Failed(e) => Some(e),
            Self::Killed => None,
        }
    }
}

type ProcessFn<T, R> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;
type Waiter<R> = oneshot::Sender<Result<R, QueueError>>;

struct QueueItem<T, R> {
    id: String,
    item: T,
    waiters: Vec<Waiter<R>>,
}

/// The id and waiters of the item currently in its critical section. Kept
/// in the shared state (not in the worker) so duplicate ids can attach to a
/// task that has already started.
struct InFlight<R> {
    id: String,
    waiters: Vec<Waiter<R>>,
}

struct QueueState<T, R> {
    queue: VecDeque<QueueItem<T, R>>,
    processing: Option<InFlight<R>>,
    worker_running: bool,
    killed: bool,
    once_free: Vec<oneshot::Sender<()>>,
}

struct QueueInner<T, R> {
    process: ProcessFn<T, R>,
    state: Mutex<QueueState<T, R>>,
    interval: Option<Duration>,
}

/// A FIFO work queue keyed by request identity.
///
/// Cloning yields another handle onto the same queue.
pub struct Queue<T, R> {
    inner: Arc<QueueInner<T, R>>,
}

impl<T, R> Clone for Queue<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, R> Queue<T, R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
{
    /// Create a queue that services items as soon as they reach the head.
    pub fn new<F, Fut>(process: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        Self::build(process, None)
    }

    /// Create a queue serviced at a fixed cadence: at most one item starts
    /// per `interval` tick. Used by the connection scheduler to pace
    /// connect attempts against networks that throttle them.
    pub fn with_interval<F, Fut>(process: F, interval: Duration) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        Self::build(process, Some(interval))
    }

    fn build<F, Fut>(process: F, interval: Option<Duration>) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let inner = Arc::new(QueueInner {
            process: Arc::new(move |item| Box::pin(process(item)) as BoxFuture<'static, _>),
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                processing: None,
                worker_running: false,
                killed: false,
                once_free: Vec::new(),
            }),
            interval,
        });
        if let Some(interval) = interval {
            let worker = inner.clone();
            tokio::spawn(Self::drain_at_interval(worker, interval));
        }
        Self { inner }
    }

    /// Number of items pending plus the item currently in flight.
    pub fn size(&self) -> usize {
        let state = self.inner.state.lock();
        state.queue.len() + usize::from(state.processing.is_some())
    }

    /// Resolves once the queue is completely drained (0 items).
    pub fn once_free(&self) -> impl Future<Output = ()> + Send + 'static {
        let rx = {
            let mut state = self.inner.state.lock();
            if state.queue.is_empty() && state.processing.is_none() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.once_free.push(tx);
                Some(rx)
            }
        };
        async move {
            if let Some(rx) = rx {
                let _ = rx.await;
            }
        }
    }

    /// Queue up a request for the critical section function.
    ///
    /// If `id` already has a pending or in-flight entry the returned future
    /// resolves with that entry's outcome and the task is not run again.
    pub fn enqueue(
        &self,
        id: impl Into<String>,
        item: T,
    ) -> impl Future<Output = Result<R, QueueError>> + Send + 'static {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        let spawn_worker = {
            let mut state = self.inner.state.lock();
            if state.killed {
                let _ = tx.send(Err(QueueError::Killed));
                false
            } else if let Some(current) = state.processing.as_mut().filter(|p| p.id == id) {
                current.waiters.push(tx);
                false
            } else if let Some(existing) = state.queue.iter_mut().find(|q| q.id == id) {
                existing.waiters.push(tx);
                false
            } else {
                state.queue.push_back(QueueItem {
                    id,
                    item,
                    waiters: vec![tx],
                });
                if self.inner.interval.is_none() && !state.worker_running {
                    state.worker_running = true;
                    true
                } else {
                    false
                }
            }
        };
        if spawn_worker {
            tokio::spawn(Self::drain(self.inner.clone()));
        }
        async move {
            match rx.await {
                Ok(result) => result,
                // Sender dropped without a result: the queue was torn down.
                Err(_) => Err(QueueError::Killed),
            }
        }
    }

    /// Reject every pending item with [`QueueError::Killed`]. The item in
    /// flight, if any, is left to finish.
    pub fn kill_all(&self) {
        let drained = {
            let mut state = self.inner.state.lock();
            state.killed = true;
            state.queue.drain(..).collect::<Vec<_>>()
        };
        for item in drained {
            for waiter in item.waiters {
                let _ = waiter.send(Err(QueueError::Killed));
            }
        }
    }

    /// Pop the head item into the processing slot, or fire `once_free` and
    /// report emptiness.
    fn take_next(inner: &QueueInner<T, R>) -> Option<T> {
        let mut state = inner.state.lock();
        match state.queue.pop_front() {
            Some(QueueItem { id, item, waiters }) => {
                state.processing = Some(InFlight { id, waiters });
                Some(item)
            }
            None => {
                state.worker_running = false;
                for tx in state.once_free.drain(..) {
                    let _ = tx.send(());
                }
                None
            }
        }
    }

    async fn run_one(inner: &Arc<QueueInner<T, R>>, item: T) {
        let result = (inner.process)(item)
            .await
            .map_err(|e| QueueError::Failed(Arc::new(e)));
        let finished = inner.state.lock().processing.take();
        if let Some(in_flight) = finished {
            for waiter in in_flight.waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    async fn drain(inner: Arc<QueueInner<T, R>>) {
        while let Some(item) = Self::take_next(&inner) {
            Self::run_one(&inner, item).await;
        }
    }

    async fn drain_at_interval(inner: Arc<QueueInner<T, R>>, interval: Duration) {
        loop {
            if let Some(item) = Self::take_next(&inner) {
                Self::run_one(&inner, item).await;
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    async fn wait_until(mut pred: impl FnMut() -> bool) {
        for _ in 0..200 {
            if pred() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn processes_in_fifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let queue = {
            let order = order.clone();
            let active = active.clone();
            let max_active = max_active.clone();
            Queue::new(move |item: &'static str| {
                let order = order.clone();
                let active = active.clone();
                let max_active = max_active.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    order.lock().push(item);
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(item)
                }
            })
        };

        let a = queue.enqueue("id1", "thing1");
        let b = queue.enqueue("id2", "thing2");
        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra.unwrap(), "thing1");
        assert_eq!(rb.unwrap(), "thing2");
        assert_eq!(*order.lock(), vec!["thing1", "thing2"]);
        // only one item is ever inside the critical section
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn coalesces_duplicate_ids() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));

        let queue = {
            let calls = calls.clone();
            let gate = gate.clone();
            Queue::new(move |value: u32| {
                let calls = calls.clone();
                let gate = gate.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    gate.acquire().await.unwrap().forget();
                    Ok(value)
                }
            })
        };

        let first = queue.enqueue("k1", 7);
        // wait for the task to start, then attach a duplicate in flight
        {
            let calls = calls.clone();
            wait_until(move || calls.load(Ordering::SeqCst) == 1).await;
        }
        let second = queue.enqueue("k1", 999);
        gate.add_permits(1);

        let (ra, rb) = tokio::join!(first, second);
        assert_eq!(ra.unwrap(), 7);
        assert_eq!(rb.unwrap(), 7);
        // the task ran exactly once for both callers
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_only_reach_their_own_id() {
        let queue = Queue::new(|item: u32| async move {
            if item == 1 {
                anyhow::bail!("boom");
            }
            Ok(item)
        });

        let bad = queue.enqueue("bad", 1);
        let good = queue.enqueue("good", 2);
        let (rb, rg) = tokio::join!(bad, good);
        assert!(matches!(rb, Err(QueueError::Failed(_))));
        assert_eq!(rg.unwrap(), 2);
    }

    #[tokio::test]
    async fn kill_all_rejects_pending_items() {
        let started = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let queue = {
            let started = started.clone();
            let gate = gate.clone();
            Queue::new(move |item: u32| {
                let started = started.clone();
                let gate = gate.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    gate.acquire().await.unwrap().forget();
                    Ok(item)
                }
            })
        };

        let running = queue.enqueue("a", 1);
        {
            let started = started.clone();
            wait_until(move || started.load(Ordering::SeqCst) == 1).await;
        }
        let pending = queue.enqueue("b", 2);
        queue.kill_all();
        gate.add_permits(2);

        assert!(matches!(pending.await, Err(QueueError::Killed)));
        // the in-flight item is allowed to finish
        assert_eq!(running.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn size_counts_pending_and_in_flight() {
        let gate = Arc::new(Semaphore::new(0));
        let queue = {
            let gate = gate.clone();
            Queue::new(move |item: u32| {
                let gate = gate.clone();
                async move {
                    gate.acquire().await.unwrap().forget();
                    Ok(item)
                }
            })
        };
        assert_eq!(queue.size(), 0);

        let a = queue.enqueue("a", 1);
        let b = queue.enqueue("b", 2);
        assert_eq!(queue.size(), 2);

        gate.add_permits(2);
        let _ = tokio::join!(a, b);
        assert_eq!(queue.size(), 0);
        queue.once_free().await;
    }
}

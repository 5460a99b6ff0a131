//! A queue pool: a bounded-concurrency variant of [`Queue`].
//!
//! The pool consists of N inner queues which can be serviced concurrently.
//! Items are inserted into the first free queue; when every queue is busy
//! they wait in a FIFO overflow queue, so admission order is preserved even
//! under saturation. The reconnection path uses this to cap how many
//! clients may be reopening TCP connections to one IRCd at a time.

use super::queue::{Queue, QueueError};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, select_all};
use std::future::Future;

type SharedOutcome<R> = Shared<BoxFuture<'static, Result<R, QueueError>>>;

pub struct QueuePool<T, R> {
    queues: Vec<Queue<T, R>>,
    overflow: Queue<(String, T), SharedOutcome<R>>,
}

impl<T, R> QueuePool<T, R>
where
    T: Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Construct a pool of `size` queues sharing one process function.
    ///
    /// # Panics
    /// Panics if `size` is zero.
    pub fn new<F, Fut>(size: usize, process: F) -> Self
    where
        F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        assert!(size >= 1, "pool size must be at least 1");
        let queues: Vec<Queue<T, R>> = (0..size).map(|_| Queue::new(process.clone())).collect();

        // The overflow task completes when the item has been handed to a
        // pool queue, not when it has run. Handing back a Shared future (a
        // clonable queue outcome) lets the enqueue caller keep waiting for
        // the real result, and lets coalesced duplicate ids observe it too.
        let overflow = {
            let queues = queues.clone();
            Queue::new(move |(id, item): (String, T)| {
                let queues = queues.clone();
                async move {
                    let queue = match queues.iter().find(|q| q.size() == 0) {
                        Some(q) => q.clone(),
                        None => {
                            let waits = queues
                                .iter()
                                .map(|q| Box::pin(q.once_free()))
                                .collect::<Vec<_>>();
                            let (_, index, _) = select_all(waits).await;
                            let queue = queues[index].clone();
                            if queue.size() != 0 {
                                anyhow::bail!("queue pool overflow starvation: no free queues");
                            }
                            queue
                        }
                    };
                    Ok(queue.enqueue(id, item).boxed().shared())
                }
            })
        };

        Self { queues, overflow }
    }

    /// Number of items waiting to be admitted into a queue.
    pub fn waiting_items(&self) -> usize {
        self.overflow.size()
    }

    /// Add an item to the pool. `index`, if given, pins the item to a
    /// specific inner queue and bypasses the overflow queue.
    pub fn enqueue(
        &self,
        id: impl Into<String>,
        item: T,
        index: Option<usize>,
    ) -> BoxFuture<'static, Result<R, QueueError>> {
        let id = id.into();
        if let Some(index) = index {
            assert!(index < self.queues.len(), "enqueue: index out of bounds");
            return self.queues[index].enqueue(id, item).boxed();
        }

        if let Some(queue) = self.queues.iter().find(|q| q.size() == 0) {
            return queue.enqueue(id, item).boxed();
        }

        let admitted = self.overflow.enqueue(id.clone(), (id, item));
        async move { admitted.await?.await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_pool(
        size: usize,
        delay_ms: u64,
    ) -> (QueuePool<u32, u32>, Arc<AtomicUsize>, Arc<Mutex<Vec<u32>>>) {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Mutex::new(Vec::new()));
        let pool = {
            let active = active.clone();
            let max_active = max_active.clone();
            let done = done.clone();
            QueuePool::new(size, move |item: u32| {
                let active = active.clone();
                let max_active = max_active.clone();
                let done = done.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    done.lock().push(item);
                    Ok(item)
                }
            })
        };
        (pool, max_active, done)
    }

    #[tokio::test]
    async fn services_up_to_pool_width_concurrently() {
        let (pool, max_active, _) = counting_pool(2, 20);
        let futs = (0..4)
            .map(|i| pool.enqueue(format!("id{i}"), i, None))
            .collect::<Vec<_>>();
        for fut in futs {
            fut.await.unwrap();
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn overflow_preserves_fifo_admission() {
        let (pool, _, done) = counting_pool(1, 10);
        let futs = (0..5)
            .map(|i| pool.enqueue(format!("id{i}"), i, None))
            .collect::<Vec<_>>();
        for fut in futs {
            fut.await.unwrap();
        }
        assert_eq!(*done.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn waiting_items_reflects_overflow() {
        let (pool, _, _) = counting_pool(1, 30);
        let first = pool.enqueue("a", 1, None);
        tokio::task::yield_now().await;
        let second = pool.enqueue("b", 2, None);
        let third = pool.enqueue("c", 3, None);
        assert!(pool.waiting_items() >= 1);
        let _ = tokio::join!(first, second, third);
        assert_eq!(pool.waiting_items(), 0);
    }

    #[tokio::test]
    async fn pinned_index_bypasses_overflow() {
        let (pool, _, done) = counting_pool(2, 10);
        pool.enqueue("a", 10, Some(1)).await.unwrap();
        assert_eq!(*done.lock(), vec![10]);
    }
}

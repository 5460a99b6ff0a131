//! Per-network connection scheduling.
//!
//! Networks that throttle connection churn get a dedicated queue serviced
//! at their configured reconnect interval: connect attempts line up FIFO
//! and fire one per tick, with an optional added delay per item (used for
//! throttle backoff).

use crate::error::ConnectError;
use crate::util::Queue;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

struct ScheduledItem {
    added_delay: Duration,
    task: BoxFuture<'static, ()>,
}

type SchedulerQueue = Queue<ScheduledItem, ()>;

static QUEUES: OnceLock<DashMap<String, SchedulerQueue>> = OnceLock::new();
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

fn queue_for(domain: &str, interval: Duration) -> SchedulerQueue {
    let queues = QUEUES.get_or_init(DashMap::new);
    queues
        .entry(domain.to_string())
        .or_insert_with(|| {
            Queue::with_interval(
                |item: ScheduledItem| async move {
                    tokio::time::sleep(item.added_delay).await;
                    item.task.await;
                    Ok(())
                },
                interval,
            )
        })
        .clone()
}

/// Run `connect` through the domain's paced queue. Resolves with the
/// connect outcome once the queue has serviced it.
pub async fn reschedule<F, Fut, R>(
    domain: &str,
    nick: &str,
    interval: Duration,
    added_delay: Duration,
    connect: F,
) -> Result<R, ConnectError>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = R> + Send,
    R: Send + 'static,
{
    let queue = queue_for(domain, interval);
    let (tx, rx) = oneshot::channel();
    let id = format!(
        "reschedule {domain} {nick} #{}",
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    );
    debug!(domain, nick, queue_len = queue.size(), "Queued scheduled connect");

    let enqueued = queue.enqueue(
        id,
        ScheduledItem {
            added_delay,
            task: Box::pin(async move {
                let _ = tx.send(connect().await);
            }),
        },
    );
    enqueued.await.map_err(|_| ConnectError::SchedulerClosed)?;
    rx.await.map_err(|_| ConnectError::SchedulerClosed)
}

/// Reject everything still waiting, on every domain. Used at shutdown.
pub fn kill_all() {
    if let Some(queues) = QUEUES.get() {
        for queue in queues.iter() {
            queue.kill_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn services_connects_at_the_configured_cadence() {
        let interval = Duration::from_millis(50);
        let started = Instant::now();
        let first = reschedule("cadence.test", "a", interval, Duration::ZERO, || async { 1u32 });
        let second = reschedule("cadence.test", "b", interval, Duration::ZERO, || async { 2u32 });
        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 2);
        // the second item waited for at least one interval tick
        assert!(started.elapsed() >= interval);
    }

    #[tokio::test]
    async fn added_delay_applies_to_the_item() {
        let started = Instant::now();
        let result = reschedule(
            "delay.test",
            "a",
            Duration::from_millis(10),
            Duration::from_millis(80),
            || async { 7u32 },
        )
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert!(started.elapsed() >= Duration::from_millis(80));
    }
}

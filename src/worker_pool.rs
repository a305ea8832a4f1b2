//! Bounded-concurrency worker pool draining a shared queue.
//!
//! Workers pull items off a mutex-guarded queue until it is empty, so at
//! most `concurrency` operations are in flight at once. Every item gets
//! exactly one attempt and its outcome is reported; a failed item never
//! stops the rest of the queue.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Runs `op` over `items` with at most `concurrency` in flight.
///
/// Returns one `(item, outcome)` pair per input item, in completion
/// order. A concurrency of zero is treated as one.
pub async fn run<T, R, E, F, Fut>(
    items: Vec<T>,
    concurrency: usize,
    op: F,
) -> Vec<(T, Result<R, E>)>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let worker_count = concurrency.max(1).min(items.len());
    if worker_count == 0 {
        return Vec::new();
    }
    debug!(workers = worker_count, items = items.len(), "starting worker pool");

    let queue = Arc::new(Mutex::new(VecDeque::from(items)));
    let op = Arc::new(op);
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();

    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let queue = Arc::clone(&queue);
        let op = Arc::clone(&op);
        let outcome_tx = outcome_tx.clone();

        workers.push(tokio::spawn(async move {
            loop {
                let item = queue.lock().await.pop_front();
                let Some(item) = item else { break };
                let outcome = op(item.clone()).await;
                if outcome_tx.send((item, outcome)).is_err() {
                    break;
                }
            }
        }));
    }
    drop(outcome_tx);

    let mut outcomes = Vec::new();
    while let Some(entry) = outcome_rx.recv().await {
        outcomes.push(entry);
    }
    for worker in workers {
        let _ = worker.await;
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_processes_every_item_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_op = Arc::clone(&calls);

        let outcomes = run(
            (0..20usize).collect(),
            4,
            move |item: usize| {
                let calls = Arc::clone(&calls_in_op);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(item * 2)
                }
            },
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 20);
        assert_eq!(outcomes.len(), 20);
        for (item, outcome) in outcomes {
            assert_eq!(outcome.unwrap(), item * 2);
        }
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_is_respected() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let current_in_op = Arc::clone(&current);
        let peak_in_op = Arc::clone(&peak);

        run(
            (0..12usize).collect(),
            3,
            move |_item: usize| {
                let current = Arc::clone(&current_in_op);
                let peak = Arc::clone(&peak_in_op);
                async move {
                    let in_flight = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(in_flight, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            },
        )
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_single_worker_is_sequential() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let current_in_op = Arc::clone(&current);
        let peak_in_op = Arc::clone(&peak);

        run(
            (0..6usize).collect(),
            1,
            move |_item: usize| {
                let current = Arc::clone(&current_in_op);
                let peak = Arc::clone(&peak_in_op);
                async move {
                    let in_flight = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(in_flight, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            },
        )
        .await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_pool() {
        let outcomes = run(
            (0..10usize).collect(),
            5,
            |item: usize| async move {
                if item % 2 == 0 {
                    Err(format!("item {item} rejected"))
                } else {
                    Ok(item)
                }
            },
        )
        .await;

        assert_eq!(outcomes.len(), 10);
        let failed = outcomes.iter().filter(|(_, o)| o.is_err()).count();
        assert_eq!(failed, 5);
    }

    #[tokio::test]
    async fn test_more_workers_than_items() {
        let outcomes = run(
            vec!["a", "b", "c"],
            10,
            |item: &'static str| async move { Ok::<_, String>(item.to_uppercase()) },
        )
        .await;

        assert_eq!(outcomes.len(), 3);
    }

    #[tokio::test]
    async fn test_zero_concurrency_still_drains_queue() {
        let outcomes = run(
            vec![1u32, 2, 3],
            0,
            |item: u32| async move { Ok::<_, String>(item) },
        )
        .await;

        assert_eq!(outcomes.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let outcomes = run(
            Vec::<u32>::new(),
            5,
            |item: u32| async move { Ok::<_, String>(item) },
        )
        .await;

        assert!(outcomes.is_empty());
    }
}

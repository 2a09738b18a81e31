// src/batch.rs
//
// =============================================================================
// RAGKEEPER: BATCH PROCESSOR
// =============================================================================
//
// Generic throughput-controlled batch engine. Concurrency is capped with a
// `tokio::sync::Semaphore`; batches are dispatched onto a `JoinSet` so
// results drain as they complete rather than in submission order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct BatchFailure<E> {
    pub error: E,
}

#[derive(Debug, Clone)]
pub struct BatchResult<T, E> {
    pub succeeded_items: Vec<T>,
    pub failed_items_with_errors: Vec<(T, E)>,
}

impl<T, E> Default for BatchResult<T, E> {
    fn default() -> Self {
        Self {
            succeeded_items: Vec::new(),
            failed_items_with_errors: Vec::new(),
        }
    }
}

/// Partitions `items` into batches of at most `batch_size`, runs up to
/// `max_concurrency` batches in parallel (items within a batch run
/// sequentially via `transform`), sleeps `pause_between_batches` after each
/// completed batch, and never fails fast: a batch error is attached to every
/// item in that batch and processing continues.
pub async fn process<T, E, F, Fut>(
    items: Vec<T>,
    batch_size: usize,
    pause_between_batches: Duration,
    max_concurrency: usize,
    transform: F,
) -> BatchResult<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send,
{
    let batches: Vec<Vec<T>> = items
        .chunks(batch_size.max(1))
        .map(|c| c.to_vec())
        .collect();

    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let transform = Arc::new(transform);
    let mut join_set: JoinSet<(Vec<T>, Vec<(T, E)>)> = JoinSet::new();

    for batch in batches {
        let permit_src = semaphore.clone();
        let transform = transform.clone();
        let pause = pause_between_batches;
        join_set.spawn(async move {
            let _permit = permit_src.acquire_owned().await.expect("semaphore not closed");
            let mut succeeded = Vec::new();
            let mut failed = Vec::new();
            for item in batch {
                match transform(item.clone()).await {
                    Ok(out) => succeeded.push(out),
                    Err(e) => failed.push((item, e)),
                }
            }
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            (succeeded, failed)
        });
    }

    let mut result = BatchResult::default();
    while let Some(joined) = join_set.join_next().await {
        if let Ok((succeeded, failed)) = joined {
            result.succeeded_items.extend(succeeded);
            result.failed_items_with_errors.extend(failed);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_items_succeed_when_transform_never_fails() {
        let items: Vec<i32> = (0..23).collect();
        let result = process(items, 5, Duration::from_millis(0), 3, |n| async move {
            Ok::<i32, String>(n * 2)
        })
        .await;
        assert_eq!(result.succeeded_items.len(), 23);
        assert!(result.failed_items_with_errors.is_empty());
    }

    #[tokio::test]
    async fn failing_item_does_not_stop_other_batches() {
        let items: Vec<i32> = (0..10).collect();
        let result = process(items, 2, Duration::from_millis(0), 4, |n| async move {
            if n == 4 {
                Err::<i32, String>("boom".to_string())
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.succeeded_items.len(), 9);
        assert_eq!(result.failed_items_with_errors.len(), 1);
        assert_eq!(result.failed_items_with_errors[0].0, 4);
    }

    #[tokio::test]
    async fn empty_input_yields_empty_result() {
        let result = process(Vec::<i32>::new(), 5, Duration::from_millis(0), 2, |n| async move {
            Ok::<i32, String>(n)
        })
        .await;
        assert!(result.succeeded_items.is_empty());
        assert!(result.failed_items_with_errors.is_empty());
    }
}

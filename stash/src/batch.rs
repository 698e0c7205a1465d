//! Chunked batch execution.
//!
//! Operations are awaited in consecutive windows of at most `chunk_size` operations. A window
//! is only awaited once every operation of the previous one has settled, and the operations
//! inside a window are awaited concurrently. Every outcome lands in the returned
//! [`BatchResult`]; the batch itself never fails and never times out.
//!
//! Rust futures are inert until polled, so futures handed to [`run_batched`] only start work
//! when their window is awaited. Operations that already run on their own (spawned tasks, for
//! instance) are merely observed window by window. [`run_deferred`] takes factories instead
//! and builds each operation when its window begins.

use crate::domain::BatchResult;
use futures::future::join_all;
use shared::ChunkSize;
use std::future::Future;

/// Await `operations` window by window and collect their outcomes
pub async fn run_batched<I, Fut, T, E>(
    operations: I,
    chunk_size: impl Into<ChunkSize>,
) -> BatchResult<T, E>
where
    I: IntoIterator<Item = Fut>,
    Fut: Future<Output = Result<T, E>>,
{
    run_windows(operations, chunk_size.into(), |operation| operation).await
}

/// Build and await operations window by window; a factory runs only when its window begins
pub async fn run_deferred<I, F, Fut, T, E>(
    factories: I,
    chunk_size: impl Into<ChunkSize>,
) -> BatchResult<T, E>
where
    I: IntoIterator<Item = F>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    run_windows(factories, chunk_size.into(), |factory| factory()).await
}

async fn run_windows<I, S, Fut, T, E>(
    items: I,
    chunk_size: ChunkSize,
    mut start: S,
) -> BatchResult<T, E>
where
    I: IntoIterator,
    S: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let items: Vec<I::Item> = items.into_iter().collect();
    let mut result = BatchResult::new();

    if items.is_empty() {
        return result;
    }

    let total = items.len();
    let window_len = chunk_size.window_len(total);
    let mut pending = items.into_iter();
    let mut window_index = 0;

    loop {
        let window: Vec<Fut> = pending.by_ref().take(window_len).map(&mut start).collect();
        if window.is_empty() {
            break;
        }

        let size = window.len();
        for outcome in join_all(window).await {
            result.record(outcome);
        }

        tracing::debug!(
            "Batch window {} settled {} operation(s), {}/{} done",
            window_index,
            size,
            result.len(),
            total
        );
        window_index += 1;
    }

    result
}

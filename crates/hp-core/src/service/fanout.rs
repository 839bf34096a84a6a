use std::future::Future;

use futures::stream::{self, StreamExt};

/// Run `f` over every item with at most `limit` futures in flight.
///
/// Results come back in completion order. All futures are polled on the
/// calling task, so `f` may borrow from the caller.
pub async fn fan_out<T, R, F, Fut>(items: Vec<T>, limit: usize, f: F) -> Vec<R>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = R>,
{
    stream::iter(items)
        .map(f)
        .buffer_unordered(limit.max(1))
        .collect()
        .await
}

//! Bounded-concurrency stream processor.
//!
//! Each item of a stream is handed to an async handler running as its own
//! tokio task. At most `limit` handlers are in flight: reading the next item
//! waits for a semaphore permit, and each task releases its permit when it
//! finishes. The [`JoinSet`] holding the tasks is the completion latch, so
//! the end of a pass is awaited directly instead of polled for.

use std::future::Future;
use std::sync::Arc;

use futures::{Stream, StreamExt as _};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

/// Runs `handler` on every item of `stream` with at most `limit` handlers
/// in flight, and returns the number of items dispatched.
///
/// Completes only after the stream has ended and every dispatched handler
/// has finished. On the first error, from the stream or from a handler, no
/// further items are read and the stream is dropped; handlers already in
/// flight run to completion and the error is returned.
///
/// There is no timeout: a handler that never finishes keeps this future
/// pending.
///
/// # Errors
///
/// Returns the first error produced by the stream or a handler.
///
/// # Panics
///
/// Re-raises a panic from a handler task.
pub async fn for_each_bounded<S, T, E, F, Fut>(
    stream: S,
    limit: usize,
    handler: F,
) -> Result<u64, E>
where
    S: Stream<Item = Result<T, E>>,
    T: Send + 'static,
    E: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    let limit = limit.max(1);
    let semaphore = Arc::new(Semaphore::new(limit));
    let mut stream = Box::pin(stream);
    let mut tasks = JoinSet::new();
    let mut dispatched = 0_u64;
    let mut first_error = None;

    loop {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };

        while let Some(joined) = tasks.try_join_next() {
            record(joined, &mut first_error);
        }
        if first_error.is_some() {
            break;
        }

        match stream.next().await {
            Some(Ok(item)) => {
                let fut = handler(item);
                tasks.spawn(async move {
                    let result = fut.await;
                    drop(permit);
                    result
                });
                dispatched += 1;
            }
            Some(Err(e)) => {
                first_error = Some(e);
                break;
            }
            None => break,
        }
    }

    drop(stream);

    while let Some(joined) = tasks.join_next().await {
        record(joined, &mut first_error);
    }

    first_error.map_or(Ok(dispatched), Err)
}

fn record<E>(joined: Result<Result<(), E>, JoinError>, first_error: &mut Option<E>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            if first_error.is_none() {
                *first_error = Some(e);
            }
        }
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => log::warn!("Row handler task was cancelled: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::stream;

    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct Failed(u64);

    fn items(n: u64) -> impl Stream<Item = Result<u64, Failed>> {
        stream::iter((0..n).map(Ok))
    }

    #[tokio::test]
    async fn never_exceeds_the_ceiling() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let dispatched = for_each_bounded(items(10), 2, |i| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let finished = Arc::clone(&finished);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5 + (i * 7) % 13)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(dispatched, 10);
        assert_eq!(finished.load(Ordering::SeqCst), 10);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hanging_handler_keeps_the_pass_pending() {
        let pass = for_each_bounded(items(5), 2, |i| async move {
            if i == 3 {
                futures::future::pending::<()>().await;
            }
            Ok(())
        });

        let outcome = tokio::time::timeout(Duration::from_millis(200), pass).await;
        assert!(outcome.is_err(), "a hung handler must not let the pass complete");
    }

    #[tokio::test]
    async fn first_handler_error_stops_reading() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let slow_done = Arc::new(AtomicBool::new(false));

        let source = {
            let pulled = Arc::clone(&pulled);
            items(10_000).inspect(move |_| {
                pulled.fetch_add(1, Ordering::SeqCst);
            })
        };

        let result = for_each_bounded(source, 4, |i| {
            let slow_done = Arc::clone(&slow_done);
            async move {
                match i {
                    0 => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        slow_done.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                    2 => Err(Failed(i)),
                    _ => Ok(()),
                }
            }
        })
        .await;

        assert_eq!(result, Err(Failed(2)));
        assert!(pulled.load(Ordering::SeqCst) < 10_000);
        assert!(slow_done.load(Ordering::SeqCst), "in-flight handlers finish");
    }

    #[tokio::test]
    async fn stream_error_is_returned_after_in_flight_handlers() {
        let finished = Arc::new(AtomicUsize::new(0));
        let source = stream::iter(vec![Ok(1), Ok(2), Err(Failed(99)), Ok(4)]);

        let result = for_each_bounded(source, 8, |_| {
            let finished = Arc::clone(&finished);
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(result, Err(Failed(99)));
        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_stream_completes() {
        let dispatched = for_each_bounded(items(0), 3, |_| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(dispatched, 0);
    }
}

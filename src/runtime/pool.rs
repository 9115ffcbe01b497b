//! Bounded pool for blocking functions.

use crate::capture::Capture;
use crate::function::handler::panic_message;
use crate::function::{CallError, Output};
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Items buffered between a blocking producer and the socket.
const ITER_BUFFER: usize = 16;

/// Runs blocking work on tokio's blocking threads, at most `size` at a time.
///
/// Work already handed to a thread is never cancelled; dropping the awaiting
/// future only discards its result.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `f` with `capture` installed on the worker thread.
    pub async fn run<F, R>(&self, capture: Capture, f: F) -> Result<R, CallError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CallError::Execution("worker pool is closed".into()))?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            capture.install(f)
        });

        match handle.await {
            Ok(value) => Ok(value),
            Err(err) if err.is_panic() => Err(CallError::Execution(panic_message(err.into_panic()))),
            Err(err) => Err(CallError::Execution(err.to_string())),
        }
    }

    /// Drive `fut` to completion on a worker thread.
    ///
    /// Code inside `fut` must not call the blocking helpers of
    /// [`StreamSender`](crate::StreamSender) or [`Connection`](crate::Connection),
    /// which cannot run inside a runtime context.
    pub async fn run_future<Fut>(&self, capture: Capture, fut: Fut) -> Result<Fut::Output, CallError>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let handle = Handle::current();
        self.run(capture, move || handle.block_on(fut)).await
    }

    /// Run `f` on a worker and stream the items of the iterator it returns.
    ///
    /// The producer stops at its next item once the consumer is dropped.
    pub fn run_iter<F, I, E>(&self, capture: Capture, f: F) -> Output
    where
        F: FnOnce() -> Result<I, E> + Send + 'static,
        I: IntoIterator + 'static,
        I::Item: Serialize,
        E: fmt::Display + 'static,
    {
        let (tx, rx) = mpsc::channel::<Result<serde_json::Value, String>>(ITER_BUFFER);
        let permits = self.permits.clone();

        tokio::spawn(async move {
            let permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    let _ = tx.send(Err("worker pool is closed".into())).await;
                    return;
                }
            };
            let panic_tx = tx.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                capture.install(|| produce(f, &tx))
            });
            if let Err(err) = handle.await {
                if err.is_panic() {
                    let _ = panic_tx.send(Err(panic_message(err.into_panic()))).await;
                }
            }
        });

        Output::Stream(ReceiverStream::new(rx).boxed())
    }
}

fn produce<F, I, E>(f: F, tx: &mpsc::Sender<Result<serde_json::Value, String>>)
where
    F: FnOnce() -> Result<I, E>,
    I: IntoIterator,
    I::Item: Serialize,
    E: fmt::Display,
{
    let items = match f() {
        Ok(items) => items,
        Err(err) => {
            let _ = tx.blocking_send(Err(err.to_string()));
            return;
        }
    };
    for item in items {
        let value = serde_json::to_value(item).map_err(|err| err.to_string());
        let failed = value.is_err();
        if tx.blocking_send(value).is_err() {
            debug!("Stream consumer went away, stopping producer");
            return;
        }
        if failed {
            return;
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_returns_value_and_captures() {
        let pool = WorkerPool::new(2);
        let capture = Capture::new();
        let value = pool
            .run(capture.clone(), || {
                crate::echo!("working");
                40 + 2
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(capture.drain(), "working");
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_run_maps_panic() {
        let pool = WorkerPool::new(1);
        let err = pool
            .run(Capture::new(), || -> u8 { panic!("bad input") })
            .await
            .unwrap_err();
        assert_eq!(err, CallError::Execution("function panicked: bad input".into()));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let calls = (0..6).map(|_| {
            let running = running.clone();
            let peak = peak.clone();
            pool.run(Capture::new(), move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
            })
        });
        for result in futures::future::join_all(calls).await {
            result.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_run_future_leaves_the_caller_free() {
        let pool = WorkerPool::new(1);
        let capture = Capture::new();
        let slow = pool.run_future(capture.clone(), async {
            crate::echo!("sleeping");
            std::thread::sleep(Duration::from_millis(300));
            "done"
        });
        let quick = async {
            let started = std::time::Instant::now();
            tokio::time::sleep(Duration::from_millis(20)).await;
            started.elapsed()
        };
        let (slow, quick) = tokio::join!(slow, quick);
        assert_eq!(slow.unwrap(), "done");
        assert!(quick < Duration::from_millis(250), "blocked for {:?}", quick);
        assert_eq!(capture.drain(), "sleeping");
    }

    #[tokio::test]
    async fn test_run_iter_streams_in_order() {
        let pool = WorkerPool::new(1);
        let output = pool.run_iter(Capture::new(), || Ok::<_, String>(vec!["a", "b", "c"]));
        let items: Vec<_> = match output {
            Output::Stream(stream) => stream.collect().await,
            Output::Single(_) => panic!("expected a stream"),
        };
        assert_eq!(
            items,
            vec![Ok("a".into()), Ok("b".into()), Ok("c".into())]
        );
    }

    #[tokio::test]
    async fn test_run_iter_reports_error() {
        let pool = WorkerPool::new(1);
        let output = pool.run_iter(Capture::new(), || Err::<Vec<u8>, _>("no data"));
        assert_eq!(output.collect().await, Err("no data".to_string()));
    }
}

//! Bounded concurrency for target and evaluator invocations.
//!
//! Every submission is spawned onto the tokio runtime immediately, but only
//! `max(K, 1)` of them hold a permit at any moment. Permits are handed out in
//! submission order, so the consumer can await handles in that same order
//! and see results exactly as submitted regardless of completion order.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::FutureExt;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;

use crate::error::EvalError;

/// Runs submitted futures with a ceiling on how many execute at once.
///
/// A ceiling of 0 is treated as 1: each submission starts only after the
/// previous one has resolved.
#[derive(Debug)]
pub struct AsyncCaller {
    semaphore: Arc<Semaphore>,
    limit: usize,
    /// Released by the most recent submission once it holds a permit.
    last_ticket: Mutex<Option<oneshot::Receiver<()>>>,
}

impl AsyncCaller {
    pub fn new(max_concurrency: usize) -> Self {
        let limit = max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            last_ticket: Mutex::new(None),
        }
    }

    /// How many handles a consumer should keep unresolved to saturate the
    /// ceiling.
    pub fn window(&self) -> usize {
        self.limit
    }

    /// Submit a unit of work. Must be called from within a tokio runtime.
    ///
    /// The work starts once every earlier submission has started and a
    /// permit is free. A panic inside `work` is reported through the
    /// returned handle only.
    pub fn call<F, T>(&self, work: F) -> CallHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let (ticket_tx, ticket_rx) = oneshot::channel();
        let previous = self
            .last_ticket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(ticket_rx);

        let inner = tokio::spawn(async move {
            if let Some(previous) = previous {
                // A cancelled predecessor drops its sender; either way it is
                // no longer ahead of us in the queue.
                let _ = previous.await;
            }
            let permit = semaphore.acquire_owned().await;
            let _ = ticket_tx.send(());
            let _permit = permit.map_err(|_| EvalError::Task("caller closed".into()))?;
            Ok(work.await)
        });

        CallHandle { inner }
    }
}

/// The eventual result of one submission.
#[derive(Debug)]
pub struct CallHandle<T> {
    inner: JoinHandle<Result<T, EvalError>>,
}

impl<T> Future for CallHandle<T> {
    type Output = Result<T, EvalError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(EvalError::Task(e.to_string()))),
        }
    }
}

/// Await `work` in place, turning a panic into its message.
pub async fn catch_panic<F: Future>(work: F) -> Result<F::Output, String> {
    AssertUnwindSafe(work)
        .catch_unwind()
        .await
        .map_err(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with a non-string payload".to_string())
}

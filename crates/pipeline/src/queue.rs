//! Single-concurrency FIFO execution queue for plugin work.
//!
//! [`ExecutionQueue`] is constructed explicitly at daemon startup and shared
//! as `Arc<ExecutionQueue>`. Tasks start as soon as they reach the head of
//! the queue; at most one task body runs at any instant. Each task's outcome
//! is delivered only through the [`TaskHandle`] returned by
//! [`ExecutionQueue::enqueue`]. The queue itself never inspects or logs it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Why a queued task produced no value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task body panicked.
    #[error("Queued task panicked")]
    Panicked,
    /// The task was never run because the queue had shut down.
    #[error("Queued task was dropped before it ran")]
    Dropped,
}

/// Completion signal for one queued task.
///
/// Resolves to the task's output once it has run. Dropping the handle does
/// not cancel the task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TaskError::Dropped)))
    }
}

/// FIFO queue that executes at most one task at a time.
pub struct ExecutionQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl ExecutionQueue {
    /// Create the queue and spawn its worker on the current Tokio runtime.
    pub fn start() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(run_worker(receiver, Arc::clone(&pending)));
        tracing::info!("Execution queue started");

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            pending,
        }
    }

    /// Append `task` to the tail of the queue.
    ///
    /// After [`shutdown`](Self::shutdown) the task is discarded and its
    /// handle resolves to [`TaskError::Dropped`].
    pub fn enqueue<F, Fut, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            // Spawned so a panicking body cannot take the worker down.
            let outcome = tokio::spawn(async move { task().await })
                .await
                .map_err(|e| {
                    if e.is_panic() {
                        TaskError::Panicked
                    } else {
                        TaskError::Dropped
                    }
                });
            let _ = tx.send(outcome);
        });

        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = sender.as_ref() {
            self.pending.fetch_add(1, Ordering::SeqCst);
            if sender.send(job).is_err() {
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }

        TaskHandle { rx }
    }

    /// Number of tasks enqueued that have not finished yet (including the
    /// one currently running).
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stop accepting tasks, let already-queued tasks run, and wait for the
    /// worker to exit. Safe to call more than once.
    pub async fn shutdown(&self) {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(worker) = worker {
            let remaining = self.pending();
            tracing::info!(remaining, "Draining execution queue");
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Execution queue worker exited abnormally");
            }
            tracing::info!("Execution queue stopped");
        }
    }
}

async fn run_worker(mut receiver: mpsc::UnboundedReceiver<Job>, pending: Arc<AtomicUsize>) {
    while let Some(job) = receiver.recv().await {
        job.await;
        pending.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

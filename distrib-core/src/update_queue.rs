//! Single-writer update queue.
//!
//! A [`SingularUpdateQueue`] owns a bounded FIFO and one dedicated worker
//! thread. Callers on any thread [`submit`](SingularUpdateQueue::submit) a
//! request and get a [`CompletionHandle`] back immediately. The worker applies
//! the [`UpdateHandler`] to one request at a time, so the handler's state never
//! needs a lock.
//!
//! ```text
//!   caller ──submit──▶ [ bounded FIFO ] ──recv_timeout──▶ worker ──handle──▶ state
//!     ▲                                                      │
//!     └──────────── CompletionHandle ◀── Ok(resp) / Err(e) ──┘
//! ```
//!
//! ## Shutdown
//!
//! [`shutdown`](SingularUpdateQueue::shutdown) stops the worker after the item
//! it is currently processing. Items still queued are never processed; their
//! handles resolve to [`TaskError::Abandoned`] once the queue is dropped.

use std::future::Future;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Configuration for a [`SingularUpdateQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of requests waiting for the worker.
    pub capacity: usize,
    /// How long the worker blocks on an empty queue before re-checking the
    /// shutdown flag.
    pub poll_interval: Duration,
    /// Name given to the worker thread.
    pub name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            poll_interval: Duration::from_millis(2),
            name: "singular-update-queue".to_string(),
        }
    }
}

impl QueueConfig {
    /// Set the queue capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the worker thread name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Errors returned by [`SingularUpdateQueue::submit`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The queue is at capacity.
    #[error("queue full (capacity: {capacity})")]
    QueueFull {
        /// Configured capacity.
        capacity: usize,
    },

    /// The queue has been shut down.
    #[error("queue shut down")]
    Shutdown,

    /// The worker thread could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
}

/// Why a submitted request did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError<E> {
    /// The handler returned an error.
    #[error("handler failed: {0}")]
    Handler(E),

    /// The handler panicked while processing the request.
    #[error("handler panicked")]
    Panicked,

    /// The queue shut down before the request was processed.
    #[error("request abandoned by queue shutdown")]
    Abandoned,
}

/// The single writer applied to every request, in submission order.
pub trait UpdateHandler: Send + 'static {
    /// Request type accepted by the queue.
    type Request: Send + 'static;
    /// Successful result.
    type Response: Send + 'static;
    /// Failure result.
    type Error: Send + 'static;

    /// Apply one request.
    fn handle(&mut self, request: Self::Request) -> Result<Self::Response, Self::Error>;
}

/// [`UpdateHandler`] built from a closure, see [`handler_fn`].
pub struct FnHandler<F, Req, Resp, E> {
    f: F,
    _marker: PhantomData<fn(Req) -> (Resp, E)>,
}

/// Wrap a closure as an [`UpdateHandler`].
pub fn handler_fn<F, Req, Resp, E>(f: F) -> FnHandler<F, Req, Resp, E>
where
    F: FnMut(Req) -> Result<Resp, E> + Send + 'static,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

impl<F, Req, Resp, E> UpdateHandler for FnHandler<F, Req, Resp, E>
where
    F: FnMut(Req) -> Result<Resp, E> + Send + 'static,
    Req: Send + 'static,
    Resp: Send + 'static,
    E: Send + 'static,
{
    type Request = Req;
    type Response = Resp;
    type Error = E;

    fn handle(&mut self, request: Req) -> Result<Resp, E> {
        (self.f)(request)
    }
}

type Outcome<H> = Result<<H as UpdateHandler>::Response, TaskError<<H as UpdateHandler>::Error>>;

struct PendingTask<H: UpdateHandler> {
    request: H::Request,
    completion: oneshot::Sender<Outcome<H>>,
}

/// Handle resolved by the worker once a request has been processed.
///
/// Await it from async code, or call [`wait`](Self::wait) from a plain thread.
pub struct CompletionHandle<T, E> {
    receiver: oneshot::Receiver<Result<T, TaskError<E>>>,
}

impl<T, E> CompletionHandle<T, E> {
    /// Block the current thread until the request has been processed.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Result<T, TaskError<E>> {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(TaskError::Abandoned))
    }
}

impl<T, E> Future for CompletionHandle<T, E> {
    type Output = Result<T, TaskError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TaskError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Bounded FIFO drained by one dedicated worker thread.
pub struct SingularUpdateQueue<H: UpdateHandler> {
    sender: Option<SyncSender<PendingTask<H>>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<H>>,
    config: QueueConfig,
}

impl<H: UpdateHandler> SingularUpdateQueue<H> {
    /// Start the worker thread with the given handler.
    pub fn start(handler: H, config: QueueConfig) -> Result<Self, QueueError> {
        let (sender, receiver) = mpsc::sync_channel::<PendingTask<H>>(config.capacity);
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let running = running.clone();
            let poll_interval = config.poll_interval;
            std::thread::Builder::new()
                .name(config.name.clone())
                .spawn(move || run_worker(handler, receiver, running, poll_interval))
                .map_err(|e| QueueError::Spawn(e.to_string()))?
        };

        debug!(name = %config.name, capacity = config.capacity, "update queue started");

        Ok(Self {
            sender: Some(sender),
            running,
            worker: Some(worker),
            config,
        })
    }

    /// Enqueue a request without waiting for it to be processed.
    ///
    /// Fails with [`QueueError::QueueFull`] instead of blocking when the queue
    /// is at capacity.
    pub fn submit(
        &self,
        request: H::Request,
    ) -> Result<CompletionHandle<H::Response, H::Error>, QueueError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(QueueError::Shutdown);
        }
        let sender = self.sender.as_ref().ok_or(QueueError::Shutdown)?;

        let (completion, receiver) = oneshot::channel();
        match sender.try_send(PendingTask {
            request,
            completion,
        }) {
            Ok(()) => Ok(CompletionHandle { receiver }),
            Err(TrySendError::Full(_)) => Err(QueueError::QueueFull {
                capacity: self.config.capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(QueueError::Shutdown),
        }
    }

    /// Whether the worker is still accepting requests.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the worker and hand back the handler.
    ///
    /// Returns `None` if the worker thread died.
    pub fn shutdown(mut self) -> Option<H> {
        self.stop()
    }

    fn stop(&mut self) -> Option<H> {
        self.running.store(false, Ordering::Release);
        // Dropping the sender abandons everything still queued.
        self.sender.take();
        let worker = self.worker.take()?;
        match worker.join() {
            Ok(handler) => {
                debug!(name = %self.config.name, "update queue stopped");
                Some(handler)
            }
            Err(_) => {
                warn!(name = %self.config.name, "update queue worker panicked");
                None
            }
        }
    }
}

impl<H: UpdateHandler> Drop for SingularUpdateQueue<H> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

fn run_worker<H: UpdateHandler>(
    mut handler: H,
    receiver: mpsc::Receiver<PendingTask<H>>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
) -> H {
    while running.load(Ordering::Acquire) {
        let task = match receiver.recv_timeout(poll_interval) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        // Shutdown may land while blocked in recv; the task's handle resolves
        // to Abandoned when it is dropped here.
        if !running.load(Ordering::Acquire) {
            debug!("update queue dropping request received after shutdown");
            break;
        }

        let outcome = match catch_unwind(AssertUnwindSafe(|| handler.handle(task.request))) {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(TaskError::Handler(error)),
            Err(_) => {
                warn!("update handler panicked");
                Err(TaskError::Panicked)
            }
        };

        // The caller may have dropped its handle.
        let _ = task.completion.send(outcome);
    }
    handler
}

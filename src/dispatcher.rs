//! Dispatcher: background execution for asynchronous packets.
//!
//! DESIGN
//! ======
//! A fixed pool of worker tasks drains one unbounded FIFO queue. Submitting
//! never blocks; admission order is queue order, completion order is not
//! guaranteed. Each job reports through a oneshot channel wrapped in a
//! `PacketHandle`.
//!
//! ERROR HANDLING
//! ==============
//! A failed result nobody looks at is logged exactly once: by the job when
//! the handle is already gone, or by the handle's `Drop` when the result
//! arrived but was never polled. A panicking job is caught, logged, and
//! resolved as `Internal`; its worker keeps running.
//!
//! Shutdown closes the queue, lets workers drain what was already admitted,
//! and joins them. `abort` drops queued work instead.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ClientError;

struct QueuedJob {
    id: Uuid,
    name: String,
    work: BoxFuture<'static, ()>,
    owner: Weak<DispatcherInner>,
}

/// Leaves the pending count however the job ends: run, dropped from the
/// queue, or cancelled mid-run by `abort`.
impl Drop for QueuedJob {
    fn drop(&mut self) {
        if let Some(inner) = self.owner.upgrade() {
            inner.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

// =============================================================================
// DISPATCHER
// =============================================================================

/// Shared handle to the worker pool. Clone is cheap.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    queue: Mutex<Option<mpsc::UnboundedSender<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: AtomicUsize,
    completed: AtomicU64,
}

impl Dispatcher {
    /// Spawn `workers` worker tasks on the current tokio runtime.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel::<QueuedJob>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let inner = Arc::new(DispatcherInner {
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::with_capacity(workers)),
            pending: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
        });

        let handles = (0..workers)
            .map(|worker| tokio::spawn(run_worker(worker, Arc::clone(&rx), Arc::downgrade(&inner))))
            .collect::<Vec<_>>();
        *inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = handles;

        info!(workers, "dispatcher started");
        Self { inner }
    }

    /// Queue `work` and return a handle to its result.
    ///
    /// After shutdown the handle resolves to [`ClientError::DispatcherClosed`].
    pub fn submit<T, F>(&self, name: impl Into<String>, work: F) -> PacketHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, ClientError>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let name = name.into();
        let (tx, rx) = oneshot::channel();
        let handle = PacketHandle { id, name: name.clone(), rx: Some(rx) };

        let job_name = name.clone();
        let work = async move {
            let result = AssertUnwindSafe(work).catch_unwind().await.unwrap_or_else(|_| {
                error!(job_id = %id, packet = %job_name, "job panicked");
                Err(ClientError::Internal(format!("{job_name} panicked")))
            });
            if let Err(Err(e)) = tx.send(result) {
                error!(job_id = %id, packet = %job_name, error = %e, "unobserved packet failure");
            }
        }
        .boxed();

        let sender = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            warn!(job_id = %id, packet = %name, "dispatcher closed; dropping job");
            return handle;
        };

        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        let job = QueuedJob { id, name, work, owner: Arc::downgrade(&self.inner) };
        if sender.send(job).is_err() {
            warn!(job_id = %id, "dispatcher queue closed; dropping job");
        }
        handle
    }

    /// Jobs admitted but not yet finished.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stop admitting work, let admitted work finish, then join the workers.
    pub async fn shutdown(&self) {
        drop(
            self.inner
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let workers = std::mem::take(
            &mut *self
                .inner
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        info!(workers = workers.len(), pending = self.pending(), "dispatcher shutting down");

        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "dispatcher worker ended abnormally");
            }
        }
        info!(completed = self.completed(), "dispatcher stopped");
    }

    /// Stop immediately. Queued jobs are dropped and their handles resolve to
    /// [`ClientError::DispatcherClosed`]; running jobs are cancelled.
    pub fn abort(&self) {
        drop(
            self.inner
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let workers = std::mem::take(
            &mut *self
                .inner
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        warn!(workers = workers.len(), pending = self.pending(), "dispatcher aborted");
        for worker in workers {
            worker.abort();
        }
    }
}

async fn run_worker(
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedJob>>>,
    inner: Weak<DispatcherInner>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(mut job) = next else {
            break;
        };

        debug!(worker, job_id = %job.id, packet = %job.name, "job started");
        (&mut job.work).await;

        if let Some(inner) = inner.upgrade() {
            inner.completed.fetch_add(1, Ordering::AcqRel);
        }
        drop(job);
    }
    debug!(worker, "dispatcher worker exiting");
}

// =============================================================================
// PACKET HANDLE
// =============================================================================

/// Future result of a submitted job.
///
/// Await it for the result, or drop it (or call [`PacketHandle::detach`]) to
/// fire and forget. Dropping never cancels the job.
#[must_use = "await the handle, or call detach() to fire and forget"]
pub struct PacketHandle<T> {
    id: Uuid,
    name: String,
    rx: Option<oneshot::Receiver<Result<T, ClientError>>>,
}

impl<T> PacketHandle<T> {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Let the job run unobserved. Failures are still logged.
    pub fn detach(self) {}
}

impl<T> Future for PacketHandle<T> {
    type Output = Result<T, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(Err(ClientError::DispatcherClosed));
        };
        match Pin::new(rx).poll(cx) {
            Poll::Ready(result) => {
                this.rx = None;
                Poll::Ready(result.unwrap_or(Err(ClientError::DispatcherClosed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for PacketHandle<T> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            if let Ok(Err(e)) = rx.try_recv() {
                error!(job_id = %self.id, packet = %self.name, error = %e, "unobserved packet failure");
            }
        }
    }
}

impl<T> std::fmt::Debug for PacketHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("resolved", &self.rx.is_none())
            .finish()
    }
}

#[cfg(test)]
#[path = "dispatcher_test.rs"]
mod tests;

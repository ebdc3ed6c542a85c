use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::{
    sync::oneshot,
    task::{AbortHandle, JoinHandle},
};

use crate::TaskError;

type SharedOutcome<V> = Shared<BoxFuture<'static, Result<V, TaskError>>>;

/// One tracked operation: the spawned task plus the result every joiner awaits.
pub(crate) struct Inflight<V> {
    pub id: u64,
    finished: Arc<AtomicBool>,
    cancel_tx: Mutex<Option<oneshot::Sender<()>>>,
    abort: AbortHandle,
    outcome: SharedOutcome<V>,
}

impl<V> Inflight<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(id: u64, finished: Arc<AtomicBool>, join: JoinHandle<V>) -> Self {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let abort = join.abort_handle();

        let outcome = async move {
            tokio::select! {
                biased;
                _ = cancel_rx => Err(TaskError::Cancelled),
                joined = join => joined.map_err(TaskError::from),
            }
        }
        .boxed()
        .shared();

        Self {
            id,
            finished,
            cancel_tx: Mutex::new(Some(cancel_tx)),
            abort,
            outcome,
        }
    } // end constructor

    /// Whether the underlying operation has run to an end (value, panic or abort).
    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Resolve waiters as cancelled and, if `may_interrupt`, abort the task.
    ///
    /// No-op once the operation has finished.
    pub(crate) fn cancel(&self, may_interrupt: bool) {
        if self.is_finished() {
            return;
        }

        let cancel_tx = self
            .cancel_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(cancel_tx) = cancel_tx {
            let _ = cancel_tx.send(());
        }

        if may_interrupt {
            self.abort.abort();
        }
    } // end method cancel
} // end impl Inflight

/// Shared handle to an operation started by [`TaskFence::run_once`](crate::TaskFence::run_once).
///
/// Every caller that joined the same in-flight operation holds a handle to the same
/// underlying entry; [`TaskHandle::ptr_eq`] tells whether two handles do. Awaiting
/// a handle yields the operation's value, or a [`TaskError`] if it was cancelled or
/// panicked. Dropping a handle does not stop the operation.
pub struct TaskHandle<V> {
    inflight: Arc<Inflight<V>>,
    outcome: SharedOutcome<V>,
}

impl<V> TaskHandle<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(inflight: Arc<Inflight<V>>) -> Self {
        let outcome = inflight.outcome.clone();
        Self { inflight, outcome }
    }

    /// Identifier of the tracked operation, unique within its fence.
    pub fn id(&self) -> u64 {
        self.inflight.id
    }

    /// Whether the operation itself has ended.
    ///
    /// A cancelled operation that ignores cancellation keeps reporting `false`
    /// until it returns on its own.
    pub fn is_finished(&self) -> bool {
        self.inflight.is_finished()
    }

    /// Whether both handles refer to the same operation.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.inflight, &other.inflight)
    }
}

impl<V> Clone for TaskHandle<V> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
            outcome: self.outcome.clone(),
        }
    }
}

impl<V> fmt::Debug for TaskHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.inflight.id)
            .field("finished", &self.inflight.finished.load(Ordering::Acquire))
            .finish()
    }
}

impl<V> Future for TaskHandle<V>
where
    V: Clone,
{
    type Output = Result<V, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().outcome).poll(cx)
    }
}

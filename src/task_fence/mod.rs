//! Single-flight execution per key.
//!
//! A [`TaskFence`] keeps at most one in-flight operation per key. Callers that ask
//! for an operation on a key that already has one running get a handle to that
//! running operation instead of starting a duplicate.
//!
//! # Lifecycle
//!
//! ```text
//! ABSENT --run_once--> RUNNING --completion / cancel--> ABSENT
//!                      RUNNING --run_once--> RUNNING (same handle)
//! ```
//!
//! Operations run as Tokio tasks on the runtime of the caller of
//! [`TaskFence::run_once`]. The entry is removed by the task itself when it ends
//! (value, panic or abort), and only if the map still holds that same entry.
//! A task dropped before it ever ran leaves its entry in place but marked
//! finished, so it no longer counts as running.

use std::{
    future::Future,
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::runtime::Handle;

use crate::{
    KeylatchError,
    runtime::{current_runtime, spawn_task},
};

mod task_handle;
pub use task_handle::*;

type Entries<K, V> = Arc<DashMap<K, Arc<Inflight<V>>>>;

/// Per-key single-flight deduplicator.
///
/// # Thread Safety
///
/// - Entries live in a [`DashMap`](dashmap::DashMap); check-and-create in
///   [`run_once`](TaskFence::run_once) holds the key's shard lock, so racing
///   callers on one key start the operation exactly once
/// - Removal on completion compares entry ids, so a late completion never evicts
///   a newer entry that replaced it
///
/// # Cancellation
///
/// [`cancel`](TaskFence::cancel) stops tracking immediately and resolves waiters
/// with [`TaskError::Cancelled`](crate::TaskError::Cancelled). The operation itself
/// stops only if `may_interrupt` is set and it reaches an `.await` point; code that
/// never yields keeps running.
///
/// # Examples
///
/// ```
/// use keylatch::TaskFence;
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let fence: TaskFence<&str, u64> = TaskFence::new();
///
/// let first = fence.run_once("profile:42", || async { 7 }).unwrap();
/// let second = fence.run_once("profile:42", || async { 8 }).unwrap();
///
/// assert!(keylatch::TaskHandle::ptr_eq(&first, &second));
/// assert_eq!(second.await, Ok(7));
/// # });
/// ```
pub struct TaskFence<K, V>
where
    K: Eq + Hash,
{
    entries: Entries<K, V>,
    next_id: AtomicU64,
}

impl<K, V> Default for TaskFence<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TaskFence<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty fence.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    } // end constructor

    /// Run the operation built by `start` unless one is already running for `key`.
    ///
    /// If `key` has a running operation, `start` is not called and a handle to the
    /// running operation is returned. Otherwise `start` is called, its future is
    /// spawned on the current Tokio runtime and a handle to it is returned.
    ///
    /// `start` is called while the key's shard is locked and must not call back
    /// into this fence.
    ///
    /// # Errors
    ///
    /// [`KeylatchError::NoRuntime`] when called outside a Tokio runtime. Nothing is
    /// stored and `start` is not called.
    pub fn run_once<F, Fut>(&self, key: K, start: F) -> Result<TaskHandle<V>, KeylatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let runtime = current_runtime()?;

        match self.entries.entry(key) {
            Entry::Occupied(entry) if !entry.get().is_finished() => {
                tracing::debug!(fence_id = entry.get().id, "joined in-flight operation");
                Ok(TaskHandle::new(Arc::clone(entry.get())))
            }
            entry => {
                let inflight = self.launch(&runtime, entry.key().clone(), start);
                entry.insert(Arc::clone(&inflight));

                tracing::debug!(fence_id = inflight.id, "started fenced operation");
                Ok(TaskHandle::new(inflight))
            }
        }
    } // end method run_once

    /// Whether `key` has an operation that has not finished yet.
    ///
    /// An entry left behind by a task that was dropped before it ran is removed here.
    pub fn is_running(&self, key: &K) -> bool {
        let running = match self.entries.get(key) {
            Some(inflight) => !inflight.is_finished(),
            None => return false,
        };

        if !running {
            self.entries
                .remove_if(key, |_, inflight| inflight.is_finished());
        }

        running
    }

    /// Stop tracking `key`'s operation and cancel it.
    ///
    /// Returns `true` if an entry was removed. Waiters resolve with
    /// [`TaskError::Cancelled`](crate::TaskError::Cancelled) unless the operation
    /// had already finished. With `may_interrupt` the task is also aborted;
    /// whether it actually stops depends on it reaching an `.await` point.
    pub fn cancel(&self, key: &K, may_interrupt: bool) -> bool {
        let Some((_, inflight)) = self.entries.remove(key) else {
            return false;
        };

        tracing::debug!(fence_id = inflight.id, may_interrupt, "cancelled fenced operation");
        inflight.cancel(may_interrupt);

        true
    } // end method cancel

    /// Forget every tracked operation without cancelling any of them.
    ///
    /// Outstanding handles keep working and the operations keep running.
    pub fn clear_all(&self) {
        self.entries.clear();
    }

    /// Number of tracked entries.
    ///
    /// Includes entries of tasks dropped before they ran (for example at runtime
    /// shutdown) until their key is next used.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn launch<F, Fut>(&self, runtime: &Handle, key: K, start: F) -> Arc<Inflight<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let finished = Arc::new(AtomicBool::new(false));

        let finish_marker = FinishOnDrop(Arc::clone(&finished));
        let entries = Arc::clone(&self.entries);
        let operation = start();

        // The unregister guard is built on first poll, never while `run_once`
        // still holds the shard lock.
        let join = spawn_task(runtime, async move {
            let _finished = finish_marker;
            let _unregister = Unregister { entries, key, id };
            operation.await
        });

        Arc::new(Inflight::new(id, finished, join))
    } // end method launch
} // end of impl

/// Marks the operation finished when its task is dropped, polled or not.
struct FinishOnDrop(Arc<AtomicBool>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Owned by the running task; removes its own entry when the task ends in any way.
struct Unregister<K, V>
where
    K: Eq + Hash,
{
    entries: Entries<K, V>,
    key: K,
    id: u64,
}

impl<K, V> Drop for Unregister<K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!(fence_id = self.id, "fenced operation panicked");
        }

        let id = self.id;
        self.entries
            .remove_if(&self.key, |_, inflight| inflight.id == id);
    }
}

use std::future::Future;

use tokio::{runtime::Handle, task::JoinHandle};

use crate::KeylatchError;

/// Handle to the runtime the caller is running on, if any.
pub(crate) fn current_runtime() -> Result<Handle, KeylatchError> {
    Handle::try_current().map_err(|_| KeylatchError::NoRuntime)
}

pub(crate) fn spawn_task<F>(runtime: &Handle, fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    runtime.spawn(fut)
}

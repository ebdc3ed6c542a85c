/// Error type for this crate.
///
/// Every variant is raised synchronously by the call that violated the constraint;
/// no state is changed when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeylatchError {
    /// An argument was out of range (zero permits, zero period, zero duration...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// More permits were requested than the bucket can ever hold.
    #[error("requested {requested} permits but capacity is {capacity}")]
    ExceedsCapacity {
        /// Permits asked for.
        requested: u64,
        /// Bucket capacity of the limiter.
        capacity: u64,
    },

    /// There is no Tokio runtime available to drive a fenced operation.
    #[error("no tokio runtime is available to run the operation")]
    NoRuntime,
}

/// Outcome of a fenced operation that did not produce a value.
///
/// Cloned to every caller that joined the same in-flight operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The operation was cancelled, either through
    /// [`TaskFence::cancel`](crate::TaskFence::cancel) or by runtime shutdown.
    #[error("operation was cancelled")]
    Cancelled,

    /// The operation panicked.
    #[error("operation panicked: {0}")]
    Panicked(String),
}

impl From<tokio::task::JoinError> for TaskError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            return TaskError::Cancelled;
        }

        let payload = err.into_panic();

        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };

        TaskError::Panicked(message)
    }
}

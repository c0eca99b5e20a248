use crate::queue::QueueName;
use thiserror::Error;

/// Error produced by a scheduled or run callback.
///
/// Boxed so callbacks can `?` any error type. The scheduler is
/// single-threaded, so no `Send` bound is required.
pub type CallbackError = Box<dyn std::error::Error + 'static>;

#[derive(Debug, Error)]
pub enum RunLoopError {
    /// The method handed to `run` or `schedule` could not be resolved to a callable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A lifecycle call was made while the loop stack was in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The queue name was not registered when the receiving loop was created.
    #[error("queue `{0}` is not flushed by this run loop")]
    UnknownQueue(QueueName),

    /// A callback returned an error. It is propagated unchanged.
    #[error("callback failed: {0}")]
    Callback(#[source] CallbackError),
}

impl From<CallbackError> for RunLoopError {
    fn from(err: CallbackError) -> Self {
        RunLoopError::Callback(err)
    }
}

impl RunLoopError {
    /// Returns the callback's own error if this is a callback failure.
    pub fn into_callback(self) -> Option<CallbackError> {
        match self {
            RunLoopError::Callback(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T, E = RunLoopError> = std::result::Result<T, E>;

//! Scheduler errors.

use std::time::Duration;

use super::tag::Tag;

/// Error delivered to a task's completion callback.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The body returned an error (or panicked).
    #[error(transparent)]
    Body(#[from] anyhow::Error),

    /// The body did not finish before its timeout.
    #[error("task '{tag}' timed out after {timeout:?}")]
    TimedOut {
        /// Tag of the timed out task.
        tag: Tag,
        /// The timeout that expired.
        timeout: Duration,
    },

    /// The task was cancelled before it was dispatched.
    #[error("task '{tag}' was cancelled")]
    Cancelled {
        /// Tag of the cancelled task.
        tag: Tag,
    },
}

impl TaskError {
    /// Whether this error was synthesized by a timeout.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::TimedOut { .. })
    }

    /// Whether this error was synthesized by a cancellation.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled { .. })
    }
}

/// Error returned synchronously by `submit`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// Tasks must carry a non-empty tag.
    #[error("task tag must not be empty")]
    EmptyTag,

    /// The control context has shut down.
    #[error("scheduler control context has shut down")]
    Closed,
}

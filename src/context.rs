//! Execution context threaded through a flow run.
//!
//! An [`ExecutionContext`] is the single cancellation context shared by every
//! phase of every node in a run: prep, each exec attempt, each retry delay,
//! post, and every batch worker. It combines an explicit
//! [`CancellationToken`] with an optional deadline. Cancellation is
//! cooperative: long-running node bodies are expected to select on
//! [`ExecutionContext::done`].
//!
//! ```rust
//! use flowgraph_rs::prelude::*;
//! use std::time::Duration;
//!
//! let ctx = ExecutionContext::new().with_timeout(Duration::from_secs(30));
//! assert!(ctx.err().is_none());
//!
//! ctx.cancel();
//! assert!(matches!(ctx.err(), Some(FlowError::Cancelled)));
//! ```

use crate::FlowError;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Cancellation context plus per-execution metadata.
///
/// Cloning is cheap and every clone observes the same cancellation.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    execution_id: String,
    attempt: usize,
    max_attempts: usize,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// A fresh context with its own cancellation token and no deadline.
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new())
    }

    /// A context driven by an existing token, e.g. one shared with a signal handler.
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
            execution_id: uuid::Uuid::new_v4().to_string(),
            attempt: 1,
            max_attempts: 1,
        }
    }

    /// Expire the context `timeout` from now. An earlier deadline is kept.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Expire the context at `deadline`. An earlier deadline is kept.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// A derived context: cancelled when this one is, but cancelling it does
    /// not affect this one. Used to stop sibling batch workers. Attempt
    /// numbers carry over.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            execution_id: uuid::Uuid::new_v4().to_string(),
            ..self.clone()
        }
    }

    pub(crate) fn for_attempt(&self, attempt: usize, max_attempts: usize) -> Self {
        Self {
            attempt,
            max_attempts,
            ..self.clone()
        }
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The underlying token, for handing to code that speaks `tokio_util` directly.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the context was cancelled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The reason this context is done, or `None` while it is still live.
    ///
    /// Explicit cancellation wins over an expired deadline.
    pub fn err(&self) -> Option<FlowError> {
        if self.cancel.is_cancelled() {
            return Some(FlowError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(FlowError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or expires, yielding the reason.
    pub async fn done(&self) -> FlowError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => FlowError::Cancelled,
                    _ = sleep_until(deadline) => FlowError::DeadlineExceeded,
                }
            }
            None => {
                self.cancel.cancelled().await;
                FlowError::Cancelled
            }
        }
    }

    /// Sleep for `duration` unless the context finishes first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), FlowError> {
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Unique id of this execution, for log correlation.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Current exec attempt, starting at 1.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Total exec attempts the current node allows.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Whether another exec attempt remains after the current one.
    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

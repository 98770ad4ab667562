//! Cancellable, deadline-bounded work context.
//!
//! Every blocking operation in the dispatch core (the downstream HTTP call,
//! the backoff sleep, store calls made while reconciling a status) runs
//! under a [`WorkContext`]. A context always has a deadline; there is no
//! unbounded variant. Cancelling a context also cancels every context derived
//! from it.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("context cancelled")]
    Cancelled,
}

/// Deadline plus cancellation signal, threaded through blocking calls.
#[derive(Debug, Clone)]
pub struct WorkContext {
    deadline: Instant,
    cancel: CancellationToken,
}

impl WorkContext {
    /// A root context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A root context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline,
            cancel: CancellationToken::new(),
        }
    }

    /// A root context tied to an existing cancellation token (e.g. a
    /// process shutdown token).
    pub fn with_token(token: &CancellationToken, timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel: token.child_token(),
        }
    }

    /// A derived context: cancelled with its parent, and never outliving the
    /// parent's deadline.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        Self {
            deadline: self.deadline.min(Instant::now() + timeout),
            cancel: self.cancel.child_token(),
        }
    }

    /// A derived context that is cancelled with its parent but gets its own
    /// deadline, `timeout` from now, even if the parent's has passed.
    pub fn child_with_fresh_deadline(&self, timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline (zero once it has passed).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Cancel this context and everything derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// `Some` once the context is cancelled or past its deadline.
    pub fn err(&self) -> Option<ContextError> {
        if self.cancel.is_cancelled() {
            Some(ContextError::Cancelled)
        } else if Instant::now() >= self.deadline {
            Some(ContextError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Drive `fut` until it completes, the deadline passes, or the context is
    /// cancelled, whichever happens first. `fut` is dropped when the context
    /// wins.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ContextError::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(ContextError::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `duration`, waking early with an error if the context ends.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        self.run(tokio::time::sleep(duration)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_returns_output_before_deadline() {
        let ctx = WorkContext::with_timeout(Duration::from_secs(5));
        assert_eq!(ctx.run(async { 7 }).await, Ok(7));
        assert!(ctx.err().is_none());
    }

    #[tokio::test]
    async fn deadline_interrupts_a_long_sleep() {
        let ctx = WorkContext::with_timeout(Duration::from_millis(20));
        let started = std::time::Instant::now();
        let res = ctx.sleep(Duration::from_secs(30)).await;
        assert_eq!(res, Err(ContextError::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_propagates_to_children() {
        let parent = WorkContext::with_timeout(Duration::from_secs(30));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert!(child.deadline() <= parent.deadline());

        let waiter = tokio::spawn({
            let child = child.clone();
            async move { child.sleep(Duration::from_secs(30)).await }
        });
        parent.cancel();

        assert_eq!(waiter.await.unwrap(), Err(ContextError::Cancelled));
        assert_eq!(child.err(), Some(ContextError::Cancelled));
    }

    #[tokio::test]
    async fn fresh_deadline_outlives_parent_but_not_its_cancellation() {
        let parent = WorkContext::with_timeout(Duration::ZERO);
        let child = parent.child_with_fresh_deadline(Duration::from_secs(30));
        assert_eq!(parent.err(), Some(ContextError::DeadlineExceeded));
        assert_eq!(child.run(async { 1 }).await, Ok(1));

        parent.cancel();
        assert_eq!(child.err(), Some(ContextError::Cancelled));
    }

    #[tokio::test]
    async fn expired_context_does_not_poll_the_future() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let polled = AtomicBool::new(false);
        let ctx = WorkContext::with_timeout(Duration::ZERO);
        let res = ctx.run(async { polled.store(true, Ordering::SeqCst) }).await;

        assert_eq!(res, Err(ContextError::DeadlineExceeded));
        assert!(!polled.load(Ordering::SeqCst));
    }
}

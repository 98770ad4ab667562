//! Job dispatch core.
//!
//! ## Components
//!
//! - `DownstreamHandler`: one HTTP dispatch of a queued job to its worker
//! - `JobProcessor`: a full dispatch cycle (expiry check, 503 backoff,
//!   finalizing permanent failures)
//! - `StatusReconciler`: applies worker status callbacks to the store
//! - `JobDispatcher`: polls the store and runs cycles concurrently
//!
//! ## Lifecycle
//!
//! ```text
//! enqueue -> queued --acquire--> in-progress --dispatch--> (worker)
//!                ^                                           |
//!                |  failed, retryable, attempts left         | status callback
//!                +-------------------------------------------+
//!                                                            |
//!                          succeeded / failed (final) -> archived
//! ```

pub mod dispatcher;
pub mod downstream;
pub mod processor;
pub mod reconciler;
pub mod retry;

pub use dispatcher::{DispatcherConfig, DispatcherStats, JobDispatcher, JobDispatcherHandle};
pub use downstream::{
    ATTEMPTS_HEADER, DOWNSTREAM_USER, DispatchOutcome, DownstreamError, DownstreamHandler,
};
pub use processor::{JobProcessor, ProcessError, ProcessorConfig};
pub use reconciler::{StatusCallbackError, StatusReconciler};
pub use retry::{BackoffStrategy, RetryPolicy};

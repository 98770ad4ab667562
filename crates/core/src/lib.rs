//! `relayq-core`: job dispatch domain building blocks.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, the three record kinds the dispatcher works with, and the
//! structured error body exchanged with workers and callers.

pub mod error;
pub mod id;
pub mod job;
pub mod rest_error;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{
    ArchivedJob, ArchivedJobStatus, DeliveryStrategy, EnqueueJobParams, JobType, QueuedJob,
    QueuedJobStatus,
};
pub use rest_error::RestError;

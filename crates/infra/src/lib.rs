//! Infrastructure layer: job store adapters, the downstream HTTP client, and
//! the dispatch / status-reconciliation core built on top of them.

pub mod context;
pub mod jobs;
pub mod store;

pub use context::{ContextError, WorkContext};

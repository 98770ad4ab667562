//! HTTP front door: status callbacks, job lookup, configuration and
//! process bootstrap.

pub mod app;
pub mod config;
pub mod middleware;

//! Ingest HTTP API for notifyd.
//!
//! Validates submissions, enforces the target-URL policy, deduplicates by
//! idempotency key, and serves task status and cancel. All state-machine
//! writes go through the core store; this crate never talks SQL.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use notifyd_core::{storage::Storage, Clock};

pub mod config;
pub mod handlers;
pub mod policy;
pub mod server;

pub use config::Config;
pub use server::{create_router, start_server};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Task store.
    pub storage: Storage,

    /// Read-only configuration snapshot.
    pub config: Arc<Config>,

    /// Clock for timestamps, injectable in tests.
    pub clock: Arc<dyn Clock>,
}

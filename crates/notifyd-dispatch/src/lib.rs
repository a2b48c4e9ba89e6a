//! Delivery engine for notifyd.
//!
//! Claims due notification tasks from PostgreSQL with `FOR UPDATE SKIP
//! LOCKED`, issues the outbound HTTP calls, classifies outcomes, journals
//! every attempt, and drives the retry state machine with exponential
//! backoff. Replicas coordinate only through the database: any number of
//! engines can run against the same store and every task is delivered by
//! exactly one claimant at a time.
//!
//! ```text
//!              ┌────────────────────────────────────────┐
//!              │              PostgreSQL                │
//!              │   notification_tasks (skip-locked      │
//!              │   claim)  +  notification_attempts     │
//!              └────────────────────────────────────────┘
//!                    │                ▲            ▲
//!               claim batch      journal row   state change
//!                    ▼                │            │
//!      ┌──────────┐ ┌──────────┐ ┌──────────┐  ┌────────┐
//!      │ worker 0 │ │ worker 1 │ │ worker N │  │ reaper │
//!      └──────────┘ └──────────┘ └──────────┘  └────────┘
//!            │            │            │
//!            ▼            ▼            ▼
//!         target       target       target
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod error;
pub mod headers;
pub mod reaper;
pub mod retry;
pub mod worker;
pub mod worker_pool;

pub use client::{ClientConfig, OutboundClient, OutboundResponse};
pub use error::{classify_status, DispatchError, Result};
pub use retry::RetryPolicy;
pub use worker::{DispatchConfig, DispatchEngine, DispatchStats, DispatchWorker};
pub use worker_pool::WorkerPool;

/// Default number of concurrent workers per replica.
pub const DEFAULT_WORKER_COUNT: usize = 5;

/// Default maximum tasks claimed per poll tick.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Maximum characters of an error message in the attempt journal.
pub const ERROR_MESSAGE_LIMIT: usize = 512;

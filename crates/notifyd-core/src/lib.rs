//! Core domain types and persistence for the notifyd delivery engine.
//!
//! Provides the task and attempt entities, the error taxonomy, a clock
//! abstraction, and the PostgreSQL-backed task store. Everything above this
//! crate (dispatcher, ingest API) depends on these foundations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    AttemptOutcome, AttemptStatus, HttpMethod, NewTask, NotificationAttempt, NotificationTask,
    TaskId, TaskStatus,
};
pub use time::{Clock, RealClock};

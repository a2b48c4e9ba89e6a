//! PostgreSQL persistence layer for tasks and their attempt journal.
//!
//! Repositories are the only code allowed to touch the two tables. They
//! translate between domain entities and rows, and they own the transaction
//! boundaries that make the claim and the journal append atomic. Direct SQL
//! outside this module is forbidden.

use std::sync::Arc;

use sqlx::PgPool;

pub mod attempts;
pub mod tasks;

use crate::error::Result;

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Task rows and state-machine transitions.
    pub tasks: Arc<tasks::Repository>,

    /// Append-only attempt journal.
    pub attempts: Arc<attempts::Repository>,
}

impl Storage {
    /// Creates a storage instance over the given pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            tasks: Arc::new(tasks::Repository::new(pool.clone())),
            attempts: Arc::new(attempts::Repository::new(pool)),
        }
    }

    /// Verifies database connectivity with a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` when the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.tasks.pool()).await?;

        Ok(())
    }
}

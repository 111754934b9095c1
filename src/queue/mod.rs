#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Durable, single-process, embedded persistent priority work queue (spec
//! §4.1). One table holds tickets with indexed `(status, priority, created_at)`
//! for claim ordering and `(bead_id)` for lookups (spec §6).

mod backoff;
mod ops;
mod schema;

pub use backoff::backoff_duration;

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Connection pool and operations over the tickets table. Grounded on the
/// teacher's `db/swarm_db/core.rs` (`SwarmDb` wrapping a connection pool),
/// with the backend switched from `PgPool` to `SqlitePool` because spec §6
/// specifies a single-process embedded store, not a networked server.
#[derive(Clone)]
pub struct WorkQueue {
    pool: SqlitePool,
}

impl WorkQueue {
    /// Opens (creating if necessary) the SQLite database at `path` and runs
    /// the schema migration.
    ///
    /// # Errors
    /// Returns [`crate::error::CitadelError::Sqlx`] if the connection or
    /// migration fails.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| crate::error::CitadelError::Database(format!("invalid queue path: {e}")))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        schema::migrate(&pool).await?;
        info!("opened work queue at {}", path.display());
        Ok(Self { pool })
    }

    /// In-memory queue for tests; equivalent schema, no file on disk.
    ///
    /// # Errors
    /// Returns [`crate::error::CitadelError::Sqlx`] if the migration fails.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        schema::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub use ops::{PendingBeadOutput, TicketRow};

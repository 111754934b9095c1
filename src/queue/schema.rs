#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::error::Result;
use sqlx::SqlitePool;

/// Schema from spec §6: a single `tickets` table plus the two indexes the
/// claim path and the bead lookup path need.
const CREATE_TICKETS: &str = r"
CREATE TABLE IF NOT EXISTS tickets (
    id              TEXT PRIMARY KEY,
    bead_id         TEXT NOT NULL,
    status          TEXT NOT NULL,
    priority        INTEGER NOT NULL,
    target_role     TEXT NOT NULL,
    assignee_id     TEXT,
    created_at      INTEGER NOT NULL,
    started_at      INTEGER,
    completed_at    INTEGER,
    heartbeat_at    INTEGER,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    output          TEXT,
    next_attempt_at INTEGER NOT NULL DEFAULT 0
);
";

const CREATE_CLAIM_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_tickets_claim ON tickets (status, priority ASC, created_at ASC);";

const CREATE_BEAD_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_tickets_bead ON tickets (bead_id);";

pub(super) async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(CREATE_TICKETS).execute(pool).await?;
    sqlx::query(CREATE_CLAIM_INDEX).execute(pool).await?;
    sqlx::query(CREATE_BEAD_INDEX).execute(pool).await?;
    Ok(())
}

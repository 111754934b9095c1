#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Ticket CAS operations (spec §4.1). Grounded on the teacher's
//! `db/write_ops/bead_ops.rs::claim_bead` transaction-acquire-CAS-commit
//! shape, generalized from Postgres `FOR UPDATE`/`ON CONFLICT` to SQLite's
//! `BEGIN IMMEDIATE` single-writer transactions (the embedded store spec §6
//! calls for has no row-level locking, so each CAS runs inside its own
//! immediate transaction instead).

use super::backoff::backoff_duration;
use super::WorkQueue;
use crate::error::{CitadelError, Result};
use crate::types::{BeadId, Priority, Role, Ticket, TicketId, TicketStatus};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, warn};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

pub(super) fn row_to_ticket(row: &SqliteRow) -> Result<Ticket> {
    let id: String = row.try_get("id")?;
    let bead_id: String = row.try_get("bead_id")?;
    let status: String = row.try_get("status")?;
    let priority: i64 = row.try_get("priority")?;
    let target_role: String = row.try_get("target_role")?;
    let assignee_id: Option<String> = row.try_get("assignee_id")?;
    let created_at: i64 = row.try_get("created_at")?;
    let started_at: Option<i64> = row.try_get("started_at")?;
    let completed_at: Option<i64> = row.try_get("completed_at")?;
    let heartbeat_at: Option<i64> = row.try_get("heartbeat_at")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let output: Option<String> = row.try_get("output")?;
    let next_attempt_at: i64 = row.try_get("next_attempt_at")?;

    let uuid = uuid::Uuid::parse_str(&id)
        .map_err(|e| CitadelError::Database(format!("bad ticket id {id}: {e}")))?;

    Ok(Ticket {
        id: TicketId::from_uuid(uuid),
        bead_id: BeadId::new(bead_id),
        status: TicketStatus::try_from(status.as_str())
            .map_err(CitadelError::Database)?,
        priority: Priority(u8::try_from(priority).unwrap_or(3)),
        target_role: Role::try_from(target_role.as_str()).map_err(CitadelError::Database)?,
        assignee_id,
        created_at: ms_to_dt(created_at),
        started_at: started_at.map(ms_to_dt),
        completed_at: completed_at.map(ms_to_dt),
        heartbeat_at: heartbeat_at.map(ms_to_dt),
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        output: output
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        next_attempt_at: ms_to_dt(next_attempt_at),
    })
}

/// Ticket output joined with the bead it belongs to, used by the piper
/// (spec §4.4) to read an upstream bead's completed output without a
/// second round trip.
#[derive(Debug, Clone)]
pub struct PendingBeadOutput {
    pub bead_id: BeadId,
    pub output: Option<Value>,
}

/// A raw ticket row, re-exported for callers (the pool/hook loop, the
/// conductor) that need the full record rather than just an id.
pub type TicketRow = Ticket;

impl WorkQueue {
    /// Creates a new `queued` ticket with `retry_count = 0`. No uniqueness
    /// check is performed here; the caller (the routing tool) enforces
    /// at-most-one-active (spec §4.1).
    ///
    /// # Errors
    /// Returns [`CitadelError::Sqlx`] on a database failure.
    pub async fn enqueue(
        &self,
        bead_id: &BeadId,
        priority: Priority,
        target_role: Role,
    ) -> Result<TicketId> {
        let id = TicketId::new();
        let now = now_ms();
        sqlx::query(
            "INSERT INTO tickets
                (id, bead_id, status, priority, target_role, created_at, next_attempt_at)
             VALUES (?1, ?2, 'queued', ?3, ?4, ?5, 0)",
        )
        .bind(id.to_string())
        .bind(bead_id.value())
        .bind(i64::from(priority.0))
        .bind(target_role.as_str())
        .bind(now)
        .execute(self.pool())
        .await?;
        debug!(%bead_id, role = %target_role, %id, "enqueued ticket");
        Ok(id)
    }

    /// Atomically selects the oldest highest-priority `queued` ticket for
    /// `role` whose `next_attempt_at <= now`, and transitions it to
    /// `processing` (spec §4.1). Claim ordering is `(priority ASC,
    /// created_at ASC, id ASC)` (spec §5).
    ///
    /// # Errors
    /// Returns [`CitadelError::Sqlx`] on a database failure.
    pub async fn claim(&self, assignee_id: &str, role: Role) -> Result<Option<Ticket>> {
        let mut tx = self.pool().begin().await?;
        let now = now_ms();

        let row = sqlx::query(
            "SELECT id FROM tickets
             WHERE status = 'queued' AND target_role = ?1 AND next_attempt_at <= ?2
             ORDER BY priority ASC, created_at ASC, id ASC
             LIMIT 1",
        )
        .bind(role.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let ticket_id: String = row.try_get("id")?;

        let updated = sqlx::query(
            "UPDATE tickets
             SET status = 'processing', assignee_id = ?1, started_at = ?2, heartbeat_at = ?2
             WHERE id = ?3 AND status = 'queued'",
        )
        .bind(assignee_id)
        .bind(now)
        .bind(&ticket_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            // Lost a race with a concurrent claimer; nothing to return.
            tx.rollback().await?;
            return Ok(None);
        }

        let row = sqlx::query("SELECT * FROM tickets WHERE id = ?1")
            .bind(&ticket_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        let ticket = row_to_ticket(&row)?;
        debug!(%assignee_id, role = %role, ticket_id = %ticket.id, "claimed ticket");
        Ok(Some(ticket))
    }

    /// Updates `heartbeat_at = now` only if `status = processing`; a silent
    /// no-op otherwise (spec §4.1).
    ///
    /// # Errors
    /// Returns [`CitadelError::Sqlx`] on a database failure.
    pub async fn heartbeat(&self, ticket_id: TicketId) -> Result<()> {
        sqlx::query("UPDATE tickets SET heartbeat_at = ?1 WHERE id = ?2 AND status = 'processing'")
            .bind(now_ms())
            .bind(ticket_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// CAS `processing -> completed`. If `output` is `Some`, it replaces the
    /// output slot only when no output is already stored (first-writer-wins,
    /// spec §3 ticket invariant 3 / spec §8). If the current status is not
    /// `processing`, fails loudly (spec §4.1) — a completion attempt from a
    /// non-`processing` state is a hard error.
    ///
    /// # Errors
    /// Returns [`CitadelError::Conflict`] if the ticket is not `processing`,
    /// or [`CitadelError::Sqlx`] on a database failure.
    pub async fn complete(&self, ticket_id: TicketId, output: Option<Value>) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let row = sqlx::query("SELECT status, output FROM tickets WHERE id = ?1")
            .bind(ticket_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Err(CitadelError::NotFound(format!("ticket {ticket_id} not found")));
        };
        let status: String = row.try_get("status")?;
        if status != "processing" {
            tx.rollback().await?;
            return Err(CitadelError::Conflict(format!(
                "cannot complete ticket {ticket_id}: status is {status}, not processing"
            )));
        }
        let existing_output: Option<String> = row.try_get("output")?;

        // First non-null output wins; later completes never overwrite a
        // stored output, even with a new value (spec §4.1, §8).
        let next_output = if existing_output.is_some() {
            existing_output
        } else {
            match output {
                Some(v) => Some(serde_json::to_string(&v)?),
                None => None,
            }
        };

        let now = now_ms();
        let updated = sqlx::query(
            "UPDATE tickets SET status = 'completed', completed_at = ?1, output = ?2
             WHERE id = ?3 AND status = 'processing'",
        )
        .bind(now)
        .bind(next_output)
        .bind(ticket_id.to_string())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(CitadelError::Conflict(format!(
                "ticket {ticket_id} changed state concurrently during complete"
            )));
        }
        tx.commit().await?;
        debug!(%ticket_id, "completed ticket");
        Ok(())
    }

    /// `permanent`: CAS `processing -> failed`. Otherwise CAS
    /// `processing -> queued`, clearing assignee/started/heartbeat,
    /// incrementing `retry_count`, and setting `next_attempt_at` with
    /// exponential backoff (spec §4.1).
    ///
    /// # Errors
    /// Returns [`CitadelError::Conflict`] if the ticket is not `processing`,
    /// or [`CitadelError::Sqlx`] on a database failure.
    pub async fn fail(&self, ticket_id: TicketId, permanent: bool) -> Result<()> {
        if permanent {
            let updated = sqlx::query(
                "UPDATE tickets SET status = 'failed' WHERE id = ?1 AND status = 'processing'",
            )
            .bind(ticket_id.to_string())
            .execute(self.pool())
            .await?;
            if updated.rows_affected() != 1 {
                return Err(CitadelError::Conflict(format!(
                    "cannot permanently fail ticket {ticket_id}: not processing"
                )));
            }
            warn!(%ticket_id, "ticket permanently failed");
            return Ok(());
        }

        let mut tx = self.pool().begin().await?;
        let row = sqlx::query("SELECT retry_count FROM tickets WHERE id = ?1 AND status = 'processing'")
            .bind(ticket_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Err(CitadelError::Conflict(format!(
                "cannot requeue ticket {ticket_id}: not processing"
            )));
        };
        let retry_count: i64 = row.try_get("retry_count")?;
        let next_retry_count = retry_count + 1;
        let backoff_ms = i64::try_from(
            backoff_duration(u32::try_from(next_retry_count).unwrap_or(u32::MAX)).as_millis(),
        )
        .unwrap_or(i64::MAX);
        let next_attempt_at = now_ms() + backoff_ms;

        let updated = sqlx::query(
            "UPDATE tickets
             SET status = 'queued', assignee_id = NULL, started_at = NULL, heartbeat_at = NULL,
                 retry_count = ?1, next_attempt_at = ?2
             WHERE id = ?3 AND status = 'processing'",
        )
        .bind(next_retry_count)
        .bind(next_attempt_at)
        .bind(ticket_id.to_string())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(CitadelError::Conflict(format!(
                "ticket {ticket_id} changed state concurrently during fail"
            )));
        }
        tx.commit().await?;
        warn!(%ticket_id, retry_count = next_retry_count, "ticket requeued with backoff");
        Ok(())
    }

    /// Same as [`Self::release_stalled`] but scoped to `role` and bounded by
    /// `max_retries` (spec §4.6/§7): a stalled ticket whose next retry would
    /// exceed `max_retries` is permanently failed instead of requeued, the
    /// same terminal outcome non-permanent `fail` gets from a ticket that
    /// has exhausted its budget. Returns `(requeued, permanently_failed)`.
    ///
    /// # Errors
    /// Returns [`CitadelError::Sqlx`] on a database failure.
    pub async fn release_stalled_for_role(
        &self,
        role: Role,
        timeout_ms: i64,
        max_retries: u32,
    ) -> Result<(u32, u32)> {
        let mut tx = self.pool().begin().await?;
        let cutoff = now_ms() - timeout_ms;

        let rows = sqlx::query(
            "SELECT id, retry_count FROM tickets
             WHERE status = 'processing' AND target_role = ?1 AND heartbeat_at < ?2",
        )
        .bind(role.as_str())
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut requeued = 0_u32;
        let mut permanently_failed = 0_u32;
        for row in rows {
            let id: String = row.try_get("id")?;
            let retry_count: i64 = row.try_get("retry_count")?;
            let next_retry_count = retry_count + 1;

            if u32::try_from(next_retry_count).unwrap_or(u32::MAX) > max_retries {
                let updated =
                    sqlx::query("UPDATE tickets SET status = 'failed' WHERE id = ?1 AND status = 'processing'")
                        .bind(&id)
                        .execute(&mut *tx)
                        .await?;
                if updated.rows_affected() == 1 {
                    permanently_failed += 1;
                }
                continue;
            }

            let backoff_ms = i64::try_from(
                backoff_duration(u32::try_from(next_retry_count).unwrap_or(u32::MAX)).as_millis(),
            )
            .unwrap_or(i64::MAX);
            let next_attempt_at = now_ms() + backoff_ms;

            let updated = sqlx::query(
                "UPDATE tickets
                 SET status = 'queued', assignee_id = NULL, started_at = NULL, heartbeat_at = NULL,
                     retry_count = ?1, next_attempt_at = ?2
                 WHERE id = ?3 AND status = 'processing'",
            )
            .bind(next_retry_count)
            .bind(next_attempt_at)
            .bind(&id)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 1 {
                requeued += 1;
            }
        }
        tx.commit().await?;
        if requeued > 0 || permanently_failed > 0 {
            warn!(%role, requeued, permanently_failed, "released stalled tickets");
        }
        Ok((requeued, permanently_failed))
    }

    /// For every `processing` ticket whose `heartbeat_at` is older than
    /// `timeout_ms`, applies the same transformation as non-permanent
    /// `fail` (spec §4.1). Returns the number released.
    ///
    /// # Errors
    /// Returns [`CitadelError::Sqlx`] on a database failure.
    pub async fn release_stalled(&self, timeout_ms: i64) -> Result<u32> {
        let mut tx = self.pool().begin().await?;
        let cutoff = now_ms() - timeout_ms;

        let rows = sqlx::query(
            "SELECT id, retry_count FROM tickets
             WHERE status = 'processing' AND heartbeat_at < ?1",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut released = 0_u32;
        for row in rows {
            let id: String = row.try_get("id")?;
            let retry_count: i64 = row.try_get("retry_count")?;
            let next_retry_count = retry_count + 1;
            let backoff_ms = i64::try_from(
                backoff_duration(u32::try_from(next_retry_count).unwrap_or(u32::MAX)).as_millis(),
            )
            .unwrap_or(i64::MAX);
            let next_attempt_at = now_ms() + backoff_ms;

            let updated = sqlx::query(
                "UPDATE tickets
                 SET status = 'queued', assignee_id = NULL, started_at = NULL, heartbeat_at = NULL,
                     retry_count = ?1, next_attempt_at = ?2
                 WHERE id = ?3 AND status = 'processing'",
            )
            .bind(next_retry_count)
            .bind(next_attempt_at)
            .bind(&id)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 1 {
                released += 1;
            }
        }
        tx.commit().await?;
        if released > 0 {
            warn!(released, "released stalled tickets");
        }
        Ok(released)
    }

    /// Returns the ticket in `{queued, processing}` for `bead_id`, if any
    /// (the "active ticket", spec §3 ticket invariant 1).
    ///
    /// # Errors
    /// Returns [`CitadelError::Sqlx`] on a database failure.
    pub async fn get_active_ticket(&self, bead_id: &BeadId) -> Result<Option<Ticket>> {
        let row = sqlx::query(
            "SELECT * FROM tickets
             WHERE bead_id = ?1 AND status IN ('queued', 'processing')
             LIMIT 1",
        )
        .bind(bead_id.value())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_ticket).transpose()
    }

    /// Returns the most recently completed ticket's output for `bead_id`,
    /// ties in `completed_at` broken by ticket id (spec §5, resolving the
    /// Open Question in spec §9).
    ///
    /// # Errors
    /// Returns [`CitadelError::Sqlx`] on a database failure.
    pub async fn get_output(&self, bead_id: &BeadId) -> Result<Option<Value>> {
        let row = sqlx::query(
            "SELECT output FROM tickets
             WHERE bead_id = ?1 AND status = 'completed'
             ORDER BY completed_at DESC, id DESC
             LIMIT 1",
        )
        .bind(bead_id.value())
        .fetch_optional(self.pool())
        .await?;
        let Some(row) = row else { return Ok(None) };
        let output: Option<String> = row.try_get("output")?;
        output.as_deref().map(serde_json::from_str).transpose().map_err(Into::into)
    }

    /// Returns when the most recently completed ticket for `bead_id`
    /// finished, if any — used by the janitor's grace-period check (spec
    /// §4.3 step 2) to avoid yanking a bead back to `open` while its
    /// worker handler is still between `queue.complete` and `beads.update`.
    ///
    /// # Errors
    /// Returns [`CitadelError::Sqlx`] on a database failure.
    pub async fn last_completed_at(&self, bead_id: &BeadId) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT completed_at FROM tickets
             WHERE bead_id = ?1 AND status = 'completed'
             ORDER BY completed_at DESC, id DESC
             LIMIT 1",
        )
        .bind(bead_id.value())
        .fetch_optional(self.pool())
        .await?;
        let Some(row) = row else { return Ok(None) };
        let completed_at: Option<i64> = row.try_get("completed_at")?;
        Ok(completed_at.map(ms_to_dt))
    }

    /// Counts `queued` tickets for `role`, used by pool scaling (spec
    /// §4.3 step 5).
    ///
    /// # Errors
    /// Returns [`CitadelError::Sqlx`] on a database failure.
    pub async fn get_pending_count(&self, role: Role) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tickets WHERE status = 'queued' AND target_role = ?1",
        )
        .bind(role.as_str())
        .fetch_one(self.pool())
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Deletes all tickets for `bead_id` (admin/CLI only, spec §4.1).
    ///
    /// # Errors
    /// Returns [`CitadelError::Sqlx`] on a database failure.
    pub async fn reset_bead(&self, bead_id: &BeadId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tickets WHERE bead_id = ?1")
            .bind(bead_id.value())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Deletes every ticket in the queue (admin/CLI `reset-queue` with no
    /// bead id, spec §6). The bead store itself is untouched; beads simply
    /// get re-routed from scratch on the conductor's next scan.
    ///
    /// # Errors
    /// Returns [`CitadelError::Sqlx`] on a database failure.
    pub async fn reset_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tickets").execute(self.pool()).await?;
        Ok(result.rows_affected())
    }

    /// Every ticket currently `queued` or `processing`, used by the
    /// janitor's stale-role reconciliation (spec §4.3 step 2, spec §8
    /// "Zombie reconciliation"): a ticket left behind after its bead moved
    /// on to a different stage targets a role nothing will ever route work
    /// for again.
    ///
    /// # Errors
    /// Returns [`CitadelError::Sqlx`] on a database failure.
    pub async fn list_active_tickets(&self) -> Result<Vec<Ticket>> {
        let rows = sqlx::query("SELECT * FROM tickets WHERE status IN ('queued', 'processing')")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(row_to_ticket).collect()
    }

    /// Removes a single ticket outright regardless of its status, used to
    /// retire a ticket whose `target_role` no longer matches the bead it
    /// belongs to rather than leave it blocking `get_active_ticket` forever.
    /// Returns whether a row was actually removed.
    ///
    /// # Errors
    /// Returns [`CitadelError::Sqlx`] on a database failure.
    pub async fn cancel_ticket(&self, ticket_id: TicketId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tickets WHERE id = ?1")
            .bind(ticket_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

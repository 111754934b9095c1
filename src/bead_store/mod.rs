#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Typed wrapper over the external issue-tracker subprocess (spec §4's
//! "Bead Store Adapter" and §6's `bd` command contract). Promoted to its own
//! `[MODULE]` in SPEC_FULL.md because the conductor, piper, and formula
//! compiler all depend on it as a trait boundary.

mod memory;
mod subprocess;

pub use memory::InMemoryBeadStore;
pub use subprocess::SubprocessBeadStore;

use crate::error::Result;
use crate::types::{Bead, BeadId, BeadStatus};
use async_trait::async_trait;
use serde_json::Value;

/// Abstract bead store (spec §9 DESIGN NOTES: "a systems-language rewrite
/// should hide the subprocess behind an interface with a single in-memory
/// implementation for tests and the subprocess implementation for
/// production").
#[async_trait]
pub trait BeadStore: Send + Sync {
    /// Environment health check; the conductor refuses to start if this
    /// returns `false` (spec §4.3 step 1).
    async fn doctor(&self) -> Result<bool>;

    async fn create(&self, params: CreateBeadParams) -> Result<BeadId>;

    async fn show(&self, id: &BeadId) -> Result<Option<Bead>>;

    async fn list(&self, status: Option<BeadStatus>) -> Result<Vec<Bead>>;

    /// Beads with no open blockers, ordered the way `bd ready` reports them.
    async fn ready(&self) -> Result<Vec<Bead>>;

    async fn update(&self, id: &BeadId, update: BeadUpdate) -> Result<()>;

    async fn dep_add(&self, child: &BeadId, parent: &BeadId) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct CreateBeadParams {
    pub title: String,
    pub priority: Option<u8>,
    pub parent: Option<BeadId>,
    pub bead_type: Option<String>,
    pub description: Option<String>,
}

/// A partial update to a bead. `None` fields are left untouched; this
/// mirrors the external `bd update <id> …` flag-per-field contract (spec
/// §6) rather than requiring callers to round-trip the full bead.
#[derive(Debug, Clone, Default)]
pub struct BeadUpdate {
    pub status: Option<BeadStatus>,
    pub assignee: Option<Option<String>>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
    pub acceptance_test: Option<String>,
    pub context: Option<Value>,
}

impl BeadUpdate {
    #[must_use]
    pub fn status(status: BeadStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.add_labels.push(label.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn with_acceptance_test(mut self, test: impl Into<String>) -> Self {
        self.acceptance_test = Some(test.into());
        self
    }
}

/// Applies a [`BeadUpdate`] against an in-memory [`Bead`], used by both the
/// in-memory test store and as the reconciliation step after a subprocess
/// mutation returns the now-current JSON (spec §3 invariant 1: status
/// transitions are validated here before being accepted).
///
/// Builds the post-update bead on a clone first and validates the status
/// transition against *that*, not the pre-update bead — a single update
/// that both adds the `failed` label and moves to `done` (the common
/// "fail_work"-style call) must see its own label addition before the
/// `done` acceptance-test gate runs. `bead` is only overwritten once the
/// whole update is known to be valid, so a rejected update leaves it
/// untouched.
pub(crate) fn apply_update(bead: &mut Bead, update: &BeadUpdate) -> Result<()> {
    let mut next = bead.clone();
    if let Some(assignee) = &update.assignee {
        next.assignee = assignee.clone();
    }
    for label in &update.add_labels {
        if !next.labels.iter().any(|l| l == label) {
            next.labels.push(label.clone());
        }
    }
    next.labels.retain(|l| !update.remove_labels.contains(l));
    if let Some(test) = &update.acceptance_test {
        next.acceptance_test = Some(test.clone());
    }
    if let Some(context) = &update.context {
        next.context = context.clone();
    }
    if let Some(target) = update.status {
        crate::state_machine::validate_transition(&next, target)?;
        next.status = target;
    }
    next.updated_at = chrono::Utc::now();
    *bead = next;
    Ok(())
}

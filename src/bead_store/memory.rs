#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use super::{apply_update, BeadStore, BeadUpdate, CreateBeadParams};
use crate::error::{CitadelError, Result};
use crate::types::{Bead, BeadId, BeadStatus, Priority};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// In-memory bead store, per spec §9 DESIGN NOTES ("a single in-memory
/// implementation for tests"). Test-time substitute for
/// [`super::SubprocessBeadStore`].
#[derive(Default)]
pub struct InMemoryBeadStore {
    beads: Mutex<HashMap<BeadId, Bead>>,
    seq: AtomicU64,
}

impl InMemoryBeadStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> BeadId {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        BeadId::new(format!("b-{n}"))
    }
}

#[async_trait]
impl BeadStore for InMemoryBeadStore {
    async fn doctor(&self) -> Result<bool> {
        Ok(true)
    }

    async fn create(&self, params: CreateBeadParams) -> Result<BeadId> {
        let id = self.next_id();
        let now = Utc::now();
        let bead = Bead {
            id: id.clone(),
            title: params.title,
            status: BeadStatus::Open,
            priority: Priority(params.priority.unwrap_or(1)).clamp(),
            assignee: None,
            labels: vec![],
            blockers: vec![],
            acceptance_test: None,
            parent: params.parent,
            bead_type: params.bead_type,
            description: params.description,
            context: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        let mut guard = self
            .beads
            .lock()
            .map_err(|_| CitadelError::Internal("bead store lock poisoned".to_string()))?;
        guard.insert(id.clone(), bead);
        Ok(id)
    }

    async fn show(&self, id: &BeadId) -> Result<Option<Bead>> {
        let guard = self
            .beads
            .lock()
            .map_err(|_| CitadelError::Internal("bead store lock poisoned".to_string()))?;
        Ok(guard.get(id).cloned())
    }

    async fn list(&self, status: Option<BeadStatus>) -> Result<Vec<Bead>> {
        let guard = self
            .beads
            .lock()
            .map_err(|_| CitadelError::Internal("bead store lock poisoned".to_string()))?;
        let mut beads: Vec<Bead> = guard
            .values()
            .filter(|b| status.map_or(true, |s| b.status == s))
            .cloned()
            .collect();
        beads.sort_by(|a, b| a.id.value().cmp(b.id.value()));
        Ok(beads)
    }

    async fn ready(&self) -> Result<Vec<Bead>> {
        let guard = self
            .beads
            .lock()
            .map_err(|_| CitadelError::Internal("bead store lock poisoned".to_string()))?;
        let mut beads: Vec<Bead> = guard
            .values()
            .filter(|b| {
                b.status == BeadStatus::Open
                    && b.blockers.iter().all(|blocker_id| {
                        guard
                            .get(blocker_id)
                            .is_some_and(|blocker| blocker.status == BeadStatus::Done)
                    })
            })
            .cloned()
            .collect();
        beads.sort_by(|a, b| a.id.value().cmp(b.id.value()));
        Ok(beads)
    }

    async fn update(&self, id: &BeadId, update: BeadUpdate) -> Result<()> {
        let mut guard = self
            .beads
            .lock()
            .map_err(|_| CitadelError::Internal("bead store lock poisoned".to_string()))?;
        let bead = guard
            .get_mut(id)
            .ok_or_else(|| CitadelError::NotFound(format!("bead {id} not found")))?;
        apply_update(bead, &update)
    }

    async fn dep_add(&self, child: &BeadId, parent: &BeadId) -> Result<()> {
        let mut guard = self
            .beads
            .lock()
            .map_err(|_| CitadelError::Internal("bead store lock poisoned".to_string()))?;
        if !guard.contains_key(parent) {
            return Err(CitadelError::NotFound(format!("bead {parent} not found")));
        }
        let bead = guard
            .get_mut(child)
            .ok_or_else(|| CitadelError::NotFound(format!("bead {child} not found")))?;
        if !bead.blockers.contains(parent) {
            bead.blockers.push(parent.clone());
        }
        Ok(())
    }
}

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Explicit, substitutable process-wide singleton container (spec §9
//! DESIGN NOTES: "Cyclic singletons -> explicit registry"). The source
//! threads the queue, bead client, formula registry, config, and piper
//! through process globals; this is the typed `get`/`set`/`clear`
//! container the spec asks for instead, grounded on the teacher's
//! `orchestrator_service::ports` hexagonal pattern (dependencies passed as
//! explicit, substitutable values) generalized into a small container so
//! tests can swap any slot without restarting the process.

use crate::bead_store::BeadStore;
use crate::config::Config;
use crate::formula::FormulaRegistry;
use crate::queue::WorkQueue;
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct Slots {
    queue: Option<Arc<WorkQueue>>,
    bead_store: Option<Arc<dyn BeadStore>>,
    formulas: Option<Arc<FormulaRegistry>>,
    config: Option<Arc<Config>>,
}

/// A keyed, clonable handle to process-wide singletons. Cloning a
/// `Registry` shares the same underlying slots (it wraps an `Arc`), so a
/// test can construct one `Registry`, populate it with fakes, and pass
/// clones to every component under test.
#[derive(Clone, Default)]
pub struct Registry {
    slots: Arc<RwLock<Slots>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Slots> {
        self.slots.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Slots> {
        self.slots.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn queue(&self) -> Option<Arc<WorkQueue>> {
        self.read().queue.clone()
    }

    pub fn set_queue(&self, queue: Arc<WorkQueue>) {
        self.write().queue = Some(queue);
    }

    #[must_use]
    pub fn bead_store(&self) -> Option<Arc<dyn BeadStore>> {
        self.read().bead_store.clone()
    }

    pub fn set_bead_store(&self, store: Arc<dyn BeadStore>) {
        self.write().bead_store = Some(store);
    }

    #[must_use]
    pub fn formulas(&self) -> Option<Arc<FormulaRegistry>> {
        self.read().formulas.clone()
    }

    pub fn set_formulas(&self, formulas: Arc<FormulaRegistry>) {
        self.write().formulas = Some(formulas);
    }

    #[must_use]
    pub fn config(&self) -> Option<Arc<Config>> {
        self.read().config.clone()
    }

    pub fn set_config(&self, config: Arc<Config>) {
        self.write().config = Some(config);
    }

    /// Clears every slot; used between tests sharing a static registry and
    /// by the CLI's `reset-queue` admin path for formula/config hot-reload.
    pub fn clear(&self) {
        let mut slots = self.write();
        slots.queue = None;
        slots.bead_store = None;
        slots.formulas = None;
        slots.config = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bead_store::InMemoryBeadStore;

    #[tokio::test]
    async fn slots_round_trip_and_clear() {
        let registry = Registry::new();
        assert!(registry.queue().is_none());

        let queue = Arc::new(WorkQueue::open_in_memory().await.expect("open"));
        registry.set_queue(queue.clone());
        assert!(registry.queue().is_some());

        let store: Arc<dyn BeadStore> = Arc::new(InMemoryBeadStore::new());
        registry.set_bead_store(store);
        assert!(registry.bead_store().is_some());

        registry.clear();
        assert!(registry.queue().is_none());
        assert!(registry.bead_store().is_none());
    }

    #[test]
    fn clone_shares_the_same_slots() {
        let registry = Registry::new();
        let clone = registry.clone();
        registry.set_config(Arc::new(Config::default()));
        assert!(clone.config().is_some());
    }
}

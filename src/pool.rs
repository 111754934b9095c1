#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Worker Pool & Hook Loop (spec §4.2). An elastic set of long-running
//! poll loops ("hooks") per role, each claiming tickets, driving a
//! role-parameterized handler, emitting heartbeats, and reporting
//! completion. Built on `tokio::task::spawn` (the teacher's heavy
//! `tokio` usage throughout `db/`/`orchestrator_service/`, generalized
//! into this pool/hook abstraction which the teacher itself has no
//! literal copy of — spec §9 explicitly invites a systems-language
//! rewrite to swap the polling ticker for a notification channel without
//! changing semantics, so this stays close to spec's explicit poll loop).

use crate::error::Result;
use crate::queue::WorkQueue;
use crate::types::{Role, Ticket};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// The role-parameterized handler a hook drives against each claimed
/// ticket (spec §4.6: worker/gatekeeper role handlers). A handler that
/// stores its own output is expected to have already called
/// `queue.complete(ticket.id, Some(output))` before returning `Ok(())`;
/// the hook's own `complete` call afterward is then a no-op CAS miss
/// (spec §4.2 step 4).
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ticket: &Ticket) -> Result<()>;
}

/// Pool configuration (spec §4.2, §6 `worker.*`/`gatekeeper.*`).
#[derive(Debug, Clone, Copy)]
pub struct PoolTuning {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for PoolTuning {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// An elastic set of hooks for one role. `resize` grows by spawning new
/// hooks and shrinks by lowering the live target: each hook checks the
/// target between claim attempts and exits itself once its ordinal falls
/// outside it — idle hooks (ones currently sleeping rather than mid
/// handler) are the ones that notice and exit first, approximating
/// "shrink idle hooks first, graceful if possible" without needing a
/// side channel into a running handler.
pub struct Pool<H: Handler + 'static> {
    role: Role,
    queue: Arc<WorkQueue>,
    handler: Arc<H>,
    tuning: PoolTuning,
    target: Arc<AtomicU32>,
    stopped: Arc<AtomicBool>,
    next_hook_ordinal: AtomicU64,
    hooks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<H: Handler + 'static> Pool<H> {
    #[must_use]
    pub fn new(role: Role, queue: Arc<WorkQueue>, handler: Arc<H>, tuning: PoolTuning) -> Self {
        Self {
            role,
            queue,
            handler,
            tuning,
            target: Arc::new(AtomicU32::new(0)),
            stopped: Arc::new(AtomicBool::new(false)),
            next_hook_ordinal: AtomicU64::new(0),
            hooks: std::sync::Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current live hook count (spec scenario 4: `pool.size`).
    #[must_use]
    pub fn size(&self) -> usize {
        self.hooks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Launches hooks up to the current target (spec §4.2 `start`).
    pub fn start(&self) {
        self.resize(self.target.load(Ordering::SeqCst) as usize);
    }

    /// Grows by spawning hooks up to `n`; shrinks by lowering the target
    /// so excess hooks self-terminate at their next idle check (spec §4.2
    /// `resize`).
    pub fn resize(&self, n: usize) {
        let n_u32 = u32::try_from(n).unwrap_or(u32::MAX);
        self.target.store(n_u32, Ordering::SeqCst);

        let mut hooks = self.hooks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        hooks.retain(|h| !h.is_finished());
        while hooks.len() < n {
            let ordinal = self.next_hook_ordinal.fetch_add(1, Ordering::SeqCst);
            hooks.push(self.spawn_hook(ordinal));
        }
        debug!(role = %self.role, target = n, live = hooks.len(), "pool resized");
    }

    /// Signals every hook to exit after its current cycle and joins them
    /// (spec §4.2 `stop`: cooperative cancel).
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.target.store(0, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = {
            let mut hooks = self.hooks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *hooks)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(role = %self.role, error = %e, "hook task panicked while stopping");
            }
        }
    }

    fn spawn_hook(&self, ordinal: u64) -> JoinHandle<()> {
        let role = self.role;
        let queue = Arc::clone(&self.queue);
        let handler = Arc::clone(&self.handler);
        let target = Arc::clone(&self.target);
        let stopped = Arc::clone(&self.stopped);
        let tuning = self.tuning;
        let hook_id = format!("{role}-hook-{ordinal}");

        tokio::spawn(async move {
            run_hook_loop(hook_id, ordinal, role, queue, handler, target, stopped, tuning).await;
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_hook_loop<H: Handler>(
    hook_id: String,
    ordinal: u64,
    role: Role,
    queue: Arc<WorkQueue>,
    handler: Arc<H>,
    target: Arc<AtomicU32>,
    stopped: Arc<AtomicBool>,
    tuning: PoolTuning,
) {
    let mut sleep_interval = tuning.poll_interval;
    loop {
        if stopped.load(Ordering::SeqCst) || u64::from(target.load(Ordering::SeqCst)) <= ordinal {
            debug!(%hook_id, "hook exiting (shrunk or stopped)");
            return;
        }

        let ticket = match queue.claim(&hook_id, role).await {
            Ok(t) => t,
            Err(e) => {
                error!(%hook_id, error = %e, "claim failed, backing off");
                tokio::time::sleep(tuning.poll_interval).await;
                continue;
            }
        };

        let Some(ticket) = ticket else {
            sleep_interval = tuning.poll_interval;
            tokio::time::sleep(sleep_interval).await;
            continue;
        };

        // Adaptive poll_interval: zero delay after a productive claim, so
        // a hot queue drains back-to-back (spec §4.2).
        sleep_interval = Duration::ZERO;

        let heartbeat_queue = Arc::clone(&queue);
        let ticket_id = ticket.id;
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tuning.heartbeat_interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                if let Err(e) = heartbeat_queue.heartbeat(ticket_id).await {
                    warn!(%ticket_id, error = %e, "heartbeat failed");
                }
            }
        });

        let outcome = handler.handle(&ticket).await;
        heartbeat_task.abort();
        let _ = heartbeat_task.await;

        match outcome {
            Ok(()) => {
                if let Err(e) = queue.complete(ticket.id, None).await {
                    debug!(ticket_id = %ticket.id, error = %e, "post-handler complete was a no-op");
                }
            }
            Err(e) => {
                error!(%hook_id, ticket_id = %ticket.id, error = %e, "handler failed, requeueing");
                if let Err(fail_err) = queue.fail(ticket.id, false).await {
                    error!(ticket_id = %ticket.id, error = %fail_err, "failed to requeue ticket after handler error");
                }
            }
        }
    }
}

/// Resize/size surface used by the conductor's autoscale step (spec §4.3
/// step 5), object-safe so the conductor can hold worker and gatekeeper
/// pools as `Arc<dyn Scalable>` without being generic over either
/// [`Handler`] implementation.
pub trait Scalable: Send + Sync {
    fn resize(&self, n: usize);
    fn size(&self) -> usize;
}

impl<H: Handler + 'static> Scalable for Pool<H> {
    fn resize(&self, n: usize) {
        Self::resize(self, n);
    }

    fn size(&self) -> usize {
        Self::size(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BeadId, Priority};
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _ticket: &Ticket) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl Handler for FailingHandler {
        async fn handle(&self, _ticket: &Ticket) -> Result<()> {
            Err(crate::error::CitadelError::Internal("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn hook_claims_and_completes_a_ticket() {
        let queue = Arc::new(WorkQueue::open_in_memory().await.expect("open"));
        let bead = BeadId::new("b-1");
        queue.enqueue(&bead, Priority(1), Role::Worker).await.expect("enqueue");

        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(CountingHandler { calls: calls.clone() });
        let pool = Pool::new(Role::Worker, queue.clone(), handler, PoolTuning {
            poll_interval: Duration::from_millis(5),
            heartbeat_interval: Duration::from_secs(10),
        });
        pool.resize(1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(queue.get_active_ticket(&bead).await.expect("get_active_ticket").is_none());
    }

    #[tokio::test]
    async fn handler_failure_requeues_with_retry_count_incremented() {
        let queue = Arc::new(WorkQueue::open_in_memory().await.expect("open"));
        let bead = BeadId::new("b-1");
        queue.enqueue(&bead, Priority(1), Role::Worker).await.expect("enqueue");

        let handler = Arc::new(FailingHandler);
        let pool = Pool::new(Role::Worker, queue.clone(), handler, PoolTuning {
            poll_interval: Duration::from_millis(5),
            heartbeat_interval: Duration::from_secs(10),
        });
        pool.resize(1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        pool.stop().await;

        let active = queue.get_active_ticket(&bead).await.expect("get_active_ticket");
        assert!(active.expect("still active").retry_count >= 1);
    }

    #[tokio::test]
    async fn resize_down_shrinks_pool_size() {
        let queue = Arc::new(WorkQueue::open_in_memory().await.expect("open"));
        let handler = Arc::new(CountingHandler { calls: Arc::new(AtomicUsize::new(0)) });
        let pool = Pool::new(Role::Worker, queue, handler, PoolTuning {
            poll_interval: Duration::from_millis(5),
            heartbeat_interval: Duration::from_secs(10),
        });
        pool.resize(4);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.size(), 4);

        pool.resize(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.resize(1); // prune finished handles
        assert!(pool.size() <= 1);
        pool.stop().await;
    }
}

//! End-to-end scenarios for the conductor cycle, wired the way a real
//! deployment would be: an [`InMemoryBeadStore`] standing in for the
//! subprocess-driven issue tracker, an in-memory queue, and the tool
//! contracts standing in for what an agent would actually call. No
//! background hooks are spawned here; claiming, completing, and tool calls
//! are driven directly so each scenario is deterministic.

use citadel::bead_store::{BeadUpdate, CreateBeadParams, InMemoryBeadStore};
use citadel::conductor::{Conductor, DefaultRouter};
use citadel::config::{ConductorConfig, PoolConfig};
use citadel::contracts::{self, ToolCall, ToolOutcome};
use citadel::pool::Scalable;
use citadel::queue::WorkQueue;
use citadel::types::{labels, BeadId, BeadStatus, Priority, Role};
use citadel::{BeadStore, FormulaRegistry};
use std::sync::Arc;

/// Records `resize` calls without spawning real hooks. Scenarios below drive
/// claim/complete by hand, so a real [`citadel::pool::Pool`] autoscaled to
/// `min_workers >= 1` would race those manual calls with its own background
/// claim loop; this mock keeps each scenario deterministic.
#[derive(Default)]
struct CountingScalable(std::sync::atomic::AtomicUsize);

impl Scalable for CountingScalable {
    fn resize(&self, n: usize) {
        self.0.store(n, std::sync::atomic::Ordering::SeqCst);
    }
    fn size(&self) -> usize {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

fn idle_pools() -> (Arc<dyn Scalable>, Arc<dyn Scalable>) {
    (Arc::new(CountingScalable::default()), Arc::new(CountingScalable::default()))
}

async fn harness() -> (Arc<dyn BeadStore>, Arc<WorkQueue>) {
    (
        Arc::new(InMemoryBeadStore::new()),
        Arc::new(WorkQueue::open_in_memory().await.expect("open queue")),
    )
}

/// A zero-floor `PoolConfig` so the conductor's own autoscale step never
/// asks for a pool to be non-empty, independent of the `CountingScalable`
/// mock above being inert anyway.
fn zero_floor_pool_config() -> PoolConfig {
    PoolConfig { min_workers: 0, max_workers: 4, ..PoolConfig::default() }
}

fn conductor(
    store: Arc<dyn BeadStore>,
    queue: Arc<WorkQueue>,
    worker_pool: Arc<dyn Scalable>,
    gatekeeper_pool: Arc<dyn Scalable>,
) -> Conductor<DefaultRouter> {
    Conductor::new(
        store,
        queue,
        DefaultRouter,
        worker_pool,
        gatekeeper_pool,
        ConductorConfig::default(),
        zero_floor_pool_config(),
        zero_floor_pool_config(),
    )
}

/// Scenario 1 (spec §8): a freshly created bead travels open -> in_progress
/// -> verify -> done, driven entirely by conductor ticks plus the same
/// tool calls a worker/gatekeeper agent would issue.
#[tokio::test]
async fn happy_path_open_to_done() {
    let (store, queue) = harness().await;
    let (worker_pool, gatekeeper_pool) = idle_pools();
    let formulas = FormulaRegistry::new();

    let bead_id = store
        .create(CreateBeadParams { title: "ship it".to_string(), ..CreateBeadParams::default() })
        .await
        .expect("create");

    let c = conductor(Arc::clone(&store), Arc::clone(&queue), worker_pool, gatekeeper_pool);
    let outcome = c.tick().await.expect("tick routes open bead to worker");
    assert_eq!(outcome.open_routed, 1);

    let ticket = queue.claim("worker-hook-1", Role::Worker).await.expect("claim").expect("ticket present");
    store.update(&bead_id, BeadUpdate::status(BeadStatus::InProgress)).await.expect("mark in_progress");

    let submitted = contracts::execute(
        store.as_ref(),
        &queue,
        &formulas,
        ToolCall::SubmitWork { bead_id: bead_id.clone(), summary: "done".to_string(), output: None },
    )
    .await;
    assert_eq!(submitted, ToolOutcome::SubmitWork { status: "verify".to_string(), message: None });
    assert!(queue.get_active_ticket(&bead_id).await.expect("active").is_none());
    drop(ticket);

    let outcome = c.tick().await.expect("tick routes verify bead to gatekeeper");
    assert_eq!(outcome.verify_routed, 1);
    let gk_ticket = queue.claim("gatekeeper-hook-1", Role::Gatekeeper).await.expect("claim").expect("ticket present");
    assert_eq!(gk_ticket.bead_id, bead_id);

    let approved = contracts::execute(
        store.as_ref(),
        &queue,
        &formulas,
        ToolCall::ApproveWork {
            bead_id: bead_id.clone(),
            acceptance_test: vec!["ran the suite".to_string()],
            comment: None,
        },
    )
    .await;
    assert_eq!(approved, ToolOutcome::Ack);

    let bead = store.show(&bead_id).await.expect("show").expect("exists");
    assert_eq!(bead.status, BeadStatus::Done);
}

/// Orphan reconcile (spec §4.3 step 2, second half): a bead stuck
/// `in_progress` with no active ticket and no recent completion is
/// reconciled back to `open` by the janitor; a bead within its grace window
/// is left alone. Distinct from the literal "Zombie reconciliation" seed
/// case below, which concerns a ticket left `processing` after its bead has
/// already moved on, not a bead left behind by its ticket.
#[tokio::test]
async fn zombie_bead_is_reconciled_after_grace_period_but_not_before() {
    let (store, queue) = harness().await;
    let (worker_pool, gatekeeper_pool) = idle_pools();

    let zombie = store
        .create(CreateBeadParams { title: "orphaned".to_string(), ..CreateBeadParams::default() })
        .await
        .expect("create");
    store.update(&zombie, BeadUpdate::status(BeadStatus::InProgress)).await.expect("to in_progress");

    let recent = store
        .create(CreateBeadParams { title: "recently finished".to_string(), ..CreateBeadParams::default() })
        .await
        .expect("create");
    store.update(&recent, BeadUpdate::status(BeadStatus::InProgress)).await.expect("to in_progress");
    queue.enqueue(&recent, Priority::default(), Role::Worker).await.expect("enqueue");
    let ticket = queue.claim("hook-1", Role::Worker).await.expect("claim").expect("ticket");
    queue.complete(ticket.id, Some(serde_json::json!({"ok": true}))).await.expect("complete");

    let mut config = ConductorConfig::default();
    config.grace_ms = 60_000;
    let c = Conductor::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        DefaultRouter,
        worker_pool,
        gatekeeper_pool,
        config,
        PoolConfig::default(),
        PoolConfig::default(),
    );

    let outcome = c.tick().await.expect("tick");
    assert_eq!(outcome.orphans_reconciled, 1);

    let zombie_bead = store.show(&zombie).await.expect("show").expect("exists");
    assert_eq!(zombie_bead.status, BeadStatus::Open, "zombie with no recent completion goes back to open");

    let recent_bead = store.show(&recent).await.expect("show").expect("exists");
    assert_eq!(recent_bead.status, BeadStatus::InProgress, "bead within grace window is left alone");
}

/// Scenario 2 (spec §8), "Zombie reconciliation": a ticket claimed for a
/// bead's worker stage is left `processing` while the bead itself advances
/// to `verify` behind it (e.g. the worker crashed after `submitWork` but
/// before its hook released the ticket). The janitor's stall release
/// requeues the stuck ticket, but requeuing it as a `worker` ticket would
/// leave it permanently blocking `verify` routing since the bead no longer
/// wants worker attention; the conductor must instead recognize the ticket's
/// role no longer matches the bead and clear it, so a fresh `gatekeeper`
/// ticket can be routed.
#[tokio::test]
async fn stale_processing_ticket_is_reconciled_into_a_fresh_gatekeeper_ticket() {
    let (store, queue) = harness().await;
    let (worker_pool, gatekeeper_pool) = idle_pools();

    let bead_id = store
        .create(CreateBeadParams { title: "zombie ticket".to_string(), ..CreateBeadParams::default() })
        .await
        .expect("create");
    store.update(&bead_id, BeadUpdate::status(BeadStatus::InProgress)).await.expect("to in_progress");

    queue.enqueue(&bead_id, Priority::default(), Role::Worker).await.expect("enqueue");
    let stuck_ticket = queue.claim("worker-hook-1", Role::Worker).await.expect("claim").expect("ticket");

    // Bead advances to verify while its worker ticket is still processing,
    // the way a crash between submitWork and the hook's own bookkeeping
    // would leave things.
    store.update(&bead_id, BeadUpdate::status(BeadStatus::Verify)).await.expect("to verify");

    // Let a sliver of real time pass so a zero-timeout stall check sees the
    // ticket's heartbeat as strictly in the past.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let mut config = ConductorConfig::default();
    config.stall_timeout_ms = 0;
    let c = Conductor::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        DefaultRouter,
        worker_pool,
        gatekeeper_pool,
        config,
        PoolConfig::default(),
        PoolConfig::default(),
    );

    c.tick().await.expect("tick 1");
    c.tick().await.expect("tick 2");

    let active = queue
        .get_active_ticket(&bead_id)
        .await
        .expect("get_active_ticket")
        .expect("a fresh ticket exists for the bead");
    assert_eq!(active.target_role, Role::Gatekeeper, "the stuck worker ticket did not survive reconciliation");
    assert_ne!(active.id, stuck_ticket.id, "a new ticket was routed, not the stale one");
}

/// Scenario 3 (spec §8): re-submitting work for a bead already in `verify`
/// is a no-op that reports the current status rather than erroring.
#[tokio::test]
async fn submit_work_is_idempotent_across_repeated_calls() {
    let (store, queue) = harness().await;
    let formulas = FormulaRegistry::new();

    let bead_id = store
        .create(CreateBeadParams { title: "t".to_string(), ..CreateBeadParams::default() })
        .await
        .expect("create");
    store.update(&bead_id, BeadUpdate::status(BeadStatus::InProgress)).await.expect("step1");
    queue.enqueue(&bead_id, Priority::default(), Role::Worker).await.expect("enqueue");
    queue.claim("hook-1", Role::Worker).await.expect("claim").expect("ticket");

    let first = contracts::execute(
        store.as_ref(),
        &queue,
        &formulas,
        ToolCall::SubmitWork { bead_id: bead_id.clone(), summary: "first".to_string(), output: None },
    )
    .await;
    assert_eq!(first, ToolOutcome::SubmitWork { status: "verify".to_string(), message: None });

    let second = contracts::execute(
        store.as_ref(),
        &queue,
        &formulas,
        ToolCall::SubmitWork { bead_id: bead_id.clone(), summary: "second".to_string(), output: None },
    )
    .await;
    assert_eq!(
        second,
        ToolOutcome::SubmitWork { status: "verify".to_string(), message: Some("already submitted".to_string()) }
    );

    let bead = store.show(&bead_id).await.expect("show").expect("exists");
    assert_eq!(bead.status, BeadStatus::Verify, "second submission did not move the bead further");
}

/// Scenario 4 (spec §8): the worker pool scales up to cover pending load
/// and back down once the queue drains, staying within configured bounds.
#[tokio::test]
async fn pool_scales_with_queue_depth_and_back_down() {
    let (store, queue) = harness().await;
    let worker_pool: Arc<CountingScalable> = Arc::new(CountingScalable::default());
    let gatekeeper_pool: Arc<dyn Scalable> = Arc::new(CountingScalable::default());
    let worker_config = PoolConfig { min_workers: 1, max_workers: 3, load_factor: 1.0, ..PoolConfig::default() };

    for i in 0..5 {
        let bead_id = BeadId::new(format!("load-{i}"));
        queue.enqueue(&bead_id, Priority::default(), Role::Worker).await.expect("enqueue");
    }

    let c = Conductor::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        DefaultRouter,
        Arc::clone(&worker_pool) as Arc<dyn Scalable>,
        gatekeeper_pool,
        ConductorConfig::default(),
        worker_config.clone(),
        PoolConfig::default(),
    );
    c.tick().await.expect("tick scales up");
    assert_eq!(worker_pool.size(), 3, "clamped to max_workers even though 5 are pending");

    for _ in 0..5 {
        let ticket = queue.claim("drain-hook", Role::Worker).await.expect("claim").expect("ticket");
        queue.complete(ticket.id, Some(serde_json::json!({}))).await.expect("complete");
    }
    c.tick().await.expect("tick scales down");
    assert_eq!(worker_pool.size(), 1, "drops back to min_workers once the queue is empty");
}

/// Scenario 5 (spec §8): a failed step's `on_failure` recovery bead is
/// routed for real work while its blocker carries the `failed` label, and
/// becomes moot (auto-completed, never routed) once the underlying step is
/// redone successfully.
#[tokio::test]
async fn failed_step_routes_its_recovery_bead_until_superseded() {
    let (store, queue) = harness().await;
    let (worker_pool, gatekeeper_pool) = idle_pools();

    let step = store
        .create(CreateBeadParams { title: "flaky step".to_string(), ..CreateBeadParams::default() })
        .await
        .expect("create");
    store.update(&step, BeadUpdate::status(BeadStatus::InProgress)).await.expect("step1");
    store.update(&step, BeadUpdate::status(BeadStatus::Verify)).await.expect("step2");
    store
        .update(&step, BeadUpdate::status(BeadStatus::Done).with_label(labels::FAILED))
        .await
        .expect("fail_work-equivalent");

    let recovery = store
        .create(CreateBeadParams { title: "recover flaky step".to_string(), ..CreateBeadParams::default() })
        .await
        .expect("create");
    store.dep_add(&recovery, &step).await.expect("dep_add");
    store
        .update(
            &recovery,
            BeadUpdate { add_labels: vec![labels::RECOVERY.to_string()], ..BeadUpdate::default() },
        )
        .await
        .expect("label recovery");

    let c = conductor(Arc::clone(&store), Arc::clone(&queue), Arc::clone(&worker_pool), Arc::clone(&gatekeeper_pool));
    let outcome = c.tick().await.expect("tick");
    assert_eq!(outcome.recoveries_resolved, 0, "blocker carries failed, recovery is not moot");
    assert_eq!(outcome.open_routed, 1, "recovery bead is routed for real work");
    assert!(queue.get_active_ticket(&recovery).await.expect("active").is_some());

    let ticket = queue.claim("recovery-hook", Role::Worker).await.expect("claim").expect("ticket");
    queue.complete(ticket.id, Some(serde_json::json!({"fixed": true}))).await.expect("complete");
    store.update(&recovery, BeadUpdate::status(BeadStatus::Verify)).await.expect("to verify");
    store
        .update(&recovery, BeadUpdate::status(BeadStatus::Done).with_acceptance_test("fixed and verified"))
        .await
        .expect("to done");

    let redone_step = store
        .create(CreateBeadParams { title: "flaky step, take two".to_string(), ..CreateBeadParams::default() })
        .await
        .expect("create");
    store.update(&redone_step, BeadUpdate::status(BeadStatus::InProgress)).await.expect("step1");
    store.update(&redone_step, BeadUpdate::status(BeadStatus::Verify)).await.expect("step2");
    store
        .update(&redone_step, BeadUpdate::status(BeadStatus::Done).with_acceptance_test("ok this time"))
        .await
        .expect("step3");

    let later_recovery = store
        .create(CreateBeadParams { title: "recover flaky step again".to_string(), ..CreateBeadParams::default() })
        .await
        .expect("create");
    store.dep_add(&later_recovery, &redone_step).await.expect("dep_add");
    store
        .update(
            &later_recovery,
            BeadUpdate { add_labels: vec![labels::RECOVERY.to_string()], ..BeadUpdate::default() },
        )
        .await
        .expect("label recovery");

    let outcome = c.tick().await.expect("tick");
    assert_eq!(outcome.recoveries_resolved, 1, "blocker now done and unfailed, recovery bead is moot");
    let later = store.show(&later_recovery).await.expect("show").expect("exists");
    assert_eq!(later.status, BeadStatus::Done);
}

/// Scenario 6 (spec §8): a consumer bead's piped context resolves once its
/// upstream `step:` blocker has completed output, and the conductor does
/// not route the consumer while the placeholder is still unresolved.
#[tokio::test]
async fn piped_context_resolves_before_the_consumer_is_routed() {
    let (store, queue) = harness().await;
    let (worker_pool, gatekeeper_pool) = idle_pools();

    let producer = store
        .create(CreateBeadParams { title: "produce a number".to_string(), ..CreateBeadParams::default() })
        .await
        .expect("create");
    store
        .update(
            &producer,
            BeadUpdate { add_labels: vec![labels::step("producer")], ..BeadUpdate::default() },
        )
        .await
        .expect("label step");

    let consumer = store
        .create(CreateBeadParams { title: "consume the number".to_string(), ..CreateBeadParams::default() })
        .await
        .expect("create");
    store.dep_add(&consumer, &producer).await.expect("dep_add");
    store
        .update(
            &consumer,
            BeadUpdate {
                context: Some(serde_json::json!({ "value": "{{steps.producer.output.magic_number}}" })),
                ..BeadUpdate::default()
            },
        )
        .await
        .expect("set piped context");

    let c = conductor(Arc::clone(&store), Arc::clone(&queue), Arc::clone(&worker_pool), Arc::clone(&gatekeeper_pool));

    // Producer still open, no output yet: consumer's context stays
    // unresolved and it is skipped rather than routed.
    let outcome = c.tick().await.expect("tick");
    assert_eq!(outcome.open_skipped_unresolved, 1);
    assert!(queue.get_active_ticket(&consumer).await.expect("active").is_none());

    // Drain the producer's ticket the conductor just created and complete
    // it with the value the consumer is waiting on.
    let producer_ticket = queue.claim("producer-hook", Role::Worker).await.expect("claim").expect("ticket");
    queue
        .complete(producer_ticket.id, Some(serde_json::json!({"magic_number": 42})))
        .await
        .expect("complete producer");
    store.update(&producer, BeadUpdate::status(BeadStatus::InProgress)).await.expect("to in_progress");
    store
        .update(&producer, BeadUpdate::status(BeadStatus::Verify))
        .await
        .expect("to verify");
    store
        .update(&producer, BeadUpdate::status(BeadStatus::Done).with_acceptance_test("produced"))
        .await
        .expect("to done");

    let outcome = c.tick().await.expect("tick");
    assert_eq!(outcome.open_routed, 1, "consumer now resolves and routes");

    let consumer_bead = store.show(&consumer).await.expect("show").expect("exists");
    assert_eq!(consumer_bead.context, serde_json::json!({ "value": 42 }));
}

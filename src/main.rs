#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Thin CLI surface (spec §6): `start`, `reset-queue [beadId]`,
//! `inspect <beadId>`. Unlike the teacher's `main.rs`, which speaks a
//! JSON-over-stdin protocol (`ProtocolEnvelope`, a `CliCommand` enum with
//! two dozen variants, `parse_cli_args`) to a long menu of swarm-admin
//! commands, this binary is deliberately the three-command surface
//! spec.md §6 actually names, parsed directly from `argv` rather than
//! relayed through a JSONL daemon loop. The `--key value` argument style
//! and the `parse_required_arg`/`parse_optional_arg` helper shape below are
//! carried over from the teacher; the protocol envelope machinery is not,
//! because nothing here calls back into an external protocol peer.

use citadel::bead_store::SubprocessBeadStore;
use citadel::conductor::{Conductor, DefaultRouter};
use citadel::config::{citadel_dir, load_config, Config};
use citadel::formula::FormulaRegistry;
use citadel::pool::{Handler, Pool, PoolTuning, Scalable};
use citadel::queue::WorkQueue;
use citadel::types::{BeadId, Role, Ticket};
use citadel::{BeadStore, CitadelError, Result};
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Stand-in for the externally-hosted agent runtime (spec §1: "Agents
/// themselves are external collaborators invoked via a model interface;
/// this specification does not cover them"). A real deployment replaces
/// this with an adapter that assembles a prompt, calls the model, and
/// dispatches the returned tool calls through [`citadel::contracts`]; this
/// placeholder only logs and fails the ticket so it requeues with backoff,
/// the same outcome the hook loop gives any handler that cannot make
/// progress yet.
struct UnwiredAgentHandler {
    role: Role,
}

#[async_trait::async_trait]
impl Handler for UnwiredAgentHandler {
    async fn handle(&self, ticket: &Ticket) -> Result<()> {
        warn!(
            role = %self.role,
            ticket_id = %ticket.id,
            bead_id = %ticket.bead_id.value(),
            "no agent runtime wired in; leaving ticket for an external collaborator"
        );
        Err(CitadelError::Adapter(
            "no agent runtime configured for this role".to_string(),
        ))
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().skip(1).collect();

    let exit_code = match run(&args).await {
        Ok(()) => 0,
        Err(err) => {
            error!("{err}");
            err.exit_code()
        }
    };
    std::process::exit(exit_code);
}

async fn run(args: &[String]) -> Result<()> {
    match args.first().map(String::as_str) {
        Some("start") => cmd_start().await,
        Some("reset-queue") => cmd_reset_queue(args.get(1)).await,
        Some("inspect") => {
            let bead_id = args.get(1).ok_or_else(|| {
                CitadelError::Validation("usage: citadel inspect <beadId>".to_string())
            })?;
            cmd_inspect(bead_id).await
        }
        Some(other) => Err(CitadelError::Validation(format!(
            "unknown command '{other}'; expected start, reset-queue, or inspect"
        ))),
        None => Err(CitadelError::Validation(
            "usage: citadel <start|reset-queue [beadId]|inspect <beadId>>".to_string(),
        )),
    }
}

async fn open_store_and_queue(config: &Config) -> Result<(Arc<dyn BeadStore>, Arc<WorkQueue>)> {
    let store: Arc<dyn BeadStore> = Arc::new(SubprocessBeadStore::new(
        config.beads.binary.clone(),
        config.beads.path.clone(),
    ));
    let queue = Arc::new(WorkQueue::open(&config.conductor.queue_path).await?);
    Ok((store, queue))
}

async fn cmd_start() -> Result<()> {
    let config = load_config(None).await?;
    let (store, queue) = open_store_and_queue(&config).await;
    let (store, queue) = (store?, queue?);

    let formulas_dir = citadel_dir(&env::current_dir()?).join("formulas");
    let formulas = if formulas_dir.exists() {
        FormulaRegistry::load_dir(&formulas_dir).await?
    } else {
        FormulaRegistry::new()
    };
    info!(formulas = formulas.names().len(), "loaded formula registry");

    let conductor_for_doctor = Conductor::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        DefaultRouter,
        Arc::new(noop_scalable()),
        Arc::new(noop_scalable()),
        config.conductor.clone(),
        config.worker.clone(),
        config.gatekeeper.clone(),
    );
    if !conductor_for_doctor.doctor().await? {
        return Err(CitadelError::Adapter(
            "bead store adapter failed its environment check".to_string(),
        ));
    }

    let worker_pool = Arc::new(Pool::new(
        Role::Worker,
        Arc::clone(&queue),
        Arc::new(UnwiredAgentHandler { role: Role::Worker }),
        PoolTuning::default(),
    ));
    let gatekeeper_pool = Arc::new(Pool::new(
        Role::Gatekeeper,
        Arc::clone(&queue),
        Arc::new(UnwiredAgentHandler {
            role: Role::Gatekeeper,
        }),
        PoolTuning::default(),
    ));
    worker_pool.resize(config.worker.min_workers as usize);
    gatekeeper_pool.resize(config.gatekeeper.min_workers as usize);

    let conductor = Conductor::new(
        store,
        Arc::clone(&queue),
        DefaultRouter,
        Arc::clone(&worker_pool) as Arc<dyn Scalable>,
        Arc::clone(&gatekeeper_pool) as Arc<dyn Scalable>,
        config.conductor.clone(),
        config.worker.clone(),
        config.gatekeeper.clone(),
    );

    info!("citadel started, entering tick loop");
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(
        config.conductor.tick_interval_ms,
    ));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = conductor.tick().await {
                    error!("conductor tick failed: {err}");
                }
            }
            sig = tokio::signal::ctrl_c() => {
                if let Err(err) = sig {
                    error!("failed to install SIGINT handler: {err}");
                }
                info!("SIGINT received, stopping conductor");
                break;
            }
        }
    }

    worker_pool.stop().await;
    gatekeeper_pool.stop().await;
    Ok(())
}

/// A placeholder `Scalable` used only while probing `doctor()` before the
/// real pools exist; it is never resized.
fn noop_scalable() -> impl Scalable {
    struct Noop;
    impl Scalable for Noop {
        fn resize(&self, _n: usize) {}
        fn size(&self) -> usize {
            0
        }
    }
    Noop
}

async fn cmd_reset_queue(bead_id: Option<&String>) -> Result<()> {
    let config = load_config(None).await?;
    let queue = WorkQueue::open(&config.conductor.queue_path).await?;
    let removed = match bead_id {
        Some(id) => queue.reset_bead(&BeadId::new(id.clone())).await?,
        None => queue.reset_all().await?,
    };
    println!("{{\"removedTickets\":{removed}}}");
    Ok(())
}

async fn cmd_inspect(bead_id: &str) -> Result<()> {
    let config = load_config(None).await?;
    let (store, queue) = open_store_and_queue(&config).await;
    let (store, queue) = (store?, queue?);
    let id = BeadId::new(bead_id.to_string());

    let bead = store
        .show(&id)
        .await?
        .ok_or_else(|| CitadelError::NotFound(format!("bead {bead_id} not found")))?;
    let active_ticket = queue.get_active_ticket(&id).await?;
    let last_output = queue.get_output(&id).await?;

    let report = serde_json::json!({
        "bead": bead,
        "activeTicket": active_ticket,
        "lastOutput": last_output,
    });
    println!("{}", serde_json::to_string_pretty(&report).map_err(CitadelError::from)?);
    Ok(())
}

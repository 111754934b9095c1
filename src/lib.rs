#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Citadel: a deterministic orchestration engine that drives autonomous
//! agents through a graph of work items ("beads") until each reaches a
//! terminal state. This crate is the control plane only — the work queue,
//! conductor cycle, worker pool, formula compiler, and bead state machine.
//! The agent runtime, TUI, and issue-tracker binary itself are external
//! collaborators reached through the trait boundaries in [`bead_store`]
//! and [`conductor::RouterPort`].

pub mod bead_store;
pub mod conductor;
pub mod config;
pub mod contracts;
pub mod error;
pub mod formula;
pub mod piper;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod state_machine;
pub mod types;

pub use bead_store::{BeadStore, BeadUpdate, CreateBeadParams, InMemoryBeadStore, SubprocessBeadStore};
pub use conductor::{Conductor, ConductorTickOutcome, DefaultRouter, RouterPort};
pub use config::{citadel_dir, load_config, Config};
pub use contracts::{execute as execute_tool, ToolCall, ToolOutcome};
pub use error::{CitadelError, Result};
pub use formula::{Formula, FormulaRegistry};
pub use pool::{Handler, Pool, PoolTuning, Scalable};
pub use queue::WorkQueue;
pub use registry::Registry;
pub use types::{Bead, BeadId, BeadStatus, Priority, Role, Ticket, TicketId, TicketStatus};

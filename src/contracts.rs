#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Agent-facing tool contracts (spec §6, §4.6). Per spec §9 DESIGN NOTES
//! ("Dynamic dispatch of tools -> closed tagged set"), every tool an agent
//! may invoke is one variant of [`ToolCall`], dispatched through a single
//! [`execute`] match so the compiler enforces exhaustiveness instead of an
//! open string-keyed map. Grounded on the teacher's `orchestrator_service`
//! request/response enums (typed commands in, typed outcomes out) rather
//! than passing raw JSON through untyped handlers.

use crate::bead_store::{BeadStore, BeadUpdate, CreateBeadParams};
use crate::error::CitadelError;
use crate::formula::FormulaRegistry;
use crate::queue::WorkQueue;
use crate::state_machine;
use crate::types::{labels, BeadId, BeadStatus, Priority, Role, TicketId};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// One of the tool calls exposed to externally-hosted agents (spec §6).
#[derive(Debug, Clone)]
pub enum ToolCall {
    EnqueueTask {
        bead_id: BeadId,
        priority: Priority,
        target_role: Role,
        reasoning: String,
    },
    InstantiateFormula {
        formula_name: String,
        variables: BTreeMap<String, String>,
        parent: Option<BeadId>,
    },
    SubmitWork {
        bead_id: BeadId,
        summary: String,
        output: Option<Value>,
    },
    ApproveWork {
        bead_id: BeadId,
        acceptance_test: Vec<String>,
        comment: Option<String>,
    },
    RejectWork {
        bead_id: BeadId,
        reason: String,
    },
    FailWork {
        bead_id: BeadId,
        reason: String,
    },
    DelegateTask {
        parent_bead_id: BeadId,
        title: String,
        priority: Option<Priority>,
        description: Option<String>,
        tags: Vec<String>,
    },
}

/// The outcome of a [`ToolCall`]. Errors are represented as the `Error`
/// variant rather than propagated, matching spec §7's "tool calls may
/// return a `{success:false, error}` shape ... so the agent can recover".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    EnqueueTask { success: bool, ticket_id: Option<TicketId> },
    InstantiateFormula { molecule_id: BeadId },
    SubmitWork { status: String, message: Option<String> },
    Ack,
    DelegateTask { bead_id: BeadId },
    Error { code: &'static str, message: String },
}

impl ToolOutcome {
    fn from_error(e: &CitadelError) -> Self {
        Self::Error {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

/// Dispatches one [`ToolCall`]. Never panics and never returns a `Result`:
/// any internal error is folded into [`ToolOutcome::Error`] so the calling
/// agent always gets a typed response back.
pub async fn execute(
    store: &dyn BeadStore,
    queue: &WorkQueue,
    formulas: &FormulaRegistry,
    call: ToolCall,
) -> ToolOutcome {
    let result = match call {
        ToolCall::EnqueueTask { bead_id, priority, target_role, reasoning } => {
            enqueue_task(store, queue, &bead_id, priority, target_role, &reasoning).await
        }
        ToolCall::InstantiateFormula { formula_name, variables, parent } => {
            instantiate_formula(store, formulas, &formula_name, variables, parent).await
        }
        ToolCall::SubmitWork { bead_id, summary, output } => {
            submit_work(store, queue, &bead_id, &summary, output).await
        }
        ToolCall::ApproveWork { bead_id, acceptance_test, comment } => {
            approve_work(store, &bead_id, acceptance_test, comment.as_deref()).await
        }
        ToolCall::RejectWork { bead_id, reason } => reject_work(store, &bead_id, &reason).await,
        ToolCall::FailWork { bead_id, reason } => fail_work(store, &bead_id, &reason).await,
        ToolCall::DelegateTask { parent_bead_id, title, priority, description, tags } => {
            delegate_task(store, &parent_bead_id, &title, priority, description, tags).await
        }
    };
    result.unwrap_or_else(|e| ToolOutcome::from_error(&e))
}

/// Exposed at `pub(crate)` visibility so the conductor's own routing step
/// (spec §4.3 step 3e/4) can reuse the at-most-one-active enforcement
/// without round-tripping through [`ToolCall`].
pub(crate) async fn enqueue_task(
    store: &dyn BeadStore,
    queue: &WorkQueue,
    bead_id: &BeadId,
    priority: Priority,
    target_role: Role,
    reasoning: &str,
) -> crate::error::Result<ToolOutcome> {
    if store.show(bead_id).await?.is_none() {
        return Err(CitadelError::NotFound(format!("bead {bead_id} does not exist")));
    }
    if queue.get_active_ticket(bead_id).await?.is_some() {
        info!(%bead_id, "enqueue_task: bead already has an active ticket");
        return Ok(ToolOutcome::EnqueueTask { success: false, ticket_id: None });
    }
    let ticket_id = queue.enqueue(bead_id, priority.clamp(), target_role).await?;
    info!(%bead_id, role = %target_role, %reasoning, "enqueued ticket");
    Ok(ToolOutcome::EnqueueTask { success: true, ticket_id: Some(ticket_id) })
}

async fn instantiate_formula(
    store: &dyn BeadStore,
    formulas: &FormulaRegistry,
    formula_name: &str,
    variables: BTreeMap<String, String>,
    parent: Option<BeadId>,
) -> crate::error::Result<ToolOutcome> {
    let formula = formulas.require(formula_name)?;
    let molecule_id = crate::formula::instantiate_formula(store, formula, variables, parent).await?;
    Ok(ToolOutcome::InstantiateFormula { molecule_id })
}

/// Spec §4.6: idempotent worker completion. The order (`queue.complete`
/// then `beads.update`) is mandatory so a crash between the two steps is
/// recoverable next time this is invoked.
async fn submit_work(
    store: &dyn BeadStore,
    queue: &WorkQueue,
    bead_id: &BeadId,
    summary: &str,
    output: Option<Value>,
) -> crate::error::Result<ToolOutcome> {
    let active = queue.get_active_ticket(bead_id).await?;

    let Some(ticket) = active else {
        let bead = store
            .show(bead_id)
            .await?
            .ok_or_else(|| CitadelError::NotFound(format!("bead {bead_id} does not exist")))?;

        if matches!(bead.status, BeadStatus::Verify | BeadStatus::Done) {
            return Ok(ToolOutcome::SubmitWork {
                status: bead.status.as_str().to_string(),
                message: Some("already submitted".to_string()),
            });
        }

        if bead.status == BeadStatus::InProgress && queue.get_output(bead_id).await?.is_some() {
            warn!(%bead_id, "submit_work: no active ticket but stored output exists, forcing verify");
            store
                .update(bead_id, BeadUpdate::status(BeadStatus::Verify))
                .await?;
            return Ok(ToolOutcome::SubmitWork {
                status: "verify".to_string(),
                message: Some("recovered from missing ticket".to_string()),
            });
        }

        return Err(CitadelError::Conflict(format!(
            "bead {bead_id} has no active ticket and nothing to reconcile"
        )));
    };

    let resolved_output = output.or_else(|| Some(serde_json::json!({ "summary": summary })));
    queue.complete(ticket.id, resolved_output).await?;
    store.update(bead_id, BeadUpdate::status(BeadStatus::Verify)).await?;
    Ok(ToolOutcome::SubmitWork { status: "verify".to_string(), message: None })
}

async fn approve_work(
    store: &dyn BeadStore,
    bead_id: &BeadId,
    acceptance_test: Vec<String>,
    comment: Option<&str>,
) -> crate::error::Result<ToolOutcome> {
    let joined = acceptance_test.join("; ");
    if let Some(comment) = comment {
        info!(%bead_id, %comment, "approve_work");
    }
    store
        .update(
            bead_id,
            BeadUpdate {
                status: Some(BeadStatus::Done),
                acceptance_test: Some(joined),
                ..BeadUpdate::default()
            },
        )
        .await?;
    Ok(ToolOutcome::Ack)
}

async fn reject_work(store: &dyn BeadStore, bead_id: &BeadId, reason: &str) -> crate::error::Result<ToolOutcome> {
    warn!(%bead_id, %reason, "reject_work");
    store
        .update(
            bead_id,
            BeadUpdate::status(BeadStatus::Open).with_label(labels::REJECTED),
        )
        .await?;
    Ok(ToolOutcome::Ack)
}

/// Bypasses the acceptance-test gate: `done` + `failed` is allowed by
/// [`state_machine::decide_transition`] without a non-empty acceptance_test.
async fn fail_work(store: &dyn BeadStore, bead_id: &BeadId, reason: &str) -> crate::error::Result<ToolOutcome> {
    warn!(%bead_id, %reason, "fail_work");
    store
        .update(
            bead_id,
            BeadUpdate::status(BeadStatus::Done).with_label(labels::FAILED),
        )
        .await?;
    Ok(ToolOutcome::Ack)
}

async fn delegate_task(
    store: &dyn BeadStore,
    parent_bead_id: &BeadId,
    title: &str,
    priority: Option<Priority>,
    description: Option<String>,
    tags: Vec<String>,
) -> crate::error::Result<ToolOutcome> {
    let bead_id = store
        .create(CreateBeadParams {
            title: title.to_string(),
            priority: priority.map(|p| p.clamp().0),
            parent: Some(parent_bead_id.clone()),
            bead_type: Some("task".to_string()),
            description,
        })
        .await?;
    if !tags.is_empty() {
        store
            .update(&bead_id, BeadUpdate { add_labels: tags, ..BeadUpdate::default() })
            .await?;
    }
    Ok(ToolOutcome::DelegateTask { bead_id })
}

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Pure bead transition-validation (spec §3 invariant 1, §4.6). Grounded on
//! the teacher's `ddd.rs::runtime_determine_transition_decision` shape: a
//! pure function from `(current, target)` to a decision, unit-tested without
//! any I/O and reused by every caller that mutates a bead's status.

use crate::error::{CitadelError, Result};
use crate::types::{labels, Bead, BeadStatus};

/// The outcome of asking whether a bead may move from one status to
/// another, without performing the move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionDecision {
    Allowed,
    RejectedByStateMachine,
    RejectedMissingAcceptanceTest,
}

impl TransitionDecision {
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Decides whether `bead` may move from its current status to `target`,
/// applying both the transition table (invariant 1) and the `done`
/// acceptance-test gate (invariant 2). Does not mutate `bead`.
#[must_use]
pub fn decide_transition(bead: &Bead, target: BeadStatus) -> TransitionDecision {
    if !bead.status.can_transition_to(target) {
        return TransitionDecision::RejectedByStateMachine;
    }
    if target == BeadStatus::Done && !bead.may_reach_done() {
        return TransitionDecision::RejectedMissingAcceptanceTest;
    }
    TransitionDecision::Allowed
}

/// Same as [`decide_transition`] but raised as a [`CitadelError::Validation`]
/// for callers that want to `?` straight through.
///
/// # Errors
/// Returns [`CitadelError::Validation`] if the transition is rejected.
pub fn validate_transition(bead: &Bead, target: BeadStatus) -> Result<()> {
    match decide_transition(bead, target) {
        TransitionDecision::Allowed => Ok(()),
        TransitionDecision::RejectedByStateMachine => Err(CitadelError::Validation(format!(
            "invalid transition {} -> {} for bead {}",
            bead.status, target, bead.id
        ))),
        TransitionDecision::RejectedMissingAcceptanceTest => Err(CitadelError::Validation(
            format!(
                "bead {} cannot reach done without acceptance_test or failed label",
                bead.id
            ),
        )),
    }
}

/// Spec §4.3 step 3c: a `recovery` bead whose blockers are all `done` and
/// none carry `failed` needs no work — the conductor marks it `done`
/// directly rather than routing it.
#[must_use]
pub fn recovery_bead_is_moot(bead: &Bead, blockers: &[Bead]) -> bool {
    bead.has_label(labels::RECOVERY)
        && blockers
            .iter()
            .all(|b| b.status == BeadStatus::Done && !b.has_label(labels::FAILED))
}

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Bead identifier, scoped to the backing issue tracker's own id space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BeadId(String);

impl BeadId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for BeadId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Ticket identifier (UUID per spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TicketId(Uuid);

impl TicketId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The bead's logical status (spec §3). `Verify` is a conductor/adapter-side
/// projection of the external `in_progress` status plus a `verify` label;
/// the projection lives entirely at the adapter boundary (spec §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeadStatus {
    Open,
    InProgress,
    Verify,
    Done,
}

impl BeadStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Verify => "verify",
            Self::Done => "done",
        }
    }

    /// Valid next statuses per spec §3 invariant 1.
    #[must_use]
    pub const fn allowed_targets(&self) -> &'static [Self] {
        match self {
            Self::Open => &[Self::InProgress, Self::Done],
            Self::InProgress => &[Self::Verify, Self::Open],
            Self::Verify => &[Self::Done, Self::InProgress, Self::Open],
            Self::Done => &[Self::InProgress, Self::Open],
        }
    }

    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        self.allowed_targets().contains(&target)
    }
}

impl fmt::Display for BeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for BeadStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "verify" => Ok(Self::Verify),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown bead status: {other}")),
        }
    }
}

/// Bead priority, lower value sorts first (0 is highest priority).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    pub const HIGHEST: Self = Self(0);
    pub const LOWEST: Self = Self(3);

    #[must_use]
    pub const fn clamp(self) -> Self {
        if self.0 > 3 {
            Self(3)
        } else {
            self
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(1)
    }
}

/// Well-known label tags (spec §3 invariant 4).
pub mod labels {
    pub const RECOVERY: &str = "recovery";
    pub const FAILED: &str = "failed";
    pub const REJECTED: &str = "rejected";

    #[must_use]
    pub fn formula(name: &str) -> String {
        format!("formula:{name}")
    }

    #[must_use]
    pub fn step(step_id: &str) -> String {
        format!("step:{step_id}")
    }

    #[must_use]
    pub fn recovers(bead_id: &str) -> String {
        format!("recovers:{bead_id}")
    }

    #[must_use]
    pub fn step_id_of(label: &str) -> Option<&str> {
        label.strip_prefix("step:")
    }

    #[must_use]
    pub fn recovers_of(label: &str) -> Option<&str> {
        label.strip_prefix("recovers:")
    }
}

/// A unit of work item in the external bead store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    pub id: BeadId,
    pub title: String,
    pub status: BeadStatus,
    pub priority: Priority,
    pub assignee: Option<String>,
    pub labels: Vec<String>,
    pub blockers: Vec<BeadId>,
    pub acceptance_test: Option<String>,
    pub parent: Option<BeadId>,
    pub bead_type: Option<String>,
    pub description: Option<String>,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bead {
    #[must_use]
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    #[must_use]
    pub fn step_id(&self) -> Option<&str> {
        self.labels.iter().find_map(|l| labels::step_id_of(l))
    }

    #[must_use]
    pub fn recovers(&self) -> Option<&str> {
        self.labels.iter().find_map(|l| labels::recovers_of(l))
    }

    /// Spec §3 invariant 5: a context value containing the literal
    /// substring `{{steps.` is considered unresolved.
    #[must_use]
    pub fn has_unresolved_context(&self) -> bool {
        fn walk(value: &serde_json::Value) -> bool {
            match value {
                serde_json::Value::String(s) => s.contains("{{steps."),
                serde_json::Value::Array(items) => items.iter().any(walk),
                serde_json::Value::Object(map) => map.values().any(walk),
                _ => false,
            }
        }
        walk(&self.context)
    }

    /// Spec §3 invariant 2: `done` requires a non-empty `acceptance_test`
    /// unless the bead carries the `failed` label.
    #[must_use]
    pub fn may_reach_done(&self) -> bool {
        self.acceptance_test
            .as_ref()
            .is_some_and(|t| !t.trim().is_empty())
            || self.has_label(labels::FAILED)
    }
}

/// Role a ticket is routed to (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Router,
    Worker,
    Supervisor,
    Gatekeeper,
}

impl Role {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Router => "router",
            Self::Worker => "worker",
            Self::Supervisor => "supervisor",
            Self::Gatekeeper => "gatekeeper",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "router" => Ok(Self::Router),
            "worker" => Ok(Self::Worker),
            "supervisor" => Ok(Self::Supervisor),
            "gatekeeper" => Ok(Self::Gatekeeper),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Ticket status (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TicketStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TicketStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown ticket status: {other}")),
        }
    }
}

/// An entry in the work queue representing one attempt to have a role
/// process a bead (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub bead_id: BeadId,
    pub status: TicketStatus,
    pub priority: Priority,
    pub target_role: Role,
    pub assignee_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub output: Option<serde_json::Value>,
    pub next_attempt_at: DateTime<Utc>,
}

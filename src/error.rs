#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use thiserror::Error;

/// Error code constants for type-safe error handling, surfaced to agents via
/// the tool contracts' `{success:false, error}` shape (spec §7).
pub mod code {
    pub const VALIDATION: &str = "VALIDATION";
    pub const NOTFOUND: &str = "NOTFOUND";
    pub const CONFLICT: &str = "CONFLICT";
    pub const STALL: &str = "STALL";
    pub const SPLIT_BRAIN: &str = "SPLIT_BRAIN";
    pub const PERMANENT_FAILURE: &str = "PERMANENT_FAILURE";
    pub const ADAPTER: &str = "ADAPTER";
    pub const DATABASE: &str = "DATABASE";
    pub const CONFIG: &str = "CONFIG";
    pub const INTERNAL: &str = "INTERNAL";
}

#[derive(Error, Debug)]
pub enum CitadelError {
    /// Bad formula, missing required variable, invalid state transition,
    /// missing `acceptance_test` on done, unknown bead id.
    #[error("validation error: {0}")]
    Validation(String),

    /// A CAS-guarded ticket/bead operation found the row was not in the
    /// state it required (e.g. `complete` on a non-`processing` ticket).
    #[error("conflicting state transition: {0}")]
    Conflict(String),

    /// A bead or ticket referenced by id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backing issue-tracker subprocess reported an error this adapter
    /// could not recover from after its bounded retries.
    #[error("bead store adapter error: {0}")]
    Adapter(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("formula error: {0}")]
    Formula(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CitadelError {
    /// Returns the protocol error code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::Formula(_) => code::VALIDATION,
            Self::Conflict(_) => code::CONFLICT,
            Self::NotFound(_) => code::NOTFOUND,
            Self::Adapter(_) => code::ADAPTER,
            Self::Database(_) | Self::Sqlx(_) => code::DATABASE,
            Self::Config(_) => code::CONFIG,
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => code::INTERNAL,
        }
    }

    /// Returns the process exit code for this error, used by the thin CLI
    /// surface (spec §6).
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) | Self::Formula(_) => 2,
            Self::Conflict(_) => 3,
            Self::NotFound(_) => 4,
            Self::Adapter(_) => 5,
            Self::Database(_) | Self::Sqlx(_) => 6,
            Self::Config(_) => 7,
            Self::Io(_) => 8,
            Self::Serialization(_) => 9,
            Self::Internal(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, CitadelError>;

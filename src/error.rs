//! Typed errors surfaced at the orchestrator boundary, one variant per error
//! kind from spec §7. Generalizes the teacher's flat `SyncError` enum
//! (`oplog::SyncError`) which wrapped exactly two lower-level error types
//! (`rusqlite::Error`, `serde_json::Error`) behind `#[from]`.

use crate::model::TransactionId;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("user input error: {0}")]
    UserInput(String),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("local store error: {0}")]
    Local(#[from] LocalStoreError),

    #[error("attempted mutation of immutable field on transaction {txn_id}: {field}")]
    ImmutableFieldConflict {
        txn_id: TransactionId,
        field: &'static str,
    },

    #[error("interrupted by user")]
    Interrupted,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ReconcileError {
    /// Maps to the exit codes declared in spec §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            ReconcileError::UserInput(_) | ReconcileError::Config(_) => 2,
            ReconcileError::Validation(_) => 2,
            ReconcileError::Remote(_) => 3,
            ReconcileError::Local(_) => 4,
            ReconcileError::ImmutableFieldConflict { .. } => 0,
            ReconcileError::Interrupted => 130,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("duplicate rule id {id} defined in: {}", files.join(", "))]
    DuplicateRuleId { id: i64, files: Vec<String> },

    #[error("failed to parse rule file: {0}")]
    RuleParse(String),

    #[error("category {0:?} could not be resolved")]
    UnresolvableCategory(String),

    #[error("invalid regex in precondition {field:?}: {source}")]
    InvalidRegex {
        field: &'static str,
        #[source]
        source: regex::Error,
    },

    #[error("invalid label token: {0}")]
    InvalidLabel(#[from] crate::model::InvalidLabel),

    #[error("invalid rule id: {0}")]
    InvalidRuleId(i64),
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("authentication failed")]
    Authentication,

    #[error("rate limit exhausted after {retries} retries")]
    RateLimitExhausted { retries: u32 },

    #[error("server error (status {status}) after retries")]
    ServerError { status: u16 },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum LocalStoreError {
    #[error("archive parse error: {0}")]
    Parse(String),

    #[error("unwritable destination: {0}")]
    Unwritable(String),

    #[error("missing sibling changelog for {0}")]
    MissingChangelog(String),

    #[error("archive already locked by another process: {0}")]
    Locked(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing destination: could not auto-detect an archive and none was given")]
    NoDestination,

    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),

    #[error("conflicting date-window flags: {0}")]
    ConflictingDateFlags(String),

    #[error("malformed date: {0}")]
    MalformedDate(String),
}

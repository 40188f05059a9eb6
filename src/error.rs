//! Error types for the flow engine.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Normalize error: {0}")]
    Normalize(#[from] NormalizeError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Flow builder and lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("Flow {id} not found")]
    NotFound { id: Uuid },

    #[error("Flow {id} has no version {version}")]
    VersionNotFound { id: Uuid, version: i64 },

    #[error("Flow {id} has never been published")]
    NotPublished { id: Uuid },

    #[error("Flow {id} is disabled")]
    Disabled { id: Uuid },

    #[error("Node {node_id} not found in draft of flow {flow_id}")]
    NodeNotFound { flow_id: Uuid, node_id: String },

    #[error("Node {node_id} already exists in draft of flow {flow_id}")]
    DuplicateNode { flow_id: Uuid, node_id: String },

    #[error("Edge #{sequence} not found in draft of flow {flow_id}")]
    EdgeNotFound { flow_id: Uuid, sequence: i64 },

    #[error("Conversation {conversation_id} already has an active session")]
    SessionConflict { conversation_id: String },
}

/// A single structural problem found while validating a draft graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphViolation {
    /// Node or edge the problem is attached to, if any.
    pub subject: Option<String>,
    pub message: String,
}

impl std::fmt::Display for GraphViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.subject {
            Some(subject) => write!(f, "{subject}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Publish-time validation failure. Carries every violation found, not just the first.
#[derive(Debug, thiserror::Error)]
#[error("graph rejected with {} violation(s): {}", violations.len(), join_violations(violations))]
pub struct ValidationError {
    pub violations: Vec<GraphViolation>,
}

fn join_violations(violations: &[GraphViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Runtime reference to a node or edge that does not exist.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransitionError {
    #[error("node {node_id} is not part of flow {flow_id} v{version}")]
    MissingNode {
        flow_id: Uuid,
        version: i64,
        node_id: String,
    },

    #[error("node {node_id} has no outgoing edge for branch '{branch}'")]
    MissingBranch { node_id: String, branch: String },

    #[error("trigger node {node_id} has no outgoing edge")]
    DeadTrigger { node_id: String },

    #[error("exceeded {limit} steps while handling one event (cycle without a wait?)")]
    StepLimit { limit: usize },

    #[error("node {node_id} schedules {secs}s ahead, beyond the supported range")]
    DeadlineOutOfRange { node_id: String, secs: u64 },
}

/// Outbound send failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("Provider request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("Provider rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Provider rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("No transport credentials for {conversation_id}")]
    MissingCredentials { conversation_id: String },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

impl DispatchError {
    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed { .. } | Self::RateLimited { .. } => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::MissingCredentials { .. } | Self::InvalidResponse(_) => false,
        }
    }
}

/// Inbound webhook payload errors.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("Malformed webhook payload: {0}")]
    Malformed(String),

    #[error("Webhook signature missing or invalid")]
    BadSignature,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

//! Error taxonomy for the promotion engine.

use thiserror::Error;

use drydock_state::{LifecycleState, StorageError, VersionKey};

/// Everything that can go wrong while moving a version through its
/// lifecycle. Failures stay scoped to the version that caused them; nothing
/// here aborts work on other versions.
#[derive(Debug, Error)]
pub enum DrydockError {
    /// The requested edge does not exist in the lifecycle graph. Caller
    /// error; rejected before policy is consulted.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    /// Another writer moved the version first. The losing caller discards
    /// its intent; it must not blindly retry.
    #[error("stale transition on {key}: expected {expected}, found {actual}")]
    StaleTransition {
        key: VersionKey,
        expected: LifecycleState,
        actual: LifecycleState,
    },

    #[error("version not found: {key}")]
    VersionNotFound { key: VersionKey },

    #[error("duplicate version: {key} is already registered")]
    DuplicateVersion { key: VersionKey },

    /// Registration metadata does not satisfy the registered schema.
    #[error("metadata schema violation: {detail}")]
    SchemaInvalid { detail: String },

    /// The version failed validation and is terminally rejected.
    #[error("validation failed for {key}; version is rejected")]
    ValidationFailed { key: VersionKey },

    /// A rule set grants automatic promotion into active for a critical
    /// model. Refused at load time; the previous rule set stays in force.
    #[error("unsafe auto-approval rule '{rule}': {detail}")]
    UnsafeAutoApprovalRule { rule: String, detail: String },

    #[error("could not load policy: {detail}")]
    PolicyLoad { detail: String },

    #[error("approval request not found: {request_id}")]
    ApprovalNotFound { request_id: String },

    #[error("approval request already resolved: {request_id}")]
    ApprovalAlreadyResolved { request_id: String },

    /// The approval deadline passed before anyone decided.
    #[error("approval request expired: {request_id}")]
    ApprovalExpired { request_id: String },

    /// A deployment-plane command kept failing after bounded retries and the
    /// stall could not be escalated to an operator.
    #[error("deployment command failed: {command}: {detail}")]
    DeploymentCommandFailed { command: String, detail: String },

    #[error("could not load configuration: {detail}")]
    ConfigLoad { detail: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for DrydockError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DuplicateVersion { key } => DrydockError::DuplicateVersion { key },
            StorageError::VersionNotFound { key } => DrydockError::VersionNotFound { key },
            StorageError::InvalidTransition { from, to } => {
                DrydockError::InvalidTransition { from, to }
            }
            StorageError::StaleTransition {
                key,
                expected,
                actual,
            } => DrydockError::StaleTransition {
                key,
                expected,
                actual,
            },
            StorageError::ApprovalNotFound { request_id } => {
                DrydockError::ApprovalNotFound { request_id }
            }
            StorageError::ApprovalAlreadyResolved { request_id } => {
                DrydockError::ApprovalAlreadyResolved { request_id }
            }
            other => DrydockError::Storage(other.to_string()),
        }
    }
}

pub type DrydockResult<T> = std::result::Result<T, DrydockError>;

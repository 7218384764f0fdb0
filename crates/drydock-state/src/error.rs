//! Error types for the storage contract and its SurrealDB plumbing.

use thiserror::Error;

use crate::store::{LifecycleState, VersionKey};

/// Errors surfaced by the storage contract: registry, approvals, audit,
/// and artifact stores. These are part of the trait interface and carry the
/// structure callers branch on.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duplicate version: {key} is already registered")]
    DuplicateVersion { key: VersionKey },

    #[error("version not found: {key}")]
    VersionNotFound { key: VersionKey },

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("stale transition on {key}: expected {expected}, found {actual}")]
    StaleTransition {
        key: VersionKey,
        expected: LifecycleState,
        actual: LifecycleState,
    },

    #[error("approval request not found: {request_id}")]
    ApprovalNotFound { request_id: String },

    #[error("approval request already resolved: {request_id}")]
    ApprovalAlreadyResolved { request_id: String },

    #[error("artifact not found: {uri}")]
    ArtifactNotFound { uri: String },

    #[error("invalid artifact digest: {digest}")]
    InvalidDigest { digest: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors from the database layer itself: connections, schema setup, and
/// query execution. Contract methods fold these into
/// [`StorageError::Backend`]; only setup paths return them directly.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("database connection failed: {0}")]
    Connection(String),

    #[error("schema setup failed: {0}")]
    Schema(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StateError>;

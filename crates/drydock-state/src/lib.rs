//! # drydock-state
//!
//! Durable state for Drydock: the model version registry, approval queue,
//! audit ledger, and artifact object stores.
//!
//! The registry is the only writer of lifecycle state. Its contract
//! ([`VersionStore`]) exposes compare-and-set transitions and an atomic
//! activation swap so that concurrent promotion attempts resolve to exactly
//! one winner and a model never has two active versions.
//!
//! Backends:
//! - [`fakes`]: in-memory implementations for tests
//! - [`surreal`]: SurrealDB-backed production implementation
//! - [`fs_objects`]: filesystem artifact storage

pub mod error;
pub mod fakes;
pub mod fs_objects;
pub mod schema;
pub mod store;
pub mod surreal;

pub use error::{Result, StateError, StorageError};
pub use fs_objects::FsObjectStore;
pub use store::{
    ApprovalId, ApprovalKind, ApprovalRecord, ApprovalStatus, ApprovalStore, ArtifactDigest,
    AuditEvent, AuditLog, AuditRecord, DeployCommand, HumanDecision, LifecycleState,
    ModelVersionRecord, ObjectStore, Requester, StorageResult, SwapOutcome, Transition,
    VersionKey, VersionStore,
};
pub use surreal::SurrealStore;

//! Storage contracts for the promotion pipeline.
//!
//! Everything durable lives behind the traits in this module: the version
//! registry (sole writer of lifecycle state), the approval queue, the
//! append-only audit ledger, and artifact object storage. [`crate::fakes`]
//! provides in-memory implementations for tests; [`crate::surreal`] the
//! SurrealDB-backed production implementation.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Digests
// ---------------------------------------------------------------------------

/// SHA-256 digest of a model artifact, lowercase hex.
///
/// The inner string is private; construct through [`ArtifactDigest::from_bytes`]
/// or the validating [`TryFrom<String>`] so every instance is well formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactDigest(String);

impl ArtifactDigest {
    /// Hash artifact bytes into a digest.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(data);
        ArtifactDigest(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines and CLI output.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl TryFrom<String> for ArtifactDigest {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let normalized = value.to_ascii_lowercase();
        if normalized.len() != 64 || !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: value });
        }
        Ok(ArtifactDigest(normalized))
    }
}

impl fmt::Display for ArtifactDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifies one immutable model version: model name plus version label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionKey {
    pub model_name: String,
    pub version: String,
}

impl VersionKey {
    pub fn new(model_name: impl Into<String>, version: impl Into<String>) -> Self {
        VersionKey {
            model_name: model_name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.model_name, self.version)
    }
}

/// Unique id of an approval request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalId(pub String);

impl ApprovalId {
    pub fn new() -> Self {
        ApprovalId(Uuid::new_v4().to_string())
    }
}

impl Default for ApprovalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Lifecycle states
// ---------------------------------------------------------------------------

/// Lifecycle of a model version from upload to retirement.
///
/// Legal edges:
///
/// ```text
/// uploaded -> validating -> validated -> canary -> promoting -> active -> retired
///                  |                        |           |
///                  v                        v           v
///              rejected               rolled_back  rolled_back
/// ```
///
/// `rejected`, `rolled_back` and `retired` are terminal. At most one version
/// per model is `active`; entering `active` retires the previous holder in
/// the same atomic step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uploaded,
    Validating,
    Validated,
    Canary,
    Promoting,
    Active,
    Rejected,
    RolledBack,
    Retired,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Uploaded => "uploaded",
            LifecycleState::Validating => "validating",
            LifecycleState::Validated => "validated",
            LifecycleState::Canary => "canary",
            LifecycleState::Promoting => "promoting",
            LifecycleState::Active => "active",
            LifecycleState::Rejected => "rejected",
            LifecycleState::RolledBack => "rolled_back",
            LifecycleState::Retired => "retired",
        }
    }

    /// Inverse of [`as_str`](Self::as_str), for values read back from storage.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(LifecycleState::Uploaded),
            "validating" => Some(LifecycleState::Validating),
            "validated" => Some(LifecycleState::Validated),
            "canary" => Some(LifecycleState::Canary),
            "promoting" => Some(LifecycleState::Promoting),
            "active" => Some(LifecycleState::Active),
            "rejected" => Some(LifecycleState::Rejected),
            "rolled_back" => Some(LifecycleState::RolledBack),
            "retired" => Some(LifecycleState::Retired),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal edge of the lifecycle graph.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Uploaded, Validating)
                | (Validating, Validated)
                | (Validating, Rejected)
                | (Validated, Canary)
                | (Canary, Promoting)
                | (Canary, RolledBack)
                | (Promoting, Active)
                | (Promoting, RolledBack)
                | (Active, Retired)
        )
    }

    /// Terminal states have no outgoing edges.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LifecycleState::Rejected | LifecycleState::RolledBack | LifecycleState::Retired
        )
    }

    /// States a restarted daemon has work to resume for. `active` is settled
    /// and terminal states are done; everything else is in flight.
    pub fn is_in_flight(self) -> bool {
        !self.is_terminal() && self != LifecycleState::Active
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Who asked for a transition. Policy rules match on the identity string
/// from [`Requester::id`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Requester {
    /// A named human operator.
    Operator { name: String },
    /// The canary health controller acting on a verdict.
    CanaryController,
    /// The validation gate committing a check outcome.
    ValidationGate,
    /// The background sweep that expires stale approvals.
    ExpirySweep,
}

impl Requester {
    pub fn operator(name: impl Into<String>) -> Self {
        Requester::Operator { name: name.into() }
    }

    /// Stable identity string, e.g. `operator:ines` or `canary-controller`.
    pub fn id(&self) -> String {
        match self {
            Requester::Operator { name } => format!("operator:{name}"),
            Requester::CanaryController => "canary-controller".to_string(),
            Requester::ValidationGate => "validation-gate".to_string(),
            Requester::ExpirySweep => "expiry-sweep".to_string(),
        }
    }
}

impl fmt::Display for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Recorded outcome of a human decision on a suspended transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanDecision {
    pub decided_by: String,
    pub approved: bool,
    pub decided_at: DateTime<Utc>,
    pub note: Option<String>,
}

/// A requested move of one version along the lifecycle graph. This is the
/// unit the policy engine judges and the approval queue suspends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub key: VersionKey,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub requester: Requester,
    pub requested_at: DateTime<Utc>,
    /// Present once a human ruled on the transition via the approval queue.
    pub decision: Option<HumanDecision>,
}

impl Transition {
    pub fn new(
        key: VersionKey,
        from: LifecycleState,
        to: LifecycleState,
        requester: Requester,
        requested_at: DateTime<Utc>,
    ) -> Self {
        Transition {
            key,
            from,
            to,
            requester,
            requested_at,
            decision: None,
        }
    }

    pub fn with_decision(mut self, decision: HumanDecision) -> Self {
        self.decision = Some(decision);
        self
    }
}

/// One registered model version and its current lifecycle state.
///
/// Artifact bytes live in an [`ObjectStore`]; the record carries the URI and
/// content digest so integrity can be re-checked at any point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersionRecord {
    pub key: VersionKey,
    pub artifact_uri: String,
    pub artifact_digest: ArtifactDigest,
    pub metadata: BTreeMap<String, String>,
    pub state: LifecycleState,
    pub created_at: DateTime<Utc>,
    pub state_updated_at: DateTime<Utc>,
}

impl ModelVersionRecord {
    /// A freshly registered version always starts in `uploaded`.
    pub fn new(
        key: VersionKey,
        artifact_uri: impl Into<String>,
        artifact_digest: ArtifactDigest,
        metadata: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        ModelVersionRecord {
            key,
            artifact_uri: artifact_uri.into(),
            artifact_digest,
            metadata,
            state: LifecycleState::Uploaded,
            created_at: now,
            state_updated_at: now,
        }
    }
}

/// A deployment-plane command, recorded so a stalled command can be
/// re-issued after human review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeployCommand {
    Deploy { key: VersionKey },
    ShiftTraffic { key: VersionKey, percent: u8 },
    Retire { key: VersionKey },
}

impl fmt::Display for DeployCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployCommand::Deploy { key } => write!(f, "deploy {key}"),
            DeployCommand::ShiftTraffic { key, percent } => {
                write!(f, "shift-traffic {key} {percent}%")
            }
            DeployCommand::Retire { key } => write!(f, "retire {key}"),
        }
    }
}

/// Why an approval request exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalKind {
    /// Policy answered RequireApproval for the transition.
    PolicyGate,
    /// A deployment command exhausted its retries; a human must intervene.
    DeploymentStalled { command: DeployCommand },
}

/// Where an approval request sits in its own small lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for a human decision.
    Open,
    Approved,
    Denied { reason: String },
    /// Deadline passed before anyone decided; treated as a deny.
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Open)
    }

    pub fn allows_proceed(&self) -> bool {
        matches!(self, ApprovalStatus::Approved)
    }
}

/// A suspended transition awaiting a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub request_id: ApprovalId,
    pub transition: Transition,
    pub kind: ApprovalKind,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: ApprovalStatus,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRecord {
    pub fn new(
        transition: Transition,
        kind: ApprovalKind,
        reason: impl Into<String>,
        timeout_secs: Option<u64>,
        now: DateTime<Utc>,
    ) -> Self {
        let expires_at = timeout_secs.map(|secs| now + chrono::Duration::seconds(secs as i64));
        ApprovalRecord {
            request_id: ApprovalId::new(),
            transition,
            kind,
            reason: reason.into(),
            created_at: now,
            expires_at,
            status: ApprovalStatus::Open,
            resolved_by: None,
            resolved_at: None,
        }
    }

    /// True once the deadline has passed, relative to `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// Everything the promotion machinery leaves a durable trace of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    TransitionCommitted {
        key: VersionKey,
        from: LifecycleState,
        to: LifecycleState,
        requester: Requester,
    },
    TransitionDenied {
        key: VersionKey,
        from: LifecycleState,
        to: LifecycleState,
        requester: Requester,
        reason: String,
    },
    ApprovalRequested {
        request_id: ApprovalId,
        key: VersionKey,
        from: LifecycleState,
        to: LifecycleState,
        reason: String,
    },
    ApprovalResolved {
        request_id: ApprovalId,
        key: VersionKey,
        approved: bool,
        resolved_by: String,
        note: Option<String>,
    },
    ApprovalExpired {
        request_id: ApprovalId,
        key: VersionKey,
    },
    RollbackTriggered {
        key: VersionKey,
        from: LifecycleState,
        requester: Requester,
        reason: String,
    },
    ValidationRejected {
        key: VersionKey,
        failed_checks: Vec<String>,
    },
    DeploymentStalled {
        key: VersionKey,
        command: DeployCommand,
        request_id: ApprovalId,
    },
    PolicyReloaded {
        rule_count: usize,
        reloaded_by: String,
    },
}

impl AuditEvent {
    /// The version this event concerns, if any.
    pub fn key(&self) -> Option<&VersionKey> {
        match self {
            AuditEvent::TransitionCommitted { key, .. }
            | AuditEvent::TransitionDenied { key, .. }
            | AuditEvent::ApprovalRequested { key, .. }
            | AuditEvent::ApprovalResolved { key, .. }
            | AuditEvent::ApprovalExpired { key, .. }
            | AuditEvent::RollbackTriggered { key, .. }
            | AuditEvent::ValidationRejected { key, .. }
            | AuditEvent::DeploymentStalled { key, .. } => Some(key),
            AuditEvent::PolicyReloaded { .. } => None,
        }
    }
}

/// One entry in the append-only audit ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id: String,
    pub recorded_at: DateTime<Utc>,
    pub event: AuditEvent,
}

impl AuditRecord {
    pub fn new(event: AuditEvent, at: DateTime<Utc>) -> Self {
        AuditRecord {
            audit_id: Uuid::new_v4().to_string(),
            recorded_at: at,
            event,
        }
    }
}

/// Result of the activation swap: the newly active version plus whichever
/// previously active version was retired in the same atomic step.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapOutcome {
    pub activated: ModelVersionRecord,
    pub retired: Option<VersionKey>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Registry of model versions and sole writer of lifecycle state.
///
/// Guarantees:
/// - `register` is first-write-wins per key; duplicates are rejected.
/// - `compare_and_set_state` commits the whole transition or leaves the
///   record untouched; a concurrent writer surfaces as `StaleTransition`
///   and the loser must not retry blindly.
/// - `activate` retires the previously active version and activates the new
///   one as a single atomic unit; readers never observe zero or two active
///   versions for a model that had one.
/// - writes are visible to subsequent reads once the call returns.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Persist a new version record. The record must be in `uploaded`.
    async fn register(&self, record: ModelVersionRecord) -> StorageResult<ModelVersionRecord>;

    async fn get(&self, key: &VersionKey) -> StorageResult<ModelVersionRecord>;

    /// Move `key` from `expected` to `next`, failing if the stored state no
    /// longer equals `expected` or if the edge is not legal.
    async fn compare_and_set_state(
        &self,
        key: &VersionKey,
        expected: LifecycleState,
        next: LifecycleState,
        at: DateTime<Utc>,
    ) -> StorageResult<ModelVersionRecord>;

    /// Atomic activation swap. `key` must currently be `promoting`.
    async fn activate(&self, key: &VersionKey, at: DateTime<Utc>) -> StorageResult<SwapOutcome>;

    /// The at-most-one currently active version of a model.
    async fn active_version(&self, model_name: &str) -> StorageResult<Option<ModelVersionRecord>>;

    async fn list_versions(&self, model_name: &str) -> StorageResult<Vec<ModelVersionRecord>>;

    /// All versions in a non-settled state, across models. Used by the
    /// daemon to resume work after a restart.
    async fn list_in_flight(&self) -> StorageResult<Vec<ModelVersionRecord>>;
}

/// Durable queue of approval requests.
///
/// Guarantees:
/// - `resolve` is exactly-once: a second resolution attempt fails with
///   `ApprovalAlreadyResolved` whatever the attempted outcome.
/// - `resolve` only accepts terminal statuses.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn create(&self, record: ApprovalRecord) -> StorageResult<ApprovalRecord>;

    async fn get(&self, request_id: &ApprovalId) -> StorageResult<ApprovalRecord>;

    async fn resolve(
        &self,
        request_id: &ApprovalId,
        status: ApprovalStatus,
        resolved_by: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<ApprovalRecord>;

    async fn list_open(&self) -> StorageResult<Vec<ApprovalRecord>>;

    /// Open requests touching one version, oldest first.
    async fn open_for(&self, key: &VersionKey) -> StorageResult<Vec<ApprovalRecord>>;
}

/// Append-only ledger of promotion decisions.
///
/// Guarantees:
/// - entries are never mutated or deleted once appended.
/// - `recent` and `for_version` return newest-first.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, event: AuditEvent, at: DateTime<Utc>) -> StorageResult<AuditRecord>;

    async fn recent(&self, limit: usize) -> StorageResult<Vec<AuditRecord>>;

    async fn for_version(&self, key: &VersionKey) -> StorageResult<Vec<AuditRecord>>;
}

/// Content-addressed artifact storage.
///
/// Guarantees:
/// - `put_artifact` is idempotent: the same bytes yield the same URI.
/// - `get_artifact` returns exactly the bytes that were stored.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store artifact bytes; returns the URI and content digest.
    async fn put_artifact(&self, data: &[u8]) -> StorageResult<(String, ArtifactDigest)>;

    async fn get_artifact(&self, uri: &str) -> StorageResult<Vec<u8>>;
}

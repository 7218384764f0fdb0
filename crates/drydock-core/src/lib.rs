//! Drydock Core Library
//!
//! The promotion engine behind the `drydock` CLI and `drydockd` daemon:
//! schema-checked registration, the policy-gated lifecycle orchestrator,
//! the approval queue, and the canary health controller. Durable records
//! and the storage traits live in `drydock-state` and are re-exported here.

pub mod approvals;
pub mod canary;
pub mod collab;
pub mod config;
pub mod error;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod policy;
pub mod registry;
pub mod telemetry;
pub mod worker;

pub use approvals::ApprovalQueue;
pub use canary::{
    CanaryAction, CanaryConfig, CanarySession, MetricSample, SessionState, TickReport, Verdict,
    METRIC_ERROR, METRIC_LATENCY_MS,
};
pub use collab::{
    ChannelMetricsHub, DeployError, DeploymentController, LoggingDeployment, MetricsSource,
};
pub use config::{DrydockConfig, RetryConfig};
pub use error::{DrydockError, DrydockResult};
pub use orchestrator::{PromotionOrchestrator, TransitionOutcome};
pub use policy::{Decision, PolicyHandle, PolicyRule, PolicySet, CRITICAL_METADATA_KEY};
pub use registry::{is_critical, is_settled, MetadataSchema, RegistryApi};
pub use worker::{spawn_canary_worker, CanaryWorker, WorkerExit};

pub use drydock_state::{
    ApprovalId, ApprovalKind, ApprovalRecord, ApprovalStatus, ApprovalStore, ArtifactDigest,
    AuditEvent, AuditLog, AuditRecord, DeployCommand, HumanDecision, LifecycleState,
    ModelVersionRecord, ObjectStore, Requester, StorageError, SwapOutcome, Transition, VersionKey,
    VersionStore,
};

pub use metrics::METRICS;
pub use obs::{
    emit_daemon_ready, emit_resume_planned, emit_sweep_expired, emit_validation_evaluated,
    emit_worker_exit, VersionSpan,
};
pub use telemetry::init_tracing;

/// Drydock version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

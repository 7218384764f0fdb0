//! Drydock - staged model promotion CLI
//!
//! The `drydock` command registers model versions and walks them through the
//! rollout lifecycle: validation, canary, review, activation.
//!
//! ## Commands
//!
//! - `register`: Store an artifact and admit a new model version
//! - `validate`: Run the pre-rollout check gate against a version
//! - `promote`: Request a lifecycle transition for a version
//! - `rollback` / `cancel`: Stop an in-flight rollout
//! - `status` / `versions` / `active`: Inspect the catalog
//! - `approvals`: List and resolve pending review requests
//! - `policy`: Lint and print promotion rule sets
//! - `audit`: Show the decision trail

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;

use drydock_core::{
    is_critical, is_settled, DrydockConfig, LoggingDeployment, PolicyHandle, PolicySet,
    PromotionOrchestrator, RegistryApi, TransitionOutcome,
};
use drydock_gate::{run_validation, CheckConfig, EchoHarness, ValidationGate};
use drydock_state::{
    ApprovalId, ApprovalKind, AuditEvent, FsObjectStore, LifecycleState, ObjectStore, Requester,
    SurrealStore, VersionKey,
};

/// Ledger window scanned when filtering the audit trail by model.
const AUDIT_SCAN_WINDOW: usize = 500;

#[derive(Parser)]
#[command(name = "drydock")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Staged model promotion for ML serving fleets", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Engine configuration file (JSON)
    #[arg(long, global = true, env = "DRYDOCK_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Artifact store directory
    #[arg(long, global = true, default_value = ".drydock", value_name = "DIR")]
    objects_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store an artifact and register a new model version
    Register {
        /// Model name
        model: String,

        /// Version label, e.g. 2.1.0
        version: String,

        /// Path to the artifact file
        #[arg(short, long)]
        artifact: PathBuf,

        /// Metadata pair, KEY=VALUE (repeatable)
        #[arg(short, long = "metadata", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
    },

    /// Run the validation gate against an uploaded version
    Validate {
        /// Model name
        model: String,

        /// Version label
        version: String,

        /// Held-out sample for the smoke check (JSON)
        #[arg(long, default_value = "{}")]
        sample: String,

        /// Operator requesting the run
        #[arg(long, default_value = "cli", value_name = "NAME")]
        requested_by: String,
    },

    /// Request a lifecycle transition for a version
    Promote {
        /// Model name
        model: String,

        /// Version label
        version: String,

        /// Target state: validating, validated, canary, promoting or active
        #[arg(long, value_name = "STATE")]
        to: String,

        /// Operator requesting the transition
        #[arg(long, default_value = "cli", value_name = "NAME")]
        requested_by: String,
    },

    /// Roll a canary or promoting version back
    Rollback {
        /// Model name
        model: String,

        /// Version label
        version: String,

        /// Why the rollout is being stopped
        #[arg(long, default_value = "operator-requested rollback")]
        reason: String,

        /// Operator requesting the rollback
        #[arg(long, default_value = "cli", value_name = "NAME")]
        requested_by: String,
    },

    /// Abandon whatever the version is doing right now
    Cancel {
        /// Model name
        model: String,

        /// Version label
        version: String,

        /// Operator requesting the cancellation
        #[arg(long, default_value = "cli", value_name = "NAME")]
        requested_by: String,
    },

    /// Show one version in detail
    Status {
        /// Model name
        model: String,

        /// Version label
        version: String,
    },

    /// List every version of a model in registration order
    Versions {
        /// Model name
        model: String,
    },

    /// Show the active version of a model
    Active {
        /// Model name
        model: String,
    },

    /// Manage pending review requests
    Approvals {
        #[command(subcommand)]
        action: ApprovalAction,
    },

    /// Lint and print promotion rule sets
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Show the audit trail, newest first
    Audit {
        /// Restrict to one model
        #[arg(long)]
        model: Option<String>,

        /// Restrict to one version (needs --model)
        #[arg(long, requires = "model")]
        version: Option<String>,

        /// Maximum number of entries
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum ApprovalAction {
    /// List open review requests
    List,

    /// Approve a request
    Approve {
        /// Request id
        request_id: String,

        /// Deciding operator
        #[arg(long, value_name = "NAME")]
        by: String,

        /// Note recorded with the decision
        #[arg(long)]
        note: Option<String>,
    },

    /// Deny a request
    Deny {
        /// Request id
        request_id: String,

        /// Deciding operator
        #[arg(long, value_name = "NAME")]
        by: String,

        /// Note recorded with the decision
        #[arg(long)]
        note: Option<String>,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Validate a rule file without installing it
    Check {
        /// Rule file (JSON)
        file: PathBuf,
    },

    /// Print the built-in standard rollout rules as JSON
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    drydock_core::init_tracing(cli.json, level);

    let config = match &cli.config {
        Some(path) => DrydockConfig::load_from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => DrydockConfig::default(),
    };

    // Initialize database connection
    let store = SurrealStore::from_env()
        .await
        .context("Failed to connect to Drydock database")?;
    let app = App::new(Arc::new(store), &cli.objects_dir, config)?;

    match cli.command {
        Commands::Register {
            model,
            version,
            artifact,
            metadata,
        } => cmd_register(&app, &model, &version, &artifact, &metadata).await,
        Commands::Validate {
            model,
            version,
            sample,
            requested_by,
        } => cmd_validate(&app, &model, &version, &sample, &requested_by).await,
        Commands::Promote {
            model,
            version,
            to,
            requested_by,
        } => cmd_promote(&app, &model, &version, &to, &requested_by).await,
        Commands::Rollback {
            model,
            version,
            reason,
            requested_by,
        } => cmd_rollback(&app, &model, &version, reason, &requested_by).await,
        Commands::Cancel {
            model,
            version,
            requested_by,
        } => cmd_cancel(&app, &model, &version, &requested_by).await,
        Commands::Status { model, version } => cmd_status(&app, &model, &version).await,
        Commands::Versions { model } => cmd_versions(&app, &model).await,
        Commands::Active { model } => cmd_active(&app, &model).await,
        Commands::Approvals { action } => match action {
            ApprovalAction::List => cmd_approvals_list(&app).await,
            ApprovalAction::Approve {
                request_id,
                by,
                note,
            } => cmd_resolve_approval(&app, &request_id, true, &by, note).await,
            ApprovalAction::Deny {
                request_id,
                by,
                note,
            } => cmd_resolve_approval(&app, &request_id, false, &by, note).await,
        },
        Commands::Policy { action } => match action {
            PolicyAction::Check { file } => cmd_policy_check(&file),
            PolicyAction::Show => cmd_policy_show(),
        },
        Commands::Audit {
            model,
            version,
            limit,
        } => cmd_audit(&app, model.as_deref(), version.as_deref(), limit).await,
    }
}

/// Shared wiring behind every command: the catalog, the promotion
/// orchestrator and the artifact store.
struct App {
    registry: RegistryApi,
    orch: PromotionOrchestrator,
    objects: Arc<FsObjectStore>,
    config: DrydockConfig,
}

impl App {
    fn new(store: Arc<SurrealStore>, objects_dir: &Path, config: DrydockConfig) -> Result<Self> {
        let policy = match &config.policy_path {
            Some(path) => PolicySet::load_from_path(path)
                .with_context(|| format!("Failed to load policy from {}", path.display()))?,
            None => PolicySet::standard_rollout(),
        };
        let objects =
            Arc::new(FsObjectStore::new(objects_dir).context("Failed to open artifact store")?);
        let registry = RegistryApi::new(store.clone(), config.metadata_schema.clone());
        let orch = PromotionOrchestrator::new(
            store.clone(),
            store.clone(),
            store,
            Arc::new(LoggingDeployment),
            Arc::new(PolicyHandle::new(policy)),
            config.clone(),
        );
        Ok(App {
            registry,
            orch,
            objects,
            config,
        })
    }
}

// ========== Registry Commands ==========

/// Store the artifact and admit the version in the `uploaded` state
async fn cmd_register(
    app: &App,
    model: &str,
    version: &str,
    artifact: &Path,
    metadata_pairs: &[String],
) -> Result<()> {
    let metadata = parse_metadata(metadata_pairs)?;
    let bytes = std::fs::read(artifact)
        .with_context(|| format!("Failed to read artifact {}", artifact.display()))?;
    let (uri, digest) = app.objects.put_artifact(&bytes).await?;

    let record = app
        .registry
        .register(model, version, uri, digest, metadata, Utc::now())
        .await?;

    println!("Registered {} ({} bytes)", record.key, bytes.len());
    println!("  digest: {}", record.artifact_digest);
    println!("  state:  {}", record.state);
    Ok(())
}

/// Run the check gate and commit the verdict
async fn cmd_validate(
    app: &App,
    model: &str,
    version: &str,
    sample: &str,
    requested_by: &str,
) -> Result<()> {
    let key = VersionKey::new(model, version);
    let sample: serde_json::Value =
        serde_json::from_str(sample).context("--sample is not valid JSON")?;

    let checks = CheckConfig::standard(app.config.metadata_schema.required.clone(), sample);
    let gate = ValidationGate::new(app.objects.clone(), Arc::new(EchoHarness), checks);

    let run = run_validation(&app.orch, &gate, &key, Requester::operator(requested_by)).await?;

    if let Some(report) = &run.report {
        for check in &report.checks {
            let mark = if check.passed { "PASS" } else { "FAIL" };
            println!(
                "  [{}] {} ({}ms): {}",
                mark, check.name, check.duration_ms, check.detail
            );
        }
        println!(
            "{}/{} checks passed in {}ms",
            report.passed_count(),
            report.checks.len(),
            report.duration_ms
        );
    }
    println!("{}", describe_outcome(&run.outcome));
    Ok(())
}

// ========== Lifecycle Commands ==========

/// Request a transition and print the policy's answer
async fn cmd_promote(
    app: &App,
    model: &str,
    version: &str,
    to: &str,
    requested_by: &str,
) -> Result<()> {
    let target = match LifecycleState::parse(to) {
        Some(state) => state,
        None => anyhow::bail!(
            "unknown state '{}'; expected validating, validated, canary, promoting or active",
            to
        ),
    };
    let key = VersionKey::new(model, version);
    let outcome = app
        .orch
        .request_transition(&key, target, Requester::operator(requested_by), Utc::now())
        .await?;
    println!("{}", describe_outcome(&outcome));
    Ok(())
}

/// Roll a canary or promoting version back, recording why
async fn cmd_rollback(
    app: &App,
    model: &str,
    version: &str,
    reason: String,
    requested_by: &str,
) -> Result<()> {
    let key = VersionKey::new(model, version);
    let outcome = app
        .orch
        .trigger_rollback(&key, Requester::operator(requested_by), reason, Utc::now())
        .await?;
    println!("{}", describe_outcome(&outcome));
    Ok(())
}

/// Abandon an in-flight version
async fn cmd_cancel(app: &App, model: &str, version: &str, requested_by: &str) -> Result<()> {
    let key = VersionKey::new(model, version);
    let outcome = app
        .orch
        .cancel(&key, Requester::operator(requested_by), Utc::now())
        .await?;
    println!("{}", describe_outcome(&outcome));
    Ok(())
}

// ========== Catalog Commands ==========

/// Show one version in detail
async fn cmd_status(app: &App, model: &str, version: &str) -> Result<()> {
    let key = VersionKey::new(model, version);
    let record = app.registry.get(&key).await?;

    println!("{}", record.key);
    println!("  state:    {}", record.state);
    println!("  digest:   {}", record.artifact_digest);
    println!("  artifact: {}", record.artifact_uri);
    println!("  created:  {}", record.created_at.to_rfc3339());
    println!("  updated:  {}", record.state_updated_at.to_rfc3339());
    if is_critical(&record) {
        println!("  critical: yes");
    }
    for (name, value) in &record.metadata {
        println!("  meta:     {}={}", name, value);
    }

    if !is_settled(&record) {
        for approval in app.orch.approvals().open_for(&key).await? {
            println!("  waiting:  {} ({})", approval.request_id, approval.reason);
        }
    }
    Ok(())
}

/// List every version of a model
async fn cmd_versions(app: &App, model: &str) -> Result<()> {
    let records = app.registry.list_versions(model).await?;
    if records.is_empty() {
        println!("No versions registered for {}", model);
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {:<12} {}",
            record.state_updated_at.to_rfc3339(),
            record.state,
            record.key
        );
    }
    Ok(())
}

/// Show the active version of a model
async fn cmd_active(app: &App, model: &str) -> Result<()> {
    match app.registry.active_version(model).await? {
        Some(record) => {
            println!(
                "{} active since {}",
                record.key,
                record.state_updated_at.to_rfc3339()
            );
            println!("  digest:   {}", record.artifact_digest);
            println!("  artifact: {}", record.artifact_uri);
        }
        None => println!("No active version for {}", model),
    }
    Ok(())
}

// ========== Approval Commands ==========

/// List open review requests
async fn cmd_approvals_list(app: &App) -> Result<()> {
    let open = app.orch.approvals().list_open().await?;
    if open.is_empty() {
        println!("No open approval requests");
        return Ok(());
    }
    for approval in open {
        let transition = &approval.transition;
        println!(
            "{}  {} {} -> {}",
            approval.request_id, transition.key, transition.from, transition.to
        );
        match &approval.kind {
            ApprovalKind::PolicyGate => println!("    reason:  {}", approval.reason),
            ApprovalKind::DeploymentStalled { command } => {
                println!("    reason:  {} (stalled on {})", approval.reason, command)
            }
        }
        if let Some(deadline) = approval.expires_at {
            println!("    expires: {}", deadline.to_rfc3339());
        }
    }
    Ok(())
}

/// Apply a human decision to an open request
async fn cmd_resolve_approval(
    app: &App,
    request_id: &str,
    approved: bool,
    by: &str,
    note: Option<String>,
) -> Result<()> {
    let request_id = ApprovalId(request_id.to_string());
    let resolved_by = Requester::operator(by).id();
    let outcome = app
        .orch
        .resolve_approval(&request_id, approved, &resolved_by, note, Utc::now())
        .await?;
    println!("{}", describe_outcome(&outcome));
    Ok(())
}

// ========== Policy Commands ==========

/// Validate a rule file without installing it
fn cmd_policy_check(file: &Path) -> Result<()> {
    let set = PolicySet::load_from_path(file)
        .with_context(|| format!("Policy file {} failed validation", file.display()))?;
    println!("OK: {} rules", set.rules.len());
    Ok(())
}

/// Print the built-in standard rollout rules as JSON
fn cmd_policy_show() -> Result<()> {
    let set = PolicySet::standard_rollout();
    println!("{}", serde_json::to_string_pretty(&set)?);
    Ok(())
}

// ========== Audit Commands ==========

/// Show the decision trail, newest first
async fn cmd_audit(
    app: &App,
    model: Option<&str>,
    version: Option<&str>,
    limit: usize,
) -> Result<()> {
    let records = match (model, version) {
        (Some(model), Some(version)) => {
            let key = VersionKey::new(model, version);
            app.orch.audit().for_version(&key).await?
        }
        (Some(model), None) => {
            // Model-level filtering scans a bounded window of the ledger.
            let window = app.orch.audit().recent(AUDIT_SCAN_WINDOW).await?;
            window
                .into_iter()
                .filter(|r| r.event.key().is_some_and(|k| k.model_name == model))
                .collect()
        }
        _ => app.orch.audit().recent(limit).await?,
    };

    if records.is_empty() {
        println!("No audit entries");
        return Ok(());
    }
    for record in records.into_iter().take(limit) {
        println!(
            "{}  {}",
            record.recorded_at.to_rfc3339(),
            describe_event(&record.event)
        );
    }
    Ok(())
}

// ========== Helpers ==========

/// Parse repeated KEY=VALUE pairs into a metadata map
fn parse_metadata(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut metadata = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("metadata '{}' is not KEY=VALUE", pair))?;
        metadata.insert(key.to_string(), value.to_string());
    }
    Ok(metadata)
}

/// One line a human can act on for each transition outcome
fn describe_outcome(outcome: &TransitionOutcome) -> String {
    match outcome {
        TransitionOutcome::Committed { to } => format!("Committed -> {}", to),
        TransitionOutcome::Denied { reason } => format!("Denied: {}", reason),
        TransitionOutcome::ApprovalPending { request_id } => {
            format!("Waiting on approval {}", request_id)
        }
        TransitionOutcome::Stalled { to, request_id } => format!(
            "Committed -> {}, but a fleet command stalled (approval {})",
            to, request_id
        ),
    }
}

/// One-line rendering of an audit event
fn describe_event(event: &AuditEvent) -> String {
    match event {
        AuditEvent::TransitionCommitted {
            key,
            from,
            to,
            requester,
        } => format!("{} {} -> {} ({})", key, from, to, requester),
        AuditEvent::TransitionDenied {
            key,
            from,
            to,
            requester,
            reason,
        } => format!("{} {} -> {} denied for {}: {}", key, from, to, requester, reason),
        AuditEvent::ApprovalRequested {
            request_id,
            key,
            from,
            to,
            reason,
        } => format!("{} {} -> {} awaits {}: {}", key, from, to, request_id, reason),
        AuditEvent::ApprovalResolved {
            request_id,
            key,
            approved,
            resolved_by,
            ..
        } => {
            let verdict = if *approved { "approved" } else { "denied" };
            format!("{} request {} {} by {}", key, request_id, verdict, resolved_by)
        }
        AuditEvent::ApprovalExpired { request_id, key } => {
            format!("{} request {} expired", key, request_id)
        }
        AuditEvent::RollbackTriggered { key, reason, .. } => {
            format!("{} rolled back: {}", key, reason)
        }
        AuditEvent::ValidationRejected { key, failed_checks } => {
            format!("{} failed validation: {}", key, failed_checks.join(", "))
        }
        AuditEvent::DeploymentStalled {
            key,
            command,
            request_id,
        } => format!("{} stalled on {} (approval {})", key, command, request_id),
        AuditEvent::PolicyReloaded {
            rule_count,
            reloaded_by,
        } => format!("policy reloaded with {} rules by {}", rule_count, reloaded_by),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_core::MetadataSchema;

    async fn make_app(objects_dir: &Path) -> App {
        let store = SurrealStore::in_memory().await.unwrap();
        App::new(Arc::new(store), objects_dir, DrydockConfig::default()).unwrap()
    }

    fn write_artifact(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn test_register_command_stores_artifact_and_record() {
        let temp_dir = tempfile::tempdir().unwrap();
        let app = make_app(temp_dir.path()).await;
        let artifact = write_artifact(temp_dir.path(), "model.onnx", b"weights-v1");

        cmd_register(
            &app,
            "ranker",
            "1.0.0",
            &artifact,
            &["team=search".to_string()],
        )
        .await
        .unwrap();

        let record = app
            .registry
            .get(&VersionKey::new("ranker", "1.0.0"))
            .await
            .unwrap();
        assert_eq!(record.state, LifecycleState::Uploaded);
        assert_eq!(record.metadata.get("team"), Some(&"search".to_string()));

        let bytes = app.objects.get_artifact(&record.artifact_uri).await.unwrap();
        assert_eq!(bytes, b"weights-v1");
    }

    #[tokio::test]
    async fn test_register_command_rejects_malformed_metadata() {
        let temp_dir = tempfile::tempdir().unwrap();
        let app = make_app(temp_dir.path()).await;
        let artifact = write_artifact(temp_dir.path(), "model.onnx", b"weights-v1");

        let err = cmd_register(&app, "ranker", "1.0.0", &artifact, &["team".to_string()])
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("not KEY=VALUE"));
    }

    #[tokio::test]
    async fn test_validate_command_passes_clean_version() {
        let temp_dir = tempfile::tempdir().unwrap();
        let app = make_app(temp_dir.path()).await;
        let artifact = write_artifact(temp_dir.path(), "model.onnx", b"weights-v1");

        cmd_register(&app, "ranker", "1.0.0", &artifact, &[])
            .await
            .unwrap();
        cmd_validate(&app, "ranker", "1.0.0", r#"{"q": "rust"}"#, "ines")
            .await
            .unwrap();

        let record = app
            .registry
            .get(&VersionKey::new("ranker", "1.0.0"))
            .await
            .unwrap();
        assert_eq!(record.state, LifecycleState::Validated);
    }

    #[tokio::test]
    async fn test_validate_command_catches_schema_drift() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SurrealStore::in_memory().await.unwrap());
        let app = App::new(store.clone(), temp_dir.path(), DrydockConfig::default()).unwrap();
        let artifact = write_artifact(temp_dir.path(), "model.onnx", b"weights-v1");

        // Registered before anyone required a team label.
        cmd_register(&app, "ranker", "1.0.0", &artifact, &[])
            .await
            .unwrap();

        let strict = DrydockConfig {
            metadata_schema: MetadataSchema::require(&["team"]),
            ..Default::default()
        };
        let strict_app = App::new(store, temp_dir.path(), strict).unwrap();
        cmd_validate(&strict_app, "ranker", "1.0.0", "{}", "ines")
            .await
            .unwrap();

        let record = strict_app
            .registry
            .get(&VersionKey::new("ranker", "1.0.0"))
            .await
            .unwrap();
        assert_eq!(record.state, LifecycleState::Rejected);
    }

    #[tokio::test]
    async fn test_promote_approve_flow_reaches_promoting() {
        let temp_dir = tempfile::tempdir().unwrap();
        let app = make_app(temp_dir.path()).await;
        let artifact = write_artifact(temp_dir.path(), "model.onnx", b"weights-v1");
        let key = VersionKey::new("ranker", "1.0.0");

        cmd_register(&app, "ranker", "1.0.0", &artifact, &[])
            .await
            .unwrap();
        cmd_validate(&app, "ranker", "1.0.0", "{}", "ines")
            .await
            .unwrap();
        cmd_promote(&app, "ranker", "1.0.0", "canary", "ines")
            .await
            .unwrap();
        assert_eq!(
            app.registry.get(&key).await.unwrap().state,
            LifecycleState::Canary
        );

        // Promotion out of canary needs review under the standard rules.
        cmd_promote(&app, "ranker", "1.0.0", "promoting", "ines")
            .await
            .unwrap();
        assert_eq!(
            app.registry.get(&key).await.unwrap().state,
            LifecycleState::Canary
        );

        let open = app.orch.approvals().list_open().await.unwrap();
        assert_eq!(open.len(), 1);
        let request_id = open[0].request_id.0.clone();

        cmd_resolve_approval(&app, &request_id, true, "lead", None)
            .await
            .unwrap();
        assert_eq!(
            app.registry.get(&key).await.unwrap().state,
            LifecycleState::Promoting
        );
    }

    #[tokio::test]
    async fn test_promote_rejects_unknown_state() {
        let temp_dir = tempfile::tempdir().unwrap();
        let app = make_app(temp_dir.path()).await;

        let err = cmd_promote(&app, "ranker", "1.0.0", "shipped", "ines")
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("unknown state 'shipped'"));
    }

    #[tokio::test]
    async fn test_rollback_command_stops_canary() {
        let temp_dir = tempfile::tempdir().unwrap();
        let app = make_app(temp_dir.path()).await;
        let artifact = write_artifact(temp_dir.path(), "model.onnx", b"weights-v1");
        let key = VersionKey::new("ranker", "1.0.0");

        cmd_register(&app, "ranker", "1.0.0", &artifact, &[])
            .await
            .unwrap();
        cmd_validate(&app, "ranker", "1.0.0", "{}", "ines")
            .await
            .unwrap();
        cmd_promote(&app, "ranker", "1.0.0", "canary", "ines")
            .await
            .unwrap();

        cmd_rollback(&app, "ranker", "1.0.0", "latency spike".to_string(), "ines")
            .await
            .unwrap();
        assert_eq!(
            app.registry.get(&key).await.unwrap().state,
            LifecycleState::RolledBack
        );
    }

    #[tokio::test]
    async fn test_policy_check_refuses_unsafe_rule_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file = temp_dir.path().join("rules.json");
        std::fs::write(
            &file,
            r#"{"rules":[{"name":"yolo","to_state":"active","decision":{"type":"allow"}}]}"#,
        )
        .unwrap();

        let err = cmd_policy_check(&file).unwrap_err();
        assert!(format!("{err:#}").contains("yolo"));
    }

    #[test]
    fn test_metadata_pairs_parse_and_reject() {
        let parsed = parse_metadata(&["team=search".to_string(), "critical=true".to_string()])
            .unwrap();
        assert_eq!(parsed.get("team"), Some(&"search".to_string()));
        assert_eq!(parsed.get("critical"), Some(&"true".to_string()));

        assert!(parse_metadata(&["no-equals".to_string()]).is_err());
    }

    #[test]
    fn test_outcome_descriptions_are_stable() {
        let committed = TransitionOutcome::Committed {
            to: LifecycleState::Canary,
        };
        assert_eq!(describe_outcome(&committed), "Committed -> canary");

        let pending = TransitionOutcome::ApprovalPending {
            request_id: ApprovalId("req-1".to_string()),
        };
        assert_eq!(describe_outcome(&pending), "Waiting on approval req-1");
    }
}

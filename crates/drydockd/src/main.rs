//! drydockd - the Drydock promotion daemon
//!
//! Owns the long-running half of a rollout:
//! - resumes in-flight versions from the store after a restart
//! - runs one canary health worker per canary version
//! - sweeps expired approval requests on an interval
//!
//! Registrations and transition requests arrive through the `drydock` CLI
//! against the same store; each housekeeping pass adopts whatever newly
//! needs a worker.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn, Level};

use drydock_core::{
    emit_daemon_ready, emit_resume_planned, emit_sweep_expired, emit_worker_exit,
    spawn_canary_worker, ChannelMetricsHub, DrydockConfig, LoggingDeployment, MetricsSource,
    PolicyHandle, PolicySet, PromotionOrchestrator, VersionSpan, WorkerExit, METRICS,
};
use drydock_gate::{run_validation, CheckConfig, EchoHarness, ValidationGate};
use drydock_state::{FsObjectStore, LifecycleState, Requester, SurrealStore, VersionKey};

#[derive(Parser)]
#[command(name = "drydockd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Drydock promotion daemon", long_about = None)]
struct Args {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Engine configuration file (JSON)
    #[arg(long, env = "DRYDOCK_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Artifact store directory
    #[arg(long, default_value = ".drydock", value_name = "DIR")]
    objects_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    drydock_core::init_tracing(args.json, level);

    let config = match &args.config {
        Some(path) => DrydockConfig::load_from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => DrydockConfig::default(),
    };

    // An unsafe rule set must never take effect, so a bad file is fatal here.
    let policy = match &config.policy_path {
        Some(path) => PolicySet::load_from_path(path)
            .with_context(|| format!("Failed to load policy from {}", path.display()))?,
        None => PolicySet::standard_rollout(),
    };

    // Initialize database connection
    let store = Arc::new(
        SurrealStore::from_env()
            .await
            .context("Failed to connect to Drydock database")?,
    );
    let objects =
        Arc::new(FsObjectStore::new(&args.objects_dir).context("Failed to open artifact store")?);

    let metrics = Arc::new(ChannelMetricsHub::new(config.canary.window_samples));
    let orch = Arc::new(PromotionOrchestrator::new(
        store.clone(),
        store.clone(),
        store,
        Arc::new(LoggingDeployment),
        Arc::new(PolicyHandle::new(policy)),
        config.clone(),
    ));
    let gate = Arc::new(ValidationGate::new(
        objects,
        Arc::new(EchoHarness),
        CheckConfig::standard(config.metadata_schema.required.clone(), serde_json::json!({})),
    ));

    let mut daemon = Daemon {
        orch,
        gate,
        metrics,
        workers: HashMap::new(),
    };

    // The first pass doubles as restart recovery: canary sessions are
    // re-seeded from the retained metric windows.
    daemon.reconcile(true).await;
    emit_daemon_ready("surrealdb");

    let period = Duration::from_secs(config.expiry_sweep_interval_secs.max(1));
    let mut housekeeping = tokio::time::interval(period);
    housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    housekeeping.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = housekeeping.tick() => {
                daemon.sweep().await;
                daemon.reconcile(false).await;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for shutdown signal")?;
                info!("shutdown signal received");
                break;
            }
        }
    }

    daemon.shutdown();
    METRICS.flush();
    Ok(())
}

/// Long-lived daemon state: the shared collaborators plus one tracked task
/// per version being worked.
struct Daemon {
    orch: Arc<PromotionOrchestrator>,
    gate: Arc<ValidationGate>,
    metrics: Arc<ChannelMetricsHub>,
    workers: HashMap<VersionKey, JoinHandle<()>>,
}

impl Daemon {
    /// One pass over the store: adopt every in-flight version that needs a
    /// task. `seed_windows` replays retained metric samples into new canary
    /// sessions and is set only for the restart pass.
    async fn reconcile(&mut self, seed_windows: bool) {
        self.workers.retain(|_, handle| !handle.is_finished());

        let in_flight = match self.orch.versions().list_in_flight().await {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "could not list in-flight versions");
                return;
            }
        };
        if seed_windows {
            emit_resume_planned(in_flight.len());
        }

        for record in in_flight {
            if self.workers.contains_key(&record.key) {
                continue;
            }
            match record.state {
                LifecycleState::Uploaded | LifecycleState::Validating => {
                    self.adopt_validation(record.key.clone());
                }
                LifecycleState::Canary => {
                    self.adopt_canary(record.key.clone(), seed_windows).await;
                }
                // Validated and promoting versions wait on a human decision;
                // there is nothing to drive until an approval lands.
                _ => {}
            }
        }
    }

    fn adopt_validation(&mut self, key: VersionKey) {
        let _span = VersionSpan::enter(&key);
        info!("adopting version for validation");
        let orch = self.orch.clone();
        let gate = self.gate.clone();
        let worker_key = key.clone();
        let handle = tokio::spawn(async move {
            match run_validation(&orch, &gate, &worker_key, Requester::ValidationGate).await {
                Ok(run) => {
                    let verdict = if run.validated() { "passed" } else { "not validated" };
                    info!(key = %worker_key, verdict, "validation task finished");
                }
                Err(err) => warn!(key = %worker_key, error = %err, "validation task failed"),
            }
        });
        self.workers.insert(key, handle);
    }

    async fn adopt_canary(&mut self, key: VersionKey, seed_recent: bool) {
        let _span = VersionSpan::enter(&key);
        info!("adopting canary worker");
        let orch = self.orch.clone();
        let metrics: Arc<dyn MetricsSource> = self.metrics.clone();
        let worker = spawn_canary_worker(orch, metrics, key.clone(), seed_recent).await;
        let worker_key = key.clone();
        let handle = tokio::spawn(async move {
            match worker.await {
                Ok(Ok(exit)) => emit_worker_exit(&worker_key, exit_label(exit)),
                Ok(Err(err)) => warn!(key = %worker_key, error = %err, "canary worker failed"),
                Err(err) => error!(key = %worker_key, error = %err, "canary worker panicked"),
            }
        });
        self.workers.insert(key, handle);
    }

    /// Expire overdue approval requests.
    async fn sweep(&self) {
        match self.orch.expire_approvals(Utc::now()).await {
            Ok(count) => {
                if count > 0 {
                    emit_sweep_expired(count);
                }
            }
            Err(err) => error!(error = %err, "approval sweep failed"),
        }
    }

    /// Stop outstanding tasks. Lifecycle state lives in the store, so an
    /// aborted worker resumes cleanly on the next start.
    fn shutdown(&mut self) {
        for (key, handle) in self.workers.drain() {
            handle.abort();
            info!(key = %key, "worker stopped");
        }
    }
}

fn exit_label(exit: WorkerExit) -> &'static str {
    match exit {
        WorkerExit::Promoted => "promoted",
        WorkerExit::RolledBack => "rolled_back",
        WorkerExit::Superseded => "superseded",
        WorkerExit::StreamClosed => "stream_closed",
    }
}

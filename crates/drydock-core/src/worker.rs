//! Background worker that watches one canary version: consumes the metric
//! feed, ticks the session, and files promotion or rollback requests with
//! the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use drydock_state::{LifecycleState, Requester, VersionKey};

use crate::canary::{CanaryAction, CanarySession, MetricSample};
use crate::collab::MetricsSource;
use crate::error::{DrydockError, DrydockResult};
use crate::metrics::METRICS;
use crate::orchestrator::{PromotionOrchestrator, TransitionOutcome};

/// Why a canary worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The version left canary in the promotion direction.
    Promoted,
    /// The version was rolled back, by this worker or anyone else.
    RolledBack,
    /// The version left canary some other way; nothing left to watch.
    Superseded,
    /// The metrics feed closed underneath the worker.
    StreamClosed,
}

pub struct CanaryWorker {
    orch: Arc<PromotionOrchestrator>,
    session: CanarySession,
    rx: mpsc::Receiver<MetricSample>,
    /// Set once a promotion request has been filed, so an unanswered
    /// approval is not re-requested every tick.
    promote_requested: bool,
}

impl CanaryWorker {
    pub fn new(
        orch: Arc<PromotionOrchestrator>,
        session: CanarySession,
        rx: mpsc::Receiver<MetricSample>,
    ) -> Self {
        CanaryWorker {
            orch,
            session,
            rx,
            promote_requested: false,
        }
    }

    /// Drive the session until the version settles. Ticks fire on a wall
    /// clock interval or after `tick_every_samples` new samples, whichever
    /// comes first.
    #[instrument(skip_all, fields(key = %self.session.key()))]
    pub async fn run(mut self) -> DrydockResult<WorkerExit> {
        let config = self.orch.config().canary.clone();
        let period = Duration::from_secs(config.tick_interval_secs.max(1));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut samples_since_tick = 0usize;

        info!("canary worker started");
        loop {
            let due = tokio::select! {
                _ = interval.tick() => true,
                sample = self.rx.recv() => match sample {
                    Some(sample) => {
                        self.session.observe(&sample);
                        samples_since_tick += 1;
                        samples_since_tick >= config.tick_every_samples
                    }
                    None => {
                        warn!("metrics stream closed");
                        return Ok(WorkerExit::StreamClosed);
                    }
                },
            };
            if !due {
                continue;
            }
            samples_since_tick = 0;
            interval.reset();

            if let Some(exit) = self.tick().await? {
                info!(exit = ?exit, "canary worker finished");
                return Ok(exit);
            }
        }
    }

    async fn tick(&mut self) -> DrydockResult<Option<WorkerExit>> {
        let key = self.session.key().clone();

        // The registry is authoritative; someone may have moved the version
        // while we were collecting samples.
        let record = self.orch.versions().get(&key).await?;
        match record.state {
            LifecycleState::Canary => {}
            LifecycleState::Promoting | LifecycleState::Active => {
                return Ok(Some(WorkerExit::Promoted))
            }
            LifecycleState::RolledBack => return Ok(Some(WorkerExit::RolledBack)),
            _ => return Ok(Some(WorkerExit::Superseded)),
        }

        let report = self.session.evaluate_tick(Utc::now());
        METRICS.inc_canary_ticks();
        debug!(
            verdict = ?report.verdict,
            error_rate = report.error_rate,
            latency_pctl = report.latency_pctl,
            healthy_streak = report.healthy_streak,
            breach_streak = report.breach_streak,
            "canary tick"
        );

        match report.action {
            CanaryAction::Hold => Ok(None),
            CanaryAction::Promote => {
                if self.promote_requested {
                    return Ok(None);
                }
                match self
                    .orch
                    .request_transition(
                        &key,
                        LifecycleState::Promoting,
                        Requester::CanaryController,
                        Utc::now(),
                    )
                    .await
                {
                    Ok(TransitionOutcome::Committed { .. })
                    | Ok(TransitionOutcome::Stalled { .. }) => Ok(Some(WorkerExit::Promoted)),
                    Ok(TransitionOutcome::ApprovalPending { request_id }) => {
                        self.promote_requested = true;
                        info!(%request_id, "promotion awaiting approval, still monitoring");
                        Ok(None)
                    }
                    Ok(TransitionOutcome::Denied { reason }) => {
                        self.promote_requested = true;
                        warn!(%reason, "promotion denied by policy, still monitoring");
                        Ok(None)
                    }
                    // A concurrent writer won; the next tick's state check
                    // settles what happened.
                    Err(DrydockError::StaleTransition { .. }) => Ok(None),
                    Err(e) => Err(e),
                }
            }
            CanaryAction::Rollback { reason } => {
                match self
                    .orch
                    .trigger_rollback(&key, Requester::CanaryController, reason, Utc::now())
                    .await
                {
                    Ok(_) => Ok(Some(WorkerExit::RolledBack)),
                    Err(DrydockError::StaleTransition { .. }) => Ok(None),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

/// Subscribe to the version's metric feed and run a worker for `key`.
///
/// With `seed_recent`, the retained sample window is replayed into the
/// session first; a restarted daemon uses this so an in-progress canary
/// does not start over from an empty window.
pub async fn spawn_canary_worker(
    orch: Arc<PromotionOrchestrator>,
    metrics: Arc<dyn MetricsSource>,
    key: VersionKey,
    seed_recent: bool,
) -> JoinHandle<DrydockResult<WorkerExit>> {
    let config = orch.config().canary.clone();
    let mut session = CanarySession::new(key.clone(), config.clone());
    if seed_recent {
        let window = metrics.recent_window(&key, config.window_samples).await;
        info!(key = %key, samples = window.len(), "seeding canary session from retained window");
        session.seed(&window);
    }
    let rx = metrics.subscribe(&key).await;
    tokio::spawn(CanaryWorker::new(orch, session, rx).run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use drydock_state::fakes::{MemoryApprovalStore, MemoryAuditLog, MemoryVersionStore};
    use drydock_state::{
        ApprovalId, ArtifactDigest, DeployCommand, ModelVersionRecord, VersionStore,
    };

    use crate::canary::CanaryConfig;
    use crate::collab::fakes::RecordingDeployment;
    use crate::collab::ChannelMetricsHub;
    use crate::config::DrydockConfig;
    use crate::policy::{PolicyHandle, PolicySet};

    struct Harness {
        orch: Arc<PromotionOrchestrator>,
        versions: Arc<MemoryVersionStore>,
        deploy: Arc<RecordingDeployment>,
        hub: Arc<ChannelMetricsHub>,
    }

    fn make_harness(canary: CanaryConfig) -> Harness {
        let versions = Arc::new(MemoryVersionStore::new());
        let deploy = Arc::new(RecordingDeployment::new());
        let config = DrydockConfig {
            canary,
            ..DrydockConfig::default()
        };
        let orch = Arc::new(PromotionOrchestrator::new(
            versions.clone(),
            Arc::new(MemoryApprovalStore::new()),
            Arc::new(MemoryAuditLog::new()),
            deploy.clone(),
            Arc::new(PolicyHandle::new(PolicySet::standard_rollout())),
            config,
        ));
        Harness {
            orch,
            versions,
            deploy,
            hub: Arc::new(ChannelMetricsHub::new(256)),
        }
    }

    /// Quick ticks driven by sample counts; the wall clock interval is
    /// effectively disabled so tests stay deterministic.
    fn test_canary_config(
        min_samples: usize,
        breach_ticks: u32,
        promote_after: u32,
    ) -> CanaryConfig {
        CanaryConfig {
            window_samples: 50,
            min_samples,
            breach_ticks,
            promote_after_healthy_ticks: promote_after,
            tick_interval_secs: 3600,
            tick_every_samples: 4,
            ..CanaryConfig::default()
        }
    }

    async fn seed_canary(h: &Harness, version: &str) -> VersionKey {
        let key = VersionKey::new("vision-ranker", version);
        let record = ModelVersionRecord::new(
            key.clone(),
            format!("mem://artifacts/{version}"),
            ArtifactDigest::from_bytes(version.as_bytes()),
            BTreeMap::new(),
            Utc::now(),
        );
        h.versions.register(record).await.unwrap();
        let path = [
            LifecycleState::Uploaded,
            LifecycleState::Validating,
            LifecycleState::Validated,
            LifecycleState::Canary,
        ];
        for pair in path.windows(2) {
            h.versions
                .compare_and_set_state(&key, pair[0], pair[1], Utc::now())
                .await
                .unwrap();
        }
        key
    }

    async fn publish_pairs(
        h: &Harness,
        key: &VersionKey,
        count: usize,
        failed: bool,
        latency: f64,
    ) {
        for _ in 0..count {
            h.hub
                .publish(MetricSample::error(key.clone(), Utc::now(), failed))
                .await;
            h.hub
                .publish(MetricSample::latency_ms(key.clone(), Utc::now(), latency))
                .await;
        }
    }

    async fn wait_for_open_approval(h: &Harness) -> ApprovalId {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let open = h.orch.approvals().list_open().await.unwrap();
            if let Some(first) = open.first() {
                return first.request_id.clone();
            }
            assert!(Instant::now() < deadline, "approval never opened");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn healthy_canary_requests_promotion_and_exits_once_promoted() {
        let h = make_harness(test_canary_config(2, 3, 2));
        let key = seed_canary(&h, "2.0.0").await;

        let handle = spawn_canary_worker(
            h.orch.clone(),
            h.hub.clone() as Arc<dyn MetricsSource>,
            key.clone(),
            false,
        )
        .await;

        // Two ticks of clean traffic reach the promote streak.
        publish_pairs(&h, &key, 4, false, 20.0).await;
        let request_id = wait_for_open_approval(&h).await;

        // The worker keeps monitoring while the request is open.
        assert!(!handle.is_finished());
        assert_eq!(
            h.versions.get(&key).await.unwrap().state,
            LifecycleState::Canary
        );

        h.orch
            .resolve_approval(&request_id, true, "operator:lead", None, Utc::now())
            .await
            .unwrap();
        assert_eq!(
            h.versions.get(&key).await.unwrap().state,
            LifecycleState::Promoting
        );

        // The next tick notices the committed state and stops.
        publish_pairs(&h, &key, 2, false, 20.0).await;
        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::Promoted);
    }

    #[tokio::test]
    async fn breaching_canary_rolls_back() {
        let h = make_harness(test_canary_config(2, 2, 3));
        let key = seed_canary(&h, "2.0.0").await;

        let handle = spawn_canary_worker(
            h.orch.clone(),
            h.hub.clone() as Arc<dyn MetricsSource>,
            key.clone(),
            false,
        )
        .await;

        // Two consecutive breached ticks of all-failing traffic.
        publish_pairs(&h, &key, 4, true, 20.0).await;

        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::RolledBack);
        assert_eq!(
            h.versions.get(&key).await.unwrap().state,
            LifecycleState::RolledBack
        );
        assert!(h.deploy.commands().contains(&DeployCommand::ShiftTraffic {
            key: key.clone(),
            percent: 0
        }));
    }

    #[tokio::test]
    async fn worker_notices_an_external_rollback() {
        let h = make_harness(test_canary_config(2, 3, 3));
        let key = seed_canary(&h, "2.0.0").await;

        let handle = spawn_canary_worker(
            h.orch.clone(),
            h.hub.clone() as Arc<dyn MetricsSource>,
            key.clone(),
            false,
        )
        .await;

        h.orch
            .cancel(&key, Requester::operator("ines"), Utc::now())
            .await
            .unwrap();

        // Enough samples to trigger the next tick's state check.
        publish_pairs(&h, &key, 2, false, 20.0).await;
        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::RolledBack);
    }

    #[tokio::test]
    async fn seeded_window_counts_toward_min_samples() {
        let h = make_harness(test_canary_config(4, 3, 1));
        let key = seed_canary(&h, "2.0.0").await;

        // History retained from before the restart.
        publish_pairs(&h, &key, 2, false, 20.0).await;

        let _handle = spawn_canary_worker(
            h.orch.clone(),
            h.hub.clone() as Arc<dyn MetricsSource>,
            key.clone(),
            true,
        )
        .await;

        // Two fresh pairs alone would be below min_samples; with the seeded
        // window the first tick is conclusive and healthy.
        publish_pairs(&h, &key, 2, false, 20.0).await;
        let request_id = wait_for_open_approval(&h).await;
        let record = h.orch.approvals().get(&request_id).await.unwrap();
        assert_eq!(record.transition.to, LifecycleState::Promoting);
    }

    #[tokio::test]
    async fn seeding_ignores_an_earlier_versions_samples() {
        let h = make_harness(test_canary_config(4, 1, 1));

        // A failed predecessor left its bad era in the retained windows.
        let prior = VersionKey::new("vision-ranker", "1.0.0");
        publish_pairs(&h, &prior, 10, true, 900.0).await;

        let key = seed_canary(&h, "2.0.0").await;
        let _handle = spawn_canary_worker(
            h.orch.clone(),
            h.hub.clone() as Arc<dyn MetricsSource>,
            key.clone(),
            true,
        )
        .await;

        // The new version serves only clean traffic. Its first conclusive
        // tick must be healthy; any leaked predecessor sample would fail it
        // on the spot with breach_ticks at 1.
        publish_pairs(&h, &key, 4, false, 20.0).await;
        let request_id = wait_for_open_approval(&h).await;
        let record = h.orch.approvals().get(&request_id).await.unwrap();
        assert_eq!(record.transition.to, LifecycleState::Promoting);
        assert_eq!(
            h.versions.get(&key).await.unwrap().state,
            LifecycleState::Canary
        );
    }

    #[tokio::test]
    async fn closed_feed_stops_the_worker() {
        let h = make_harness(test_canary_config(2, 3, 3));
        let key = seed_canary(&h, "2.0.0").await;

        let hub = Arc::new(ChannelMetricsHub::new(16));
        let handle =
            spawn_canary_worker(h.orch.clone(), hub.clone() as Arc<dyn MetricsSource>, key, false)
                .await;

        drop(hub);
        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::StreamClosed);
    }
}

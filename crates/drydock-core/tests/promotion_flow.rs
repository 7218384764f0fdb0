//! End-to-end promotion journeys over the in-memory stores: a healthy
//! version riding canary into production, and a degraded one being rolled
//! back automatically.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use drydock_core::collab::fakes::RecordingDeployment;
use drydock_core::{
    ApprovalId, ArtifactDigest, AuditEvent, AuditLog, CanaryConfig, ChannelMetricsHub,
    DeployCommand, DrydockConfig, LifecycleState, MetadataSchema, MetricSample, MetricsSource,
    PolicyHandle, PolicySet, PromotionOrchestrator, RegistryApi, Requester, TransitionOutcome,
    VersionKey, WorkerExit,
};
use drydock_state::fakes::{MemoryApprovalStore, MemoryAuditLog, MemoryVersionStore};

struct World {
    registry: RegistryApi,
    orch: Arc<PromotionOrchestrator>,
    versions: Arc<MemoryVersionStore>,
    deploy: Arc<RecordingDeployment>,
    audit: Arc<MemoryAuditLog>,
    hub: Arc<ChannelMetricsHub>,
}

fn make_world(canary: CanaryConfig) -> World {
    let versions = Arc::new(MemoryVersionStore::new());
    let audit = Arc::new(MemoryAuditLog::new());
    let deploy = Arc::new(RecordingDeployment::new());
    let config = DrydockConfig {
        canary,
        ..DrydockConfig::default()
    };
    let orch = Arc::new(PromotionOrchestrator::new(
        versions.clone(),
        Arc::new(MemoryApprovalStore::new()),
        audit.clone(),
        deploy.clone(),
        Arc::new(PolicyHandle::new(PolicySet::standard_rollout())),
        config,
    ));
    World {
        registry: RegistryApi::new(versions.clone(), MetadataSchema::require(&["team"])),
        orch,
        versions,
        deploy,
        audit,
        hub: Arc::new(ChannelMetricsHub::new(512)),
    }
}

async fn register(world: &World, version: &str) -> VersionKey {
    let mut metadata = BTreeMap::new();
    metadata.insert("team".to_string(), "search".to_string());
    let record = world
        .registry
        .register(
            "vision-ranker",
            version,
            format!("mem://artifacts/{version}"),
            ArtifactDigest::from_bytes(version.as_bytes()),
            metadata,
            Utc::now(),
        )
        .await
        .unwrap();
    record.key
}

/// Walk a registered version to canary through the orchestrator, the way
/// the validation gate and an operator would.
async fn promote_to_canary(world: &World, key: &VersionKey) {
    let steps = [
        (LifecycleState::Validating, Requester::operator("ines")),
        (LifecycleState::Validated, Requester::ValidationGate),
        (LifecycleState::Canary, Requester::operator("ines")),
    ];
    for (to, requester) in steps {
        let outcome = world
            .orch
            .request_transition(key, to, requester, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Committed { to }, "step to {to}");
    }
}

async fn approve(world: &World, outcome: TransitionOutcome) -> TransitionOutcome {
    match outcome {
        TransitionOutcome::ApprovalPending { request_id } => world
            .orch
            .resolve_approval(
                &request_id,
                true,
                "operator:lead",
                Some("reviewed".to_string()),
                Utc::now(),
            )
            .await
            .unwrap(),
        other => panic!("expected approval pending, got {other:?}"),
    }
}

async fn publish_window(
    world: &World,
    key: &VersionKey,
    pairs: usize,
    failures: usize,
    latency: f64,
) {
    for i in 0..pairs {
        let failed = i < failures;
        world
            .hub
            .publish(MetricSample::error(key.clone(), Utc::now(), failed))
            .await;
        world
            .hub
            .publish(MetricSample::latency_ms(key.clone(), Utc::now(), latency))
            .await;
    }
}

async fn wait_for_open_approval(world: &World) -> ApprovalId {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let open = world.orch.approvals().list_open().await.unwrap();
        if let Some(first) = open.first() {
            return first.request_id.clone();
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "approval never opened"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn state_of(world: &World, key: &VersionKey) -> LifecycleState {
    use drydock_state::VersionStore;
    world.versions.get(key).await.unwrap().state
}

#[tokio::test]
async fn healthy_version_rides_canary_into_production() {
    let world = make_world(CanaryConfig {
        window_samples: 50,
        min_samples: 2,
        promote_after_healthy_ticks: 2,
        tick_interval_secs: 3600,
        tick_every_samples: 4,
        ..CanaryConfig::default()
    });

    // An established baseline, promoted by hand.
    let v1 = register(&world, "1.0.0").await;
    promote_to_canary(&world, &v1).await;
    let pending = world
        .orch
        .request_transition(&v1, LifecycleState::Promoting, Requester::operator("ines"), Utc::now())
        .await
        .unwrap();
    approve(&world, pending).await;
    let pending = world
        .orch
        .request_transition(&v1, LifecycleState::Active, Requester::operator("ines"), Utc::now())
        .await
        .unwrap();
    approve(&world, pending).await;
    assert_eq!(state_of(&world, &v1).await, LifecycleState::Active);

    // The candidate enters canary and a worker starts watching it.
    let v2 = register(&world, "2.0.0").await;
    promote_to_canary(&world, &v2).await;
    let handle = drydock_core::spawn_canary_worker(
        world.orch.clone(),
        world.hub.clone() as Arc<dyn MetricsSource>,
        v2.clone(),
        false,
    )
    .await;

    // Two clean ticks reach the promote streak; the worker files the
    // promotion request and keeps monitoring until someone approves it.
    publish_window(&world, &v2, 4, 0, 25.0).await;
    let request_id = wait_for_open_approval(&world).await;
    assert_eq!(state_of(&world, &v2).await, LifecycleState::Canary);

    let outcome = world
        .orch
        .resolve_approval(&request_id, true, "operator:lead", None, Utc::now())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TransitionOutcome::Committed {
            to: LifecycleState::Promoting
        }
    );

    // The worker notices on its next tick and stands down.
    publish_window(&world, &v2, 2, 0, 25.0).await;
    let exit = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(exit, WorkerExit::Promoted);

    // Activation needs its own review, then swaps atomically.
    let issued_before = world.deploy.commands().len();
    let pending = world
        .orch
        .request_transition(&v2, LifecycleState::Active, Requester::operator("ines"), Utc::now())
        .await
        .unwrap();
    let outcome = approve(&world, pending).await;
    assert_eq!(
        outcome,
        TransitionOutcome::Committed {
            to: LifecycleState::Active
        }
    );

    assert_eq!(state_of(&world, &v2).await, LifecycleState::Active);
    assert_eq!(state_of(&world, &v1).await, LifecycleState::Retired);
    let active = world
        .registry
        .active_version("vision-ranker")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(active.key, v2);

    // The fleet saw the full traffic handover and the old version unload.
    let tail = world.deploy.commands()[issued_before..].to_vec();
    assert_eq!(
        tail,
        vec![
            DeployCommand::ShiftTraffic {
                key: v2.clone(),
                percent: 100
            },
            DeployCommand::Retire { key: v1.clone() },
        ]
    );

    // The audit trail tells the whole story for the candidate.
    let trail = world.audit.for_version(&v2).await.unwrap();
    let committed = trail
        .iter()
        .filter(|r| matches!(&r.event, AuditEvent::TransitionCommitted { .. }))
        .count();
    let requested = trail
        .iter()
        .filter(|r| matches!(&r.event, AuditEvent::ApprovalRequested { .. }))
        .count();
    let resolved = trail
        .iter()
        .filter(|r| matches!(&r.event, AuditEvent::ApprovalResolved { .. }))
        .count();
    assert_eq!(committed, 5, "uploaded through active is five edges");
    assert_eq!(requested, 2, "promotion and activation each needed review");
    assert_eq!(resolved, 2);
}

#[tokio::test]
async fn degraded_canary_is_rolled_back_without_review() {
    let world = make_world(CanaryConfig {
        window_samples: 200,
        min_samples: 20,
        tick_interval_secs: 3600,
        tick_every_samples: 40,
        ..CanaryConfig::default()
    });

    let v3 = register(&world, "3.0.0").await;
    promote_to_canary(&world, &v3).await;
    let handle = drydock_core::spawn_canary_worker(
        world.orch.clone(),
        world.hub.clone() as Arc<dyn MetricsSource>,
        v3.clone(),
        false,
    )
    .await;

    // 15% of requests fail against the 5% threshold. Three consecutive
    // breached ticks exhaust the tolerance.
    for _ in 0..3 {
        publish_window(&world, &v3, 20, 3, 25.0).await;
    }

    let exit = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(exit, WorkerExit::RolledBack);
    assert_eq!(state_of(&world, &v3).await, LifecycleState::RolledBack);

    // The canary's traffic share was withdrawn.
    assert!(world.deploy.commands().contains(&DeployCommand::ShiftTraffic {
        key: v3.clone(),
        percent: 0
    }));

    // No human was consulted on the way down, and the trail says why.
    assert!(world.orch.approvals().list_open().await.unwrap().is_empty());
    let trail = world.audit.for_version(&v3).await.unwrap();
    let rollback = trail.iter().find_map(|r| match &r.event {
        AuditEvent::RollbackTriggered { reason, requester, .. } => {
            Some((reason.clone(), requester.clone()))
        }
        _ => None,
    });
    let (reason, requester) = rollback.expect("rollback audit entry");
    assert!(reason.contains("error rate"), "reason: {reason}");
    assert_eq!(requester, Requester::CanaryController);
}

//! Process-wide counters, flushed to the log on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{info, trace};

pub static METRICS: Metrics = Metrics::new();

#[derive(Debug)]
pub struct Metrics {
    transitions_committed: AtomicU64,
    transitions_denied: AtomicU64,
    approvals_created: AtomicU64,
    approvals_resolved: AtomicU64,
    canary_ticks: AtomicU64,
    rollbacks: AtomicU64,
    deploy_retries: AtomicU64,
}

impl Metrics {
    const fn new() -> Self {
        Metrics {
            transitions_committed: AtomicU64::new(0),
            transitions_denied: AtomicU64::new(0),
            approvals_created: AtomicU64::new(0),
            approvals_resolved: AtomicU64::new(0),
            canary_ticks: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            deploy_retries: AtomicU64::new(0),
        }
    }

    pub fn inc_transitions_committed(&self) {
        self.transitions_committed.fetch_add(1, Ordering::Relaxed);
        trace!("metric: transition committed");
    }

    pub fn inc_transitions_denied(&self) {
        self.transitions_denied.fetch_add(1, Ordering::Relaxed);
        trace!("metric: transition denied");
    }

    pub fn inc_approvals_created(&self) {
        self.approvals_created.fetch_add(1, Ordering::Relaxed);
        trace!("metric: approval created");
    }

    pub fn inc_approvals_resolved(&self) {
        self.approvals_resolved.fetch_add(1, Ordering::Relaxed);
        trace!("metric: approval resolved");
    }

    pub fn inc_canary_ticks(&self) {
        self.canary_ticks.fetch_add(1, Ordering::Relaxed);
        trace!("metric: canary tick");
    }

    pub fn inc_rollbacks(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        trace!("metric: rollback");
    }

    pub fn inc_deploy_retries(&self) {
        self.deploy_retries.fetch_add(1, Ordering::Relaxed);
        trace!("metric: deploy retry");
    }

    pub fn transitions_committed(&self) -> u64 {
        self.transitions_committed.load(Ordering::Relaxed)
    }

    pub fn transitions_denied(&self) -> u64 {
        self.transitions_denied.load(Ordering::Relaxed)
    }

    pub fn approvals_created(&self) -> u64 {
        self.approvals_created.load(Ordering::Relaxed)
    }

    pub fn approvals_resolved(&self) -> u64 {
        self.approvals_resolved.load(Ordering::Relaxed)
    }

    pub fn canary_ticks(&self) -> u64 {
        self.canary_ticks.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    pub fn deploy_retries(&self) -> u64 {
        self.deploy_retries.load(Ordering::Relaxed)
    }

    /// Log a snapshot of every counter. Called on daemon shutdown.
    pub fn flush(&self) {
        info!(
            transitions_committed = self.transitions_committed(),
            transitions_denied = self.transitions_denied(),
            approvals_created = self.approvals_created(),
            approvals_resolved = self.approvals_resolved(),
            canary_ticks = self.canary_ticks(),
            rollbacks = self.rollbacks(),
            deploy_retries = self.deploy_retries(),
            "drydock metrics"
        );
    }

    pub fn reset(&self) {
        self.transitions_committed.store(0, Ordering::Relaxed);
        self.transitions_denied.store(0, Ordering::Relaxed);
        self.approvals_created.store(0, Ordering::Relaxed);
        self.approvals_resolved.store(0, Ordering::Relaxed);
        self.canary_ticks.store(0, Ordering::Relaxed);
        self.rollbacks.store(0, Ordering::Relaxed);
        self.deploy_retries.store(0, Ordering::Relaxed);
    }
}

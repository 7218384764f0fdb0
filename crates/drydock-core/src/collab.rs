//! Seams to the serving fleet: issuing deployment commands and ingesting
//! per-request metrics.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use drydock_state::{ModelVersionRecord, VersionKey};

use crate::canary::MetricSample;

/// A fleet action that could not be carried out.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct DeployError(pub String);

/// Actions Drydock issues against the serving fleet. Implementations must
/// be idempotent: a retried command may have partially applied already.
#[async_trait]
pub trait DeploymentController: Send + Sync {
    /// Make the artifact loadable by the fleet.
    async fn deploy(&self, record: &ModelVersionRecord) -> Result<(), DeployError>;

    /// Route `percent` of the model's traffic to this version.
    async fn shift_traffic(&self, key: &VersionKey, percent: u8) -> Result<(), DeployError>;

    /// Unload the version from the fleet.
    async fn retire(&self, key: &VersionKey) -> Result<(), DeployError>;
}

/// Feed of observed request metrics, streamed per version. Two versions of
/// one model never share a stream or a retained window.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Live sample feed for one version. The channel closes when the source
    /// shuts down.
    async fn subscribe(&self, key: &VersionKey) -> mpsc::Receiver<MetricSample>;

    /// Most recent samples for one version, oldest first.
    async fn recent_window(&self, key: &VersionKey, limit: usize) -> Vec<MetricSample>;
}

/// Deployment controller that records intent in the log and succeeds.
/// Stands in until a real fleet integration is wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDeployment;

#[async_trait]
impl DeploymentController for LoggingDeployment {
    async fn deploy(&self, record: &ModelVersionRecord) -> Result<(), DeployError> {
        info!(
            key = %record.key,
            artifact = %record.artifact_uri,
            digest = record.artifact_digest.short(),
            "deploy"
        );
        Ok(())
    }

    async fn shift_traffic(&self, key: &VersionKey, percent: u8) -> Result<(), DeployError> {
        info!(key = %key, percent, "shift traffic");
        Ok(())
    }

    async fn retire(&self, key: &VersionKey) -> Result<(), DeployError> {
        info!(key = %key, "retire");
        Ok(())
    }
}

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct HubInner {
    subscribers: HashMap<VersionKey, Vec<mpsc::Sender<MetricSample>>>,
    recent: HashMap<VersionKey, VecDeque<MetricSample>>,
}

/// In-process metrics fan-out. Serving processes (or tests) publish samples
/// tagged with the version that served them; canary workers subscribe per
/// version and can replay the retained window after a restart.
#[derive(Debug)]
pub struct ChannelMetricsHub {
    inner: Mutex<HubInner>,
    retain_samples: usize,
}

impl ChannelMetricsHub {
    pub fn new(retain_samples: usize) -> Self {
        ChannelMetricsHub {
            inner: Mutex::new(HubInner::default()),
            retain_samples,
        }
    }

    /// Fan a sample out to its version's live subscribers and retained
    /// window. A slow subscriber misses the sample; a dropped one is pruned.
    pub async fn publish(&self, sample: MetricSample) {
        let mut inner = self.inner.lock().await;

        let window = inner.recent.entry(sample.key.clone()).or_default();
        window.push_back(sample.clone());
        while window.len() > self.retain_samples {
            window.pop_front();
        }

        if let Some(senders) = inner.subscribers.get_mut(&sample.key) {
            senders.retain(|tx| match tx.try_send(sample.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }
}

#[async_trait]
impl MetricsSource for ChannelMetricsHub {
    async fn subscribe(&self, key: &VersionKey) -> mpsc::Receiver<MetricSample> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut inner = self.inner.lock().await;
        inner.subscribers.entry(key.clone()).or_default().push(tx);
        rx
    }

    async fn recent_window(&self, key: &VersionKey, limit: usize) -> Vec<MetricSample> {
        let inner = self.inner.lock().await;
        match inner.recent.get(key) {
            Some(window) => {
                let skip = window.len().saturating_sub(limit);
                window.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }
}

/// Test doubles for the fleet seams.
pub mod fakes {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use drydock_state::{DeployCommand, ModelVersionRecord, VersionKey};

    use super::{DeployError, DeploymentController};

    /// Records every issued command and can be told to fail the next N
    /// calls. Failed attempts are recorded too, so tests can count retries.
    #[derive(Debug, Default)]
    pub struct RecordingDeployment {
        commands: Mutex<Vec<DeployCommand>>,
        fail_next: AtomicU32,
    }

    impl RecordingDeployment {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_next_calls(&self, count: u32) {
            self.fail_next.store(count, Ordering::SeqCst);
        }

        pub fn commands(&self) -> Vec<DeployCommand> {
            self.commands.lock().unwrap().clone()
        }

        fn record(&self, command: DeployCommand) -> Result<(), DeployError> {
            self.commands.lock().unwrap().push(command);
            let failing = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                Err(DeployError("injected fleet failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl DeploymentController for RecordingDeployment {
        async fn deploy(&self, record: &ModelVersionRecord) -> Result<(), DeployError> {
            self.record(DeployCommand::Deploy {
                key: record.key.clone(),
            })
        }

        async fn shift_traffic(&self, key: &VersionKey, percent: u8) -> Result<(), DeployError> {
            self.record(DeployCommand::ShiftTraffic {
                key: key.clone(),
                percent,
            })
        }

        async fn retire(&self, key: &VersionKey) -> Result<(), DeployError> {
            self.record(DeployCommand::Retire { key: key.clone() })
        }
    }
}

//! In-memory fakes for exercising promotion flows without a database.
//!
//! Each fake keeps its records under a single `Mutex`, which makes the
//! compare-and-set and activation-swap guarantees trivially atomic. Tests
//! across the workspace build on these.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::store::{
    ApprovalId, ApprovalRecord, ApprovalStatus, ApprovalStore, ArtifactDigest, AuditEvent,
    AuditLog, AuditRecord, LifecycleState, ModelVersionRecord, ObjectStore, StorageResult,
    SwapOutcome, VersionKey, VersionStore,
};

fn slot(key: &VersionKey) -> (String, String) {
    (key.model_name.clone(), key.version.clone())
}

/// In-memory [`VersionStore`].
#[derive(Debug, Default)]
pub struct MemoryVersionStore {
    versions: Mutex<HashMap<(String, String), ModelVersionRecord>>,
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn register(&self, record: ModelVersionRecord) -> StorageResult<ModelVersionRecord> {
        let mut versions = self.versions.lock().unwrap();
        if versions.contains_key(&slot(&record.key)) {
            return Err(StorageError::DuplicateVersion { key: record.key });
        }
        versions.insert(slot(&record.key), record.clone());
        Ok(record)
    }

    async fn get(&self, key: &VersionKey) -> StorageResult<ModelVersionRecord> {
        let versions = self.versions.lock().unwrap();
        versions
            .get(&slot(key))
            .cloned()
            .ok_or_else(|| StorageError::VersionNotFound { key: key.clone() })
    }

    async fn compare_and_set_state(
        &self,
        key: &VersionKey,
        expected: LifecycleState,
        next: LifecycleState,
        at: DateTime<Utc>,
    ) -> StorageResult<ModelVersionRecord> {
        if !expected.can_transition_to(next) {
            return Err(StorageError::InvalidTransition {
                from: expected,
                to: next,
            });
        }
        let mut versions = self.versions.lock().unwrap();
        let record = versions
            .get_mut(&slot(key))
            .ok_or_else(|| StorageError::VersionNotFound { key: key.clone() })?;
        if record.state != expected {
            return Err(StorageError::StaleTransition {
                key: key.clone(),
                expected,
                actual: record.state,
            });
        }
        record.state = next;
        record.state_updated_at = at;
        Ok(record.clone())
    }

    async fn activate(&self, key: &VersionKey, at: DateTime<Utc>) -> StorageResult<SwapOutcome> {
        let mut versions = self.versions.lock().unwrap();
        let current = versions
            .get(&slot(key))
            .ok_or_else(|| StorageError::VersionNotFound { key: key.clone() })?;
        if current.state != LifecycleState::Promoting {
            return Err(StorageError::StaleTransition {
                key: key.clone(),
                expected: LifecycleState::Promoting,
                actual: current.state,
            });
        }

        let retired = versions
            .values()
            .find(|r| {
                r.key.model_name == key.model_name
                    && r.state == LifecycleState::Active
                    && r.key != *key
            })
            .map(|r| r.key.clone());

        // Both writes happen under the same lock; no reader can observe the
        // swap half done.
        if let Some(prior) = &retired {
            if let Some(record) = versions.get_mut(&slot(prior)) {
                record.state = LifecycleState::Retired;
                record.state_updated_at = at;
            }
        }
        let record = versions
            .get_mut(&slot(key))
            .ok_or_else(|| StorageError::VersionNotFound { key: key.clone() })?;
        record.state = LifecycleState::Active;
        record.state_updated_at = at;

        Ok(SwapOutcome {
            activated: record.clone(),
            retired,
        })
    }

    async fn active_version(
        &self,
        model_name: &str,
    ) -> StorageResult<Option<ModelVersionRecord>> {
        let versions = self.versions.lock().unwrap();
        Ok(versions
            .values()
            .find(|r| r.key.model_name == model_name && r.state == LifecycleState::Active)
            .cloned())
    }

    async fn list_versions(&self, model_name: &str) -> StorageResult<Vec<ModelVersionRecord>> {
        let versions = self.versions.lock().unwrap();
        let mut out: Vec<_> = versions
            .values()
            .filter(|r| r.key.model_name == model_name)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.key.version.cmp(&b.key.version))
        });
        Ok(out)
    }

    async fn list_in_flight(&self) -> StorageResult<Vec<ModelVersionRecord>> {
        let versions = self.versions.lock().unwrap();
        let mut out: Vec<_> = versions
            .values()
            .filter(|r| r.state.is_in_flight())
            .cloned()
            .collect();
        out.sort_by(|a, b| slot(&a.key).cmp(&slot(&b.key)));
        Ok(out)
    }
}

/// In-memory [`ApprovalStore`].
#[derive(Debug, Default)]
pub struct MemoryApprovalStore {
    requests: Mutex<HashMap<String, ApprovalRecord>>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalStore for MemoryApprovalStore {
    async fn create(&self, record: ApprovalRecord) -> StorageResult<ApprovalRecord> {
        let mut requests = self.requests.lock().unwrap();
        requests.insert(record.request_id.0.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, request_id: &ApprovalId) -> StorageResult<ApprovalRecord> {
        let requests = self.requests.lock().unwrap();
        requests
            .get(&request_id.0)
            .cloned()
            .ok_or_else(|| StorageError::ApprovalNotFound {
                request_id: request_id.0.clone(),
            })
    }

    async fn resolve(
        &self,
        request_id: &ApprovalId,
        status: ApprovalStatus,
        resolved_by: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<ApprovalRecord> {
        if !status.is_terminal() {
            return Err(StorageError::Backend(
                "resolve requires a terminal status".to_string(),
            ));
        }
        let mut requests = self.requests.lock().unwrap();
        let record = requests
            .get_mut(&request_id.0)
            .ok_or_else(|| StorageError::ApprovalNotFound {
                request_id: request_id.0.clone(),
            })?;
        if record.status.is_terminal() {
            return Err(StorageError::ApprovalAlreadyResolved {
                request_id: request_id.0.clone(),
            });
        }
        record.status = status;
        record.resolved_by = Some(resolved_by.to_string());
        record.resolved_at = Some(at);
        Ok(record.clone())
    }

    async fn list_open(&self) -> StorageResult<Vec<ApprovalRecord>> {
        let requests = self.requests.lock().unwrap();
        let mut out: Vec<_> = requests
            .values()
            .filter(|r| r.status == ApprovalStatus::Open)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn open_for(&self, key: &VersionKey) -> StorageResult<Vec<ApprovalRecord>> {
        let requests = self.requests.lock().unwrap();
        let mut out: Vec<_> = requests
            .values()
            .filter(|r| r.status == ApprovalStatus::Open && r.transition.key == *key)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }
}

/// In-memory [`AuditLog`]. Push-only vector; nothing ever removes entries.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append(&self, event: AuditEvent, at: DateTime<Utc>) -> StorageResult<AuditRecord> {
        let record = AuditRecord::new(event, at);
        let mut entries = self.entries.lock().unwrap();
        entries.push(record.clone());
        Ok(record)
    }

    async fn recent(&self, limit: usize) -> StorageResult<Vec<AuditRecord>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }

    async fn for_version(&self, key: &VersionKey) -> StorageResult<Vec<AuditRecord>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .rev()
            .filter(|r| r.event.key() == Some(key))
            .cloned()
            .collect())
    }
}

/// In-memory [`ObjectStore`] addressing blobs by digest.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_artifact(&self, data: &[u8]) -> StorageResult<(String, ArtifactDigest)> {
        let digest = ArtifactDigest::from_bytes(data);
        let uri = format!("mem://artifacts/{digest}");
        let mut blobs = self.blobs.lock().unwrap();
        blobs.insert(uri.clone(), data.to_vec());
        Ok((uri, digest))
    }

    async fn get_artifact(&self, uri: &str) -> StorageResult<Vec<u8>> {
        let blobs = self.blobs.lock().unwrap();
        blobs
            .get(uri)
            .cloned()
            .ok_or_else(|| StorageError::ArtifactNotFound {
                uri: uri.to_string(),
            })
    }
}

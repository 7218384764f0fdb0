//! Registration surface: schema-checked intake of new model versions and
//! read access to the version catalog.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use drydock_state::{
    ArtifactDigest, LifecycleState, ModelVersionRecord, VersionKey, VersionStore,
};

use crate::error::{DrydockError, DrydockResult};

/// Metadata keys every registered version must carry with a non-empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSchema {
    #[serde(default)]
    pub required: Vec<String>,
}

impl MetadataSchema {
    pub fn require(keys: &[&str]) -> Self {
        MetadataSchema {
            required: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    fn check(&self, metadata: &BTreeMap<String, String>) -> Result<(), String> {
        for key in &self.required {
            match metadata.get(key) {
                Some(value) if !value.trim().is_empty() => {}
                Some(_) => return Err(format!("metadata key '{key}' is empty")),
                None => return Err(format!("metadata key '{key}' is missing")),
            }
        }
        Ok(())
    }
}

/// Catalog API over the version store. All writes beyond registration go
/// through the promotion orchestrator.
pub struct RegistryApi {
    versions: Arc<dyn VersionStore>,
    schema: MetadataSchema,
}

impl RegistryApi {
    pub fn new(versions: Arc<dyn VersionStore>, schema: MetadataSchema) -> Self {
        RegistryApi { versions, schema }
    }

    /// Admit a new version in the `uploaded` state.
    #[instrument(skip_all, fields(model = model_name, version))]
    pub async fn register(
        &self,
        model_name: &str,
        version: &str,
        artifact_uri: String,
        artifact_digest: ArtifactDigest,
        metadata: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> DrydockResult<ModelVersionRecord> {
        if model_name.trim().is_empty() {
            return Err(DrydockError::SchemaInvalid {
                detail: "model name is empty".to_string(),
            });
        }
        if model_name.contains('@') {
            return Err(DrydockError::SchemaInvalid {
                detail: "model name may not contain '@'".to_string(),
            });
        }
        if version.trim().is_empty() {
            return Err(DrydockError::SchemaInvalid {
                detail: "version is empty".to_string(),
            });
        }
        self.schema
            .check(&metadata)
            .map_err(|detail| DrydockError::SchemaInvalid { detail })?;

        let record = ModelVersionRecord::new(
            VersionKey::new(model_name, version),
            artifact_uri,
            artifact_digest,
            metadata,
            now,
        );
        let record = self.versions.register(record).await?;
        info!(key = %record.key, digest = record.artifact_digest.short(), "version registered");
        Ok(record)
    }

    pub async fn get(&self, key: &VersionKey) -> DrydockResult<ModelVersionRecord> {
        Ok(self.versions.get(key).await?)
    }

    pub async fn active_version(
        &self,
        model_name: &str,
    ) -> DrydockResult<Option<ModelVersionRecord>> {
        Ok(self.versions.active_version(model_name).await?)
    }

    pub async fn list_versions(&self, model_name: &str) -> DrydockResult<Vec<ModelVersionRecord>> {
        Ok(self.versions.list_versions(model_name).await?)
    }

    /// Versions that are neither terminal nor active.
    pub async fn list_in_flight(&self) -> DrydockResult<Vec<ModelVersionRecord>> {
        Ok(self.versions.list_in_flight().await?)
    }

    pub fn schema(&self) -> &MetadataSchema {
        &self.schema
    }
}

/// True when the version's metadata marks it critical.
pub fn is_critical(record: &ModelVersionRecord) -> bool {
    record
        .metadata
        .get(crate::policy::CRITICAL_METADATA_KEY)
        .is_some_and(|v| v == "true")
}

/// Convenience predicate used by operators listing the catalog.
pub fn is_settled(record: &ModelVersionRecord) -> bool {
    record.state.is_terminal() || record.state == LifecycleState::Active
}

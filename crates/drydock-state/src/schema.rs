//! SurrealDB table schema: row structs and initialization DDL.
//!
//! Tables:
//! - versions: registered model versions and their lifecycle state
//! - approvals: suspended transitions awaiting human decisions
//! - audit_log: append-only ledger of promotion decisions
//!
//! Rows convert to/from the `store` contract types at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::store::{
    ApprovalId, ApprovalRecord, ArtifactDigest, AuditRecord, LifecycleState, ModelVersionRecord,
    StorageResult, VersionKey,
};
use crate::Result;

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

pub(crate) fn backend(err: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(err.to_string())
}

pub(crate) fn parse_state(s: &str) -> StorageResult<LifecycleState> {
    LifecycleState::parse(s).ok_or_else(|| StorageError::Backend(format!("unknown state: {s}")))
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// Row in the `versions` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRow {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    pub model_name: String,
    pub version: String,
    pub artifact_uri: String,
    /// SHA256 hex digest of the artifact
    pub artifact_digest: String,
    /// Arbitrary key/value metadata (JSON object)
    pub metadata: serde_json::Value,
    /// Lifecycle state name, see `LifecycleState::as_str`
    pub state: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub state_updated_at: DateTime<Utc>,
}

impl VersionRow {
    pub fn from_record(record: &ModelVersionRecord) -> StorageResult<Self> {
        Ok(VersionRow {
            id: None,
            model_name: record.key.model_name.clone(),
            version: record.key.version.clone(),
            artifact_uri: record.artifact_uri.clone(),
            artifact_digest: record.artifact_digest.as_str().to_string(),
            metadata: serde_json::to_value(&record.metadata).map_err(backend)?,
            state: record.state.as_str().to_string(),
            created_at: record.created_at,
            state_updated_at: record.state_updated_at,
        })
    }

    pub fn into_record(self) -> StorageResult<ModelVersionRecord> {
        Ok(ModelVersionRecord {
            key: VersionKey::new(self.model_name, self.version),
            artifact_uri: self.artifact_uri,
            artifact_digest: ArtifactDigest::try_from(self.artifact_digest)?,
            metadata: serde_json::from_value(self.metadata).map_err(backend)?,
            state: parse_state(&self.state)?,
            created_at: self.created_at,
            state_updated_at: self.state_updated_at,
        })
    }
}

/// Row in the `approvals` table.
///
/// `model_name`, `version` and `is_open` are denormalized out of the
/// transition for indexed lookups; `transition`, `kind` and `status` hold
/// the full contract types as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRow {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    pub request_id: String,
    pub model_name: String,
    pub version: String,
    pub transition: serde_json::Value,
    pub kind: serde_json::Value,
    pub reason: String,
    pub is_open: bool,
    pub status: serde_json::Value,
    pub resolved_by: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRow {
    pub fn from_record(record: &ApprovalRecord) -> StorageResult<Self> {
        Ok(ApprovalRow {
            id: None,
            request_id: record.request_id.0.clone(),
            model_name: record.transition.key.model_name.clone(),
            version: record.transition.key.version.clone(),
            transition: serde_json::to_value(&record.transition).map_err(backend)?,
            kind: serde_json::to_value(&record.kind).map_err(backend)?,
            reason: record.reason.clone(),
            is_open: !record.status.is_terminal(),
            status: serde_json::to_value(&record.status).map_err(backend)?,
            resolved_by: record.resolved_by.clone(),
            created_at: record.created_at,
            expires_at: record.expires_at,
            resolved_at: record.resolved_at,
        })
    }

    pub fn into_record(self) -> StorageResult<ApprovalRecord> {
        Ok(ApprovalRecord {
            request_id: ApprovalId(self.request_id),
            transition: serde_json::from_value(self.transition).map_err(backend)?,
            kind: serde_json::from_value(self.kind).map_err(backend)?,
            reason: self.reason,
            created_at: self.created_at,
            expires_at: self.expires_at,
            status: serde_json::from_value(self.status).map_err(backend)?,
            resolved_by: self.resolved_by,
            resolved_at: self.resolved_at,
        })
    }
}

/// Row in the `audit_log` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRow {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    pub audit_id: String,
    /// Denormalized version key for indexed lookups; absent for events that
    /// concern no single version (e.g. policy reloads).
    pub model_name: Option<String>,
    pub version: Option<String>,
    pub event: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub recorded_at: DateTime<Utc>,
}

impl AuditRow {
    pub fn from_record(record: &AuditRecord) -> StorageResult<Self> {
        let key = record.event.key();
        Ok(AuditRow {
            id: None,
            audit_id: record.audit_id.clone(),
            model_name: key.map(|k| k.model_name.clone()),
            version: key.map(|k| k.version.clone()),
            event: serde_json::to_value(&record.event).map_err(backend)?,
            recorded_at: record.recorded_at,
        })
    }

    pub fn into_record(self) -> StorageResult<AuditRecord> {
        Ok(AuditRecord {
            audit_id: self.audit_id,
            recorded_at: self.recorded_at,
            event: serde_json::from_value(self.event).map_err(backend)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Schema initialization
// ---------------------------------------------------------------------------

/// Initialize all Drydock tables in SurrealDB.
///
/// Called once per connection. Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Drydock SurrealDB schema");

    init_versions_table(db).await?;
    init_approvals_table(db).await?;
    init_audit_table(db).await?;

    info!("Drydock schema initialization complete");
    Ok(())
}

/// Initialize `versions` table.
///
/// Constraints:
/// - `(model_name, version)` is unique; registration is first-write-wins
/// - rows are never deleted; retirement is a state, not a removal
/// - state transitions are enforced via app logic (compare-and-set)
async fn init_versions_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing versions table");

    let sql = r#"
        DEFINE TABLE versions
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete NONE;

        -- One row per (model_name, version); duplicates rejected
        DEFINE INDEX idx_versions_key ON TABLE versions COLUMNS model_name, version UNIQUE;

        -- Index model_name for history listings
        DEFINE INDEX idx_versions_model ON TABLE versions COLUMNS model_name;

        -- Composite index (model_name, state) for active-version lookups
        DEFINE INDEX idx_versions_model_state ON TABLE versions COLUMNS model_name, state;

        -- Index state for in-flight scans at daemon startup
        DEFINE INDEX idx_versions_state ON TABLE versions COLUMNS state;
    "#;

    db.query(sql).await?;
    info!("✓ versions table initialized");
    Ok(())
}

/// Initialize `approvals` table.
///
/// Constraints:
/// - `request_id` is unique
/// - resolution is exactly-once (enforced via app logic on `is_open`)
async fn init_approvals_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing approvals table");

    let sql = r#"
        DEFINE TABLE approvals
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete NONE;

        -- Ensure request_id is unique
        DEFINE INDEX idx_approvals_request_id ON TABLE approvals COLUMNS request_id UNIQUE;

        -- Index open requests, the common query
        DEFINE INDEX idx_approvals_open ON TABLE approvals COLUMNS is_open;

        -- Composite index for per-version open requests
        DEFINE INDEX idx_approvals_version ON TABLE approvals COLUMNS model_name, version, is_open;
    "#;

    db.query(sql).await?;
    info!("✓ approvals table initialized");
    Ok(())
}

/// Initialize `audit_log` table.
///
/// Constraints:
/// - append-only: updates and deletes are denied at the database level
async fn init_audit_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing audit_log table");

    let sql = r#"
        DEFINE TABLE audit_log
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update NONE
                FOR delete NONE;

        -- Ensure audit_id is unique
        DEFINE INDEX idx_audit_id ON TABLE audit_log COLUMNS audit_id UNIQUE;

        -- Index recorded_at for recency queries
        DEFINE INDEX idx_audit_recorded_at ON TABLE audit_log COLUMNS recorded_at;

        -- Composite index for per-version trails
        DEFINE INDEX idx_audit_version ON TABLE audit_log COLUMNS model_name, version;
    "#;

    db.query(sql).await?;
    info!("✓ audit_log table initialized");
    Ok(())
}

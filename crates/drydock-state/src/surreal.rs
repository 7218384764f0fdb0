//! SurrealDB-backed implementation of the storage contracts.
//!
//! One [`SurrealStore`] implements [`VersionStore`], [`ApprovalStore`] and
//! [`AuditLog`] over three tables. Rows convert through [`crate::schema`]
//! types at the boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::{StateError, StorageError};
use crate::schema::{self, backend, parse_state, ApprovalRow, AuditRow, VersionRow};
use crate::store::{
    ApprovalId, ApprovalRecord, ApprovalStatus, ApprovalStore, AuditEvent, AuditLog, AuditRecord,
    LifecycleState, ModelVersionRecord, StorageResult, SwapOutcome, VersionKey, VersionStore,
};

/// Cloud deployment configuration read from environment variables.
#[derive(Debug, Clone)]
struct CloudConfig {
    endpoint: String,
    username: String,
    password: String,
    namespace: String,
    database: String,
    is_root: bool,
}

impl CloudConfig {
    /// Requires `SURREALDB_ENDPOINT`, `SURREALDB_USERNAME` and
    /// `SURREALDB_PASSWORD`; namespace and database default to
    /// `drydock`/`main`.
    fn from_env() -> Result<Self, std::env::VarError> {
        Ok(CloudConfig {
            endpoint: std::env::var("SURREALDB_ENDPOINT")?,
            username: std::env::var("SURREALDB_USERNAME")?,
            password: std::env::var("SURREALDB_PASSWORD")?,
            namespace: std::env::var("SURREALDB_NAMESPACE")
                .unwrap_or_else(|_| "drydock".to_string()),
            database: std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| "main".to_string()),
            is_root: std::env::var("SURREALDB_ROOT").map(|v| v == "true").unwrap_or(false),
        })
    }
}

/// SurrealDB-backed registry, approval queue and audit ledger.
pub struct SurrealStore {
    db: Surreal<Any>,
    /// Serializes state writes so the activation swap never interleaves
    /// with a compare-and-set on the same model. The registry is the sole
    /// state writer, so an in-process lock is sufficient.
    swap_lock: Mutex<()>,
}

impl SurrealStore {
    /// In-memory instance for tests and local experiments.
    ///
    /// Connects to `mem://`, selects `drydock/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        let store = Self::connect("mem://", "drydock", "main").await?;
        info!("SurrealStore connected (in-memory)");
        Ok(store)
    }

    /// Create from environment variables.
    ///
    /// Order: cloud config (`SURREALDB_ENDPOINT` + credentials), then
    /// `SURREALDB_URL`, then local SurrealKV persistence under `.drydock/db`.
    pub async fn from_env() -> crate::Result<Self> {
        if let Ok(config) = CloudConfig::from_env() {
            let db = surrealdb::engine::any::connect(&config.endpoint)
                .await
                .map_err(|e| StateError::Connection(e.to_string()))?;

            if config.is_root {
                db.signin(Root {
                    username: &config.username,
                    password: &config.password,
                })
                .await
                .map_err(|e| StateError::Connection(format!("Root auth failed: {e}")))?;
            } else {
                db.signin(Database {
                    namespace: &config.namespace,
                    database: &config.database,
                    username: &config.username,
                    password: &config.password,
                })
                .await
                .map_err(|e| StateError::Connection(format!("DB auth failed: {e}")))?;
            }

            db.use_ns(&config.namespace)
                .use_db(&config.database)
                .await
                .map_err(|e| StateError::Connection(e.to_string()))?;

            schema::init_schema(&db).await?;
            info!("SurrealStore connected (cloud)");
            return Ok(Self {
                db,
                swap_lock: Mutex::new(()),
            });
        }

        if let Ok(url) = std::env::var("SURREALDB_URL") {
            let store = Self::connect(&url, "drydock", "main").await?;
            info!("SurrealStore connected ({})", url);
            return Ok(store);
        }

        // Default to local persistence in .drydock/db
        let path = ".drydock/db";
        std::fs::create_dir_all(path).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                path, e
            ))
        })?;
        let url = format!("surrealkv://{}", path);
        info!(
            "No cloud config or SURREALDB_URL found, using local persistence: {}",
            url
        );
        Self::connect(&url, "drydock", "main").await
    }

    async fn connect(endpoint: &str, ns: &str, dbname: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(endpoint)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {endpoint}: {e}")))?;

        db.use_ns(ns)
            .use_db(dbname)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        schema::init_schema(&db).await?;
        Ok(Self {
            db,
            swap_lock: Mutex::new(()),
        })
    }

    // -- private helpers -----------------------------------------------------

    /// Fetch a version row by key, or None.
    async fn fetch_version(&self, key: &VersionKey) -> StorageResult<Option<VersionRow>> {
        let mut res = self
            .db
            .query("SELECT * FROM versions WHERE model_name = $model AND version = $version")
            .bind(("model", key.model_name.clone()))
            .bind(("version", key.version.clone()))
            .await
            .map_err(backend)?;

        let rows: Vec<VersionRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next())
    }

    /// Fetch the active row for a model, excluding `except` if given.
    async fn fetch_active(
        &self,
        model_name: &str,
        except: Option<&VersionKey>,
    ) -> StorageResult<Option<VersionRow>> {
        let mut res = self
            .db
            .query("SELECT * FROM versions WHERE model_name = $model AND state = 'active'")
            .bind(("model", model_name.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<VersionRow> = res.take(0).map_err(backend)?;
        Ok(rows
            .into_iter()
            .find(|r| except.is_none_or(|k| r.version != k.version)))
    }

    async fn fetch_approval(&self, request_id: &ApprovalId) -> StorageResult<Option<ApprovalRow>> {
        let mut res = self
            .db
            .query("SELECT * FROM approvals WHERE request_id = $rid")
            .bind(("rid", request_id.0.clone()))
            .await
            .map_err(backend)?;

        let rows: Vec<ApprovalRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next())
    }

    fn rows_to_records(rows: Vec<VersionRow>) -> StorageResult<Vec<ModelVersionRecord>> {
        rows.into_iter().map(VersionRow::into_record).collect()
    }
}

#[async_trait]
impl VersionStore for SurrealStore {
    #[instrument(skip_all, fields(key = %record.key))]
    async fn register(&self, record: ModelVersionRecord) -> StorageResult<ModelVersionRecord> {
        if self.fetch_version(&record.key).await?.is_some() {
            return Err(StorageError::DuplicateVersion { key: record.key });
        }

        debug!("registering version");
        let row = VersionRow::from_record(&record)?;
        let _created: Option<VersionRow> = self
            .db
            .create("versions")
            .content(row)
            .await
            .map_err(backend)?;

        Ok(record)
    }

    async fn get(&self, key: &VersionKey) -> StorageResult<ModelVersionRecord> {
        let row = self
            .fetch_version(key)
            .await?
            .ok_or_else(|| StorageError::VersionNotFound { key: key.clone() })?;
        row.into_record()
    }

    #[instrument(skip_all, fields(key = %key, expected = %expected, next = %next))]
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

        let _guard = self.swap_lock.lock().await;

        // Conditional update: only the writer whose expectation still holds
        // touches the row.
        let mut res = self
            .db
            .query(
                "UPDATE versions SET state = $next, state_updated_at = $at \
                 WHERE model_name = $model AND version = $version AND state = $expected \
                 RETURN AFTER",
            )
            .bind(("model", key.model_name.clone()))
            .bind(("version", key.version.clone()))
            .bind(("expected", expected.as_str().to_string()))
            .bind(("next", next.as_str().to_string()))
            .bind(("at", SurrealDatetime::from(at)))
            .await
            .map_err(backend)?;

        let rows: Vec<VersionRow> = res.take(0).map_err(backend)?;
        match rows.into_iter().next() {
            Some(row) => row.into_record(),
            None => {
                // Nothing matched: either the version is unknown or another
                // writer got there first.
                let actual = self
                    .fetch_version(key)
                    .await?
                    .ok_or_else(|| StorageError::VersionNotFound { key: key.clone() })?;
                Err(StorageError::StaleTransition {
                    key: key.clone(),
                    expected,
                    actual: parse_state(&actual.state)?,
                })
            }
        }
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn activate(&self, key: &VersionKey, at: DateTime<Utc>) -> StorageResult<SwapOutcome> {
        let _guard = self.swap_lock.lock().await;

        let candidate = self
            .fetch_version(key)
            .await?
            .ok_or_else(|| StorageError::VersionNotFound { key: key.clone() })?;
        let candidate_state = parse_state(&candidate.state)?;
        if candidate_state != LifecycleState::Promoting {
            return Err(StorageError::StaleTransition {
                key: key.clone(),
                expected: LifecycleState::Promoting,
                actual: candidate_state,
            });
        }

        let prior = self.fetch_active(&key.model_name, Some(key)).await?;

        // Retire the previous holder and activate the candidate in one
        // transaction so no reader sees the swap half done.
        self.db
            .query(
                "BEGIN TRANSACTION; \
                 UPDATE versions SET state = 'retired', state_updated_at = $at \
                   WHERE model_name = $model AND state = 'active' AND version != $version; \
                 UPDATE versions SET state = 'active', state_updated_at = $at \
                   WHERE model_name = $model AND version = $version AND state = 'promoting'; \
                 COMMIT TRANSACTION;",
            )
            .bind(("model", key.model_name.clone()))
            .bind(("version", key.version.clone()))
            .bind(("at", SurrealDatetime::from(at)))
            .await
            .map_err(backend)?;

        let activated = self
            .fetch_version(key)
            .await?
            .ok_or_else(|| StorageError::VersionNotFound { key: key.clone() })?
            .into_record()?;
        if activated.state != LifecycleState::Active {
            return Err(StorageError::Backend(format!(
                "activation swap for {key} did not commit"
            )));
        }

        info!(key = %key, "version activated");
        Ok(SwapOutcome {
            activated,
            retired: prior.map(|r| VersionKey::new(r.model_name, r.version)),
        })
    }

    async fn active_version(
        &self,
        model_name: &str,
    ) -> StorageResult<Option<ModelVersionRecord>> {
        let row = self.fetch_active(model_name, None).await?;
        row.map(VersionRow::into_record).transpose()
    }

    async fn list_versions(&self, model_name: &str) -> StorageResult<Vec<ModelVersionRecord>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM versions WHERE model_name = $model \
                 ORDER BY created_at ASC, version ASC",
            )
            .bind(("model", model_name.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<VersionRow> = res.take(0).map_err(backend)?;
        Self::rows_to_records(rows)
    }

    async fn list_in_flight(&self) -> StorageResult<Vec<ModelVersionRecord>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM versions \
                 WHERE state IN ['uploaded', 'validating', 'validated', 'canary', 'promoting'] \
                 ORDER BY model_name ASC, version ASC",
            )
            .await
            .map_err(backend)?;

        let rows: Vec<VersionRow> = res.take(0).map_err(backend)?;
        Self::rows_to_records(rows)
    }
}

#[async_trait]
impl ApprovalStore for SurrealStore {
    #[instrument(skip_all, fields(request_id = %record.request_id))]
    async fn create(&self, record: ApprovalRecord) -> StorageResult<ApprovalRecord> {
        let row = ApprovalRow::from_record(&record)?;
        let _created: Option<ApprovalRow> = self
            .db
            .create("approvals")
            .content(row)
            .await
            .map_err(backend)?;
        Ok(record)
    }

    async fn get(&self, request_id: &ApprovalId) -> StorageResult<ApprovalRecord> {
        let row = self
            .fetch_approval(request_id)
            .await?
            .ok_or_else(|| StorageError::ApprovalNotFound {
                request_id: request_id.0.clone(),
            })?;
        row.into_record()
    }

    #[instrument(skip_all, fields(request_id = %request_id))]
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

        let row = self
            .fetch_approval(request_id)
            .await?
            .ok_or_else(|| StorageError::ApprovalNotFound {
                request_id: request_id.0.clone(),
            })?;
        if !row.is_open {
            return Err(StorageError::ApprovalAlreadyResolved {
                request_id: request_id.0.clone(),
            });
        }

        // Mutate the fetched row so its record id is preserved in CONTENT.
        let mut updated = row;
        updated.is_open = false;
        updated.status = serde_json::to_value(&status).map_err(backend)?;
        updated.resolved_by = Some(resolved_by.to_string());
        updated.resolved_at = Some(at);
        let record = updated.clone().into_record()?;

        self.db
            .query("UPDATE approvals CONTENT $row WHERE request_id = $rid")
            .bind(("row", updated))
            .bind(("rid", request_id.0.clone()))
            .await
            .map_err(backend)?;

        Ok(record)
    }

    async fn list_open(&self) -> StorageResult<Vec<ApprovalRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM approvals WHERE is_open = true ORDER BY created_at ASC")
            .await
            .map_err(backend)?;

        let rows: Vec<ApprovalRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(ApprovalRow::into_record).collect()
    }

    async fn open_for(&self, key: &VersionKey) -> StorageResult<Vec<ApprovalRecord>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM approvals \
                 WHERE is_open = true AND model_name = $model AND version = $version \
                 ORDER BY created_at ASC",
            )
            .bind(("model", key.model_name.clone()))
            .bind(("version", key.version.clone()))
            .await
            .map_err(backend)?;

        let rows: Vec<ApprovalRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(ApprovalRow::into_record).collect()
    }
}

#[async_trait]
impl AuditLog for SurrealStore {
    async fn append(&self, event: AuditEvent, at: DateTime<Utc>) -> StorageResult<AuditRecord> {
        let record = AuditRecord::new(event, at);
        let row = AuditRow::from_record(&record)?;
        let _created: Option<AuditRow> = self
            .db
            .create("audit_log")
            .content(row)
            .await
            .map_err(backend)?;
        Ok(record)
    }

    async fn recent(&self, limit: usize) -> StorageResult<Vec<AuditRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM audit_log ORDER BY recorded_at DESC LIMIT $limit")
            .bind(("limit", limit as i64))
            .await
            .map_err(backend)?;

        let rows: Vec<AuditRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(AuditRow::into_record).collect()
    }

    async fn for_version(&self, key: &VersionKey) -> StorageResult<Vec<AuditRecord>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM audit_log \
                 WHERE model_name = $model AND version = $version \
                 ORDER BY recorded_at DESC",
            )
            .bind(("model", key.model_name.clone()))
            .bind(("version", key.version.clone()))
            .await
            .map_err(backend)?;

        let rows: Vec<AuditRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(AuditRow::into_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ApprovalKind, ArtifactDigest, Requester, Transition};
    use std::collections::BTreeMap;

    async fn setup_store() -> SurrealStore {
        SurrealStore::in_memory().await.unwrap()
    }

    fn make_record(model: &str, version: &str) -> ModelVersionRecord {
        let mut metadata = BTreeMap::new();
        metadata.insert("framework".to_string(), "onnx".to_string());
        ModelVersionRecord::new(
            VersionKey::new(model, version),
            format!("file:///tmp/{model}-{version}"),
            ArtifactDigest::from_bytes(version.as_bytes()),
            metadata,
            Utc::now(),
        )
    }

    async fn walk_to(store: &SurrealStore, key: &VersionKey, path: &[LifecycleState]) {
        let mut current = VersionStore::get(store, key).await.unwrap().state;
        for next in path {
            store
                .compare_and_set_state(key, current, *next, Utc::now())
                .await
                .unwrap();
            current = *next;
        }
    }

    #[tokio::test]
    async fn register_and_get_roundtrip() {
        let store = setup_store().await;
        let record = make_record("vision-ranker", "2.1.0");
        store.register(record.clone()).await.unwrap();

        let got = VersionStore::get(&store, &record.key).await.unwrap();
        assert_eq!(got.key, record.key);
        assert_eq!(got.artifact_digest, record.artifact_digest);
        assert_eq!(got.metadata, record.metadata);
        assert_eq!(got.state, LifecycleState::Uploaded);
    }

    #[tokio::test]
    async fn register_rejects_duplicates() {
        let store = setup_store().await;
        store.register(make_record("m", "1.0.0")).await.unwrap();
        let err = store.register(make_record("m", "1.0.0")).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateVersion { .. }));
    }

    #[tokio::test]
    async fn cas_single_winner() {
        let store = setup_store().await;
        let key = VersionKey::new("m", "1.0.0");
        store.register(make_record("m", "1.0.0")).await.unwrap();

        store
            .compare_and_set_state(
                &key,
                LifecycleState::Uploaded,
                LifecycleState::Validating,
                Utc::now(),
            )
            .await
            .unwrap();

        let err = store
            .compare_and_set_state(
                &key,
                LifecycleState::Uploaded,
                LifecycleState::Validating,
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::StaleTransition { .. }));
    }

    #[tokio::test]
    async fn cas_unknown_version() {
        let store = setup_store().await;
        let err = store
            .compare_and_set_state(
                &VersionKey::new("ghost", "1"),
                LifecycleState::Uploaded,
                LifecycleState::Validating,
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::VersionNotFound { .. }));
    }

    #[tokio::test]
    async fn activate_swaps_and_retires_prior() {
        let store = setup_store().await;
        store.register(make_record("m", "1.0.0")).await.unwrap();
        store.register(make_record("m", "2.0.0")).await.unwrap();

        use LifecycleState::*;
        let v1 = VersionKey::new("m", "1.0.0");
        let v2 = VersionKey::new("m", "2.0.0");

        walk_to(&store, &v1, &[Validating, Validated, Canary, Promoting]).await;
        let first = store.activate(&v1, Utc::now()).await.unwrap();
        assert_eq!(first.retired, None);

        walk_to(&store, &v2, &[Validating, Validated, Canary, Promoting]).await;
        let second = store.activate(&v2, Utc::now()).await.unwrap();
        assert_eq!(second.retired, Some(v1.clone()));

        assert_eq!(VersionStore::get(&store, &v1).await.unwrap().state, Retired);
        assert_eq!(VersionStore::get(&store, &v2).await.unwrap().state, Active);
        let active = store.active_version("m").await.unwrap().unwrap();
        assert_eq!(active.key, v2);
    }

    #[tokio::test]
    async fn activate_requires_promoting() {
        let store = setup_store().await;
        store.register(make_record("m", "1.0.0")).await.unwrap();
        let err = store
            .activate(&VersionKey::new("m", "1.0.0"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::StaleTransition {
                expected: LifecycleState::Promoting,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn list_in_flight_after_settling() {
        let store = setup_store().await;
        store.register(make_record("a", "1")).await.unwrap();
        store.register(make_record("b", "1")).await.unwrap();

        use LifecycleState::*;
        let b = VersionKey::new("b", "1");
        walk_to(&store, &b, &[Validating, Validated, Canary, Promoting]).await;
        store.activate(&b, Utc::now()).await.unwrap();

        let in_flight = store.list_in_flight().await.unwrap();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].key.model_name, "a");
    }

    fn make_approval(model: &str) -> ApprovalRecord {
        let now = Utc::now();
        ApprovalRecord::new(
            Transition::new(
                VersionKey::new(model, "1.0.0"),
                LifecycleState::Canary,
                LifecycleState::Promoting,
                Requester::CanaryController,
                now,
            ),
            ApprovalKind::PolicyGate,
            "promotion requires review",
            Some(3600),
            now,
        )
    }

    #[tokio::test]
    async fn approval_lifecycle_exactly_once() {
        let store = setup_store().await;
        let record = store.create(make_approval("m")).await.unwrap();

        let open = store.list_open().await.unwrap();
        assert_eq!(open.len(), 1);

        let resolved = store
            .resolve(
                &record.request_id,
                ApprovalStatus::Approved,
                "operator:ines",
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("operator:ines"));

        let err = store
            .resolve(
                &record.request_id,
                ApprovalStatus::Expired,
                "expiry-sweep",
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ApprovalAlreadyResolved { .. }));
        assert!(store.list_open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_for_filters_by_version() {
        let store = setup_store().await;
        store.create(make_approval("m")).await.unwrap();
        store.create(make_approval("other")).await.unwrap();

        let open = store.open_for(&VersionKey::new("m", "1.0.0")).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].transition.key.model_name, "m");
    }

    #[tokio::test]
    async fn audit_recent_newest_first() {
        let store = setup_store().await;
        let key = VersionKey::new("m", "1.0.0");
        let base = Utc::now();
        for (i, state) in [LifecycleState::Validating, LifecycleState::Validated]
            .into_iter()
            .enumerate()
        {
            store
                .append(
                    AuditEvent::TransitionCommitted {
                        key: key.clone(),
                        from: LifecycleState::Uploaded,
                        to: state,
                        requester: Requester::ValidationGate,
                    },
                    base + chrono::Duration::seconds(i as i64),
                )
                .await
                .unwrap();
        }

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        match &recent[0].event {
            AuditEvent::TransitionCommitted { to, .. } => {
                assert_eq!(*to, LifecycleState::Validated)
            }
            other => panic!("unexpected event {other:?}"),
        }

        let trail = store.for_version(&key).await.unwrap();
        assert_eq!(trail.len(), 2);
    }
}

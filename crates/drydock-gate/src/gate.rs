//! Check execution against one model version.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use drydock_state::{ArtifactDigest, ModelVersionRecord, ObjectStore, VersionKey};

use crate::check::{CheckConfig, CheckKind};
use crate::harness::SmokeHarness;

/// Result of a single validation check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    /// Name of the check that ran.
    pub name: String,

    /// Whether the check passed.
    pub passed: bool,

    /// What the check found, pass or fail.
    pub detail: String,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// Result of a complete validation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// The version that was validated.
    pub key: VersionKey,

    /// Whether every enabled check passed.
    pub passed: bool,

    /// Outcomes of individual checks, in configured order.
    pub checks: Vec<CheckOutcome>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl ValidationReport {
    /// Number of checks that passed.
    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    /// Number of checks that failed.
    pub fn failed_count(&self) -> usize {
        self.checks.iter().filter(|c| !c.passed).count()
    }

    /// Names of the checks that failed, in configured order.
    pub fn failed_names(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.clone())
            .collect()
    }
}

/// Runs the configured check sequence against candidate versions.
pub struct ValidationGate {
    objects: Arc<dyn ObjectStore>,
    harness: Arc<dyn SmokeHarness>,
    checks: Vec<CheckConfig>,
}

impl ValidationGate {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        harness: Arc<dyn SmokeHarness>,
        checks: Vec<CheckConfig>,
    ) -> Self {
        ValidationGate {
            objects,
            harness,
            checks,
        }
    }

    pub fn checks(&self) -> &[CheckConfig] {
        &self.checks
    }

    /// Run every enabled check against `record`.
    ///
    /// Checks never short-circuit: a failed check is recorded and the rest
    /// still run, so the report names everything wrong with the version.
    /// Collaborator errors (a missing artifact, a crashed harness) fail the
    /// owning check rather than aborting the run.
    #[instrument(skip_all, fields(key = %record.key))]
    pub async fn validate(&self, record: &ModelVersionRecord) -> ValidationReport {
        let start = Instant::now();
        let mut outcomes = Vec::new();
        let mut all_passed = true;

        for config in &self.checks {
            if !config.enabled {
                info!(check = %config.name, "skipping disabled check");
                continue;
            }

            let outcome = self.run_check(config, record).await;
            if outcome.passed {
                info!(check = %outcome.name, duration_ms = outcome.duration_ms, "check passed");
            } else {
                all_passed = false;
                warn!(check = %outcome.name, detail = %outcome.detail, "check failed");
            }
            outcomes.push(outcome);
        }

        ValidationReport {
            key: record.key.clone(),
            passed: all_passed,
            checks: outcomes,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn run_check(&self, config: &CheckConfig, record: &ModelVersionRecord) -> CheckOutcome {
        let start = Instant::now();
        let deadline = Duration::from_secs(config.timeout_secs);

        let run = self.run_kind(&config.kind, record);
        let result = match tokio::time::timeout(deadline, run).await {
            Ok(result) => result,
            Err(_) => Err(format!("timed out after {}s", config.timeout_secs)),
        };

        let (passed, detail) = match result {
            Ok(detail) => (true, detail),
            Err(detail) => (false, detail),
        };

        CheckOutcome {
            name: config.name.clone(),
            passed,
            detail,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn run_kind(
        &self,
        kind: &CheckKind,
        record: &ModelVersionRecord,
    ) -> Result<String, String> {
        match kind {
            CheckKind::SchemaConformance { required_keys } => check_schema(required_keys, record),
            CheckKind::ArtifactIntegrity => self.check_integrity(record).await,
            CheckKind::SmokeInference { sample } => self.check_smoke(sample, record).await,
        }
    }

    async fn check_integrity(&self, record: &ModelVersionRecord) -> Result<String, String> {
        let bytes = self
            .objects
            .get_artifact(&record.artifact_uri)
            .await
            .map_err(|e| format!("artifact fetch failed: {e}"))?;

        let computed = ArtifactDigest::from_bytes(&bytes);
        if computed == record.artifact_digest {
            Ok(format!(
                "{} bytes match digest {}",
                bytes.len(),
                computed.short()
            ))
        } else {
            Err(format!(
                "digest mismatch: registered {} but stored bytes hash to {}",
                record.artifact_digest.short(),
                computed.short()
            ))
        }
    }

    async fn check_smoke(
        &self,
        sample: &serde_json::Value,
        record: &ModelVersionRecord,
    ) -> Result<String, String> {
        let response = self
            .harness
            .infer(record, sample)
            .await
            .map_err(|e| format!("inference failed: {e}"))?;

        // A null response means the model produced no prediction.
        if response.is_null() {
            Err("inference returned null".to_string())
        } else {
            Ok("inference answered the held-out sample".to_string())
        }
    }
}

fn check_schema(required_keys: &[String], record: &ModelVersionRecord) -> Result<String, String> {
    let mut missing = Vec::new();
    let mut empty = Vec::new();

    for key in required_keys {
        match record.metadata.get(key) {
            None => missing.push(key.as_str()),
            Some(value) if value.trim().is_empty() => empty.push(key.as_str()),
            Some(_) => {}
        }
    }

    if missing.is_empty() && empty.is_empty() {
        Ok(format!("{} required keys present", required_keys.len()))
    } else {
        let mut problems = Vec::new();
        if !missing.is_empty() {
            problems.push(format!("missing keys: {}", missing.join(", ")));
        }
        if !empty.is_empty() {
            problems.push(format!("empty keys: {}", empty.join(", ")));
        }
        Err(problems.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::fakes::{HangingHarness, ScriptedHarness};
    use crate::harness::EchoHarness;
    use chrono::Utc;
    use drydock_state::fakes::MemoryObjectStore;
    use serde_json::json;
    use std::collections::BTreeMap;

    async fn stored_record(
        metadata: BTreeMap<String, String>,
    ) -> (Arc<MemoryObjectStore>, ModelVersionRecord) {
        let objects = Arc::new(MemoryObjectStore::new());
        let (uri, digest) = objects.put_artifact(b"model weights v1").await.unwrap();
        let record = ModelVersionRecord::new(
            VersionKey::new("ranker", "1.0.0"),
            uri,
            digest,
            metadata,
            Utc::now(),
        );
        (objects, record)
    }

    fn metadata(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_all_checks_pass() {
        let (objects, record) = stored_record(metadata(&[("team", "search")])).await;
        let gate = ValidationGate::new(
            objects,
            Arc::new(EchoHarness),
            CheckConfig::standard(vec!["team".to_string()], json!({"query": "beam"})),
        );

        let report = gate.validate(&record).await;
        assert!(report.passed);
        assert_eq!(report.passed_count(), 3);
        assert_eq!(report.failed_count(), 0);
        assert!(report.failed_names().is_empty());
    }

    #[tokio::test]
    async fn test_failed_check_does_not_short_circuit() {
        // Schema fails on the missing key; integrity and smoke still run.
        let (objects, record) = stored_record(BTreeMap::new()).await;
        let gate = ValidationGate::new(
            objects,
            Arc::new(EchoHarness),
            CheckConfig::standard(vec!["team".to_string()], json!({})),
        );

        let report = gate.validate(&record).await;
        assert!(!report.passed);
        assert_eq!(report.checks.len(), 3, "all checks should still run");
        assert_eq!(report.failed_names(), vec!["schema_conformance"]);
        assert!(report.checks[0].detail.contains("missing keys: team"));
        assert!(report.checks[1].passed);
        assert!(report.checks[2].passed);
    }

    #[tokio::test]
    async fn test_schema_rejects_empty_values() {
        let (objects, record) = stored_record(metadata(&[("team", "  ")])).await;
        let gate = ValidationGate::new(
            objects,
            Arc::new(EchoHarness),
            vec![CheckConfig::from_kind(
                CheckKind::SchemaConformance {
                    required_keys: vec!["team".to_string()],
                },
                30,
            )],
        );

        let report = gate.validate(&record).await;
        assert!(!report.passed);
        assert!(report.checks[0].detail.contains("empty keys: team"));
    }

    #[tokio::test]
    async fn test_integrity_catches_tampered_artifact() {
        let objects = Arc::new(MemoryObjectStore::new());
        let (uri, _) = objects.put_artifact(b"tampered bytes").await.unwrap();
        // Register the version with a digest that does not match the bytes.
        let record = ModelVersionRecord::new(
            VersionKey::new("ranker", "1.0.0"),
            uri,
            ArtifactDigest::from_bytes(b"the bytes we expected"),
            metadata(&[("team", "search")]),
            Utc::now(),
        );

        let gate = ValidationGate::new(
            objects,
            Arc::new(EchoHarness),
            vec![CheckConfig::from_kind(CheckKind::ArtifactIntegrity, 120)],
        );

        let report = gate.validate(&record).await;
        assert!(!report.passed);
        assert_eq!(report.failed_names(), vec!["artifact_integrity"]);
        assert!(report.checks[0].detail.contains("digest mismatch"));
    }

    #[tokio::test]
    async fn test_integrity_fails_when_artifact_is_gone() {
        let objects = Arc::new(MemoryObjectStore::new());
        let record = ModelVersionRecord::new(
            VersionKey::new("ranker", "1.0.0"),
            "mem://nowhere",
            ArtifactDigest::from_bytes(b"weights"),
            BTreeMap::new(),
            Utc::now(),
        );

        let gate = ValidationGate::new(
            objects,
            Arc::new(EchoHarness),
            vec![CheckConfig::from_kind(CheckKind::ArtifactIntegrity, 120)],
        );

        let report = gate.validate(&record).await;
        assert!(!report.passed);
        assert!(report.checks[0].detail.contains("artifact fetch failed"));
    }

    #[tokio::test]
    async fn test_smoke_failure_reported_with_harness_detail() {
        let (objects, record) = stored_record(metadata(&[("team", "search")])).await;
        let harness = Arc::new(ScriptedHarness::failing("model crashed on load"));
        let sample = json!({"query": "draft"});
        let gate = ValidationGate::new(
            objects,
            harness.clone(),
            vec![CheckConfig::from_kind(
                CheckKind::SmokeInference {
                    sample: sample.clone(),
                },
                60,
            )],
        );

        let report = gate.validate(&record).await;
        assert!(!report.passed);
        assert!(report.checks[0].detail.contains("model crashed on load"));
        assert_eq!(harness.samples(), vec![sample]);
    }

    #[tokio::test]
    async fn test_null_inference_fails_smoke() {
        let (objects, record) = stored_record(BTreeMap::new()).await;
        let gate = ValidationGate::new(
            objects,
            Arc::new(ScriptedHarness::answering(json!(null))),
            vec![CheckConfig::from_kind(
                CheckKind::SmokeInference { sample: json!({}) },
                60,
            )],
        );

        let report = gate.validate(&record).await;
        assert!(!report.passed);
        assert!(report.checks[0].detail.contains("null"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_harness_times_out_instead_of_blocking() {
        let (objects, record) = stored_record(BTreeMap::new()).await;
        let gate = ValidationGate::new(
            objects,
            Arc::new(HangingHarness),
            vec![CheckConfig::from_kind(
                CheckKind::SmokeInference { sample: json!({}) },
                5,
            )],
        );

        let report = gate.validate(&record).await;
        assert!(!report.passed);
        assert!(report.checks[0].detail.contains("timed out after 5s"));
    }

    #[tokio::test]
    async fn test_disabled_check_is_skipped() {
        let (objects, record) = stored_record(BTreeMap::new()).await;
        let gate = ValidationGate::new(
            objects,
            Arc::new(EchoHarness),
            vec![
                CheckConfig::from_kind(CheckKind::ArtifactIntegrity, 120),
                CheckConfig::from_kind(
                    CheckKind::SchemaConformance {
                        required_keys: vec!["team".to_string()],
                    },
                    30,
                )
                .disabled(),
            ],
        );

        let report = gate.validate(&record).await;
        assert!(report.passed, "disabled schema check must not run");
        assert_eq!(report.checks.len(), 1);
        assert_eq!(report.checks[0].name, "artifact_integrity");
    }
}

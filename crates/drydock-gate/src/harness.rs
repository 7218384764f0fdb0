//! The smoke-inference seam: running one prediction against a candidate
//! version without the gate knowing how models are served.

use async_trait::async_trait;
use tracing::info;

use drydock_state::ModelVersionRecord;

/// Runs a single inference against a candidate version. Errors are plain
/// strings because the gate folds them into the check report instead of
/// propagating them.
#[async_trait]
pub trait SmokeHarness: Send + Sync {
    /// Run `sample` through the version and return the model's response.
    async fn infer(
        &self,
        record: &ModelVersionRecord,
        sample: &serde_json::Value,
    ) -> Result<serde_json::Value, String>;
}

/// Harness that echoes the sample back. Stands in until a real inference
/// backend is wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHarness;

#[async_trait]
impl SmokeHarness for EchoHarness {
    async fn infer(
        &self,
        record: &ModelVersionRecord,
        sample: &serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        info!(key = %record.key, "echo inference");
        Ok(serde_json::json!({ "echo": sample }))
    }
}

/// Test doubles for the inference seam.
pub mod fakes {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use drydock_state::ModelVersionRecord;

    use super::SmokeHarness;

    /// Harness scripted with a fixed answer. Records the samples it was
    /// asked, so tests can assert the gate passed the configured one.
    #[derive(Debug)]
    pub struct ScriptedHarness {
        response: Result<serde_json::Value, String>,
        samples: Mutex<Vec<serde_json::Value>>,
    }

    impl ScriptedHarness {
        pub fn answering(value: serde_json::Value) -> Self {
            ScriptedHarness {
                response: Ok(value),
                samples: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(detail: impl Into<String>) -> Self {
            ScriptedHarness {
                response: Err(detail.into()),
                samples: Mutex::new(Vec::new()),
            }
        }

        pub fn samples(&self) -> Vec<serde_json::Value> {
            self.samples.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SmokeHarness for ScriptedHarness {
        async fn infer(
            &self,
            _record: &ModelVersionRecord,
            sample: &serde_json::Value,
        ) -> Result<serde_json::Value, String> {
            self.samples.lock().unwrap().push(sample.clone());
            self.response.clone()
        }
    }

    /// Harness that never answers. For exercising check timeouts.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct HangingHarness;

    #[async_trait]
    impl SmokeHarness for HangingHarness {
        async fn infer(
            &self,
            _record: &ModelVersionRecord,
            _sample: &serde_json::Value,
        ) -> Result<serde_json::Value, String> {
            std::future::pending().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::ScriptedHarness;
    use super::*;
    use chrono::Utc;
    use drydock_state::{ArtifactDigest, VersionKey};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn record() -> ModelVersionRecord {
        ModelVersionRecord::new(
            VersionKey::new("ranker", "1.0.0"),
            "mem://ranker/1.0.0",
            ArtifactDigest::from_bytes(b"weights"),
            BTreeMap::new(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_echo_harness_wraps_the_sample() {
        let sample = json!({"query": "mast height"});
        let response = EchoHarness.infer(&record(), &sample).await.unwrap();
        assert_eq!(response["echo"], sample);
    }

    #[tokio::test]
    async fn test_scripted_harness_records_samples() {
        let harness = ScriptedHarness::answering(json!({"score": 0.9}));
        let sample = json!({"query": "draft"});

        let response = harness.infer(&record(), &sample).await.unwrap();
        assert_eq!(response["score"], 0.9);
        assert_eq!(harness.samples(), vec![sample]);
    }

    #[tokio::test]
    async fn test_scripted_harness_failure() {
        let harness = ScriptedHarness::failing("model crashed on load");
        let err = harness.infer(&record(), &json!({})).await.unwrap_err();
        assert!(err.contains("crashed"));
    }
}

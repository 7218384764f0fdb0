//! Validation check definitions and configuration.

use serde::{Deserialize, Serialize};

/// What a single validation check verifies, with its parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckKind {
    /// Required metadata keys are present and non-empty.
    SchemaConformance { required_keys: Vec<String> },

    /// SHA-256 of the stored artifact bytes equals the recorded digest.
    ArtifactIntegrity,

    /// One inference call on a held-out sample through the smoke harness.
    SmokeInference { sample: serde_json::Value },
}

impl CheckKind {
    /// Default name for a check of this kind.
    pub fn name(&self) -> &'static str {
        match self {
            CheckKind::SchemaConformance { .. } => "schema_conformance",
            CheckKind::ArtifactIntegrity => "artifact_integrity",
            CheckKind::SmokeInference { .. } => "smoke_inference",
        }
    }
}

/// Configuration for a validation check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Human-readable check name.
    pub name: String,

    /// What the check verifies.
    pub kind: CheckKind,

    /// Timeout in seconds.
    pub timeout_secs: u64,

    /// Whether this check is enabled.
    pub enabled: bool,
}

impl CheckConfig {
    /// Create a check configuration named after its kind.
    pub fn from_kind(kind: CheckKind, timeout_secs: u64) -> Self {
        Self {
            name: kind.name().to_string(),
            kind,
            timeout_secs,
            enabled: true,
        }
    }

    /// Create a check configuration with a custom name.
    pub fn custom(name: String, kind: CheckKind, timeout_secs: u64) -> Self {
        Self {
            name,
            kind,
            timeout_secs,
            enabled: true,
        }
    }

    /// Disable this check.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// The standard pre-rollout sequence: schema, integrity, then smoke.
    pub fn standard(required_keys: Vec<String>, sample: serde_json::Value) -> Vec<CheckConfig> {
        vec![
            CheckConfig::from_kind(CheckKind::SchemaConformance { required_keys }, 30),
            CheckConfig::from_kind(CheckKind::ArtifactIntegrity, 120),
            CheckConfig::from_kind(CheckKind::SmokeInference { sample }, 60),
        ]
    }
}

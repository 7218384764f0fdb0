//! Engine and daemon configuration, loaded from a JSON file. Every field
//! has a default, so an empty object is a valid configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::canary::CanaryConfig;
use crate::error::{DrydockError, DrydockResult};
use crate::registry::MetadataSchema;

/// Retry posture for fleet commands. Delay doubles per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    250
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrydockConfig {
    /// Policy rule set to load at startup. Absent means the standard
    /// rollout rules.
    #[serde(default)]
    pub policy_path: Option<PathBuf>,
    /// Metadata keys required at registration.
    #[serde(default)]
    pub metadata_schema: MetadataSchema,
    #[serde(default)]
    pub canary: CanaryConfig,
    #[serde(default)]
    pub deploy_retry: RetryConfig,
    /// Seconds until an unanswered approval request expires. Absent means
    /// requests stay open until resolved.
    #[serde(default)]
    pub approval_expiry_secs: Option<u64>,
    #[serde(default = "default_expiry_sweep_interval_secs")]
    pub expiry_sweep_interval_secs: u64,
}

fn default_expiry_sweep_interval_secs() -> u64 {
    30
}

impl Default for DrydockConfig {
    fn default() -> Self {
        DrydockConfig {
            policy_path: None,
            metadata_schema: MetadataSchema::default(),
            canary: CanaryConfig::default(),
            deploy_retry: RetryConfig::default(),
            approval_expiry_secs: None,
            expiry_sweep_interval_secs: default_expiry_sweep_interval_secs(),
        }
    }
}

impl DrydockConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> DrydockResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| DrydockError::ConfigLoad {
            detail: format!("{}: {e}", path.as_ref().display()),
        })?;
        serde_json::from_str(&raw).map_err(|e| DrydockError::ConfigLoad {
            detail: format!("{}: {e}", path.as_ref().display()),
        })
    }
}

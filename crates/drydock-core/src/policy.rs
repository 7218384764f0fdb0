//! Transition policy: ordered first-match rules that decide whether a
//! lifecycle transition proceeds, is refused, or waits for a human.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use drydock_state::{LifecycleState, Transition};

use crate::error::{DrydockError, DrydockResult};

/// Metadata key marking a model as critical. Rule sets may never grant
/// automatic activation to versions carrying `critical = "true"`.
pub const CRITICAL_METADATA_KEY: &str = "critical";

/// What a rule (or the evaluator as a whole) says about a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    /// Proceed without human involvement.
    Allow,
    /// Refuse and record why.
    Deny { reason: String },
    /// Suspend until a human rules on it.
    RequireApproval { reason: String },
}

/// One ordered rule. Absent predicate fields match anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_state: Option<LifecycleState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_state: Option<LifecycleState>,
    /// Every listed pair must be present in the version's metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata_equals: BTreeMap<String, String>,
    /// Exact match on the requester identity string, e.g. `operator:ines`
    /// or `canary-controller`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    pub decision: Decision,
}

impl PolicyRule {
    pub fn matches(&self, transition: &Transition, metadata: &BTreeMap<String, String>) -> bool {
        if let Some(from) = self.from_state {
            if from != transition.from {
                return false;
            }
        }
        if let Some(to) = self.to_state {
            if to != transition.to {
                return false;
            }
        }
        if let Some(requester) = &self.requester {
            if *requester != transition.requester.id() {
                return false;
            }
        }
        self.metadata_equals
            .iter()
            .all(|(k, v)| metadata.get(k) == Some(v))
    }

    /// True when this rule could grant `Allow` into `active` for a version
    /// carrying `critical = "true"` metadata. A requester predicate does not
    /// make such a rule safe; only a metadata predicate that excludes
    /// critical models does.
    fn is_unsafe_auto_activation(&self) -> bool {
        if self.decision != Decision::Allow {
            return false;
        }
        if let Some(to) = self.to_state {
            if to != LifecycleState::Active {
                return false;
            }
        }
        match self.metadata_equals.get(CRITICAL_METADATA_KEY) {
            Some(value) => value == "true",
            None => true,
        }
    }
}

/// Ordered rule set. Evaluation walks rules top to bottom and takes the
/// first match; a transition no rule matches requires approval
/// (default-deny posture).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicySet {
    pub rules: Vec<PolicyRule>,
}

impl PolicySet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: PolicyRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// First-match evaluation over the ordered rules.
    pub fn evaluate(
        &self,
        transition: &Transition,
        metadata: &BTreeMap<String, String>,
    ) -> Decision {
        for rule in &self.rules {
            if rule.matches(transition, metadata) {
                return rule.decision.clone();
            }
        }
        Decision::RequireApproval {
            reason: "no policy rule matched".to_string(),
        }
    }

    /// Refuse rule sets that could promote a critical model into `active`
    /// without a human. Runs on every load and reload; a failing set never
    /// takes effect.
    pub fn validate(&self) -> DrydockResult<()> {
        for rule in &self.rules {
            if rule.is_unsafe_auto_activation() {
                return Err(DrydockError::UnsafeAutoApprovalRule {
                    rule: rule.name.clone(),
                    detail: format!(
                        "grants allow into active for versions with {} = \"true\"",
                        CRITICAL_METADATA_KEY
                    ),
                });
            }
        }
        Ok(())
    }

    /// Parse and validate a rule set from a JSON file.
    pub fn load_from_path(path: impl AsRef<Path>) -> DrydockResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| DrydockError::PolicyLoad {
            detail: format!("{}: {e}", path.as_ref().display()),
        })?;
        let set: PolicySet =
            serde_json::from_str(&raw).map_err(|e| DrydockError::PolicyLoad {
                detail: format!("{}: {e}", path.as_ref().display()),
            })?;
        set.validate()?;
        Ok(set)
    }

    /// Standard rollout posture:
    ///
    /// | Rule | Transition | Decision |
    /// |------|------------|----------|
    /// | allow-validation-start | uploaded -> validating | allow |
    /// | allow-validation-pass  | validating -> validated, gate only | allow |
    /// | allow-canary-entry     | validated -> canary | allow |
    /// | review-promotion       | any -> promoting | require approval |
    /// | review-activation      | any -> active | require approval |
    ///
    /// Everything else falls through to the default and requires approval.
    pub fn standard_rollout() -> Self {
        PolicySet::empty()
            .with_rule(PolicyRule {
                name: "allow-validation-start".to_string(),
                from_state: Some(LifecycleState::Uploaded),
                to_state: Some(LifecycleState::Validating),
                metadata_equals: BTreeMap::new(),
                requester: None,
                decision: Decision::Allow,
            })
            .with_rule(PolicyRule {
                name: "allow-validation-pass".to_string(),
                from_state: Some(LifecycleState::Validating),
                to_state: Some(LifecycleState::Validated),
                metadata_equals: BTreeMap::new(),
                requester: Some("validation-gate".to_string()),
                decision: Decision::Allow,
            })
            .with_rule(PolicyRule {
                name: "allow-canary-entry".to_string(),
                from_state: Some(LifecycleState::Validated),
                to_state: Some(LifecycleState::Canary),
                metadata_equals: BTreeMap::new(),
                requester: None,
                decision: Decision::Allow,
            })
            .with_rule(PolicyRule {
                name: "review-promotion".to_string(),
                from_state: None,
                to_state: Some(LifecycleState::Promoting),
                metadata_equals: BTreeMap::new(),
                requester: None,
                decision: Decision::RequireApproval {
                    reason: "canary promotion requires review".to_string(),
                },
            })
            .with_rule(PolicyRule {
                name: "review-activation".to_string(),
                from_state: None,
                to_state: Some(LifecycleState::Active),
                metadata_equals: BTreeMap::new(),
                requester: None,
                decision: Decision::RequireApproval {
                    reason: "production activation requires review".to_string(),
                },
            })
    }
}

/// Shared, reloadable view of the rule set.
///
/// Evaluations take an `Arc` snapshot, so one transition observes one
/// consistent rule set end to end; a reload swaps the snapshot for
/// subsequent evaluations only.
#[derive(Debug)]
pub struct PolicyHandle {
    inner: RwLock<Arc<PolicySet>>,
}

impl PolicyHandle {
    pub fn new(set: PolicySet) -> Self {
        PolicyHandle {
            inner: RwLock::new(Arc::new(set)),
        }
    }

    pub async fn snapshot(&self) -> Arc<PolicySet> {
        self.inner.read().await.clone()
    }

    /// Validate and install a new rule set, returning the rule count. An
    /// invalid set leaves the current one in force.
    pub async fn reload(&self, set: PolicySet) -> DrydockResult<usize> {
        set.validate()?;
        let count = set.rules.len();
        let mut guard = self.inner.write().await;
        *guard = Arc::new(set);
        info!(rules = count, "policy rule set reloaded");
        Ok(count)
    }
}

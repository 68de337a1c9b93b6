//! Structured outcomes of command execution.
//!
//! Business-rule failures are data, not errors: a denied, guarded or
//! constrained command returns a [`CommandResult`] with `success: false`
//! and the matching failure field filled in.

use manifest_ir::Severity;
use serde::{Deserialize, Serialize};

use crate::events::EmittedEvent;
use crate::options::OverrideRequest;
use crate::store::EntityInstance;

/// A sub-expression and the value it had when a rule failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedValue {
    pub expression: String,
    pub value: serde_json::Value,
}

/// The first guard that evaluated falsy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardFailure {
    /// 1-based position of the guard in the command.
    pub index: usize,
    pub expression: String,
    pub resolved: Vec<ResolvedValue>,
}

/// The first applicable policy that did not pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDenial {
    pub policy_name: String,
    pub message: String,
    /// Top-level context names the policy reads, without their values.
    pub context_keys: Vec<String>,
    pub resolved: Vec<ResolvedValue>,
}

/// Result of evaluating one constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintOutcome {
    pub code: String,
    pub constraint_name: String,
    pub severity: Severity,
    pub passed: bool,
    #[serde(default)]
    pub overridden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overridden_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub expression: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved: Vec<ResolvedValue>,
}

impl ConstraintOutcome {
    /// A failing, non-overridden `block` constraint halts the command.
    pub fn blocks(&self) -> bool {
        !self.passed && !self.overridden && self.severity == Severity::Block
    }
}

/// A rejected optimistic-concurrency update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyConflict {
    pub entity_name: String,
    pub instance_id: String,
    pub expected_version: i64,
    pub actual_version: Option<i64>,
    pub conflict_code: String,
}

/// Outcome of [`RuntimeEngine::update_instance`](crate::RuntimeEngine::update_instance).
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Updated(EntityInstance),
    NotFound,
    Conflict(ConcurrencyConflict),
}

impl UpdateOutcome {
    pub fn instance(&self) -> Option<&EntityInstance> {
        match self {
            UpdateOutcome::Updated(instance) => Some(instance),
            _ => None,
        }
    }
}

/// Outcome of one `run_command` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard_failure: Option<GuardFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_denial: Option<PolicyDenial>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraint_outcomes: Vec<ConstraintOutcome>,
    /// Override requests that were authorized and applied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub override_requests: Vec<OverrideRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_conflict: Option<ConcurrencyConflict>,
    #[serde(default)]
    pub emitted_events: Vec<EmittedEvent>,
}

impl CommandResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

//! Host-supplied configuration for the runtime engine.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::Store;

/// Returns the current time in milliseconds since the Unix epoch.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Returns a fresh instance id.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Supplies a store for an entity, overriding the IR-declared target.
pub type StoreProvider = Arc<dyn Fn(&str) -> Option<Arc<dyn Store>> + Send + Sync>;

/// Environment variable naming the deployment environment.
pub const ENV_VAR: &str = "MANIFEST_ENV";

// ---------------------------------------------------------------------------
// RuntimeOptions
// ---------------------------------------------------------------------------

/// Engine configuration.
///
/// The defaults generate UUID v4 ids, read the system clock, keep file
/// stores under `./data`, and derive the provenance requirement from the
/// environment (see [`provenance_required`](Self::provenance_required)).
#[derive(Clone)]
pub struct RuntimeOptions {
    pub id_generator: IdGenerator,
    pub clock: Clock,
    /// `None` defers to [`ENV_VAR`] and the build profile.
    pub require_valid_provenance: Option<bool>,
    /// Hash the IR must match; defaults to its self-reported hash.
    pub expected_ir_hash: Option<String>,
    pub store_provider: Option<StoreProvider>,
    /// Directory for `localStorage`/`file` stores without a `path` option.
    pub data_dir: PathBuf,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            id_generator: Arc::new(|| uuid::Uuid::new_v4().to_string()),
            clock: Arc::new(|| chrono::Utc::now().timestamp_millis()),
            require_valid_provenance: None,
            expected_ir_hash: None,
            store_provider: None,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl fmt::Debug for RuntimeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeOptions")
            .field("require_valid_provenance", &self.require_valid_provenance)
            .field("expected_ir_hash", &self.expected_ir_hash)
            .field("store_provider", &self.store_provider.is_some())
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

impl RuntimeOptions {
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_id_generator(mut self, ids: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.id_generator = Arc::new(ids);
        self
    }

    pub fn with_store_provider(
        mut self,
        provider: impl Fn(&str) -> Option<Arc<dyn Store>> + Send + Sync + 'static,
    ) -> Self {
        self.store_provider = Some(Arc::new(provider));
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn require_valid_provenance(mut self, required: bool) -> Self {
        self.require_valid_provenance = Some(required);
        self
    }

    pub fn with_expected_ir_hash(mut self, hash: impl Into<String>) -> Self {
        self.expected_ir_hash = Some(hash.into());
        self
    }

    /// Whether a provenance mismatch is a hard failure.
    ///
    /// An explicit setting wins. Otherwise `MANIFEST_ENV=production`
    /// requires it, any other value does not, and without the variable
    /// release builds require it.
    pub fn provenance_required(&self) -> bool {
        self.require_valid_provenance.unwrap_or_else(|| {
            match std::env::var(ENV_VAR) {
                Ok(env) => env.eq_ignore_ascii_case("production"),
                Err(_) => !cfg!(debug_assertions),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// RuntimeContext
// ---------------------------------------------------------------------------

/// Ambient data bound as `user` and `context` in every expression.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeContext {
    #[serde(default)]
    pub user: serde_json::Value,
    #[serde(default)]
    pub context: serde_json::Value,
}

impl RuntimeContext {
    pub fn with_user(user: serde_json::Value) -> Self {
        Self {
            user,
            context: serde_json::Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// RunOptions
// ---------------------------------------------------------------------------

/// A caller's request to bypass a failing overrideable constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRequest {
    pub constraint_code: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized_by: Option<String>,
}

/// Per-call options for `run_command`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Entity to resolve the command against; defaults to the command's own.
    pub entity_name: Option<String>,
    /// Instance the command operates on.
    pub instance_id: Option<String>,
    pub override_requests: Vec<OverrideRequest>,
}

impl RunOptions {
    pub fn on(entity: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            entity_name: Some(entity.into()),
            instance_id: Some(instance_id.into()),
            override_requests: Vec::new(),
        }
    }

    pub fn with_override(mut self, request: OverrideRequest) -> Self {
        self.override_requests.push(request);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_provenance_setting_wins() {
        assert!(RuntimeOptions::default().require_valid_provenance(true).provenance_required());
        assert!(!RuntimeOptions::default().require_valid_provenance(false).provenance_required());
    }

    #[test]
    fn override_request_uses_camel_case() {
        let json = serde_json::json!({"constraintCode": "X", "reason": "ok"});
        let req: OverrideRequest = serde_json::from_value(json).unwrap();
        assert_eq!(req.constraint_code, "X");
        assert!(req.authorized_by.is_none());
    }

    #[test]
    fn custom_clock_and_ids() {
        let options = RuntimeOptions::default()
            .with_clock(|| 42)
            .with_id_generator(|| "fixed".to_owned());
        assert_eq!((options.clock)(), 42);
        assert_eq!((options.id_generator)(), "fixed");
    }
}

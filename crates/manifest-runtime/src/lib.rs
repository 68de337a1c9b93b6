//! Manifest runtime -- executes compiled IR against entity stores.
//!
//! - [`value`]: the runtime [`Value`] and evaluation [`Context`].
//! - [`evaluator`]: async tree-walking expression evaluator.
//! - [`store`]: the [`Store`] capability with in-memory and JSON-file
//!   implementations.
//! - [`events`]: emitted events, the event log and listeners.
//! - [`engine`]: [`RuntimeEngine`], the command pipeline, optimistic
//!   concurrency, relationship resolution and provenance checks.
//! - [`options`] / [`result`]: configuration in, structured outcomes out.
//!
//! # Example
//!
//! ```
//! use manifest_runtime::prelude::*;
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let ir = manifest_ir::Ir::empty();
//! let engine = RuntimeEngine::new(ir, RuntimeContext::default(), RuntimeOptions::default())
//!     .expect("memory stores only");
//! let result = engine
//!     .run_command("missing", serde_json::json!({}), RunOptions::default())
//!     .await
//!     .unwrap();
//! assert!(!result.success);
//! # });
//! ```

#![deny(unsafe_code)]

pub mod engine;
pub mod evaluator;
pub mod events;
pub mod options;
pub mod result;
pub mod store;
pub mod value;

pub use engine::RuntimeEngine;
pub use events::{EmittedEvent, ListenerFailure};
pub use options::{OverrideRequest, RunOptions, RuntimeContext, RuntimeOptions};
pub use result::{CommandResult, ConstraintOutcome, UpdateOutcome};
pub use store::{EntityInstance, JsonFileStore, MemoryStore, Store, StoreError};
pub use value::{Context, Value};

/// Errors that abort an engine operation.
///
/// Rule outcomes are never errors; they are reported through
/// [`CommandResult`].
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// An entity's declared store target has no implementation.
    #[error("unsupported store target '{target}' for entity '{entity}'")]
    UnsupportedStore { entity: String, target: String },

    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Provenance is required and the IR hash does not verify.
    #[error("IR provenance mismatch: expected {expected} but computed {computed}")]
    ProvenanceMismatch { expected: String, computed: String },
}

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::engine::RuntimeEngine;
    pub use crate::evaluator::{Builtins, Evaluator, RelationshipResolver};
    pub use crate::events::{EmittedEvent, EventLog, ListenerFailure, SubscriptionId};
    pub use crate::options::{OverrideRequest, RunOptions, RuntimeContext, RuntimeOptions};
    pub use crate::result::{
        CommandResult, ConcurrencyConflict, ConstraintOutcome, GuardFailure, PolicyDenial,
        ResolvedValue, UpdateOutcome,
    };
    pub use crate::store::{EntityInstance, JsonFileStore, MemoryStore, Store, StoreError};
    pub use crate::value::{Context, Value};
    pub use crate::RuntimeError;
}

//! Manifest IR -- the compiled, versioned, hash-stamped program representation.
//!
//! This crate defines the Intermediate Representation produced by the
//! Manifest compiler and consumed by the runtime engine. The IR is a plain
//! data document: every type derives `Serialize`/`Deserialize` and the JSON
//! form (camelCase keys, `kind`-tagged enums) is the exchange format between
//! the compiler, the runtime and external tooling.
//!
//! # Layout
//!
//! An [`Ir`] flattens every module-scoped and top-level declaration into
//! unified lists (`entities`, `commands`, `policies`, `stores`, `events`).
//! Each item remembers the module (and, for commands and policies, the
//! entity) it was declared in. [`IrModule`] keeps the per-module name index.
//!
//! # Integrity
//!
//! [`IrProvenance`] records the source content hash and an integrity hash of
//! the IR itself. See [`provenance`] for how the canonical hash is computed
//! and verified.
//!
//! # Modules
//!
//! - [`expr`]: the [`IrExpression`] sum type and formatting helpers.
//! - [`provenance`]: canonical JSON and BLAKE3 hashing.

#![deny(unsafe_code)]

pub mod expr;
pub mod provenance;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use expr::{format_expression, IrExpression, IrObjectProperty, IrValue};

/// Version string of the IR document format.
pub const IR_VERSION: &str = "1.0";

/// Version of the IR JSON schema.
pub const SCHEMA_VERSION: &str = "1.0";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced when loading an IR document.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// The document is not valid IR JSON.
    #[error("failed to parse IR document: {0}")]
    Parse(#[from] serde_json::Error),

    /// The document's integrity hash does not match its contents.
    #[error("IR hash mismatch: expected {expected} but computed {computed}")]
    HashMismatch {
        /// The hash the document claims (or the caller expected).
        expected: String,
        /// The hash recomputed from the document contents.
        computed: String,
    },
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// Metadata proving an IR's origin and integrity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrProvenance {
    /// BLAKE3 hex digest of the source text.
    pub content_hash: String,
    /// BLAKE3 hex digest of the canonical IR (see [`provenance`]).
    pub ir_hash: String,
    /// Version of the compiler that produced this IR.
    pub compiler_version: String,
    /// Version of the IR schema.
    pub schema_version: String,
    /// RFC 3339 compile timestamp. Not covered by `ir_hash`.
    pub compiled_at: String,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A type reference such as `number`, `string?` or `list<Item>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrType {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generics: Vec<IrType>,
    #[serde(default)]
    pub nullable: bool,
}

impl IrType {
    /// A non-nullable type with no generic arguments.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generics: Vec::new(),
            nullable: false,
        }
    }
}

/// Property modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyModifier {
    Required,
    Unique,
    Indexed,
    Private,
    Readonly,
    Optional,
}

/// A stored property of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrProperty {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: IrType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<IrExpression>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modifiers: Vec<PropertyModifier>,
}

/// A property derived from other data at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrComputedProperty {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: IrType,
    pub expression: IrExpression,
    /// Property names the expression reads (`x` or `self.x`).
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Relationship kinds between entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationshipKind {
    HasMany,
    HasOne,
    BelongsTo,
    Ref,
}

impl RelationshipKind {
    /// `belongsTo` and `ref` hold the foreign key on the declaring side.
    pub fn owns_foreign_key(self) -> bool {
        matches!(self, RelationshipKind::BelongsTo | RelationshipKind::Ref)
    }
}

/// A declared association from one entity to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrRelationship {
    pub name: String,
    pub kind: RelationshipKind,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub through: Option<String>,
}

// ---------------------------------------------------------------------------
// Constraints
// ---------------------------------------------------------------------------

/// How a failing constraint affects command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    /// Informational only.
    Ok,
    /// Reported but does not block.
    Warn,
    /// Blocks the command unless overridden.
    #[default]
    Block,
}

/// Whether a constraint asserts its expression or its negation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConstraintPolarity {
    /// Passes when the expression is truthy.
    #[default]
    Positive,
    /// Passes when the expression is falsy; fires when it holds.
    Negative,
}

/// A named validation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrConstraint {
    pub name: String,
    /// Stable identifier, defaults to `name`. Unique per constraint block.
    pub code: String,
    pub expression: IrExpression,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub polarity: ConstraintPolarity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_template: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details_mapping: BTreeMap<String, IrExpression>,
    #[serde(default)]
    pub overrideable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_policy_ref: Option<String>,
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A compiled entity declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrEntity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default)]
    pub properties: Vec<IrProperty>,
    #[serde(default)]
    pub computed_properties: Vec<IrComputedProperty>,
    #[serde(default)]
    pub relationships: Vec<IrRelationship>,
    /// Names of the commands declared inside this entity.
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<IrConstraint>,
    /// Names of the policies declared inside this entity.
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_property: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_at_property: Option<String>,
}

impl IrEntity {
    /// An entity with the given name and nothing else declared.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: None,
            properties: Vec::new(),
            computed_properties: Vec::new(),
            relationships: Vec::new(),
            commands: Vec::new(),
            constraints: Vec::new(),
            policies: Vec::new(),
            version_property: None,
            version_at_property: None,
        }
    }

    /// Look up a declared relationship by name.
    pub fn relationship(&self, name: &str) -> Option<&IrRelationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Look up a computed property by name.
    pub fn computed(&self, name: &str) -> Option<&IrComputedProperty> {
        self.computed_properties.iter().find(|c| c.name == name)
    }
}

// ---------------------------------------------------------------------------
// Stores & events
// ---------------------------------------------------------------------------

/// Where an entity's instances live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrStore {
    pub entity: String,
    /// Backend name, e.g. `memory`, `localStorage`, `postgres`.
    pub target: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, serde_json::Value>,
}

/// A field of an event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrEventField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: IrType,
}

/// A declared event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrEvent {
    pub name: String,
    /// Delivery channel. Defaults to the event name.
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default)]
    pub payload: Vec<IrEventField>,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A command parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: IrType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<IrExpression>,
}

/// Kinds of command actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    /// Write a field on the target instance.
    Mutate,
    /// Write a derived field on the target instance.
    Compute,
    /// Append an event to the log.
    Emit,
    /// Append an event to the log (alias of `Emit` for integration channels).
    Publish,
    /// Evaluate for value only.
    Persist,
    /// Evaluate for value only.
    Effect,
}

impl ActionKind {
    /// Whether the action writes to the instance store.
    pub fn is_mutating(self) -> bool {
        matches!(self, ActionKind::Mutate | ActionKind::Compute)
    }
}

/// One step of a command body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrAction {
    pub kind: ActionKind,
    /// Field name for mutate/compute, event name for emit/publish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub expression: IrExpression,
}

/// A compiled command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrCommand {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(default)]
    pub parameters: Vec<IrParameter>,
    #[serde(default)]
    pub guards: Vec<IrExpression>,
    #[serde(default)]
    pub constraints: Vec<IrConstraint>,
    #[serde(default)]
    pub actions: Vec<IrAction>,
    /// Events emitted after all actions succeed.
    #[serde(default)]
    pub emits: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<IrType>,
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// The operation a policy gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyAction {
    Read,
    Write,
    Delete,
    Execute,
    Override,
    #[default]
    All,
}

impl PolicyAction {
    /// Parse a policy action name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "read" => Some(PolicyAction::Read),
            "write" => Some(PolicyAction::Write),
            "delete" => Some(PolicyAction::Delete),
            "execute" => Some(PolicyAction::Execute),
            "override" => Some(PolicyAction::Override),
            "all" => Some(PolicyAction::All),
            _ => None,
        }
    }

    /// Whether this policy gates command execution.
    pub fn gates_execution(self) -> bool {
        matches!(self, PolicyAction::Execute | PolicyAction::All)
    }
}

/// An access-control rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrPolicy {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(default)]
    pub action: PolicyAction,
    pub expression: IrExpression,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Modules
// ---------------------------------------------------------------------------

/// Name index of the declarations made inside one `module` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrModule {
    pub name: String,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub stores: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

// ---------------------------------------------------------------------------
// Ir
// ---------------------------------------------------------------------------

/// A compiled Manifest program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ir {
    pub version: String,
    pub provenance: IrProvenance,
    #[serde(default)]
    pub modules: Vec<IrModule>,
    #[serde(default)]
    pub entities: Vec<IrEntity>,
    #[serde(default)]
    pub stores: Vec<IrStore>,
    #[serde(default)]
    pub events: Vec<IrEvent>,
    #[serde(default)]
    pub commands: Vec<IrCommand>,
    #[serde(default)]
    pub policies: Vec<IrPolicy>,
}

impl Ir {
    /// An IR with no declarations and blank provenance.
    pub fn empty() -> Self {
        Self {
            version: IR_VERSION.to_owned(),
            provenance: IrProvenance {
                schema_version: SCHEMA_VERSION.to_owned(),
                ..IrProvenance::default()
            },
            modules: Vec::new(),
            entities: Vec::new(),
            stores: Vec::new(),
            events: Vec::new(),
            commands: Vec::new(),
            policies: Vec::new(),
        }
    }

    /// Parse an IR document from JSON without checking its hash.
    pub fn from_json(json: &str) -> Result<Self, IrError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse an IR document from JSON and verify its self-reported hash.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::Parse`] for malformed JSON and
    /// [`IrError::HashMismatch`] when the document was altered after it was
    /// stamped.
    pub fn from_json_verified(json: &str) -> Result<Self, IrError> {
        let ir = Self::from_json(json)?;
        let check = provenance::verify_ir_hash(&ir, None);
        if !check.valid {
            return Err(IrError::HashMismatch {
                expected: check.expected_hash,
                computed: check.computed_hash,
            });
        }
        Ok(ir)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).expect("IR should always be JSON-serializable")
    }

    /// Look up an entity by name.
    pub fn entity(&self, name: &str) -> Option<&IrEntity> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Look up a command by name, preferring one declared on `entity`.
    ///
    /// With `entity == None` the first command with that name wins.
    pub fn command(&self, name: &str, entity: Option<&str>) -> Option<&IrCommand> {
        match entity {
            Some(entity_name) => self
                .commands
                .iter()
                .find(|c| c.name == name && c.entity.as_deref() == Some(entity_name))
                .or_else(|| {
                    self.commands
                        .iter()
                        .find(|c| c.name == name && c.entity.is_none())
                }),
            None => self.commands.iter().find(|c| c.name == name),
        }
    }

    /// Look up a policy by name.
    pub fn policy(&self, name: &str) -> Option<&IrPolicy> {
        self.policies.iter().find(|p| p.name == name)
    }

    /// Look up an event by name.
    pub fn event(&self, name: &str) -> Option<&IrEvent> {
        self.events.iter().find(|e| e.name == name)
    }

    /// The store declaration for an entity, if any.
    pub fn store_for(&self, entity: &str) -> Option<&IrStore> {
        self.stores.iter().find(|s| s.entity == entity)
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::expr::{format_expression, IrExpression, IrObjectProperty, IrValue};
    pub use crate::provenance::{compute_ir_hash, content_hash, verify_ir_hash, HashVerification};
    pub use crate::{
        ActionKind, ConstraintPolarity, Ir, IrAction, IrCommand, IrComputedProperty,
        IrConstraint, IrEntity, IrError, IrEvent, IrEventField, IrModule, IrParameter,
        IrPolicy, IrProperty, IrProvenance, IrRelationship, IrStore, IrType, PolicyAction,
        PropertyModifier, RelationshipKind, Severity,
    };
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn command(name: &str, entity: Option<&str>) -> IrCommand {
        IrCommand {
            name: name.to_owned(),
            module: None,
            entity: entity.map(str::to_owned),
            parameters: Vec::new(),
            guards: Vec::new(),
            constraints: Vec::new(),
            actions: Vec::new(),
            emits: Vec::new(),
            returns: None,
        }
    }

    #[test]
    fn command_lookup_prefers_entity_scope() {
        let mut ir = Ir::empty();
        ir.commands.push(command("reset", None));
        ir.commands.push(command("reset", Some("Counter")));

        let scoped = ir.command("reset", Some("Counter")).unwrap();
        assert_eq!(scoped.entity.as_deref(), Some("Counter"));

        let fallback = ir.command("reset", Some("Other")).unwrap();
        assert!(fallback.entity.is_none());

        assert!(ir.command("missing", None).is_none());
    }

    #[test]
    fn ir_json_roundtrip_preserves_structure() {
        let mut ir = Ir::empty();
        ir.entities.push(IrEntity::named("Order"));
        ir.policies.push(IrPolicy {
            name: "admins".to_owned(),
            module: None,
            entity: Some("Order".to_owned()),
            action: PolicyAction::Execute,
            expression: IrExpression::boolean(true),
            message: None,
        });

        let json = ir.to_json_pretty();
        assert!(json.contains("\"computedProperties\""));
        assert!(json.contains("\"action\": \"execute\""));

        let back = Ir::from_json(&json).unwrap();
        assert_eq!(back, ir);
    }

    #[test]
    fn verified_load_rejects_tampered_document() {
        let mut ir = Ir::empty();
        ir.entities.push(IrEntity::named("Order"));
        ir.provenance.ir_hash = provenance::compute_ir_hash(&ir);
        let json = ir.to_json_pretty();
        assert!(Ir::from_json_verified(&json).is_ok());

        let tampered = json.replace("\"Order\"", "\"Invoice\"");
        match Ir::from_json_verified(&tampered) {
            Err(IrError::HashMismatch { expected, computed }) => assert_ne!(expected, computed),
            other => panic!("expected hash mismatch, got {other:?}"),
        }
    }

    #[test]
    fn severity_and_polarity_serialize_lowercase() {
        assert_eq!(serde_json::to_value(Severity::Warn).unwrap(), "warn");
        assert_eq!(
            serde_json::to_value(ConstraintPolarity::Negative).unwrap(),
            "negative"
        );
        assert_eq!(
            serde_json::to_value(RelationshipKind::BelongsTo).unwrap(),
            "belongsTo"
        );
    }

    #[test]
    fn policy_action_gates_execution() {
        assert!(PolicyAction::All.gates_execution());
        assert!(PolicyAction::Execute.gates_execution());
        assert!(!PolicyAction::Read.gates_execution());
        assert_eq!(PolicyAction::from_name("delete"), Some(PolicyAction::Delete));
        assert_eq!(PolicyAction::from_name("bogus"), None);
    }
}

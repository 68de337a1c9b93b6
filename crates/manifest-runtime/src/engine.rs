//! The runtime engine: executes commands against entity instances.
//!
//! # Command pipeline
//!
//! [`RuntimeEngine::run_command`] runs these steps strictly in order and
//! stops at the first one that fails:
//!
//! 1. Reset the per-command state (relationship memo, version flag,
//!    "just created" set).
//! 2. Resolve the command, by entity scope first.
//! 3. Build the evaluation context: instance fields, parameter defaults,
//!    input, then `self`/`this`/`user`/`context`.
//! 4. Check `execute`/`all` policies that apply to the command's entity.
//! 5. Evaluate command constraints, applying authorized overrides.
//! 6. Evaluate guards; the first falsy guard halts.
//! 7. Run actions in order. Mutations write through to the store and are
//!    visible to later actions; emits are logged immediately.
//! 8. Emit the command's declared events.
//!
//! # Concurrency
//!
//! Per-command state lives on the engine. Overlapping `run_command` calls
//! on one engine share it, so callers that need per-instance ordering must
//! serialize calls themselves.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use manifest_ir::provenance::{self, HashVerification};
use manifest_ir::{
    format_expression, ActionKind, ConstraintPolarity, Ir, IrConstraint, IrEntity, IrExpression,
    IrRelationship, RelationshipKind,
};
use serde_json::json;

use crate::evaluator::{render_template, Builtins, Evaluator, RelationshipResolver};
use crate::events::{
    EmittedEvent, EventLog, ListenerFailure, Listeners, SubscriptionId,
    CONCURRENCY_CONFLICT_EVENT, OVERRIDE_APPLIED_EVENT,
};
use crate::options::{OverrideRequest, RunOptions, RuntimeContext, RuntimeOptions};
use crate::result::{
    CommandResult, ConcurrencyConflict, ConstraintOutcome, GuardFailure, PolicyDenial,
    ResolvedValue, UpdateOutcome,
};
use crate::store::{EntityInstance, JsonFileStore, MemoryStore, Store, StoreError};
use crate::value::{Context, Value};
use crate::RuntimeError;

type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Roles allowed to override a constraint that names no override policy.
const ADMIN_ROLES: [&str; 2] = ["admin", "superadmin"];

const VERSION_MISMATCH: &str = "VERSION_MISMATCH";

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// A relationship with its foreign key resolved at construction.
#[derive(Debug, Clone)]
struct RelationshipLink {
    kind: RelationshipKind,
    target: String,
    foreign_key: String,
}

#[derive(Debug, Default)]
struct CommandState {
    active: bool,
    version_incremented: bool,
    just_created: HashSet<(String, String)>,
}

type MemoKey = (String, String, String);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ends the per-command scope when dropped, including on early return.
struct CommandScope<'a> {
    engine: &'a RuntimeEngine,
}

impl Drop for CommandScope<'_> {
    fn drop(&mut self) {
        lock(&self.engine.command_state).active = false;
        lock(&self.engine.relationship_cache).clear();
    }
}

// ---------------------------------------------------------------------------
// RuntimeEngine
// ---------------------------------------------------------------------------

/// Executes a compiled [`Ir`] against its entity stores.
pub struct RuntimeEngine {
    ir: Ir,
    options: RuntimeOptions,
    builtins: Builtins,
    context: Mutex<RuntimeContext>,
    stores: HashMap<String, Arc<dyn Store>>,
    links: HashMap<String, HashMap<String, RelationshipLink>>,
    events: Mutex<EventLog>,
    listeners: Mutex<Listeners>,
    listener_errors: Mutex<Vec<ListenerFailure>>,
    relationship_cache: Mutex<HashMap<MemoKey, Value>>,
    command_state: Mutex<CommandState>,
}

impl std::fmt::Debug for RuntimeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeEngine")
            .field("ir_hash", &self.ir.provenance.ir_hash)
            .field("entities", &self.stores.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RuntimeEngine {
    /// Build an engine, creating a store for every entity.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::UnsupportedStore`] when an entity declares a store
    /// target with no built-in implementation and the store provider does
    /// not supply one.
    pub fn new(
        ir: Ir,
        context: RuntimeContext,
        options: RuntimeOptions,
    ) -> Result<Self, RuntimeError> {
        let mut stores = HashMap::new();
        for entity in &ir.entities {
            let store = build_store(&ir, &entity.name, &options)?;
            stores.insert(entity.name.clone(), store);
        }
        let links = index_relationships(&ir);
        let builtins = Builtins {
            clock: Arc::clone(&options.clock),
            id_generator: Arc::clone(&options.id_generator),
        };

        tracing::info!(
            entities = ir.entities.len(),
            commands = ir.commands.len(),
            policies = ir.policies.len(),
            ir_hash = %ir.provenance.ir_hash,
            "runtime engine created"
        );

        Ok(Self {
            ir,
            options,
            builtins,
            context: Mutex::new(context),
            stores,
            links,
            events: Mutex::new(EventLog::new()),
            listeners: Mutex::new(Listeners::new()),
            listener_errors: Mutex::new(Vec::new()),
            relationship_cache: Mutex::new(HashMap::new()),
            command_state: Mutex::new(CommandState::default()),
        })
    }

    /// Build an engine and verify its IR, returning the verification
    /// instead of failing on a mismatch.
    pub fn create(
        ir: Ir,
        context: RuntimeContext,
        options: RuntimeOptions,
    ) -> Result<(Self, HashVerification), RuntimeError> {
        let engine = Self::new(ir, context, options)?;
        let verification = engine.verify_ir_hash(None);
        if !verification.valid {
            tracing::warn!(
                expected = %verification.expected_hash,
                computed = %verification.computed_hash,
                required = engine.options.provenance_required(),
                "IR provenance verification failed"
            );
        }
        Ok((engine, verification))
    }

    pub fn ir(&self) -> &Ir {
        &self.ir
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn context(&self) -> RuntimeContext {
        lock(&self.context).clone()
    }

    pub fn set_context(&self, context: RuntimeContext) {
        *lock(&self.context) = context;
    }

    /// The store backing `entity`.
    pub fn store(&self, entity: &str) -> Option<Arc<dyn Store>> {
        self.stores.get(entity).cloned()
    }

    // -- Provenance ------------------------------------------------------------

    /// Recompute the IR hash and compare it with `expected`, the configured
    /// expected hash, or the IR's self-reported hash, in that order.
    pub fn verify_ir_hash(&self, expected: Option<&str>) -> HashVerification {
        let expected = expected.or(self.options.expected_ir_hash.as_deref());
        provenance::verify_ir_hash(&self.ir, expected)
    }

    /// Fail when provenance is required and does not verify.
    pub fn assert_valid_provenance(&self) -> Result<(), RuntimeError> {
        if !self.options.provenance_required() {
            return Ok(());
        }
        let check = self.verify_ir_hash(None);
        if check.valid {
            Ok(())
        } else {
            Err(RuntimeError::ProvenanceMismatch {
                expected: check.expected_hash,
                computed: check.computed_hash,
            })
        }
    }

    // -- Events ----------------------------------------------------------------

    /// Every event emitted so far, in order.
    pub fn events(&self) -> Vec<EmittedEvent> {
        lock(&self.events).all_events().to_vec()
    }

    pub fn events_named(&self, name: &str) -> Vec<EmittedEvent> {
        lock(&self.events).events_named(name).cloned().collect()
    }

    pub fn clear_events(&self) {
        lock(&self.events).clear();
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&EmittedEvent) -> Result<(), String> + Send + Sync + 'static,
    ) -> SubscriptionId {
        lock(&self.listeners).subscribe(Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock(&self.listeners).unsubscribe(id)
    }

    /// Drain the listener failures collected since the last call.
    pub fn take_listener_errors(&self) -> Vec<ListenerFailure> {
        std::mem::take(&mut *lock(&self.listener_errors))
    }

    fn emit_event(&self, name: &str, payload: serde_json::Value) -> EmittedEvent {
        let channel = self
            .ir
            .event(name)
            .map_or_else(|| name.to_owned(), |e| e.channel.clone());
        let event = EmittedEvent {
            name: name.to_owned(),
            channel,
            payload,
            timestamp: (self.options.clock)(),
            provenance: self.ir.provenance.clone(),
        };
        lock(&self.events).record(event.clone());
        tracing::debug!(event = name, channel = %event.channel, "event emitted");

        let listeners = lock(&self.listeners).clone();
        let failures = listeners.notify(&event);
        if !failures.is_empty() {
            lock(&self.listener_errors).extend(failures);
        }
        event
    }

    // -- Instances -------------------------------------------------------------

    fn entity_decl(&self, entity: &str) -> Result<&IrEntity, RuntimeError> {
        self.ir
            .entity(entity)
            .ok_or_else(|| RuntimeError::UnknownEntity(entity.to_owned()))
    }

    fn store_of(&self, entity: &str) -> Result<&Arc<dyn Store>, RuntimeError> {
        self.stores
            .get(entity)
            .ok_or_else(|| RuntimeError::UnknownEntity(entity.to_owned()))
    }

    pub async fn get_all_instances(
        &self,
        entity: &str,
    ) -> Result<Vec<EntityInstance>, RuntimeError> {
        Ok(self.store_of(entity)?.get_all().await?)
    }

    pub async fn get_instance(
        &self,
        entity: &str,
        id: &str,
    ) -> Result<Option<EntityInstance>, RuntimeError> {
        Ok(self.store_of(entity)?.get_by_id(id).await?)
    }

    /// Create an instance from `data`.
    ///
    /// Missing properties take their declared defaults. The id comes from
    /// `data.id` or the id generator. A declared version property starts at
    /// `1` and a version-timestamp property is set to the current time.
    pub async fn create_instance(
        &self,
        entity: &str,
        data: serde_json::Value,
    ) -> Result<EntityInstance, RuntimeError> {
        let decl = self.entity_decl(entity)?;
        let store = self.store_of(entity)?;

        let mut fields = match data {
            serde_json::Value::Object(map) => map,
            _ => JsonMap::new(),
        };
        let id = match fields.remove("id") {
            Some(serde_json::Value::String(id)) => id,
            Some(other) if !other.is_null() => other.to_string(),
            _ => (self.options.id_generator)(),
        };

        let evaluator = Evaluator::new(&self.builtins);
        let empty = Context::new();
        for property in &decl.properties {
            if fields.contains_key(&property.name) {
                continue;
            }
            if let Some(default) = &property.default_value {
                let value = evaluator.evaluate(default, &empty).await?;
                fields.insert(property.name.clone(), value.to_json());
            }
        }
        if let Some(vp) = &decl.version_property {
            fields.entry(vp.clone()).or_insert(json!(1));
        }
        if let Some(vap) = &decl.version_at_property {
            fields.insert(vap.clone(), json!((self.options.clock)()));
        }

        let instance = store.create(EntityInstance { id, fields }).await?;
        {
            let mut state = lock(&self.command_state);
            if state.active {
                state
                    .just_created
                    .insert((entity.to_owned(), instance.id.clone()));
            }
        }
        tracing::debug!(entity, id = %instance.id, "instance created");
        Ok(instance)
    }

    /// Apply a partial update with optimistic concurrency.
    ///
    /// When the entity declares a version property and `expected_version`
    /// is given, a mismatch with the stored version emits a
    /// `ConcurrencyConflict` event and leaves the instance untouched.
    /// Otherwise the version advances by one: once per command inside
    /// `run_command`, never for an instance created by the same command.
    pub async fn update_instance(
        &self,
        entity: &str,
        id: &str,
        patch: serde_json::Value,
        expected_version: Option<i64>,
    ) -> Result<UpdateOutcome, RuntimeError> {
        let mut emitted = Vec::new();
        self.update_tracked(entity, id, patch, expected_version, &mut emitted)
            .await
    }

    async fn update_tracked(
        &self,
        entity: &str,
        id: &str,
        patch: serde_json::Value,
        expected_version: Option<i64>,
        emitted: &mut Vec<EmittedEvent>,
    ) -> Result<UpdateOutcome, RuntimeError> {
        let decl = self.entity_decl(entity)?;
        let store = self.store_of(entity)?;
        let Some(existing) = store.get_by_id(id).await? else {
            return Ok(UpdateOutcome::NotFound);
        };

        let mut patch = match patch {
            serde_json::Value::Object(map) => map,
            _ => JsonMap::new(),
        };
        patch.remove("id");

        if let Some(vp) = &decl.version_property {
            patch.remove(vp);
            let current = existing.get(vp).as_ref().and_then(json_version);
            if let Some(expected) = expected_version {
                if current != Some(expected) {
                    let conflict = ConcurrencyConflict {
                        entity_name: entity.to_owned(),
                        instance_id: id.to_owned(),
                        expected_version: expected,
                        actual_version: current,
                        conflict_code: VERSION_MISMATCH.to_owned(),
                    };
                    tracing::warn!(
                        entity,
                        id,
                        expected,
                        actual = ?current,
                        "concurrency conflict"
                    );
                    let payload = serde_json::to_value(&conflict)
                        .expect("ConcurrencyConflict should always be JSON-serializable");
                    emitted.push(self.emit_event(CONCURRENCY_CONFLICT_EVENT, payload));
                    return Ok(UpdateOutcome::Conflict(conflict));
                }
            }
            if self.claim_version_increment(entity, id) {
                patch.insert(vp.clone(), json!(current.unwrap_or(0) + 1));
            }
        }
        if let Some(vap) = &decl.version_at_property {
            patch.insert(vap.clone(), json!((self.options.clock)()));
        }

        Ok(match store.update(id, patch).await? {
            Some(updated) => UpdateOutcome::Updated(updated),
            None => UpdateOutcome::NotFound,
        })
    }

    /// Whether this update advances the version. Outside a command every
    /// update does; inside one only the first, and never for an instance
    /// the command created.
    fn claim_version_increment(&self, entity: &str, id: &str) -> bool {
        let mut state = lock(&self.command_state);
        if !state.active {
            return true;
        }
        let key = (entity.to_owned(), id.to_owned());
        if state.just_created.contains(&key) || state.version_incremented {
            return false;
        }
        state.version_incremented = true;
        true
    }

    pub async fn delete_instance(&self, entity: &str, id: &str) -> Result<bool, RuntimeError> {
        let deleted = self.store_of(entity)?.delete(id).await?;
        tracing::debug!(entity, id, deleted, "instance delete");
        Ok(deleted)
    }

    // -- Derived data ----------------------------------------------------------

    /// Evaluate an entity's constraint block against `data`.
    pub async fn check_constraints(
        &self,
        entity: &str,
        data: &serde_json::Value,
    ) -> Result<Vec<ConstraintOutcome>, RuntimeError> {
        let decl = self.entity_decl(entity)?;
        let subject = Value::from_json(data);
        let ctx = self.instance_context(&subject);
        let evaluator = self.evaluator(Some(entity));

        let mut outcomes = Vec::with_capacity(decl.constraints.len());
        for constraint in &decl.constraints {
            outcomes.push(evaluate_constraint(&evaluator, constraint, &ctx).await?);
        }
        Ok(outcomes)
    }

    /// Evaluate a computed property of a stored instance.
    ///
    /// `None` when the instance or the computed property does not exist.
    pub async fn evaluate_computed(
        &self,
        entity: &str,
        id: &str,
        name: &str,
    ) -> Result<Option<Value>, RuntimeError> {
        let decl = self.entity_decl(entity)?;
        let Some(computed) = decl.computed(name) else {
            return Ok(None);
        };
        let Some(instance) = self.get_instance(entity, id).await? else {
            return Ok(None);
        };
        let ctx = self.instance_context(&instance.to_value());
        let value = self
            .evaluator(Some(entity))
            .evaluate(&computed.expression, &ctx)
            .await?;
        Ok(Some(value))
    }

    /// Resolve a declared relationship of a stored instance.
    ///
    /// `belongsTo`/`ref` yield the target object or `null`, `hasOne` the
    /// first related object or `null`, `hasMany` an array. An undeclared
    /// relationship is `undefined`. Inside a command, results are memoized
    /// until the command finishes.
    pub async fn resolve_relationship(
        &self,
        entity: &str,
        id: &str,
        relationship: &str,
    ) -> Result<Value, RuntimeError> {
        Ok(self.resolve_link(entity, id, relationship).await?)
    }

    async fn resolve_link(
        &self,
        entity: &str,
        id: &str,
        relationship: &str,
    ) -> Result<Value, StoreError> {
        let Some(link) = self.links.get(entity).and_then(|l| l.get(relationship)) else {
            return Ok(Value::Undefined);
        };

        let key = (entity.to_owned(), id.to_owned(), relationship.to_owned());
        let memoize = lock(&self.command_state).active;
        if memoize {
            let cached = lock(&self.relationship_cache).get(&key).cloned();
            if let Some(value) = cached {
                tracing::trace!(entity, id, relationship, "relationship memo hit");
                return Ok(value);
            }
        }

        let Some(target) = self.stores.get(&link.target) else {
            return Ok(Value::Null);
        };
        let value = match link.kind {
            RelationshipKind::BelongsTo | RelationshipKind::Ref => {
                let source = match self.stores.get(entity) {
                    Some(store) => store.get_by_id(id).await?,
                    None => None,
                };
                let foreign = source
                    .and_then(|s| s.get(&link.foreign_key))
                    .filter(|v| !v.is_null());
                match foreign {
                    Some(fk) => target
                        .get_by_id(&json_text(&fk))
                        .await?
                        .map_or(Value::Null, |i| i.to_value()),
                    None => Value::Null,
                }
            }
            RelationshipKind::HasOne | RelationshipKind::HasMany => {
                let related: Vec<Value> = target
                    .get_all()
                    .await?
                    .into_iter()
                    .filter(|i| i.get(&link.foreign_key).is_some_and(|v| json_text(&v) == id))
                    .map(|i| i.to_value())
                    .collect();
                if link.kind == RelationshipKind::HasMany {
                    Value::Array(related)
                } else {
                    related.into_iter().next().unwrap_or(Value::Null)
                }
            }
        };

        if memoize {
            lock(&self.relationship_cache).insert(key, value.clone());
        }
        Ok(value)
    }

    // -- Commands --------------------------------------------------------------

    /// Run a command.
    ///
    /// Business outcomes (unknown command, missing parameter, policy
    /// denial, blocking constraint, guard failure, version conflict) are
    /// `Ok` with `success: false`.
    ///
    /// # Errors
    ///
    /// Store failures and references to entities without a store.
    pub async fn run_command(
        &self,
        name: &str,
        input: serde_json::Value,
        options: RunOptions,
    ) -> Result<CommandResult, RuntimeError> {
        let _scope = self.begin_command();

        let Some(command) = self.ir.command(name, options.entity_name.as_deref()) else {
            tracing::warn!(command = name, "unknown command");
            return Ok(CommandResult::failure(format!("Command '{name}' not found")));
        };
        let entity_name = options.entity_name.as_deref().or(command.entity.as_deref());
        let instance_id = options.instance_id.as_deref();
        let input = match input {
            serde_json::Value::Object(map) => map,
            _ => JsonMap::new(),
        };
        tracing::debug!(command = name, entity = ?entity_name, instance = ?instance_id, "running command");

        if let Some(missing) = command
            .parameters
            .iter()
            .find(|p| p.required && input.get(&p.name).map_or(true, serde_json::Value::is_null))
        {
            return Ok(CommandResult::failure(format!(
                "Missing required parameter '{}'",
                missing.name
            )));
        }

        // -- context
        let instance = match (entity_name, instance_id) {
            (Some(entity), Some(id)) => self.get_instance(entity, id).await?,
            _ => None,
        };
        let mut ctx = Context::new();
        if let Some(Value::Object(fields)) = instance.as_ref().map(EntityInstance::to_value) {
            ctx.spread(&fields);
        }
        let plain = Evaluator::new(&self.builtins);
        for param in &command.parameters {
            if input.contains_key(&param.name) {
                continue;
            }
            if let Some(default) = &param.default_value {
                let value = plain.evaluate(default, &Context::new()).await?;
                ctx.set(param.name.clone(), value);
            }
        }
        for (key, value) in &input {
            ctx.set(key.clone(), Value::from_json(value));
        }
        let subject = match (&instance, instance_id) {
            (Some(instance), _) => instance.to_value(),
            (None, Some(id)) => Value::Object([("id".to_owned(), Value::from(id))].into()),
            (None, None) => Value::Null,
        };
        self.bind_ambient(&mut ctx, subject);

        let evaluator = self.evaluator(entity_name);
        let mut result = CommandResult::default();

        // -- policies
        if let Some(denial) = self.check_policies(&evaluator, entity_name, &ctx).await? {
            tracing::warn!(command = name, policy = %denial.policy_name, "command denied by policy");
            result.error = Some(denial.message.clone());
            result.denied_by = Some(denial.policy_name.clone());
            result.policy_denial = Some(denial);
            return Ok(result);
        }

        // -- constraints
        for constraint in &command.constraints {
            let mut outcome = evaluate_constraint(&evaluator, constraint, &ctx).await?;
            if !outcome.passed && constraint.overrideable {
                self.apply_override(&evaluator, constraint, &ctx, &options, &mut outcome, &mut result)
                    .await?;
            }
            let blocks = outcome.blocks();
            if !outcome.passed && !outcome.overridden {
                tracing::warn!(
                    command = name,
                    constraint = %outcome.code,
                    severity = ?outcome.severity,
                    "constraint failed"
                );
            }
            let message = outcome.message.clone();
            result.constraint_outcomes.push(outcome);
            if blocks {
                result.error = Some(format!(
                    "Constraint '{}' failed: {}",
                    constraint.name,
                    message.unwrap_or_default()
                ));
                return Ok(result);
            }
        }

        // -- guards
        for (i, guard) in command.guards.iter().enumerate() {
            if evaluator.evaluate(guard, &ctx).await?.truthy() {
                continue;
            }
            let failure = GuardFailure {
                index: i + 1,
                expression: format_expression(guard),
                resolved: resolve_diagnostics(&evaluator, guard, &ctx).await,
            };
            tracing::warn!(command = name, index = failure.index, guard = %failure.expression, "guard failed");
            result.error = Some(format!("Guard {} failed: {}", failure.index, failure.expression));
            result.guard_failure = Some(failure);
            return Ok(result);
        }

        // -- actions
        let mut expected_version = entity_name
            .and_then(|e| self.ir.entity(e))
            .and_then(|e| e.version_property.as_ref())
            .and_then(|vp| input.get(vp))
            .and_then(json_version);
        let mut last = Value::Undefined;
        for action in &command.actions {
            let value = evaluator.evaluate(&action.expression, &ctx).await?;
            match action.kind {
                ActionKind::Mutate | ActionKind::Compute => {
                    let Some(field) = action.target.as_deref() else {
                        continue;
                    };
                    let (Some(entity), Some(id)) = (entity_name, instance_id) else {
                        ctx.set(field, value.clone());
                        last = value;
                        continue;
                    };
                    let mut patch = JsonMap::new();
                    patch.insert(field.to_owned(), value.to_json());
                    let patch = serde_json::Value::Object(patch);
                    let outcome = self
                        .write_field(entity, id, patch, expected_version.take(), &mut result.emitted_events)
                        .await?;
                    match outcome {
                        UpdateOutcome::Updated(updated) => {
                            let fresh = updated.to_value();
                            if let Value::Object(fields) = &fresh {
                                ctx.spread(fields);
                            }
                            ctx.set("self", fresh.clone());
                            ctx.set("this", fresh);
                        }
                        UpdateOutcome::Conflict(conflict) => {
                            result.error = Some(format!(
                                "Concurrency conflict on {} '{}'",
                                conflict.entity_name, conflict.instance_id
                            ));
                            result.concurrency_conflict = Some(conflict);
                            return Ok(result);
                        }
                        UpdateOutcome::NotFound => {
                            tracing::warn!(entity, id, "instance vanished during mutation");
                        }
                    }
                }
                ActionKind::Emit | ActionKind::Publish => {
                    let event_name = action.target.as_deref().unwrap_or(&command.name);
                    let payload = match &value {
                        Value::Object(_) => value.to_json(),
                        v if v.is_nullish() => serde_json::Value::Object(input.clone()),
                        other => json!({ "value": other.to_json() }),
                    };
                    result.emitted_events.push(self.emit_event(event_name, payload));
                }
                ActionKind::Persist | ActionKind::Effect => {}
            }
            last = value;
        }

        // -- declared emits
        let result_json = (!last.is_nullish()).then(|| last.to_json());
        for event_name in &command.emits {
            let mut payload = input.clone();
            if let Some(id) = instance_id {
                payload.entry("instanceId").or_insert_with(|| json!(id));
            }
            if let Some(value) = &result_json {
                payload.insert("result".to_owned(), value.clone());
            }
            result
                .emitted_events
                .push(self.emit_event(event_name, serde_json::Value::Object(payload)));
        }

        tracing::debug!(command = name, events = result.emitted_events.len(), "command succeeded");
        result.success = true;
        result.result = result_json;
        Ok(result)
    }

    fn begin_command(&self) -> CommandScope<'_> {
        lock(&self.relationship_cache).clear();
        *lock(&self.command_state) = CommandState {
            active: true,
            ..CommandState::default()
        };
        CommandScope { engine: self }
    }

    fn evaluator<'a>(&'a self, entity: Option<&'a str>) -> Evaluator<'a> {
        let evaluator = Evaluator::new(&self.builtins);
        match entity {
            Some(entity) => evaluator.with_relationships(entity, self),
            None => evaluator,
        }
    }

    fn bind_ambient(&self, ctx: &mut Context, subject: Value) {
        let runtime = self.context();
        ctx.set("self", subject.clone());
        ctx.set("this", subject);
        ctx.set("user", Value::from_json(&runtime.user));
        ctx.set("context", Value::from_json(&runtime.context));
    }

    /// Context for evaluating rules against one object outside a command.
    fn instance_context(&self, subject: &Value) -> Context {
        let mut ctx = Context::new();
        if let Value::Object(fields) = subject {
            ctx.spread(fields);
        }
        self.bind_ambient(&mut ctx, subject.clone());
        ctx
    }

    /// Write one field, creating the instance when it does not exist yet.
    async fn write_field(
        &self,
        entity: &str,
        id: &str,
        patch: serde_json::Value,
        expected_version: Option<i64>,
        emitted: &mut Vec<EmittedEvent>,
    ) -> Result<UpdateOutcome, RuntimeError> {
        if self.get_instance(entity, id).await?.is_none() {
            let mut data = match patch {
                serde_json::Value::Object(map) => map,
                _ => JsonMap::new(),
            };
            data.insert("id".to_owned(), json!(id));
            let created = self
                .create_instance(entity, serde_json::Value::Object(data))
                .await?;
            return Ok(UpdateOutcome::Updated(created));
        }
        self.update_tracked(entity, id, patch, expected_version, emitted)
            .await
    }

    async fn check_policies(
        &self,
        evaluator: &Evaluator<'_>,
        entity: Option<&str>,
        ctx: &Context,
    ) -> Result<Option<PolicyDenial>, StoreError> {
        let applicable = self.ir.policies.iter().filter(|p| {
            p.action.gates_execution() && (p.entity.is_none() || p.entity.as_deref() == entity)
        });
        for policy in applicable {
            if evaluator.evaluate(&policy.expression, ctx).await?.truthy() {
                continue;
            }
            let message = policy
                .message
                .clone()
                .unwrap_or_else(|| format!("Denied by policy '{}'", policy.name));
            return Ok(Some(PolicyDenial {
                policy_name: policy.name.clone(),
                message,
                context_keys: policy.expression.referenced_roots(),
                resolved: resolve_diagnostics(evaluator, &policy.expression, ctx).await,
            }));
        }
        Ok(None)
    }

    async fn policy_allows(
        &self,
        evaluator: &Evaluator<'_>,
        name: &str,
        ctx: &Context,
    ) -> Result<bool, StoreError> {
        let Some(policy) = self.ir.policy(name) else {
            tracing::warn!(policy = name, "override policy not found");
            return Ok(false);
        };
        Ok(evaluator.evaluate(&policy.expression, ctx).await?.truthy())
    }

    /// Try to override a failing constraint.
    ///
    /// An explicit request for the constraint's code is authorized by the
    /// constraint's override policy, or by an admin role when it names
    /// none. Without an authorized request the override policy alone is
    /// consulted.
    async fn apply_override(
        &self,
        evaluator: &Evaluator<'_>,
        constraint: &IrConstraint,
        ctx: &Context,
        options: &RunOptions,
        outcome: &mut ConstraintOutcome,
        result: &mut CommandResult,
    ) -> Result<(), StoreError> {
        let policy_ref = constraint.override_policy_ref.as_deref();
        let request = options
            .override_requests
            .iter()
            .find(|r| r.constraint_code == constraint.code);

        let mut granted: Option<OverrideRequest> = None;
        let mut policy_checked = false;
        if let Some(request) = request {
            let authorized = match policy_ref {
                Some(policy) => {
                    policy_checked = true;
                    self.policy_allows(evaluator, policy, ctx).await?
                }
                None => is_admin(ctx),
            };
            if authorized {
                result.override_requests.push(request.clone());
                granted = Some(request.clone());
            }
        }
        if granted.is_none() && !policy_checked {
            if let Some(policy) = policy_ref {
                if self.policy_allows(evaluator, policy, ctx).await? {
                    granted = Some(OverrideRequest {
                        constraint_code: constraint.code.clone(),
                        reason: format!("authorized by policy '{policy}'"),
                        authorized_by: None,
                    });
                }
            }
        }

        let Some(granted) = granted else {
            return Ok(());
        };
        let authorized_by = granted.authorized_by.clone().or_else(|| user_id(ctx));
        outcome.overridden = true;
        outcome.overridden_by = authorized_by.clone();
        tracing::info!(constraint = %constraint.code, by = ?authorized_by, "constraint overridden");
        let payload = json!({
            "constraintCode": constraint.code,
            "constraintName": constraint.name,
            "reason": granted.reason,
            "authorizedBy": authorized_by,
        });
        result
            .emitted_events
            .push(self.emit_event(OVERRIDE_APPLIED_EVENT, payload));
        Ok(())
    }
}

#[async_trait]
impl RelationshipResolver for RuntimeEngine {
    fn has_relationship(&self, entity: &str, relationship: &str) -> bool {
        self.links
            .get(entity)
            .is_some_and(|links| links.contains_key(relationship))
    }

    async fn resolve(
        &self,
        entity: &str,
        instance_id: &str,
        relationship: &str,
    ) -> Result<Value, StoreError> {
        self.resolve_link(entity, instance_id, relationship).await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn build_store(
    ir: &Ir,
    entity: &str,
    options: &RuntimeOptions,
) -> Result<Arc<dyn Store>, RuntimeError> {
    if let Some(store) = options.store_provider.as_ref().and_then(|p| p(entity)) {
        return Ok(store);
    }
    let Some(declared) = ir.store_for(entity) else {
        return Ok(Arc::new(MemoryStore::new()));
    };
    match declared.target.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "localStorage" | "file" => {
            let path = declared
                .config
                .get("path")
                .and_then(serde_json::Value::as_str)
                .map(PathBuf::from)
                .unwrap_or_else(|| options.data_dir.join(format!("{entity}.json")));
            Ok(Arc::new(JsonFileStore::new(path)))
        }
        other => Err(RuntimeError::UnsupportedStore {
            entity: entity.to_owned(),
            target: other.to_owned(),
        }),
    }
}

fn index_relationships(ir: &Ir) -> HashMap<String, HashMap<String, RelationshipLink>> {
    ir.entities
        .iter()
        .map(|entity| {
            let links = entity
                .relationships
                .iter()
                .map(|rel| {
                    let link = RelationshipLink {
                        kind: rel.kind,
                        target: rel.target.clone(),
                        foreign_key: foreign_key_for(ir, entity, rel),
                    };
                    (rel.name.clone(), link)
                })
                .collect();
            (entity.name.clone(), links)
        })
        .collect()
}

/// The field holding the key that links `rel`'s two sides.
///
/// The owning side defaults to `<relationship>Id`. The inverse side uses
/// the target's `belongsTo`/`ref` back to `source` when one is declared,
/// else `<lowercased source entity>Id`.
fn foreign_key_for(ir: &Ir, source: &IrEntity, rel: &IrRelationship) -> String {
    if let Some(fk) = &rel.foreign_key {
        return fk.clone();
    }
    if rel.kind.owns_foreign_key() {
        return format!("{}Id", rel.name);
    }
    let inverse = ir.entity(&rel.target).and_then(|target| {
        target
            .relationships
            .iter()
            .find(|r| r.kind.owns_foreign_key() && r.target == source.name)
    });
    match inverse {
        Some(inverse) => inverse
            .foreign_key
            .clone()
            .unwrap_or_else(|| format!("{}Id", inverse.name)),
        None => format!("{}Id", source.name.to_lowercase()),
    }
}

async fn evaluate_constraint(
    evaluator: &Evaluator<'_>,
    constraint: &IrConstraint,
    ctx: &Context,
) -> Result<ConstraintOutcome, StoreError> {
    let value = evaluator.evaluate(&constraint.expression, ctx).await?;
    let passed = match constraint.polarity {
        ConstraintPolarity::Positive => value.truthy(),
        ConstraintPolarity::Negative => !value.truthy(),
    };

    let message = match (&constraint.message_template, &constraint.message) {
        (Some(template), _) => Some(render_template(template, ctx)),
        (None, Some(message)) => Some(message.clone()),
        (None, None) if !passed => Some(format!("Constraint '{}' failed", constraint.name)),
        (None, None) => None,
    };

    let mut details = serde_json::Map::new();
    for (key, expr) in &constraint.details_mapping {
        details.insert(key.clone(), evaluator.evaluate_lenient(expr, ctx).await.to_json());
    }
    let resolved = if passed {
        Vec::new()
    } else {
        resolve_diagnostics(evaluator, &constraint.expression, ctx).await
    };

    Ok(ConstraintOutcome {
        code: constraint.code.clone(),
        constraint_name: constraint.name.clone(),
        severity: constraint.severity,
        passed,
        overridden: false,
        overridden_by: None,
        message,
        expression: format_expression(&constraint.expression),
        details,
        resolved,
    })
}

async fn resolve_diagnostics(
    evaluator: &Evaluator<'_>,
    expr: &IrExpression,
    ctx: &Context,
) -> Vec<ResolvedValue> {
    let mut resolved = Vec::new();
    for sub in expr.diagnostic_subexpressions() {
        let value = evaluator.evaluate_lenient(sub, ctx).await;
        resolved.push(ResolvedValue {
            expression: format_expression(sub),
            value: value.to_json(),
        });
    }
    resolved
}

/// `user.role` or any of `user.roles` is an admin role.
fn is_admin(ctx: &Context) -> bool {
    let Some(user) = ctx.get("user") else {
        return false;
    };
    let is_admin_role = |v: &Value| v.as_str().is_some_and(|r| ADMIN_ROLES.contains(&r));
    if is_admin_role(&user.get_own("role")) {
        return true;
    }
    match user.get_own("roles") {
        Value::Array(roles) => roles.iter().any(is_admin_role),
        _ => false,
    }
}

fn user_id(ctx: &Context) -> Option<String> {
    let id = ctx.get("user")?.get_own("id");
    (!id.is_nullish()).then(|| id.to_text())
}

fn json_version(value: &serde_json::Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
}

fn json_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! AST → IR compilation.
//!
//! [`IrCompiler::compile`] runs the whole pipeline:
//!
//! 1. With a cache attached and `use_cache` set, look up the source's
//!    content hash and return the cached IR (with no diagnostics) on a hit.
//! 2. Lex and parse. Any error diagnostic stops compilation with `ir: None`.
//! 3. Lower the AST: flatten module-scoped and top-level declarations into
//!    the IR's unified lists, tagging each with its module/entity, and
//!    normalize operator spellings (`&&` → `and`, `is` → `==`, `!` → `not`).
//! 4. Validate. Constraint codes must be unique within each entity's
//!    constraint block and, independently, within each command's block.
//!    Duplicate entity names and stores for undeclared entities are errors.
//!    Dangling relationship targets, undeclared emitted events and unknown
//!    override policies are warnings.
//! 5. Stamp provenance (content hash, compiler/schema version, timestamp)
//!    and the IR integrity hash.
//! 6. Store the result in the cache.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{SecondsFormat, Utc};
use manifest_ir::provenance::{compute_ir_hash, content_hash};
use manifest_ir::{
    ConstraintPolarity, Ir, IrAction, IrCommand, IrComputedProperty, IrConstraint, IrEntity,
    IrEvent, IrEventField, IrExpression, IrModule, IrObjectProperty, IrParameter, IrPolicy,
    IrProperty, IrProvenance, IrRelationship, IrStore, IrType, IrValue, PropertyModifier,
    SCHEMA_VERSION,
};

use crate::ast::{
    Command, Constraint, Declarations, Entity, Expr, ExprKind, Literal, Program, TypeRef,
};
use crate::cache::IrCache;
use crate::diagnostics::{has_errors, Diagnostic};
use crate::lexer::Position;
use crate::parser::{parse, ParseOutput};

/// Version recorded in `provenance.compilerVersion`.
pub const COMPILER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Names bound by the runtime rather than read from instance data.
const CONTEXT_ROOTS: &[&str] = &["self", "this", "user", "context", "now", "uuid"];

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Per-call compile options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    /// Consult and fill the compiler's cache, if it has one.
    pub use_cache: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self { use_cache: true }
    }
}

/// Result of a compilation. `ir` is `None` whenever `diagnostics` contains
/// an error.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub ir: Option<Ir>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileOutput {
    pub fn has_errors(&self) -> bool {
        has_errors(&self.diagnostics)
    }
}

/// Compiles Manifest source to IR, optionally through an injected cache.
#[derive(Debug, Clone, Default)]
pub struct IrCompiler {
    cache: Option<Arc<Mutex<IrCache>>>,
}

impl IrCompiler {
    /// A compiler without a cache.
    pub fn new() -> Self {
        Self { cache: None }
    }

    /// A compiler that reads and fills `cache`. The cache may be shared
    /// with other compilers.
    pub fn with_cache(cache: Arc<Mutex<IrCache>>) -> Self {
        Self { cache: Some(cache) }
    }

    pub fn cache(&self) -> Option<&Arc<Mutex<IrCache>>> {
        self.cache.as_ref()
    }

    /// Compile `source`.
    pub fn compile(&self, source: &str, options: CompileOptions) -> CompileOutput {
        let hash = content_hash(source);
        let cache = self.cache.as_ref().filter(|_| options.use_cache);

        if let Some(cache) = cache {
            if let Some(ir) = lock(cache).get(&hash) {
                tracing::debug!(content_hash = %hash, "IR cache hit");
                return CompileOutput {
                    ir: Some(ir),
                    diagnostics: Vec::new(),
                };
            }
        }

        let ParseOutput { program, errors } = parse(source);
        let mut diagnostics = errors;
        if has_errors(&diagnostics) {
            tracing::debug!(
                errors = diagnostics.iter().filter(|d| d.is_error()).count(),
                "parse failed"
            );
            return CompileOutput {
                ir: None,
                diagnostics,
            };
        }

        let mut lowering = Lowering::new(&program);
        lowering.program(&program);
        let Lowering {
            ir: mut built,
            diagnostics: lowering_diagnostics,
            ..
        } = lowering;
        diagnostics.extend(lowering_diagnostics);
        if has_errors(&diagnostics) {
            tracing::debug!("semantic validation failed");
            return CompileOutput {
                ir: None,
                diagnostics,
            };
        }

        built.provenance = IrProvenance {
            content_hash: hash.clone(),
            ir_hash: String::new(),
            compiler_version: COMPILER_VERSION.to_owned(),
            schema_version: SCHEMA_VERSION.to_owned(),
            compiled_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        built.provenance.ir_hash = compute_ir_hash(&built);
        tracing::debug!(
            content_hash = %hash,
            ir_hash = %built.provenance.ir_hash,
            entities = built.entities.len(),
            commands = built.commands.len(),
            "compiled IR"
        );

        if let Some(cache) = cache {
            lock(cache).set(hash, built.clone());
        }
        CompileOutput {
            ir: Some(built),
            diagnostics,
        }
    }
}

/// Compile without a cache.
pub fn compile_to_ir(source: &str) -> CompileOutput {
    IrCompiler::new().compile(source, CompileOptions { use_cache: false })
}

fn lock(cache: &Mutex<IrCache>) -> MutexGuard<'_, IrCache> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Lowering
// ---------------------------------------------------------------------------

struct Lowering {
    ir: Ir,
    diagnostics: Vec<Diagnostic>,
    entity_names: HashSet<String>,
    event_names: HashSet<String>,
    policy_names: HashSet<String>,
}

fn all_declarations(program: &Program) -> impl Iterator<Item = &Declarations> {
    program
        .modules
        .iter()
        .map(|m| &m.declarations)
        .chain(std::iter::once(&program.declarations))
}

impl Lowering {
    /// Collect every declared name up front so references can be checked
    /// regardless of declaration order.
    fn new(program: &Program) -> Self {
        let mut entity_names = HashSet::new();
        let mut event_names = HashSet::new();
        let mut policy_names = HashSet::new();
        for decls in all_declarations(program) {
            for entity in &decls.entities {
                entity_names.insert(entity.name.clone());
                policy_names.extend(entity.policies.iter().map(|p| p.name.clone()));
            }
            event_names.extend(decls.events.iter().map(|e| e.name.clone()));
            policy_names.extend(decls.policies.iter().map(|p| p.name.clone()));
        }
        Self {
            ir: Ir::empty(),
            diagnostics: Vec::new(),
            entity_names,
            event_names,
            policy_names,
        }
    }

    fn error(&mut self, message: String, position: Position) {
        self.diagnostics.push(Diagnostic::error(message).at(position));
    }

    fn warning(&mut self, message: String, position: Position) {
        self.diagnostics
            .push(Diagnostic::warning(message).at(position));
    }

    fn program(&mut self, program: &Program) {
        for module in &program.modules {
            let index = self.declarations(&module.declarations, Some(&module.name));
            self.ir.modules.push(IrModule {
                name: module.name.clone(),
                ..index
            });
        }
        self.declarations(&program.declarations, None);
    }

    /// Lower one declaration list and return the names it declared.
    fn declarations(&mut self, decls: &Declarations, module: Option<&str>) -> IrModule {
        let mut index = IrModule::default();

        for entity in &decls.entities {
            if self.ir.entity(&entity.name).is_some() {
                self.error(
                    format!("duplicate entity '{}'", entity.name),
                    entity.position,
                );
                continue;
            }
            index.entities.push(entity.name.clone());
            self.entity(entity, module, &mut index);
        }

        for command in &decls.commands {
            index.commands.push(command.name.clone());
            let lowered = self.command(command, module, None);
            self.ir.commands.push(lowered);
        }

        for policy in &decls.policies {
            index.policies.push(policy.name.clone());
            self.ir.policies.push(IrPolicy {
                name: policy.name.clone(),
                module: module.map(str::to_owned),
                entity: None,
                action: policy.action,
                expression: lower_expr(&policy.expression),
                message: policy.message.clone(),
            });
        }

        for store in &decls.stores {
            if !self.entity_names.contains(&store.entity) {
                self.error(
                    format!("store declared for unknown entity '{}'", store.entity),
                    store.position,
                );
                continue;
            }
            index.stores.push(store.entity.clone());
            self.store(&store.entity, &store.target, &store.config, store.position);
        }

        for event in &decls.events {
            index.events.push(event.name.clone());
            self.ir.events.push(IrEvent {
                name: event.name.clone(),
                channel: event.channel.clone().unwrap_or_else(|| event.name.clone()),
                module: module.map(str::to_owned),
                payload: event
                    .fields
                    .iter()
                    .map(|(name, ty)| IrEventField {
                        name: name.clone(),
                        ty: lower_type(ty),
                    })
                    .collect(),
            });
        }

        index
    }

    fn store(
        &mut self,
        entity: &str,
        target: &str,
        config: &[(String, serde_json::Value)],
        position: Position,
    ) {
        if self.ir.store_for(entity).is_some() {
            self.error(
                format!("entity '{entity}' already has a store"),
                position,
            );
            return;
        }
        self.ir.stores.push(IrStore {
            entity: entity.to_owned(),
            target: target.to_owned(),
            config: config.iter().cloned().collect::<BTreeMap<_, _>>(),
        });
    }

    fn entity(&mut self, entity: &Entity, module: Option<&str>, index: &mut IrModule) {
        let mut lowered = IrEntity::named(entity.name.clone());
        lowered.module = module.map(str::to_owned);
        lowered.version_property = entity.version_property.clone();
        lowered.version_at_property = entity.version_at_property.clone();

        lowered.properties = entity
            .properties
            .iter()
            .map(|p| IrProperty {
                name: p.name.clone(),
                ty: lower_type(&p.ty),
                default_value: p.default.as_ref().map(lower_expr),
                modifiers: p.modifiers.iter().filter_map(|m| modifier(m.as_str())).collect(),
            })
            .collect();

        lowered.computed_properties = entity
            .computed
            .iter()
            .map(|c| {
                let expression = lower_expr(&c.expression);
                IrComputedProperty {
                    name: c.name.clone(),
                    ty: lower_type(&c.ty),
                    dependencies: computed_dependencies(&expression),
                    expression,
                }
            })
            .collect();

        for rel in &entity.relationships {
            if !self.entity_names.contains(&rel.target) {
                self.warning(
                    format!(
                        "relationship '{}.{}' targets undeclared entity '{}'",
                        entity.name, rel.name, rel.target
                    ),
                    rel.position,
                );
            }
            lowered.relationships.push(IrRelationship {
                name: rel.name.clone(),
                kind: rel.kind,
                target: rel.target.clone(),
                foreign_key: rel.foreign_key.clone(),
                through: rel.through.clone(),
            });
        }

        lowered.constraints =
            self.constraints(&entity.constraints, &format!("entity '{}'", entity.name));

        for command in &entity.commands {
            lowered.commands.push(command.name.clone());
            index.commands.push(command.name.clone());
            let cmd = self.command(command, module, Some(&entity.name));
            self.ir.commands.push(cmd);
        }

        for policy in &entity.policies {
            lowered.policies.push(policy.name.clone());
            index.policies.push(policy.name.clone());
            self.ir.policies.push(IrPolicy {
                name: policy.name.clone(),
                module: module.map(str::to_owned),
                entity: Some(entity.name.clone()),
                action: policy.action,
                expression: lower_expr(&policy.expression),
                message: policy.message.clone(),
            });
        }

        for store in &entity.stores {
            index.stores.push(entity.name.clone());
            self.store(&entity.name, &store.target, &store.config, store.position);
        }

        self.ir.entities.push(lowered);
    }

    fn command(&mut self, command: &Command, module: Option<&str>, entity: Option<&str>) -> IrCommand {
        let scope = match entity {
            Some(e) => format!("command '{e}.{}'", command.name),
            None => format!("command '{}'", command.name),
        };
        for event in &command.emits {
            if !self.event_names.contains(event) {
                self.warning(
                    format!("{scope} emits undeclared event '{event}'"),
                    command.position,
                );
            }
        }
        IrCommand {
            name: command.name.clone(),
            module: module.map(str::to_owned),
            entity: entity.map(str::to_owned),
            parameters: command
                .parameters
                .iter()
                .map(|p| IrParameter {
                    name: p.name.clone(),
                    ty: lower_type(&p.ty),
                    required: p.required,
                    default_value: p.default.as_ref().map(lower_expr),
                })
                .collect(),
            guards: command.guards.iter().map(lower_expr).collect(),
            constraints: self.constraints(&command.constraints, &scope),
            actions: command
                .actions
                .iter()
                .map(|a| IrAction {
                    kind: a.kind,
                    target: a.target.clone(),
                    expression: a
                        .expression
                        .as_ref()
                        .map(lower_expr)
                        .unwrap_or_else(IrExpression::null),
                })
                .collect(),
            emits: command.emits.clone(),
            returns: command.returns.as_ref().map(lower_type),
        }
    }

    /// Lower one constraint block, enforcing code uniqueness within it.
    fn constraints(&mut self, constraints: &[Constraint], scope: &str) -> Vec<IrConstraint> {
        let mut first_by_code: HashMap<String, String> = HashMap::new();
        let mut out = Vec::with_capacity(constraints.len());
        for c in constraints {
            let code = c.code.clone().unwrap_or_else(|| c.name.clone());
            if let Some(first) = first_by_code.get(&code) {
                let message = format!(
                    "duplicate constraint code '{code}' in {scope}: constraint '{}' reuses the code of constraint '{first}'",
                    c.name
                );
                self.error(message, c.position);
                continue;
            }
            first_by_code.insert(code.clone(), c.name.clone());

            if let Some(policy) = &c.override_policy {
                if !self.policy_names.contains(policy) {
                    self.warning(
                        format!(
                            "constraint '{}' references unknown override policy '{policy}'",
                            c.name
                        ),
                        c.position,
                    );
                }
            }

            let polarity = match c.polarity {
                Some(p) => p,
                None if c.name.starts_with("severity") => {
                    self.warning(
                        format!(
                            "constraint '{}' is treated as a negative assertion because its name starts with 'severity'; declare `polarity: negative` explicitly",
                            c.name
                        ),
                        c.position,
                    );
                    ConstraintPolarity::Negative
                }
                None => ConstraintPolarity::Positive,
            };

            out.push(IrConstraint {
                name: c.name.clone(),
                code,
                expression: lower_expr(&c.expression),
                severity: c.severity.unwrap_or_default(),
                polarity,
                message: c.message.clone(),
                message_template: c.message_template.clone(),
                details_mapping: c
                    .details
                    .iter()
                    .map(|(k, v)| (k.clone(), lower_expr(v)))
                    .collect(),
                overrideable: c.overrideable,
                override_policy_ref: c.override_policy.clone(),
            });
        }
        out
    }
}

fn modifier(name: &str) -> Option<PropertyModifier> {
    match name {
        "required" => Some(PropertyModifier::Required),
        "unique" => Some(PropertyModifier::Unique),
        "indexed" => Some(PropertyModifier::Indexed),
        "private" => Some(PropertyModifier::Private),
        "readonly" => Some(PropertyModifier::Readonly),
        "optional" => Some(PropertyModifier::Optional),
        _ => None,
    }
}

fn lower_type(ty: &TypeRef) -> IrType {
    IrType {
        name: ty.name.clone(),
        generics: ty.generics.iter().map(lower_type).collect(),
        nullable: ty.nullable,
    }
}

fn normalize_binary(op: &str) -> &str {
    match op {
        "&&" => "and",
        "||" => "or",
        "is" => "==",
        "is not" => "!=",
        other => other,
    }
}

/// Lower an AST expression, normalizing operator spellings.
pub fn lower_expr(expr: &Expr) -> IrExpression {
    match &expr.kind {
        ExprKind::Literal(lit) => IrExpression::Literal {
            value: match lit {
                Literal::String(s) => IrValue::String(s.clone()),
                Literal::Number(n) => IrValue::Number(*n),
                Literal::Boolean(b) => IrValue::Boolean(*b),
                Literal::Null => IrValue::Null,
            },
        },
        ExprKind::Identifier(name) => IrExpression::ident(name.clone()),
        ExprKind::Member { object, property } => {
            IrExpression::member(lower_expr(object), property.clone())
        }
        ExprKind::Binary {
            operator,
            left,
            right,
        } => IrExpression::binary(
            normalize_binary(operator),
            lower_expr(left),
            lower_expr(right),
        ),
        ExprKind::Unary { operator, operand } => IrExpression::Unary {
            operator: if operator == "!" {
                "not".to_owned()
            } else {
                operator.clone()
            },
            operand: Box::new(lower_expr(operand)),
        },
        ExprKind::Call { callee, args } => IrExpression::Call {
            callee: Box::new(lower_expr(callee)),
            args: args.iter().map(lower_expr).collect(),
        },
        ExprKind::Conditional {
            condition,
            consequent,
            alternate,
        } => IrExpression::Conditional {
            condition: Box::new(lower_expr(condition)),
            consequent: Box::new(lower_expr(consequent)),
            alternate: Box::new(lower_expr(alternate)),
        },
        ExprKind::Array(items) => IrExpression::Array {
            elements: items.iter().map(lower_expr).collect(),
        },
        ExprKind::Object(props) => IrExpression::Object {
            properties: props
                .iter()
                .map(|(key, value)| IrObjectProperty {
                    key: key.clone(),
                    value: lower_expr(value),
                })
                .collect(),
        },
        ExprKind::Lambda { params, body } => IrExpression::Lambda {
            params: params.clone(),
            body: Box::new(lower_expr(body)),
        },
    }
}

/// Instance fields a computed expression reads: bare identifiers that are
/// not runtime bindings, and `self.x` / `this.x` members.
pub fn computed_dependencies(expr: &IrExpression) -> Vec<String> {
    let mut out = Vec::new();
    collect_dependencies(expr, &[], &mut out);
    out.sort();
    out.dedup();
    out
}

fn collect_dependencies(expr: &IrExpression, bound: &[String], out: &mut Vec<String>) {
    match expr {
        IrExpression::Literal { .. } => {}
        IrExpression::Identifier { name } => {
            if !CONTEXT_ROOTS.contains(&name.as_str()) && !bound.contains(name) {
                out.push(name.clone());
            }
        }
        IrExpression::Member { object, property } => match object.as_ref() {
            IrExpression::Identifier { name } if name == "self" || name == "this" => {
                out.push(property.clone())
            }
            other => collect_dependencies(other, bound, out),
        },
        IrExpression::Binary { left, right, .. } => {
            collect_dependencies(left, bound, out);
            collect_dependencies(right, bound, out);
        }
        IrExpression::Unary { operand, .. } => collect_dependencies(operand, bound, out),
        IrExpression::Call { callee, args } => {
            collect_dependencies(callee, bound, out);
            for arg in args {
                collect_dependencies(arg, bound, out);
            }
        }
        IrExpression::Conditional {
            condition,
            consequent,
            alternate,
        } => {
            collect_dependencies(condition, bound, out);
            collect_dependencies(consequent, bound, out);
            collect_dependencies(alternate, bound, out);
        }
        IrExpression::Array { elements } => {
            for e in elements {
                collect_dependencies(e, bound, out);
            }
        }
        IrExpression::Object { properties } => {
            for p in properties {
                collect_dependencies(&p.value, bound, out);
            }
        }
        IrExpression::Lambda { params, body } => {
            let mut inner = bound.to_vec();
            inner.extend(params.iter().cloned());
            collect_dependencies(body, &inner, out);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticSeverity;
    use manifest_ir::{format_expression, Severity};

    fn compile_ok(source: &str) -> Ir {
        let out = compile_to_ir(source);
        assert!(!out.has_errors(), "unexpected errors: {:?}", out.diagnostics);
        out.ir.unwrap()
    }

    fn warnings(source: &str) -> Vec<String> {
        compile_to_ir(source)
            .diagnostics
            .into_iter()
            .filter(|d| d.severity == DiagnosticSeverity::Warning)
            .map(|d| d.message)
            .collect()
    }

    #[test]
    fn flattens_modules_and_tags_origin() {
        let ir = compile_ok(
            r#"
            module Shop {
                entity Order {
                    command place() { mutate status = "placed" }
                    policy owner: user.id == self.ownerId
                }
                event Placed
            }
            entity Audit {}
            command ping() {}
            "#,
        );
        let order = ir.entity("Order").unwrap();
        assert_eq!(order.module.as_deref(), Some("Shop"));
        assert_eq!(order.commands, vec!["place"]);
        let place = ir.command("place", Some("Order")).unwrap();
        assert_eq!(place.entity.as_deref(), Some("Order"));
        assert_eq!(place.module.as_deref(), Some("Shop"));
        assert_eq!(ir.policy("owner").unwrap().entity.as_deref(), Some("Order"));
        assert_eq!(ir.event("Placed").unwrap().channel, "Placed");
        assert!(ir.entity("Audit").unwrap().module.is_none());
        assert!(ir.command("ping", None).unwrap().entity.is_none());
        assert_eq!(ir.modules[0].entities, vec!["Order"]);
        assert_eq!(ir.modules[0].commands, vec!["place"]);
    }

    #[test]
    fn operators_are_normalized() {
        let ir = compile_ok("policy p: !a && b || c is not null");
        assert_eq!(
            format_expression(&ir.policies[0].expression),
            "(not a and b) or (c != null)"
        );
    }

    #[test]
    fn provenance_is_stamped() {
        let ir = compile_ok("entity A {}");
        assert_eq!(ir.provenance.content_hash, content_hash("entity A {}"));
        assert_eq!(ir.provenance.compiler_version, COMPILER_VERSION);
        assert_eq!(ir.provenance.schema_version, SCHEMA_VERSION);
        assert!(!ir.provenance.compiled_at.is_empty());
        assert_eq!(ir.provenance.ir_hash, compute_ir_hash(&ir));
    }

    #[test]
    fn duplicate_codes_in_one_entity_fail() {
        let out = compile_to_ir(
            r#"
            entity A {
                constraint first: true { code: SAME }
                constraint second: true { code: SAME }
            }
            "#,
        );
        assert!(out.ir.is_none());
        let err = out.diagnostics.iter().find(|d| d.is_error()).unwrap();
        assert!(err.message.contains("SAME"));
        assert!(err.message.contains("'first'"));
    }

    #[test]
    fn default_code_is_the_name() {
        let out = compile_to_ir("entity A { constraint x: true constraint x: false }");
        assert!(out.ir.is_none());
    }

    #[test]
    fn entity_and_command_blocks_are_independent_scopes() {
        let ir = compile_ok(
            r#"
            entity A {
                constraint positive: self.n > 0 { code: C1 }
                command run() {
                    constraint again: true { code: C1 }
                }
            }
            entity B { constraint positive: self.n > 0 { code: C1 } }
            "#,
        );
        assert_eq!(ir.entity("A").unwrap().constraints[0].code, "C1");
        assert_eq!(ir.command("run", Some("A")).unwrap().constraints[0].code, "C1");
    }

    #[test]
    fn constraint_defaults() {
        let ir = compile_ok("entity A { constraint nonNegative: self.n >= 0 }");
        let c = &ir.entity("A").unwrap().constraints[0];
        assert_eq!(c.code, "nonNegative");
        assert_eq!(c.severity, Severity::Block);
        assert_eq!(c.polarity, ConstraintPolarity::Positive);
        assert!(!c.overrideable);
    }

    #[test]
    fn severity_prefix_becomes_explicit_negative_polarity() {
        let source = "entity A { constraint severityHigh: self.risk > 5 }";
        let ir = compile_ok(source);
        assert_eq!(
            ir.entity("A").unwrap().constraints[0].polarity,
            ConstraintPolarity::Negative
        );
        assert_eq!(warnings(source).len(), 1);

        let explicit = compile_ok(
            "entity A { constraint severityHigh: self.risk > 5 { polarity: positive } }",
        );
        assert_eq!(
            explicit.entity("A").unwrap().constraints[0].polarity,
            ConstraintPolarity::Positive
        );
    }

    #[test]
    fn semantic_warnings_do_not_block() {
        let source = r#"
            entity A {
                hasMany items: Missing
                constraint overrideable c: true { overridePolicy: nobody }
                command go() emits Nothing {}
            }
        "#;
        let out = compile_to_ir(source);
        assert!(out.ir.is_some());
        let w = warnings(source);
        assert_eq!(w.len(), 3, "{w:?}");
    }

    #[test]
    fn duplicate_entity_and_orphan_store_are_errors() {
        assert!(compile_to_ir("entity A {} entity A {}").ir.is_none());
        assert!(compile_to_ir("store Ghost in memory").ir.is_none());
        assert!(compile_to_ir("entity A { store memory } store A in memory").ir.is_none());
    }

    #[test]
    fn computed_dependencies_are_recorded() {
        let ir = compile_ok(
            "entity Line { property qty: number property price: number computed total: number = self.qty * price + now() }",
        );
        let total = ir.entity("Line").unwrap().computed("total").unwrap();
        assert_eq!(total.dependencies, vec!["price", "qty"]);
    }

    #[test]
    fn store_config_and_event_channel() {
        let ir = compile_ok(
            r#"
            entity Note { store in localStorage { path: "notes.json" } }
            event Saved: "notes.saved" { id: string }
            "#,
        );
        let store = ir.store_for("Note").unwrap();
        assert_eq!(store.target, "localStorage");
        assert_eq!(store.config["path"], serde_json::json!("notes.json"));
        let event = ir.event("Saved").unwrap();
        assert_eq!(event.channel, "notes.saved");
        assert_eq!(event.payload[0].ty, IrType::named("string"));
    }

    #[test]
    fn empty_action_expression_lowers_to_null() {
        let ir = compile_ok("command c() emits E { emit E persist } event E");
        let c = ir.command("c", None).unwrap();
        assert_eq!(c.actions[0].expression, IrExpression::null());
        assert_eq!(c.actions[0].target.as_deref(), Some("E"));
    }

    #[test]
    fn parse_errors_short_circuit() {
        let out = compile_to_ir("entity { }");
        assert!(out.ir.is_none());
        assert!(out.has_errors());
    }
}

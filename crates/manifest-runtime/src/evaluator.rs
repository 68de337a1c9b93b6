//! Tree-walking evaluator over [`IrExpression`].
//!
//! Evaluation is async because `self.<relationship>` may need to read
//! another entity's store. The only error an expression can produce is a
//! store failure during such a read; every business-level oddity
//! (unknown identifiers, calling a non-function, arithmetic on text)
//! evaluates to a value, usually `undefined` or `NaN`.
//!
//! Built-in functions:
//!
//! - `now()`: the engine clock, in milliseconds.
//! - `uuid()`: a fresh id from the engine id generator.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use manifest_ir::{IrExpression, IrValue};

use crate::options::{Clock, IdGenerator};
use crate::store::StoreError;
use crate::value::{Closure, Context, Value};

/// Resolves `self.<name>` when `<name>` is a declared relationship.
#[async_trait]
pub trait RelationshipResolver: Send + Sync {
    fn has_relationship(&self, entity: &str, relationship: &str) -> bool;

    async fn resolve(
        &self,
        entity: &str,
        instance_id: &str,
        relationship: &str,
    ) -> Result<Value, StoreError>;
}

/// Functions callable as `now()` and `uuid()`.
#[derive(Clone)]
pub struct Builtins {
    pub clock: Clock,
    pub id_generator: IdGenerator,
}

impl Default for Builtins {
    fn default() -> Self {
        let options = crate::options::RuntimeOptions::default();
        Self {
            clock: options.clock,
            id_generator: options.id_generator,
        }
    }
}

/// Evaluates expressions for one entity scope.
#[derive(Clone, Copy)]
pub struct Evaluator<'a> {
    builtins: &'a Builtins,
    entity: Option<&'a str>,
    resolver: Option<&'a dyn RelationshipResolver>,
}

impl<'a> Evaluator<'a> {
    /// An evaluator with no relationship support.
    pub fn new(builtins: &'a Builtins) -> Self {
        Self {
            builtins,
            entity: None,
            resolver: None,
        }
    }

    /// Resolve `self.<relationship>` of `entity` through `resolver`.
    pub fn with_relationships(
        mut self,
        entity: &'a str,
        resolver: &'a dyn RelationshipResolver,
    ) -> Self {
        self.entity = Some(entity);
        self.resolver = Some(resolver);
        self
    }

    /// Evaluate `expr` against `ctx`.
    pub fn evaluate<'b>(
        &'b self,
        expr: &'b IrExpression,
        ctx: &'b Context,
    ) -> BoxFuture<'b, Result<Value, StoreError>>
    where
        'a: 'b,
    {
        async move {
            match expr {
                IrExpression::Literal { value } => Ok(literal(value)),
                IrExpression::Identifier { name } => Ok(lookup(ctx, name)),
                IrExpression::Member { object, property } => {
                    if let Some(value) = self.relationship_access(object, property, ctx).await? {
                        return Ok(value);
                    }
                    let object = self.evaluate(object, ctx).await?;
                    Ok(object.get_own(property))
                }
                IrExpression::Binary {
                    operator,
                    left,
                    right,
                } => self.binary(operator, left, right, ctx).await,
                IrExpression::Unary { operator, operand } => {
                    let value = self.evaluate(operand, ctx).await?;
                    Ok(match operator.as_str() {
                        "not" | "!" => Value::Bool(!value.truthy()),
                        "-" => Value::Number(-value.to_number()),
                        "+" => Value::Number(value.to_number()),
                        _ => Value::Undefined,
                    })
                }
                IrExpression::Call { callee, args } => self.call(callee, args, ctx).await,
                IrExpression::Conditional {
                    condition,
                    consequent,
                    alternate,
                } => {
                    if self.evaluate(condition, ctx).await?.truthy() {
                        self.evaluate(consequent, ctx).await
                    } else {
                        self.evaluate(alternate, ctx).await
                    }
                }
                IrExpression::Array { elements } => {
                    let mut items = Vec::with_capacity(elements.len());
                    for e in elements {
                        items.push(self.evaluate(e, ctx).await?);
                    }
                    Ok(Value::Array(items))
                }
                IrExpression::Object { properties } => {
                    let mut map = std::collections::BTreeMap::new();
                    for p in properties {
                        map.insert(p.key.clone(), self.evaluate(&p.value, ctx).await?);
                    }
                    Ok(Value::Object(map))
                }
                IrExpression::Lambda { params, body } => Ok(Value::Lambda(Arc::new(Closure {
                    params: params.clone(),
                    body: (**body).clone(),
                    captured: ctx.clone(),
                }))),
            }
        }
        .boxed()
    }

    /// Evaluate for diagnostics: store failures become `undefined`.
    pub async fn evaluate_lenient(&self, expr: &IrExpression, ctx: &Context) -> Value {
        match self.evaluate(expr, ctx).await {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(error = %e, "diagnostic evaluation failed");
                Value::Undefined
            }
        }
    }

    async fn relationship_access(
        &self,
        object: &IrExpression,
        property: &str,
        ctx: &Context,
    ) -> Result<Option<Value>, StoreError> {
        let IrExpression::Identifier { name } = object else {
            return Ok(None);
        };
        if name != "self" && name != "this" {
            return Ok(None);
        }
        let (Some(entity), Some(resolver)) = (self.entity, self.resolver) else {
            return Ok(None);
        };
        if !resolver.has_relationship(entity, property) {
            return Ok(None);
        }
        let id = ctx.get(name).map(|v| v.get_own("id")).unwrap_or_default();
        if id.is_nullish() {
            return Ok(Some(Value::Undefined));
        }
        resolver
            .resolve(entity, &id.to_text(), property)
            .await
            .map(Some)
    }

    async fn binary(
        &self,
        operator: &str,
        left: &IrExpression,
        right: &IrExpression,
        ctx: &Context,
    ) -> Result<Value, StoreError> {
        match operator {
            "and" => {
                let l = self.evaluate(left, ctx).await?;
                if !l.truthy() {
                    return Ok(Value::Bool(false));
                }
                let r = self.evaluate(right, ctx).await?;
                return Ok(Value::Bool(r.truthy()));
            }
            "or" => {
                let l = self.evaluate(left, ctx).await?;
                if l.truthy() {
                    return Ok(Value::Bool(true));
                }
                let r = self.evaluate(right, ctx).await?;
                return Ok(Value::Bool(r.truthy()));
            }
            _ => {}
        }

        let l = self.evaluate(left, ctx).await?;
        let r = self.evaluate(right, ctx).await?;
        Ok(apply_binary(operator, &l, &r))
    }

    async fn call(
        &self,
        callee: &IrExpression,
        args: &[IrExpression],
        ctx: &Context,
    ) -> Result<Value, StoreError> {
        if let IrExpression::Identifier { name } = callee {
            match name.as_str() {
                "now" => return Ok(Value::Number((self.builtins.clock)() as f64)),
                "uuid" => return Ok(Value::String((self.builtins.id_generator)())),
                _ => {}
            }
        }

        let function = self.evaluate(callee, ctx).await?;
        let mut values = Vec::with_capacity(args.len());
        for a in args {
            values.push(self.evaluate(a, ctx).await?);
        }

        match function {
            Value::Lambda(closure) => {
                let mut scope = closure.captured.clone();
                for (i, param) in closure.params.iter().enumerate() {
                    scope.set(param.clone(), values.get(i).cloned().unwrap_or_default());
                }
                self.evaluate(&closure.body, &scope).await
            }
            Value::Native(f) => Ok(f(&values)),
            _ => Ok(Value::Undefined),
        }
    }
}

fn literal(value: &IrValue) -> Value {
    match value {
        IrValue::String(s) => Value::String(s.clone()),
        IrValue::Number(n) => Value::Number(*n),
        IrValue::Boolean(b) => Value::Bool(*b),
        IrValue::Null => Value::Null,
    }
}

fn lookup(ctx: &Context, name: &str) -> Value {
    if let Some(value) = ctx.get(name) {
        return value.clone();
    }
    match name {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => Value::Undefined,
    }
}

/// Apply a non-short-circuiting binary operator to two values.
pub fn apply_binary(operator: &str, l: &Value, r: &Value) -> Value {
    use std::cmp::Ordering;

    let cmp = |pred: fn(Ordering) -> bool| Value::Bool(l.loose_cmp(r).is_some_and(pred));
    match operator {
        "==" => Value::Bool(l.loose_eq(r)),
        "!=" => Value::Bool(!l.loose_eq(r)),
        "<" => cmp(|o| o == Ordering::Less),
        "<=" => cmp(|o| o != Ordering::Greater),
        ">" => cmp(|o| o == Ordering::Greater),
        ">=" => cmp(|o| o != Ordering::Less),
        "+" => {
            if matches!(l, Value::String(_)) || matches!(r, Value::String(_)) {
                Value::String(l.to_text() + &r.to_text())
            } else {
                Value::Number(l.to_number() + r.to_number())
            }
        }
        "-" => Value::Number(l.to_number() - r.to_number()),
        "*" => Value::Number(l.to_number() * r.to_number()),
        "/" => Value::Number(l.to_number() / r.to_number()),
        "%" => Value::Number(l.to_number() % r.to_number()),
        "in" => Value::Bool(membership(r, l)),
        "contains" => Value::Bool(membership(l, r)),
        _ => Value::Undefined,
    }
}

/// Whether `container` holds `item`: array element, substring or object key.
fn membership(container: &Value, item: &Value) -> bool {
    match container {
        Value::Array(items) => items.iter().any(|v| v.loose_eq(item)),
        Value::String(s) => s.contains(&item.to_text()),
        Value::Object(map) => map.contains_key(&item.to_text()),
        _ => false,
    }
}

/// Render `${path}` placeholders in a message template.
///
/// Each placeholder is a dotted path (`self.total`, `amount`) looked up in
/// `ctx` through own properties. Text that is not a placeholder is copied
/// through unchanged.
///
/// Placeholders hold paths only, not expressions. A placeholder ends at the
/// first `}`, so `${ {a: 1}.a }` is read as the path `{a: 1`. A `${` with no
/// closing brace is copied through as text.
pub fn render_template(template: &str, ctx: &Context) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        out.push_str(&resolve_path(after[..end].trim(), ctx).to_text());
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn resolve_path(path: &str, ctx: &Context) -> Value {
    let mut segments = path.split('.');
    let Some(root) = segments.next() else {
        return Value::Undefined;
    };
    segments.fold(lookup(ctx, root), |value, key| value.get_own(key))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Runtime values and the loose comparison rules expressions use.
//!
//! [`Value`] is what expressions evaluate to. Data values (`Null`, `Bool`,
//! `Number`, `String`, `Array`, `Object`) convert losslessly to and from
//! `serde_json::Value`; `Undefined` marks "no such field" and serializes as
//! `null`; `Lambda` and `Native` are callables that only exist during
//! evaluation.
//!
//! # Coercions
//!
//! | Operation | Rule |
//! |---|---|
//! | truthiness | `undefined`, `null`, `false`, `0`, `NaN` and `""` are falsy |
//! | `==` | `undefined == null`; number vs string compares numerically; booleans compare as `0`/`1`; arrays and objects compare structurally |
//! | `<` etc. | two strings compare lexically, anything else numerically |
//! | `+` | concatenates when either side is a string, otherwise adds |

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use manifest_ir::expr::format_number;
use manifest_ir::IrExpression;

/// A host-provided function callable from expressions.
pub type NativeFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// A lambda value: parameters, body, and the context it closed over.
#[derive(Debug)]
pub struct Closure {
    pub params: Vec<String>,
    pub body: IrExpression,
    pub captured: Context,
}

/// An evaluated value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Lambda(Arc<Closure>),
    Native(NativeFn),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "Undefined"),
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Value::Object(map) => f.debug_tuple("Object").field(map).finish(),
            Value::Lambda(c) => write!(f, "Lambda({})", c.params.join(", ")),
            Value::Native(_) => write!(f, "Native"),
        }
    }
}

/// Structural equality. Callables are equal only to themselves.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Lambda(a), Value::Lambda(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&serde_json::Value> for Value {
    fn from(json: &serde_json::Value) -> Self {
        Value::from_json(json)
    }
}

impl Value {
    /// Wrap a Rust closure as a callable value.
    pub fn native(f: impl Fn(&[Value]) -> Value + Send + Sync + 'static) -> Self {
        Value::Native(Arc::new(f))
    }

    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to JSON. Integral numbers become JSON integers; `Undefined`,
    /// non-finite numbers and callables become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Undefined | Value::Null | Value::Lambda(_) | Value::Native(_) => {
                serde_json::Value::Null
            }
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Lambda(_) | Value::Native(_) => "function",
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Lambda(_) | Value::Native(_) => true,
        }
    }

    /// Numeric coercion: `null` and `""` are `0`, booleans `0`/`1`,
    /// unparsable text and everything else `NaN`.
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Null => 0.0,
            Value::String(s) => {
                let t = s.trim();
                if t.is_empty() {
                    0.0
                } else {
                    t.parse().unwrap_or(f64::NAN)
                }
            }
            _ => f64::NAN,
        }
    }

    /// Text used for concatenation and interpolation.
    pub fn to_text(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_owned(),
            Value::Null => "null".to_owned(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .map(|v| if v.is_nullish() { String::new() } else { v.to_text() })
                .collect::<Vec<_>>()
                .join(","),
            Value::Object(_) => self.to_json().to_string(),
            Value::Lambda(_) | Value::Native(_) => "[function]".to_owned(),
        }
    }

    /// Read an own property. Objects expose their keys, arrays and strings
    /// expose `length`, arrays also numeric indexes. Everything else is
    /// `Undefined`.
    pub fn get_own(&self, key: &str) -> Value {
        match self {
            Value::Object(map) => map.get(key).cloned().unwrap_or(Value::Undefined),
            Value::Array(items) => {
                if key == "length" {
                    return Value::Number(items.len() as f64);
                }
                key.parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or(Value::Undefined)
            }
            Value::String(s) if key == "length" => Value::Number(s.chars().count() as f64),
            _ => Value::Undefined,
        }
    }

    /// `==` semantics.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() || b.is_nullish() => a.is_nullish() && b.is_nullish(),
            (Value::Number(a), Value::String(_)) => *a == other.to_number(),
            (Value::String(_), Value::Number(b)) => self.to_number() == *b,
            (Value::Bool(a), b) if !matches!(b, Value::Bool(_)) => {
                Value::Number(f64::from(u8::from(*a))).loose_eq(b)
            }
            (a, Value::Bool(b)) if !matches!(a, Value::Bool(_)) => {
                a.loose_eq(&Value::Number(f64::from(u8::from(*b))))
            }
            _ => self == other,
        }
    }

    /// Ordering for `<`, `<=`, `>`, `>=`. `None` when incomparable (NaN).
    pub fn loose_cmp(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => self.to_number().partial_cmp(&other.to_number()),
        }
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    const MAX_SAFE: f64 = 9_007_199_254_740_991.0;
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Variable bindings visible to an expression.
///
/// Cloning is cheap: bindings are shared until one side writes, so a lambda
/// can capture the enclosing context as an immutable snapshot.
#[derive(Debug, Clone, Default)]
pub struct Context {
    vars: Arc<BTreeMap<String, Value>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        Arc::make_mut(&mut self.vars).insert(name.into(), value);
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, value);
        self
    }

    /// Bind every field of an object value at top level.
    pub fn spread(&mut self, fields: &BTreeMap<String, Value>) {
        let vars = Arc::make_mut(&mut self.vars);
        for (k, v) in fields {
            vars.insert(k.clone(), v.clone());
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness() {
        assert!(!Value::Undefined.truthy());
        assert!(!Value::Null.truthy());
        assert!(!Value::from(0.0).truthy());
        assert!(!Value::from(f64::NAN).truthy());
        assert!(!Value::from("").truthy());
        assert!(Value::from("0").truthy());
        assert!(Value::Array(vec![]).truthy());
    }

    #[test]
    fn loose_equality() {
        assert!(Value::Undefined.loose_eq(&Value::Null));
        assert!(!Value::Null.loose_eq(&Value::from(0.0)));
        assert!(Value::from(1.0).loose_eq(&Value::from("1")));
        assert!(Value::from(true).loose_eq(&Value::from(1.0)));
        assert!(Value::from("1").loose_eq(&Value::from(true)));
        assert!(!Value::from("a").loose_eq(&Value::from("b")));
        assert!(Value::Array(vec![Value::from(1.0)]).loose_eq(&Value::Array(vec![Value::from(1.0)])));
    }

    #[test]
    fn ordering_is_lexical_for_strings_numeric_otherwise() {
        use std::cmp::Ordering;
        assert_eq!(Value::from("10").loose_cmp(&Value::from("9")), Some(Ordering::Less));
        assert_eq!(Value::from(10.0).loose_cmp(&Value::from("9")), Some(Ordering::Greater));
        assert_eq!(Value::from("x").loose_cmp(&Value::from(1.0)), None);
    }

    #[test]
    fn own_properties_only() {
        let obj = Value::from_json(&json!({"a": 1, "list": [1, 2, 3]}));
        assert_eq!(obj.get_own("a"), Value::from(1.0));
        assert_eq!(obj.get_own("constructor"), Value::Undefined);
        assert_eq!(obj.get_own("list").get_own("length"), Value::from(3.0));
        assert_eq!(obj.get_own("list").get_own("1"), Value::from(2.0));
        assert_eq!(Value::from("héllo").get_own("length"), Value::from(5.0));
        assert_eq!(Value::from(3.0).get_own("length"), Value::Undefined);
    }

    #[test]
    fn json_conversion_prefers_integers() {
        let v = Value::from_json(&json!({"n": 100, "f": 1.5, "s": "x", "z": null}));
        assert_eq!(v.to_json(), json!({"n": 100, "f": 1.5, "s": "x", "z": null}));
        assert_eq!(Value::Undefined.to_json(), json!(null));
        assert_eq!(Value::from(f64::INFINITY).to_json(), json!(null));
    }

    #[test]
    fn text_rendering() {
        assert_eq!(Value::from(3.0).to_text(), "3");
        assert_eq!(Value::Undefined.to_text(), "undefined");
        assert_eq!(
            Value::Array(vec![Value::from(1.0), Value::Null, Value::from("x")]).to_text(),
            "1,,x"
        );
    }

    #[test]
    fn context_clone_is_a_snapshot() {
        let base = Context::new().with("x", Value::from(1.0));
        let mut changed = base.clone();
        changed.set("x", Value::from(2.0));
        assert_eq!(base.get("x"), Some(&Value::from(1.0)));
        assert_eq!(changed.get("x"), Some(&Value::from(2.0)));
    }
}

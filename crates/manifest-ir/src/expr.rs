//! Normalized expression tree embedded in the IR.
//!
//! [`IrExpression`] is the single expression representation shared by guards,
//! constraints, policies, actions and computed properties. It is a closed sum
//! type: the evaluator matches on it exhaustively, so adding a variant is a
//! compile error everywhere it is not handled.
//!
//! The module also provides two read-only walks used for diagnostics:
//!
//! - [`format_expression`] renders an expression back to source-like text
//!   (used in guard failures and constraint outcomes).
//! - [`IrExpression::referenced_roots`] / [`IrExpression::diagnostic_subexpressions`]
//!   collect the identifiers and member paths an expression reads.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// IrValue
// ---------------------------------------------------------------------------

/// A literal value as it appears in source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum IrValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Null,
}

// ---------------------------------------------------------------------------
// IrExpression
// ---------------------------------------------------------------------------

/// A key/value pair inside an object literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrObjectProperty {
    pub key: String,
    pub value: IrExpression,
}

/// An expression node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum IrExpression {
    /// A literal value.
    Literal { value: IrValue },
    /// A bare name looked up in the evaluation context.
    Identifier { name: String },
    /// `object.property`.
    Member {
        object: Box<IrExpression>,
        property: String,
    },
    /// `left <operator> right`.
    Binary {
        operator: String,
        left: Box<IrExpression>,
        right: Box<IrExpression>,
    },
    /// `<operator> operand` (`not`, `!`, `-`).
    Unary {
        operator: String,
        operand: Box<IrExpression>,
    },
    /// `callee(args...)`.
    Call {
        callee: Box<IrExpression>,
        args: Vec<IrExpression>,
    },
    /// `condition ? consequent : alternate`.
    Conditional {
        condition: Box<IrExpression>,
        consequent: Box<IrExpression>,
        alternate: Box<IrExpression>,
    },
    /// `[a, b, c]`.
    Array { elements: Vec<IrExpression> },
    /// `{ key: value, ... }`.
    Object { properties: Vec<IrObjectProperty> },
    /// `(a, b) => body`.
    Lambda {
        params: Vec<String>,
        body: Box<IrExpression>,
    },
}

impl IrExpression {
    /// Shorthand for a string literal.
    pub fn string(value: impl Into<String>) -> Self {
        IrExpression::Literal {
            value: IrValue::String(value.into()),
        }
    }

    /// Shorthand for a number literal.
    pub fn number(value: f64) -> Self {
        IrExpression::Literal {
            value: IrValue::Number(value),
        }
    }

    /// Shorthand for a boolean literal.
    pub fn boolean(value: bool) -> Self {
        IrExpression::Literal {
            value: IrValue::Boolean(value),
        }
    }

    /// Shorthand for the `null` literal.
    pub fn null() -> Self {
        IrExpression::Literal {
            value: IrValue::Null,
        }
    }

    /// Shorthand for an identifier.
    pub fn ident(name: impl Into<String>) -> Self {
        IrExpression::Identifier { name: name.into() }
    }

    /// Shorthand for `object.property`.
    pub fn member(object: IrExpression, property: impl Into<String>) -> Self {
        IrExpression::Member {
            object: Box::new(object),
            property: property.into(),
        }
    }

    /// Shorthand for a binary expression.
    pub fn binary(operator: impl Into<String>, left: IrExpression, right: IrExpression) -> Self {
        IrExpression::Binary {
            operator: operator.into(),
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Names of the top-level context entries this expression reads.
    ///
    /// `self.count > limit` references `self` and `limit`. Lambda parameters
    /// are excluded inside their own body. The result is sorted and
    /// deduplicated.
    pub fn referenced_roots(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_roots(self, &mut Vec::new(), &mut out);
        out.sort();
        out.dedup();
        out
    }

    /// Identifier and member-access sub-expressions, in first-seen order.
    ///
    /// These are the "interesting" values shown next to a failing guard or
    /// constraint: each one is evaluated and reported alongside its
    /// formatted text. Literals and the expression's own root are skipped.
    pub fn diagnostic_subexpressions(&self) -> Vec<&IrExpression> {
        let mut out: Vec<&IrExpression> = Vec::new();
        collect_diagnostic(self, &mut out);
        let mut seen = std::collections::HashSet::new();
        out.retain(|e| seen.insert(format_expression(e)));
        out
    }
}

fn collect_roots(expr: &IrExpression, bound: &mut Vec<String>, out: &mut Vec<String>) {
    match expr {
        IrExpression::Literal { .. } => {}
        IrExpression::Identifier { name } => {
            if !bound.contains(name) {
                out.push(name.clone());
            }
        }
        IrExpression::Member { object, .. } => collect_roots(object, bound, out),
        IrExpression::Binary { left, right, .. } => {
            collect_roots(left, bound, out);
            collect_roots(right, bound, out);
        }
        IrExpression::Unary { operand, .. } => collect_roots(operand, bound, out),
        IrExpression::Call { callee, args } => {
            collect_roots(callee, bound, out);
            for arg in args {
                collect_roots(arg, bound, out);
            }
        }
        IrExpression::Conditional {
            condition,
            consequent,
            alternate,
        } => {
            collect_roots(condition, bound, out);
            collect_roots(consequent, bound, out);
            collect_roots(alternate, bound, out);
        }
        IrExpression::Array { elements } => {
            for e in elements {
                collect_roots(e, bound, out);
            }
        }
        IrExpression::Object { properties } => {
            for p in properties {
                collect_roots(&p.value, bound, out);
            }
        }
        IrExpression::Lambda { params, body } => {
            let before = bound.len();
            bound.extend(params.iter().cloned());
            collect_roots(body, bound, out);
            bound.truncate(before);
        }
    }
}

fn collect_diagnostic<'a>(expr: &'a IrExpression, out: &mut Vec<&'a IrExpression>) {
    match expr {
        IrExpression::Literal { .. } | IrExpression::Lambda { .. } => {}
        IrExpression::Identifier { .. } | IrExpression::Member { .. } => out.push(expr),
        IrExpression::Binary { left, right, .. } => {
            collect_diagnostic(left, out);
            collect_diagnostic(right, out);
        }
        IrExpression::Unary { operand, .. } => collect_diagnostic(operand, out),
        IrExpression::Call { args, .. } => {
            for arg in args {
                collect_diagnostic(arg, out);
            }
        }
        IrExpression::Conditional {
            condition,
            consequent,
            alternate,
        } => {
            collect_diagnostic(condition, out);
            collect_diagnostic(consequent, out);
            collect_diagnostic(alternate, out);
        }
        IrExpression::Array { elements } => {
            for e in elements {
                collect_diagnostic(e, out);
            }
        }
        IrExpression::Object { properties } => {
            for p in properties {
                collect_diagnostic(&p.value, out);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// Render an expression as source-like text.
///
/// Nested binary expressions are parenthesised so the output is unambiguous
/// without tracking precedence.
pub fn format_expression(expr: &IrExpression) -> String {
    match expr {
        IrExpression::Literal { value } => format_literal(value),
        IrExpression::Identifier { name } => name.clone(),
        IrExpression::Member { object, property } => {
            format!("{}.{}", format_expression(object), property)
        }
        IrExpression::Binary {
            operator,
            left,
            right,
        } => format!(
            "{} {} {}",
            format_operand(left),
            operator,
            format_operand(right)
        ),
        IrExpression::Unary { operator, operand } => {
            if operator.chars().all(|c| c.is_ascii_alphabetic()) {
                format!("{} {}", operator, format_operand(operand))
            } else {
                format!("{}{}", operator, format_operand(operand))
            }
        }
        IrExpression::Call { callee, args } => format!(
            "{}({})",
            format_expression(callee),
            args.iter().map(format_expression).collect::<Vec<_>>().join(", ")
        ),
        IrExpression::Conditional {
            condition,
            consequent,
            alternate,
        } => format!(
            "{} ? {} : {}",
            format_operand(condition),
            format_operand(consequent),
            format_operand(alternate)
        ),
        IrExpression::Array { elements } => format!(
            "[{}]",
            elements
                .iter()
                .map(format_expression)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        IrExpression::Object { properties } => {
            if properties.is_empty() {
                return "{}".to_owned();
            }
            format!(
                "{{ {} }}",
                properties
                    .iter()
                    .map(|p| format!("{}: {}", p.key, format_expression(&p.value)))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        }
        IrExpression::Lambda { params, body } => {
            if params.len() == 1 {
                format!("{} => {}", params[0], format_expression(body))
            } else {
                format!("({}) => {}", params.join(", "), format_expression(body))
            }
        }
    }
}

fn format_operand(expr: &IrExpression) -> String {
    match expr {
        IrExpression::Binary { .. }
        | IrExpression::Conditional { .. }
        | IrExpression::Lambda { .. } => format!("({})", format_expression(expr)),
        _ => format_expression(expr),
    }
}

fn format_literal(value: &IrValue) -> String {
    match value {
        IrValue::String(s) => format!("{s:?}"),
        IrValue::Number(n) => format_number(*n),
        IrValue::Boolean(b) => b.to_string(),
        IrValue::Null => "null".to_owned(),
    }
}

/// Format a number the way the language displays it: integral values
/// without a trailing `.0`.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else if n.is_nan() {
        "NaN".to_owned()
    } else if n.is_infinite() {
        let text = if n > 0.0 { "Infinity" } else { "-Infinity" };
        text.to_owned()
    } else {
        n.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

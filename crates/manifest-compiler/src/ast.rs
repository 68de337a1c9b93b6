//! Abstract syntax tree produced by the parser.
//!
//! The AST mirrors the surface syntax closely: operators are kept exactly as
//! written (`&&` and `and` are distinct), templates are already lowered to
//! concatenation, and declarations stay nested inside their module/entity.
//! The compiler normalizes and flattens it into the IR.

use manifest_ir::{ActionKind, ConstraintPolarity, PolicyAction, RelationshipKind, Severity};

use crate::lexer::Position;

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// A literal as written in source.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Number(f64),
    Boolean(bool),
    Null,
}

/// An expression together with the position of its first token.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Literal),
    Identifier(String),
    Member {
        object: Box<Expr>,
        property: String,
    },
    Binary {
        operator: String,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        operator: String,
        operand: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Conditional {
        condition: Box<Expr>,
        consequent: Box<Expr>,
        alternate: Box<Expr>,
    },
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Lambda {
        params: Vec<String>,
        body: Box<Expr>,
    },
}

impl Expr {
    pub fn new(kind: ExprKind, position: Position) -> Self {
        Self { kind, position }
    }
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// `name<generics>?`
#[derive(Debug, Clone, PartialEq)]
pub struct TypeRef {
    pub name: String,
    pub generics: Vec<TypeRef>,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub ty: TypeRef,
    pub default: Option<Expr>,
    pub modifiers: Vec<String>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputedProperty {
    pub name: String,
    pub ty: TypeRef,
    pub expression: Expr,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    pub name: String,
    pub kind: RelationshipKind,
    pub target: String,
    pub through: Option<String>,
    pub foreign_key: Option<String>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub name: String,
    pub code: Option<String>,
    pub expression: Expr,
    pub severity: Option<Severity>,
    pub polarity: Option<ConstraintPolarity>,
    pub message: Option<String>,
    pub message_template: Option<String>,
    pub details: Vec<(String, Expr)>,
    pub overrideable: bool,
    pub override_policy: Option<String>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub ty: TypeRef,
    pub required: bool,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub kind: ActionKind,
    pub target: Option<String>,
    pub expression: Option<Expr>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub parameters: Vec<Parameter>,
    pub guards: Vec<Expr>,
    pub constraints: Vec<Constraint>,
    pub actions: Vec<Action>,
    pub emits: Vec<String>,
    pub returns: Option<TypeRef>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub name: String,
    pub action: PolicyAction,
    pub expression: Expr,
    pub message: Option<String>,
    pub position: Position,
}

/// `store Entity in target { ... }`. Inside an entity the entity name is
/// filled in by the parser.
#[derive(Debug, Clone, PartialEq)]
pub struct Store {
    pub entity: String,
    pub target: String,
    pub config: Vec<(String, serde_json::Value)>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub channel: Option<String>,
    pub fields: Vec<(String, TypeRef)>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub name: String,
    pub properties: Vec<Property>,
    pub computed: Vec<ComputedProperty>,
    pub relationships: Vec<Relationship>,
    pub constraints: Vec<Constraint>,
    pub commands: Vec<Command>,
    pub policies: Vec<Policy>,
    pub stores: Vec<Store>,
    pub version_property: Option<String>,
    pub version_at_property: Option<String>,
    pub position: Position,
}

/// Declarations that may appear at top level or inside a module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Declarations {
    pub entities: Vec<Entity>,
    pub commands: Vec<Command>,
    pub policies: Vec<Policy>,
    pub stores: Vec<Store>,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub name: String,
    pub declarations: Declarations,
    pub position: Position,
}

/// A parsed source file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub modules: Vec<Module>,
    pub declarations: Declarations,
}

//! Recursive-descent parser with error recovery.
//!
//! [`parse`] never fails: every problem becomes a [`Diagnostic`] and the
//! parser keeps going so a single pass reports as many errors as possible.
//!
//! # Recovery
//!
//! Productions return `Option<T>`. A `None` means "a diagnostic has been
//! recorded and this production was abandoned"; the enclosing block then
//! calls `Parser::sync`, which skips tokens until a likely statement
//! boundary (a declaration keyword, `;` or `}`).
//!
//! Declaration names go through `Parser::consume_name`, which rejects
//! reserved words with a diagnostic but still hands back a placeholder
//! token, so a misnamed entity does not swallow its whole body. Member
//! access and object keys use `Parser::consume_member_name`, which allows
//! keywords (`order.entity`, `{ event: 1 }`).
//!
//! # Expressions
//!
//! Precedence, lowest to highest:
//!
//! | Level | Operators |
//! |---|---|
//! | ternary | `? :` |
//! | or | `or`, `\|\|` |
//! | and | `and`, `&&` |
//! | equality | `==`, `!=`, `is`, `is not` |
//! | comparison | `<`, `<=`, `>`, `>=`, `in`, `contains` |
//! | additive | `+`, `-` |
//! | multiplicative | `*`, `/`, `%` |
//! | unary | `not`, `!`, `-` |
//! | postfix | `.name`, `(args)`, `[literal]` |
//!
//! Nesting of parentheses, unary operators, conditionals and type arguments
//! is capped at [`MAX_NESTING_DEPTH`]; deeper input is reported as an error
//! rather than recursing further.
//!
//! Template literals are lowered here to `+` chains starting with a string
//! literal, so later stages only ever see plain concatenation.

use manifest_ir::expr::format_number;
use manifest_ir::{ActionKind, ConstraintPolarity, PolicyAction, RelationshipKind, Severity};

use crate::ast::*;
use crate::diagnostics::Diagnostic;
use crate::lexer::{tokenize, Position, Token, TokenKind};

/// Keywords at which recovery stops skipping.
const SYNC_KEYWORDS: &[&str] = &[
    "module",
    "entity",
    "property",
    "computed",
    "derived",
    "hasMany",
    "hasOne",
    "belongsTo",
    "ref",
    "command",
    "policy",
    "store",
    "event",
    "constraint",
    "guard",
    "mutate",
    "compute",
    "emit",
    "publish",
    "persist",
    "effect",
];

const PROPERTY_MODIFIERS: &[&str] = &[
    "required", "unique", "indexed", "private", "readonly", "optional",
];

/// Placeholder text for a name that could not be read.
const MISSING_NAME: &str = "<missing>";

/// Deepest expression or type nesting accepted before parsing gives up.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Result of [`parse`].
#[derive(Debug, Clone)]
pub struct ParseOutput {
    pub program: Program,
    pub errors: Vec<Diagnostic>,
}

/// Parse Manifest source text into an AST plus diagnostics.
pub fn parse(source: &str) -> ParseOutput {
    let mut parser = Parser::new(tokenize(source));
    let program = parser.parse_program();
    ParseOutput {
        program,
        errors: parser.diagnostics,
    }
}

/// Map a severity word to its value.
pub fn severity_from_name(name: &str) -> Option<Severity> {
    match name {
        "ok" => Some(Severity::Ok),
        "warn" => Some(Severity::Warn),
        "block" => Some(Severity::Block),
        _ => None,
    }
}

fn polarity_from_name(name: &str) -> Option<ConstraintPolarity> {
    match name {
        "positive" => Some(ConstraintPolarity::Positive),
        "negative" => Some(ConstraintPolarity::Negative),
        _ => None,
    }
}

fn describe(token: &Token) -> String {
    match token.kind {
        TokenKind::Eof => "end of input".to_owned(),
        TokenKind::String => format!("string {:?}", token.value),
        TokenKind::Template => "template literal".to_owned(),
        _ => format!("'{}'", token.value),
    }
}

// ---------------------------------------------------------------------------
// Parser state
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    diagnostics: Vec<Diagnostic>,
}

impl Parser {
    /// Error tokens are turned into diagnostics up front so the grammar
    /// never has to look at them.
    fn new(raw: Vec<Token>) -> Self {
        let mut diagnostics = Vec::new();
        let mut tokens = Vec::with_capacity(raw.len());
        for token in raw {
            if token.kind == TokenKind::Error {
                diagnostics.push(Diagnostic::error(token.value).at(token.position));
            } else {
                tokens.push(token);
            }
        }
        Self {
            tokens,
            pos: 0,
            depth: 0,
            diagnostics,
        }
    }

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.pos + offset).min(last)]
    }

    fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn check_keyword(&self, word: &str) -> bool {
        self.peek().is_keyword(word)
    }

    fn check_punct(&self, p: &str) -> bool {
        self.peek().is_punct(p)
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        let hit = self.check_keyword(word);
        if hit {
            self.advance();
        }
        hit
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        let hit = self.check_punct(p);
        if hit {
            self.advance();
        }
        hit
    }

    fn eat_op(&mut self, op: &str) -> bool {
        let hit = self.peek().is_operator(op);
        if hit {
            self.advance();
        }
        hit
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        let hit = self.peek().is_ident(word);
        if hit {
            self.advance();
        }
        hit
    }

    /// Whether the token after the current one can be a name.
    fn name_follows(&self) -> bool {
        matches!(
            self.peek_at(1).kind,
            TokenKind::Identifier | TokenKind::Keyword
        )
    }

    fn error_at(&mut self, message: impl Into<String>, position: Position) {
        self.diagnostics.push(Diagnostic::error(message).at(position));
    }

    fn error_here(&mut self, message: impl Into<String>) {
        let position = self.peek().position;
        self.error_at(message, position);
    }

    /// Run `f` one nesting level deeper. Past [`MAX_NESTING_DEPTH`] the
    /// production is abandoned with a diagnostic instead.
    fn nested<T>(&mut self, what: &str, f: impl FnOnce(&mut Self) -> Option<T>) -> Option<T> {
        if self.depth >= MAX_NESTING_DEPTH {
            self.error_here(format!("{what} nested too deeply"));
            return None;
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn warning_at(&mut self, message: impl Into<String>, position: Position) {
        self.diagnostics
            .push(Diagnostic::warning(message).at(position));
    }

    fn expect_punct(&mut self, p: &str, context: &str) -> Option<Token> {
        if self.check_punct(p) {
            return Some(self.advance());
        }
        let found = describe(self.peek());
        self.error_here(format!("expected '{p}' {context}, found {found}"));
        None
    }

    fn expect_op(&mut self, op: &str, context: &str) -> Option<Token> {
        if self.peek().is_operator(op) {
            return Some(self.advance());
        }
        let found = describe(self.peek());
        self.error_here(format!("expected '{op}' {context}, found {found}"));
        None
    }

    /// Consume a declaration name. Reserved words are reported and then
    /// accepted as a placeholder; anything else is reported and left in
    /// place, yielding a `<missing>` placeholder.
    fn consume_name(&mut self, what: &str) -> Token {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Identifier => self.advance(),
            TokenKind::Keyword => {
                self.error_at(
                    format!(
                        "'{}' is a reserved word and cannot be used as {what}",
                        token.value
                    ),
                    token.position,
                );
                self.advance();
                Token {
                    kind: TokenKind::Identifier,
                    ..token
                }
            }
            _ => {
                self.error_at(
                    format!("expected {what}, found {}", describe(&token)),
                    token.position,
                );
                Token {
                    kind: TokenKind::Identifier,
                    value: MISSING_NAME.to_owned(),
                    position: token.position,
                }
            }
        }
    }

    /// Consume a name in member or object-key position, where keywords are
    /// ordinary names.
    fn consume_member_name(&mut self) -> Option<String> {
        match self.peek().kind {
            TokenKind::Identifier | TokenKind::Keyword => Some(self.advance().value),
            _ => {
                let found = describe(self.peek());
                self.error_here(format!("expected a property name, found {found}"));
                None
            }
        }
    }

    /// A bare word or a quoted string (store targets, codes, policy refs).
    fn consume_word_or_string(&mut self, what: &str) -> Option<String> {
        match self.peek().kind {
            TokenKind::Identifier | TokenKind::Keyword | TokenKind::String => {
                Some(self.advance().value)
            }
            _ => {
                let found = describe(self.peek());
                self.error_here(format!("expected {what}, found {found}"));
                None
            }
        }
    }

    /// Skip to a likely statement boundary.
    fn sync(&mut self) {
        while !self.at_eof() {
            let token = self.peek();
            if token.is_punct("}") {
                return;
            }
            if token.is_punct(";") {
                self.advance();
                return;
            }
            if token.kind == TokenKind::Keyword && SYNC_KEYWORDS.contains(&token.value.as_str()) {
                return;
            }
            if token.is_ident("versionProperty") || token.is_ident("versionAtProperty") {
                return;
            }
            self.advance();
        }
    }

    /// Parse `member*` up to the closing brace of a block whose `{` has
    /// already been consumed.
    fn parse_block(&mut self, what: &str, mut member: impl FnMut(&mut Self) -> Option<()>) {
        while !self.check_punct("}") && !self.at_eof() {
            let before = self.pos;
            if member(self).is_none() {
                self.sync();
            }
            if self.pos == before {
                self.advance();
            }
        }
        if !self.eat_punct("}") {
            self.error_here(format!("expected '}}' to close {what}, found end of input"));
        }
    }
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

impl Parser {
    fn parse_program(&mut self) -> Program {
        let mut program = Program::default();
        while !self.at_eof() {
            let before = self.pos;
            let parsed = if self.check_keyword("module") {
                self.parse_module().map(|m| program.modules.push(m))
            } else {
                self.parse_declaration(&mut program.declarations)
            };
            if parsed.is_none() {
                self.sync();
            }
            if self.pos == before {
                self.advance();
            }
        }
        program
    }

    fn parse_module(&mut self) -> Option<Module> {
        let start = self.advance();
        let name = self.consume_name("a module name").value;
        self.expect_punct("{", "after module name")?;
        let mut declarations = Declarations::default();
        self.parse_block("module", |p| {
            if p.check_keyword("module") {
                p.error_here("modules cannot be nested");
                p.advance();
                return None;
            }
            p.parse_declaration(&mut declarations)
        });
        Some(Module {
            name,
            declarations,
            position: start.position,
        })
    }

    fn parse_declaration(&mut self, decls: &mut Declarations) -> Option<()> {
        let token = self.peek().clone();
        match (token.kind, token.value.as_str()) {
            (TokenKind::Keyword, "entity") => decls.entities.push(self.parse_entity()?),
            (TokenKind::Keyword, "command") => decls.commands.push(self.parse_command()?),
            (TokenKind::Keyword, "policy") => decls.policies.push(self.parse_policy()?),
            (TokenKind::Keyword, "store") => decls.stores.push(self.parse_store()?),
            (TokenKind::Keyword, "event") => decls.events.push(self.parse_event()?),
            (TokenKind::Punctuation, ";") => {
                self.advance();
            }
            _ => {
                self.error_at(
                    format!("unexpected {} at declaration level", describe(&token)),
                    token.position,
                );
                self.advance();
                return None;
            }
        }
        Some(())
    }

    fn parse_entity(&mut self) -> Option<Entity> {
        let start = self.advance();
        let name = self.consume_name("an entity name").value;
        self.expect_punct("{", "after entity name")?;
        let mut entity = Entity {
            name,
            properties: Vec::new(),
            computed: Vec::new(),
            relationships: Vec::new(),
            constraints: Vec::new(),
            commands: Vec::new(),
            policies: Vec::new(),
            stores: Vec::new(),
            version_property: None,
            version_at_property: None,
            position: start.position,
        };
        self.parse_block("entity", |p| p.parse_entity_member(&mut entity));
        Some(entity)
    }

    fn parse_entity_member(&mut self, entity: &mut Entity) -> Option<()> {
        let token = self.peek().clone();
        match (token.kind, token.value.as_str()) {
            (TokenKind::Keyword, "property") => entity.properties.push(self.parse_property()?),
            (TokenKind::Keyword, "computed" | "derived") => {
                entity.computed.push(self.parse_computed()?)
            }
            (TokenKind::Keyword, "hasMany" | "hasOne" | "belongsTo" | "ref") => {
                entity.relationships.push(self.parse_relationship()?)
            }
            (TokenKind::Keyword, "constraint") => {
                entity.constraints.push(self.parse_constraint()?)
            }
            (TokenKind::Keyword, "command") => entity.commands.push(self.parse_command()?),
            (TokenKind::Keyword, "policy") => entity.policies.push(self.parse_policy()?),
            (TokenKind::Keyword, "store") => {
                let store = self.parse_entity_store(&entity.name)?;
                entity.stores.push(store);
            }
            (TokenKind::Identifier, "versionProperty") => {
                self.advance();
                self.eat_punct(":");
                entity.version_property = Some(self.consume_name("a version property name").value);
            }
            (TokenKind::Identifier, "versionAtProperty") => {
                self.advance();
                self.eat_punct(":");
                entity.version_at_property =
                    Some(self.consume_name("a version timestamp property name").value);
            }
            (TokenKind::Punctuation, ";") => {
                self.advance();
            }
            _ => {
                self.error_at(
                    format!("unexpected {} in entity body", describe(&token)),
                    token.position,
                );
                self.advance();
                return None;
            }
        }
        Some(())
    }

    fn parse_property(&mut self) -> Option<Property> {
        let start = self.advance();
        let mut modifiers = Vec::new();
        while self.peek().kind == TokenKind::Identifier
            && PROPERTY_MODIFIERS.contains(&self.peek().value.as_str())
            && self.name_follows()
        {
            modifiers.push(self.advance().value);
        }
        let name = self.consume_name("a property name").value;
        self.expect_punct(":", "after property name")?;
        let ty = self.parse_type()?;
        let default = if self.eat_op("=") {
            Some(self.parse_expression()?)
        } else {
            None
        };
        Some(Property {
            name,
            ty,
            default,
            modifiers,
            position: start.position,
        })
    }

    fn parse_computed(&mut self) -> Option<ComputedProperty> {
        let start = self.advance();
        let name = self.consume_name("a computed property name").value;
        self.expect_punct(":", "after computed property name")?;
        let ty = self.parse_type()?;
        self.expect_op("=", "before computed expression")?;
        let expression = self.parse_expression()?;
        Some(ComputedProperty {
            name,
            ty,
            expression,
            position: start.position,
        })
    }

    fn parse_relationship(&mut self) -> Option<Relationship> {
        let start = self.advance();
        let kind = match start.value.as_str() {
            "hasMany" => RelationshipKind::HasMany,
            "hasOne" => RelationshipKind::HasOne,
            "belongsTo" => RelationshipKind::BelongsTo,
            _ => RelationshipKind::Ref,
        };
        let name = self.consume_name("a relationship name").value;
        self.expect_punct(":", "after relationship name")?;
        let target = self.consume_name("a target entity name").value;
        let through = if self.eat_ident("through") {
            Some(self.consume_name("a join entity name").value)
        } else {
            None
        };
        let foreign_key = if self.eat_ident("with") {
            Some(self.consume_name("a foreign key name").value)
        } else {
            None
        };
        Some(Relationship {
            name,
            kind,
            target,
            through,
            foreign_key,
            position: start.position,
        })
    }

    fn parse_type(&mut self) -> Option<TypeRef> {
        let name = match self.peek().kind {
            TokenKind::Identifier | TokenKind::Keyword => self.advance().value,
            _ => {
                let found = describe(self.peek());
                self.error_here(format!("expected a type, found {found}"));
                return None;
            }
        };
        let mut generics = Vec::new();
        if self.eat_op("<") {
            loop {
                generics.push(self.nested("type", Self::parse_type)?);
                if !self.eat_punct(",") {
                    break;
                }
            }
            self.expect_op(">", "to close type arguments")?;
        }
        let nullable = self.eat_op("?");
        Some(TypeRef {
            name,
            generics,
            nullable,
        })
    }

    fn parse_constraint(&mut self) -> Option<Constraint> {
        let start = self.advance();
        let mut overrideable = false;
        if self.peek().is_ident("overrideable") && self.name_follows() {
            self.advance();
            overrideable = true;
        }
        let mut severity = None;
        if self.peek().kind == TokenKind::Identifier && self.name_follows() {
            if let Some(s) = severity_from_name(&self.peek().value) {
                self.advance();
                severity = Some(s);
            }
        }
        let name = self.consume_name("a constraint name").value;
        self.expect_punct(":", "after constraint name")?;
        let expression = self.parse_expression()?;

        let mut constraint = Constraint {
            name,
            code: None,
            expression,
            severity,
            polarity: None,
            message: None,
            message_template: None,
            details: Vec::new(),
            overrideable,
            override_policy: None,
            position: start.position,
        };
        match self.peek().kind {
            TokenKind::String => constraint.message = Some(self.advance().value),
            TokenKind::Template => constraint.message_template = Some(self.advance().value),
            _ => {}
        }
        if self.check_punct("{") {
            self.parse_constraint_options(&mut constraint)?;
        }
        Some(constraint)
    }

    fn parse_constraint_options(&mut self, c: &mut Constraint) -> Option<()> {
        self.advance();
        while !self.check_punct("}") && !self.at_eof() {
            let key_position = self.peek().position;
            let key = self.consume_member_name()?;
            self.expect_punct(":", "after constraint option")?;
            match key.as_str() {
                "code" => c.code = Some(self.consume_word_or_string("a constraint code")?),
                "severity" => {
                    let word = self.consume_word_or_string("a severity")?;
                    match severity_from_name(&word) {
                        Some(s) => c.severity = Some(s),
                        None => self.error_at(
                            format!("unknown severity '{word}' (expected ok, warn or block)"),
                            key_position,
                        ),
                    }
                }
                "polarity" => {
                    let word = self.consume_word_or_string("a polarity")?;
                    match polarity_from_name(&word) {
                        Some(p) => c.polarity = Some(p),
                        None => self.error_at(
                            format!("unknown polarity '{word}' (expected positive or negative)"),
                            key_position,
                        ),
                    }
                }
                "message" => c.message = Some(self.consume_word_or_string("a message")?),
                "messageTemplate" => {
                    let token = self.advance();
                    match token.kind {
                        TokenKind::String | TokenKind::Template => {
                            c.message_template = Some(token.value)
                        }
                        _ => {
                            self.error_at(
                                format!("expected a message template, found {}", describe(&token)),
                                token.position,
                            );
                            return None;
                        }
                    }
                }
                "details" => {
                    self.expect_punct("{", "to open details")?;
                    while !self.check_punct("}") && !self.at_eof() {
                        let name = self.consume_member_name()?;
                        self.expect_punct(":", "after detail name")?;
                        let value = self.parse_expression()?;
                        c.details.push((name, value));
                        self.eat_punct(",");
                    }
                    self.expect_punct("}", "to close details")?;
                }
                "overrideable" => {
                    if self.eat_keyword("true") {
                        c.overrideable = true;
                    } else if self.eat_keyword("false") {
                        c.overrideable = false;
                    } else {
                        self.error_here("expected true or false for 'overrideable'");
                        return None;
                    }
                }
                "overridePolicy" | "overridePolicyRef" => {
                    c.override_policy = Some(self.consume_word_or_string("a policy name")?)
                }
                _ => {
                    self.warning_at(format!("unknown constraint option '{key}'"), key_position);
                    self.parse_expression()?;
                }
            }
            self.eat_punct(",");
        }
        self.expect_punct("}", "to close constraint options")?;
        Some(())
    }

    fn parse_command(&mut self) -> Option<Command> {
        let start = self.advance();
        let name = self.consume_name("a command name").value;
        self.expect_punct("(", "after command name")?;
        let mut parameters = Vec::new();
        if !self.check_punct(")") {
            loop {
                parameters.push(self.parse_parameter()?);
                if !self.eat_punct(",") {
                    break;
                }
            }
        }
        self.expect_punct(")", "to close parameter list")?;

        let mut returns = None;
        let mut emits = Vec::new();
        loop {
            if self.eat_keyword("returns") {
                returns = Some(self.parse_type()?);
            } else if self.eat_keyword("emits") {
                loop {
                    emits.push(self.consume_name("an event name").value);
                    if !self.eat_punct(",") {
                        break;
                    }
                }
            } else {
                break;
            }
        }

        self.expect_punct("{", "to open command body")?;
        let mut command = Command {
            name,
            parameters,
            guards: Vec::new(),
            constraints: Vec::new(),
            actions: Vec::new(),
            emits,
            returns,
            position: start.position,
        };
        self.parse_block("command", |p| p.parse_command_statement(&mut command));
        Some(command)
    }

    fn parse_parameter(&mut self) -> Option<Parameter> {
        let required = self.peek().is_ident("required") && self.name_follows();
        if required {
            self.advance();
        }
        let name = self.consume_name("a parameter name").value;
        self.expect_punct(":", "after parameter name")?;
        let ty = self.parse_type()?;
        let default = if self.eat_op("=") {
            Some(self.parse_expression()?)
        } else {
            None
        };
        Some(Parameter {
            name,
            ty,
            required,
            default,
        })
    }

    fn parse_command_statement(&mut self, command: &mut Command) -> Option<()> {
        let token = self.peek().clone();
        if token.kind == TokenKind::Keyword {
            match token.value.as_str() {
                "guard" => {
                    self.advance();
                    command.guards.push(self.parse_expression()?);
                    return Some(());
                }
                "constraint" => {
                    command.constraints.push(self.parse_constraint()?);
                    return Some(());
                }
                "mutate" | "compute" | "emit" | "publish" | "persist" | "effect" => {
                    command.actions.push(self.parse_action()?);
                    return Some(());
                }
                _ => {}
            }
        }
        if token.is_punct(";") {
            self.advance();
            return Some(());
        }
        self.error_at(
            format!("unexpected {} in command body", describe(&token)),
            token.position,
        );
        self.advance();
        None
    }

    fn parse_action(&mut self) -> Option<Action> {
        let start = self.advance();
        let kind = match start.value.as_str() {
            "mutate" => ActionKind::Mutate,
            "compute" => ActionKind::Compute,
            "emit" => ActionKind::Emit,
            "publish" => ActionKind::Publish,
            "persist" => ActionKind::Persist,
            _ => ActionKind::Effect,
        };
        let (target, expression) = match kind {
            ActionKind::Mutate | ActionKind::Compute => {
                let target = if self.eat_keyword("self") || self.eat_keyword("this") {
                    self.expect_punct(".", "after 'self'")?;
                    self.consume_member_name()?
                } else {
                    self.consume_name("a field name").value
                };
                self.expect_op("=", "in assignment")?;
                (Some(target), Some(self.parse_expression()?))
            }
            ActionKind::Emit | ActionKind::Publish => {
                let event = self.consume_name("an event name").value;
                let payload = if self.starts_expression() {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                (Some(event), payload)
            }
            ActionKind::Persist | ActionKind::Effect => {
                let value = if self.starts_expression() {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                (None, value)
            }
        };
        Some(Action {
            kind,
            target,
            expression,
            position: start.position,
        })
    }

    fn parse_policy(&mut self) -> Option<Policy> {
        let start = self.advance();
        let name = self.consume_name("a policy name").value;
        let mut action = PolicyAction::All;
        if self.peek().kind == TokenKind::Identifier && self.peek_at(1).is_punct(":") {
            if let Some(a) = PolicyAction::from_name(&self.peek().value) {
                self.advance();
                action = a;
            }
        }
        self.expect_punct(":", "after policy name")?;
        let expression = self.parse_expression()?;
        let message = if self.peek().kind == TokenKind::String {
            Some(self.advance().value)
        } else {
            None
        };
        Some(Policy {
            name,
            action,
            expression,
            message,
            position: start.position,
        })
    }

    fn parse_store(&mut self) -> Option<Store> {
        let start = self.advance();
        let entity = self.consume_name("an entity name").value;
        if !self.eat_keyword("in") {
            let found = describe(self.peek());
            self.error_here(format!("expected 'in' after store entity, found {found}"));
            return None;
        }
        self.parse_store_rest(entity, start.position)
    }

    fn parse_entity_store(&mut self, entity: &str) -> Option<Store> {
        let start = self.advance();
        self.eat_keyword("in");
        self.parse_store_rest(entity.to_owned(), start.position)
    }

    fn parse_store_rest(&mut self, entity: String, position: Position) -> Option<Store> {
        let target = self.consume_word_or_string("a store target")?;
        let mut config = Vec::new();
        if self.eat_punct("{") {
            while !self.check_punct("}") && !self.at_eof() {
                let key = match self.peek().kind {
                    TokenKind::String => self.advance().value,
                    _ => self.consume_member_name()?,
                };
                self.expect_punct(":", "after store option")?;
                config.push((key, self.parse_config_value()?));
                self.eat_punct(",");
            }
            self.expect_punct("}", "to close store options")?;
        }
        Some(Store {
            entity,
            target,
            config,
            position,
        })
    }

    fn parse_config_value(&mut self) -> Option<serde_json::Value> {
        let negative = self.eat_op("-");
        let token = self.advance();
        let value = match (token.kind, token.value.as_str()) {
            (TokenKind::Number, text) => {
                let n: f64 = match text.parse() {
                    Ok(n) if f64::is_finite(n) => n,
                    _ => {
                        self.error_at("numeric literal out of range", token.position);
                        return None;
                    }
                };
                let n = if negative { -n } else { n };
                serde_json::json!(n)
            }
            (TokenKind::String | TokenKind::Identifier, text) if !negative => {
                serde_json::Value::String(text.to_owned())
            }
            (TokenKind::Keyword, "true") if !negative => serde_json::Value::Bool(true),
            (TokenKind::Keyword, "false") if !negative => serde_json::Value::Bool(false),
            (TokenKind::Keyword, "null") if !negative => serde_json::Value::Null,
            _ => {
                self.error_at(
                    format!("expected a literal store option value, found {}", describe(&token)),
                    token.position,
                );
                return None;
            }
        };
        Some(value)
    }

    fn parse_event(&mut self) -> Option<Event> {
        let start = self.advance();
        let name = self.consume_name("an event name").value;
        let channel = if self.eat_punct(":") {
            match self.peek().kind {
                TokenKind::String => Some(self.advance().value),
                _ => {
                    let found = describe(self.peek());
                    self.error_here(format!("expected a channel string, found {found}"));
                    return None;
                }
            }
        } else {
            None
        };
        let mut fields = Vec::new();
        if self.eat_punct("{") {
            while !self.check_punct("}") && !self.at_eof() {
                let field = self.consume_member_name()?;
                self.expect_punct(":", "after event field name")?;
                fields.push((field, self.parse_type()?));
                self.eat_punct(",");
            }
            self.expect_punct("}", "to close event payload")?;
        }
        Some(Event {
            name,
            channel,
            fields,
            position: start.position,
        })
    }
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

fn binary(operator: &str, left: Expr, right: Expr) -> Expr {
    let position = left.position;
    Expr::new(
        ExprKind::Binary {
            operator: operator.to_owned(),
            left: Box::new(left),
            right: Box::new(right),
        },
        position,
    )
}

fn string_literal(text: String, position: Position) -> Expr {
    Expr::new(ExprKind::Literal(Literal::String(text)), position)
}

impl Parser {
    fn starts_expression(&self) -> bool {
        let token = self.peek();
        match token.kind {
            TokenKind::Number
            | TokenKind::String
            | TokenKind::Template
            | TokenKind::Identifier => true,
            TokenKind::Keyword => matches!(
                token.value.as_str(),
                "true" | "false" | "null" | "self" | "this" | "not"
            ),
            TokenKind::Punctuation => matches!(token.value.as_str(), "(" | "[" | "{"),
            TokenKind::Operator => matches!(token.value.as_str(), "!" | "-"),
            TokenKind::Error | TokenKind::Eof => false,
        }
    }

    fn parse_expression(&mut self) -> Option<Expr> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Option<Expr> {
        self.nested("expression", Self::parse_conditional)
    }

    fn parse_conditional(&mut self) -> Option<Expr> {
        let condition = self.parse_or()?;
        if !self.eat_op("?") {
            return Some(condition);
        }
        let consequent = self.parse_ternary()?;
        self.expect_punct(":", "in conditional expression")?;
        let alternate = self.parse_ternary()?;
        let position = condition.position;
        Some(Expr::new(
            ExprKind::Conditional {
                condition: Box::new(condition),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            },
            position,
        ))
    }

    fn parse_or(&mut self) -> Option<Expr> {
        let mut left = self.parse_and()?;
        loop {
            let op = if self.check_keyword("or") || self.peek().is_operator("||") {
                self.advance().value
            } else {
                return Some(left);
            };
            let right = self.parse_and()?;
            left = binary(&op, left, right);
        }
    }

    fn parse_and(&mut self) -> Option<Expr> {
        let mut left = self.parse_equality()?;
        loop {
            let op = if self.check_keyword("and") || self.peek().is_operator("&&") {
                self.advance().value
            } else {
                return Some(left);
            };
            let right = self.parse_equality()?;
            left = binary(&op, left, right);
        }
    }

    fn parse_equality(&mut self) -> Option<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = if self.eat_keyword("is") {
                if self.eat_keyword("not") {
                    "is not".to_owned()
                } else {
                    "is".to_owned()
                }
            } else if self.peek().is_operator("==") || self.peek().is_operator("!=") {
                self.advance().value
            } else {
                return Some(left);
            };
            let right = self.parse_comparison()?;
            left = binary(&op, left, right);
        }
    }

    fn parse_comparison(&mut self) -> Option<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let token = self.peek();
            let is_cmp = matches!(
                (token.kind, token.value.as_str()),
                (TokenKind::Operator, "<" | "<=" | ">" | ">=")
                    | (TokenKind::Keyword, "in" | "contains")
            );
            if !is_cmp {
                return Some(left);
            }
            let op = self.advance().value;
            let right = self.parse_additive()?;
            left = binary(&op, left, right);
        }
    }

    fn parse_additive(&mut self) -> Option<Expr> {
        let mut left = self.parse_multiplicative()?;
        while self.peek().is_operator("+") || self.peek().is_operator("-") {
            let op = self.advance().value;
            let right = self.parse_multiplicative()?;
            left = binary(&op, left, right);
        }
        Some(left)
    }

    fn parse_multiplicative(&mut self) -> Option<Expr> {
        let mut left = self.parse_unary()?;
        while ["*", "/", "%"].iter().any(|op| self.peek().is_operator(op)) {
            let op = self.advance().value;
            let right = self.parse_unary()?;
            left = binary(&op, left, right);
        }
        Some(left)
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        let token = self.peek().clone();
        let is_unary = token.is_keyword("not") || token.is_operator("!") || token.is_operator("-");
        if !is_unary {
            return self.parse_postfix();
        }
        self.advance();
        let operand = self.nested("expression", Self::parse_unary)?;
        Some(Expr::new(
            ExprKind::Unary {
                operator: token.value,
                operand: Box::new(operand),
            },
            token.position,
        ))
    }

    fn parse_postfix(&mut self) -> Option<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            let position = expr.position;
            if self.eat_punct(".") {
                let property = self.consume_member_name()?;
                expr = Expr::new(
                    ExprKind::Member {
                        object: Box::new(expr),
                        property,
                    },
                    position,
                );
            } else if self.eat_punct("(") {
                let args = self.parse_list(")")?;
                expr = Expr::new(
                    ExprKind::Call {
                        callee: Box::new(expr),
                        args,
                    },
                    position,
                );
            } else if self.check_punct("[") {
                let open = self.advance();
                let index = self.advance();
                let property = match index.kind {
                    TokenKind::String => index.value,
                    TokenKind::Number => match index.value.parse::<f64>() {
                        Ok(n) if n.is_finite() => format_number(n),
                        _ => index.value,
                    },
                    _ => {
                        self.error_at(
                            "index must be a string or number literal",
                            open.position,
                        );
                        return None;
                    }
                };
                self.expect_punct("]", "to close index")?;
                expr = Expr::new(
                    ExprKind::Member {
                        object: Box::new(expr),
                        property,
                    },
                    position,
                );
            } else {
                return Some(expr);
            }
        }
    }

    /// Comma-separated expressions up to `close`, which is consumed.
    /// A trailing comma is allowed.
    fn parse_list(&mut self, close: &str) -> Option<Vec<Expr>> {
        let mut items = Vec::new();
        while !self.check_punct(close) {
            items.push(self.parse_expression()?);
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(close, "to close list")?;
        Some(items)
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        let token = self.peek().clone();
        let position = token.position;
        let kind = match (token.kind, token.value.as_str()) {
            (TokenKind::Number, text) => {
                self.advance();
                match text.parse::<f64>() {
                    Ok(n) if n.is_finite() => ExprKind::Literal(Literal::Number(n)),
                    Ok(_) => {
                        self.error_at("numeric literal out of range", position);
                        return None;
                    }
                    Err(_) => {
                        self.error_at(format!("invalid number '{text}'"), position);
                        return None;
                    }
                }
            }
            (TokenKind::String, _) => {
                self.advance();
                ExprKind::Literal(Literal::String(token.value))
            }
            (TokenKind::Template, _) => {
                self.advance();
                return self.lower_template(&token.value, position);
            }
            (TokenKind::Keyword, "true") => {
                self.advance();
                ExprKind::Literal(Literal::Boolean(true))
            }
            (TokenKind::Keyword, "false") => {
                self.advance();
                ExprKind::Literal(Literal::Boolean(false))
            }
            (TokenKind::Keyword, "null") => {
                self.advance();
                ExprKind::Literal(Literal::Null)
            }
            (TokenKind::Keyword, "self" | "this") => {
                self.advance();
                ExprKind::Identifier(token.value)
            }
            (TokenKind::Identifier, _) => {
                self.advance();
                if self.eat_op("=>") {
                    let body = self.parse_expression()?;
                    ExprKind::Lambda {
                        params: vec![token.value],
                        body: Box::new(body),
                    }
                } else {
                    ExprKind::Identifier(token.value)
                }
            }
            (TokenKind::Punctuation, "(") => {
                if let Some(params) = self.lambda_params() {
                    let body = self.parse_expression()?;
                    ExprKind::Lambda {
                        params,
                        body: Box::new(body),
                    }
                } else {
                    self.advance();
                    let inner = self.parse_expression()?;
                    self.expect_punct(")", "to close parenthesised expression")?;
                    return Some(inner);
                }
            }
            (TokenKind::Punctuation, "[") => {
                self.advance();
                ExprKind::Array(self.parse_list("]")?)
            }
            (TokenKind::Punctuation, "{") => {
                self.advance();
                let mut properties = Vec::new();
                while !self.check_punct("}") {
                    let key = match self.peek().kind {
                        TokenKind::String => self.advance().value,
                        _ => self.consume_member_name()?,
                    };
                    self.expect_punct(":", "after object key")?;
                    properties.push((key, self.parse_expression()?));
                    if !self.eat_punct(",") {
                        break;
                    }
                }
                self.expect_punct("}", "to close object literal")?;
                ExprKind::Object(properties)
            }
            _ => {
                self.error_at(
                    format!("unexpected {} in expression", describe(&token)),
                    position,
                );
                return None;
            }
        };
        Some(Expr::new(kind, position))
    }

    /// If the tokens at the cursor are `( a, b ) =>`, consume them and
    /// return the parameter names.
    fn lambda_params(&mut self) -> Option<Vec<String>> {
        let mut offset = 1;
        let mut params = Vec::new();
        if !self.peek_at(offset).is_punct(")") {
            loop {
                let token = self.peek_at(offset);
                if token.kind != TokenKind::Identifier {
                    return None;
                }
                params.push(token.value.clone());
                offset += 1;
                if self.peek_at(offset).is_punct(",") {
                    offset += 1;
                } else {
                    break;
                }
            }
        }
        if !self.peek_at(offset).is_punct(")") || !self.peek_at(offset + 1).is_operator("=>") {
            return None;
        }
        self.pos += offset + 2;
        Some(params)
    }

    /// Lower a template literal to a `+` chain that always starts with a
    /// string literal.
    fn lower_template(&mut self, raw: &str, position: Position) -> Option<Expr> {
        let chars: Vec<char> = raw.chars().collect();
        let mut parts: Vec<Expr> = Vec::new();
        let mut text = String::new();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '\\' if i + 1 < chars.len() => {
                    text.push(match chars[i + 1] {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                    i += 2;
                }
                '$' if chars.get(i + 1) == Some(&'{') => {
                    let mut depth = 1usize;
                    let mut j = i + 2;
                    while j < chars.len() {
                        match chars[j] {
                            '{' => depth += 1,
                            '}' => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        }
                        j += 1;
                    }
                    if depth != 0 {
                        self.error_at("unterminated interpolation in template literal", position);
                        return None;
                    }
                    if !text.is_empty() {
                        parts.push(string_literal(std::mem::take(&mut text), position));
                    }
                    let inner: String = chars[i + 2..j].iter().collect();
                    parts.push(self.parse_embedded(&inner, position)?);
                    i = j + 1;
                }
                c => {
                    text.push(c);
                    i += 1;
                }
            }
        }
        if !text.is_empty() {
            parts.push(string_literal(text, position));
        }

        let mut parts = parts.into_iter();
        let mut acc = match parts.next() {
            Some(first) if matches!(first.kind, ExprKind::Literal(Literal::String(_))) => first,
            Some(first) => binary("+", string_literal(String::new(), position), first),
            None => string_literal(String::new(), position),
        };
        for part in parts {
            acc = binary("+", acc, part);
        }
        Some(acc)
    }

    fn parse_embedded(&mut self, source: &str, position: Position) -> Option<Expr> {
        let mut sub = Parser::new(tokenize(source));
        sub.depth = self.depth;
        let expr = sub.parse_expression();
        if expr.is_some() && !sub.at_eof() {
            let found = describe(sub.peek());
            sub.error_here(format!("unexpected {found} in template interpolation"));
        }
        let failed = !sub.diagnostics.is_empty();
        for diagnostic in sub.diagnostics {
            self.diagnostics.push(diagnostic.at(position));
        }
        if failed {
            return None;
        }
        expr
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Program {
        let out = parse(source);
        assert!(out.errors.is_empty(), "unexpected diagnostics: {:?}", out.errors);
        out.program
    }

    fn expr(source: &str) -> Expr {
        let program = parse_ok(&format!("policy p: {source}"));
        program.declarations.policies[0].expression.clone()
    }

    /// Render an AST expression with explicit grouping for assertions.
    fn show(e: &Expr) -> String {
        match &e.kind {
            ExprKind::Literal(Literal::String(s)) => format!("{s:?}"),
            ExprKind::Literal(Literal::Number(n)) => format_number(*n),
            ExprKind::Literal(Literal::Boolean(b)) => b.to_string(),
            ExprKind::Literal(Literal::Null) => "null".to_owned(),
            ExprKind::Identifier(name) => name.clone(),
            ExprKind::Member { object, property } => format!("{}.{property}", show(object)),
            ExprKind::Binary {
                operator,
                left,
                right,
            } => format!("({} {operator} {})", show(left), show(right)),
            ExprKind::Unary { operator, operand } => format!("({operator} {})", show(operand)),
            ExprKind::Call { callee, args } => format!(
                "{}({})",
                show(callee),
                args.iter().map(show).collect::<Vec<_>>().join(", ")
            ),
            ExprKind::Conditional {
                condition,
                consequent,
                alternate,
            } => format!("({} ? {} : {})", show(condition), show(consequent), show(alternate)),
            ExprKind::Array(items) => {
                format!("[{}]", items.iter().map(show).collect::<Vec<_>>().join(", "))
            }
            ExprKind::Object(props) => format!(
                "{{{}}}",
                props
                    .iter()
                    .map(|(k, v)| format!("{k}: {}", show(v)))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            ExprKind::Lambda { params, body } => {
                format!("(({}) => {})", params.join(", "), show(body))
            }
        }
    }

    // -- 1. Precedence ---------------------------------------------------------

    #[test]
    fn precedence_chain() {
        assert_eq!(show(&expr("a or b and c")), "(a or (b and c))");
        assert_eq!(show(&expr("a + b * c < d")), "((a + (b * c)) < d)");
        assert_eq!(show(&expr("not a == b")), "((not a) == b)");
        assert_eq!(show(&expr("a ? b : c ? d : e")), "(a ? b : (c ? d : e))");
        assert_eq!(show(&expr("x is not null")), "(x is not null)");
        assert_eq!(show(&expr("'a' in list && -n > 0")), "((\"a\" in list) && ((- n) > 0))");
    }

    #[test]
    fn postfix_members_calls_and_indexes() {
        assert_eq!(show(&expr("self.items.filter(x => x.done)")), "self.items.filter(((x) => x.done))");
        assert_eq!(show(&expr("row[0].entity")), "row.0.entity");
        assert_eq!(show(&expr("map['key']")), "map.key");
        assert_eq!(show(&expr("(a, b) => a + b")), "((a, b) => (a + b))");
        assert_eq!(show(&expr("{ event: 1, 'x y': [1, 2,] }")), "{event: 1, x y: [1, 2]}");
    }

    #[test]
    fn computed_index_is_rejected() {
        let out = parse("policy p: a[b]");
        assert_eq!(out.errors.len(), 1);
        assert!(out.errors[0].message.contains("index"));
    }

    // -- 2. Templates ----------------------------------------------------------

    #[test]
    fn template_lowers_to_concatenation() {
        assert_eq!(
            show(&expr("`Hello ${user.name}, you have ${n + 1} items`")),
            "((((\"Hello \" + user.name) + \", you have \") + (n + 1)) + \" items\")"
        );
        assert_eq!(show(&expr("`${x}`")), "(\"\" + x)");
        assert_eq!(show(&expr("``")), "\"\"");
    }

    #[test]
    fn bad_template_interpolation_is_reported() {
        let out = parse("policy p: `a ${ + }`");
        assert!(!out.errors.is_empty());
        assert!(out.errors.iter().all(|d| d.line == Some(1)));
    }

    // -- 3. Declarations -------------------------------------------------------

    #[test]
    fn counter_entity() {
        let program = parse_ok(
            r#"
            entity Counter {
                property count: number = 0
                property required unique label: string?
                versionProperty version
                command increment() emits Incremented {
                    guard self.count < 100
                    mutate self.count = self.count + 1
                    emit Tick { at: now() }
                    persist
                }
                store memory
            }
            "#,
        );
        let counter = &program.declarations.entities[0];
        assert_eq!(counter.name, "Counter");
        assert_eq!(counter.properties.len(), 2);
        assert_eq!(counter.properties[1].modifiers, vec!["required", "unique"]);
        assert!(counter.properties[1].ty.nullable);
        assert_eq!(counter.version_property.as_deref(), Some("version"));
        let cmd = &counter.commands[0];
        assert_eq!(cmd.emits, vec!["Incremented"]);
        assert_eq!(cmd.guards.len(), 1);
        assert_eq!(cmd.actions.len(), 3);
        assert_eq!(cmd.actions[0].target.as_deref(), Some("count"));
        assert_eq!(cmd.actions[1].target.as_deref(), Some("Tick"));
        assert!(cmd.actions[1].expression.is_some());
        assert!(cmd.actions[2].expression.is_none());
        assert_eq!(counter.stores[0].entity, "Counter");
        assert_eq!(counter.stores[0].target, "memory");
    }

    #[test]
    fn constraint_forms() {
        let program = parse_ok(
            r#"
            entity Order {
                constraint overrideable warn lowTotal: self.total > 10 "Total too low" {
                    code: LOW_TOTAL,
                    overridePolicy: managers,
                    details: { total: self.total },
                    polarity: positive
                }
                constraint severityHigh: self.risk > 5
                constraint block named: true `Value ${self.total}`
            }
            "#,
        );
        let cs = &program.declarations.entities[0].constraints;
        assert!(cs[0].overrideable);
        assert_eq!(cs[0].severity, Some(Severity::Warn));
        assert_eq!(cs[0].code.as_deref(), Some("LOW_TOTAL"));
        assert_eq!(cs[0].message.as_deref(), Some("Total too low"));
        assert_eq!(cs[0].override_policy.as_deref(), Some("managers"));
        assert_eq!(cs[0].details.len(), 1);
        assert_eq!(cs[0].polarity, Some(ConstraintPolarity::Positive));
        assert_eq!(cs[1].name, "severityHigh");
        assert_eq!(cs[1].polarity, None);
        assert_eq!(cs[2].severity, Some(Severity::Block));
        assert_eq!(cs[2].message_template.as_deref(), Some("Value ${self.total}"));
    }

    #[test]
    fn modules_policies_stores_events() {
        let program = parse_ok(
            r#"
            module Sales {
                entity Order {
                    belongsTo customer: Customer with buyerId
                    hasMany lines: Line
                    policy canRead read: user.id == self.ownerId "not yours"
                }
                event OrderPlaced: "sales.orders" { id: string, total: number }
                store Order in localStorage { path: "orders.json", retries: 3 }
            }
            command ping(required who: string, times: number = 1) returns string {}
            "#,
        );
        let module = &program.modules[0];
        assert_eq!(module.name, "Sales");
        let order = &module.declarations.entities[0];
        assert_eq!(order.relationships[0].kind, RelationshipKind::BelongsTo);
        assert_eq!(order.relationships[0].foreign_key.as_deref(), Some("buyerId"));
        assert_eq!(order.policies[0].action, PolicyAction::Read);
        assert_eq!(order.policies[0].message.as_deref(), Some("not yours"));
        let event = &module.declarations.events[0];
        assert_eq!(event.channel.as_deref(), Some("sales.orders"));
        assert_eq!(event.fields.len(), 2);
        let store = &module.declarations.stores[0];
        assert_eq!(store.target, "localStorage");
        assert_eq!(store.config[1], ("retries".to_owned(), serde_json::json!(3.0)));
        let ping = &program.declarations.commands[0];
        assert!(ping.parameters[0].required);
        assert!(ping.parameters[1].default.is_some());
        assert_eq!(ping.returns.as_ref().map(|t| t.name.as_str()), Some("string"));
    }

    // -- 4. Recovery -----------------------------------------------------------

    #[test]
    fn reserved_word_name_reports_and_continues() {
        let out = parse("entity command { property x: number }\nentity Ok {}");
        assert_eq!(out.errors.len(), 1);
        assert!(out.errors[0].message.contains("reserved word"));
        let entities = &out.program.declarations.entities;
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].name, "command");
        assert_eq!(entities[0].properties.len(), 1);
        assert_eq!(entities[1].name, "Ok");
    }

    #[test]
    fn multiple_errors_collected_in_one_pass() {
        let out = parse(
            r#"
            entity A {
                property : number
                property good: string
                guard x
                property also: number = (1 +
            }
            entity B { property y: number }
            "#,
        );
        assert!(out.errors.len() >= 3, "{:?}", out.errors);
        let names: Vec<&str> = out
            .program
            .declarations
            .entities
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(names, vec!["A", "B"]);
        assert!(out.program.declarations.entities[0]
            .properties
            .iter()
            .any(|p| p.name == "good"));
    }

    #[test]
    fn lexer_errors_become_diagnostics() {
        let out = parse("entity A { property x: number = 1 # }");
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].line, Some(1));
        assert_eq!(out.program.declarations.entities[0].properties.len(), 1);
    }

    #[test]
    fn unclosed_entity_is_reported() {
        let out = parse("entity A { property x: number");
        assert_eq!(out.errors.len(), 1);
        assert!(out.errors[0].message.contains("close entity"));
    }

    // -- 5. Limits -------------------------------------------------------------

    #[test]
    fn moderate_nesting_parses() {
        let source = format!("{}1{}", "(".repeat(32), ")".repeat(32));
        assert_eq!(show(&expr(&source)), "1");
        assert_eq!(show(&expr(&format!("{}x", "-".repeat(32)))).matches('-').count(), 32);
    }

    #[test]
    fn deep_nesting_is_rejected_once_and_recovers() {
        let source = format!(
            "policy p: {}1{}\nentity After {{ property x: number }}",
            "(".repeat(500),
            ")".repeat(500)
        );
        let out = parse(&source);
        let nested: Vec<_> = out
            .errors
            .iter()
            .filter(|d| d.message == "expression nested too deeply")
            .collect();
        assert_eq!(nested.len(), 1, "{:?}", out.errors);
        assert!(out.program.declarations.policies.is_empty());
        assert_eq!(out.program.declarations.entities[0].name, "After");
    }

    #[test]
    fn deep_unary_chains_and_generics_are_rejected() {
        let out = parse(&format!("policy p: {}x", "not ".repeat(300)));
        assert!(out.errors.iter().any(|d| d.message == "expression nested too deeply"));

        let ty = format!("{}number{}", "list<".repeat(300), ">".repeat(300));
        let out = parse(&format!("entity A {{ property x: {ty} }}"));
        assert!(out.errors.iter().any(|d| d.message == "type nested too deeply"));
    }

    #[test]
    fn infinite_number_literals_are_errors() {
        let out = parse("policy p: 1e999 > 0");
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].message, "numeric literal out of range");
        assert!(out.program.declarations.policies.is_empty());
    }
}

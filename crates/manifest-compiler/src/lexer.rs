//! Lexical analysis for Manifest source text.
//!
//! [`tokenize`] turns source text into a flat [`Token`] stream. Every token
//! carries the 1-based line and column of its first character, and the
//! stream always ends with a single [`TokenKind::Eof`] token.
//!
//! The scanner is a [`logos`] state machine. Quoted literals, number tails
//! and block comments are finished by callbacks so the machine never has to
//! backtrack.
//!
//! Reserved words are the fixed [`KEYWORDS`] table. Words
//! that only have meaning in one position (`user`, `memory`, `warn`,
//! `versionProperty`, ...) are *not* reserved; the parser recognises them
//! contextually.
//!
//! Lexing never fails. Unrecognised characters, unterminated strings,
//! template literals and block comments each produce a [`TokenKind::Error`]
//! token whose value is the error message; the parser reports those as
//! diagnostics and keeps going.
//!
//! # Example
//!
//! ```
//! use manifest_compiler::lexer::{tokenize, TokenKind};
//!
//! let tokens = tokenize("entity Counter { property count: number = 0 }");
//! assert_eq!(tokens[0].kind, TokenKind::Keyword);
//! assert_eq!(tokens[1].kind, TokenKind::Identifier);
//! assert_eq!(tokens[1].value, "Counter");
//! assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
//! ```

use std::iter::Peekable;
use std::str::CharIndices;

use logos::{Filter, Lexer, Logos};
use serde::{Deserialize, Serialize};

/// Reserved words. These cannot be used as declaration names. Kept in
/// step with the keyword tokens of the lexer.
pub const KEYWORDS: &[&str] = &[
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
    "emits",
    "returns",
    "guard",
    "constraint",
    "mutate",
    "compute",
    "emit",
    "publish",
    "persist",
    "effect",
    "in",
    "contains",
    "is",
    "not",
    "and",
    "or",
    "true",
    "false",
    "null",
    "self",
    "this",
];

/// Whether `word` is a reserved keyword.
pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// Category of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenKind {
    Keyword,
    Identifier,
    Number,
    /// A quoted string. `value` holds the unescaped contents.
    String,
    /// A backtick template. `value` holds the raw contents between the
    /// backticks (with `\`` unescaped), `${...}` segments intact.
    Template,
    Operator,
    Punctuation,
    /// Lexing problem. `value` holds the message.
    Error,
    Eof,
}

/// 1-based source location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

/// A lexical unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    pub position: Position,
}

impl Token {
    /// Whether this token is the keyword `word`.
    pub fn is_keyword(&self, word: &str) -> bool {
        self.kind == TokenKind::Keyword && self.value == word
    }

    /// Whether this token is the operator `op`.
    pub fn is_operator(&self, op: &str) -> bool {
        self.kind == TokenKind::Operator && self.value == op
    }

    /// Whether this token is the punctuation `p`.
    pub fn is_punct(&self, p: &str) -> bool {
        self.kind == TokenKind::Punctuation && self.value == p
    }

    /// Whether this token is an identifier with the given text.
    pub fn is_ident(&self, word: &str) -> bool {
        self.kind == TokenKind::Identifier && self.value == word
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

/// Contents of a quoted literal, or the fact that it never closed.
#[derive(Debug, Clone, PartialEq)]
enum Quoted {
    Closed(String),
    Unterminated,
}

/// Raw lexemes as recognised by logos. [`tokenize`] maps them onto the
/// public [`Token`] shape.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"\s+")]
#[logos(skip r"//[^\n]*")]
enum Lexeme {
    #[token("module")]
    #[token("entity")]
    #[token("property")]
    #[token("computed")]
    #[token("derived")]
    #[token("hasMany")]
    #[token("hasOne")]
    #[token("belongsTo")]
    #[token("ref")]
    #[token("command")]
    #[token("policy")]
    #[token("store")]
    #[token("event")]
    #[token("emits")]
    #[token("returns")]
    #[token("guard")]
    #[token("constraint")]
    #[token("mutate")]
    #[token("compute")]
    #[token("emit")]
    #[token("publish")]
    #[token("persist")]
    #[token("effect")]
    #[token("in")]
    #[token("contains")]
    #[token("is")]
    #[token("not")]
    #[token("and")]
    #[token("or")]
    #[token("true")]
    #[token("false")]
    #[token("null")]
    #[token("self")]
    #[token("this")]
    Keyword,

    #[regex(r"[\p{Alphabetic}_$][\p{Alphabetic}\p{N}_$]*")]
    Identifier,

    #[regex(r"[0-9]+", number)]
    Number(String),

    #[token("\"", |lex| quoted(lex, '"'))]
    #[token("'", |lex| quoted(lex, '\''))]
    String(Quoted),

    #[token("`", template)]
    Template(Quoted),

    #[token("==")]
    #[token("!=")]
    #[token("<=")]
    #[token(">=")]
    #[token("&&")]
    #[token("||")]
    #[token("=>")]
    #[token("+")]
    #[token("-")]
    #[token("*")]
    #[token("/")]
    #[token("%")]
    #[token("<")]
    #[token(">")]
    #[token("=")]
    #[token("!")]
    #[token("?")]
    Operator,

    #[token("(")]
    #[token(")")]
    #[token("{")]
    #[token("}")]
    #[token("[")]
    #[token("]")]
    #[token(",")]
    #[token(".")]
    #[token(":")]
    #[token(";")]
    Punctuation,

    /// `/* ... */` is skipped; only a comment that runs off the end of the
    /// source is emitted.
    #[token("/*", block_comment)]
    UnterminatedComment,
}

/// Extend a digit run with an optional `.digits` fraction and exponent.
/// Each part is taken only when a digit follows, so `1.x` stays a number
/// followed by member access.
fn number(lex: &mut Lexer<'_, Lexeme>) -> String {
    let mut text = lex.slice().to_owned();
    let rest = lex.remainder().as_bytes();
    let digits_from = |at: usize| {
        rest[at.min(rest.len())..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count()
    };

    let mut used = 0;
    if rest.first() == Some(&b'.') {
        let n = digits_from(1);
        if n > 0 {
            text.push_str(&lex.remainder()[..1 + n]);
            used = 1 + n;
        }
    }
    if matches!(rest.get(used), Some(b'e' | b'E')) {
        let sign = usize::from(matches!(rest.get(used + 1), Some(b'+' | b'-')));
        let n = digits_from(used + 1 + sign);
        if n > 0 {
            text.push('e');
            text.push_str(&lex.remainder()[used + 1..used + 1 + sign + n]);
            used += 1 + sign + n;
        }
    }
    lex.bump(used);
    text
}

/// Read a quoted string after its opening quote, unescaping as we go.
/// A raw newline ends the literal as unterminated.
fn quoted(lex: &mut Lexer<'_, Lexeme>, quote: char) -> Quoted {
    let rest = lex.remainder();
    let mut chars = rest.char_indices().peekable();
    let mut value = String::new();
    while let Some((at, c)) = chars.next() {
        match c {
            c if c == quote => {
                lex.bump(at + c.len_utf8());
                return Quoted::Closed(value);
            }
            '\\' => match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, 'r')) => value.push('\r'),
                Some((_, '0')) => value.push('\0'),
                Some((_, 'u')) => value.push(unicode_escape(&mut chars)),
                Some((_, other)) => value.push(other),
                None => break,
            },
            '\n' => {
                lex.bump(at);
                return Quoted::Unterminated;
            }
            c => value.push(c),
        }
    }
    lex.bump(rest.len());
    Quoted::Unterminated
}

/// Four hex digits after `\u`. Invalid escapes yield U+FFFD.
fn unicode_escape(chars: &mut Peekable<CharIndices<'_>>) -> char {
    let mut code = 0u32;
    for _ in 0..4 {
        match chars.peek().and_then(|(_, c)| c.to_digit(16)) {
            Some(d) => {
                code = code * 16 + d;
                chars.next();
            }
            None => return char::REPLACEMENT_CHARACTER,
        }
    }
    char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER)
}

/// Raw template contents up to the closing backtick. Only an escaped
/// backtick is unescaped; interpolations are left for the parser.
fn template(lex: &mut Lexer<'_, Lexeme>) -> Quoted {
    let rest = lex.remainder();
    let mut chars = rest.char_indices().peekable();
    let mut value = String::new();
    while let Some((at, c)) = chars.next() {
        match c {
            '`' => {
                lex.bump(at + 1);
                return Quoted::Closed(value);
            }
            '\\' if matches!(chars.peek(), Some((_, '`'))) => {
                chars.next();
                value.push('`');
            }
            c => value.push(c),
        }
    }
    lex.bump(rest.len());
    Quoted::Unterminated
}

fn block_comment(lex: &mut Lexer<'_, Lexeme>) -> Filter<()> {
    match lex.remainder().find("*/") {
        Some(end) => {
            lex.bump(end + 2);
            Filter::Skip
        }
        None => {
            lex.bump(lex.remainder().len());
            Filter::Emit(())
        }
    }
}

/// Converts byte offsets to 1-based line/column, counting columns in
/// characters. Offsets must be queried in increasing order.
struct LineIndex<'s> {
    source: &'s str,
    offset: usize,
    here: Position,
}

impl<'s> LineIndex<'s> {
    fn new(source: &'s str) -> Self {
        Self {
            source,
            offset: 0,
            here: Position { line: 1, column: 1 },
        }
    }

    fn position(&mut self, offset: usize) -> Position {
        for c in self.source[self.offset..offset].chars() {
            if c == '\n' {
                self.here.line += 1;
                self.here.column = 1;
            } else {
                self.here.column += 1;
            }
        }
        self.offset = offset;
        self.here
    }
}

/// Tokenize source text.
pub fn tokenize(source: &str) -> Vec<Token> {
    let mut lexer = Lexeme::lexer(source);
    let mut lines = LineIndex::new(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        let position = lines.position(lexer.span().start);
        let slice = lexer.slice();
        let (kind, value) = match result {
            Ok(Lexeme::Keyword) => (TokenKind::Keyword, slice.to_owned()),
            Ok(Lexeme::Identifier) => (TokenKind::Identifier, slice.to_owned()),
            Ok(Lexeme::Number(text)) => (TokenKind::Number, text),
            Ok(Lexeme::String(Quoted::Closed(text))) => (TokenKind::String, text),
            Ok(Lexeme::String(Quoted::Unterminated)) => {
                (TokenKind::Error, "unterminated string literal".to_owned())
            }
            Ok(Lexeme::Template(Quoted::Closed(text))) => (TokenKind::Template, text),
            Ok(Lexeme::Template(Quoted::Unterminated)) => {
                (TokenKind::Error, "unterminated template literal".to_owned())
            }
            Ok(Lexeme::Operator) => (TokenKind::Operator, slice.to_owned()),
            Ok(Lexeme::Punctuation) => (TokenKind::Punctuation, slice.to_owned()),
            Ok(Lexeme::UnterminatedComment) => {
                (TokenKind::Error, "unterminated block comment".to_owned())
            }
            Err(()) => {
                let c = slice.chars().next().unwrap_or(char::REPLACEMENT_CHARACTER);
                (TokenKind::Error, format!("unexpected character '{c}'"))
            }
        };
        tokens.push(Token {
            kind,
            value,
            position,
        });
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        value: String::new(),
        position: lines.position(source.len()),
    });
    tokens
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).into_iter().map(|t| t.kind).collect()
    }

    fn values(src: &str) -> Vec<String> {
        tokenize(src).into_iter().map(|t| t.value).collect()
    }

    #[test]
    fn empty_source_yields_only_eof() {
        let tokens = tokenize("");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Eof);
        assert_eq!(tokens[0].position, Position { line: 1, column: 1 });
    }

    #[test]
    fn keywords_are_distinguished_from_identifiers() {
        assert_eq!(
            kinds("entity user self memory"),
            vec![
                TokenKind::Keyword,
                TokenKind::Identifier,
                TokenKind::Keyword,
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn two_char_operators_win_over_single() {
        assert_eq!(
            values("a<=b==c=>d!=e&&f||g"),
            vec!["a", "<=", "b", "==", "c", "=>", "d", "!=", "e", "&&", "f", "||", "g", ""]
        );
    }

    #[test]
    fn numbers_with_fraction_and_exponent() {
        assert_eq!(values("3 4.25 1e3 2.5E-2"), vec!["3", "4.25", "1e3", "2.5e-2", ""]);
    }

    #[test]
    fn member_access_after_number_is_not_a_fraction() {
        assert_eq!(
            kinds("1.x"),
            vec![
                TokenKind::Number,
                TokenKind::Punctuation,
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn strings_are_unescaped() {
        let tokens = tokenize(r#""a\"b\n" 'cA'"#);
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].value, "a\"b\n");
        assert_eq!(tokens[1].value, "cA");
    }

    #[test]
    fn template_keeps_interpolations_raw() {
        let tokens = tokenize("`Hello ${user.name}!`");
        assert_eq!(tokens[0].kind, TokenKind::Template);
        assert_eq!(tokens[0].value, "Hello ${user.name}!");
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            values("a // line\n/* block\n comment */ b"),
            vec!["a", "b", ""]
        );
    }

    #[test]
    fn positions_track_lines_and_columns() {
        let tokens = tokenize("entity A {\n  property x: number\n}");
        let prop = tokens.iter().find(|t| t.value == "property").unwrap();
        assert_eq!(prop.position, Position { line: 2, column: 3 });
        let close = tokens.iter().find(|t| t.value == "}").unwrap();
        assert_eq!(close.position, Position { line: 3, column: 1 });
    }

    #[test]
    fn unknown_character_becomes_error_token() {
        let tokens = tokenize("a # b");
        assert_eq!(tokens[1].kind, TokenKind::Error);
        assert!(tokens[1].value.contains('#'));
        assert_eq!(tokens[2].value, "b");
    }

    #[test]
    fn keyword_table_matches_keyword_tokens() {
        for word in KEYWORDS {
            let tokens = tokenize(word);
            assert_eq!(tokens[0].kind, TokenKind::Keyword, "{word}");
            assert_eq!(tokens[0].value, *word);
            let longer = tokenize(&format!("{word}s"));
            assert_eq!(longer[0].kind, TokenKind::Identifier, "{word}s");
        }
        assert!(!is_keyword("user"));
    }

    #[test]
    fn unicode_identifiers_and_escapes() {
        let tokens = tokenize("größe $id \"\\u00e9\\uZZ\"");
        assert_eq!(tokens[0].kind, TokenKind::Identifier);
        assert_eq!(tokens[0].value, "größe");
        assert_eq!(tokens[1].value, "$id");
        assert_eq!(tokens[2].value, "é\u{FFFD}ZZ");
        assert_eq!(tokens[3].position, Position { line: 1, column: 23 });
    }

    #[test]
    fn exponent_without_digits_is_not_consumed() {
        assert_eq!(values("1e 2e+ 3.5"), vec!["1", "e", "2", "e", "+", "3.5", ""]);
    }

    #[test]
    fn comment_that_closes_immediately_is_skipped() {
        assert_eq!(values("a /**/ b /***/ c"), vec!["a", "b", "c", ""]);
    }

    #[test]
    fn lone_ampersand_is_an_error() {
        let tokens = tokenize("a & b");
        assert_eq!(tokens[1].kind, TokenKind::Error);
        assert_eq!(tokens[1].value, "unexpected character '&'");
        assert_eq!(tokens[2].value, "b");
    }

    #[test]
    fn unterminated_literals_become_error_tokens() {
        assert_eq!(tokenize("\"abc")[0].kind, TokenKind::Error);
        assert_eq!(tokenize("`abc")[0].kind, TokenKind::Error);
        assert_eq!(tokenize("/* abc")[0].kind, TokenKind::Error);
    }
}

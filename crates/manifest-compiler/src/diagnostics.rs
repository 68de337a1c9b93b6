//! Structured compiler diagnostics.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::lexer::Position;

/// How serious a diagnostic is. Any `Error` prevents IR emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Info,
}

/// A problem found while lexing, parsing or compiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub severity: DiagnosticSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Error,
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Warning,
            message: message.into(),
            line: None,
            column: None,
        }
    }

    /// Attach a source location.
    pub fn at(mut self, position: Position) -> Self {
        self.line = Some(position.line);
        self.column = Some(position.column);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == DiagnosticSeverity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity {
            DiagnosticSeverity::Error => "error",
            DiagnosticSeverity::Warning => "warning",
            DiagnosticSeverity::Info => "info",
        };
        match (self.line, self.column) {
            (Some(line), Some(column)) => {
                write!(f, "{label} at {line}:{column}: {}", self.message)
            }
            (Some(line), None) => write!(f, "{label} at line {line}: {}", self.message),
            _ => write!(f, "{label}: {}", self.message),
        }
    }
}

/// Whether any diagnostic in the slice is an error.
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_location_when_present() {
        let d = Diagnostic::error("boom").at(Position { line: 3, column: 7 });
        assert_eq!(d.to_string(), "error at 3:7: boom");
        assert_eq!(Diagnostic::warning("hm").to_string(), "warning: hm");
    }

    #[test]
    fn has_errors_ignores_warnings() {
        assert!(!has_errors(&[Diagnostic::warning("a")]));
        assert!(has_errors(&[Diagnostic::warning("a"), Diagnostic::error("b")]));
    }

    #[test]
    fn serializes_without_missing_location() {
        let json = serde_json::to_value(Diagnostic::error("x")).unwrap();
        assert_eq!(json, serde_json::json!({"severity": "error", "message": "x"}));
    }
}

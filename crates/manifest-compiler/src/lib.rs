//! Manifest compiler -- source text to hash-stamped IR.
//!
//! The pipeline is leaves-first:
//!
//! - [`lexer`]: source text → [`Token`](lexer::Token) stream with positions.
//! - [`parser`]: tokens → [`ast::Program`], collecting [`Diagnostic`]s and
//!   recovering after errors.
//! - [`compiler`]: AST → [`manifest_ir::Ir`] with semantic validation and
//!   provenance hashing.
//! - [`cache`]: an LRU + TTL cache of compiled IR keyed by content hash,
//!   injected into an [`IrCompiler`].
//!
//! # Example
//!
//! ```
//! use manifest_compiler::compile_to_ir;
//!
//! let out = compile_to_ir(
//!     "entity Counter {
//!          property count: number = 0
//!          command increment() {
//!              guard self.count < 100
//!              mutate self.count = self.count + 1
//!          }
//!      }",
//! );
//! let ir = out.ir.expect("valid program");
//! assert_eq!(ir.entities[0].name, "Counter");
//! assert!(manifest_ir::provenance::verify_ir_hash(&ir, None).valid);
//! ```

#![deny(unsafe_code)]

pub mod ast;
pub mod cache;
pub mod compiler;
pub mod diagnostics;
pub mod lexer;
pub mod parser;

pub use cache::{IrCache, IrCacheConfig, IrCacheStats};
pub use compiler::{compile_to_ir, CompileOptions, CompileOutput, IrCompiler, COMPILER_VERSION};
pub use diagnostics::{Diagnostic, DiagnosticSeverity};
pub use lexer::tokenize;
pub use parser::{parse, ParseOutput};

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::cache::{IrCache, IrCacheConfig, IrCacheStats};
    pub use crate::compiler::{compile_to_ir, CompileOptions, CompileOutput, IrCompiler};
    pub use crate::diagnostics::{Diagnostic, DiagnosticSeverity};
    pub use crate::lexer::{tokenize, Token, TokenKind};
    pub use crate::parser::{parse, ParseOutput};
}

//! trslisp - a small Lisp dialect with a built-in term-rewriting engine
//!
//! This crate provides a tree-walking evaluator over S-expressions together with a
//! rewrite engine that applies `pattern -> template` rules to data until no rule
//! fires anymore.
//!
//! ```lisp
//! (+ 3 4 (* 5 6))                 ; => 37
//! (DEFUN SQ (X) (* X X)) (SQ 5)   ; => 25
//! (/ 1 3)                         ; => 1/3, exact rationals
//! (TRS '(f 2 3)
//!      (f X:number Y:number) -> [+ X Y])   ; => 5
//! ```
//!
//! ## Semantics at a glance
//!
//! - Identifiers are case-folded to upper case by the reader.
//! - `NIL` is the only false value; everything else is truthy.
//! - Numbers form a tower `Int -> Ratio -> Float`. Ratios are always kept in lowest terms.
//! - Scoping is dynamic: a function body sees the bindings of its callers.
//! - `SETF` mutates places in place, so shared list structure observes the change.
//! - Execution can be bounded by a wall-clock budget, checked once per evaluated node.
//!
//! ## Modules
//!
//! - `ast`: the value model shared by every other module
//! - `numeric`: exact ratios and the numeric promotion rules
//! - `evaluator`: core evaluation engine and scope handling
//! - `builtinops`: built-in operation registry
//! - `rewrite`: pattern matcher, splice operator and fixpoint driver
//! - `reader`: S-expression and TRS parsing from text (feature `reader`)
//! - `session`: load/run facade with output capture and breakpoints
//! - `json`: JSON conversion of values and run reports (feature `json`)

use std::fmt;

use crate::builtinops::Arity;

/// Maximum parsing depth to prevent stack overflow attacks
pub const MAX_PARSE_DEPTH: usize = 128;

/// Default maximum evaluation depth.
/// Counts nested `eval` invocations, including function calls and special forms.
/// Can be lowered or raised per interpreter via [`evaluator::EvalConfig`].
pub const DEFAULT_MAX_EVAL_DEPTH: usize = 512;

/// Categorizes the different kinds of parsing errors.
#[derive(Debug, PartialEq, Clone)]
pub enum ParseErrorKind {
    /// Invalid or unexpected syntax (bad tokens, malformed expressions)
    InvalidSyntax,
    /// Input ended before the expression was complete (EOF, unterminated string, unclosed parens)
    Incomplete,
    /// Expression nesting exceeded the maximum parse depth
    TooDeeplyNested,
    /// Extra input found after a complete, valid expression
    TrailingContent,
    /// Valid language syntax that is intentionally not supported in this implementation
    Unsupported,
    /// Implementation-imposed limit exceeded (integer overflow, etc.)
    ImplementationLimit,
}

/// A structured error providing detailed information about a parsing failure.
#[derive(Debug, PartialEq, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Context snippet from the input showing where the error occurred (max 100 chars)
    pub context: Option<String>,
    /// The problematic token or character encountered, if identifiable
    pub found: Option<String>,
}

impl ParseError {
    pub fn new(
        kind: ParseErrorKind,
        message: impl Into<String>,
        context: Option<String>,
        found: Option<String>,
    ) -> Self {
        ParseError {
            kind,
            message: message.into(),
            context,
            found,
        }
    }

    /// Create a simple ParseError with a kind and message but no context
    pub fn from_message(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message, None, None)
    }

    /// Create a ParseError with context extracted from input at a given byte offset
    pub fn with_context(
        kind: ParseErrorKind,
        message: impl Into<String>,
        input: &str,
        error_offset: usize,
    ) -> Self {
        Self::with_context_and_found(kind, message, input, error_offset, None)
    }

    pub fn with_context_and_found(
        kind: ParseErrorKind,
        message: impl Into<String>,
        input: &str,
        error_offset: usize,
        found: Option<String>,
    ) -> Self {
        const MAX_CONTEXT: usize = 100;

        // Offsets are byte based; step back to a char boundary before slicing.
        let mut context_start = error_offset.min(input.len()).saturating_sub(20);
        while !input.is_char_boundary(context_start) {
            context_start -= 1;
        }

        let context_str: String = input[context_start..].chars().take(MAX_CONTEXT).collect();

        let mut display_context = String::new();
        if context_start > 0 {
            display_context.push_str("[...]");
        }
        display_context.push_str(&context_str);
        if context_start + context_str.len() < input.len() {
            display_context.push_str("[...]");
        }

        let display_context = display_context.replace('\n', "\\n").replace('\r', "");

        Self::new(kind, message, Some(display_context), found)
    }
}

/// Error types for the interpreter.
///
/// Everything except [`Error::ParseError`] is a runtime error: it aborts the
/// toplevel form being evaluated, while effects of earlier forms are kept.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    ParseError(ParseError),
    EvalError(String),
    TypeError(String),
    UnboundVariable(String),
    UnknownFunction(String),
    ArityError {
        expected: Arity,
        got: usize,
        expression: Option<String>,
    },
    /// The wall-clock budget of a run was exceeded
    Timeout,
    AssertionFailed(String),
}

impl Error {
    /// Create an ArityError without expression context
    pub fn arity_error(expected: Arity, got: usize) -> Self {
        Error::ArityError {
            expected,
            got,
            expression: None,
        }
    }

    /// Create an ArityError with expression context
    pub fn arity_error_with_expr(expected: Arity, got: usize, expression: String) -> Self {
        Error::ArityError {
            expected,
            got,
            expression: Some(expression),
        }
    }

    pub fn is_runtime(&self) -> bool {
        !matches!(self, Error::ParseError(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ParseError(e) => {
                write!(f, "ParseError: {}", e.message)?;
                if let Some(found) = &e.found {
                    write!(f, "\nFound: {found}")?;
                }
                if let Some(context) = &e.context {
                    write!(f, "\nContext: {context}")?;
                }
                Ok(())
            }
            Error::EvalError(msg) => write!(f, "RuntimeError: {msg}"),
            Error::TypeError(msg) => write!(f, "RuntimeError: type error: {msg}"),
            Error::UnboundVariable(var) => write!(f, "RuntimeError: unknown symbol {var}"),
            Error::UnknownFunction(name) => write!(f, "RuntimeError: unknown function {name}"),
            Error::ArityError {
                expected,
                got,
                expression,
            } => match expression {
                Some(expr) => write!(
                    f,
                    "RuntimeError: {expr}: expected {expected} arguments, got {got}"
                ),
                None => write!(f, "RuntimeError: expected {expected} arguments, got {got}"),
            },
            Error::Timeout => write!(f, "RuntimeError: max allowed runtime exceeded!"),
            Error::AssertionFailed(msg) => write!(f, "RuntimeError: ASSERT FAILED: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

pub mod ast;
pub mod builtinops;
pub mod evaluator;
pub mod numeric;
pub mod rewrite;
pub mod session;

#[cfg(feature = "json")]
pub mod json;

#[cfg(feature = "reader")]
pub mod reader;

pub use ast::Value;
pub use evaluator::{DebugSnapshot, EvalConfig, Interpreter};
pub use session::Session;

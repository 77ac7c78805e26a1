//! scheval - a tree-walking evaluator for a small Scheme dialect
//!
//! The crate evaluates programs made of nested pair lists. It resolves lexical
//! bindings through chained frames, dispatches a fixed set of special forms,
//! applies user closures and native primitives, and returns one value per
//! top-level form.
//!
//! ```scheme
//! (define make-adder (lambda (n) (lambda (x) (+ x n))))
//! ((make-adder 5) 3)          ; => 8
//! (let* ((x 1) (y (+ x 1))) y) ; => 2
//! (/ 6 4)                      ; => 1.500000
//! ```
//!
//! ## Strict Typing
//!
//! - `if` and `cond` conditions must be booleans (no "truthiness")
//! - Arithmetic accepts integers and doubles only; any double operand makes
//!   the result a double
//! - Integer overflow is reported instead of wrapping
//! - Closures and primitives check their argument counts
//!
//! ## Modules
//!
//! - `ast`: runtime values, pairs and closures
//! - `evaluator`: environments, special forms and the application protocol
//! - `builtinops`: the primitive procedure registry
//! - `printer`: external representation of values
//! - `scheme`: reader turning source text into pair-list data
//! - `interpreter`: a session owning the global frame, used by the drivers
//!
//! Evaluation is single threaded and fully recursive. There is no tail-call
//! elimination: each nested evaluation grows the host stack on demand, and
//! [`MAX_EVAL_DEPTH`] turns runaway nesting into an error.

use std::fmt;

/// Maximum parsing depth to prevent stack overflow attacks
/// This limits deeply nested structures in the reader
pub const MAX_PARSE_DEPTH: usize = 64;

/// Maximum evaluation depth to prevent stack overflow in recursive evaluation
/// Every nested `eval` (sub-form, argument, closure body) counts one level
pub const MAX_EVAL_DEPTH: usize = 10_000;

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
    /// Implementation-imposed limit exceeded (integer literal out of range)
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
    /// Create a ParseError with all fields
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

    /// Create a ParseError with context extracted from input at a given offset
    pub fn with_context(
        kind: ParseErrorKind,
        message: impl Into<String>,
        input: &str,
        error_offset: usize,
    ) -> Self {
        Self::with_context_and_found(kind, message, input, error_offset, None)
    }

    /// Create a ParseError with context and found token
    pub fn with_context_and_found(
        kind: ParseErrorKind,
        message: impl Into<String>,
        input: &str,
        error_offset: usize,
        found: Option<String>,
    ) -> Self {
        const MAX_CONTEXT: usize = 100;

        let context_start = error_offset.saturating_sub(20);

        let context_str: String = input
            .chars()
            .skip(context_start)
            .take(MAX_CONTEXT)
            .collect();

        let mut display_context = String::new();
        if context_start > 0 {
            display_context.push_str("[...]");
        }
        display_context.push_str(&context_str);
        if context_start + context_str.chars().count() < input.chars().count() {
            display_context.push_str("[...]");
        }

        // Newlines would break the single-line error report
        let display_context = display_context.replace('\n', "\\n").replace('\r', "");

        Self::new(kind, message, Some(display_context), found)
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(found) = &self.found {
            write!(f, "\nFound: {found}")?;
        }
        if let Some(context) = &self.context {
            write!(f, "\nContext: {context}")?;
        }
        Ok(())
    }
}

/// Error types for the interpreter
///
/// Every failure is fatal for the form being evaluated: the first error is
/// propagated unchanged to the caller and no partial result is produced.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Reader failure (reported by drivers as a syntax error)
    #[error("ParseError: {0}")]
    ParseError(ParseError),
    /// Symbol not bound in any enclosing frame (lookup or `set!`)
    #[error("Unbound variable: {0}")]
    UnboundVariable(String),
    /// Operand of the wrong variant
    #[error("Type error: {0}")]
    TypeError(String),
    /// Too few or too many arguments for a closure, primitive or special form
    #[error("{}", arity_message(.expected, .got, .expression))]
    ArityError {
        expected: usize,
        got: usize,
        expression: Option<String>, // Optional expression context
    },
    /// Badly shaped special form: duplicate names, bad binding lists, non-symbols
    #[error("Malformed syntax: {0}")]
    MalformedSyntax(String),
    /// Application of a value that is neither a closure nor a primitive
    #[error("Not a function: {0}")]
    NotAFunction(String),
    /// Runtime failures outside the categories above (overflow, depth limit)
    #[error("EvaluationError: {0}")]
    EvalError(String),
}

fn arity_message(expected: &usize, got: &usize, expression: &Option<String>) -> String {
    let shortfall = if got < expected {
        "not enough arguments"
    } else {
        "too many arguments"
    };
    match expression {
        Some(expr) => {
            format!("ArityError: expression {expr}: {shortfall} (expected {expected}, got {got})")
        }
        None => format!("ArityError: {shortfall} (expected {expected}, got {got})"),
    }
}

impl Error {
    /// Create an ArityError without expression context
    pub fn arity_error(expected: usize, got: usize) -> Self {
        Error::ArityError {
            expected,
            got,
            expression: None,
        }
    }

    /// Create an ArityError with expression context
    pub fn arity_error_with_expr(expected: usize, got: usize, expression: String) -> Self {
        Error::ArityError {
            expected,
            got,
            expression: Some(expression),
        }
    }

    /// True for errors raised while reading source text, false for errors
    /// raised while evaluating it
    pub fn is_syntax_error(&self) -> bool {
        matches!(self, Error::ParseError(_))
    }

    /// Render the error the way the drivers report fatal failures
    pub fn report(&self) -> String {
        match self {
            Error::ParseError(e) => format!("Syntax error: {e}"),
            other => format!("Evaluation error: {other}"),
        }
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::ParseError(err)
    }
}

pub mod ast;
pub mod builtinops;
pub mod evaluator;
pub mod interpreter;
pub mod printer;

#[cfg(feature = "scheme")]
pub mod scheme;

pub use interpreter::Interpreter;

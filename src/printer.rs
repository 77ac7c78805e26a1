//! External (textual) representation of values.
//!
//! Lists print in parenthesized form, with ` . ` before an improper tail.
//! Doubles always show six fractional digits so they stay distinguishable
//! from integers and read back as doubles. Void renders as nothing; the
//! drivers skip it entirely.
//!
//! Printing follows pair links without cycle detection: a structure made
//! cyclic with `set-car!` or `set-cdr!` recurses until the host stack is
//! exhausted.

use crate::ast::Value;
use std::fmt;

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "{n}"),
            Value::Double(d) => write!(f, "{d:.6}"),
            Value::String(s) => {
                write!(f, "\"")?;
                for ch in s.chars() {
                    match ch {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        '\n' => write!(f, "\\n")?,
                        '\t' => write!(f, "\\t")?,
                        '\r' => write!(f, "\\r")?,
                        c => write!(f, "{c}")?,
                    }
                }
                write!(f, "\"")
            }
            Value::Bool(b) => write!(f, "{}", if *b { "#t" } else { "#f" }),
            Value::Symbol(s) => write!(f, "{s}"),
            Value::Pair(_) => {
                write!(f, "(")?;
                let mut elements = self.iter();
                for (i, elem) in elements.by_ref().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{elem}")?;
                }
                match elements.tail() {
                    Value::Empty => {}
                    tail => write!(f, " . {tail}")?,
                }
                write!(f, ")")
            }
            Value::Empty => write!(f, "()"),
            Value::Void => Ok(()),
            Value::Closure(_) => write!(f, "#<procedure>"),
            Value::Primitive { id, .. } => write!(f, "#<primitive:{id}>"),
        }
    }
}

/// Join the displayable results of a program with single spaces, skipping
/// Void results
pub fn render_results(results: &[Value]) -> String {
    results
        .iter()
        .filter(|value| !value.is_void())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

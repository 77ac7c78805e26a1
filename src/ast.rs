//! This module defines the core runtime value type and the helpers used to
//! build and take apart list structure. The main enum, [`Value`], covers every
//! value the evaluator can produce or consume: integers and doubles (kept as
//! distinct variants), strings, booleans, symbols, mutable pairs, the empty
//! list, the "no value" marker, closures and primitives. Source programs are
//! represented with the same type: a compound form is a chain of pairs ending
//! in [`Value::Empty`].
//!
//! Pairs are shared through `Rc` and their two cells are mutable, so
//! `set-car!` and `set-cdr!` can be observed through every reference to the
//! pair and can build cyclic structure. Nothing here detects cycles: walking a
//! cyclic list (printing, equality, [`Value::list_to_vec`]) does not
//! terminate. Reference cycles (a closure stored in the frame it captured, a
//! pair pointing back to itself) are never reclaimed before the process exits.
//!
//! Ergonomic helper functions such as [`val`], [`sym`] and [`nil`] are
//! provided for convenient construction in code and tests, together with
//! conversion traits for common Rust types.

use crate::Error;
use crate::evaluator::Environment;
use crate::evaluator::intooperation::OperationFn;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// Type alias for integer values in interpreter
pub(crate) type NumberType = i64;

/// A mutable two-celled structural unit; chains of pairs ending in
/// [`Value::Empty`] form lists.
pub struct Pair {
    car: RefCell<Value>,
    cdr: RefCell<Value>,
}

impl Pair {
    pub fn new(car: Value, cdr: Value) -> Self {
        Pair {
            car: RefCell::new(car),
            cdr: RefCell::new(cdr),
        }
    }

    pub fn car(&self) -> Value {
        self.car.borrow().clone()
    }

    pub fn cdr(&self) -> Value {
        self.cdr.borrow().clone()
    }

    /// Replace the head cell in place
    pub fn set_car(&self, value: Value) {
        *self.car.borrow_mut() = value;
    }

    /// Replace the tail cell in place
    pub fn set_cdr(&self, value: Value) {
        *self.cdr.borrow_mut() = value;
    }
}

/// Releases the pairs reachable through both cells with an explicit worklist,
/// so a long list is freed without one native frame per element.
impl Drop for Pair {
    fn drop(&mut self) {
        let car = std::mem::replace(self.car.get_mut(), Value::Empty);
        let cdr = std::mem::replace(self.cdr.get_mut(), Value::Empty);
        if !matches!(car, Value::Pair(_)) && !matches!(cdr, Value::Pair(_)) {
            return;
        }
        let mut pending = vec![car, cdr];
        while let Some(value) = pending.pop() {
            // A pair still shared elsewhere is released when its last owner lets go
            if let Value::Pair(rc) = value
                && let Ok(mut pair) = Rc::try_unwrap(rc)
            {
                pending.push(std::mem::replace(pair.car.get_mut(), Value::Empty));
                pending.push(std::mem::replace(pair.cdr.get_mut(), Value::Empty));
            }
        }
    }
}

/// Parameter specification of a closure
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    /// `(lambda () ...)`: the call must supply no arguments
    None,
    /// `(lambda args ...)`: all arguments are bound as one list
    Variadic(String),
    /// `(lambda (a b c) ...)`: one argument per distinct name
    Fixed(Vec<String>),
}

/// A user-defined procedure: parameter spec, body forms and the frame that
/// was current when the `lambda` was evaluated
pub struct Closure {
    pub params: Params,
    /// Body forms, evaluated in sequence; the last value is the result
    pub body: Vec<Value>,
    pub env: Environment,
}

/// Numeric operand seen by arithmetic primitives
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Integer(NumberType),
    Double(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Integer(n) => n as f64,
            Number::Double(d) => d,
        }
    }
}

/// Core value type in interpreter
///
/// To build values, use the ergonomic helper functions:
/// - `val(42)` for values, `sym("name")` for symbols, `nil()` for the empty list
/// - `val([1, 2, 3])` for homogeneous lists
/// - `val(vec![sym("op"), val(42)])` for mixed lists
#[derive(Clone)]
pub enum Value {
    /// Exact integers
    Integer(NumberType),
    /// Inexact numbers
    Double(f64),
    /// String literals
    String(String),
    /// Boolean values
    Bool(bool),
    /// Symbols (identifiers)
    Symbol(String),
    /// Shared, mutable cons cell
    Pair(Rc<Pair>),
    /// The empty list
    Empty,
    /// Result of forms evaluated only for their effect (e.g. `define`)
    /// These values never equal themselves or any other value
    Void,
    /// User-defined functions (params, body, closure env)
    Closure(Rc<Closure>),
    /// Built-in functions. Equality is identity of the native callable.
    Primitive {
        id: String,
        // Stored as an Arc to allow dynamic wrapping of typed Rust functions/closures.
        func: Arc<OperationFn>,
    },
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "Integer({n})"),
            Value::Double(d) => write!(f, "Double({d:?})"),
            Value::String(s) => write!(f, "String(\"{s}\")"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Symbol(s) => write!(f, "Symbol({s})"),
            Value::Pair(pair) => write!(f, "Pair({:?}, {:?})", pair.car(), pair.cdr()),
            Value::Empty => write!(f, "Empty"),
            Value::Void => write!(f, "Void"),
            Value::Closure(closure) => write!(
                f,
                "Closure(params={:?}, body={:?})",
                closure.params, closure.body
            ),
            Value::Primitive { id, .. } => write!(f, "Primitive({id})"),
        }
    }
}

// From trait implementations for Value - enables .into() conversion
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

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        match n {
            Number::Integer(i) => Value::Integer(i),
            Number::Double(d) => Value::Double(d),
        }
    }
}

macro_rules! impl_from_integer {
    ($int_type:ty) => {
        impl From<$int_type> for Value {
            fn from(n: $int_type) -> Self {
                Value::Integer(n as NumberType)
            }
        }
    };
}

impl_from_integer!(i8);
impl_from_integer!(i16);
impl_from_integer!(i32);
impl_from_integer!(NumberType); // Special case - no casting
impl_from_integer!(u8);
impl_from_integer!(u16);
impl_from_integer!(u32);

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::list(v.into_iter().map(Into::into))
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(arr: [T; N]) -> Self {
        Value::list(arr.into_iter().map(Into::into))
    }
}

impl<T: Into<Value> + Clone> From<&[T]> for Value {
    fn from(slice: &[T]) -> Self {
        Value::list(slice.iter().cloned().map(Into::into))
    }
}

// Fallible conversions from `Value` back into primitive Rust types.

impl TryFrom<Value> for NumberType {
    type Error = Error;

    fn try_from(value: Value) -> Result<NumberType, Error> {
        if let Value::Integer(n) = value {
            Ok(n)
        } else {
            Err(Error::TypeError(format!("expected integer, got {value}")))
        }
    }
}

impl TryFrom<Value> for Number {
    type Error = Error;

    fn try_from(value: Value) -> Result<Number, Error> {
        match value {
            Value::Integer(n) => Ok(Number::Integer(n)),
            Value::Double(d) => Ok(Number::Double(d)),
            other => Err(Error::TypeError(format!("expected number, got {other}"))),
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<bool, Error> {
        if let Value::Bool(b) = value {
            Ok(b)
        } else {
            Err(Error::TypeError(format!("expected boolean, got {value}")))
        }
    }
}

impl TryFrom<Value> for Rc<Pair> {
    type Error = Error;

    fn try_from(value: Value) -> Result<Rc<Pair>, Error> {
        if let Value::Pair(pair) = value {
            Ok(pair)
        } else {
            Err(Error::TypeError(format!("expected pair, got {value}")))
        }
    }
}

///   Helper function for creating symbols - works great in mixed lists!
///   Accepts both &str and String via AsRef<str>
pub fn sym<S: AsRef<str>>(name: S) -> Value {
    Value::Symbol(name.as_ref().to_owned())
}

/// Helper function for creating Values - works great in mixed lists!
/// Accepts any type that can be converted to Value
pub fn val<T: Into<Value>>(value: T) -> Value {
    value.into()
}

/// Helper function for the empty list - follows Lisp/Scheme conventions
pub fn nil() -> Value {
    Value::Empty
}

/// Build a new pair
pub fn cons(car: Value, cdr: Value) -> Value {
    Value::Pair(Rc::new(Pair::new(car, cdr)))
}

/// Iterator over the elements of a pair chain.
///
/// Stops at the first non-pair tail; [`ListIter::tail`] then reports what
/// that tail was (`Empty` for a proper list).
pub struct ListIter {
    current: Value,
}

impl ListIter {
    /// The unconsumed tail: the rest of the list while iterating, the final
    /// non-pair tail once exhausted
    pub fn tail(&self) -> &Value {
        &self.current
    }
}

impl Iterator for ListIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        let Value::Pair(pair) = &self.current else {
            return None;
        };
        let (car, cdr) = (pair.car(), pair.cdr());
        self.current = cdr;
        Some(car)
    }
}

impl Value {
    /// Build a proper list from an iterator of values
    pub fn list<I>(items: I) -> Value
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: DoubleEndedIterator,
    {
        Self::list_with_tail(items, Value::Empty)
    }

    /// Build a list from an iterator of values ending in `tail`
    pub fn list_with_tail<I>(items: I, tail: Value) -> Value
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: DoubleEndedIterator,
    {
        items
            .into_iter()
            .rev()
            .fold(tail, |acc, item| cons(item, acc))
    }

    /// Iterate over the elements of a pair chain
    pub fn iter(&self) -> ListIter {
        ListIter {
            current: self.clone(),
        }
    }

    /// Collect a proper list into a vector; `None` for anything that is not
    /// an Empty-terminated pair chain
    pub fn list_to_vec(&self) -> Option<Vec<Value>> {
        let mut iter = self.iter();
        let items: Vec<Value> = iter.by_ref().collect();
        iter.tail().is_nil().then_some(items)
    }

    /// Check if a value represents nil (empty list)
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    /// Symbol name, if this is a symbol
    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Value::Symbol(name) => Some(name),
            _ => None,
        }
    }
}

/// Structural equality for data, identity for procedures.
///
/// Comparing cyclic pair structures does not terminate.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Pair(a), Value::Pair(b)) => pairs_equal(a, b),
            (Value::Empty, Value::Empty) => true,
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Primitive { func: f1, .. }, Value::Primitive { func: f2, .. }) => {
                Arc::ptr_eq(f1, f2)
            }
            (Value::Void, _) | (_, Value::Void) => false, // Void never equals anything
            _ => false, // Different variants are never equal
        }
    }
}

/// Compare two pair chains cell by cell, looping down the cdrs
fn pairs_equal(a: &Rc<Pair>, b: &Rc<Pair>) -> bool {
    let (mut a, mut b) = (Rc::clone(a), Rc::clone(b));
    loop {
        if Rc::ptr_eq(&a, &b) {
            return true;
        }
        if a.car() != b.car() {
            return false;
        }
        match (a.cdr(), b.cdr()) {
            (Value::Pair(next_a), Value::Pair(next_b)) => (a, b) = (next_a, next_b),
            (tail_a, tail_b) => return tail_a == tail_b,
        }
    }
}

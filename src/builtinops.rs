//! Built-in operations registry.
//!
//! This module holds one table describing every name the evaluator treats
//! specially: the primitive procedures bound in the global frame and the
//! reserved special-form keywords.
//!
//! ```scheme
//! (+ 1 2.5)          ; arithmetic, => 3.500000
//! (< 1 2 3)          ; chained comparison
//! (car '(1 2 3))     ; list access
//! ```
//!
//! ## Functions vs Special Forms
//!
//! - **Functions**: Receive already-evaluated arguments (e.g. `+`, `car`, `cons`)
//! - **Special Forms**: Receive their argument forms unevaluated and decide the
//!   evaluation order themselves (e.g. `if`, `let`, `define`)
//!
//! Special-form keywords are classified once through [`find_special_form`] and
//! are never resolved as variables.
//!
//! ## Numeric coercion
//!
//! Every arithmetic primitive accepts integers and doubles. Any double operand
//! forces a double result; an all-integer operand set yields an integer.
//! Integer overflow is reported as an evaluation error. Division by zero
//! follows floating-point semantics (`(/ 1 0)` is positive infinity), except
//! for `modulo`, which has no floating-point fallback and reports an error.
//!
//! ## Adding New Operations
//!
//! 1. **Implement the function** with typed parameters (`i64`, `Number`,
//!    `Value`, `Rc<Pair>`, `bool`) and an optional `NumIter`/`ValueIter` rest
//!    parameter
//! 2. **Add to BUILTIN_OPS** with its identifier and arity
//! 3. **Add tests** covering edge cases and error conditions

use crate::Error;
use crate::ast::{Number, NumberType, Pair, Value};
use crate::evaluator::SpecialForm;
use crate::evaluator::intooperation::{
    IntoOperation, IntoVariadicOperation, NumIter, OperationFn, ValueIter,
};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, LazyLock};

/// Expected number of arguments for an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly n arguments
    Exact(usize),
    /// At least n arguments
    AtLeast(usize),
    /// Any number of arguments
    Any,
}

impl Arity {
    /// Check an argument count, producing an ArityError on mismatch
    pub fn validate(self, got: usize) -> Result<(), Error> {
        match self {
            Arity::Exact(n) if got != n => Err(Error::arity_error(n, got)),
            Arity::AtLeast(n) if got < n => Err(Error::arity_error(n, got)),
            _ => Ok(()),
        }
    }
}

/// Represents the implementation of a built-in name (function or special form)
#[derive(Clone)]
pub enum OpKind {
    /// Primitive procedure taking evaluated arguments, via the canonical
    /// erased signature used by the evaluator
    Function(Arc<OperationFn>),
    /// Reserved keyword handled by the evaluator's special-form dispatch
    SpecialForm(SpecialForm),
}

impl std::fmt::Debug for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Function(_) => write!(f, "Function(<fn>)"),
            OpKind::SpecialForm(form) => write!(f, "SpecialForm({form:?})"),
        }
    }
}

impl PartialEq for OpKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (OpKind::Function(f1), OpKind::Function(f2)) => Arc::ptr_eq(f1, f2),
            (OpKind::SpecialForm(s1), OpKind::SpecialForm(s2)) => s1 == s2,
            _ => false,
        }
    }
}

/// Definition of a built-in operation
#[derive(Debug, Clone)]
pub struct BuiltinOp {
    /// The Scheme identifier for this operation
    pub scheme_id: &'static str,
    /// The implementation of this operation (function or special form)
    pub op_kind: OpKind,
    /// Expected number of arguments (argument forms, for special forms)
    pub arity: Arity,
}

impl PartialEq for BuiltinOp {
    fn eq(&self, other: &Self) -> bool {
        self.scheme_id == other.scheme_id
    }
}

impl BuiltinOp {
    /// Check if this operation is a special form
    pub(crate) fn is_special_form(&self) -> bool {
        matches!(self.op_kind, OpKind::SpecialForm(_))
    }

    /// Check if the given number of arguments is valid for this operation
    pub(crate) fn validate_arity(&self, arg_count: usize) -> Result<(), Error> {
        self.arity.validate(arg_count)
    }
}

//
// Builtin Function Implementations
//

fn overflow(operation: &str) -> Error {
    Error::EvalError(format!("Integer overflow in {operation}"))
}

// Macro to generate the binary steps of the arithmetic folds: exact when both
// operands are integers, inexact otherwise
macro_rules! numeric_binop {
    ($name:ident, $checked:ident, $op:tt, $op_str:expr) => {
        fn $name(a: Number, b: Number) -> Result<Number, Error> {
            match (a, b) {
                (Number::Integer(x), Number::Integer(y)) => x
                    .$checked(y)
                    .map(Number::Integer)
                    .ok_or_else(|| overflow($op_str)),
                (x, y) => Ok(Number::Double(x.as_f64() $op y.as_f64())),
            }
        }
    };
}

numeric_binop!(add_numbers, checked_add, +, "addition");
numeric_binop!(sub_numbers, checked_sub, -, "subtraction");
numeric_binop!(mul_numbers, checked_mul, *, "multiplication");

// Macro to generate numeric comparison functions
macro_rules! numeric_comparison {
    ($name:ident, $op:tt) => {
        fn $name(first: Number, rest: NumIter<'_>) -> bool {
            // Chain comparisons: all adjacent pairs must satisfy the comparison.
            // A single argument trivially satisfies it.
            let mut prev = first;
            for current in rest {
                let holds = match (prev, current) {
                    (Number::Integer(a), Number::Integer(b)) => a $op b,
                    (a, b) => a.as_f64() $op b.as_f64(),
                };
                if !holds {
                    return false;
                }
                prev = current;
            }
            true
        }
    };
}

numeric_comparison!(builtin_eq, ==);
numeric_comparison!(builtin_lt, <);
numeric_comparison!(builtin_gt, >);
numeric_comparison!(builtin_le, <=);
numeric_comparison!(builtin_ge, >=);

fn builtin_add(args: NumIter<'_>) -> Result<Number, Error> {
    args.into_iter().try_fold(Number::Integer(0), add_numbers)
}

fn builtin_mul(args: NumIter<'_>) -> Result<Number, Error> {
    args.into_iter().try_fold(Number::Integer(1), mul_numbers)
}

fn builtin_sub(first: Number, rest: NumIter<'_>) -> Result<Number, Error> {
    let mut iter = rest.peekable();

    if iter.peek().is_none() {
        return match first {
            Number::Integer(n) => n
                .checked_neg()
                .map(Number::Integer)
                .ok_or_else(|| overflow("negation")),
            Number::Double(d) => Ok(Number::Double(-d)),
        };
    }

    iter.try_fold(first, sub_numbers)
}

fn builtin_div(dividend: Number, divisor: Number) -> Number {
    match (dividend, divisor) {
        // checked_rem is None for a zero divisor and for MIN / -1, both of
        // which fall through to floating-point division
        (Number::Integer(a), Number::Integer(b)) if a.checked_rem(b) == Some(0) => {
            Number::Integer(a / b)
        }
        (a, b) => Number::Double(a.as_f64() / b.as_f64()),
    }
}

fn builtin_modulo(a: NumberType, b: NumberType) -> Result<NumberType, Error> {
    if b == 0 {
        return Err(Error::EvalError("modulo by zero".into()));
    }
    // Truncated remainder; only MIN % -1 can overflow
    a.checked_rem(b).ok_or_else(|| overflow("modulo"))
}

fn builtin_car(pair: Rc<Pair>) -> Value {
    pair.car()
}

fn builtin_cdr(pair: Rc<Pair>) -> Value {
    pair.cdr()
}

fn builtin_cons(car: Value, cdr: Value) -> Value {
    crate::ast::cons(car, cdr)
}

fn builtin_append(front: Value, back: Value) -> Result<Value, Error> {
    let Some(items) = front.list_to_vec() else {
        return Err(Error::TypeError(format!(
            "append requires a proper list as first argument, got {front}"
        )));
    };
    // Fresh pairs for the first list; the second is shared as the tail
    Ok(Value::list_with_tail(items, back))
}

fn builtin_null(value: Value) -> bool {
    value.is_nil()
}

fn builtin_list(args: ValueIter<'_>) -> Value {
    Value::list(args.cloned().collect::<Vec<_>>())
}

fn builtin_not(b: bool) -> bool {
    !b
}

/// Global registry of all built-in operations.
///
/// The table is a single contiguous collection of `BuiltinOp` values for ease
/// of auditing. Primitive implementations are wired through the same adapter
/// layer used for custom registration, once, at initialization time.
static BUILTIN_OPS: LazyLock<Vec<BuiltinOp>> = LazyLock::new(|| {
    fn builtin_fixed<Args, R, F>(f: F) -> Arc<OperationFn>
    where
        F: IntoOperation<Args, R>,
    {
        <F as IntoOperation<Args, R>>::into_operation(f)
    }

    fn builtin_variadic<Args, R, F>(f: F) -> Arc<OperationFn>
    where
        F: IntoVariadicOperation<Args, R>,
    {
        <F as IntoVariadicOperation<Args, R>>::into_variadic_operation(f)
    }

    fn function(scheme_id: &'static str, func: Arc<OperationFn>, arity: Arity) -> BuiltinOp {
        BuiltinOp {
            scheme_id,
            op_kind: OpKind::Function(func),
            arity,
        }
    }

    type NumRest = NumIter<'static>;

    let mut ops = vec![
        // Arithmetic operations
        function(
            "+",
            builtin_variadic::<(NumRest,), Result<Number, Error>, _>(builtin_add),
            Arity::Any,
        ),
        function(
            "*",
            builtin_variadic::<(NumRest,), Result<Number, Error>, _>(builtin_mul),
            Arity::Any,
        ),
        function(
            "-",
            builtin_variadic::<(Number, NumRest), Result<Number, Error>, _>(builtin_sub),
            Arity::AtLeast(1),
        ),
        function(
            "/",
            builtin_fixed::<(Number, Number), Number, _>(builtin_div),
            Arity::Exact(2),
        ),
        function(
            "modulo",
            builtin_fixed::<(NumberType, NumberType), Result<NumberType, Error>, _>(
                builtin_modulo,
            ),
            Arity::Exact(2),
        ),
        // Comparison operations
        function(
            "=",
            builtin_variadic::<(Number, NumRest), bool, _>(builtin_eq),
            Arity::AtLeast(1),
        ),
        function(
            "<",
            builtin_variadic::<(Number, NumRest), bool, _>(builtin_lt),
            Arity::AtLeast(1),
        ),
        function(
            ">",
            builtin_variadic::<(Number, NumRest), bool, _>(builtin_gt),
            Arity::AtLeast(1),
        ),
        function(
            "<=",
            builtin_variadic::<(Number, NumRest), bool, _>(builtin_le),
            Arity::AtLeast(1),
        ),
        function(
            ">=",
            builtin_variadic::<(Number, NumRest), bool, _>(builtin_ge),
            Arity::AtLeast(1),
        ),
        // List operations
        function(
            "car",
            builtin_fixed::<(Rc<Pair>,), Value, _>(builtin_car),
            Arity::Exact(1),
        ),
        function(
            "cdr",
            builtin_fixed::<(Rc<Pair>,), Value, _>(builtin_cdr),
            Arity::Exact(1),
        ),
        function(
            "cons",
            builtin_fixed::<(Value, Value), Value, _>(builtin_cons),
            Arity::Exact(2),
        ),
        function(
            "append",
            builtin_fixed::<(Value, Value), Result<Value, Error>, _>(builtin_append),
            Arity::Exact(2),
        ),
        function(
            "null?",
            builtin_fixed::<(Value,), bool, _>(builtin_null),
            Arity::Exact(1),
        ),
        function(
            "list",
            builtin_variadic::<(ValueIter<'static>,), Value, _>(builtin_list),
            Arity::Any,
        ),
        // Logical operations
        function(
            "not",
            builtin_fixed::<(bool,), bool, _>(builtin_not),
            Arity::Exact(1),
        ),
    ];

    // Special forms for language constructs
    ops.extend(SpecialForm::ALL.iter().map(|&form| BuiltinOp {
        scheme_id: form.keyword(),
        op_kind: OpKind::SpecialForm(form),
        arity: form.arity(),
    }));

    ops
});

/// Lazy static map from scheme_id to BuiltinOp (private - use find_scheme_op)
static BUILTIN_SCHEME: LazyLock<HashMap<&'static str, &'static BuiltinOp>> = LazyLock::new(|| {
    let ops: &'static [BuiltinOp] = BUILTIN_OPS.as_slice();
    ops.iter().map(|op| (op.scheme_id, op)).collect()
});

/// Get all builtin operations (for internal use by evaluator)
pub(crate) fn get_builtin_ops() -> &'static [BuiltinOp] {
    BUILTIN_OPS.as_slice()
}

/// Find a builtin operation by its Scheme identifier
pub(crate) fn find_scheme_op(id: &str) -> Option<&'static BuiltinOp> {
    BUILTIN_SCHEME.get(id).copied()
}

/// Classify a list head: the special form it names, if it is a keyword
pub(crate) fn find_special_form(id: &str) -> Option<(SpecialForm, &'static BuiltinOp)> {
    find_scheme_op(id).and_then(|op| match op.op_kind {
        OpKind::SpecialForm(form) => Some((form, op)),
        OpKind::Function(_) => None,
    })
}

//! Environments, special-form dispatch and the application protocol.
//!
//! An [`Environment`] is a handle to one frame of lexical scope. Frames hold
//! an ordered list of bindings and a link to their parent; handles are cheap
//! to clone and every clone observes the same frame, so a closure that
//! captured a frame sees later `define`s and `set!`s made through it.
//!
//! Bindings are only ever added. `define` adds a binding to the current frame,
//! `set!` adds one to the nearest frame that already binds the name, and
//! lookup returns the most recently added binding of the innermost frame that
//! has one.

pub mod intooperation;

use crate::Error;
use crate::MAX_EVAL_DEPTH;
use crate::ast::{Closure, Params, Value};
use crate::builtinops::{Arity, find_special_form, get_builtin_ops};
use intooperation::{IntoOperation, IntoVariadicOperation, OperationFn};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, trace};

struct Frame {
    /// Oldest first; lookup scans from the back
    bindings: RefCell<Vec<(String, Value)>>,
    parent: Option<Environment>,
}

/// Shared handle to a lexical frame
#[derive(Clone)]
pub struct Environment(Rc<Frame>);

impl Environment {
    /// A root frame with no parent and no bindings
    pub fn new() -> Self {
        Environment(Rc::new(Frame {
            bindings: RefCell::new(Vec::new()),
            parent: None,
        }))
    }

    /// An empty frame chained onto `parent`
    pub fn with_parent(parent: &Environment) -> Self {
        Environment(Rc::new(Frame {
            bindings: RefCell::new(Vec::new()),
            parent: Some(parent.clone()),
        }))
    }

    pub fn parent(&self) -> Option<&Environment> {
        self.0.parent.as_ref()
    }

    /// This frame followed by each of its ancestors
    fn frames(&self) -> impl Iterator<Item = &Environment> {
        std::iter::successors(Some(self), |env| env.parent())
    }

    fn lookup_local(&self, name: &str) -> Option<Value> {
        self.0
            .bindings
            .borrow()
            .iter()
            .rev()
            .find(|(bound, _)| bound == name)
            .map(|(_, value)| value.clone())
    }

    fn binds_locally(&self, name: &str) -> bool {
        self.0.bindings.borrow().iter().any(|(bound, _)| bound == name)
    }

    /// Add a binding to this frame, shadowing any earlier binding of the
    /// same name in it
    pub fn define(&self, name: impl Into<String>, value: Value) {
        self.0.bindings.borrow_mut().push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.frames().find_map(|env| env.lookup_local(name))
    }

    /// Resolve a symbol through the frame chain
    pub fn lookup(&self, name: &str) -> Result<Value, Error> {
        self.get(name)
            .ok_or_else(|| Error::UnboundVariable(name.to_owned()))
    }

    /// Rebind `name` in the nearest frame (this one included) that already
    /// binds it
    pub fn set(&self, name: &str, value: Value) -> Result<(), Error> {
        let target = self
            .frames()
            .find(|env| env.binds_locally(name))
            .ok_or_else(|| Error::UnboundVariable(name.to_owned()))?;
        target.define(name, value);
        Ok(())
    }

    /// Bindings of this frame alone, most recent first. Shadowed bindings
    /// are included.
    pub fn frame_bindings(&self) -> Vec<(String, Value)> {
        self.0.bindings.borrow().iter().rev().cloned().collect()
    }

    /// Get all bindings visible from this environment
    /// Returns a Vec of (name, value) pairs sorted by name
    pub fn get_all_bindings(&self) -> Vec<(String, Value)> {
        let mut visible = BTreeMap::new();
        for env in self.frames() {
            for (name, value) in env.frame_bindings() {
                visible.entry(name).or_insert(value);
            }
        }
        visible.into_iter().collect()
    }

    /// Register a custom builtin function in the environment.
    ///
    /// This is the low-level API: it accepts a function that already
    /// works on `&[Value]` and returns `Result<Value, Error>`. For most new
    /// code, prefer the typed API instead of manipulating `Value` directly.
    ///
    /// # Example
    /// ```
    /// use scheval::evaluator::create_global_env;
    /// use scheval::ast::Value;
    /// use scheval::Error;
    ///
    /// fn arg_count(args: &[Value]) -> Result<Value, Error> {
    ///     Ok(Value::Integer(args.len() as i64))
    /// }
    ///
    /// let env = create_global_env();
    /// env.register_builtin_function("arg-count", arg_count);
    /// // Now (arg-count 1 2 3) evaluates to 3
    /// ```
    pub fn register_builtin_function(&self, name: &str, func: fn(&[Value]) -> Result<Value, Error>) {
        let wrapped: Arc<OperationFn> = Arc::new(move |args: Vec<Value>| func(&args));
        self.define_primitive(name, wrapped);
    }

    /// Register a strongly-typed Rust function as a builtin operation using
    /// automatic argument extraction and result conversion.
    ///
    /// ```rust,ignore
    /// fn add(a: i64, b: i64) -> i64 { a + b }
    /// let env = scheval::evaluator::create_global_env();
    /// env.register_builtin_operation::<_, (i64, i64), i64>("add", add);
    /// ```
    ///
    /// Supported parameter types:
    /// - `i64` (integer), `Number` (integer or double), `bool`
    /// - `&str` (borrowed string slices)
    /// - `Rc<Pair>` (a pair, shared with the caller)
    /// - `Value` (owned access to the raw value)
    ///
    /// Supported return types are any `R: Into<Value>` and
    /// `Result<R, Error>`.
    ///
    /// Arity is enforced automatically; conversion failures yield
    /// `TypeError`. Functions with a rest parameter go through
    /// [`Environment::register_variadic_builtin_operation`].
    pub fn register_builtin_operation<F, Args, R>(&self, name: &str, func: F)
    where
        F: IntoOperation<Args, R> + 'static,
    {
        self.define_primitive(name, func.into_operation());
    }

    /// Register a variadic builtin operation with explicit arity metadata.
    ///
    /// The last Rust parameter is a rest iterator from
    /// [`intooperation`]:
    /// - every argument as values: `fn(ValueIter<'_>) -> R`
    /// - numeric tail: `fn(NumIter<'_>) -> R`
    /// - fixed prefix plus numeric tail: `fn(i64, NumIter<'_>) -> R`
    ///
    /// The provided [`Arity`] validates the total argument count at call
    /// time, since it is not derivable from the Rust signature alone.
    pub fn register_variadic_builtin_operation<F, Args, R>(&self, name: &str, arity: Arity, func: F)
    where
        F: IntoVariadicOperation<Args, R> + 'static,
    {
        let inner = func.into_variadic_operation();
        let wrapped: Arc<OperationFn> = Arc::new(move |args: Vec<Value>| {
            arity.validate(args.len())?;
            inner(args)
        });
        self.define_primitive(name, wrapped);
    }

    fn define_primitive(&self, name: &str, func: Arc<OperationFn>) {
        self.define(
            name,
            Value::Primitive {
                id: name.to_owned(),
                func,
            },
        );
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

/// Frames compare by identity
impl PartialEq for Environment {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

// Bindings are not printed: a frame may hold a closure that captured it.
impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .frame_bindings()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        f.debug_struct("Environment")
            .field("bindings", &names)
            .field("depth", &self.frames().count())
            .finish()
    }
}

/// Evaluation settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalConfig {
    /// Maximum nesting of evaluation steps before evaluation is aborted
    pub max_depth: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        EvalConfig {
            max_depth: MAX_EVAL_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Depth {
    current: usize,
    max: usize,
}

impl Depth {
    fn new(max: usize) -> Self {
        Depth { current: 0, max }
    }

    fn deeper(self) -> Self {
        Depth {
            current: self.current + 1,
            ..self
        }
    }
}

/// Stack left before a nested evaluation switches to a fresh segment
const RED_ZONE: usize = 128 * 1024;

/// Size of each stack segment allocated for deep evaluation
const STACK_PER_RECURSION: usize = 1024 * 1024;

/// Run `f` with enough host stack for one more level of evaluation,
/// growing the stack onto the heap when it runs low
#[inline]
fn ensure_sufficient_stack<R>(f: impl FnOnce() -> R) -> R {
    stacker::maybe_grow(RED_ZONE, STACK_PER_RECURSION, f)
}

/// Reserved keywords whose argument forms are handed over unevaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialForm {
    Quote,
    If,
    Cond,
    And,
    Or,
    Let,
    LetStar,
    Letrec,
    Define,
    Lambda,
    Set,
    SetCar,
    SetCdr,
}

impl SpecialForm {
    pub const ALL: [SpecialForm; 13] = [
        SpecialForm::Quote,
        SpecialForm::If,
        SpecialForm::Cond,
        SpecialForm::And,
        SpecialForm::Or,
        SpecialForm::Let,
        SpecialForm::LetStar,
        SpecialForm::Letrec,
        SpecialForm::Define,
        SpecialForm::Lambda,
        SpecialForm::Set,
        SpecialForm::SetCar,
        SpecialForm::SetCdr,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            SpecialForm::Quote => "quote",
            SpecialForm::If => "if",
            SpecialForm::Cond => "cond",
            SpecialForm::And => "and",
            SpecialForm::Or => "or",
            SpecialForm::Let => "let",
            SpecialForm::LetStar => "let*",
            SpecialForm::Letrec => "letrec",
            SpecialForm::Define => "define",
            SpecialForm::Lambda => "lambda",
            SpecialForm::Set => "set!",
            SpecialForm::SetCar => "set-car!",
            SpecialForm::SetCdr => "set-cdr!",
        }
    }

    /// Number of argument forms accepted after the keyword
    pub fn arity(self) -> Arity {
        match self {
            SpecialForm::Quote => Arity::Exact(1),
            SpecialForm::If => Arity::Exact(3),
            SpecialForm::Define
            | SpecialForm::Set
            | SpecialForm::SetCar
            | SpecialForm::SetCdr => Arity::Exact(2),
            SpecialForm::Lambda
            | SpecialForm::Let
            | SpecialForm::LetStar
            | SpecialForm::Letrec => Arity::AtLeast(2),
            SpecialForm::Cond | SpecialForm::And | SpecialForm::Or => Arity::Any,
        }
    }

    fn eval(self, args: &[Value], env: &Environment, depth: Depth) -> Result<Value, Error> {
        match self {
            SpecialForm::Quote => eval_quote(args),
            SpecialForm::If => eval_if(args, env, depth),
            SpecialForm::Cond => eval_cond(args, env, depth),
            SpecialForm::And => eval_and(args, env, depth),
            SpecialForm::Or => eval_or(args, env, depth),
            SpecialForm::Let => eval_let(args, env, depth),
            SpecialForm::LetStar => eval_let_star(args, env, depth),
            SpecialForm::Letrec => eval_letrec(args, env, depth),
            SpecialForm::Define => eval_define(args, env, depth),
            SpecialForm::Lambda => eval_lambda(args, env),
            SpecialForm::Set => eval_set(args, env, depth),
            SpecialForm::SetCar | SpecialForm::SetCdr => eval_set_cell(self, args, env, depth),
        }
    }
}

/// Evaluate one form in `env` (public API)
pub fn eval(expr: &Value, env: &Environment) -> Result<Value, Error> {
    eval_with_config(expr, env, &EvalConfig::default())
}

/// Evaluate one form in `env` with explicit settings
pub fn eval_with_config(expr: &Value, env: &Environment, config: &EvalConfig) -> Result<Value, Error> {
    eval_with_depth_tracking(expr, env, Depth::new(config.max_depth))
}

/// Apply a closure or primitive to already-evaluated arguments
pub fn apply(func: &Value, args: Vec<Value>) -> Result<Value, Error> {
    apply_with_config(func, args, &EvalConfig::default())
}

/// Apply a closure or primitive with explicit settings
pub fn apply_with_config(func: &Value, args: Vec<Value>, config: &EvalConfig) -> Result<Value, Error> {
    apply_with_depth_tracking(func, args, Depth::new(config.max_depth))
}

/// Evaluate a form with depth tracking to prevent stack overflow
fn eval_with_depth_tracking(expr: &Value, env: &Environment, depth: Depth) -> Result<Value, Error> {
    ensure_sufficient_stack(|| eval_form(expr, env, depth))
}

fn eval_form(expr: &Value, env: &Environment, depth: Depth) -> Result<Value, Error> {
    if depth.current >= depth.max {
        return Err(Error::EvalError(format!(
            "Evaluation depth limit exceeded (max: {})",
            depth.max
        )));
    }
    match expr {
        // Self-evaluating forms, the empty list included
        Value::Integer(_)
        | Value::Double(_)
        | Value::String(_)
        | Value::Bool(_)
        | Value::Empty
        | Value::Void
        | Value::Closure(_)
        | Value::Primitive { .. } => Ok(expr.clone()),

        // Variable lookup
        Value::Symbol(name) => env.lookup(name),

        // Special form or application
        Value::Pair(pair) => eval_compound(expr, &pair.car(), &pair.cdr(), env, depth)
            .map_err(|err| add_note(err, "Context", || format!("while evaluating: {expr}"))),
    }
}

/// Append `label: detail` to evaluation and type errors.
///
/// Only the innermost form or closure that sees an error labels it; enclosing
/// levels find the label already present and leave the message alone.
fn add_note(error: Error, label: &str, detail: impl FnOnce() -> String) -> Error {
    let note = |msg: String| {
        if msg.contains(&format!("\n  {label}: ")) {
            msg
        } else {
            format!("{msg}\n  {label}: {}", detail())
        }
    };
    match error {
        Error::EvalError(msg) => Error::EvalError(note(msg)),
        Error::TypeError(msg) => Error::TypeError(note(msg)),
        // Unbound variables, arity and syntax errors carry their own context
        other => other,
    }
}

fn eval_compound(
    form: &Value,
    head: &Value,
    rest: &Value,
    env: &Environment,
    depth: Depth,
) -> Result<Value, Error> {
    let Some(arg_forms) = rest.list_to_vec() else {
        return Err(Error::MalformedSyntax(format!("improper form: {form}")));
    };

    // Keywords are classified before any variable lookup, so they cannot be shadowed
    if let Some(keyword) = head.as_symbol()
        && let Some((special_form, op)) = find_special_form(keyword)
    {
        op.validate_arity(arg_forms.len())
            .map_err(|err| with_expression(err, form))?;
        return special_form.eval(&arg_forms, env, depth);
    }

    let func = eval_with_depth_tracking(head, env, depth.deeper())?;
    let args = eval_args(&arg_forms, env, depth)?;
    apply_with_depth_tracking(&func, args, depth)
}

fn with_expression(error: Error, form: &Value) -> Error {
    match error {
        Error::ArityError {
            expected,
            got,
            expression: None,
        } => Error::arity_error_with_expr(expected, got, form.to_string()),
        other => other,
    }
}

/// Evaluate argument forms left to right in the caller's frame
fn eval_args(args: &[Value], env: &Environment, depth: Depth) -> Result<Vec<Value>, Error> {
    args.iter()
        .map(|arg| eval_with_depth_tracking(arg, env, depth.deeper()))
        .collect()
}

/// Evaluate forms in order, returning the last value
fn eval_sequence(forms: &[Value], env: &Environment, depth: Depth) -> Result<Value, Error> {
    let mut result = Value::Void;
    for form in forms {
        result = eval_with_depth_tracking(form, env, depth.deeper())?;
    }
    Ok(result)
}

fn apply_with_depth_tracking(func: &Value, args: Vec<Value>, depth: Depth) -> Result<Value, Error> {
    match func {
        Value::Primitive { id, func } => {
            trace!(primitive = %id, argc = args.len(), "calling primitive");
            func(args).map_err(|err| match err {
                Error::TypeError(msg) => Error::TypeError(format!("{id}: {msg}")),
                other => other,
            })
        }
        Value::Closure(closure) => apply_closure(closure, args, depth),
        other => Err(Error::NotAFunction(other.to_string())),
    }
}

fn apply_closure(closure: &Closure, args: Vec<Value>, depth: Depth) -> Result<Value, Error> {
    trace!(params = ?closure.params, argc = args.len(), "applying closure");

    // The call frame hangs off the defining frame, never the caller's
    let call_env = Environment::with_parent(&closure.env);
    match &closure.params {
        Params::None => {
            if !args.is_empty() {
                return Err(Error::arity_error(0, args.len()));
            }
        }
        Params::Variadic(name) => call_env.define(name.as_str(), Value::list(args)),
        Params::Fixed(names) => {
            if names.len() != args.len() {
                return Err(Error::arity_error(names.len(), args.len()));
            }
            for (name, arg) in names.iter().zip(args) {
                call_env.define(name.as_str(), arg);
            }
        }
    }

    eval_sequence(&closure.body, &call_env, depth).map_err(|err| {
        add_note(err, "In lambda", || {
            closure
                .body
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ")
        })
    })
}

/// Evaluate quote special form
fn eval_quote(args: &[Value]) -> Result<Value, Error> {
    match args {
        [datum] => Ok(datum.clone()),
        _ => Err(Error::arity_error(1, args.len())),
    }
}

/// Evaluate if special form
fn eval_if(args: &[Value], env: &Environment, depth: Depth) -> Result<Value, Error> {
    match args {
        [condition_expr, then_expr, else_expr] => {
            match eval_with_depth_tracking(condition_expr, env, depth.deeper())? {
                Value::Bool(true) => eval_with_depth_tracking(then_expr, env, depth.deeper()),
                Value::Bool(false) => eval_with_depth_tracking(else_expr, env, depth.deeper()),
                other => Err(Error::TypeError(format!(
                    "if condition must be a boolean, got {other}"
                ))),
            }
        }
        _ => Err(Error::arity_error(3, args.len())),
    }
}

/// Evaluate cond special form
fn eval_cond(clauses: &[Value], env: &Environment, depth: Depth) -> Result<Value, Error> {
    for (index, clause) in clauses.iter().enumerate() {
        let parts = match clause.list_to_vec() {
            Some(parts) if !parts.is_empty() => parts,
            _ => {
                return Err(Error::MalformedSyntax(format!(
                    "cond clause must be a non-empty list, got {clause}"
                )));
            }
        };
        let (predicate, body) = (&parts[0], &parts[1..]);

        // `else` only counts in the last clause; elsewhere it is an ordinary symbol
        let is_last = index + 1 == clauses.len();
        let test = if is_last && predicate.as_symbol() == Some("else") {
            Value::Bool(true)
        } else {
            eval_with_depth_tracking(predicate, env, depth.deeper())?
        };

        match test {
            Value::Bool(false) => {}
            Value::Bool(true) if body.is_empty() => return Ok(test),
            Value::Bool(true) => return eval_sequence(body, env, depth),
            other => {
                return Err(Error::TypeError(format!(
                    "cond predicate must be a boolean, got {other}"
                )));
            }
        }
    }
    Ok(Value::Void)
}

/// Evaluate and special form: the first `#f`, else the last value
fn eval_and(args: &[Value], env: &Environment, depth: Depth) -> Result<Value, Error> {
    let mut result = Value::Bool(true);
    for arg in args {
        result = eval_with_depth_tracking(arg, env, depth.deeper())?;
        if matches!(result, Value::Bool(false)) {
            break;
        }
    }
    Ok(result)
}

/// Evaluate or special form: the first value that is not `#f`, else the last value
fn eval_or(args: &[Value], env: &Environment, depth: Depth) -> Result<Value, Error> {
    let mut result = Value::Bool(false);
    for arg in args {
        result = eval_with_depth_tracking(arg, env, depth.deeper())?;
        if !matches!(result, Value::Bool(false)) {
            break;
        }
    }
    Ok(result)
}

/// Split a `let`-family binding list into (name, init form) pairs
fn parse_bindings(
    keyword: &str,
    spec: &Value,
    allow_duplicates: bool,
) -> Result<Vec<(String, Value)>, Error> {
    let Some(entries) = spec.list_to_vec() else {
        return Err(Error::MalformedSyntax(format!(
            "{keyword} bindings must be a list, got {spec}"
        )));
    };

    let mut bindings: Vec<(String, Value)> = Vec::with_capacity(entries.len());
    for entry in entries {
        let (name, init) = match entry.list_to_vec().as_deref() {
            Some([Value::Symbol(name), init]) => (name.clone(), init.clone()),
            _ => {
                return Err(Error::MalformedSyntax(format!(
                    "{keyword} binding must be (symbol expression), got {entry}"
                )));
            }
        };
        if !allow_duplicates && bindings.iter().any(|(bound, _)| *bound == name) {
            return Err(Error::MalformedSyntax(format!(
                "duplicate binding name in {keyword}: {name}"
            )));
        }
        bindings.push((name, init));
    }
    Ok(bindings)
}

/// Evaluate let special form: every init in the enclosing frame, then one new frame
fn eval_let(args: &[Value], env: &Environment, depth: Depth) -> Result<Value, Error> {
    let bindings = parse_bindings("let", &args[0], false)?;

    let mut values = Vec::with_capacity(bindings.len());
    for (name, init) in bindings {
        values.push((name, eval_with_depth_tracking(&init, env, depth.deeper())?));
    }

    let let_env = Environment::with_parent(env);
    for (name, value) in values {
        let_env.define(name, value);
    }
    eval_sequence(&args[1..], &let_env, depth)
}

/// Evaluate let* special form: one frame per binding, each init seeing the previous ones
fn eval_let_star(args: &[Value], env: &Environment, depth: Depth) -> Result<Value, Error> {
    let bindings = parse_bindings("let*", &args[0], true)?;

    let mut current = Environment::with_parent(env);
    for (index, (name, init)) in bindings.into_iter().enumerate() {
        let value = eval_with_depth_tracking(&init, &current, depth.deeper())?;
        if index > 0 {
            current = Environment::with_parent(&current);
        }
        current.define(name, value);
    }
    eval_sequence(&args[1..], &current, depth)
}

/// Evaluate letrec special form.
///
/// The frame exists before the inits run, but no binding is installed until
/// all of them have been evaluated: an init that references a sibling
/// directly fails as unbound, while a `lambda` init captures the frame and
/// sees every sibling once it is called.
fn eval_letrec(args: &[Value], env: &Environment, depth: Depth) -> Result<Value, Error> {
    let bindings = parse_bindings("letrec", &args[0], false)?;

    let letrec_env = Environment::with_parent(env);
    let mut values = Vec::with_capacity(bindings.len());
    for (name, init) in bindings {
        values.push((name, eval_with_depth_tracking(&init, &letrec_env, depth.deeper())?));
    }
    for (name, value) in values {
        letrec_env.define(name, value);
    }
    eval_sequence(&args[1..], &letrec_env, depth)
}

/// Evaluate define special form
fn eval_define(args: &[Value], env: &Environment, depth: Depth) -> Result<Value, Error> {
    match args {
        [Value::Symbol(name), expr] => {
            let value = eval_with_depth_tracking(expr, env, depth.deeper())?;
            debug!(name = %name, "define");
            env.define(name.as_str(), value);
            Ok(Value::Void)
        }
        [target, _] => Err(Error::MalformedSyntax(format!(
            "define requires a symbol, got {target}"
        ))),
        _ => Err(Error::arity_error(2, args.len())),
    }
}

/// Evaluate set! special form
fn eval_set(args: &[Value], env: &Environment, depth: Depth) -> Result<Value, Error> {
    match args {
        [Value::Symbol(name), expr] => {
            let value = eval_with_depth_tracking(expr, env, depth.deeper())?;
            debug!(name = %name, "set!");
            env.set(name, value)?;
            Ok(Value::Void)
        }
        [target, _] => Err(Error::MalformedSyntax(format!(
            "set! requires a symbol, got {target}"
        ))),
        _ => Err(Error::arity_error(2, args.len())),
    }
}

/// Evaluate set-car! and set-cdr!: mutate a pair cell in place
fn eval_set_cell(
    form: SpecialForm,
    args: &[Value],
    env: &Environment,
    depth: Depth,
) -> Result<Value, Error> {
    let [target_expr, value_expr] = args else {
        return Err(Error::arity_error(2, args.len()));
    };

    let target = eval_with_depth_tracking(target_expr, env, depth.deeper())?;
    let Value::Pair(pair) = target else {
        return Err(Error::TypeError(format!(
            "{} requires a pair, got {target}",
            form.keyword()
        )));
    };
    let value = eval_with_depth_tracking(value_expr, env, depth.deeper())?;

    if form == SpecialForm::SetCar {
        pair.set_car(value);
    } else {
        pair.set_cdr(value);
    }
    Ok(Value::Void)
}

/// Evaluate lambda special form
fn eval_lambda(args: &[Value], env: &Environment) -> Result<Value, Error> {
    let [param_spec, body @ ..] = args else {
        return Err(Error::arity_error(2, args.len()));
    };

    let params = match param_spec {
        Value::Empty => Params::None,
        Value::Symbol(name) => Params::Variadic(name.clone()),
        Value::Pair(_) => {
            let Some(items) = param_spec.list_to_vec() else {
                return Err(Error::MalformedSyntax(format!(
                    "lambda parameter list must be a proper list, got {param_spec}"
                )));
            };
            let mut names: Vec<String> = Vec::with_capacity(items.len());
            for item in items {
                let Value::Symbol(name) = item else {
                    return Err(Error::MalformedSyntax(format!(
                        "lambda parameters must be symbols, got {item}"
                    )));
                };
                if names.contains(&name) {
                    return Err(Error::MalformedSyntax(format!(
                        "duplicate parameter name: {name}"
                    )));
                }
                names.push(name);
            }
            Params::Fixed(names)
        }
        other => {
            return Err(Error::MalformedSyntax(format!(
                "lambda parameters must be a symbol or a list of symbols, got {other}"
            )));
        }
    };

    Ok(Value::Closure(Rc::new(Closure {
        params,
        body: body.to_vec(),
        env: env.clone(),
    })))
}

/// Create a global environment with the built-in primitives
pub fn create_global_env() -> Environment {
    let env = Environment::new();

    for builtin_op in get_builtin_ops().iter().filter(|op| !op.is_special_form()) {
        if let crate::builtinops::OpKind::Function(func) = &builtin_op.op_kind {
            env.define_primitive(builtin_op.scheme_id, Arc::clone(func));
        }
    }

    env
}

#[cfg(all(test, feature = "scheme"))]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::Error;
    use crate::ast::{cons, nil, sym, val};
    use crate::scheme::parse_scheme;
    use crate::evaluator::intooperation::{NumIter, ValueIter};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_register_builtin_operation_add() {
        fn add(a: i64, b: i64) -> i64 {
            a + b
        }
        let env = create_global_env();
        env.register_builtin_operation::<_, (i64, i64), i64>("add2", add);
        let expr = parse_scheme("(add2 7 5)").unwrap();
        assert_eq!(eval(&expr, &env).unwrap(), val(12));
    }

    #[test]
    fn test_register_builtin_operation_zero_arg() {
        fn forty_two() -> i64 {
            42
        }

        let env = create_global_env();
        env.register_builtin_operation::<_, (), i64>("forty-two", forty_two);

        let expr = parse_scheme("(forty-two)").unwrap();
        assert_eq!(eval(&expr, &env).unwrap(), val(42));

        let err = eval(&parse_scheme("(forty-two 1)").unwrap(), &env).unwrap_err();
        assert!(matches!(err, Error::ArityError { expected: 0, got: 1, .. }));
    }

    #[test]
    fn test_register_builtin_operation_result_builtin() {
        fn safe_div(a: i64, b: i64) -> Result<i64, Error> {
            if b == 0 {
                Err(Error::EvalError("division by zero".into()))
            } else {
                Ok(a / b)
            }
        }

        let env = create_global_env();
        env.register_builtin_operation::<_, (i64, i64), Result<i64, Error>>("safe-div", safe_div);

        let expr_ok = parse_scheme("(safe-div 6 3)").unwrap();
        assert_eq!(eval(&expr_ok, &env).unwrap(), val(2));

        let expr_err = parse_scheme("(safe-div 1 0)").unwrap();
        let err = eval(&expr_err, &env).unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn test_register_builtin_function_raw_slice() {
        fn arg_count(args: &[Value]) -> Result<Value, Error> {
            Ok(val(args.len() as i64))
        }

        let env = create_global_env();
        env.register_builtin_function("arg-count", arg_count);

        let expr = parse_scheme("(arg-count 1 \"x\" #t)").unwrap();
        assert_eq!(eval(&expr, &env).unwrap(), val(3));
    }

    #[test]
    fn test_register_variadic_builtin_operation_with_explicit_arity() {
        fn sum_doubled(nums: NumIter<'_>) -> f64 {
            nums.map(|n| n.as_f64() * 2.0).sum()
        }

        let env = create_global_env();
        env.register_variadic_builtin_operation::<_, (NumIter<'static>,), f64>(
            "sum-doubled",
            Arity::AtLeast(1),
            sum_doubled,
        );

        let expr_ok = parse_scheme("(sum-doubled 1 2.5)").unwrap();
        assert_eq!(eval(&expr_ok, &env).unwrap(), val(7.0));

        let expr_err = parse_scheme("(sum-doubled)").unwrap();
        match eval(&expr_err, &env).unwrap_err() {
            Error::ArityError { .. } => {}
            other => panic!("expected ArityError, got {other:?}"),
        }
    }

    #[test]
    fn test_register_variadic_prefix_plus_rest() {
        fn tag_rest(tag: &str, rest: ValueIter<'_>) -> Value {
            Value::list(
                std::iter::once(sym(tag))
                    .chain(rest.cloned())
                    .collect::<Vec<_>>(),
            )
        }

        let env = create_global_env();
        env.register_variadic_builtin_operation::<_, (&str, ValueIter<'static>), Value>(
            "tag",
            Arity::AtLeast(1),
            tag_rest,
        );

        let expr = parse_scheme("(tag \"point\" 1 2)").unwrap();
        assert_eq!(
            eval(&expr, &env).unwrap(),
            val(vec![sym("point"), val(1), val(2)])
        );

        let err = eval(&parse_scheme("(tag 5 1)").unwrap(), &env).unwrap_err();
        assert!(
            err.to_string().starts_with("Type error: tag: expected string"),
            "got {err}"
        );
    }

    #[test]
    fn test_builtin_comparison_dynamic_uses_typed_mechanism() {
        let env = create_global_env();

        // Builtins are first-class: `>` passed as a value and called with three arguments
        let expr = parse_scheme("((lambda (op a b c) (op a b c)) > 9 6 2)").unwrap();
        assert_eq!(eval(&expr, &env).unwrap(), val(true));

        let expr_false = parse_scheme("((lambda (op a b c) (op a b c)) > 9 6 7)").unwrap();
        assert_eq!(eval(&expr_false, &env).unwrap(), val(false));
    }

    #[test]
    fn test_environment_shadowing_and_set() {
        let global = Environment::new();
        global.define("x", val(1));
        global.define("x", val(2));
        assert_eq!(global.get("x"), Some(val(2)));
        assert_eq!(
            global.frame_bindings(),
            vec![("x".to_owned(), val(2)), ("x".to_owned(), val(1))]
        );

        let child = Environment::with_parent(&global);
        child.define("y", val(10));
        assert_eq!(child.get("x"), Some(val(2)));
        assert_eq!(global.get("y"), None);

        // set! lands in the frame that binds the name, not the current one
        child.set("x", val(3)).unwrap();
        assert_eq!(global.get("x"), Some(val(3)));
        assert!(child.frame_bindings().iter().all(|(name, _)| name != "x"));

        assert_eq!(
            child.set("missing", val(0)).unwrap_err(),
            Error::UnboundVariable("missing".into())
        );
        assert_eq!(
            child.lookup("nope").unwrap_err(),
            Error::UnboundVariable("nope".into())
        );

        child.define("x", val("inner"));
        let all = child.get_all_bindings();
        assert_eq!(
            all,
            vec![("x".to_owned(), val("inner")), ("y".to_owned(), val(10))]
        );

        assert_eq!(child.parent(), Some(&global));
        assert_ne!(child, global);
        assert_eq!(child.clone(), child);
    }

    #[test]
    fn test_apply_protocol() {
        let env = create_global_env();
        let plus = env.get("+").unwrap();
        assert_eq!(apply(&plus, vec![val(1), val(2)]).unwrap(), val(3));

        let identity_list = eval(&parse_scheme("(lambda args args)").unwrap(), &env).unwrap();
        assert_eq!(
            apply(&identity_list, vec![val(1), val(2)]).unwrap(),
            val([1, 2])
        );
        assert_eq!(apply(&identity_list, vec![]).unwrap(), nil());

        assert_eq!(
            apply(&val(5), vec![]).unwrap_err(),
            Error::NotAFunction("5".into())
        );

        let increment = eval(&parse_scheme("(lambda (n) (+ n 1))").unwrap(), &env).unwrap();
        let roomy = EvalConfig { max_depth: 3 };
        assert_eq!(apply_with_config(&increment, vec![val(1)], &roomy).unwrap(), val(2));
        let cramped = EvalConfig { max_depth: 1 };
        let err = apply_with_config(&increment, vec![val(1)], &cramped).unwrap_err();
        assert!(err.to_string().contains("depth limit exceeded (max: 1)"), "got {err}");
    }

    /// Test result variants for comprehensive testing
    #[derive(Debug)]
    enum TestResult {
        EvalResult(Value),           // Evaluation should succeed with this value
        SpecificError(&'static str), // Evaluation should fail with error containing this string
        Error,                       // Evaluation should fail (any error)
    }
    use TestResult::*;

    /// Test environment containing test cases that share state
    struct TestEnvironment(Vec<(&'static str, TestResult)>);

    /// Micro-helper for success cases in comprehensive tests
    fn success<T: Into<Value>>(value: T) -> TestResult {
        EvalResult(val(value))
    }

    /// Macro for setup expressions that return Void (like define)
    macro_rules! test_setup {
        ($expr:expr) => {
            ($expr, EvalResult(Value::Void))
        };
    }

    /// Run tests in isolated environments with shared state
    fn run_tests_in_environment(test_environments: Vec<TestEnvironment>) {
        for (env_idx, TestEnvironment(test_cases)) in test_environments.iter().enumerate() {
            let env = create_global_env();

            for (test_idx, (input, expected)) in test_cases.iter().enumerate() {
                let test_id = format!("Environment #{} test #{}", env_idx + 1, test_idx + 1);
                execute_test_case(input, expected, &env, &test_id);
            }
        }
    }

    /// Execute a single test case with detailed error reporting
    fn execute_test_case(input: &str, expected: &TestResult, env: &Environment, test_id: &str) {
        let expr = match parse_scheme(input) {
            Ok(expr) => expr,
            Err(parse_err) => {
                panic!("{test_id}: unexpected parse error for '{input}': {parse_err:?}");
            }
        };

        match (eval(&expr, env), expected) {
            (Ok(actual), EvalResult(expected_val)) => {
                // Void never compares equal, so match it by variant
                match (&actual, expected_val) {
                    (Value::Void, Value::Void) => {}
                    _ => {
                        assert!(
                            actual == *expected_val,
                            "{test_id}: '{input}' expected {expected_val:?}, got {actual:?}"
                        );
                    }
                }
            }

            (Err(_), Error) => {} // Expected generic error
            (Err(e), SpecificError(expected_text)) => {
                let error_msg = format!("{e}");
                assert!(
                    error_msg.contains(expected_text),
                    "{test_id}: '{input}' error should contain '{expected_text}', got: {error_msg}"
                );
            }
            (Ok(actual), Error) => {
                panic!("{test_id}: '{input}' expected error, got {actual:?}");
            }
            (Ok(actual), SpecificError(expected_text)) => {
                panic!(
                    "{test_id}: '{input}' expected error containing '{expected_text}', got {actual:?}"
                );
            }
            (Err(err), EvalResult(expected_val)) => {
                panic!("{test_id}: '{input}' expected {expected_val:?}, got error {err:?}");
            }
        }
    }

    /// Simplified test runner with specific error message support
    fn run_comprehensive_tests(test_cases: Vec<(&str, TestResult)>) {
        for (i, (input, expected)) in test_cases.iter().enumerate() {
            let env = create_global_env();
            let test_id = format!("#{}", i + 1);
            execute_test_case(input, expected, &env, &test_id);
        }
    }

    #[test]
    #[expect(clippy::too_many_lines)] // Comprehensive test coverage is intentionally thorough
    fn test_comprehensive_operations_data_driven() {
        let test_cases = vec![
            // === SELF-EVALUATING FORMS ===
            ("42", success(42)),
            ("-271", success(-271)),
            ("9223372036854775807", success(i64::MAX)),
            ("1.5", success(1.5)),
            ("#t", success(true)),
            ("#f", success(false)),
            ("\"hello\"", success("hello")),
            ("\"with\\\"quotes\"", success("with\"quotes")),
            ("()", EvalResult(nil())),
            // === VARIABLES ===
            ("undefined-var", SpecificError("Unbound variable: undefined-var")),
            ("car", EvalResult(create_global_env().get("car").unwrap())),
            // === ARITHMETIC AND COERCION ===
            ("(+ 1 2 3)", success(6)),
            ("(+)", success(0)),
            ("(*)", success(1)),
            ("(+ 1 2.0)", success(3.0)),
            ("(- 10 3 2)", success(5)),
            ("(- 10)", success(-10)),
            ("(- 1.5)", success(-1.5)),
            ("(* 2 0.5)", success(1.0)),
            ("(+ (* 2 3) (- 8 2))", success(12)),
            ("(/ 6 3)", success(2)),
            ("(/ 6 4)", success(1.5)),
            ("(/ 1.0 4)", success(0.25)),
            ("(/ 1 0)", success(f64::INFINITY)),
            ("(/ 6)", SpecificError("ArityError")),
            ("(modulo 17 5)", success(2)),
            ("(modulo 17 5.0)", SpecificError("expected integer")),
            ("(modulo 1 0)", SpecificError("modulo by zero")),
            ("(+ 9223372036854775807 1)", SpecificError("overflow")),
            ("(- -9223372036854775807 2)", SpecificError("overflow")),
            ("(+ 1 \"2\")", SpecificError("Type error: +: expected number")),
            ("(- #t)", SpecificError("Type error")),
            ("(-)", SpecificError("not enough arguments")),
            // === COMPARISON ===
            ("(< 1 2 3)", success(true)),
            ("(< 1 3 2)", success(false)),
            ("(> 3 2 1)", success(true)),
            ("(= 1 1.0)", success(true)),
            ("(= 5)", success(true)),
            ("(<= 1 1 2)", success(true)),
            ("(>= 2 3)", success(false)),
            ("(<)", SpecificError("ArityError")),
            ("(< 1 'a)", SpecificError("Type error")),
            // === LISTS ===
            ("(car '(1 2 3))", success(1)),
            ("(cdr '(1 2 3))", success([2, 3])),
            ("(cdr '(1))", EvalResult(nil())),
            ("(cons 1 2)", EvalResult(cons(val(1), val(2)))),
            ("(cons 1 '(2))", success([1, 2])),
            ("(append '(1 2) '(3 4))", success([1, 2, 3, 4])),
            ("(append '() 5)", success(5)),
            ("(append '(1) 2)", EvalResult(cons(val(1), val(2)))),
            ("(append 1 '(2))", SpecificError("proper list")),
            ("(null? '())", success(true)),
            ("(null? '(1))", success(false)),
            ("(null? 0)", success(false)),
            ("(list 1 (+ 1 1) 3)", success([1, 2, 3])),
            ("(list)", EvalResult(nil())),
            ("(car '())", SpecificError("Type error: car: expected pair")),
            ("(cdr 5)", SpecificError("Type error: cdr: expected pair")),
            ("(car 1 2)", SpecificError("ArityError")),
            ("(null?)", SpecificError("not enough arguments")),
            ("(not #f)", success(true)),
            ("(not 0)", SpecificError("expected boolean")),
            // === QUOTE ===
            ("'a", EvalResult(sym("a"))),
            ("(quote (1 2))", success([1, 2])),
            ("'(+ 1 2)", EvalResult(val(vec![sym("+"), val(1), val(2)]))),
            ("'(a (b c))", EvalResult(val(vec![sym("a"), val(vec![sym("b"), sym("c")])]))),
            ("''a", EvalResult(val(vec![sym("quote"), sym("a")]))),
            ("'()", EvalResult(nil())),
            ("(quote)", SpecificError("ArityError: expression (quote)")),
            ("(quote 1 2)", SpecificError("too many arguments")),
            // === IF ===
            ("(if #t 1 2)", success(1)),
            ("(if #f 1 2)", success(2)),
            ("(if (< 1 2) 'yes 'no)", EvalResult(sym("yes"))),
            ("(if #t 1 undefined-var)", success(1)), // untaken branch never evaluated
            ("(if #f undefined-var 2)", success(2)),
            ("(if 1 2 3)", SpecificError("if condition must be a boolean")),
            ("(if '() 2 3)", SpecificError("Type error")),
            ("(if #t 1)", SpecificError("ArityError: expression (if #t 1)")),
            ("(if #t 1 2 3)", SpecificError("too many arguments")),
            // === COND ===
            ("(cond (#f 1) (else 2))", success(2)),
            ("(cond (#t 1) (else 2))", success(1)),
            ("(cond ((< 2 1) 'a) ((< 1 2) 'b))", EvalResult(sym("b"))),
            ("(cond (#f 1))", EvalResult(Value::Void)),
            ("(cond)", EvalResult(Value::Void)),
            ("(cond ((= 1 1)))", success(true)),
            ("(cond (#t 1 2 3))", success(3)),
            ("(cond (else 1) (#t 2))", SpecificError("Unbound variable: else")),
            ("(cond (1 2))", SpecificError("cond predicate must be a boolean")),
            ("(cond ())", SpecificError("Malformed syntax")),
            ("(cond 5)", SpecificError("Malformed syntax")),
            ("(cond (#f undefined-var) (#t 1))", success(1)),
            // === AND / OR ===
            ("(and)", success(true)),
            ("(and 1 2)", success(2)),
            ("(and #t #f undefined-var)", success(false)), // short circuit
            ("(and #t \"s\")", success("s")),
            ("(or)", success(false)),
            ("(or #f 3)", success(3)),
            ("(or #f #f)", success(false)),
            ("(or 1 undefined-var)", success(1)),
            ("(or #f '())", EvalResult(nil())),
            // === LET FAMILY ===
            ("(let ((x 1) (y 2)) (+ x y))", success(3)),
            ("(let () 5)", success(5)),
            ("(let ((x 1)) (define y 2) (+ x y))", success(3)),
            ("(let ((x 1) (y (+ x 1))) y)", SpecificError("Unbound variable: x")),
            ("(let ((x 1) (x 2)) x)", SpecificError("duplicate binding name in let: x")),
            ("(let ((x)) x)", SpecificError("Malformed syntax")),
            ("(let ((1 2)) 3)", SpecificError("Malformed syntax")),
            ("(let x 1)", SpecificError("Malformed syntax")),
            ("(let ((x 1)))", SpecificError("ArityError")),
            ("(let* ((x 1) (y (+ x 1))) y)", success(2)),
            ("(let* ((x 1) (x (+ x 1))) x)", success(2)),
            ("(let* () 7)", success(7)),
            ("(let* ((x x)) x)", SpecificError("Unbound variable: x")),
            ("(letrec ((x 1) (y 2)) (+ x y))", success(3)),
            ("(letrec ((x 1) (y x)) y)", SpecificError("Unbound variable: x")),
            ("(letrec ((x 1) (x 2)) x)", SpecificError("duplicate binding name in letrec")),
            (
                "(letrec ((even? (lambda (n) (if (= n 0) #t (odd? (- n 1))))) (odd? (lambda (n) (if (= n 0) #f (even? (- n 1)))))) (even? 10))",
                success(true),
            ),
            // === LAMBDA AND APPLICATION ===
            ("((lambda (x) (* x x)) 7)", success(49)),
            ("((lambda () 5))", success(5)),
            ("((lambda (x y) (+ x y)) 1 2)", success(3)),
            ("((lambda args args) 1 2 3)", success([1, 2, 3])),
            ("((lambda args args))", EvalResult(nil())),
            ("((lambda (x) 1 2 x) 3)", success(3)),
            ("((lambda (x y) x) 1)", SpecificError("not enough arguments")),
            ("((lambda (x) x) 1 2)", SpecificError("too many arguments")),
            ("((lambda () 1) 2)", SpecificError("too many arguments")),
            ("(lambda (x x) x)", SpecificError("duplicate parameter name: x")),
            ("(lambda (x 1) x)", SpecificError("parameters must be symbols")),
            ("(lambda (x . y) x)", SpecificError("proper list")),
            ("(lambda 5 1)", SpecificError("Malformed syntax")),
            ("(lambda (x))", SpecificError("ArityError")),
            ("(5 1)", SpecificError("Not a function: 5")),
            ("(\"f\")", SpecificError("Not a function")),
            ("('(1 2) 1)", SpecificError("Not a function: (1 2)")),
            ("(undefined-fn 1)", SpecificError("Unbound variable: undefined-fn")),
            ("(+ 1 . 2)", SpecificError("improper form")),
            ("((lambda (x) (car x)) 5)", SpecificError("In lambda: (car x)")),
            // === DEFINE / SET! MALFORMED ===
            ("(define 5 1)", SpecificError("define requires a symbol")),
            ("(define x)", SpecificError("ArityError")),
            ("(set! y 1)", SpecificError("Unbound variable: y")),
            ("(set! 5 1)", SpecificError("set! requires a symbol")),
            ("(set-car! 5 1)", SpecificError("set-car! requires a pair")),
            ("(set-cdr! '() 1)", SpecificError("set-cdr! requires a pair")),
            // === CONTEXT ===
            ("(if (car 5) 1 2)", SpecificError("Context: while evaluating: (car 5)")),
        ];

        run_comprehensive_tests(test_cases);

        let environment_test_cases = vec![
            // Lexical capture survives return from the defining call
            TestEnvironment(vec![
                test_setup!("(define f (lambda (n) (lambda (x) (+ x n))))"),
                ("((f 5) 3)", success(8)),
                test_setup!("(define add10 (f 10))"),
                test_setup!("(define n 1000)"),
                ("(add10 1)", success(11)), // defining frame, not the global n
            ]),
            // Redefinition shadows
            TestEnvironment(vec![
                test_setup!("(define x 1)"),
                test_setup!("(define x (+ x 1))"),
                ("x", success(2)),
            ]),
            // set! updates the defining frame and is seen by closures sharing it
            TestEnvironment(vec![
                test_setup!("(define counter 0)"),
                test_setup!("(define bump (lambda () (set! counter (+ counter 1)) counter))"),
                ("(bump)", success(1)),
                ("(bump)", success(2)),
                ("counter", success(2)),
            ]),
            // set! does not touch a frame that independently bound the same name
            TestEnvironment(vec![
                test_setup!("(define x 1)"),
                ("(let ((x 10)) (set! x 20) x)", success(20)),
                ("x", success(1)),
                ("(let ((y 10)) (set! x 5) y)", success(10)),
                ("x", success(5)),
            ]),
            // Closures with private state
            TestEnvironment(vec![
                test_setup!(
                    "(define make-counter (lambda () (let ((n 0)) (lambda () (set! n (+ n 1)) n))))"
                ),
                test_setup!("(define c1 (make-counter))"),
                test_setup!("(define c2 (make-counter))"),
                ("(c1)", success(1)),
                ("(c1)", success(2)),
                ("(c2)", success(1)),
            ]),
            // Pair mutation is shared by every reference
            TestEnvironment(vec![
                test_setup!("(define p (cons 1 2))"),
                test_setup!("(define q p)"),
                test_setup!("(set-car! p 10)"),
                test_setup!("(set-cdr! q '(20))"),
                ("p", success([10, 20])),
                ("(car q)", success(10)),
            ]),
            // Quoted data is returned unevaluated, every time
            TestEnvironment(vec![
                test_setup!("(define data '(undefined-var (+ 1 2)))"),
                ("data", EvalResult(val(vec![sym("undefined-var"), val(vec![sym("+"), val(1), val(2)])]))),
                ("(car data)", EvalResult(sym("undefined-var"))),
            ]),
            // Keywords are never resolved as variables
            TestEnvironment(vec![
                test_setup!("(define if (lambda (a b c) 'shadowed))"),
                ("(if #t 1 2)", success(1)),
                test_setup!("(define quote 5)"),
                ("'x", EvalResult(sym("x"))),
            ]),
            // Recursion through the global frame
            TestEnvironment(vec![
                test_setup!(
                    "(define fact (lambda (n) (if (= n 0) 1 (* n (fact (- n 1))))))"
                ),
                ("(fact 10)", success(3628800)),
                test_setup!(
                    "(define len (lambda (l) (if (null? l) 0 (+ 1 (len (cdr l))))))"
                ),
                ("(len '(a b c d))", success(4)),
            ]),
            // Higher-order functions
            TestEnvironment(vec![
                test_setup!(
                    "(define map1 (lambda (f l) (if (null? l) '() (cons (f (car l)) (map1 f (cdr l))))))"
                ),
                ("(map1 (lambda (x) (* x x)) '(1 2 3))", success([1, 4, 9])),
                ("(map1 car '((1 2) (3 4)))", success([1, 3])),
            ]),
        ];

        run_tests_in_environment(environment_test_cases);
    }

    #[test]
    fn test_builtin_function_self_evaluation() {
        let env = create_global_env();
        eval(&parse_scheme("(define f +)").unwrap(), &env).unwrap();
        let result = eval(&parse_scheme("f").unwrap(), &env).unwrap();
        match &result {
            Value::Primitive { id, .. } => assert_eq!(id, "+"),
            _ => panic!("Expected Primitive to be self-evaluating"),
        }
        assert_eq!(result, env.get("+").unwrap());
        assert_eq!(eval(&result, &env).unwrap(), result);
    }

    #[test]
    fn test_evaluation_depth_limit() {
        // Runs on the ordinary test thread: the limit trips before the host stack does
        let depth_test_environments = vec![TestEnvironment(vec![
            test_setup!(
                "(define make-deep (lambda (depth) (if (= depth 0) 42 (+ 1 (make-deep (- depth 1))))))"
            ),
            ("(make-deep 10)", success(52)),
            ("(make-deep 2000)", success(2042)),
            ("(make-deep 100000)", SpecificError("depth limit exceeded (max: 10000)")),
        ])];
        run_tests_in_environment(depth_test_environments);

        let env = create_global_env();
        let config = EvalConfig { max_depth: 3 };
        let shallow = parse_scheme("(+ 1 2)").unwrap();
        assert_eq!(eval_with_config(&shallow, &env, &config).unwrap(), val(3));
        let nested = parse_scheme("(+ 1 (+ 2 (+ 3 4)))").unwrap();
        let err = eval_with_config(&nested, &env, &config).unwrap_err();
        assert!(err.to_string().contains("depth limit exceeded (max: 3)"), "got {err}");
    }

    #[test]
    fn test_deep_failure_is_reported_once() {
        let env = create_global_env();
        let define = "(define sink (lambda (n) (if (= n 0) (car n) (+ 1 (sink (- n 1))))))";
        eval(&parse_scheme(define).unwrap(), &env).unwrap();

        let err = eval(&parse_scheme("(sink 500)").unwrap(), &env).unwrap_err();
        let message = err.to_string();
        assert_eq!(message.matches("Context:").count(), 1, "got {message}");
        assert_eq!(message.matches("In lambda:").count(), 1, "got {message}");
        assert!(message.contains("Context: while evaluating: (car n)"), "got {message}");
        assert!(message.lines().count() <= 3, "got {message}");

        eval(&parse_scheme("(define spin (lambda (n) (+ 1 (spin n))))").unwrap(), &env).unwrap();
        let err = eval(&parse_scheme("(spin 0)").unwrap(), &env).unwrap_err();
        assert!(err.to_string().contains("depth limit exceeded"), "got {err}");
        assert!(err.to_string().lines().count() <= 3, "got {err}");
    }
}

//! A session owning the global frame.
//!
//! Top-level forms are evaluated in order against one shared global frame,
//! so definitions made by earlier forms are visible to later ones. The first
//! failure aborts the program and no results are returned for it.

use tracing::debug;

use crate::Error;
use crate::ast::Value;
use crate::evaluator::{EvalConfig, Environment, create_global_env, eval_with_config};

#[derive(Debug, Clone)]
pub struct Interpreter {
    env: Environment,
    config: EvalConfig,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    /// New session with the primitives bound in a fresh global frame
    pub fn new() -> Self {
        Self::with_config(EvalConfig::default())
    }

    pub fn with_config(config: EvalConfig) -> Self {
        Interpreter {
            env: create_global_env(),
            config,
        }
    }

    /// The global frame, for inspection or for registering extra primitives
    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    /// Evaluate one already-read form in the global frame
    pub fn eval(&self, form: &Value) -> Result<Value, Error> {
        eval_with_config(form, &self.env, &self.config)
    }

    /// Evaluate already-read top-level forms in order, one result per form
    #[tracing::instrument(level = "debug", skip_all, fields(forms = forms.len()))]
    pub fn eval_forms(&self, forms: &[Value]) -> Result<Vec<Value>, Error> {
        forms
            .iter()
            .map(|form| {
                debug!(%form, "evaluating top-level form");
                self.eval(form)
            })
            .collect()
    }

    /// Read and evaluate exactly one datum
    #[cfg(feature = "scheme")]
    pub fn eval_str(&self, source: &str) -> Result<Value, Error> {
        let form = crate::scheme::parse_scheme(source)?;
        self.eval(&form)
    }

    /// Read a whole program, then evaluate its forms in order.
    ///
    /// A syntax error anywhere in the source is reported before any form is
    /// evaluated.
    #[cfg(feature = "scheme")]
    pub fn eval_program(&self, source: &str) -> Result<Vec<Value>, Error> {
        let forms = crate::scheme::parse_program(source)?;
        self.eval_forms(&forms)
    }
}

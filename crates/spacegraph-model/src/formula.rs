//! Formula collaborator interfaces.
//!
//! The model never parses or compiles formula text. A host supplies
//! [`Formula`] objects for cells and [`ParamFormula`] objects for
//! parametrized spaces, and a [`FormulaCompiler`] to rebuild both from their
//! source text when a snapshot is restored.

use crate::entity::ObjectId;
use crate::error::{ModelError, Result};
use crate::eval::EvalContext;
use crate::value::Value;
use ahash::AHashMap;
use std::sync::Arc;

pub trait Formula: Send + Sync {
    /// Source text, kept for snapshots and display.
    fn source(&self) -> &str;

    /// Names the formula reads from its space's namespace.
    fn free_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn evaluate(&self, ctx: &mut EvalContext<'_>, args: &[Value]) -> Result<Value>;
}

/// Parameter formula of a dynamic space: maps arguments to the bases of the
/// dynamic item. `None` means "use the parametrized space itself".
pub trait ParamFormula: Send + Sync {
    fn source(&self) -> &str;

    fn params(&self) -> Vec<String>;

    fn bases(&self, ctx: &mut EvalContext<'_>, args: &[Value]) -> Result<Option<Vec<ObjectId>>>;
}

pub trait FormulaCompiler {
    fn compile_formula(&self, source: &str) -> Result<Arc<dyn Formula>>;
    fn compile_param(&self, source: &str) -> Result<Arc<dyn ParamFormula>>;
}

// ============================================================================
// Closure-backed implementations
// ============================================================================

type CellFn = dyn Fn(&mut EvalContext<'_>, &[Value]) -> Result<Value> + Send + Sync;
type ParamFn = dyn Fn(&mut EvalContext<'_>, &[Value]) -> Result<Option<Vec<ObjectId>>> + Send + Sync;

pub struct FnFormula {
    source: String,
    free_names: Vec<String>,
    func: Box<CellFn>,
}

impl FnFormula {
    pub fn new<F>(source: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut EvalContext<'_>, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            source: source.into(),
            free_names: Vec::new(),
            func: Box::new(func),
        }
    }

    pub fn with_free_names(mut self, names: &[&str]) -> Self {
        self.free_names = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn shared(self) -> Arc<dyn Formula> {
        Arc::new(self)
    }
}

impl Formula for FnFormula {
    fn source(&self) -> &str {
        &self.source
    }

    fn free_names(&self) -> Vec<String> {
        self.free_names.clone()
    }

    fn evaluate(&self, ctx: &mut EvalContext<'_>, args: &[Value]) -> Result<Value> {
        (self.func)(ctx, args)
    }
}

pub struct FnParam {
    source: String,
    params: Vec<String>,
    func: Box<ParamFn>,
}

impl FnParam {
    pub fn new<F>(source: impl Into<String>, params: &[&str], func: F) -> Self
    where
        F: Fn(&mut EvalContext<'_>, &[Value]) -> Result<Option<Vec<ObjectId>>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            source: source.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
            func: Box::new(func),
        }
    }

    pub fn shared(self) -> Arc<dyn ParamFormula> {
        Arc::new(self)
    }
}

impl ParamFormula for FnParam {
    fn source(&self) -> &str {
        &self.source
    }

    fn params(&self) -> Vec<String> {
        self.params.clone()
    }

    fn bases(&self, ctx: &mut EvalContext<'_>, args: &[Value]) -> Result<Option<Vec<ObjectId>>> {
        (self.func)(ctx, args)
    }
}

/// Compiler backed by pre-registered formulas keyed by source text.
#[derive(Default, Clone)]
pub struct FormulaRegistry {
    formulas: AHashMap<String, Arc<dyn Formula>>,
    params: AHashMap<String, Arc<dyn ParamFormula>>,
}

impl FormulaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, formula: Arc<dyn Formula>) -> &mut Self {
        self.formulas.insert(formula.source().to_string(), formula);
        self
    }

    pub fn register_param(&mut self, param: Arc<dyn ParamFormula>) -> &mut Self {
        self.params.insert(param.source().to_string(), param);
        self
    }
}

impl FormulaCompiler for FormulaRegistry {
    fn compile_formula(&self, source: &str) -> Result<Arc<dyn Formula>> {
        self.formulas
            .get(source)
            .cloned()
            .ok_or_else(|| ModelError::Formula(format!("no formula registered for {source:?}")))
    }

    fn compile_param(&self, source: &str) -> Result<Arc<dyn ParamFormula>> {
        self.params
            .get(source)
            .cloned()
            .ok_or_else(|| ModelError::Formula(format!("no parameter formula registered for {source:?}")))
    }
}

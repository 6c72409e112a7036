//! Formula evaluation.
//!
//! Cell values are computed on demand and cached per argument tuple. While a
//! formula runs it sees the model through an [`EvalContext`]: names resolve
//! through the namespace of the cell's space, and calls into other cells are
//! recorded so clearing the callee's cache also clears the caller's.

use crate::entity::{Binding, ObjectId};
use crate::error::{ModelError, Result};
use crate::model::Model;
use crate::value::Value;

/// Free stack below which a formula call moves to a fresh segment.
const RED_ZONE: usize = 128 * 1024;
/// Size of each segment allocated for nested formula calls.
const STACK_PER_RECURSION: usize = 2 * 1024 * 1024;

/// Frames of the cells being evaluated, innermost last.
#[derive(Debug, Clone)]
pub(crate) struct CallStack {
    frames: Vec<(ObjectId, Vec<Value>)>,
    max_depth: usize,
}

impl CallStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.max_depth
    }

    pub fn push(&mut self, cell: ObjectId, args: Vec<Value>) {
        self.frames.push((cell, args));
    }

    pub fn pop(&mut self) {
        self.frames.pop();
    }

    pub fn frames(&self) -> &[(ObjectId, Vec<Value>)] {
        &self.frames
    }
}

/// Keep the first and last lines of a long trace around a `...` line.
fn shorten(lines: Vec<String>, keep: usize) -> Vec<String> {
    if keep == 0 || lines.len() <= keep {
        return lines;
    }
    let head = keep / 2;
    let tail = keep - head;
    let mut out: Vec<String> = lines[..head].to_vec();
    out.push("...".to_string());
    out.extend_from_slice(&lines[lines.len() - tail..]);
    out
}

/// A formula's window onto the model.
pub struct EvalContext<'m> {
    model: &'m mut Model,
    space: ObjectId,
    cell: Option<ObjectId>,
}

impl<'m> EvalContext<'m> {
    pub(crate) fn new(model: &'m mut Model, space: ObjectId, cell: Option<ObjectId>) -> Self {
        Self { model, space, cell }
    }

    /// Space whose namespace this formula reads.
    pub fn space(&self) -> ObjectId {
        self.space
    }

    /// Cell being evaluated, `None` for parameter formulas.
    pub fn cell(&self) -> Option<ObjectId> {
        self.cell
    }

    pub fn model(&self) -> &Model {
        &*self.model
    }

    pub fn lookup(&mut self, name: &str) -> Result<Binding> {
        self.model.lookup(self.space, name)?.ok_or_else(|| {
            ModelError::Formula(format!(
                "name {name:?} is not defined in {}",
                self.model.display_name(self.space)
            ))
        })
    }

    /// Value of `name`: a reference's value, a space handle, or the value
    /// of a cell called without arguments.
    pub fn value(&mut self, name: &str) -> Result<Value> {
        match self.lookup(name)? {
            Binding::Value(v) => Ok(v),
            Binding::Space(id) => Ok(Value::Space(id)),
            Binding::Cell(id) => self.call_cell(id, &[]),
        }
    }

    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value> {
        match self.lookup(name)? {
            Binding::Cell(id) => self.call_cell(id, args),
            _ => Err(ModelError::Formula(format!("{name:?} is not a cell"))),
        }
    }

    pub fn call_cell(&mut self, cell: ObjectId, args: &[Value]) -> Result<Value> {
        self.model.eval_cell(cell, args, self.cell)
    }

    /// Call cell `name` as seen from `space`, e.g. a member of a dynamic item.
    pub fn call_in(&mut self, space: ObjectId, name: &str, args: &[Value]) -> Result<Value> {
        match self.model.lookup(space, name)? {
            Some(Binding::Cell(id)) => self.call_cell(id, args),
            _ => Err(ModelError::Formula(format!(
                "{name:?} is not a cell of {}",
                self.model.display_name(space)
            ))),
        }
    }

    /// Space bound to `name`, directly or through a reference.
    pub fn space_named(&mut self, name: &str) -> Result<ObjectId> {
        match self.lookup(name)? {
            Binding::Space(id) => Ok(id),
            Binding::Value(Value::Space(id)) => Ok(id),
            _ => Err(ModelError::Formula(format!("{name:?} is not a space"))),
        }
    }

    pub fn dynamic_space(&mut self, space: ObjectId, args: &[Value]) -> Result<ObjectId> {
        self.model.dynamic_space(space, args)
    }
}

impl Model {
    /// Value of `cell` for `args`, from the cache or by evaluating its formula.
    /// A cell without a formula evaluates to `Value::Null`.
    pub fn cell_value(&mut self, cell: ObjectId, args: &[Value]) -> Result<Value> {
        self.eval_cell(cell, args, None)
    }

    pub(crate) fn eval_cell(&mut self, cell: ObjectId, args: &[Value], caller: Option<ObjectId>) -> Result<Value> {
        let (node, space) = {
            let entity = self.entity(cell)?;
            let body = entity.cell().ok_or_else(|| self.not_a(cell, "cell"))?;
            (body.node, entity.parent.ok_or(ModelError::NotFound(cell))?)
        };
        if let Some(caller) = caller {
            self.dependents.entry(cell).or_default().insert(caller);
        }
        self.refresh(node)?;

        let body = self.cell_body(cell)?;
        if let Some(value) = body.values.get(args) {
            return Ok(value.clone());
        }
        let Some(formula) = body.formula.clone() else {
            return Ok(Value::Null);
        };

        if self.stack.is_full() {
            return Err(ModelError::DepthExceeded {
                scope: "Formula chain".to_string(),
                limit: self.config.max_call_depth,
                trace: self.call_trace(cell, args),
            });
        }
        tracing::trace!(cell = %self.display_name(cell), depth = self.stack.depth(), "evaluate");
        self.stack.push(cell, args.to_vec());
        // Formula chains recurse through this function, so the native stack
        // must hold `max_call_depth` nested calls.
        let result = stacker::maybe_grow(RED_ZONE, STACK_PER_RECURSION, || {
            let mut ctx = EvalContext::new(self, space, Some(cell));
            formula.evaluate(&mut ctx, args)
        });
        self.stack.pop();
        let value = result?;

        if let Ok(body) = self.cell_body_mut(cell) {
            body.values.insert(args.to_vec(), value.clone());
        }
        Ok(value)
    }

    /// Current call stack plus the frame that could not be pushed.
    fn call_trace(&self, cell: ObjectId, args: &[Value]) -> String {
        let frames = self
            .stack
            .frames()
            .iter()
            .map(|(c, a)| (*c, a.as_slice()))
            .chain(std::iter::once((cell, args)));
        let lines: Vec<String> = frames
            .enumerate()
            .map(|(i, (c, a))| {
                let args: Vec<String> = a.iter().map(Value::to_string).collect();
                format!("{i}: {}({})", self.display_name(c), args.join(", "))
            })
            .collect();
        shorten(lines, self.config.trace_lines).join("\n")
    }
}

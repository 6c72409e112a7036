//! Dynamic spaces.
//!
//! A space with a parameter formula can be indexed by argument tuples. Each
//! tuple produces a dynamic item: a space outside the containment tree whose
//! bases come from the parameter formula and whose argument references are
//! visible to the formulas inside it. Items are cached per tuple and thrown
//! away whenever their space reconciles.

use crate::entity::{ContentSource, DynamicOrigin, EntityKind, ObjectId, RefRole};
use crate::error::{ModelError, Result};
use crate::eval::EvalContext;
use crate::formula::ParamFormula;
use crate::model::{validate_name, Arena, Model};
use crate::value::Value;
use std::sync::Arc;

impl Model {
    /// Install (or with `None`, drop) the parameter formula of `space`.
    /// Spaces deriving from `space` pick the formula up unless they have
    /// their own.
    pub fn set_parameter(&mut self, space: ObjectId, param: Option<Arc<dyn ParamFormula>>) -> Result<()> {
        tracing::debug!(space = %self.display_name(space), "set parameter");
        self.require_static_space(space)?;
        if let Some(p) = &param {
            for name in p.params() {
                validate_name(&name)?;
            }
        }
        self.transaction(|m| {
            let source = if param.is_some() {
                ContentSource::Own
            } else {
                ContentSource::Inherited
            };
            let body = m.space_body_mut(space)?;
            body.param = param;
            body.param_source = source;
            m.make_explicit(space)?;
            m.clear_dynamic_items(space)?;
            if source == ContentSource::Inherited {
                m.inherit_tree(space)?;
            }
            m.traverse_from(space, true)
        })
    }

    /// Parameter names, `None` when the space is not parametrized.
    pub fn parameters(&self, space: ObjectId) -> Result<Option<Vec<String>>> {
        Ok(self.space_body(space)?.param.as_ref().map(|p| p.params()))
    }

    pub fn parameter_source(&self, space: ObjectId) -> Result<Option<String>> {
        Ok(self
            .space_body(space)?
            .param
            .as_ref()
            .map(|p| p.source().to_string()))
    }

    /// Argument bindings of a dynamic item, in parameter order.
    pub fn arguments(&self, item: ObjectId) -> Result<Vec<(String, Value)>> {
        let body = self.space_body(item)?;
        let Some(origin) = &body.origin else {
            return Ok(Vec::new());
        };
        let params = self.parameters(origin.space)?.unwrap_or_default();
        Ok(params.into_iter().zip(origin.args.iter().cloned()).collect())
    }

    /// Space `item` was created from, with its arguments.
    pub fn dynamic_origin(&self, item: ObjectId) -> Result<Option<(ObjectId, Vec<Value>)>> {
        Ok(self
            .space_body(item)?
            .origin
            .as_ref()
            .map(|o| (o.space, o.args.clone())))
    }

    /// The item of `space` for `args`, created on first use.
    pub fn dynamic_space(&mut self, space: ObjectId, args: &[Value]) -> Result<ObjectId> {
        let body = self.space_body(space)?;
        if let Some(item) = body.dynamic.get(args) {
            return Ok(*item);
        }
        let param = body.param.clone().ok_or_else(|| {
            ModelError::Formula(format!("{} has no parameter", self.display_name(space)))
        })?;
        let params = param.params();
        if params.len() != args.len() {
            return Err(ModelError::Formula(format!(
                "{} takes {} argument(s), {} given",
                self.display_name(space),
                params.len(),
                args.len()
            )));
        }

        let requested = {
            let mut ctx = EvalContext::new(self, space, None);
            param.bases(&mut ctx, args)?
        }
        .unwrap_or_else(|| vec![space]);

        let mut bases: Vec<ObjectId> = Vec::with_capacity(requested.len());
        for b in requested {
            let defining = self.defining_space(b)?;
            if !bases.contains(&defining) {
                bases.push(defining);
            }
        }
        self.create_dynamic(space, args, &params, &bases)
    }

    /// The explicit space that a space takes its definition from, following
    /// the first base of derived spaces.
    pub fn defining_space(&self, space: ObjectId) -> Result<ObjectId> {
        let limit = self.config.max_traversal_depth;
        let mut cur = space;
        for _ in 0..=limit {
            let entity = self.entity(cur)?;
            if entity.kind() != EntityKind::Space {
                return Err(self.not_a(cur, "space"));
            }
            if entity.is_dynamic() {
                return Err(ModelError::structural(format!(
                    "dynamic space {} cannot be a base",
                    self.display_name(cur)
                )));
            }
            if !entity.is_derived {
                return Ok(cur);
            }
            match self.bases(cur)?.first() {
                Some(b) => cur = *b,
                None => return Ok(cur),
            }
        }
        Err(ModelError::DepthExceeded {
            scope: "Base resolution".to_string(),
            limit,
            trace: self.display_name(space),
        })
    }

    fn create_dynamic(
        &mut self,
        space: ObjectId,
        args: &[Value],
        params: &[String],
        bases: &[ObjectId],
    ) -> Result<ObjectId> {
        let (name, parent) = {
            let entity = self.entity(space)?;
            let shown: Vec<String> = args.iter().map(Value::to_string).collect();
            (
                format!("{}[{}]", entity.name, shown.join(", ")),
                entity.parent.ok_or(ModelError::NotFound(space))?,
            )
        };
        let origin = DynamicOrigin {
            space,
            args: args.to_vec(),
        };
        let item = self.create_space(parent, &name, true, Some(origin))?;
        self.space_body_mut(space)?.dynamic.insert(args.to_vec(), item);

        if let Err(err) = self.build_dynamic(item, params, args, bases) {
            if self.contains(item) {
                self.remove_subtree(item)?;
            }
            return Err(err);
        }
        tracing::debug!(item = %self.display_name(item), bases = bases.len(), "dynamic space created");
        Ok(item)
    }

    fn build_dynamic(&mut self, item: ObjectId, params: &[String], args: &[Value], bases: &[ObjectId]) -> Result<()> {
        for (param, arg) in params.iter().zip(args) {
            self.create_reference(
                item,
                param,
                false,
                arg.clone(),
                ContentSource::Own,
                RefRole::Argument,
            )?;
        }
        for base in bases {
            self.graph.add_edge(&Arena::new(&self.entities), *base, item)?;
        }
        self.inherit_tree(item)
    }
}

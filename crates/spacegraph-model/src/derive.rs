//! Derivation: how members obtain their bases and reconcile with them.
//!
//! Every member kind answers the same two questions through
//! [`DerivePolicy`]: which bases does it declare itself, and what does
//! `inherit` do with the full base list. The full list is
//! `self_bases ++ parent_bases`, where the parent part comes from the
//! same-named, same-kind members of the container's bases.

use crate::entity::{ContentSource, EntityKind, Layer, MemberKind, ObjectId, Slot};
use crate::error::{ModelError, Result};
use crate::model::{ordered_entries, Arena, Model};
use ahash::AHashSet;
use spacegraph_lazy::ChainView;
use std::sync::Arc;

pub(crate) trait DerivePolicy: Sync {
    /// Bases declared by the member itself.
    fn self_bases(&self, model: &Model, id: ObjectId) -> Result<Vec<ObjectId>>;

    /// Reconcile `id` with `bases`. Returns the members that must be
    /// reconciled next.
    fn inherit(&self, model: &mut Model, id: ObjectId, bases: &[ObjectId]) -> Result<Vec<ObjectId>>;
}

pub(crate) struct SpacePolicy;
pub(crate) struct CellPolicy;
pub(crate) struct RefPolicy;

pub(crate) fn policy(kind: MemberKind) -> &'static dyn DerivePolicy {
    match kind {
        MemberKind::Space => &SpacePolicy,
        MemberKind::Cell => &CellPolicy,
        MemberKind::Reference => &RefPolicy,
    }
}

fn same_arc<T: ?Sized>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ()),
        (None, None) => true,
        _ => false,
    }
}

impl DerivePolicy for SpacePolicy {
    fn self_bases(&self, model: &Model, id: ObjectId) -> Result<Vec<ObjectId>> {
        let mut mro = model.graph.get_mro(id)?;
        mro.remove(0);
        Ok(mro)
    }

    fn inherit(&self, model: &mut Model, id: ObjectId, bases: &[ObjectId]) -> Result<Vec<ObjectId>> {
        tracing::debug!(space = %model.display_name(id), bases = bases.len(), "inherit");

        let body = model.space_body(id)?;
        if body.param_source != ContentSource::Own {
            let inherited = match bases.first() {
                Some(b) => model.space_body(*b)?.param.clone(),
                None => None,
            };
            if !same_arc(&body.param, &inherited) {
                model.space_body_mut(id)?.param = inherited;
            }
        }
        model.clear_dynamic_items(id)?;

        let mut next = Vec::new();
        for kind in MemberKind::ALL {
            let slot = Slot::from(kind);
            let layers: Vec<Layer> = bases.iter().map(|b| Layer::new(*b, slot)).collect();
            for layer in &layers {
                model.refresh_layer(*layer)?;
            }
            let provided: Vec<String> = ChainView::union(&model.arena(), &layers)
                .into_iter()
                .map(|(name, _)| name)
                .collect();

            for name in &provided {
                match model.container(id)?.member(name) {
                    Some((existing, member)) if existing == kind => next.push(member),
                    Some((existing, _)) => {
                        tracing::warn!(
                            space = %model.display_name(id),
                            name = %name,
                            local = existing.label(),
                            inherited = kind.label(),
                            "derived member skipped, name already in use"
                        );
                    }
                    None => {
                        let member = match kind {
                            MemberKind::Space => model.create_space(id, name, true, None)?,
                            MemberKind::Cell => model.create_cell(id, name, true)?,
                            MemberKind::Reference => model.create_reference(
                                id,
                                name,
                                true,
                                crate::value::Value::Null,
                                ContentSource::Inherited,
                                crate::entity::RefRole::Member,
                            )?,
                        };
                        next.push(member);
                    }
                }
            }

            let provided: AHashSet<&str> = provided.iter().map(String::as_str).collect();
            let local = ordered_entries(model.container(id)?.slot(slot));
            for (name, member) in local {
                if provided.contains(name.as_str()) {
                    continue;
                }
                if !model.is_derived(member)? {
                    next.push(member);
                } else if kind == MemberKind::Space && model.is_base_of_external(member) {
                    tracing::warn!(
                        space = %model.display_name(member),
                        "derived space kept, it is a base of other spaces"
                    );
                    next.push(member);
                } else {
                    model.remove_subtree(member)?;
                }
            }
        }
        Ok(next)
    }
}

impl DerivePolicy for CellPolicy {
    fn self_bases(&self, _model: &Model, _id: ObjectId) -> Result<Vec<ObjectId>> {
        Ok(Vec::new())
    }

    fn inherit(&self, model: &mut Model, id: ObjectId, bases: &[ObjectId]) -> Result<Vec<ObjectId>> {
        let body = model.cell_body(id)?;
        if body.source == ContentSource::Own {
            return Ok(Vec::new());
        }
        let inherited = match bases.first() {
            Some(b) => model.cell_body(*b)?.formula.clone(),
            None => None,
        };
        if !same_arc(&body.formula, &inherited) {
            model.install_formula(id, inherited, ContentSource::Inherited)?;
        }
        Ok(Vec::new())
    }
}

impl DerivePolicy for RefPolicy {
    fn self_bases(&self, _model: &Model, _id: ObjectId) -> Result<Vec<ObjectId>> {
        Ok(Vec::new())
    }

    fn inherit(&self, model: &mut Model, id: ObjectId, bases: &[ObjectId]) -> Result<Vec<ObjectId>> {
        let body = model.ref_body(id)?;
        if body.source == ContentSource::Own {
            return Ok(Vec::new());
        }
        let inherited = match bases.first() {
            Some(b) => model.ref_body(*b)?.value.clone(),
            None => crate::value::Value::Null,
        };
        if body.value != inherited {
            model.install_value(id, inherited, ContentSource::Inherited)?;
        }
        Ok(Vec::new())
    }
}

impl Model {
    fn policy_of(&self, id: ObjectId) -> Result<Option<&'static dyn DerivePolicy>> {
        Ok(self.entity(id)?.kind().member_kind().map(policy))
    }

    /// Bases the member declares itself: a space's MRO without the space,
    /// nothing for cells and references.
    pub fn self_bases(&self, id: ObjectId) -> Result<Vec<ObjectId>> {
        match self.policy_of(id)? {
            Some(p) => p.self_bases(self, id),
            None => Ok(Vec::new()),
        }
    }

    /// Bases the member gets from its container's bases.
    pub fn parent_bases(&self, id: ObjectId) -> Result<Vec<ObjectId>> {
        let own = self.self_bases(id)?.len();
        let mut all = self.bases(id)?;
        Ok(all.split_off(own))
    }

    /// `self_bases ++ parent_bases`.
    pub fn bases(&self, id: ObjectId) -> Result<Vec<ObjectId>> {
        let limit = self.config.max_traversal_depth;

        // Ancestors that contribute parent bases, innermost first. Dynamic
        // items and argument references stop the chain.
        let mut chain = vec![id];
        loop {
            let Some(cur) = chain.last().copied() else {
                break;
            };
            let entity = self.entity(cur)?;
            if entity.is_dynamic() || entity.is_argument() {
                break;
            }
            match entity.parent {
                Some(p) if p != ObjectId::ROOT => {
                    if chain.len() > limit {
                        return Err(ModelError::DepthExceeded {
                            scope: "Base resolution".to_string(),
                            limit,
                            trace: self.display_name(id),
                        });
                    }
                    chain.push(p);
                }
                _ => break,
            }
        }

        let mut container_bases: Vec<ObjectId> = Vec::new();
        for (depth, cur) in chain.iter().rev().enumerate() {
            let mut bases = self.self_bases(*cur)?;
            if depth > 0 {
                let entity = self.entity(*cur)?;
                if let Some(kind) = entity.kind().member_kind() {
                    let arena = Arena::new(&self.entities);
                    for b in &container_bases {
                        let found = arena
                            .get(*b)
                            .and_then(|e| e.container())
                            .and_then(|c| c.slot(kind.into()).get(&entity.name).copied());
                        if let Some(found) = found {
                            bases.push(found);
                        }
                    }
                }
            }
            container_bases = bases;
        }
        Ok(container_bases)
    }

    /// Reconcile `id` and, depth first, every member it creates or keeps.
    pub(crate) fn inherit_tree(&mut self, id: ObjectId) -> Result<()> {
        let limit = self.config.max_traversal_depth;
        let mut stack: Vec<(ObjectId, usize)> = vec![(id, 0)];
        while let Some((cur, depth)) = stack.pop() {
            if depth > limit {
                return Err(ModelError::DepthExceeded {
                    scope: "Inheritance reconciliation".to_string(),
                    limit,
                    trace: self.display_name(cur),
                });
            }
            let Some(entity) = self.arena().get(cur) else {
                continue;
            };
            if entity.kind() == EntityKind::Model || entity.is_argument() {
                continue;
            }
            let Some(policy) = self.policy_of(cur)? else {
                continue;
            };
            let bases = self.bases(cur)?;
            let next = policy.inherit(self, cur, &bases)?;
            for member in next.into_iter().rev() {
                stack.push((member, depth + 1));
            }
        }
        Ok(())
    }
}

//! The model arena.
//!
//! A [`Model`] owns every entity, the inheritance graph and the observer
//! engine. Structural operations (`new_*`, `delete_member`, `add_base`,
//! `remove_base`, ...) validate first, then mutate, then drive a traversal so
//! every affected space reconciles its derived members. With
//! [`ModelConfig::transactional`] set, a failed operation restores the model
//! to the state it had before the call.

use crate::config::ModelConfig;
use crate::entity::{
    Binding, Body, CellBody, Container, ContentSource, DynamicOrigin, Entity, EntityKind, Layer,
    MemberKind, MemberMap, ObjectId, RefBody, RefRole, Slot, SpaceBody,
};
use crate::error::{ModelError, Result};
use crate::eval::CallStack;
use crate::formula::Formula;
use crate::graph::{self, Containment, SpaceGraph, TraversalHost};
use crate::value::Value;
use ahash::{AHashMap, AHashSet};
use spacegraph_lazy::{stable_order, ChainView, LayerSource, LazyGraph, NodeId};
use std::fmt;
use std::sync::Arc;

/// What an engine node caches on behalf of its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Payload {
    /// Order and public surface of one member map
    Members(Layer),
    /// Flattened name order of a space's namespace chain
    Namespace(ObjectId),
    /// Lexical bindings and value cache of a cell
    Cell(ObjectId),
    /// Value holder; nothing to recompute
    Reference(ObjectId),
}

#[derive(Clone)]
pub struct Model {
    pub(crate) config: ModelConfig,
    pub(crate) entities: Vec<Option<Entity>>,
    pub(crate) graph: SpaceGraph,
    pub(crate) lazy: LazyGraph,
    pub(crate) payloads: AHashMap<NodeId, Payload>,
    /// callee cell -> cells whose cached values were computed by calling it
    pub(crate) dependents: AHashMap<ObjectId, AHashSet<ObjectId>>,
    pub(crate) stack: CallStack,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name())
            .field("entities", &self.len())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}

// ============================================================================
// Arena views
// ============================================================================

/// Shared view of the entity arena, usable while other model fields are
/// borrowed mutably.
#[derive(Clone, Copy)]
pub(crate) struct Arena<'a> {
    entities: &'a [Option<Entity>],
}

impl<'a> Arena<'a> {
    pub fn new(entities: &'a [Option<Entity>]) -> Self {
        Self { entities }
    }

    pub fn get(&self, id: ObjectId) -> Option<&'a Entity> {
        self.entities.get(id.index()).and_then(Option::as_ref)
    }
}

impl LayerSource<Layer> for Arena<'_> {
    type Value = ObjectId;
    type Surface = Binding;

    fn layer(&self, key: &Layer) -> Option<&MemberMap> {
        self.get(key.owner)?.container().map(|c| c.slot(key.slot))
    }
}

impl Containment for Arena<'_> {
    fn contains(&self, v: ObjectId) -> bool {
        self.get(v).is_some_and(|e| e.kind() == EntityKind::Space)
    }

    fn parent_space(&self, v: ObjectId) -> Option<ObjectId> {
        let e = self.get(v)?;
        if e.kind() != EntityKind::Space || e.is_dynamic() {
            return None;
        }
        e.parent.filter(|p| *p != ObjectId::ROOT)
    }

    fn child_spaces(&self, v: ObjectId) -> Vec<ObjectId> {
        self.get(v)
            .and_then(Entity::container)
            .map(|c| ordered_entries(&c.spaces).into_iter().map(|(_, id)| id).collect())
            .unwrap_or_default()
    }
}

/// Entries of `map` in the order its next rebuild will produce.
pub(crate) fn ordered_entries(map: &MemberMap) -> Vec<(String, ObjectId)> {
    let mut order = map.order().to_vec();
    stable_order(&mut order, map.keys());
    order
        .into_iter()
        .filter_map(|name| {
            let id = *map.get(&name)?;
            Some((name, id))
        })
        .collect()
}

/// Member names are identifiers that do not start with `_`.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => first.is_alphabetic() && chars.all(|c| c.is_alphanumeric() || c == '_'),
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ModelError::InvalidName(name.to_string()))
    }
}

fn slot_for_role(role: RefRole) -> Slot {
    match role {
        RefRole::Member => Slot::References,
        RefRole::Argument => Slot::Arguments,
    }
}

// ============================================================================
// Construction and access
// ============================================================================

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, ModelConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: ModelConfig) -> Self {
        let name = name.into();
        let mut model = Self::empty(config);
        let container = model.build_container(ObjectId::ROOT, &name);
        model.entities.push(Some(Entity {
            name,
            parent: None,
            is_derived: false,
            body: Body::Root(container),
        }));
        model
    }

    /// Model without a root entity; `restore` fills the arena itself.
    pub(crate) fn empty(config: ModelConfig) -> Self {
        Self {
            graph: SpaceGraph::new(config.max_traversal_depth),
            lazy: LazyGraph::with_max_depth(config.max_traversal_depth),
            payloads: AHashMap::new(),
            dependents: AHashMap::new(),
            stack: CallStack::new(config.max_call_depth),
            entities: Vec::new(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        self.entities
            .first()
            .and_then(Option::as_ref)
            .map(|e| e.name.as_str())
            .unwrap_or_default()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Live entities, the model itself included.
    pub fn len(&self) -> usize {
        self.entities.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.arena().get(id).is_some()
    }

    /// Observer engine, exposed for inspection.
    pub fn lazy(&self) -> &LazyGraph {
        &self.lazy
    }

    pub fn graph(&self) -> &SpaceGraph {
        &self.graph
    }

    pub(crate) fn arena(&self) -> Arena<'_> {
        Arena::new(&self.entities)
    }

    pub(crate) fn entity(&self, id: ObjectId) -> Result<&Entity> {
        self.arena().get(id).ok_or(ModelError::NotFound(id))
    }

    pub(crate) fn entity_mut(&mut self, id: ObjectId) -> Result<&mut Entity> {
        self.entities
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(ModelError::NotFound(id))
    }

    pub(crate) fn not_a(&self, id: ObjectId, what: &str) -> ModelError {
        ModelError::structural(format!("{} is not a {what}", self.display_name(id)))
    }

    pub(crate) fn container(&self, id: ObjectId) -> Result<&Container> {
        let entity = self.entity(id)?;
        entity.container().ok_or_else(|| self.not_a(id, "space"))
    }

    pub(crate) fn container_mut(&mut self, id: ObjectId) -> Result<&mut Container> {
        let is_container = self.entity(id)?.container().is_some();
        if !is_container {
            return Err(self.not_a(id, "space"));
        }
        self.entity_mut(id)?
            .container_mut()
            .ok_or(ModelError::NotFound(id))
    }

    pub(crate) fn space_body(&self, id: ObjectId) -> Result<&SpaceBody> {
        let entity = self.entity(id)?;
        entity.space().ok_or_else(|| self.not_a(id, "space"))
    }

    pub(crate) fn space_body_mut(&mut self, id: ObjectId) -> Result<&mut SpaceBody> {
        if self.entity(id)?.space().is_none() {
            return Err(self.not_a(id, "space"));
        }
        self.entity_mut(id)?.space_mut().ok_or(ModelError::NotFound(id))
    }

    pub(crate) fn cell_body(&self, id: ObjectId) -> Result<&CellBody> {
        let entity = self.entity(id)?;
        entity.cell().ok_or_else(|| self.not_a(id, "cell"))
    }

    pub(crate) fn cell_body_mut(&mut self, id: ObjectId) -> Result<&mut CellBody> {
        if self.entity(id)?.cell().is_none() {
            return Err(self.not_a(id, "cell"));
        }
        self.entity_mut(id)?.cell_mut().ok_or(ModelError::NotFound(id))
    }

    pub(crate) fn ref_body(&self, id: ObjectId) -> Result<&RefBody> {
        let entity = self.entity(id)?;
        entity.reference().ok_or_else(|| self.not_a(id, "reference"))
    }

    pub(crate) fn ref_body_mut(&mut self, id: ObjectId) -> Result<&mut RefBody> {
        if self.entity(id)?.reference().is_none() {
            return Err(self.not_a(id, "reference"));
        }
        self.entity_mut(id)?.reference_mut().ok_or(ModelError::NotFound(id))
    }

    pub(crate) fn layer_map(&self, layer: Layer) -> Result<&MemberMap> {
        Ok(self.container(layer.owner)?.slot(layer.slot))
    }

    fn layer_map_mut(&mut self, layer: Layer) -> Result<&mut MemberMap> {
        Ok(self.container_mut(layer.owner)?.slot_mut(layer.slot))
    }

    // ------------------------------------------------------------------------
    // Entity builders
    // ------------------------------------------------------------------------

    pub(crate) fn build_container(&mut self, owner: ObjectId, label: &str) -> Container {
        let container = Container {
            spaces: MemberMap::new(&mut self.lazy, format!("{label}.spaces")),
            cells: MemberMap::new(&mut self.lazy, format!("{label}.cells")),
            refs: MemberMap::new(&mut self.lazy, format!("{label}.refs")),
            args: MemberMap::new(&mut self.lazy, format!("{label}.args")),
            namespace: ChainView::empty(&mut self.lazy, format!("{label}.namespace")),
        };
        self.register_container(owner, &container);
        container
    }

    pub(crate) fn register_container(&mut self, owner: ObjectId, container: &Container) {
        for slot in [Slot::Spaces, Slot::Cells, Slot::References, Slot::Arguments] {
            self.payloads.insert(
                container.slot(slot).node(),
                Payload::Members(Layer::new(owner, slot)),
            );
        }
        self.payloads
            .insert(container.namespace.node(), Payload::Namespace(owner));
    }

    fn next_id(&self) -> ObjectId {
        ObjectId::new(self.entities.len() as u32)
    }

    pub(crate) fn create_space(
        &mut self,
        parent: ObjectId,
        name: &str,
        is_derived: bool,
        origin: Option<DynamicOrigin>,
    ) -> Result<ObjectId> {
        let id = self.next_id();
        let label = format!("{}.{name}", self.display_name(parent));
        let container = self.build_container(id, &label);
        let is_dynamic = origin.is_some();
        self.entities.push(Some(Entity {
            name: name.to_string(),
            parent: Some(parent),
            is_derived,
            body: Body::Space(SpaceBody {
                container,
                param: None,
                param_source: ContentSource::Inherited,
                dynamic: AHashMap::new(),
                origin,
            }),
        }));
        self.install_namespace(id)?;
        if !is_dynamic {
            self.map_insert(parent, Slot::Spaces, name, id)?;
        }
        Ok(id)
    }

    pub(crate) fn create_cell(
        &mut self,
        parent: ObjectId,
        name: &str,
        is_derived: bool,
    ) -> Result<ObjectId> {
        let id = self.next_id();
        let node = self
            .lazy
            .add_node(format!("{}.{name}", self.display_name(parent)));
        self.payloads.insert(node, Payload::Cell(id));
        self.entities.push(Some(Entity {
            name: name.to_string(),
            parent: Some(parent),
            is_derived,
            body: Body::Cell(CellBody {
                node,
                formula: None,
                source: ContentSource::Inherited,
                values: AHashMap::new(),
                lexdeps: Vec::new(),
            }),
        }));
        let namespace = self.container(parent)?.namespace.node();
        self.lazy.add_observer(namespace, node)?;
        self.map_insert(parent, Slot::Cells, name, id)?;
        Ok(id)
    }

    pub(crate) fn create_reference(
        &mut self,
        parent: ObjectId,
        name: &str,
        is_derived: bool,
        value: Value,
        source: ContentSource,
        role: RefRole,
    ) -> Result<ObjectId> {
        let id = self.next_id();
        let node = self
            .lazy
            .add_node(format!("{}.{name}", self.display_name(parent)));
        self.payloads.insert(node, Payload::Reference(id));
        self.entities.push(Some(Entity {
            name: name.to_string(),
            parent: Some(parent),
            is_derived,
            body: Body::Reference(RefBody {
                node,
                value,
                source,
                role,
            }),
        }));
        self.map_insert(parent, slot_for_role(role), name, id)?;
        Ok(id)
    }

    /// Layers of a space's namespace, most specific first.
    pub(crate) fn namespace_layers(&self, id: ObjectId) -> Result<Vec<Layer>> {
        if id == ObjectId::ROOT {
            return Ok(Vec::new());
        }
        let mut layers = vec![
            Layer::new(id, Slot::Cells),
            Layer::new(id, Slot::Spaces),
            Layer::new(id, Slot::References),
            Layer::new(id, Slot::Arguments),
        ];
        let mut cur = self.entity(id)?.parent;
        while let Some(p) = cur {
            if p == ObjectId::ROOT {
                break;
            }
            let entity = self.entity(p)?;
            if entity.is_dynamic() {
                layers.push(Layer::new(p, Slot::Arguments));
            }
            cur = entity.parent;
        }
        layers.push(Layer::new(ObjectId::ROOT, Slot::References));
        Ok(layers)
    }

    pub(crate) fn install_namespace(&mut self, id: ObjectId) -> Result<()> {
        let layers = self.namespace_layers(id)?;
        let mut namespace = self.container(id)?.namespace.clone();
        namespace.set_layers(&mut self.lazy, layers, &Arena::new(&self.entities))?;
        self.container_mut(id)?.namespace = namespace;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Engine plumbing
    // ------------------------------------------------------------------------

    pub(crate) fn map_insert(&mut self, owner: ObjectId, slot: Slot, name: &str, id: ObjectId) -> Result<()> {
        let Self { entities, lazy, .. } = &mut *self;
        let map = entities
            .get_mut(owner.index())
            .and_then(Option::as_mut)
            .and_then(Entity::container_mut)
            .ok_or(ModelError::NotFound(owner))?
            .slot_mut(slot);
        let (_, flagged) = map.set(lazy, name, id, false)?;
        self.invalidate(&flagged);
        Ok(())
    }

    pub(crate) fn map_remove(&mut self, owner: ObjectId, slot: Slot, name: &str) -> Result<()> {
        let Self { entities, lazy, .. } = &mut *self;
        let map = entities
            .get_mut(owner.index())
            .and_then(Option::as_mut)
            .and_then(Entity::container_mut)
            .ok_or(ModelError::NotFound(owner))?
            .slot_mut(slot);
        let (_, flagged) = map.remove(lazy, name, false)?;
        self.invalidate(&flagged);
        Ok(())
    }

    /// Dirty `node` and its observers, dropping the value caches of every
    /// cell that became dirty and of the cells that called them.
    pub(crate) fn mark_dirty(&mut self, node: NodeId, skip_self: bool) -> Result<()> {
        let flagged = self.lazy.mark_dirty(node, skip_self)?;
        self.invalidate(&flagged);
        Ok(())
    }

    fn invalidate(&mut self, flagged: &[NodeId]) {
        let cells: Vec<ObjectId> = flagged
            .iter()
            .filter_map(|n| match self.payloads.get(n) {
                Some(Payload::Cell(id)) => Some(*id),
                _ => None,
            })
            .collect();
        self.invalidate_values(cells);
    }

    pub(crate) fn invalidate_values(&mut self, cells: impl IntoIterator<Item = ObjectId>) {
        let mut work: Vec<ObjectId> = cells.into_iter().collect();
        let mut seen = AHashSet::new();
        while let Some(cell) = work.pop() {
            if !seen.insert(cell) {
                continue;
            }
            if let Some(body) = self
                .entities
                .get_mut(cell.index())
                .and_then(Option::as_mut)
                .and_then(Entity::cell_mut)
            {
                body.values.clear();
            }
            if let Some(callers) = self.dependents.remove(&cell) {
                work.extend(callers);
            }
        }
    }

    /// Bring `node` up to date, recomputing each dirty upstream node once.
    pub(crate) fn refresh(&mut self, node: NodeId) -> Result<()> {
        let plan = self.lazy.plan_refresh(node)?;
        for n in plan {
            self.recompute(n)?;
            self.lazy.complete(n)?;
        }
        Ok(())
    }

    pub(crate) fn refresh_layer(&mut self, layer: Layer) -> Result<()> {
        let node = self.layer_map(layer)?.node();
        self.refresh(node)
    }

    fn recompute(&mut self, node: NodeId) -> Result<()> {
        let Some(payload) = self.payloads.get(&node).copied() else {
            return Ok(());
        };
        tracing::trace!(%node, ?payload, "recompute");
        match payload {
            Payload::Members(layer) => {
                let entries: Vec<(String, Binding)> = {
                    let map = self.layer_map(layer)?;
                    map.keys()
                        .filter_map(|name| {
                            let id = *map.get(name)?;
                            Some((name.to_string(), self.binding_for(layer.slot, id)))
                        })
                        .collect()
                };
                let map = self.layer_map_mut(layer)?;
                map.rebuild_order();
                map.install_surface(entries);
            }
            Payload::Namespace(owner) => {
                let names = self.container(owner)?.namespace.collect_names(&self.arena());
                self.container_mut(owner)?.namespace.rebuild(names);
            }
            Payload::Cell(cell) => self.rebind_lexdeps(cell)?,
            Payload::Reference(_) => {}
        }
        Ok(())
    }

    fn binding_for(&self, slot: Slot, id: ObjectId) -> Binding {
        match slot {
            Slot::Spaces => Binding::Space(id),
            Slot::Cells => Binding::Cell(id),
            Slot::References | Slot::Arguments => Binding::Value(
                self.arena()
                    .get(id)
                    .and_then(Entity::reference)
                    .map(|r| r.value.clone())
                    .unwrap_or(Value::Null),
            ),
        }
    }

    /// Observe the reference nodes the cell's free names resolve to.
    fn rebind_lexdeps(&mut self, cell: ObjectId) -> Result<()> {
        let (node, old, fresh) = {
            let entity = self.entity(cell)?;
            let body = entity.cell().ok_or_else(|| self.not_a(cell, "cell"))?;
            let parent = entity.parent.ok_or(ModelError::NotFound(cell))?;
            let names = body
                .formula
                .as_ref()
                .map(|f| f.free_names())
                .unwrap_or_default();
            let arena = self.arena();
            let namespace = &self.container(parent)?.namespace;
            let mut fresh: Vec<NodeId> = Vec::new();
            for name in &names {
                let target = namespace
                    .get(&arena, name)
                    .and_then(|id| arena.get(*id))
                    .and_then(Entity::reference)
                    .map(|r| r.node);
                if let Some(n) = target {
                    if !fresh.contains(&n) {
                        fresh.push(n);
                    }
                }
            }
            (body.node, body.lexdeps.clone(), fresh)
        };

        for stale in old.iter().filter(|n| !fresh.contains(n)) {
            if self.lazy.contains(*stale) {
                self.lazy.remove_observer(*stale, node)?;
            }
        }
        for source in &fresh {
            self.lazy.add_observer(*source, node)?;
            if self.lazy.is_dirty(*source) {
                self.lazy.complete(*source)?;
            }
        }
        let body = self.cell_body_mut(cell)?;
        body.lexdeps = fresh;
        body.values.clear();
        Ok(())
    }
}

// ============================================================================
// Queries
// ============================================================================

impl Model {
    /// Dotted name starting with the model's name.
    pub fn fullname(&self, id: ObjectId) -> Result<String> {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            let entity = self.entity(c)?;
            parts.push(entity.name.as_str());
            cur = entity.parent;
        }
        parts.reverse();
        Ok(parts.join("."))
    }

    /// [`Model::fullname`] for messages and logs.
    pub fn display_name(&self, id: ObjectId) -> String {
        self.fullname(id).unwrap_or_else(|_| id.to_string())
    }

    pub fn name_of(&self, id: ObjectId) -> Result<&str> {
        Ok(self.entity(id)?.name.as_str())
    }

    pub fn parent(&self, id: ObjectId) -> Result<Option<ObjectId>> {
        Ok(self.entity(id)?.parent)
    }

    pub fn kind(&self, id: ObjectId) -> Result<EntityKind> {
        Ok(self.entity(id)?.kind())
    }

    pub fn is_derived(&self, id: ObjectId) -> Result<bool> {
        Ok(self.entity(id)?.is_derived)
    }

    pub fn is_dynamic(&self, id: ObjectId) -> Result<bool> {
        Ok(self.entity(id)?.is_dynamic())
    }

    /// `id` is a dynamic space or lives inside one.
    pub fn in_dynamic_subtree(&self, id: ObjectId) -> bool {
        let mut cur = Some(id);
        while let Some(c) = cur {
            match self.arena().get(c) {
                Some(e) if e.is_dynamic() => return true,
                Some(e) => cur = e.parent,
                None => return false,
            }
        }
        false
    }

    /// Member named `name` of any kind.
    pub fn member(&self, container: ObjectId, name: &str) -> Option<ObjectId> {
        self.arena()
            .get(container)?
            .container()?
            .member(name)
            .map(|(_, id)| id)
    }

    /// Resolve a dotted path such as `"Model.Space.cell"` or `"Space.cell"`.
    pub fn get_object(&self, path: &str) -> Option<ObjectId> {
        let mut parts = path.split('.').peekable();
        if parts.peek() == Some(&self.name()) {
            parts.next();
        }
        let mut cur = ObjectId::ROOT;
        for part in parts {
            cur = self.member(cur, part)?;
        }
        Some(cur)
    }

    /// Members of `kind` in their stable order.
    pub fn members(&self, container: ObjectId, kind: MemberKind) -> Result<Vec<(String, ObjectId)>> {
        Ok(ordered_entries(self.container(container)?.slot(kind.into())))
    }

    pub fn spaces(&self, container: ObjectId) -> Result<Vec<ObjectId>> {
        self.member_ids(container, MemberKind::Space)
    }

    pub fn cells(&self, container: ObjectId) -> Result<Vec<ObjectId>> {
        self.member_ids(container, MemberKind::Cell)
    }

    pub fn references(&self, container: ObjectId) -> Result<Vec<ObjectId>> {
        self.member_ids(container, MemberKind::Reference)
    }

    fn member_ids(&self, container: ObjectId, kind: MemberKind) -> Result<Vec<ObjectId>> {
        Ok(self
            .members(container, kind)?
            .into_iter()
            .map(|(_, id)| id)
            .collect())
    }

    /// Explicitly defined members of `kind`.
    pub fn self_members(&self, container: ObjectId, kind: MemberKind) -> Result<Vec<ObjectId>> {
        self.filter_members(container, kind, false)
    }

    pub fn derived_members(&self, container: ObjectId, kind: MemberKind) -> Result<Vec<ObjectId>> {
        self.filter_members(container, kind, true)
    }

    fn filter_members(&self, container: ObjectId, kind: MemberKind, derived: bool) -> Result<Vec<ObjectId>> {
        let mut out = Vec::new();
        for id in self.member_ids(container, kind)? {
            if self.entity(id)?.is_derived == derived {
                out.push(id);
            }
        }
        Ok(out)
    }

    pub fn formula_source(&self, cell: ObjectId) -> Result<Option<String>> {
        Ok(self
            .cell_body(cell)?
            .formula
            .as_ref()
            .map(|f| f.source().to_string()))
    }

    pub fn reference_value(&self, reference: ObjectId) -> Result<Value> {
        Ok(self.ref_body(reference)?.value.clone())
    }

    /// Whether leaf content (or a space's parameter) was set by the user.
    pub fn content_source(&self, id: ObjectId) -> Result<ContentSource> {
        let entity = self.entity(id)?;
        match &entity.body {
            Body::Cell(c) => Ok(c.source),
            Body::Reference(r) => Ok(r.source),
            Body::Space(s) => Ok(s.param_source),
            Body::Root(_) => Ok(ContentSource::Own),
        }
    }

    /// Resolve `name` through the namespace of `space`.
    pub fn lookup(&mut self, space: ObjectId, name: &str) -> Result<Option<Binding>> {
        let node = self.container(space)?.namespace.node();
        self.refresh(node)?;
        let namespace = &self.container(space)?.namespace;
        Ok(namespace.surface(&self.arena(), name).cloned())
    }

    /// Names visible from `space`, in namespace order.
    pub fn namespace_names(&mut self, space: ObjectId) -> Result<Vec<String>> {
        let node = self.container(space)?.namespace.node();
        self.refresh(node)?;
        Ok(self.container(space)?.namespace.order().to_vec())
    }

    pub fn namespace_node(&self, space: ObjectId) -> Result<NodeId> {
        Ok(self.container(space)?.namespace.node())
    }

    /// Engine node of a cell or reference.
    pub fn node_of(&self, id: ObjectId) -> Result<NodeId> {
        match &self.entity(id)?.body {
            Body::Cell(c) => Ok(c.node),
            Body::Reference(r) => Ok(r.node),
            _ => Err(self.not_a(id, "cell or reference")),
        }
    }
}

// ============================================================================
// Structural operations
// ============================================================================

impl Model {
    /// Run `op` against a checkpoint when the model is transactional.
    ///
    /// The checkpoint is a full clone, so each call costs time and memory
    /// linear in the model size.
    pub(crate) fn transaction<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if !self.config.transactional {
            return op(self);
        }
        let checkpoint = self.clone();
        match op(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::debug!(error = %err, "structural operation rolled back");
                *self = checkpoint;
                Err(err)
            }
        }
    }

    pub(crate) fn traverse_from(&mut self, v: ObjectId, skip_self: bool) -> Result<()> {
        let limit = self.config.max_traversal_depth;
        graph::traverse(self, v, skip_self, false, limit).map(|_| ())
    }

    pub(crate) fn require_static_space(&self, id: ObjectId) -> Result<()> {
        if self.entity(id)?.kind() != EntityKind::Space {
            return Err(self.not_a(id, "space"));
        }
        if self.in_dynamic_subtree(id) {
            return Err(ModelError::structural(format!(
                "{} belongs to a dynamic space",
                self.display_name(id)
            )));
        }
        Ok(())
    }

    fn require_static_container(&self, id: ObjectId) -> Result<()> {
        if id == ObjectId::ROOT {
            self.entity(id).map(|_| ())
        } else {
            self.require_static_space(id)
        }
    }

    /// Turn an existing derived member of the same kind into an explicit one.
    fn claim_derived(&mut self, container: ObjectId, name: &str, kind: MemberKind) -> Result<Option<ObjectId>> {
        let Some((existing_kind, id)) = self.container(container)?.member(name) else {
            return Ok(None);
        };
        if existing_kind != kind {
            return Err(ModelError::structural(format!(
                "{name:?} is already a {} in {}",
                existing_kind.label(),
                self.display_name(container)
            )));
        }
        if !self.entity(id)?.is_derived {
            return Err(ModelError::structural(format!(
                "{} already exists",
                self.display_name(id)
            )));
        }
        self.make_explicit(id)?;
        Ok(Some(id))
    }

    /// Mark `id` and its container chain explicit.
    pub(crate) fn make_explicit(&mut self, id: ObjectId) -> Result<()> {
        let mut cur = Some(id);
        while let Some(c) = cur {
            if c == ObjectId::ROOT {
                break;
            }
            let entity = self.entity_mut(c)?;
            let was_derived = std::mem::replace(&mut entity.is_derived, false);
            // An explicit ancestor has an explicit chain above it.
            if !was_derived && c != id {
                break;
            }
            cur = entity.parent;
        }
        Ok(())
    }

    pub fn new_space(&mut self, parent: ObjectId, name: &str) -> Result<ObjectId> {
        tracing::debug!(parent = %self.display_name(parent), name, "new space");
        validate_name(name)?;
        self.require_static_container(parent)?;
        self.transaction(|m| {
            if let Some(id) = m.claim_derived(parent, name, MemberKind::Space)? {
                return Ok(id);
            }
            let id = m.create_space(parent, name, false, None)?;
            m.make_explicit(id)?;
            if parent != ObjectId::ROOT {
                m.clear_dynamic_items(parent)?;
            }
            m.inherit_tree(id)?;
            m.traverse_from(id, true)?;
            Ok(id)
        })
    }

    /// Create a cell in `space`. Without a formula the cell takes its
    /// content from its bases.
    pub fn new_cell(&mut self, space: ObjectId, name: &str, formula: Option<Arc<dyn Formula>>) -> Result<ObjectId> {
        tracing::debug!(space = %self.display_name(space), name, "new cell");
        validate_name(name)?;
        self.require_static_space(space)?;
        self.transaction(|m| {
            let id = match m.claim_derived(space, name, MemberKind::Cell)? {
                Some(id) => id,
                None => m.create_cell(space, name, false)?,
            };
            m.make_explicit(id)?;
            if let Some(formula) = formula {
                m.install_formula(id, Some(formula), ContentSource::Own)?;
            }
            m.clear_dynamic_items(space)?;
            m.inherit_tree(id)?;
            m.traverse_from(space, true)?;
            Ok(id)
        })
    }

    pub fn set_formula(&mut self, cell: ObjectId, formula: Arc<dyn Formula>) -> Result<()> {
        tracing::debug!(cell = %self.display_name(cell), "set formula");
        let space = self.leaf_parent(cell, EntityKind::Cell)?;
        self.transaction(|m| {
            m.install_formula(cell, Some(formula), ContentSource::Own)?;
            m.make_explicit(cell)?;
            m.clear_dynamic_items(space)?;
            m.traverse_from(space, true)
        })
    }

    /// Drop the user's formula; the cell falls back to its bases.
    pub fn clear_formula(&mut self, cell: ObjectId) -> Result<()> {
        tracing::debug!(cell = %self.display_name(cell), "clear formula");
        let space = self.leaf_parent(cell, EntityKind::Cell)?;
        self.transaction(|m| {
            m.install_formula(cell, None, ContentSource::Inherited)?;
            m.clear_dynamic_items(space)?;
            m.inherit_tree(cell)?;
            m.traverse_from(space, true)
        })
    }

    /// Create a reference in a space or, with `ObjectId::ROOT`, a global one.
    pub fn new_reference(&mut self, container: ObjectId, name: &str, value: Value) -> Result<ObjectId> {
        tracing::debug!(container = %self.display_name(container), name, "new reference");
        validate_name(name)?;
        self.require_static_container(container)?;
        self.transaction(|m| {
            let id = match m.claim_derived(container, name, MemberKind::Reference)? {
                Some(id) => id,
                None => m.create_reference(
                    container,
                    name,
                    false,
                    Value::Null,
                    ContentSource::Own,
                    RefRole::Member,
                )?,
            };
            m.make_explicit(id)?;
            m.install_value(id, value, ContentSource::Own)?;
            if container != ObjectId::ROOT {
                m.clear_dynamic_items(container)?;
                m.traverse_from(container, true)?;
            }
            Ok(id)
        })
    }

    pub fn set_reference(&mut self, reference: ObjectId, value: Value) -> Result<()> {
        tracing::debug!(reference = %self.display_name(reference), "set reference");
        let container = self.leaf_parent(reference, EntityKind::Reference)?;
        self.transaction(|m| {
            m.install_value(reference, value, ContentSource::Own)?;
            m.make_explicit(reference)?;
            if container != ObjectId::ROOT {
                m.clear_dynamic_items(container)?;
                m.traverse_from(container, true)?;
            }
            Ok(())
        })
    }

    /// Parent of an editable leaf of `kind`.
    fn leaf_parent(&self, id: ObjectId, kind: EntityKind) -> Result<ObjectId> {
        let entity = self.entity(id)?;
        if entity.kind() != kind {
            return Err(self.not_a(id, if kind == EntityKind::Cell { "cell" } else { "reference" }));
        }
        if self.in_dynamic_subtree(id) {
            return Err(ModelError::structural(format!(
                "{} belongs to a dynamic space",
                self.display_name(id)
            )));
        }
        entity.parent.ok_or(ModelError::NotFound(id))
    }

    pub(crate) fn install_formula(
        &mut self,
        cell: ObjectId,
        formula: Option<Arc<dyn Formula>>,
        source: ContentSource,
    ) -> Result<()> {
        let body = self.cell_body_mut(cell)?;
        body.formula = formula;
        body.source = source;
        let node = body.node;
        self.invalidate_values([cell]);
        self.mark_dirty(node, false)
    }

    pub(crate) fn install_value(&mut self, reference: ObjectId, value: Value, source: ContentSource) -> Result<()> {
        let parent = self.entity(reference)?.parent;
        let body = self.ref_body_mut(reference)?;
        body.value = value;
        body.source = source;
        let (node, role) = (body.node, body.role);
        self.mark_dirty(node, false)?;
        if let Some(parent) = parent {
            let map = self.layer_map(Layer::new(parent, slot_for_role(role)))?.node();
            self.mark_dirty(map, false)?;
        }
        Ok(())
    }

    /// Delete an explicit member. A base that still provides the name
    /// re-creates it as a derived member.
    pub fn delete_member(&mut self, id: ObjectId) -> Result<()> {
        tracing::debug!(member = %self.display_name(id), "delete member");
        let entity = self.entity(id)?;
        if id == ObjectId::ROOT {
            return Err(ModelError::structural("the model itself cannot be deleted"));
        }
        if self.in_dynamic_subtree(id) {
            return Err(ModelError::structural(format!(
                "{} belongs to a dynamic space",
                self.display_name(id)
            )));
        }
        if entity.is_derived {
            return Err(ModelError::structural(format!(
                "{} is a derived member and cannot be deleted",
                self.display_name(id)
            )));
        }
        if entity.kind() == EntityKind::Space && self.is_base_of_external(id) {
            return Err(ModelError::structural(format!(
                "{} or one of its members is a base of other spaces",
                self.display_name(id)
            )));
        }
        let parent = entity.parent.ok_or(ModelError::NotFound(id))?;
        self.transaction(|m| {
            m.remove_subtree(id)?;
            if parent != ObjectId::ROOT {
                m.clear_dynamic_items(parent)?;
                m.inherit_tree(parent)?;
                m.traverse_from(parent, true)?;
            }
            Ok(())
        })
    }

    /// Declare `base` as the last direct base of `sub`.
    pub fn add_base(&mut self, sub: ObjectId, base: ObjectId) -> Result<()> {
        tracing::debug!(sub = %self.display_name(sub), base = %self.display_name(base), "add base");
        self.require_static_space(sub)?;
        self.require_static_space(base)?;
        self.transaction(|m| {
            m.graph.add_edge(&Arena::new(&m.entities), base, sub)?;
            m.make_explicit(sub)?;
            m.inherit_tree(sub)?;
            m.traverse_from(sub, true)
        })
    }

    pub fn remove_base(&mut self, sub: ObjectId, base: ObjectId) -> Result<()> {
        tracing::debug!(sub = %self.display_name(sub), base = %self.display_name(base), "remove base");
        self.require_static_space(sub)?;
        self.require_static_space(base)?;
        if !self.graph.has_edge(base, sub) {
            return Err(ModelError::structural(format!(
                "{} is not a direct base of {}",
                self.display_name(base),
                self.display_name(sub)
            )));
        }
        self.transaction(|m| {
            m.graph.remove_edge(base, sub);
            m.inherit_tree(sub)?;
            m.traverse_from(sub, true)
        })
    }

    /// C3 linearization of a space, starting with the space itself.
    pub fn get_mro(&self, space: ObjectId) -> Result<Vec<ObjectId>> {
        if self.entity(space)?.kind() != EntityKind::Space {
            return Err(self.not_a(space, "space"));
        }
        self.graph.get_mro(space)
    }

    /// Direct bases in declaration order.
    pub fn get_bases(&self, space: ObjectId) -> Result<Vec<ObjectId>> {
        if self.entity(space)?.kind() != EntityKind::Space {
            return Err(self.not_a(space, "space"));
        }
        Ok(self.graph.get_bases(space).to_vec())
    }

    /// Reconcile `id` and everything below it with their bases.
    pub fn inherit(&mut self, id: ObjectId) -> Result<()> {
        self.entity(id)?;
        self.transaction(|m| m.inherit_tree(id))
    }

    // ------------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------------

    /// `id` and everything it contains, dynamic items included.
    fn subtree(&self, id: ObjectId) -> Result<Vec<ObjectId>> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(v) = stack.pop() {
            let entity = self.entity(v)?;
            out.push(v);
            if let Some(c) = entity.container() {
                for slot in [Slot::Spaces, Slot::Cells, Slot::References, Slot::Arguments] {
                    let map = c.slot(slot);
                    stack.extend(map.keys().filter_map(|k| map.get(k)).copied());
                }
            }
            if let Some(s) = entity.space() {
                stack.extend(s.dynamic.values().copied());
            }
        }
        Ok(out)
    }

    /// A static space of the subtree at `id` is a base of a static space
    /// outside it.
    pub(crate) fn is_base_of_external(&self, id: ObjectId) -> bool {
        let Ok(tree) = self.subtree(id) else {
            return false;
        };
        let inside: AHashSet<ObjectId> = tree.iter().copied().collect();
        tree.iter().any(|v| {
            self.graph
                .successors(*v)
                .iter()
                .any(|s| !inside.contains(s) && !self.in_dynamic_subtree(*s))
        })
    }

    pub(crate) fn remove_subtree(&mut self, id: ObjectId) -> Result<()> {
        let doomed = self.subtree(id)?;
        let inside: AHashSet<ObjectId> = doomed.iter().copied().collect();

        // Dynamic items built on these spaces go with them.
        let mut orphans: Vec<ObjectId> = Vec::new();
        for v in &doomed {
            for s in self.graph.successors(*v) {
                if !inside.contains(s) && !orphans.contains(s) && self.entity(*s).is_ok_and(Entity::is_dynamic) {
                    orphans.push(*s);
                }
            }
        }
        for item in orphans {
            if self.contains(item) {
                self.remove_subtree(item)?;
            }
        }

        let top = self.entity(id)?;
        let name = top.name.clone();
        let parent = top.parent;
        let origin = top.space().and_then(|s| s.origin.clone());
        let slot = match &top.body {
            Body::Space(_) | Body::Root(_) => Slot::Spaces,
            Body::Cell(_) => Slot::Cells,
            Body::Reference(r) => slot_for_role(r.role),
        };
        match (origin, parent) {
            (Some(origin), _) => {
                if let Ok(body) = self.space_body_mut(origin.space) {
                    body.dynamic.remove(&origin.args);
                }
            }
            (None, Some(parent)) => self.map_remove(parent, slot, &name)?,
            (None, None) => {}
        }

        let mut callers = Vec::new();
        for v in &doomed {
            self.graph.remove_vertex(*v);
            if let Some(entity) = self.entities.get_mut(v.index()).and_then(Option::take) {
                for node in entity.nodes() {
                    self.payloads.remove(&node);
                    if self.lazy.contains(node) {
                        self.lazy.remove_node(node)?;
                    }
                }
            }
            if let Some(c) = self.dependents.remove(v) {
                callers.extend(c);
            }
        }
        self.invalidate_values(callers);
        tracing::debug!(member = %name, removed = doomed.len(), "subtree removed");
        Ok(())
    }

    /// Discard every dynamic item of `space`.
    pub(crate) fn clear_dynamic_items(&mut self, space: ObjectId) -> Result<()> {
        let items: Vec<ObjectId> = match self.entity(space)?.space() {
            Some(body) => body.dynamic.values().copied().collect(),
            None => return Ok(()),
        };
        for item in items {
            if self.contains(item) {
                self.remove_subtree(item)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Traversal host
// ============================================================================

impl Containment for Model {
    fn contains(&self, v: ObjectId) -> bool {
        Containment::contains(&self.arena(), v)
    }

    fn parent_space(&self, v: ObjectId) -> Option<ObjectId> {
        self.arena().parent_space(v)
    }

    fn child_spaces(&self, v: ObjectId) -> Vec<ObjectId> {
        self.arena().child_spaces(v)
    }
}

impl TraversalHost for Model {
    fn successors(&self, v: ObjectId) -> Vec<ObjectId> {
        self.graph.successors(v).to_vec()
    }

    fn visit(&mut self, v: ObjectId, dry_run: bool) -> Result<()> {
        if dry_run {
            self.graph.get_mro(v).map(|_| ())
        } else {
            self.inherit_tree(v)
        }
    }
}

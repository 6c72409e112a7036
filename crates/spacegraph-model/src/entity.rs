//! Arena entities.
//!
//! The [`Model`](crate::Model) owns every entity in one arena indexed by
//! [`ObjectId`]. Parent links, member maps, inheritance edges and observer
//! edges are all index-valued relations; none of them imply ownership.

use crate::formula::{Formula, ParamFormula};
use crate::value::Value;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use spacegraph_lazy::{ChainView, NodeId, OrderedMap};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Identifiers
// ============================================================================

/// Stable index of an entity in its model's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ObjectId(u32);

impl ObjectId {
    /// The model itself.
    pub const ROOT: ObjectId = ObjectId(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Member categories. Inheritance reconciles each category independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberKind {
    Space,
    Cell,
    Reference,
}

impl MemberKind {
    pub const ALL: [MemberKind; 3] = [MemberKind::Space, MemberKind::Cell, MemberKind::Reference];

    pub fn label(self) -> &'static str {
        match self {
            MemberKind::Space => "space",
            MemberKind::Cell => "cell",
            MemberKind::Reference => "reference",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Model,
    Space,
    Cell,
    Reference,
}

impl EntityKind {
    pub fn member_kind(self) -> Option<MemberKind> {
        match self {
            EntityKind::Model => None,
            EntityKind::Space => Some(MemberKind::Space),
            EntityKind::Cell => Some(MemberKind::Cell),
            EntityKind::Reference => Some(MemberKind::Reference),
        }
    }
}

/// Which map of a container a layer points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Spaces,
    Cells,
    References,
    /// Argument bindings of a dynamic space
    Arguments,
}

impl From<MemberKind> for Slot {
    fn from(kind: MemberKind) -> Self {
        match kind {
            MemberKind::Space => Slot::Spaces,
            MemberKind::Cell => Slot::Cells,
            MemberKind::Reference => Slot::References,
        }
    }
}

/// Layer key of a namespace chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Layer {
    pub owner: ObjectId,
    pub slot: Slot,
}

impl Layer {
    pub fn new(owner: ObjectId, slot: impl Into<Slot>) -> Self {
        Self {
            owner,
            slot: slot.into(),
        }
    }
}

/// What a name resolves to on a namespace's public surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Space(ObjectId),
    Cell(ObjectId),
    /// References expose the value they hold
    Value(Value),
}

/// Whether leaf content was set by the user or copied from a base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSource {
    Own,
    Inherited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefRole {
    Member,
    Argument,
}

/// Where a dynamic space came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicOrigin {
    pub space: ObjectId,
    pub args: Vec<Value>,
}

// ============================================================================
// Bodies
// ============================================================================

pub(crate) type MemberMap = OrderedMap<ObjectId, Binding>;

#[derive(Clone)]
pub(crate) struct Container {
    pub spaces: MemberMap,
    pub cells: MemberMap,
    pub refs: MemberMap,
    pub args: MemberMap,
    pub namespace: ChainView<Layer>,
}

impl Container {
    pub fn slot(&self, slot: Slot) -> &MemberMap {
        match slot {
            Slot::Spaces => &self.spaces,
            Slot::Cells => &self.cells,
            Slot::References => &self.refs,
            Slot::Arguments => &self.args,
        }
    }

    pub fn slot_mut(&mut self, slot: Slot) -> &mut MemberMap {
        match slot {
            Slot::Spaces => &mut self.spaces,
            Slot::Cells => &mut self.cells,
            Slot::References => &mut self.refs,
            Slot::Arguments => &mut self.args,
        }
    }

    pub fn nodes(&self) -> [NodeId; 5] {
        [
            self.spaces.node(),
            self.cells.node(),
            self.refs.node(),
            self.args.node(),
            self.namespace.node(),
        ]
    }

    /// Member with `name` in any member category.
    pub fn member(&self, name: &str) -> Option<(MemberKind, ObjectId)> {
        MemberKind::ALL
            .into_iter()
            .find_map(|kind| self.slot(kind.into()).get(name).map(|id| (kind, *id)))
    }
}

#[derive(Clone)]
pub(crate) struct SpaceBody {
    pub container: Container,
    pub param: Option<Arc<dyn ParamFormula>>,
    pub param_source: ContentSource,
    pub dynamic: AHashMap<Vec<Value>, ObjectId>,
    pub origin: Option<DynamicOrigin>,
}

#[derive(Clone)]
pub(crate) struct CellBody {
    pub node: NodeId,
    pub formula: Option<Arc<dyn Formula>>,
    pub source: ContentSource,
    pub values: AHashMap<Vec<Value>, Value>,
    pub lexdeps: Vec<NodeId>,
}

#[derive(Clone)]
pub(crate) struct RefBody {
    pub node: NodeId,
    pub value: Value,
    pub source: ContentSource,
    pub role: RefRole,
}

#[derive(Clone)]
pub(crate) enum Body {
    Root(Container),
    Space(SpaceBody),
    Cell(CellBody),
    Reference(RefBody),
}

#[derive(Clone)]
pub(crate) struct Entity {
    pub name: String,
    pub parent: Option<ObjectId>,
    pub is_derived: bool,
    pub body: Body,
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self.body {
            Body::Root(_) => EntityKind::Model,
            Body::Space(_) => EntityKind::Space,
            Body::Cell(_) => EntityKind::Cell,
            Body::Reference(_) => EntityKind::Reference,
        }
    }

    pub fn container(&self) -> Option<&Container> {
        match &self.body {
            Body::Root(c) => Some(c),
            Body::Space(s) => Some(&s.container),
            _ => None,
        }
    }

    pub fn container_mut(&mut self) -> Option<&mut Container> {
        match &mut self.body {
            Body::Root(c) => Some(c),
            Body::Space(s) => Some(&mut s.container),
            _ => None,
        }
    }

    pub fn space(&self) -> Option<&SpaceBody> {
        match &self.body {
            Body::Space(s) => Some(s),
            _ => None,
        }
    }

    pub fn space_mut(&mut self) -> Option<&mut SpaceBody> {
        match &mut self.body {
            Body::Space(s) => Some(s),
            _ => None,
        }
    }

    pub fn cell(&self) -> Option<&CellBody> {
        match &self.body {
            Body::Cell(c) => Some(c),
            _ => None,
        }
    }

    pub fn cell_mut(&mut self) -> Option<&mut CellBody> {
        match &mut self.body {
            Body::Cell(c) => Some(c),
            _ => None,
        }
    }

    pub fn reference(&self) -> Option<&RefBody> {
        match &self.body {
            Body::Reference(r) => Some(r),
            _ => None,
        }
    }

    pub fn reference_mut(&mut self) -> Option<&mut RefBody> {
        match &mut self.body {
            Body::Reference(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.space().is_some_and(|s| s.origin.is_some())
    }

    pub fn is_argument(&self) -> bool {
        self.reference().is_some_and(|r| r.role == RefRole::Argument)
    }

    /// Engine nodes owned by this entity.
    pub fn nodes(&self) -> Vec<NodeId> {
        match &self.body {
            Body::Root(c) => c.nodes().to_vec(),
            Body::Space(s) => s.container.nodes().to_vec(),
            Body::Cell(c) => vec![c.node],
            Body::Reference(r) => vec![r.node],
        }
    }
}

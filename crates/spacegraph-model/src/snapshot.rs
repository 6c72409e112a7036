//! Model snapshots.
//!
//! A snapshot records the static part of a model: every entity with its
//! explicit/derived flag and content source, formula and parameter source
//! text, reference values, member order, and the inheritance edges. Dynamic
//! items are not recorded; they are rebuilt on demand after a restore.
//! Formulas are stored as source text and recompiled through a
//! [`FormulaCompiler`], so a registry hands back the same formula object to
//! a member and its bases.

use crate::config::ModelConfig;
use crate::entity::{
    Body, CellBody, Container, ContentSource, Entity, EntityKind, ObjectId, RefBody, RefRole, Slot,
    SpaceBody,
};
use crate::error::{ModelError, Result};
use crate::formula::FormulaCompiler;
use crate::model::{ordered_entries, validate_name, Model, Payload};
use crate::value::Value;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use spacegraph_lazy::{ChainView, OrderedMap};
use std::io::{Read, Write};
use std::path::Path;

pub const SNAPSHOT_FORMAT: u32 = 1;

/// Restored ids must stay below `max(MIN_ID_SPAN, ID_SPREAD * entity count)`.
/// Deleted members and dynamic items leave gaps in the id space, and the
/// arena is sized by the largest id.
const MIN_ID_SPAN: usize = 1 << 16;
const ID_SPREAD: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub format: u32,
    pub name: String,
    #[serde(default)]
    pub config: ModelConfig,
    /// Parents before children, members in their stable order.
    pub entities: Vec<EntitySnapshot>,
    #[serde(default)]
    pub edges: Vec<EdgeSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: ObjectId,
    pub name: String,
    pub parent: Option<ObjectId>,
    pub kind: EntityKind,
    pub is_derived: bool,
    pub source: ContentSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Direct bases of one space, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSnapshot {
    pub sub: ObjectId,
    pub bases: Vec<ObjectId>,
}

fn snapshot_err(msg: impl Into<String>) -> ModelError {
    ModelError::Snapshot(msg.into())
}

// ============================================================================
// Capture
// ============================================================================

impl Model {
    pub fn snapshot(&self) -> Result<ModelSnapshot> {
        let mut entities = Vec::new();
        let mut stack = vec![ObjectId::ROOT];
        while let Some(id) = stack.pop() {
            let entity = self.entity(id)?;
            entities.push(self.entity_snapshot(id, entity));
            if let Some(c) = entity.container() {
                let mut children: Vec<ObjectId> = Vec::new();
                for slot in [Slot::Spaces, Slot::Cells, Slot::References] {
                    children.extend(ordered_entries(c.slot(slot)).into_iter().map(|(_, id)| id));
                }
                stack.extend(children.into_iter().rev());
            }
        }

        let edges = self
            .graph
            .edges()
            .into_iter()
            .filter(|(sub, _)| !self.in_dynamic_subtree(*sub))
            .map(|(sub, bases)| EdgeSnapshot { sub, bases })
            .collect();

        Ok(ModelSnapshot {
            format: SNAPSHOT_FORMAT,
            name: self.name().to_string(),
            config: self.config.clone(),
            entities,
            edges,
        })
    }

    fn entity_snapshot(&self, id: ObjectId, entity: &Entity) -> EntitySnapshot {
        let mut snap = EntitySnapshot {
            id,
            name: entity.name.clone(),
            parent: entity.parent,
            kind: entity.kind(),
            is_derived: entity.is_derived,
            source: ContentSource::Own,
            formula: None,
            param: None,
            value: None,
        };
        match &entity.body {
            Body::Root(_) => {}
            Body::Space(s) => {
                snap.source = s.param_source;
                snap.param = s.param.as_ref().map(|p| p.source().to_string());
            }
            Body::Cell(c) => {
                snap.source = c.source;
                snap.formula = c.formula.as_ref().map(|f| f.source().to_string());
            }
            Body::Reference(r) => {
                snap.source = r.source;
                snap.value = Some(r.value.clone());
            }
        }
        snap
    }

    // ------------------------------------------------------------------------
    // Restore
    // ------------------------------------------------------------------------

    /// Rebuild a model from `snapshot`. Ids are preserved and every engine
    /// node starts dirty, so orders and namespaces rebuild on first read.
    pub fn restore(snapshot: &ModelSnapshot, compiler: &dyn FormulaCompiler) -> Result<Model> {
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(snapshot_err(format!(
                "unsupported snapshot format {}",
                snapshot.format
            )));
        }
        let root = snapshot
            .entities
            .first()
            .filter(|e| e.id == ObjectId::ROOT && e.kind == EntityKind::Model)
            .ok_or_else(|| snapshot_err("the first entity must be the model"))?;

        let span = MIN_ID_SPAN.max(snapshot.entities.len().saturating_mul(ID_SPREAD));
        let size = snapshot
            .entities
            .iter()
            .map(|e| e.id.index() + 1)
            .max()
            .unwrap_or(1);
        if size > span {
            return Err(snapshot_err(format!(
                "id {} is out of range for {} entities",
                size - 1,
                snapshot.entities.len()
            )));
        }
        let mut model = Model::empty(snapshot.config.clone());
        model.entities = vec![None; size];

        // Children per container and slot, in snapshot order.
        let mut children: AHashMap<ObjectId, AHashMap<Slot, Vec<(String, ObjectId)>>> = AHashMap::new();
        let mut kinds: AHashMap<ObjectId, EntityKind> = AHashMap::new();
        for e in &snapshot.entities {
            if kinds.insert(e.id, e.kind).is_some() {
                return Err(snapshot_err(format!("duplicate id {}", e.id)));
            }
            if e.id == ObjectId::ROOT {
                continue;
            }
            validate_name(&e.name)?;
            let parent = e
                .parent
                .ok_or_else(|| snapshot_err(format!("{} has no parent", e.name)))?;
            match kinds.get(&parent) {
                Some(EntityKind::Model) | Some(EntityKind::Space) => {}
                _ => {
                    return Err(snapshot_err(format!(
                        "{} must follow its parent {parent}",
                        e.name
                    )))
                }
            }
            let slot = match e.kind {
                EntityKind::Space => Slot::Spaces,
                EntityKind::Cell if parent == ObjectId::ROOT => {
                    return Err(snapshot_err(format!("cell {} cannot belong to the model", e.name)))
                }
                EntityKind::Cell => Slot::Cells,
                EntityKind::Reference => Slot::References,
                EntityKind::Model => return Err(snapshot_err("nested model entity")),
            };
            let siblings = children.entry(parent).or_default();
            let clash = siblings.values().flatten().any(|(name, _)| *name == e.name);
            if clash {
                return Err(snapshot_err(format!("duplicate member {} in {parent}", e.name)));
            }
            siblings.entry(slot).or_default().push((e.name.clone(), e.id));
        }

        for e in &snapshot.entities {
            let label = format!("{}#{}", e.name, e.id.raw());
            let body = match e.kind {
                EntityKind::Model | EntityKind::Space => {
                    let mut slots = children.remove(&e.id).unwrap_or_default();
                    let mut map = |slot: Slot, suffix: &str| {
                        OrderedMap::with_entries(
                            &mut model.lazy,
                            format!("{label}.{suffix}"),
                            slots.remove(&slot).unwrap_or_default(),
                        )
                    };
                    let spaces = map(Slot::Spaces, "spaces");
                    let cells = map(Slot::Cells, "cells");
                    let refs = map(Slot::References, "refs");
                    let args = map(Slot::Arguments, "args");
                    let container = Container {
                        spaces,
                        cells,
                        refs,
                        args,
                        namespace: ChainView::empty(&mut model.lazy, format!("{label}.namespace")),
                    };
                    model.register_container(e.id, &container);
                    if e.kind == EntityKind::Model {
                        Body::Root(container)
                    } else {
                        let param = match &e.param {
                            Some(src) => Some(compiler.compile_param(src)?),
                            None => None,
                        };
                        Body::Space(SpaceBody {
                            container,
                            param,
                            param_source: e.source,
                            dynamic: AHashMap::new(),
                            origin: None,
                        })
                    }
                }
                EntityKind::Cell => {
                    let node = model.lazy.add_node(label);
                    model.payloads.insert(node, Payload::Cell(e.id));
                    let formula = match &e.formula {
                        Some(src) => Some(compiler.compile_formula(src)?),
                        None => None,
                    };
                    Body::Cell(CellBody {
                        node,
                        source: e.source,
                        formula,
                        values: AHashMap::new(),
                        lexdeps: Vec::new(),
                    })
                }
                EntityKind::Reference => {
                    let node = model.lazy.add_node(label);
                    model.payloads.insert(node, Payload::Reference(e.id));
                    Body::Reference(RefBody {
                        node,
                        value: e.value.clone().unwrap_or(Value::Null),
                        source: e.source,
                        role: RefRole::Member,
                    })
                }
            };
            model.entities[e.id.index()] = Some(Entity {
                name: if e.id == ObjectId::ROOT { root.name.clone() } else { e.name.clone() },
                parent: e.parent,
                is_derived: e.is_derived,
                body,
            });
        }

        for e in &snapshot.entities {
            match e.kind {
                EntityKind::Space => model.install_namespace(e.id)?,
                EntityKind::Cell => {
                    let parent = e.parent.ok_or(ModelError::NotFound(e.id))?;
                    let namespace = model.container(parent)?.namespace.node();
                    let node = model.node_of(e.id)?;
                    model.lazy.add_observer(namespace, node)?;
                }
                _ => {}
            }
        }

        for edge in &snapshot.edges {
            for base in &edge.bases {
                let valid = |id: ObjectId| kinds.get(&id) == Some(&EntityKind::Space);
                if !valid(*base) || !valid(edge.sub) {
                    return Err(snapshot_err(format!("edge {base} -> {} joins non-spaces", edge.sub)));
                }
                model.graph.insert_edge(*base, edge.sub);
            }
        }
        if !model.graph.is_acyclic() {
            return Err(snapshot_err("inheritance edges form a cycle"));
        }
        for e in snapshot.entities.iter().filter(|e| e.kind == EntityKind::Space) {
            model.graph.get_mro(e.id)?;
        }
        tracing::info!(
            model = %model.name(),
            entities = model.len(),
            edges = model.graph.edge_count(),
            "model restored"
        );
        Ok(model)
    }

    // ------------------------------------------------------------------------
    // Encodings
    // ------------------------------------------------------------------------

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.snapshot()?).map_err(|e| snapshot_err(e.to_string()))
    }

    pub fn from_json(text: &str, compiler: &dyn FormulaCompiler) -> Result<Model> {
        let snapshot: ModelSnapshot = serde_json::from_str(text).map_err(|e| snapshot_err(e.to_string()))?;
        Model::restore(&snapshot, compiler)
    }

    pub fn write_cbor<W: Write>(&self, writer: W) -> Result<()> {
        ciborium::into_writer(&self.snapshot()?, writer).map_err(|e| snapshot_err(e.to_string()))
    }

    pub fn read_cbor<R: Read>(reader: R, compiler: &dyn FormulaCompiler) -> Result<Model> {
        let snapshot: ModelSnapshot = ciborium::from_reader(reader).map_err(|e| snapshot_err(e.to_string()))?;
        Model::restore(&snapshot, compiler)
    }

    /// Write a JSON snapshot to `path`.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = self.to_json()?;
        std::fs::write(path, text).map_err(|e| snapshot_err(format!("{}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "snapshot written");
        Ok(())
    }

    pub fn read_from(path: impl AsRef<Path>, compiler: &dyn FormulaCompiler) -> Result<Model> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| snapshot_err(format!("{}: {e}", path.display())))?;
        Model::from_json(&text, compiler)
    }
}

//! Ordered mapping with change tracking.
//!
//! Writes go through [`OrderedMap::set`] / [`OrderedMap::remove`], which mark
//! the map's node dirty. The owner's recomputation step calls
//! [`OrderedMap::rebuild_order`] and then [`OrderedMap::install_surface`].

use crate::engine::{LazyError, LazyGraph, NodeId};
use ahash::{AHashMap, AHashSet};

/// Stable diff of a key order against the current key set.
///
/// Keys present before and after keep their position, removed keys are
/// dropped, new keys are appended in lexicographic order.
pub fn stable_order<'a, I>(previous: &mut Vec<String>, current: I)
where
    I: IntoIterator<Item = &'a str>,
{
    let current: AHashSet<&str> = current.into_iter().collect();
    previous.retain(|k| current.contains(k.as_str()));
    let mut added: Vec<String> = {
        let kept: AHashSet<&str> = previous.iter().map(String::as_str).collect();
        current
            .iter()
            .filter(|k| !kept.contains(**k))
            .map(|k| k.to_string())
            .collect()
    };
    added.sort_unstable();
    previous.extend(added);
}

/// A lazily ordered map whose public surface holds `W` wrappers of `V`.
#[derive(Debug, Clone)]
pub struct OrderedMap<V, W = V> {
    node: NodeId,
    data: AHashMap<String, V>,
    order: Vec<String>,
    surface: AHashMap<String, W>,
}

impl<V, W> OrderedMap<V, W> {
    pub fn new(graph: &mut LazyGraph, label: impl Into<String>) -> Self {
        Self {
            node: graph.add_node(label),
            data: AHashMap::new(),
            order: Vec::new(),
            surface: AHashMap::new(),
        }
    }

    /// Map whose last known order is the order of `entries`. Used when
    /// restoring from a snapshot.
    pub fn with_entries(
        graph: &mut LazyGraph,
        label: impl Into<String>,
        entries: impl IntoIterator<Item = (String, V)>,
    ) -> Self {
        let mut map = Self::new(graph, label);
        for (k, v) in entries {
            map.order.push(k.clone());
            map.data.insert(k, v);
        }
        map
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn get(&self, name: &str) -> Option<&V> {
        self.data.get(name)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Keys of the backing map in arbitrary order (always current).
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    /// Key order as of the last rebuild.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Entries in rebuilt order. Keys written since the last rebuild are not
    /// visited until the next one.
    pub fn iter_ordered(&self) -> impl Iterator<Item = (&str, &V)> {
        self.order
            .iter()
            .filter_map(|k| self.data.get(k).map(|v| (k.as_str(), v)))
    }

    pub fn surface(&self, name: &str) -> Option<&W> {
        self.surface.get(name)
    }

    pub fn set(
        &mut self,
        graph: &mut LazyGraph,
        name: impl Into<String>,
        value: V,
        skip_self: bool,
    ) -> Result<(Option<V>, Vec<NodeId>), LazyError> {
        let previous = self.data.insert(name.into(), value);
        let flagged = graph.mark_dirty(self.node, skip_self)?;
        Ok((previous, flagged))
    }

    pub fn remove(
        &mut self,
        graph: &mut LazyGraph,
        name: &str,
        skip_self: bool,
    ) -> Result<(Option<V>, Vec<NodeId>), LazyError> {
        let previous = self.data.remove(name);
        let flagged = if previous.is_some() {
            graph.mark_dirty(self.node, skip_self)?
        } else {
            Vec::new()
        };
        Ok((previous, flagged))
    }

    /// First half of the recomputation step.
    pub fn rebuild_order(&mut self) {
        let data = &self.data;
        stable_order(&mut self.order, data.keys().map(String::as_str));
    }

    /// Second half of the recomputation step: replace the surface projection.
    pub fn install_surface(&mut self, entries: impl IntoIterator<Item = (String, W)>) {
        self.surface.clear();
        self.surface.extend(entries);
    }
}

impl<V: Clone> OrderedMap<V, V> {
    /// Recompute with the identity surface.
    pub fn rebuild(&mut self) {
        self.rebuild_order();
        let entries: Vec<(String, V)> = self
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.install_surface(entries);
    }
}

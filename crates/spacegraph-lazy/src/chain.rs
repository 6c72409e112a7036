//! Chain view: read-only ordered union of several [`OrderedMap`]s.
//!
//! Layers are addressed by keys of type `L` and resolved through a
//! [`LayerSource`] at access time. Earlier layers shadow later ones. Lookups
//! read through to the owning layer and never copy data; only the flattened
//! key order is cached, rebuilt when the chain's node is refreshed.

use crate::engine::{LazyError, LazyGraph, NodeId};
use crate::ordered::OrderedMap;
use ahash::AHashSet;

/// Resolves layer keys to the maps they name.
pub trait LayerSource<L> {
    type Value: 'static;
    type Surface: 'static;

    fn layer(&self, key: &L) -> Option<&OrderedMap<Self::Value, Self::Surface>>;
}

#[derive(Debug, Clone)]
pub struct ChainView<L> {
    node: NodeId,
    layers: Vec<L>,
    order: Vec<String>,
}

impl<L: Clone + PartialEq> ChainView<L> {
    /// Create a chain that observes every resolvable layer.
    pub fn new<S>(
        graph: &mut LazyGraph,
        label: impl Into<String>,
        layers: Vec<L>,
        src: &S,
    ) -> Result<Self, LazyError>
    where
        S: LayerSource<L>,
    {
        let mut chain = Self::empty(graph, label);
        for key in &layers {
            if let Some(map) = src.layer(key) {
                graph.add_observer(map.node(), chain.node)?;
            }
        }
        chain.layers = layers;
        Ok(chain)
    }

    /// Chain without layers; attach them later with [`ChainView::set_layers`].
    pub fn empty(graph: &mut LazyGraph, label: impl Into<String>) -> Self {
        Self {
            node: graph.add_node(label),
            layers: Vec::new(),
            order: Vec::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn layers(&self) -> &[L] {
        &self.layers
    }

    /// Replace the layer list, moving observer edges accordingly.
    pub fn set_layers<S>(
        &mut self,
        graph: &mut LazyGraph,
        layers: Vec<L>,
        src: &S,
    ) -> Result<(), LazyError>
    where
        S: LayerSource<L>,
    {
        for key in &self.layers {
            if layers.contains(key) {
                continue;
            }
            if let Some(map) = src.layer(key) {
                graph.remove_observer(map.node(), self.node)?;
            }
        }
        for key in &layers {
            if let Some(map) = src.layer(key) {
                graph.add_observer(map.node(), self.node)?;
            }
        }
        self.layers = layers;
        graph.mark_dirty(self.node, false)?;
        Ok(())
    }

    /// First-match-wins lookup.
    pub fn get<'s, S>(&self, src: &'s S, name: &str) -> Option<&'s S::Value>
    where
        S: LayerSource<L>,
    {
        self.layers
            .iter()
            .filter_map(|key| src.layer(key))
            .find_map(|map| map.get(name))
    }

    /// First-match-wins lookup on the layers' public surfaces.
    pub fn surface<'s, S>(&self, src: &'s S, name: &str) -> Option<&'s S::Surface>
    where
        S: LayerSource<L>,
    {
        self.layers
            .iter()
            .filter_map(|key| src.layer(key))
            .find(|map| map.contains_key(name))
            .and_then(|map| map.surface(name))
    }

    pub fn contains_key<S>(&self, src: &S, name: &str) -> bool
    where
        S: LayerSource<L>,
    {
        self.get(src, name).is_some()
    }

    /// Flattened order as of the last rebuild.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Union of the layers' names in layer order, each layer in its own order.
    pub fn collect_names<S>(&self, src: &S) -> Vec<String>
    where
        S: LayerSource<L>,
    {
        Self::union(src, &self.layers)
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }

    /// Recomputation step: install the flattened order. Names that stay
    /// keep their place; new names follow in layer order.
    pub fn rebuild(&mut self, names: Vec<String>) {
        let kept: AHashSet<String> = {
            let current: AHashSet<&str> = names.iter().map(String::as_str).collect();
            self.order.retain(|k| current.contains(k.as_str()));
            self.order.iter().cloned().collect()
        };
        self.order.extend(names.into_iter().filter(|n| !kept.contains(n)));
    }

    /// First-wins union of `layers` without an engine node.
    pub fn union<'s, S>(src: &'s S, layers: &[L]) -> Vec<(String, &'s S::Value)>
    where
        S: LayerSource<L>,
    {
        let mut seen: AHashSet<&str> = AHashSet::new();
        let mut out = Vec::new();
        for map in layers.iter().filter_map(|key| src.layer(key)) {
            for (name, value) in map.iter_ordered() {
                if seen.insert(name) {
                    out.push((name.to_string(), value));
                }
            }
        }
        out
    }
}

//! Dirty-flag observer engine.
//!
//! Every stateful node owned by a higher layer registers here and receives a
//! [`NodeId`]. The engine only keeps bookkeeping:
//!
//! - a dirty flag,
//! - the nodes it **observes** (upstream sources),
//! - its **observers** (downstream dependents),
//! - a recomputation counter.
//!
//! Payloads live with their owners. Marking is push-based (`mark_dirty`
//! walks downstream), recomputation is pull-based (`plan_refresh` walks
//! upstream and yields the dirty nodes in the order they must recompute).
//! Both walks are iterative and bounded by `max_depth`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default bound on the upstream nesting explored by one refresh.
pub const DEFAULT_MAX_DEPTH: usize = 1000;

/// Handle to a node registered in a [`LazyGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum LazyError {
    #[error("unknown lazy node {0}")]
    UnknownNode(NodeId),

    #[error("observing {source_node} from {observer} would make the observer graph cyclic")]
    ObserverCycle { source_node: NodeId, observer: NodeId },

    #[error("lazy refresh exceeded the depth limit of {limit}")]
    DepthExceeded { limit: usize },
}

#[derive(Debug, Clone, Default)]
struct NodeState {
    label: String,
    dirty: bool,
    observers: Vec<NodeId>,
    observing: Vec<NodeId>,
    recomputes: u64,
}

/// Arena of observer nodes.
#[derive(Debug, Clone)]
pub struct LazyGraph {
    slots: Vec<Option<NodeState>>,
    free: Vec<u32>,
    max_depth: usize,
}

impl Default for LazyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl LazyGraph {
    pub fn new() -> Self {
        Self::with_max_depth(DEFAULT_MAX_DEPTH)
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            max_depth,
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth;
    }

    /// Register a node. New nodes are dirty: they have never seen their sources.
    pub fn add_node(&mut self, label: impl Into<String>) -> NodeId {
        let state = NodeState {
            label: label.into(),
            dirty: true,
            ..NodeState::default()
        };
        match self.free.pop() {
            Some(raw) => {
                self.slots[raw as usize] = Some(state);
                NodeId(raw)
            }
            None => {
                self.slots.push(Some(state));
                NodeId((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Detach a node from every edge and free its slot.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), LazyError> {
        let state = self
            .slots
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or(LazyError::UnknownNode(id))?;
        for source in state.observing {
            if let Some(s) = self.state_mut(source) {
                s.observers.retain(|o| *o != id);
            }
        }
        for observer in state.observers {
            if let Some(s) = self.state_mut(observer) {
                s.observing.retain(|o| *o != id);
            }
        }
        self.free.push(id.0);
        Ok(())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.state(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn label(&self, id: NodeId) -> Option<&str> {
        self.state(id).map(|s| s.label.as_str())
    }

    pub fn is_dirty(&self, id: NodeId) -> bool {
        self.state(id).is_some_and(|s| s.dirty)
    }

    pub fn observers(&self, id: NodeId) -> &[NodeId] {
        self.state(id).map(|s| s.observers.as_slice()).unwrap_or(&[])
    }

    pub fn observing(&self, id: NodeId) -> &[NodeId] {
        self.state(id).map(|s| s.observing.as_slice()).unwrap_or(&[])
    }

    /// Number of times `complete` ran for this node.
    pub fn recompute_count(&self, id: NodeId) -> u64 {
        self.state(id).map(|s| s.recomputes).unwrap_or(0)
    }

    // ------------------------------------------------------------------------
    // Edges
    // ------------------------------------------------------------------------

    /// Make `observer` depend on `source`. The observer is dirtied because it
    /// has never seen the source's current data. Returns `false` when the
    /// edge already existed.
    pub fn add_observer(&mut self, source: NodeId, observer: NodeId) -> Result<bool, LazyError> {
        self.require(source)?;
        self.require(observer)?;
        if self.observers(source).contains(&observer) {
            return Ok(false);
        }
        if source == observer || self.reaches_downstream(observer, source) {
            return Err(LazyError::ObserverCycle {
                source_node: source,
                observer,
            });
        }
        if let Some(s) = self.state_mut(source) {
            s.observers.push(observer);
        }
        if let Some(s) = self.state_mut(observer) {
            s.observing.push(source);
        }
        self.mark_dirty(observer, false)?;
        Ok(true)
    }

    pub fn remove_observer(&mut self, source: NodeId, observer: NodeId) -> Result<bool, LazyError> {
        self.require(source)?;
        self.require(observer)?;
        let mut removed = false;
        if let Some(s) = self.state_mut(source) {
            let before = s.observers.len();
            s.observers.retain(|o| *o != observer);
            removed = s.observers.len() != before;
        }
        if let Some(s) = self.state_mut(observer) {
            s.observing.retain(|o| *o != source);
        }
        Ok(removed)
    }

    fn reaches_downstream(&self, from: NodeId, target: NodeId) -> bool {
        let mut seen = ahash::AHashSet::new();
        let mut stack = vec![from];
        while let Some(n) = stack.pop() {
            if n == target {
                return true;
            }
            if seen.insert(n) {
                stack.extend(self.observers(n).iter().copied());
            }
        }
        false
    }

    // ------------------------------------------------------------------------
    // Push: dirty marking
    // ------------------------------------------------------------------------

    /// Flag `id` (unless `skip_self`) and every observer reachable from it
    /// that is not dirty yet. Observers that are already dirty are not
    /// descended into. Returns the nodes that were newly flagged.
    pub fn mark_dirty(&mut self, id: NodeId, skip_self: bool) -> Result<Vec<NodeId>, LazyError> {
        self.require(id)?;
        let mut flagged = Vec::new();
        if !skip_self {
            if let Some(s) = self.state_mut(id) {
                if !s.dirty {
                    s.dirty = true;
                    flagged.push(id);
                }
            }
        }

        let mut stack: Vec<NodeId> = self
            .observers(id)
            .iter()
            .rev()
            .copied()
            .filter(|o| !self.is_dirty(*o))
            .collect();
        while let Some(n) = stack.pop() {
            let Some(state) = self.state_mut(n) else {
                continue;
            };
            if state.dirty {
                continue;
            }
            state.dirty = true;
            flagged.push(n);
            for o in self.observers(n).iter().rev() {
                if !self.is_dirty(*o) {
                    stack.push(*o);
                }
            }
        }
        tracing::trace!(node = %id, skip_self, flagged = flagged.len(), "mark dirty");
        Ok(flagged)
    }

    // ------------------------------------------------------------------------
    // Pull: refresh
    // ------------------------------------------------------------------------

    /// Dirty nodes that must recompute before `id` can be read, upstream
    /// first and `id` last. Empty when `id` is clean. Flags are left alone:
    /// the caller recomputes each node in order and then calls [`complete`].
    ///
    /// [`complete`]: LazyGraph::complete
    pub fn plan_refresh(&self, id: NodeId) -> Result<Vec<NodeId>, LazyError> {
        self.require(id)?;
        if !self.is_dirty(id) {
            return Ok(Vec::new());
        }

        let mut plan = Vec::new();
        let mut planned = ahash::AHashSet::new();
        let mut on_stack = ahash::AHashSet::new();
        // (node, index of the next upstream source to visit)
        let mut stack: Vec<(NodeId, usize)> = vec![(id, 0)];
        on_stack.insert(id);

        while let Some((node, next)) = stack.last().copied() {
            let sources = self.observing(node);
            if next < sources.len() {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let source = sources[next];
                if !self.is_dirty(source) || planned.contains(&source) {
                    continue;
                }
                if on_stack.contains(&source) {
                    return Err(LazyError::ObserverCycle {
                        source_node: source,
                        observer: node,
                    });
                }
                if stack.len() >= self.max_depth {
                    return Err(LazyError::DepthExceeded {
                        limit: self.max_depth,
                    });
                }
                on_stack.insert(source);
                stack.push((source, 0));
            } else {
                stack.pop();
                on_stack.remove(&node);
                planned.insert(node);
                plan.push(node);
            }
        }
        Ok(plan)
    }

    /// Clear the dirty flag after the owner recomputed the node's payload.
    pub fn complete(&mut self, id: NodeId) -> Result<(), LazyError> {
        let state = self.state_mut(id).ok_or(LazyError::UnknownNode(id))?;
        if state.dirty {
            state.dirty = false;
            state.recomputes += 1;
        }
        Ok(())
    }

    /// Bring `id` up to date, calling `recompute` once per dirty node in
    /// upstream-first order. Returns how many nodes were recomputed. A failing
    /// recompute leaves that node and everything after it dirty.
    pub fn refresh_with<E, F>(&mut self, id: NodeId, mut recompute: F) -> Result<usize, E>
    where
        E: From<LazyError>,
        F: FnMut(NodeId) -> Result<(), E>,
    {
        let plan = self.plan_refresh(id)?;
        for node in &plan {
            recompute(*node)?;
            self.complete(*node)?;
        }
        Ok(plan.len())
    }

    fn require(&self, id: NodeId) -> Result<(), LazyError> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(LazyError::UnknownNode(id))
        }
    }

    fn state(&self, id: NodeId) -> Option<&NodeState> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    fn state_mut(&mut self, id: NodeId) -> Option<&mut NodeState> {
        self.slots.get_mut(id.0 as usize).and_then(Option::as_mut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean(graph: &mut LazyGraph, id: NodeId) {
        let plan = graph.plan_refresh(id).unwrap();
        for n in plan {
            graph.complete(n).unwrap();
        }
    }

    #[test]
    fn test_new_nodes_start_dirty() {
        let mut graph = LazyGraph::new();
        let a = graph.add_node("a");
        assert!(graph.is_dirty(a));
        clean(&mut graph, a);
        assert!(!graph.is_dirty(a));
        assert_eq!(graph.recompute_count(a), 1);
    }

    #[test]
    fn test_add_observer_dirties_observer() {
        let mut graph = LazyGraph::new();
        let src = graph.add_node("src");
        let obs = graph.add_node("obs");
        clean(&mut graph, src);
        clean(&mut graph, obs);

        assert!(graph.add_observer(src, obs).unwrap());
        assert!(graph.is_dirty(obs));
        assert!(!graph.is_dirty(src));
        assert!(!graph.add_observer(src, obs).unwrap(), "duplicate edge is a no-op");
        assert_eq!(graph.observers(src), &[obs]);
        assert_eq!(graph.observing(obs), &[src]);
    }

    #[test]
    fn test_mark_dirty_skip_self_only_forwards() {
        let mut graph = LazyGraph::new();
        let src = graph.add_node("src");
        let obs = graph.add_node("obs");
        graph.add_observer(src, obs).unwrap();
        clean(&mut graph, obs);

        let flagged = graph.mark_dirty(src, true).unwrap();
        assert!(!graph.is_dirty(src));
        assert!(graph.is_dirty(obs));
        assert_eq!(flagged, vec![obs]);
    }

    #[test]
    fn test_mark_dirty_is_idempotent() {
        let mut graph = LazyGraph::new();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        let c = graph.add_node("c");
        graph.add_observer(a, b).unwrap();
        graph.add_observer(b, c).unwrap();
        clean(&mut graph, c);

        assert_eq!(graph.mark_dirty(a, false).unwrap().len(), 3);
        assert!(graph.mark_dirty(a, false).unwrap().is_empty());
        assert!(graph.mark_dirty(b, false).unwrap().is_empty());
        assert!(graph.is_dirty(a) && graph.is_dirty(b) && graph.is_dirty(c));
    }

    #[test]
    fn test_plan_refresh_is_upstream_first_and_deduplicated() {
        // a -> b -> d, a -> c -> d (diamond)
        let mut graph = LazyGraph::new();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        let c = graph.add_node("c");
        let d = graph.add_node("d");
        graph.add_observer(a, b).unwrap();
        graph.add_observer(a, c).unwrap();
        graph.add_observer(b, d).unwrap();
        graph.add_observer(c, d).unwrap();

        let plan = graph.plan_refresh(d).unwrap();
        assert_eq!(plan.len(), 4);
        assert_eq!(plan[0], a);
        assert_eq!(*plan.last().unwrap(), d);
        let pos = |n| plan.iter().position(|p| *p == n).unwrap();
        assert!(pos(b) < pos(d));
        assert!(pos(c) < pos(d));
    }

    #[test]
    fn test_refresh_with_recomputes_each_dirty_node_once() {
        let mut graph = LazyGraph::new();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        graph.add_observer(a, b).unwrap();
        clean(&mut graph, b);

        for _ in 0..5 {
            graph.mark_dirty(a, false).unwrap();
        }
        let mut seen = Vec::new();
        let n = graph
            .refresh_with::<LazyError, _>(b, |node| {
                seen.push(node);
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(seen, vec![a, b]);
        assert_eq!(graph.recompute_count(a), 2);
        assert_eq!(graph.recompute_count(b), 2);

        // Clean node: nothing to do.
        let n = graph
            .refresh_with::<LazyError, _>(b, |_| Ok(()))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_failed_recompute_leaves_node_dirty() {
        let mut graph = LazyGraph::new();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        graph.add_observer(a, b).unwrap();

        let result = graph.refresh_with::<LazyError, _>(b, |node| {
            if node == b {
                Err(LazyError::UnknownNode(node))
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());
        assert!(!graph.is_dirty(a));
        assert!(graph.is_dirty(b));
    }

    #[test]
    fn test_observer_cycles_are_rejected() {
        let mut graph = LazyGraph::new();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        let c = graph.add_node("c");
        graph.add_observer(a, b).unwrap();
        graph.add_observer(b, c).unwrap();

        assert!(matches!(
            graph.add_observer(c, a),
            Err(LazyError::ObserverCycle { .. })
        ));
        assert!(matches!(
            graph.add_observer(a, a),
            Err(LazyError::ObserverCycle { .. })
        ));
    }

    #[test]
    fn test_refresh_depth_limit() {
        let mut graph = LazyGraph::with_max_depth(3);
        let nodes: Vec<NodeId> = (0..6).map(|i| graph.add_node(format!("n{i}"))).collect();
        for pair in nodes.windows(2) {
            graph.add_observer(pair[0], pair[1]).unwrap();
        }
        assert_eq!(
            graph.plan_refresh(nodes[5]),
            Err(LazyError::DepthExceeded { limit: 3 })
        );
    }

    #[test]
    fn test_remove_node_detaches_edges_and_reuses_slot() {
        let mut graph = LazyGraph::new();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        let c = graph.add_node("c");
        graph.add_observer(a, b).unwrap();
        graph.add_observer(b, c).unwrap();

        graph.remove_node(b).unwrap();
        assert!(!graph.contains(b));
        assert!(graph.observers(a).is_empty());
        assert!(graph.observing(c).is_empty());
        assert_eq!(graph.remove_node(b), Err(LazyError::UnknownNode(b)));

        let d = graph.add_node("d");
        assert_eq!(d, b);
        assert_eq!(graph.label(d), Some("d"));
        assert_eq!(graph.len(), 3);
    }
}

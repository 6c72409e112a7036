//! Inheritance graph over spaces.
//!
//! Edges point from a base to a sub-space and are kept apart from the
//! containment tree. The graph enforces three rules on insertion:
//!
//! - no edge between containment-lineal spaces, or between spaces already
//!   related through inheritance,
//! - the edge set stays acyclic,
//! - every space reachable by traversal from the new sub-space keeps a C3
//!   linearization (checked by a dry-run traversal).
//!
//! [`traverse`] is the propagation driver used after every structural edit:
//! a downward pass (children first, then the space, then its sub-spaces) and
//! an upward pass over the sub-spaces of each containment ascendant. It runs
//! on an explicit task stack with a depth bound.

use crate::entity::ObjectId;
use crate::error::{ModelError, Result};
use ahash::{AHashMap, AHashSet};
use std::collections::VecDeque;

/// Read access to the containment tree, restricted to spaces.
pub trait Containment {
    fn contains(&self, v: ObjectId) -> bool;

    /// Containing space of `v`. `None` for top-level spaces, detached
    /// (dynamic) spaces and unknown ids.
    fn parent_space(&self, v: ObjectId) -> Option<ObjectId>;

    /// Direct child spaces in member order.
    fn child_spaces(&self, v: ObjectId) -> Vec<ObjectId>;

    /// `a` is a strict containment ascendant of `b`.
    fn is_ascendant(&self, a: ObjectId, b: ObjectId) -> bool {
        let mut cur = self.parent_space(b);
        while let Some(p) = cur {
            if p == a {
                return true;
            }
            cur = self.parent_space(p);
        }
        false
    }
}

/// What [`traverse`] needs from its owner.
pub trait TraversalHost: Containment {
    fn successors(&self, v: ObjectId) -> Vec<ObjectId>;

    /// Called once per visited vertex, in traversal order.
    fn visit(&mut self, v: ObjectId, dry_run: bool) -> Result<()>;
}

// ============================================================================
// Graph
// ============================================================================

#[derive(Debug, Clone)]
pub struct SpaceGraph {
    /// sub -> direct bases, declaration order
    bases: AHashMap<ObjectId, Vec<ObjectId>>,
    /// base -> direct subs, insertion order
    subs: AHashMap<ObjectId, Vec<ObjectId>>,
    max_depth: usize,
}

impl Default for SpaceGraph {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl SpaceGraph {
    pub fn new(max_depth: usize) -> Self {
        Self {
            bases: AHashMap::new(),
            subs: AHashMap::new(),
            max_depth,
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Direct bases of `v` in declaration order.
    pub fn get_bases(&self, v: ObjectId) -> &[ObjectId] {
        self.bases.get(&v).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Spaces that declare `v` as a direct base.
    pub fn successors(&self, v: ObjectId) -> &[ObjectId] {
        self.subs.get(&v).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_edge(&self, base: ObjectId, sub: ObjectId) -> bool {
        self.get_bases(sub).contains(&base)
    }

    pub fn edge_count(&self) -> usize {
        self.bases.values().map(Vec::len).sum()
    }

    /// All edges as `(sub, bases)`, subs in id order.
    pub fn edges(&self) -> Vec<(ObjectId, Vec<ObjectId>)> {
        let mut out: Vec<(ObjectId, Vec<ObjectId>)> = self
            .bases
            .iter()
            .filter(|(_, b)| !b.is_empty())
            .map(|(s, b)| (*s, b.clone()))
            .collect();
        out.sort_by_key(|(s, _)| *s);
        out
    }

    /// `to` can be reached from `from` along base -> sub edges.
    pub fn reaches(&self, from: ObjectId, to: ObjectId) -> bool {
        let mut seen = AHashSet::new();
        let mut stack = vec![from];
        while let Some(v) = stack.pop() {
            if v == to {
                return true;
            }
            if seen.insert(v) {
                stack.extend(self.successors(v).iter().copied());
            }
        }
        false
    }

    pub fn is_acyclic(&self) -> bool {
        // Kahn's algorithm over the vertices that carry edges.
        let mut indegree: AHashMap<ObjectId, usize> = AHashMap::new();
        for (sub, bases) in &self.bases {
            *indegree.entry(*sub).or_default() += bases.len();
            for b in bases {
                indegree.entry(*b).or_default();
            }
        }
        let mut ready: Vec<ObjectId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(v, _)| *v)
            .collect();
        let mut seen = 0usize;
        while let Some(v) = ready.pop() {
            seen += 1;
            for s in self.successors(v) {
                if let Some(d) = indegree.get_mut(s) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(*s);
                    }
                }
            }
        }
        seen == indegree.len()
    }

    /// Containment or inheritance lineage between `a` and `b`.
    pub fn has_lineal_relation<T: Containment + ?Sized>(&self, tree: &T, a: ObjectId, b: ObjectId) -> bool {
        tree.is_ascendant(a, b)
            || tree.is_ascendant(b, a)
            || self.reaches(a, b)
            || self.reaches(b, a)
    }

    /// Insert `base -> sub` after validating it; on any failure the graph is
    /// left exactly as it was.
    pub fn add_edge<T: Containment + ?Sized>(&mut self, tree: &T, base: ObjectId, sub: ObjectId) -> Result<()> {
        if base == sub {
            return Err(ModelError::CyclicInheritance { vertex: sub });
        }
        if tree.is_ascendant(base, sub) || tree.is_ascendant(sub, base) {
            return Err(ModelError::structural(format!(
                "{base} and {sub} have a parent-child relationship"
            )));
        }
        if self.reaches(sub, base) {
            return Err(ModelError::CyclicInheritance { vertex: sub });
        }
        if self.reaches(base, sub) {
            return Err(ModelError::structural(format!(
                "{base} is already a base of {sub} through inheritance"
            )));
        }

        self.insert_edge(base, sub);

        if !self.is_acyclic() {
            self.remove_edge(base, sub);
            return Err(ModelError::CyclicInheritance { vertex: sub });
        }

        let max_depth = self.max_depth;
        let mut dry = DryRun { graph: self, tree };
        if let Err(err) = traverse(&mut dry, sub, false, true, max_depth) {
            self.remove_edge(base, sub);
            return Err(err);
        }
        tracing::debug!(%base, %sub, "inheritance edge added");
        Ok(())
    }

    /// Remove `base -> sub`. Returns whether the edge existed.
    pub fn remove_edge(&mut self, base: ObjectId, sub: ObjectId) -> bool {
        let mut removed = false;
        if let Some(bases) = self.bases.get_mut(&sub) {
            let before = bases.len();
            bases.retain(|b| *b != base);
            removed = bases.len() != before;
            if bases.is_empty() {
                self.bases.remove(&sub);
            }
        }
        if let Some(subs) = self.subs.get_mut(&base) {
            subs.retain(|s| *s != sub);
            if subs.is_empty() {
                self.subs.remove(&base);
            }
        }
        removed
    }

    /// Drop every edge touching `v`.
    pub fn remove_vertex(&mut self, v: ObjectId) {
        for base in self.get_bases(v).to_vec() {
            self.remove_edge(base, v);
        }
        for sub in self.successors(v).to_vec() {
            self.remove_edge(v, sub);
        }
    }

    /// Edge insertion without validation, used when restoring snapshots of
    /// graphs that were validated when they were built.
    pub(crate) fn insert_edge(&mut self, base: ObjectId, sub: ObjectId) {
        if self.has_edge(base, sub) {
            return;
        }
        self.bases.entry(sub).or_default().push(base);
        self.subs.entry(base).or_default().push(sub);
    }

    // ------------------------------------------------------------------------
    // C3 linearization
    // ------------------------------------------------------------------------

    /// C3 linearization of `v`, starting with `v` itself.
    pub fn get_mro(&self, v: ObjectId) -> Result<Vec<ObjectId>> {
        let mut memo: AHashMap<ObjectId, Vec<ObjectId>> = AHashMap::new();
        let mut on_path: AHashSet<ObjectId> = AHashSet::new();
        // (vertex, bases already linearized)
        let mut stack: Vec<(ObjectId, bool)> = vec![(v, false)];

        while let Some((x, ready)) = stack.pop() {
            if memo.contains_key(&x) {
                continue;
            }
            if ready {
                let mro = self.merge(x, &memo)?;
                memo.insert(x, mro);
                on_path.remove(&x);
                continue;
            }
            if !on_path.insert(x) {
                return Err(ModelError::CyclicInheritance { vertex: x });
            }
            if on_path.len() > self.max_depth {
                return Err(ModelError::DepthExceeded {
                    scope: "MRO computation".to_string(),
                    limit: self.max_depth,
                    trace: String::new(),
                });
            }
            stack.push((x, true));
            for b in self.get_bases(x).iter().rev() {
                if on_path.contains(b) {
                    return Err(ModelError::CyclicInheritance { vertex: *b });
                }
                if !memo.contains_key(b) {
                    stack.push((*b, false));
                }
            }
        }

        memo.remove(&v)
            .ok_or(ModelError::InconsistentLinearization { vertex: v })
    }

    fn merge(&self, v: ObjectId, memo: &AHashMap<ObjectId, Vec<ObjectId>>) -> Result<Vec<ObjectId>> {
        let bases = self.get_bases(v);
        let mut seqs: Vec<VecDeque<ObjectId>> = Vec::with_capacity(bases.len() + 1);
        for b in bases {
            let mro = memo
                .get(b)
                .ok_or(ModelError::InconsistentLinearization { vertex: *b })?;
            seqs.push(mro.iter().copied().collect());
        }
        seqs.push(bases.iter().copied().collect());

        let mut out = vec![v];
        loop {
            seqs.retain(|s| !s.is_empty());
            if seqs.is_empty() {
                return Ok(out);
            }
            let candidate = seqs
                .iter()
                .filter_map(|s| s.front().copied())
                .find(|c| !seqs.iter().any(|s| s.iter().skip(1).any(|x| x == c)));
            let Some(c) = candidate else {
                return Err(ModelError::InconsistentLinearization { vertex: v });
            };
            out.push(c);
            for s in seqs.iter_mut() {
                if s.front() == Some(&c) {
                    s.pop_front();
                }
            }
        }
    }
}

// ============================================================================
// Traversal
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Task {
    Traverse { v: ObjectId, skip: bool, depth: usize },
    Down { v: ObjectId, skip: bool, depth: usize },
    Visit { v: ObjectId },
    Successors { v: ObjectId, depth: usize },
    Up { v: ObjectId, depth: usize },
}

/// Vertices visited by one traversal, in visit order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraversalReport {
    pub visited: Vec<ObjectId>,
}

/// Walk everything affected by a change at `start`.
///
/// `start` is the reentrancy guard: reaching it again through a sub-space
/// edge means the inheritance relation is cyclic once containment is taken
/// into account.
pub fn traverse<H: TraversalHost + ?Sized>(
    host: &mut H,
    start: ObjectId,
    skip_self: bool,
    dry_run: bool,
    max_depth: usize,
) -> Result<TraversalReport> {
    let mut report = TraversalReport::default();
    let mut stack = vec![Task::Traverse {
        v: start,
        skip: skip_self,
        depth: 0,
    }];

    let too_deep = |v: ObjectId| ModelError::DepthExceeded {
        scope: "Inheritance traversal".to_string(),
        limit: max_depth,
        trace: format!("at {v} starting from {start}"),
    };

    while let Some(task) = stack.pop() {
        match task {
            Task::Traverse { v, skip, depth } => {
                if depth > max_depth {
                    return Err(too_deep(v));
                }
                stack.push(Task::Up { v, depth });
                stack.push(Task::Down { v, skip, depth });
            }
            Task::Down { v, skip, depth } => {
                if !host.contains(v) {
                    continue;
                }
                if depth > max_depth {
                    return Err(too_deep(v));
                }
                stack.push(Task::Successors { v, depth });
                if !skip {
                    stack.push(Task::Visit { v });
                }
                for child in host.child_spaces(v).into_iter().rev() {
                    stack.push(Task::Down {
                        v: child,
                        skip: false,
                        depth: depth + 1,
                    });
                }
            }
            Task::Visit { v } => {
                if host.contains(v) {
                    tracing::trace!(vertex = %v, dry_run, "traversal visit");
                    host.visit(v, dry_run)?;
                    report.visited.push(v);
                }
            }
            Task::Successors { v, depth } => {
                if !host.contains(v) {
                    continue;
                }
                for sub in host.successors(v).into_iter().rev() {
                    if sub == start {
                        return Err(ModelError::CyclicInheritance { vertex: start });
                    }
                    stack.push(Task::Traverse {
                        v: sub,
                        skip: false,
                        depth: depth + 1,
                    });
                }
            }
            Task::Up { v, depth } => {
                if depth > max_depth {
                    return Err(too_deep(v));
                }
                if let Some(parent) = host.parent_space(v) {
                    stack.push(Task::Up {
                        v: parent,
                        depth: depth + 1,
                    });
                    stack.push(Task::Successors { v: parent, depth });
                }
            }
        }
    }
    Ok(report)
}

/// Dry-run host: computes the MRO of every visited vertex, mutates nothing.
struct DryRun<'a, T: Containment + ?Sized> {
    graph: &'a SpaceGraph,
    tree: &'a T,
}

impl<T: Containment + ?Sized> Containment for DryRun<'_, T> {
    fn contains(&self, v: ObjectId) -> bool {
        self.tree.contains(v)
    }

    fn parent_space(&self, v: ObjectId) -> Option<ObjectId> {
        self.tree.parent_space(v)
    }

    fn child_spaces(&self, v: ObjectId) -> Vec<ObjectId> {
        self.tree.child_spaces(v)
    }
}

impl<T: Containment + ?Sized> TraversalHost for DryRun<'_, T> {
    fn successors(&self, v: ObjectId) -> Vec<ObjectId> {
        self.graph.successors(v).to_vec()
    }

    fn visit(&mut self, v: ObjectId, _dry_run: bool) -> Result<()> {
        self.graph.get_mro(v).map(|_| ())
    }
}

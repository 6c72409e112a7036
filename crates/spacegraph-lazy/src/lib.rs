//! Spacegraph lazy evaluation layer
//!
//! ```text
//!   writes ──► OrderedMap ──mark_dirty──► observers ──► ... (push, flags only)
//!                  ▲
//!   reads ─────────┴── plan_refresh ◄── ChainView ◄── reader (pull, recompute)
//! ```
//!
//! ## Pieces
//!
//! - [`LazyGraph`]: arena of dirty flags and observer edges
//! - [`OrderedMap`]: one backing map, insertion-stable order, public surface
//! - [`ChainView`]: first-match-wins union over several maps
//!
//! The engine never owns payloads. Owners register a node per payload, run
//! the recomputation themselves in the order returned by
//! [`LazyGraph::plan_refresh`], and acknowledge each node with
//! [`LazyGraph::complete`].

pub mod chain;
pub mod engine;
pub mod ordered;

pub use chain::{ChainView, LayerSource};
pub use engine::{LazyError, LazyGraph, NodeId, DEFAULT_MAX_DEPTH};
pub use ordered::{stable_order, OrderedMap};

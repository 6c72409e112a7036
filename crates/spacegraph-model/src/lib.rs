//! Spacegraph Object Model
//!
//! Spaces, cells and references arranged in a containment tree, with
//! multiple inheritance between spaces:
//!
//! ```text
//!   Model ─┬─ Base ──── cells, refs, child spaces      (explicit)
//!          │    ▲
//!          │    │ base edge (C3 linearized)
//!          │    │
//!          └─ Sub ───── derived copies of Base's members
//!                 │
//!                 └─ Sub[1, 2] ── dynamic item, bases from the parameter
//! ```
//!
//! ## Pieces
//!
//! - [`SpaceGraph`]: inheritance edges, C3 MRO, two-phase [`traverse`]
//! - [`Model`]: arena of entities plus the structural operations that keep
//!   derived members in sync with their bases
//! - [`EvalContext`]: what a [`Formula`] sees while it runs
//! - [`ModelSnapshot`]: JSON/CBOR persistence of the static model
//!
//! Name resolution and cache invalidation run on the observer engine in
//! `spacegraph-lazy`.

pub mod config;
mod derive;
mod dynamic;
pub mod entity;
pub mod error;
pub mod eval;
pub mod formula;
pub mod graph;
pub mod model;
pub mod snapshot;
pub mod value;

pub use config::ModelConfig;
pub use entity::{Binding, ContentSource, EntityKind, MemberKind, ObjectId};
pub use error::{ModelError, Result};
pub use eval::EvalContext;
pub use formula::{FnFormula, FnParam, Formula, FormulaCompiler, FormulaRegistry, ParamFormula};
pub use graph::{traverse, Containment, SpaceGraph, TraversalHost, TraversalReport};
pub use model::{validate_name, Model};
pub use snapshot::{EdgeSnapshot, EntitySnapshot, ModelSnapshot};
pub use value::Value;

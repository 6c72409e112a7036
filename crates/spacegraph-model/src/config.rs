use crate::error::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunables for one [`Model`](crate::Model).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Bound on traversal, reconciliation and MRO nesting
    pub max_traversal_depth: usize,
    /// Bound on the formula call stack
    pub max_call_depth: usize,
    /// Call-stack lines kept in a depth error (head and tail around `...`)
    pub trace_lines: usize,
    /// Restore a checkpoint when a structural operation fails.
    ///
    /// Every structural operation then clones the whole model first (entities,
    /// observer graph and cached values), so building a model of `n` members
    /// one edit at a time costs O(n²). Turn this off for bulk construction
    /// when a failed edit can be handled by discarding the model.
    pub transactional: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            max_traversal_depth: 1000,
            max_call_depth: 1000,
            trace_lines: 6,
            transactional: true,
        }
    }
}

impl ModelConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ModelError::Config(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ModelError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }
}

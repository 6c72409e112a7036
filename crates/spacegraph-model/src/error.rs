use crate::entity::ObjectId;
use spacegraph_lazy::LazyError;

pub type Result<T, E = ModelError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ModelError {
    /// Lineal edge, base still in use, derived/explicit rule broken.
    #[error("structural violation: {0}")]
    StructuralViolation(String),

    #[error("cyclic inheritance detected at {vertex}")]
    CyclicInheritance { vertex: ObjectId },

    #[error("inconsistent hierarchy, no C3 MRO is possible for {vertex}")]
    InconsistentLinearization { vertex: ObjectId },

    #[error("{scope} exceeded the {limit} limit{}", trace_suffix(.trace))]
    DepthExceeded {
        scope: String,
        limit: usize,
        trace: String,
    },

    #[error("object {0} does not exist")]
    NotFound(ObjectId),

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("formula error: {0}")]
    Formula(String),

    #[error("observer engine error: {0}")]
    Observer(LazyError),

    #[error("config error: {0}")]
    Config(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

fn trace_suffix(trace: &str) -> String {
    if trace.is_empty() {
        ".".to_string()
    } else {
        format!(".\nCall stack traceback:\n{trace}")
    }
}

impl From<LazyError> for ModelError {
    fn from(err: LazyError) -> Self {
        match err {
            LazyError::DepthExceeded { limit } => ModelError::DepthExceeded {
                scope: "Lazy refresh".to_string(),
                limit,
                trace: String::new(),
            },
            other => ModelError::Observer(other),
        }
    }
}

impl ModelError {
    pub fn structural(msg: impl Into<String>) -> Self {
        ModelError::StructuralViolation(msg.into())
    }

    pub fn is_structural(&self) -> bool {
        matches!(self, ModelError::StructuralViolation(_))
    }
}

//! Typed error hierarchy for the conclave pipeline.
//!
//! One enum per subsystem:
//! - `RegistryError` — malformed caller input to the evidence registry
//! - `GateError` — task output failed structural validation
//! - `StoreError` — a shared-state invariant with no safe coercion
//! - `SearchError` — external search tool faults
//! - `TaskError` — a task unit's own execution failure

use thiserror::Error;

/// Invalid caller input to the Central Evidence Registry.
///
/// These are rejected outright and never retried; everything else the
/// registry encounters is handled fail-open (see `registry::register_value`).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("statement is empty after trimming")]
    EmptyStatement,

    #[error("source is empty after trimming")]
    EmptySource,

    #[error("credibility override {value} is not a finite number")]
    NonFiniteCredibility { value: f64 },

    #[error("submission field '{field}' is missing or not a string")]
    MissingField { field: &'static str },
}

/// Structural validation failure for a task unit's output.
///
/// `Parse` and `Schema` are distinct classes: a parse failure means the
/// output was not JSON at all, a schema failure lists every violated field.
#[derive(Debug, Clone, Error)]
pub enum GateError {
    #[error("output was not valid JSON: {0}")]
    Parse(String),

    #[error("schema validation failed for '{key}': {}", .violations.join("; "))]
    Schema { key: String, violations: Vec<String> },
}

impl GateError {
    /// All violated fields for a schema failure, empty for a parse failure.
    pub fn violations(&self) -> &[String] {
        match self {
            GateError::Parse(_) => &[],
            GateError::Schema { violations, .. } => violations,
        }
    }
}

/// A shared-state slot violated its type invariant and no documented safe
/// coercion applied. Only the single offending operation fails.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("slot '{key}' holds {found}, expected {expected}")]
    Corrupt {
        key: String,
        expected: &'static str,
        found: String,
    },

    #[error("persona judgment is missing the 'persona_id' field")]
    MissingPersonaId,
}

/// Faults raised by the search/retrieval tool.
///
/// `RateLimited` is deliberately distinguishable from other backend failures
/// so issuing task units can back off instead of retrying blindly.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("search backend failure: {0}")]
    Backend(String),
}

impl SearchError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, SearchError::RateLimited(_))
    }
}

/// Failure inside a task unit's `run`.
///
/// The driver and controller contain these with catch-log-continue; a task
/// fault never aborts the run.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task '{name}' failed: {message}")]
    Failed { name: String, message: String },

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    pub fn failed(name: &str, message: impl Into<String>) -> Self {
        TaskError::Failed {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

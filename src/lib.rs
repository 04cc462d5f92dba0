//! Conclave: a deliberative reasoning pipeline engine.
//!
//! Orchestrates many LLM-backed analysis task units through a deterministic,
//! multi-phase state machine — audit gate, persona allocation with diversity
//! validation, concurrent persona fan-out, synthesis, targeted research,
//! adjudication, coverage validation and final arbitration — producing one
//! adjudicated answer with quantified confidence.
//!
//! Task content, the LLM backend and search retrieval are external
//! collaborators behind the `TaskUnit` and `SearchTool` traits; the engine
//! owns sequencing, bounded validation retries, the shared append-only
//! evidence store and fail-open error containment.

pub mod config;
pub mod controller;
pub mod errors;
pub mod gate;
pub mod outputs;
pub mod registry;
pub mod retry;
pub mod search;
pub mod spawner;
pub mod store;
pub mod task;

//! Shared state store for the pipeline.
//!
//! This module provides:
//! - `KeyValueStore` — the minimal capability interface a state backend must
//!   implement (get/set, plus optional enumeration and map conversion)
//! - `MemoryStore` — the in-process adapter used by default
//! - `WorkflowState` — the shared blackboard every task unit reads and writes
//!
//! Backends differ in what they can do: some enumerate keys, some convert to
//! a canonical map, some only answer point lookups. Capabilities a backend
//! lacks return `None`; callers fall back to the next-richest capability
//! instead of failing.

mod state;

pub use state::WorkflowState;
pub(crate) use state::utc_timestamp;

use serde_json::{Map, Value};

/// Fixed top-level keys of the persisted state document.
pub mod keys {
    /// Append-only catalog of registered evidence facts.
    pub const EVIDENCE_REGISTRY: &str = "evidence_registry";
    /// Per-date fact sequence counters (8-digit date token -> next sequence).
    pub const EVIDENCE_SEQUENCES: &str = "evidence_daily_sequences";
    /// Persona judgments, one entry per persona id.
    pub const PERSONA_ANALYSES: &str = "persona_analyses";
    pub const NULL_HYPOTHESES: &str = "null_hypotheses";
    pub const NULL_HYPOTHESES_RESULT: &str = "null_hypotheses_result";
    pub const RESEARCH_OBJECTIVES: &str = "research_objectives";
    pub const ADJUDICATIONS: &str = "adjudications";
    /// Append-only log of every mutating registry/analysis operation.
    pub const AUDIT_TRAIL: &str = "audit_trail";

    pub const QUESTION: &str = "question";
    pub const QUESTION_AUDIT: &str = "question_audit";
    pub const QUESTION_ANALYSIS: &str = "question_analysis";
    pub const GATHER_INSIGHTS: &str = "gather_insights";
    pub const PERSONA_ALLOCATION: &str = "persona_allocation";
    pub const PERSONA_VALIDATION: &str = "persona_validation";
    pub const EVIDENCE_CONSISTENCY: &str = "evidence_consistency";
    pub const SYNTHESIS: &str = "synthesis_result";
    pub const ADVERSARIAL: &str = "adversarial_result";
    pub const DISAGREEMENT_MAP: &str = "disagreement_map";
    pub const BLINDSPOT_MAP: &str = "blindspot_map";
    pub const SEARCH_PLAN: &str = "search_plan";
    pub const TARGETED_RESEARCH: &str = "targeted_research";
    pub const EVIDENCE_ADJUDICATION: &str = "evidence_adjudication";
    pub const NULL_ADJUDICATIONS: &str = "null_adjudications";
    pub const CASE_FILE: &str = "case_file";
    pub const COVERAGE_REPORT: &str = "coverage_report";
    pub const ROBUSTNESS_METRICS: &str = "robustness_metrics";
    pub const QA_NOTES: &str = "qa_notes";
    pub const FINAL_VERDICT: &str = "final_verdict";
    pub const WORKFLOW_PHASE: &str = "workflow_phase";

    /// Prefix for per-persona judgment output slots.
    pub const PERSONA_JUDGMENT_PREFIX: &str = "persona_judgment_";

    /// Slots that must hold arrays.
    pub const LIST_SLOTS: [&str; 5] = [
        EVIDENCE_REGISTRY,
        PERSONA_ANALYSES,
        NULL_HYPOTHESES,
        RESEARCH_OBJECTIVES,
        AUDIT_TRAIL,
    ];

    /// Slots that must hold objects.
    pub const MAP_SLOTS: [&str; 3] = [EVIDENCE_SEQUENCES, NULL_HYPOTHESES_RESULT, ADJUDICATIONS];

    /// Per-phase output slots included in the persisted snapshot.
    pub const PHASE_OUTPUTS: [&str; 21] = [
        QUESTION,
        QUESTION_AUDIT,
        QUESTION_ANALYSIS,
        GATHER_INSIGHTS,
        PERSONA_ALLOCATION,
        PERSONA_VALIDATION,
        EVIDENCE_CONSISTENCY,
        SYNTHESIS,
        ADVERSARIAL,
        DISAGREEMENT_MAP,
        BLINDSPOT_MAP,
        SEARCH_PLAN,
        TARGETED_RESEARCH,
        EVIDENCE_ADJUDICATION,
        NULL_ADJUDICATIONS,
        CASE_FILE,
        COVERAGE_REPORT,
        ROBUSTNESS_METRICS,
        QA_NOTES,
        FINAL_VERDICT,
        WORKFLOW_PHASE,
    ];
}

/// Minimal capability interface for a state backend.
///
/// `get`/`set` are mandatory. `contains` defaults to a `get` probe.
/// `enumerate` and `as_map` are optional capabilities: adapters that cannot
/// support them return `None` and callers degrade to per-key probing.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&mut self, key: &str, value: Value);

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Best-effort key enumeration. `None` when the backend cannot list keys.
    fn enumerate(&self) -> Option<Vec<String>> {
        None
    }

    /// Best-effort conversion to a canonical map. `None` when unsupported.
    fn as_map(&self) -> Option<Map<String, Value>> {
        None
    }
}

/// In-process store backed by a JSON object map. Supports every capability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Map<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(entries: Map<String, Value>) -> Self {
        Self { entries }
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        self.entries.insert(key.to_string(), value);
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn enumerate(&self) -> Option<Vec<String>> {
        Some(self.entries.keys().cloned().collect())
    }

    fn as_map(&self) -> Option<Map<String, Value>> {
        Some(self.entries.clone())
    }
}

//! Typed models for high-stakes task outputs.
//!
//! The controller branches on these; everything else stays as raw JSON in
//! the store. Deserialization is tolerant: unknown fields are allowed and
//! most fields default, because task output is schema-fragile by nature and
//! the gate has already done the structural check that matters.

use crate::spawner::PersonaSpec;
use crate::config::Thresholds;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Verdict of the question audit gate. Anything other than `Proceed` halts
/// the entire run before any later phase executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Proceed,
    Block,
    RequestClarification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditVerdict {
    pub audit_status: AuditStatus,
    #[serde(default)]
    pub reframed_question: Option<String>,
    #[serde(default)]
    pub clarification_needed: Option<String>,
    #[serde(default)]
    pub proceed_justification: Option<String>,
}

/// Complexity breakdown reported by the allocator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComplexityAnalysis {
    #[serde(default)]
    pub stakeholder_count: f64,
    #[serde(default)]
    pub temporal_dimensions: f64,
    #[serde(default)]
    pub domain_crossings: f64,
    #[serde(default)]
    pub known_unknowns: f64,
    #[serde(default)]
    pub complexity_score: f64,
    #[serde(default)]
    pub recommended_persona_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaAllocation {
    #[serde(default)]
    pub complexity_analysis: Option<ComplexityAnalysis>,
    #[serde(default)]
    pub persona_count: usize,
    #[serde(default)]
    pub personas: Vec<PersonaSpec>,
}

impl PersonaAllocation {
    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Approved,
    RequiresRegeneration,
}

/// Diversity validator output for a persona allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaValidation {
    pub validation_status: ValidationStatus,
    #[serde(default)]
    pub cognitive_distance_matrix: Vec<Value>,
    #[serde(default)]
    pub redundancy_flags: Vec<Value>,
}

impl PersonaValidation {
    pub fn approved(&self) -> bool {
        self.validation_status == ValidationStatus::Approved
    }
}

/// Coverage metrics for a compiled case file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageReport {
    #[serde(default)]
    pub fact_preservation_rate: f64,
    #[serde(default)]
    pub divergence_coverage: f64,
    #[serde(default)]
    pub null_coverage: f64,
    #[serde(default)]
    pub passed: bool,
    #[serde(default)]
    pub gaps: Vec<String>,
}

impl CoverageReport {
    /// Check the report against the configured fixed thresholds. The
    /// validator's own `passed` flag is advisory; the thresholds decide.
    pub fn meets(&self, thresholds: &Thresholds) -> bool {
        self.fact_preservation_rate >= thresholds.fact_preservation_min
            && self.divergence_coverage >= thresholds.divergence_coverage_min
            && self.null_coverage >= thresholds.null_coverage_min
    }
}

/// Robustness scoring output; the arbiter's confidence must not exceed
/// `confidence_ceiling`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RobustnessMetrics {
    #[serde(default)]
    pub decision_robustness_score: f64,
    #[serde(default)]
    pub confidence_ceiling: f64,
    #[serde(default)]
    pub interpretation: Option<String>,
    #[serde(default)]
    pub sensitivity_score: f64,
}

/// The adjudicated final answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalVerdict {
    pub final_answer: String,
    pub confidence_percentage: f64,
    #[serde(default)]
    pub confidence_ceiling: f64,
    #[serde(default)]
    pub decision_robustness_score: f64,
}

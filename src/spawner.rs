//! Dynamic persona fan-out spawner.
//!
//! The allocator task decides how many analytical personas a question needs
//! from a weighted complexity score; the spawner materializes one task unit
//! per persona from whatever list it receives. Diversity invariants (unique
//! frameworks, at least one long-horizon persona, at least one status-quo
//! challenger) are enforced by the paired validator task in the allocation
//! loop, not here — `diversity_violations` is the shared pure check.

use crate::config::PersonaBands;
use crate::registry::EvidenceFact;
use crate::store::keys;
use crate::task::TaskUnit;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How far out a persona reasons.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeHorizon {
    ShortTerm,
    #[default]
    MediumTerm,
    LongTerm,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskOrientation {
    RiskSeeking,
    #[default]
    RiskNeutral,
    RiskAverse,
}

/// One configured analytical viewpoint. Created once per run by the
/// allocator; never persists beyond it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaSpec {
    pub id: String,
    #[serde(alias = "persona_name")]
    pub name: String,
    #[serde(alias = "epistemological_framework")]
    pub framework: String,
    #[serde(default, alias = "analytical_focus")]
    pub focus: String,
    #[serde(default)]
    pub worldview: String,
    #[serde(default)]
    pub guiding_question: String,
    #[serde(default)]
    pub evidence_lens: String,
    #[serde(default)]
    pub time_horizon: TimeHorizon,
    #[serde(default)]
    pub risk_orientation: RiskOrientation,
    /// Free-form tags; a "challenges_status_quo" tag marks the challenger.
    #[serde(default, alias = "diversity_tags")]
    pub tags: Vec<String>,
}

impl PersonaSpec {
    /// The state key this persona's judgment is written to.
    pub fn judgment_key(&self) -> String {
        format!("{}{}", keys::PERSONA_JUDGMENT_PREFIX, self.id)
    }

    pub fn challenges_status_quo(&self) -> bool {
        self.tags.iter().any(|tag| tag == "challenges_status_quo")
    }
}

/// Inputs to the complexity score, each on the analyst's 0-5 scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplexityInputs {
    pub stakeholders: f64,
    pub temporal_dims: f64,
    pub domain_crossings: f64,
    pub known_unknowns: f64,
}

/// Weighted complexity score:
/// `0.30·stakeholders + 0.25·temporal + 0.25·domains + 0.20·unknowns`.
pub fn complexity_score(inputs: &ComplexityInputs) -> f64 {
    0.30 * inputs.stakeholders
        + 0.25 * inputs.temporal_dims
        + 0.25 * inputs.domain_crossings
        + 0.20 * inputs.known_unknowns
}

/// Persona count for a complexity score. Breakpoints are configurable, the
/// band ordering is fixed.
pub fn persona_count(score: f64, bands: &PersonaBands) -> usize {
    if score <= bands.simple_max_complexity {
        bands.simple_count
    } else if score <= bands.moderate_max_complexity {
        bands.moderate_count
    } else {
        bands.complex_count
    }
}

/// Pure diversity check over a persona list. Returns one message per
/// violated invariant; empty means the list is diverse enough.
pub fn diversity_violations(personas: &[PersonaSpec]) -> Vec<String> {
    let mut violations = Vec::new();

    let mut seen = std::collections::HashSet::new();
    for persona in personas {
        if !seen.insert(persona.framework.as_str()) {
            violations.push(format!(
                "duplicate epistemic framework '{}'",
                persona.framework
            ));
        }
    }

    if !personas
        .iter()
        .any(|p| p.time_horizon == TimeHorizon::LongTerm)
    {
        violations.push("no long-horizon persona".to_string());
    }

    if !personas.iter().any(PersonaSpec::challenges_status_quo) {
        violations.push("no status-quo challenger".to_string());
    }

    violations
}

/// Builds a fully configured task unit from a persona spec and a read-only
/// evidence snapshot. Structured parameters stay separate from any rendered
/// instruction text — rendering is the implementor's concern.
pub trait PersonaTaskBuilder: Send + Sync {
    fn build(&self, spec: &PersonaSpec, evidence: &[EvidenceFact]) -> Arc<dyn TaskUnit>;
}

/// Materialize one independent task unit per persona.
pub fn spawn_units(
    personas: &[PersonaSpec],
    evidence: &[EvidenceFact],
    builder: &dyn PersonaTaskBuilder,
) -> Vec<Arc<dyn TaskUnit>> {
    personas
        .iter()
        .map(|spec| builder.build(spec, evidence))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persona(id: &str, framework: &str, horizon: TimeHorizon, challenger: bool) -> PersonaSpec {
        PersonaSpec {
            id: id.to_string(),
            name: format!("Persona {id}"),
            framework: framework.to_string(),
            focus: String::new(),
            worldview: String::new(),
            guiding_question: String::new(),
            evidence_lens: String::new(),
            time_horizon: horizon,
            risk_orientation: RiskOrientation::RiskNeutral,
            tags: if challenger {
                vec!["challenges_status_quo".to_string()]
            } else {
                Vec::new()
            },
        }
    }

    #[test]
    fn test_complexity_score_weights() {
        let inputs = ComplexityInputs {
            stakeholders: 4.0,
            temporal_dims: 2.0,
            domain_crossings: 3.0,
            known_unknowns: 1.0,
        };
        let score = complexity_score(&inputs);
        assert!((score - (1.2 + 0.5 + 0.75 + 0.2)).abs() < 1e-9);
    }

    #[test]
    fn test_persona_count_banding() {
        let bands = PersonaBands::default();
        assert_eq!(persona_count(0.0, &bands), 3);
        assert_eq!(persona_count(2.5, &bands), 3);
        assert_eq!(persona_count(2.51, &bands), 5);
        assert_eq!(persona_count(3.1, &bands), 5);
        assert_eq!(persona_count(4.0, &bands), 5);
        assert_eq!(persona_count(4.01, &bands), 7);
    }

    #[test]
    fn test_persona_count_with_custom_breakpoints() {
        let bands = PersonaBands {
            simple_max_complexity: 1.0,
            simple_count: 3,
            moderate_max_complexity: 2.0,
            moderate_count: 5,
            complex_count: 7,
        };
        assert_eq!(persona_count(1.5, &bands), 5);
        assert_eq!(persona_count(2.5, &bands), 7);
    }

    #[test]
    fn test_diversity_passes_for_diverse_panel() {
        let personas = vec![
            persona("a", "bayesian_reasoning", TimeHorizon::ShortTerm, false),
            persona("b", "complex_systems", TimeHorizon::LongTerm, false),
            persona("c", "institutional_economics", TimeHorizon::MediumTerm, true),
        ];
        assert!(diversity_violations(&personas).is_empty());
    }

    #[test]
    fn test_diversity_flags_every_violation() {
        let personas = vec![
            persona("a", "bayesian_reasoning", TimeHorizon::ShortTerm, false),
            persona("b", "bayesian_reasoning", TimeHorizon::MediumTerm, false),
        ];
        let violations = diversity_violations(&personas);
        assert_eq!(violations.len(), 3);
        assert!(violations[0].contains("duplicate epistemic framework"));
        assert!(violations.iter().any(|v| v.contains("long-horizon")));
        assert!(violations.iter().any(|v| v.contains("status-quo")));
    }

    #[test]
    fn test_persona_spec_accepts_allocator_field_names() {
        let raw = serde_json::json!({
            "id": "a",
            "persona_name": "The Skeptic",
            "epistemological_framework": "bayesian_reasoning",
            "analytical_focus": "base rates",
            "time_horizon": "long_term",
            "risk_orientation": "risk_averse",
            "diversity_tags": ["challenges_status_quo"]
        });
        let spec: PersonaSpec = serde_json::from_value(raw).unwrap();
        assert_eq!(spec.name, "The Skeptic");
        assert_eq!(spec.framework, "bayesian_reasoning");
        assert_eq!(spec.time_horizon, TimeHorizon::LongTerm);
        assert!(spec.challenges_status_quo());
        assert_eq!(spec.judgment_key(), "persona_judgment_a");
    }
}

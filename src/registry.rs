//! Central Evidence Registry (CER).
//!
//! An append-only catalog of sourced factual claims living inside the shared
//! state. Fact identifiers are `<DATE>-<SEQ>`: an 8-digit UTC date token and
//! a 3-digit, 1-based sequence scoped to that date. Sequence numbers are
//! allocated under the state lock together with the registry append, so they
//! strictly increase and are never reused even under concurrent callers.

use crate::config::CredibilityBaselines;
use crate::errors::RegistryError;
use crate::store::{WorkflowState, keys};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

pub const MAX_STATEMENT_LEN: usize = 10_000;
pub const MAX_SOURCE_LEN: usize = 2_000;

/// Trust tier of an evidence source. Unknown inputs downgrade to `Tertiary`
/// rather than failing — untrusted task output must not crash the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTier {
    Primary,
    Secondary,
    Tertiary,
}

impl SourceTier {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "primary" => SourceTier::Primary,
            "secondary" => SourceTier::Secondary,
            _ => SourceTier::Tertiary,
        }
    }

    pub fn baseline(&self, baselines: &CredibilityBaselines) -> f64 {
        match self {
            SourceTier::Primary => baselines.primary,
            SourceTier::Secondary => baselines.secondary,
            SourceTier::Tertiary => baselines.tertiary,
        }
    }
}

/// A registered fact. Never mutated after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceFact {
    pub fact_id: String,
    pub statement: String,
    pub source: String,
    pub source_type: SourceTier,
    pub credibility_score: f64,
    pub date_accessed: String,
    pub registered_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Caller input to `register`.
#[derive(Debug, Clone, Default)]
pub struct EvidenceSubmission {
    pub statement: String,
    pub source: String,
    pub source_type: String,
    pub date_accessed: Option<String>,
    pub credibility_override: Option<f64>,
    /// Research track tag: "confirmatory" or "disconfirmatory".
    pub research_track: Option<String>,
    /// Identifier of the analyst (task unit) registering the fact.
    pub analyst: Option<String>,
}

impl EvidenceSubmission {
    pub fn new(statement: &str, source: &str, source_type: &str) -> Self {
        Self {
            statement: statement.to_string(),
            source: source.to_string(),
            source_type: source_type.to_string(),
            ..Self::default()
        }
    }
}

/// Normalize a date input to an 8-digit token, defaulting to the current UTC
/// date when the input is absent or unparseable.
fn normalize_date_token(date_accessed: Option<&str>) -> String {
    if let Some(raw) = date_accessed {
        let raw = raw.trim();
        if raw.len() == 8 && raw.chars().all(|c| c.is_ascii_digit()) {
            if NaiveDate::parse_from_str(raw, "%Y%m%d").is_ok() {
                return raw.to_string();
            }
        }
        for format in ["%Y-%m-%d", "%Y/%m/%d"] {
            if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
                return date.format("%Y%m%d").to_string();
            }
        }
        warn!(input = raw, "unparseable date_accessed, using current UTC date");
    }
    Utc::now().format("%Y%m%d").to_string()
}

/// Resolve the credibility score: tier baseline unless a finite override is
/// given, clamped to [0, 1] and rounded to 4 decimals.
fn resolve_credibility(
    override_score: Option<f64>,
    tier: SourceTier,
    baselines: &CredibilityBaselines,
) -> Result<f64, RegistryError> {
    let score = match override_score {
        Some(value) => {
            if !value.is_finite() {
                return Err(RegistryError::NonFiniteCredibility { value });
            }
            value.clamp(0.0, 1.0)
        }
        None => tier.baseline(baselines),
    };
    Ok((score * 10_000.0).round() / 10_000.0)
}

/// Register a fact in the Central Evidence Registry.
///
/// Statement and source are trimmed and must be non-empty; over-length inputs
/// are truncated, not rejected. The sequence allocation, registry append and
/// counter increment happen under one lock acquisition. The audit append is a
/// separate best-effort step: if it fails, the registration stays visible.
pub fn register(
    state: &WorkflowState,
    baselines: &CredibilityBaselines,
    submission: EvidenceSubmission,
) -> Result<EvidenceFact, RegistryError> {
    let statement = submission.statement.trim();
    if statement.is_empty() {
        return Err(RegistryError::EmptyStatement);
    }
    let source = submission.source.trim();
    if source.is_empty() {
        return Err(RegistryError::EmptySource);
    }
    let statement: String = statement.chars().take(MAX_STATEMENT_LEN).collect();
    let source: String = source.chars().take(MAX_SOURCE_LEN).collect();

    let tier = SourceTier::parse(&submission.source_type);
    let date_token = normalize_date_token(submission.date_accessed.as_deref());
    let credibility = resolve_credibility(submission.credibility_override, tier, baselines)?;

    let mut metadata = Map::new();
    if let Some(track) = submission.research_track.as_deref() {
        metadata.insert("research_track".to_string(), json!(track));
    }
    if let Some(analyst) = submission.analyst.as_deref() {
        metadata.insert("registered_by".to_string(), json!(analyst));
    }

    let fact = state.with_store(|store| {
        // Allocate the per-date sequence and append the fact as one
        // indivisible step; a consumed sequence number is never reused.
        let mut sequences = match store.get(keys::EVIDENCE_SEQUENCES) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let next = sequences
            .get(&date_token)
            .and_then(Value::as_u64)
            .unwrap_or(1);
        sequences.insert(date_token.clone(), json!(next + 1));
        store.set(keys::EVIDENCE_SEQUENCES, Value::Object(sequences));

        let fact = EvidenceFact {
            fact_id: format!("{date_token}-{next:03}"),
            statement,
            source,
            source_type: tier,
            credibility_score: credibility,
            date_accessed: date_token.clone(),
            registered_at: crate::store::utc_timestamp(),
            metadata: if metadata.is_empty() {
                None
            } else {
                Some(metadata)
            },
        };

        let mut registry = match store.get(keys::EVIDENCE_REGISTRY) {
            Some(Value::Array(entries)) => entries,
            _ => Vec::new(),
        };
        registry.push(serde_json::to_value(&fact).unwrap_or(Value::Null));
        store.set(keys::EVIDENCE_REGISTRY, Value::Array(registry));

        fact
    });

    let mut fields = Map::new();
    fields.insert("fact_id".to_string(), json!(fact.fact_id));
    fields.insert("source_type".to_string(), json!(fact.source_type));
    fields.insert("credibility_score".to_string(), json!(fact.credibility_score));
    state.append_audit_event("register_evidence", fields);

    info!(
        fact_id = %fact.fact_id,
        credibility = fact.credibility_score,
        "registered evidence"
    );
    Ok(fact)
}

/// Task-facing registration surface. Accepts loosely-typed task output and
/// never fails: invalid input or an internal fault yields a degraded payload
/// carrying an explicit failure marker, so the pipeline keeps running.
pub fn register_value(
    state: &WorkflowState,
    baselines: &CredibilityBaselines,
    args: &Value,
) -> Value {
    let submission = match parse_submission(args) {
        Ok(submission) => submission,
        Err(err) => return degraded_payload(args, &err.to_string()),
    };

    match register(state, baselines, submission) {
        Ok(fact) => serde_json::to_value(&fact).unwrap_or(Value::Null),
        Err(err) => {
            warn!(error = %err, "evidence registration failed, returning degraded payload");
            degraded_payload(args, &err.to_string())
        }
    }
}

fn parse_submission(args: &Value) -> Result<EvidenceSubmission, RegistryError> {
    let field = |name: &'static str| -> Result<String, RegistryError> {
        args.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(RegistryError::MissingField { field: name })
    };

    Ok(EvidenceSubmission {
        statement: field("statement")?,
        source: field("source")?,
        source_type: field("source_type")?,
        date_accessed: args
            .get("date_accessed")
            .and_then(Value::as_str)
            .map(str::to_string),
        credibility_override: args.get("credibility_override").and_then(Value::as_f64),
        research_track: args
            .get("research_track")
            .and_then(Value::as_str)
            .map(str::to_string),
        analyst: args.get("analyst").and_then(Value::as_str).map(str::to_string),
    })
}

fn degraded_payload(args: &Value, error: &str) -> Value {
    let excerpt: String = args
        .get("statement")
        .and_then(Value::as_str)
        .unwrap_or("")
        .chars()
        .take(100)
        .collect();
    json!({
        "fact_id": format!("ERROR-{}", Utc::now().format("%Y%m%d-%H%M%S")),
        "statement": excerpt,
        "status": "failed",
        "error": error,
    })
}

/// All registered facts, append order preserved.
pub fn all_facts(state: &WorkflowState) -> Vec<EvidenceFact> {
    match state.get(keys::EVIDENCE_REGISTRY) {
        Some(Value::Array(entries)) => entries
            .into_iter()
            .filter_map(|entry| serde_json::from_value(entry).ok())
            .collect(),
        _ => Vec::new(),
    }
}

/// Facts at or above the given credibility, append order preserved.
pub fn high_credibility_facts(state: &WorkflowState, min_score: f64) -> Vec<EvidenceFact> {
    all_facts(state)
        .into_iter()
        .filter(|fact| fact.credibility_score >= min_score)
        .collect()
}

/// Point lookup by fact id.
pub fn get_fact(state: &WorkflowState, fact_id: &str) -> Option<EvidenceFact> {
    all_facts(state).into_iter().find(|f| f.fact_id == fact_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn setup() -> (WorkflowState, CredibilityBaselines) {
        let state = WorkflowState::in_memory();
        state.initialize_defaults();
        (state, CredibilityBaselines::default())
    }

    #[test]
    fn test_first_registration_of_day_gets_sequence_001() {
        let (state, baselines) = setup();
        let mut submission =
            EvidenceSubmission::new("Inflation fell 2%", "https://x", "primary");
        submission.date_accessed = Some("2025-01-15".to_string());

        let fact = register(&state, &baselines, submission).unwrap();
        assert_eq!(fact.fact_id, "20250115-001");
        assert_eq!(fact.credibility_score, 0.95);
        assert_eq!(fact.source_type, SourceTier::Primary);
        assert_eq!(fact.date_accessed, "20250115");
    }

    #[test]
    fn test_sequential_same_date_registrations_increment() {
        let (state, baselines) = setup();
        for expected in ["20250115-001", "20250115-002"] {
            let mut submission = EvidenceSubmission::new("claim", "https://x", "secondary");
            submission.date_accessed = Some("20250115".to_string());
            let fact = register(&state, &baselines, submission).unwrap();
            assert_eq!(fact.fact_id, expected);
        }
    }

    #[test]
    fn test_sequences_are_scoped_per_date() {
        let (state, baselines) = setup();
        let mut first = EvidenceSubmission::new("a", "s", "primary");
        first.date_accessed = Some("20250115".to_string());
        let mut second = EvidenceSubmission::new("b", "s", "primary");
        second.date_accessed = Some("20250116".to_string());

        assert_eq!(register(&state, &baselines, first).unwrap().fact_id, "20250115-001");
        assert_eq!(register(&state, &baselines, second).unwrap().fact_id, "20250116-001");
    }

    #[test]
    fn test_unknown_source_type_downgrades_to_tertiary() {
        let (state, baselines) = setup();
        let fact = register(
            &state,
            &baselines,
            EvidenceSubmission::new("claim", "src", "blog-post"),
        )
        .unwrap();
        assert_eq!(fact.source_type, SourceTier::Tertiary);
        assert_eq!(fact.credibility_score, 0.55);
    }

    #[test]
    fn test_statement_truncated_at_bound() {
        let (state, baselines) = setup();
        let long = "x".repeat(MAX_STATEMENT_LEN + 1);
        let fact = register(
            &state,
            &baselines,
            EvidenceSubmission::new(&long, "src", "primary"),
        )
        .unwrap();
        assert_eq!(fact.statement.chars().count(), MAX_STATEMENT_LEN);

        let exact = "y".repeat(MAX_STATEMENT_LEN);
        let fact = register(
            &state,
            &baselines,
            EvidenceSubmission::new(&exact, "src", "primary"),
        )
        .unwrap();
        assert_eq!(fact.statement, exact);
    }

    #[test]
    fn test_empty_statement_rejected() {
        let (state, baselines) = setup();
        let err = register(
            &state,
            &baselines,
            EvidenceSubmission::new("   ", "src", "primary"),
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::EmptyStatement));
        // A rejected attempt must not consume a sequence number.
        let fact = register(
            &state,
            &baselines,
            EvidenceSubmission::new("real claim", "src", "primary"),
        )
        .unwrap();
        assert!(fact.fact_id.ends_with("-001"));
    }

    #[test]
    fn test_override_clamped_and_non_finite_rejected() {
        let (state, baselines) = setup();
        let mut submission = EvidenceSubmission::new("claim", "src", "tertiary");
        submission.credibility_override = Some(1.7);
        let fact = register(&state, &baselines, submission).unwrap();
        assert_eq!(fact.credibility_score, 1.0);

        let mut submission = EvidenceSubmission::new("claim", "src", "tertiary");
        submission.credibility_override = Some(f64::INFINITY);
        let err = register(&state, &baselines, submission).unwrap_err();
        assert!(matches!(err, RegistryError::NonFiniteCredibility { .. }));
    }

    #[test]
    fn test_bad_date_defaults_to_today() {
        let (state, baselines) = setup();
        let mut submission = EvidenceSubmission::new("claim", "src", "primary");
        submission.date_accessed = Some("not-a-date".to_string());
        let fact = register(&state, &baselines, submission).unwrap();
        let today = Utc::now().format("%Y%m%d").to_string();
        assert_eq!(fact.date_accessed, today);
        assert_eq!(fact.fact_id, format!("{today}-001"));
    }

    #[test]
    fn test_slash_date_format_accepted() {
        let (state, baselines) = setup();
        let mut submission = EvidenceSubmission::new("claim", "src", "primary");
        submission.date_accessed = Some("2025/01/15".to_string());
        let fact = register(&state, &baselines, submission).unwrap();
        assert_eq!(fact.date_accessed, "20250115");
    }

    #[test]
    fn test_metadata_carries_track_and_analyst() {
        let (state, baselines) = setup();
        let mut submission = EvidenceSubmission::new("claim", "src", "secondary");
        submission.research_track = Some("disconfirmatory".to_string());
        submission.analyst = Some("researcher".to_string());
        let fact = register(&state, &baselines, submission).unwrap();
        let metadata = fact.metadata.unwrap();
        assert_eq!(metadata["research_track"], json!("disconfirmatory"));
        assert_eq!(metadata["registered_by"], json!("researcher"));
    }

    #[test]
    fn test_registration_appends_audit_event() {
        let (state, baselines) = setup();
        register(
            &state,
            &baselines,
            EvidenceSubmission::new("claim", "src", "primary"),
        )
        .unwrap();
        let trail = state.audit_trail();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0]["event"], json!("register_evidence"));
        assert!(trail[0]["fact_id"].is_string());
    }

    #[test]
    fn test_register_value_fail_open_on_missing_fields() {
        let (state, baselines) = setup();
        let result = register_value(&state, &baselines, &json!({"statement": "claim"}));
        assert_eq!(result["status"], json!("failed"));
        assert!(result["error"].as_str().unwrap().contains("source"));
        assert!(result["fact_id"].as_str().unwrap().starts_with("ERROR-"));
    }

    #[test]
    fn test_register_value_success_payload() {
        let (state, baselines) = setup();
        let result = register_value(
            &state,
            &baselines,
            &json!({
                "statement": "claim",
                "source": "https://x",
                "source_type": "primary",
                "date_accessed": "20250115",
            }),
        );
        assert_eq!(result["fact_id"], json!("20250115-001"));
        assert!(result.get("status").is_none());
    }

    #[test]
    fn test_high_credibility_filter_preserves_order() {
        let (state, baselines) = setup();
        for (statement, tier) in [("a", "primary"), ("b", "tertiary"), ("c", "primary")] {
            register(
                &state,
                &baselines,
                EvidenceSubmission::new(statement, "src", tier),
            )
            .unwrap();
        }
        let facts = high_credibility_facts(&state, 0.80);
        let statements: Vec<&str> = facts.iter().map(|f| f.statement.as_str()).collect();
        assert_eq!(statements, vec!["a", "c"]);
    }

    #[test]
    fn test_get_fact_point_lookup() {
        let (state, baselines) = setup();
        let mut submission = EvidenceSubmission::new("claim", "src", "primary");
        submission.date_accessed = Some("20250115".to_string());
        register(&state, &baselines, submission).unwrap();
        assert!(get_fact(&state, "20250115-001").is_some());
        assert!(get_fact(&state, "20250115-999").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_registration_never_reuses_sequence() {
        let (state, baselines) = setup();
        let state = Arc::new(state);

        let mut handles = Vec::new();
        for i in 0..32 {
            let state = state.clone();
            let baselines = baselines.clone();
            handles.push(tokio::spawn(async move {
                let mut submission =
                    EvidenceSubmission::new(&format!("claim {i}"), "src", "primary");
                submission.date_accessed = Some("20250115".to_string());
                register(&state, &baselines, submission).unwrap().fact_id
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 32, "sequence numbers must never repeat");
        assert!(ids.contains(&"20250115-001".to_string()));
        assert!(ids.contains(&"20250115-032".to_string()));
    }
}

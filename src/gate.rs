//! Structural validation gate for task unit outputs.
//!
//! Validation is a pure function: it strips enclosing markdown fences,
//! parses JSON, and checks the result against the schema registered for the
//! output key. Schema coverage is intentionally partial — only high-stakes
//! phase outputs are checked; a key without a schema is valid by default.

use crate::errors::GateError;
use crate::store::keys;
use serde_json::Value;
use std::collections::HashMap;

/// Expected JSON type for a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Object,
    Array,
    String,
    Number,
    Bool,
}

impl Kind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Kind::Object => value.is_object(),
            Kind::Array => value.is_array(),
            Kind::String => value.is_string(),
            Kind::Number => value.is_number(),
            Kind::Bool => value.is_boolean(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Kind::Object => "object",
            Kind::Array => "array",
            Kind::String => "string",
            Kind::Number => "number",
            Kind::Bool => "boolean",
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One field requirement in a schema.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: Kind,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: Kind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: Kind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// Declarative schema: a flat set of field requirements on a JSON object.
/// Extra fields are always allowed.
#[derive(Debug, Clone)]
pub struct Schema {
    pub fields: &'static [FieldSpec],
}

impl Schema {
    /// Every violated field, empty when the value conforms.
    fn violations(&self, value: &Value) -> Vec<String> {
        let Some(object) = value.as_object() else {
            return vec![format!("expected object, got {}", kind_of(value))];
        };

        let mut violations = Vec::new();
        for field in self.fields {
            match object.get(field.name) {
                None => {
                    if field.required {
                        violations.push(format!("{}: missing", field.name));
                    }
                }
                Some(found) => {
                    if !field.kind.matches(found) {
                        violations.push(format!(
                            "{}: expected {}, got {}",
                            field.name,
                            field.kind.name(),
                            kind_of(found)
                        ));
                    }
                }
            }
        }
        violations
    }
}

/// Result of validating one output.
#[derive(Debug, Clone)]
pub struct Validated {
    pub valid: bool,
    /// Parsed JSON when parsing succeeded, regardless of schema outcome.
    pub model: Option<Value>,
    pub error: Option<GateError>,
}

impl Validated {
    fn ok(model: Value) -> Self {
        Self {
            valid: true,
            model: Some(model),
            error: None,
        }
    }

    fn parse_failure(error: GateError) -> Self {
        Self {
            valid: false,
            model: None,
            error: Some(error),
        }
    }

    fn schema_failure(model: Value, error: GateError) -> Self {
        Self {
            valid: false,
            model: Some(model),
            error: Some(error),
        }
    }
}

/// Strip an enclosing markdown code fence, if present.
fn strip_fences(raw: &str) -> String {
    let text = raw.trim();
    if !text.starts_with("```") {
        return text.to_string();
    }
    let mut lines: Vec<&str> = text.lines().collect();
    if !lines.is_empty() {
        lines.remove(0);
    }
    if lines.last().is_some_and(|line| line.trim_start().starts_with("```")) {
        lines.pop();
    }
    lines.join("\n")
}

/// The validation gate: a per-output-key schema registry.
pub struct Gate {
    schemas: HashMap<&'static str, Schema>,
}

impl Gate {
    /// Empty gate: everything is valid by default.
    pub fn new() -> Self {
        Self {
            schemas: HashMap::new(),
        }
    }

    /// Gate preloaded with the high-stakes phase output schemas.
    pub fn with_default_schemas() -> Self {
        let mut gate = Self::new();
        gate.register(
            keys::QUESTION_AUDIT,
            Schema {
                fields: const {
                    &[
                        FieldSpec::required("audit_status", Kind::String),
                        FieldSpec::optional("clarification_needed", Kind::String),
                        FieldSpec::optional("proceed_justification", Kind::String),
                    ]
                },
            },
        );
        gate.register(
            keys::NULL_HYPOTHESES_RESULT,
            Schema {
                fields: const { &[FieldSpec::required("null_hypotheses", Kind::Array)] },
            },
        );
        gate.register(
            keys::PERSONA_ALLOCATION,
            Schema {
                fields: &[
                    FieldSpec::required("personas", Kind::Array),
                    FieldSpec::required("persona_count", Kind::Number),
                    FieldSpec::optional("complexity_analysis", Kind::Object),
                ],
            },
        );
        gate.register(
            keys::PERSONA_VALIDATION,
            Schema {
                fields: &[
                    FieldSpec::required("validation_status", Kind::String),
                    FieldSpec::optional("redundancy_flags", Kind::Array),
                    FieldSpec::optional("cognitive_distance_matrix", Kind::Array),
                ],
            },
        );
        gate.register(
            keys::COVERAGE_REPORT,
            Schema {
                fields: &[
                    FieldSpec::required("fact_preservation_rate", Kind::Number),
                    FieldSpec::required("divergence_coverage", Kind::Number),
                    FieldSpec::required("null_coverage", Kind::Number),
                    FieldSpec::optional("passed", Kind::Bool),
                    FieldSpec::optional("gaps", Kind::Array),
                ],
            },
        );
        gate.register(
            keys::ROBUSTNESS_METRICS,
            Schema {
                fields: &[
                    FieldSpec::required("decision_robustness_score", Kind::Number),
                    FieldSpec::required("confidence_ceiling", Kind::Number),
                    FieldSpec::optional("interpretation", Kind::String),
                ],
            },
        );
        gate.register(
            keys::FINAL_VERDICT,
            Schema {
                fields: &[
                    FieldSpec::required("final_answer", Kind::String),
                    FieldSpec::required("confidence_percentage", Kind::Number),
                    FieldSpec::optional("confidence_ceiling", Kind::Number),
                ],
            },
        );
        gate
    }

    pub fn register(&mut self, key: &'static str, schema: Schema) {
        self.schemas.insert(key, schema);
    }

    pub fn has_schema(&self, key: &str) -> bool {
        self.schemas.contains_key(key)
    }

    /// Validate raw task output against the schema for `key`. Pure: never
    /// mutates state.
    pub fn validate(&self, raw: &str, key: &str) -> Validated {
        let stripped = strip_fences(raw);
        let parsed: Value = match serde_json::from_str(&stripped) {
            Ok(value) => value,
            Err(err) => return Validated::parse_failure(GateError::Parse(err.to_string())),
        };

        let Some(schema) = self.schemas.get(key) else {
            return Validated::ok(parsed);
        };

        let violations = schema.violations(&parsed);
        if violations.is_empty() {
            Validated::ok(parsed)
        } else {
            let error = GateError::Schema {
                key: key.to_string(),
                violations,
            };
            Validated::schema_failure(parsed, error)
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::with_default_schemas()
    }
}

//! Task units and the driver that wraps every execution.
//!
//! A task unit is one bounded LLM-backed operation with a declared output
//! slot in the shared state. The driver applies the same global wrapper to
//! every unit: execute, read the declared slot (falling back to streamed
//! text), validate through the gate, and on failure inject a structured
//! error back into the unit's input and retry up to a configurable bound.
//! Exhaustion proceeds anyway — the last error is surfaced only as a log.

use crate::errors::TaskError;
use crate::gate::Gate;
use crate::store::WorkflowState;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Input field the driver injects a structured validation error under when
/// retrying a unit whose previous output failed the gate.
pub const VALIDATION_FEEDBACK_KEY: &str = "validation_feedback";

/// Progress events emitted by a running unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A chunk of streamed output text.
    Text { text: String },
    /// A named unit of progress with no text payload.
    Progress { label: String },
}

/// Everything a unit needs to run: the shared state handle, its JSON input
/// payload, and a channel for intermediate events.
pub struct TaskContext {
    pub state: Arc<WorkflowState>,
    pub input: Value,
    pub events: mpsc::Sender<TaskEvent>,
}

impl TaskContext {
    /// Emit streamed text. Send failures mean the driver stopped listening;
    /// the unit keeps running regardless.
    pub async fn emit_text(&self, text: impl Into<String>) {
        let _ = self.events.send(TaskEvent::Text { text: text.into() }).await;
    }

    pub async fn emit_progress(&self, label: impl Into<String>) {
        let _ = self
            .events
            .send(TaskEvent::Progress {
                label: label.into(),
            })
            .await;
    }
}

/// One bounded LLM-backed operation.
#[async_trait]
pub trait TaskUnit: Send + Sync {
    fn name(&self) -> &str;

    /// State key the unit writes its final output to, when it declares one.
    fn output_key(&self) -> Option<&str> {
        None
    }

    async fn run(&self, ctx: TaskContext) -> Result<(), TaskError>;
}

/// What the driver observed for one unit execution.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task: String,
    /// Output read from the declared slot, or streamed text as a fallback.
    pub output: Option<Value>,
    pub valid: bool,
    /// True when the unit faulted or validation was exhausted; the pipeline
    /// proceeded on the degraded result.
    pub degraded: bool,
    pub attempts: u32,
    pub error: Option<String>,
}

impl TaskReport {
    fn failure(task: &str, attempts: u32, output: Option<Value>, error: String) -> Self {
        Self {
            task: task.to_string(),
            output,
            valid: false,
            degraded: true,
            attempts,
            error: Some(error),
        }
    }
}

/// The global wrapper applied to every task unit execution.
#[derive(Clone)]
pub struct TaskDriver {
    state: Arc<WorkflowState>,
    gate: Arc<Gate>,
    max_schema_retries: u32,
    pause: CancellationToken,
}

impl TaskDriver {
    pub fn new(
        state: Arc<WorkflowState>,
        gate: Arc<Gate>,
        max_schema_retries: u32,
        pause: CancellationToken,
    ) -> Self {
        Self {
            state,
            gate,
            max_schema_retries,
            pause,
        }
    }

    /// Run one unit to completion, consuming its event stream. The pause
    /// signal is observed after every emitted event but honored only at the
    /// end of the unit — cancellation is cooperative, never preemptive.
    async fn execute(&self, unit: &dyn TaskUnit, input: Value) -> (String, Result<(), TaskError>) {
        let (events, mut rx) = mpsc::channel::<TaskEvent>(64);
        let ctx = TaskContext {
            state: self.state.clone(),
            input,
            events,
        };

        let mut collected = String::new();
        let run = unit.run(ctx);
        tokio::pin!(run);

        let mut events_open = true;
        let result = loop {
            tokio::select! {
                maybe_event = rx.recv(), if events_open => {
                    match maybe_event {
                        Some(TaskEvent::Text { text }) => {
                            collected.push_str(&text);
                            collected.push('\n');
                            if self.pause.is_cancelled() {
                                debug!(task = unit.name(), "pause observed mid-stream, finishing unit");
                            }
                        }
                        Some(TaskEvent::Progress { label }) => {
                            debug!(task = unit.name(), progress = %label, "task progress");
                            if self.pause.is_cancelled() {
                                debug!(task = unit.name(), "pause observed mid-stream, finishing unit");
                            }
                        }
                        None => events_open = false,
                    }
                }
                result = &mut run => break result,
            }
        };

        while let Ok(event) = rx.try_recv() {
            if let TaskEvent::Text { text } = event {
                collected.push_str(&text);
                collected.push('\n');
            }
        }

        (collected, result)
    }

    fn read_output(&self, unit: &dyn TaskUnit, collected: &str) -> Option<Value> {
        if let Some(key) = unit.output_key() {
            if let Some(value) = self.state.get(key) {
                return Some(value);
            }
        }
        let text = collected.trim();
        if text.is_empty() {
            None
        } else {
            Some(Value::String(text.to_string()))
        }
    }

    /// Execute a unit under the global wrapper: validate its declared output
    /// and retry with injected feedback while the schema-retry budget lasts.
    pub async fn run_validated(&self, unit: &dyn TaskUnit, payload: Value) -> TaskReport {
        let mut last_error: Option<String> = None;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let input = inject_feedback(payload.clone(), last_error.as_deref());
            let (collected, run_result) = self.execute(unit, input).await;

            if let Err(err) = run_result {
                warn!(task = unit.name(), error = %err, "task unit failed, proceeding degraded");
                return TaskReport::failure(
                    unit.name(),
                    attempt,
                    self.read_output(unit, &collected),
                    err.to_string(),
                );
            }

            let Some(key) = unit.output_key() else {
                return TaskReport {
                    task: unit.name().to_string(),
                    output: self.read_output(unit, &collected),
                    valid: true,
                    degraded: false,
                    attempts: attempt,
                    error: None,
                };
            };

            let Some(output) = self.read_output(unit, &collected) else {
                warn!(task = unit.name(), key, "no output in state or streamed text");
                return TaskReport {
                    task: unit.name().to_string(),
                    output: None,
                    valid: true,
                    degraded: false,
                    attempts: attempt,
                    error: None,
                };
            };

            let raw = match &output {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            let validated = self.gate.validate(&raw, key);

            if validated.valid {
                debug!(task = unit.name(), attempt, "validation passed");
                return TaskReport {
                    task: unit.name().to_string(),
                    output: validated.model.or(Some(output)),
                    valid: true,
                    degraded: false,
                    attempts: attempt,
                    error: None,
                };
            }

            let error = validated
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "validation failed".to_string());

            if attempt <= self.max_schema_retries {
                warn!(
                    task = unit.name(),
                    attempt,
                    error = %error,
                    "validation failed, retrying with injected feedback"
                );
                last_error = Some(error);
                continue;
            }

            warn!(
                task = unit.name(),
                attempts = attempt,
                error = %error,
                "validation retries exhausted, proceeding with degraded output"
            );
            return TaskReport::failure(
                unit.name(),
                attempt,
                validated.model.or(Some(output)),
                error,
            );
        }
    }

    /// Run a fan-out group: every unit concurrently, completing only when
    /// all have finished or failed. Units share the state handle but write
    /// disjoint output keys; sibling order is unspecified.
    pub async fn run_group(&self, units: &[Arc<dyn TaskUnit>], payload: Value) -> Vec<TaskReport> {
        let handles: Vec<_> = units
            .iter()
            .map(|unit| {
                let driver = self.clone();
                let unit = unit.clone();
                let payload = payload.clone();
                tokio::spawn(async move { driver.run_validated(unit.as_ref(), payload).await })
            })
            .collect();

        let mut reports = Vec::new();
        for (unit, joined) in units.iter().zip(join_all(handles).await) {
            match joined {
                Ok(report) => reports.push(report),
                Err(join_error) => {
                    warn!(task = unit.name(), error = %join_error, "task panicked");
                    reports.push(TaskReport::failure(
                        unit.name(),
                        1,
                        None,
                        format!("task panicked: {join_error}"),
                    ));
                }
            }
        }
        reports
    }
}

fn inject_feedback(payload: Value, feedback: Option<&str>) -> Value {
    let Some(feedback) = feedback else {
        return payload;
    };
    let message = format!(
        "VALIDATION ERROR: your previous output failed schema validation. {feedback}. \
         Output only valid JSON matching the schema, with no surrounding markup."
    );
    match payload {
        Value::Object(mut map) => {
            map.insert(VALIDATION_FEEDBACK_KEY.to_string(), json!(message));
            Value::Object(map)
        }
        other => json!({ "payload": other, VALIDATION_FEEDBACK_KEY: message }),
    }
}

//! Phase controller — the top-level state machine.
//!
//! Eight ordered phases drive a question from audit to adjudicated answer.
//! Two of them are bounded retry loops, one is a runtime-sized concurrent
//! fan-out. Failures inside a phase step are contained by catch-log-continue;
//! only the initial audit verdict can terminate the run early. Every phase
//! records itself in the workflow phase state before running, so a paused
//! invocation resumes at the most recently started phase without re-running
//! committed phases.

use crate::config::Config;
use crate::gate::Gate;
use crate::outputs::{
    AuditStatus, AuditVerdict, CoverageReport, PersonaAllocation, PersonaValidation,
    RobustnessMetrics,
};
use crate::registry;
use crate::retry::{BoundedLoop, LoopState, Verdict};
use crate::spawner::{self, PersonaTaskBuilder};
use crate::store::{WorkflowState, keys};
use crate::task::{TaskDriver, TaskReport, TaskUnit};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// The ordered pipeline phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    QuestionProcessing,
    PersonaAllocation,
    PersonaExecution,
    AnalysisAndSynthesis,
    TargetedResearch,
    Adjudication,
    CoverageValidation,
    FinalSynthesis,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::QuestionProcessing,
        Phase::PersonaAllocation,
        Phase::PersonaExecution,
        Phase::AnalysisAndSynthesis,
        Phase::TargetedResearch,
        Phase::Adjudication,
        Phase::CoverageValidation,
        Phase::FinalSynthesis,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::QuestionProcessing => "question_processing",
            Phase::PersonaAllocation => "persona_allocation",
            Phase::PersonaExecution => "persona_execution",
            Phase::AnalysisAndSynthesis => "analysis_and_synthesis",
            Phase::TargetedResearch => "targeted_research",
            Phase::Adjudication => "adjudication",
            Phase::CoverageValidation => "coverage_validation",
            Phase::FinalSynthesis => "final_synthesis",
        }
    }

    fn index(&self) -> usize {
        Self::ALL.iter().position(|p| p == self).unwrap_or(0)
    }
}

/// Controller-owned progress record, persisted at every phase entry to
/// support pause/resume at phase boundaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowPhaseState {
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub allocation_attempts: u32,
    #[serde(default)]
    pub coverage_attempts: u32,
    #[serde(default)]
    pub completed: bool,
}

/// The external task units the controller drives, one per pipeline role.
/// Task content is the caller's concern; the controller only sequences them.
pub struct PipelineTasks {
    pub question_audit: Arc<dyn TaskUnit>,
    pub question_analysis: Arc<dyn TaskUnit>,
    pub null_hypotheses: Arc<dyn TaskUnit>,
    pub evidence_gathering: Arc<dyn TaskUnit>,
    pub persona_allocator: Arc<dyn TaskUnit>,
    pub persona_validator: Arc<dyn TaskUnit>,
    pub evidence_consistency: Arc<dyn TaskUnit>,
    pub synthesis: Arc<dyn TaskUnit>,
    pub adversarial: Arc<dyn TaskUnit>,
    pub disagreement_map: Arc<dyn TaskUnit>,
    pub blindspot_map: Arc<dyn TaskUnit>,
    pub search_planner: Arc<dyn TaskUnit>,
    pub researcher: Arc<dyn TaskUnit>,
    pub evidence_adjudicator: Arc<dyn TaskUnit>,
    pub null_adjudicator: Arc<dyn TaskUnit>,
    pub case_file: Arc<dyn TaskUnit>,
    pub coverage_validator: Arc<dyn TaskUnit>,
    pub robustness: Arc<dyn TaskUnit>,
    pub quality_assurance: Arc<dyn TaskUnit>,
    pub final_arbiter: Arc<dyn TaskUnit>,
    pub persona_builder: Arc<dyn PersonaTaskBuilder>,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed {
        final_verdict: Option<Value>,
    },
    /// The audit gate refused the question; no later phase executed.
    Halted {
        audit_status: String,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        clarification: Option<String>,
    },
    Paused {
        phase: Phase,
    },
}

enum Flow {
    Continue,
    Halt(RunOutcome),
}

/// Build the structured halt payload for a non-proceed audit verdict.
fn halt_outcome(verdict: &AuditVerdict) -> RunOutcome {
    match verdict.audit_status {
        AuditStatus::RequestClarification => {
            let prompt = verdict
                .clarification_needed
                .clone()
                .unwrap_or_else(|| "Please clarify the question so the run can proceed.".to_string());
            RunOutcome::Halted {
                audit_status: "request_clarification".to_string(),
                reason: "Clarification required before the run can proceed.".to_string(),
                clarification: Some(prompt),
            }
        }
        _ => {
            let reason = verdict
                .proceed_justification
                .clone()
                .or_else(|| verdict.clarification_needed.clone())
                .unwrap_or_else(|| "Question blocked by audit gate.".to_string());
            RunOutcome::Halted {
                audit_status: "block".to_string(),
                reason,
                clarification: None,
            }
        }
    }
}

/// Drives the pipeline. Constructed with an explicit immutable configuration
/// value — there is no ambient global.
pub struct PhaseController {
    config: Config,
    state: Arc<WorkflowState>,
    tasks: PipelineTasks,
    run_id: Uuid,
}

impl PhaseController {
    pub fn new(config: Config, state: Arc<WorkflowState>, tasks: PipelineTasks) -> Self {
        Self {
            config,
            state,
            tasks,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Execute the pipeline for `question`. The pause token is checked at
    /// phase boundaries and after streamed task events; cancellation is
    /// cooperative and never preemptive.
    pub async fn run(&self, question: &str, pause: CancellationToken) -> RunOutcome {
        info!(run_id = %self.run_id, "starting deliberation run");
        self.state.initialize_defaults();
        if !self.state.contains(keys::QUESTION) {
            self.state.set(keys::QUESTION, json!(question));
        }

        let driver = TaskDriver::new(
            self.state.clone(),
            Arc::new(Gate::with_default_schemas()),
            self.config.retries.max_schema_retries,
            pause.clone(),
        );

        let mut phase_state = self.load_phase_state();
        if phase_state.completed {
            info!(run_id = %self.run_id, "run already completed, nothing to do");
            return RunOutcome::Completed {
                final_verdict: self.state.get(keys::FINAL_VERDICT),
            };
        }
        let resume_from = phase_state.phase.map(|p| p.index()).unwrap_or(0);
        if resume_from > 0 {
            info!(
                phase = Phase::ALL[resume_from].name(),
                "resuming at most recently started phase"
            );
        }

        for phase in &Phase::ALL[resume_from..] {
            if pause.is_cancelled() {
                info!(phase = phase.name(), "pause honored at phase boundary");
                return RunOutcome::Paused { phase: *phase };
            }

            phase_state.phase = Some(*phase);
            self.store_phase_state(&phase_state);
            info!(phase = phase.name(), "entering phase");

            let flow = match phase {
                Phase::QuestionProcessing => self.question_processing(&driver).await,
                Phase::PersonaAllocation => {
                    self.persona_allocation(&driver, &mut phase_state).await
                }
                Phase::PersonaExecution => self.persona_execution(&driver).await,
                Phase::AnalysisAndSynthesis => self.analysis_and_synthesis(&driver).await,
                Phase::TargetedResearch => self.targeted_research(&driver).await,
                Phase::Adjudication => self.adjudication(&driver).await,
                Phase::CoverageValidation => {
                    self.coverage_validation(&driver, &mut phase_state).await
                }
                Phase::FinalSynthesis => self.final_synthesis(&driver).await,
            };

            if let Flow::Halt(outcome) = flow {
                return outcome;
            }
        }

        phase_state.completed = true;
        self.store_phase_state(&phase_state);
        info!(run_id = %self.run_id, "deliberation run complete");
        RunOutcome::Completed {
            final_verdict: self.state.get(keys::FINAL_VERDICT),
        }
    }

    /// Phase 1: audit gate, then question analysis, null hypotheses and
    /// evidence gathering, sequentially.
    async fn question_processing(&self, driver: &TaskDriver) -> Flow {
        self.run_step(driver, &self.tasks.question_audit).await;

        match self.read_typed::<AuditVerdict>(keys::QUESTION_AUDIT) {
            Some(verdict) if verdict.audit_status != AuditStatus::Proceed => {
                warn!(status = ?verdict.audit_status, "audit gate halted the run");
                let outcome = halt_outcome(&verdict);
                let mut fields = Map::new();
                fields.insert("audit_status".to_string(), json!(verdict.audit_status));
                self.state.append_audit_event("run_halted", fields);
                return Flow::Halt(outcome);
            }
            Some(_) => {}
            None => warn!("no audit verdict found, proceeding"),
        }

        self.run_step(driver, &self.tasks.question_analysis).await;
        self.run_step(driver, &self.tasks.null_hypotheses).await;
        self.run_step(driver, &self.tasks.evidence_gathering).await;

        let facts = registry::all_facts(&self.state);
        info!(facts = facts.len(), "evidence gathering complete");
        if facts.is_empty() {
            warn!("no evidence registered during question processing");
        }
        Flow::Continue
    }

    /// Phase 2: allocate personas, validate diversity, retry to the ceiling.
    /// Exhaustion accepts the last allocation — fail-open, never an abort.
    async fn persona_allocation(
        &self,
        driver: &TaskDriver,
        phase_state: &mut WorkflowPhaseState,
    ) -> Flow {
        let max_attempts = self.config.retries.max_allocation_attempts;
        let mut looper = BoundedLoop::resume(max_attempts, phase_state.allocation_attempts);

        while !looper.state().is_terminal() {
            let attempt = looper.begin_attempt();
            phase_state.allocation_attempts = attempt;
            self.store_phase_state(phase_state);
            info!(attempt, max_attempts, "persona allocation attempt");

            self.run_step(driver, &self.tasks.persona_allocator).await;
            self.run_step(driver, &self.tasks.persona_validator).await;

            let verdict = match self.read_typed::<PersonaValidation>(keys::PERSONA_VALIDATION) {
                Some(validation) if validation.approved() => Verdict::Approved,
                Some(_) => Verdict::Rejected,
                None => {
                    warn!("no persona validation verdict found, proceeding");
                    Verdict::Missing
                }
            };

            match looper.observe(verdict) {
                LoopState::Accept { degraded } => {
                    if degraded {
                        warn!(
                            attempts = looper.attempt(),
                            "accepting last persona allocation without approval"
                        );
                    } else {
                        info!(attempts = looper.attempt(), "persona allocation approved");
                    }
                    let mut fields = Map::new();
                    fields.insert("attempts".to_string(), json!(looper.attempt()));
                    fields.insert("degraded".to_string(), json!(degraded));
                    self.state
                        .append_audit_event("persona_allocation_accepted", fields);
                }
                LoopState::Regenerate => {
                    info!("persona allocation rejected, regenerating");
                }
                _ => {}
            }
        }
        Flow::Continue
    }

    /// Phase 3: one independent task unit per approved persona, run as a
    /// single concurrent fan-out group against a read-only evidence
    /// snapshot. An absent or empty allocation degrades to a no-op.
    async fn persona_execution(&self, driver: &TaskDriver) -> Flow {
        let Some(allocation) = self.read_typed::<PersonaAllocation>(keys::PERSONA_ALLOCATION)
        else {
            warn!("no persona allocation found, skipping persona execution");
            return Flow::Continue;
        };
        if allocation.is_empty() {
            warn!("persona allocation is empty, skipping persona execution");
            return Flow::Continue;
        }

        let evidence = registry::all_facts(&self.state);
        info!(
            personas = allocation.personas.len(),
            facts = evidence.len(),
            "spawning persona fan-out group"
        );

        let units = spawner::spawn_units(
            &allocation.personas,
            &evidence,
            self.tasks.persona_builder.as_ref(),
        );
        let payload = self.question_payload();

        if self.config.optimization.parallel_personas {
            driver.run_group(&units, payload).await;
        } else {
            for unit in &units {
                driver.run_validated(unit.as_ref(), payload.clone()).await;
            }
        }

        let recorded = match self.state.get(keys::PERSONA_ANALYSES) {
            Some(Value::Array(entries)) => entries.len(),
            _ => 0,
        };
        info!(judgments = recorded, "persona execution complete");
        if recorded == 0 {
            warn!(
                expected = allocation.personas.len(),
                "no persona judgments recorded"
            );
        }
        Flow::Continue
    }

    /// Phase 4: consistency check, then synthesis + adversarial concurrently
    /// as one pair, then disagreement and blindspot mapping sequentially.
    async fn analysis_and_synthesis(&self, driver: &TaskDriver) -> Flow {
        self.run_step(driver, &self.tasks.evidence_consistency).await;

        let pair: Vec<Arc<dyn TaskUnit>> =
            vec![self.tasks.synthesis.clone(), self.tasks.adversarial.clone()];
        driver.run_group(&pair, self.question_payload()).await;

        self.run_step(driver, &self.tasks.disagreement_map).await;
        self.run_step(driver, &self.tasks.blindspot_map).await;
        Flow::Continue
    }

    /// Phase 5: search planning, then dual-track confirm/disconfirm research.
    async fn targeted_research(&self, driver: &TaskDriver) -> Flow {
        self.run_step(driver, &self.tasks.search_planner).await;
        self.run_step(driver, &self.tasks.researcher).await;
        info!(
            facts = registry::all_facts(&self.state).len(),
            "targeted research complete"
        );
        Flow::Continue
    }

    /// Phase 6: both adjudicators concurrently, then case-file compilation.
    async fn adjudication(&self, driver: &TaskDriver) -> Flow {
        let pair: Vec<Arc<dyn TaskUnit>> = vec![
            self.tasks.evidence_adjudicator.clone(),
            self.tasks.null_adjudicator.clone(),
        ];
        driver.run_group(&pair, self.question_payload()).await;

        self.run_step(driver, &self.tasks.case_file).await;
        Flow::Continue
    }

    /// Phase 7: validate case-file coverage against the fixed thresholds;
    /// regenerate the case file while attempts remain, then accept the last
    /// one regardless.
    async fn coverage_validation(
        &self,
        driver: &TaskDriver,
        phase_state: &mut WorkflowPhaseState,
    ) -> Flow {
        let max_attempts = self.config.retries.max_coverage_attempts;
        let mut looper = BoundedLoop::resume(max_attempts, phase_state.coverage_attempts);

        while !looper.state().is_terminal() {
            let attempt = looper.begin_attempt();
            phase_state.coverage_attempts = attempt;
            self.store_phase_state(phase_state);
            info!(attempt, max_attempts, "coverage validation attempt");

            self.run_step(driver, &self.tasks.coverage_validator).await;

            let verdict = match self.read_typed::<CoverageReport>(keys::COVERAGE_REPORT) {
                Some(report) => {
                    let meets = report.meets(&self.config.thresholds);
                    info!(
                        fact_preservation = report.fact_preservation_rate,
                        divergence = report.divergence_coverage,
                        null = report.null_coverage,
                        meets,
                        "coverage measured"
                    );
                    if meets { Verdict::Approved } else { Verdict::Rejected }
                }
                None => {
                    warn!("no coverage report found, proceeding");
                    Verdict::Missing
                }
            };

            match looper.observe(verdict) {
                LoopState::Regenerate => {
                    info!("coverage below thresholds, regenerating case file");
                    self.run_step(driver, &self.tasks.case_file).await;
                }
                LoopState::Accept { degraded } => {
                    if degraded {
                        warn!(
                            attempts = looper.attempt(),
                            "accepting case file despite coverage shortfall"
                        );
                    }
                    let mut fields = Map::new();
                    fields.insert("attempts".to_string(), json!(looper.attempt()));
                    fields.insert("degraded".to_string(), json!(degraded));
                    self.state.append_audit_event("case_file_accepted", fields);
                }
                _ => {}
            }
        }
        Flow::Continue
    }

    /// Phase 8: robustness, QA, then final arbitration. The controller only
    /// forwards the robustness ceiling; the arbiter's contract is to keep
    /// its confidence at or below it.
    async fn final_synthesis(&self, driver: &TaskDriver) -> Flow {
        self.run_step(driver, &self.tasks.robustness).await;
        self.run_step(driver, &self.tasks.quality_assurance).await;

        let ceiling = self
            .read_typed::<RobustnessMetrics>(keys::ROBUSTNESS_METRICS)
            .map(|metrics| metrics.confidence_ceiling);

        let mut payload = match self.question_payload() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Some(ceiling) = ceiling {
            payload.insert("confidence_ceiling".to_string(), json!(ceiling));
        }

        let report = driver
            .run_validated(self.tasks.final_arbiter.as_ref(), Value::Object(payload))
            .await;
        if let Some(error) = &report.error {
            warn!(error = %error, "final arbitration completed degraded");
        }
        Flow::Continue
    }

    async fn run_step(&self, driver: &TaskDriver, unit: &Arc<dyn TaskUnit>) -> TaskReport {
        let report = driver
            .run_validated(unit.as_ref(), self.question_payload())
            .await;
        if let Some(error) = &report.error {
            warn!(task = %report.task, error = %error, "phase step completed degraded");
        }
        report
    }

    fn question_payload(&self) -> Value {
        json!({ "question": self.state.get(keys::QUESTION).unwrap_or(Value::Null) })
    }

    /// Read a typed value from the store, tolerating string-encoded JSON.
    fn read_typed<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.state.get(key)?;
        let value = match value {
            Value::String(raw) => serde_json::from_str(&raw).ok()?,
            other => other,
        };
        serde_json::from_value(value).ok()
    }

    fn load_phase_state(&self) -> WorkflowPhaseState {
        self.read_typed(keys::WORKFLOW_PHASE).unwrap_or_default()
    }

    fn store_phase_state(&self, phase_state: &WorkflowPhaseState) {
        match serde_json::to_value(phase_state) {
            Ok(value) => self.state.set(keys::WORKFLOW_PHASE, value),
            Err(error) => warn!(%error, "failed to serialize workflow phase state"),
        }
    }
}

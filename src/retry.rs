//! Bounded validation-retry loop, modeled as an explicit state machine.
//!
//! Both controller loops (persona allocation, coverage validation) share the
//! same shape: Generate -> Validate -> {Accept | Regenerate}, with a hard
//! attempt ceiling. On exhaustion the loop accepts the last candidate and
//! marks the outcome degraded — fail-open by design, never a hard abort.
//! The transition function is pure, so the loop logic is testable without
//! ever invoking the expensive generate step.

use serde::{Deserialize, Serialize};

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Produce (or re-produce) a candidate.
    Generate,
    /// Candidate produced, awaiting a verdict.
    Validate,
    /// Terminal: candidate accepted. `degraded` is true when acceptance came
    /// from exhaustion or a missing verdict rather than approval.
    Accept { degraded: bool },
    /// Candidate rejected with attempts remaining.
    Regenerate,
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Accept { .. })
    }
}

/// Validator verdict on a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Rejected,
    /// No verdict was produced at all; the loop proceeds on the candidate it
    /// has, marked degraded.
    Missing,
}

/// Pure transition: what happens after `attempt` attempts (1-based) end with
/// `verdict`, given a ceiling of `max_attempts`.
pub fn transition(attempt: u32, max_attempts: u32, verdict: Verdict) -> LoopState {
    match verdict {
        Verdict::Approved => LoopState::Accept { degraded: false },
        Verdict::Missing => LoopState::Accept { degraded: true },
        Verdict::Rejected => {
            if attempt >= max_attempts {
                LoopState::Accept { degraded: true }
            } else {
                LoopState::Regenerate
            }
        }
    }
}

/// Driver-side bookkeeping for one bounded loop.
#[derive(Debug, Clone)]
pub struct BoundedLoop {
    max_attempts: u32,
    attempt: u32,
    state: LoopState,
}

impl BoundedLoop {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempt: 0,
            state: LoopState::Generate,
        }
    }

    /// Resume a loop that already spent `attempt` attempts.
    pub fn resume(max_attempts: u32, attempt: u32) -> Self {
        let state = if attempt >= max_attempts {
            LoopState::Accept { degraded: true }
        } else {
            LoopState::Generate
        };
        Self {
            max_attempts,
            attempt,
            state,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Start the next attempt. Returns the 1-based attempt number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.state = LoopState::Validate;
        self.attempt
    }

    /// Feed the validator's verdict through the transition function.
    pub fn observe(&mut self, verdict: Verdict) -> LoopState {
        self.state = transition(self.attempt, self.max_attempts, verdict);
        self.state
    }
}

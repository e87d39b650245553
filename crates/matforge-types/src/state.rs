use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PlannerConfig;
use crate::plan::{Plan, StepStatus};

/// Phase of the orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Assessing goal readiness and running prerequisite sub-tasks.
    PreCheck,
    /// Plan generation, normalization, and safety validation.
    Planning,
    /// Plan awaiting human confirmation.
    Preflight,
    /// Executing dependency-resolved windows.
    Executing,
    /// Revising the unresolved tail of the plan.
    Replanning,
    Completed,
    Failed,
    Aborted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::PreCheck => "pre_check",
            Phase::Planning => "planning",
            Phase::Preflight => "preflight",
            Phase::Executing => "executing",
            Phase::Replanning => "replanning",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Aborted => "aborted",
        }
    }
}

/// History entry for one processed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: u32,
    pub intent: String,
    pub status: StepStatus,
    pub summary: String,
    #[serde(default)]
    pub used_fallback: bool,
    #[serde(default)]
    pub was_skipped: bool,
    #[serde(default)]
    pub new_capability: bool,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// The whole persisted document for one run. Owned exclusively by the
/// orchestrator and saved after every phase transition so a crashed run
/// is resumable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub run_key: String,
    pub goal: String,
    /// Accumulated context folded in from prerequisite sub-tasks.
    #[serde(default)]
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub history: Vec<StepOutcome>,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_reason: Option<String>,
    #[serde(default)]
    pub replan_count: u32,
    #[serde(default)]
    pub replan_reasons: Vec<String>,
    /// Windows dispatched so far in this run.
    #[serde(default)]
    pub window_cursor: u32,
    pub config: PlannerConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrchestratorState {
    pub fn new(goal: impl Into<String>, config: PlannerConfig) -> Self {
        let now = Utc::now();
        Self {
            run_key: uuid::Uuid::new_v4().to_string(),
            goal: goal.into(),
            context: String::new(),
            plan: None,
            history: Vec::new(),
            phase: Phase::PreCheck,
            phase_reason: None,
            replan_count: 0,
            replan_reasons: Vec::new(),
            window_cursor: 0,
            config,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Terminal report for a run. Enumerates every failed and skipped step
/// and every approximation used; success is never reported silently
/// over failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub run_key: String,
    pub outcome: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(default)]
    pub failed_steps: Vec<StepOutcome>,
    #[serde(default)]
    pub skipped_steps: Vec<StepOutcome>,
    /// Fallbacks and other degradations applied during the run.
    #[serde(default)]
    pub approximations: Vec<String>,
    pub replan_count: u32,
    #[serde(default)]
    pub replan_reasons: Vec<String>,
    /// Jobs still outstanding when the run ended.
    #[serde(default)]
    pub pending_jobs: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phase_classification() {
        assert!(Phase::Completed.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(Phase::Aborted.is_terminal());
        assert!(!Phase::Executing.is_terminal());
        assert!(!Phase::Replanning.is_terminal());
    }

    #[test]
    fn state_roundtrips_through_json() {
        let state = OrchestratorState::new("compute band gap of Si", PlannerConfig::default());
        let raw = serde_json::to_string(&state).expect("serialize");
        let back: OrchestratorState = serde_json::from_str(&raw).expect("parse");
        assert_eq!(back.run_key, state.run_key);
        assert_eq!(back.phase, Phase::PreCheck);
        assert!(back.plan.is_none());
    }
}

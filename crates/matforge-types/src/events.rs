use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::Phase;

/// Append-only event stream for one run, mirrored to the UI channel and
/// the on-disk events log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlannerEvent {
    RunCreated {
        run_key: String,
        goal: String,
        timestamp: DateTime<Utc>,
    },
    PhaseChanged {
        run_key: String,
        phase: Phase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    PlanGenerated {
        run_key: String,
        plan_id: String,
        step_count: usize,
        timestamp: DateTime<Utc>,
    },
    PlanRedirected {
        run_key: String,
        redirected_steps: Vec<u32>,
        timestamp: DateTime<Utc>,
    },
    PreflightDecision {
        run_key: String,
        answer: String,
        timestamp: DateTime<Utc>,
    },
    WindowDispatched {
        run_key: String,
        window_index: u32,
        step_ids: Vec<u32>,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        run_key: String,
        step_id: u32,
        passed: bool,
        used_fallback: bool,
        timestamp: DateTime<Utc>,
    },
    StepSkipped {
        run_key: String,
        step_id: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    ReplanTriggered {
        run_key: String,
        reason: String,
        replan_count: u32,
        timestamp: DateTime<Utc>,
    },
    HumanPromptIssued {
        run_key: String,
        prompt: String,
        default_answer: String,
        timestamp: DateTime<Utc>,
    },
    HumanPromptAnswered {
        run_key: String,
        answer: String,
        timed_out: bool,
        timestamp: DateTime<Utc>,
    },
    JobRegistered {
        run_key: String,
        job_id: String,
        source: String,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        run_key: String,
        timestamp: DateTime<Utc>,
    },
    RunFailed {
        run_key: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    RunAborted {
        run_key: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

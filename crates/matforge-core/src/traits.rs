use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use matforge_types::{Plan, StepOutcome};

/// Plan generation result. Malformed generator output must surface as
/// `Refused` with a reason, never as a panic or a bare error string
/// swallowed by the caller.
#[derive(Debug, Clone)]
pub enum PlanOutcome {
    Plan(Plan),
    Refused { reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub ready: bool,
    /// Sub-task intents to run before planning when not ready.
    #[serde(default)]
    pub prerequisites: Vec<String>,
}

/// Produces and revises research plans. Usually backed by an LLM; the
/// orchestrator treats it as a black box that may refuse.
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn assess_readiness(
        &self,
        goal: &str,
        workspace_listing: &str,
    ) -> anyhow::Result<ReadinessReport>;

    async fn generate(&self, goal: &str, context: &str) -> anyhow::Result<PlanOutcome>;

    async fn revise(
        &self,
        goal: &str,
        current: &Plan,
        feedback: &str,
    ) -> anyhow::Result<PlanOutcome>;
}

/// A job handed to an external compute service during step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedJob {
    pub job_id: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
}

/// What a step executor reports back for one intent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepReport {
    pub passed: bool,
    pub summary: String,
    #[serde(default)]
    pub new_capability_registered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_ref: Option<String>,
    #[serde(default)]
    pub replan_requested: bool,
    #[serde(default)]
    pub submitted_jobs: Vec<SubmittedJob>,
}

impl StepReport {
    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            passed: false,
            summary: summary.into(),
            ..Self::default()
        }
    }
}

/// Executes one normal step intent.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn run(&self, intent: &str, fallback_hint: Option<&str>) -> anyhow::Result<StepReport>;
}

/// Executes capability-evolution steps (building a new tool or workflow
/// the remaining plan can use).
#[async_trait]
pub trait CapabilityBuilder: Send + Sync {
    async fn run(&self, intent: &str) -> anyhow::Result<StepReport>;
}

/// One bounded question to a human operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanPrompt {
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    pub default_answer: String,
    pub timeout_secs: u64,
}

/// Request/response channel to a human. The orchestrator enforces the
/// timeout itself; implementations may block as long as they like.
#[async_trait]
pub trait HumanGate: Send + Sync {
    async fn ask(&self, prompt: &HumanPrompt) -> anyhow::Result<String>;
}

/// Optional post-step check asking whether the remaining plan still
/// makes sense given the latest result. Off by default since it adds a
/// generator round-trip per step.
#[async_trait]
pub trait ReplanHeuristic: Send + Sync {
    async fn should_replan(
        &self,
        goal: &str,
        plan: &Plan,
        latest: &StepOutcome,
    ) -> anyhow::Result<bool>;
}

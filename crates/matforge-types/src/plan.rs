use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Refused,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[default]
    Normal,
    CapabilityEvolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComputeCost {
    #[default]
    Low,
    Medium,
    High,
}

/// State of a step in the plan DAG.
///
/// A skipped step is marked `Done` so dependents still resolve; the
/// separate [`Step::was_skipped`] flag keeps reporting accurate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Done,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConditionalBranch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<u32>,
}

/// One unit of work in a plan, with dependencies and a fallback strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: u32,
    #[serde(default)]
    pub kind: StepKind,
    pub intent: String,
    #[serde(default)]
    pub compute_cost: ComputeCost,
    #[serde(default)]
    pub requires_human_confirm: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub was_skipped: bool,
    /// IDs of steps that must complete before this one. Must reference
    /// strictly smaller step ids already present in the plan.
    #[serde(default)]
    pub depends_on: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional_branch: Option<ConditionalBranch>,
}

impl Step {
    pub fn new(step_id: u32, intent: impl Into<String>) -> Self {
        Self {
            step_id,
            kind: StepKind::Normal,
            intent: intent.into(),
            compute_cost: ComputeCost::Low,
            requires_human_confirm: false,
            fallback: None,
            status: StepStatus::Pending,
            was_skipped: false,
            depends_on: Vec::new(),
            conditional_branch: None,
        }
    }
}

/// The dependency-graph plan produced for a goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub status: PlanStatus,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fidelity_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
}

impl Plan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            plan_id: uuid::Uuid::new_v4().to_string(),
            status: PlanStatus::Draft,
            steps,
            fidelity_level: None,
            report: None,
        }
    }

    pub fn step(&self, step_id: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: u32) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    pub fn max_step_id(&self) -> u32 {
        self.steps.iter().map(|s| s.step_id).max().unwrap_or(0)
    }
}

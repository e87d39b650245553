use serde::{Deserialize, Serialize};

/// Shared rate limit for step dispatch (calls per second plus burst).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub per_sec: f64,
    pub burst: f64,
}

/// Configuration for one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Maximum steps dispatched together in one execution window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Replans allowed before escalating to a human decision.
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
    /// Automatic fix-and-resubmit rounds for a refused/malformed plan.
    #[serde(default = "default_max_plan_fix_rounds")]
    pub max_plan_fix_rounds: u32,
    /// Human confirmation wait for the pre-flight gate; on timeout the
    /// default answer is "go".
    #[serde(default = "default_human_timeout_secs")]
    pub preflight_timeout_secs: u64,
    /// Wait for all other human prompts; each prompt documents its own
    /// default answer.
    #[serde(default = "default_human_timeout_secs")]
    pub human_timeout_secs: u64,
    /// Optional shared rate limit applied to window dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<RateLimit>,
    /// Unknown status polls tolerated before a job is marked
    /// unknown_timeout.
    #[serde(default = "default_max_unknown_polls")]
    pub max_unknown_polls: u32,
    /// Interval between job registry refreshes while draining.
    #[serde(default = "default_job_poll_interval_ms")]
    pub job_poll_interval_ms: u64,
    /// Upper bound on waiting for outstanding jobs at run end; past it
    /// the pending set is recorded as an approximation.
    #[serde(default = "default_max_job_drain_secs")]
    pub max_job_drain_secs: u64,
    /// Whether the pluggable replan heuristic is consulted after each
    /// step result.
    #[serde(default)]
    pub heuristic_check_enabled: bool,
}

fn default_window_size() -> usize {
    4
}

fn default_max_replans() -> u32 {
    3
}

fn default_max_plan_fix_rounds() -> u32 {
    2
}

fn default_human_timeout_secs() -> u64 {
    120
}

fn default_max_unknown_polls() -> u32 {
    3
}

fn default_job_poll_interval_ms() -> u64 {
    500
}

fn default_max_job_drain_secs() -> u64 {
    300
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            max_replans: default_max_replans(),
            max_plan_fix_rounds: default_max_plan_fix_rounds(),
            preflight_timeout_secs: default_human_timeout_secs(),
            human_timeout_secs: default_human_timeout_secs(),
            rate: None,
            max_unknown_polls: default_max_unknown_polls(),
            job_poll_interval_ms: default_job_poll_interval_ms(),
            max_job_drain_secs: default_max_job_drain_secs(),
            heuristic_check_enabled: false,
        }
    }
}

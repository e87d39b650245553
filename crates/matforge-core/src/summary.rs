use std::fmt::Write as _;

use chrono::Utc;

use matforge_types::{ExecutionSummary, OrchestratorState, StepStatus};

/// Roll the run state up into its terminal report. Failed and skipped
/// steps are always enumerated; success is never reported over them.
pub fn build_summary(
    state: &OrchestratorState,
    approximations: Vec<String>,
    pending_jobs: Vec<String>,
) -> ExecutionSummary {
    let failed_steps: Vec<_> = state
        .history
        .iter()
        .filter(|o| o.status == StepStatus::Failed)
        .cloned()
        .collect();
    let skipped_steps: Vec<_> = state
        .history
        .iter()
        .filter(|o| o.was_skipped)
        .cloned()
        .collect();
    let completed = state
        .history
        .iter()
        .filter(|o| o.status == StepStatus::Done && !o.was_skipped)
        .count();

    let mut approximations = approximations;
    for outcome in &state.history {
        if outcome.used_fallback {
            approximations.push(format!(
                "step {} used its fallback strategy",
                outcome.step_id
            ));
        }
    }

    ExecutionSummary {
        run_key: state.run_key.clone(),
        outcome: state.phase,
        reason: state.phase_reason.clone(),
        completed,
        failed: failed_steps.len(),
        skipped: skipped_steps.len(),
        failed_steps,
        skipped_steps,
        approximations,
        replan_count: state.replan_count,
        replan_reasons: state.replan_reasons.clone(),
        pending_jobs,
        finished_at: Utc::now(),
    }
}

pub fn render_markdown(summary: &ExecutionSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Run {}", summary.run_key);
    let _ = writeln!(out, "\n**Outcome:** {}", summary.outcome.as_str());
    if let Some(reason) = &summary.reason {
        let _ = writeln!(out, "\n**Reason:** {}", reason);
    }
    let _ = writeln!(
        out,
        "\n{} completed, {} failed, {} skipped, {} replan(s)",
        summary.completed, summary.failed, summary.skipped, summary.replan_count
    );

    if !summary.failed_steps.is_empty() {
        let _ = writeln!(out, "\n## Failed steps");
        for step in &summary.failed_steps {
            let _ = writeln!(out, "- step {}: {} — {}", step.step_id, step.intent, step.summary);
        }
    }
    if !summary.skipped_steps.is_empty() {
        let _ = writeln!(out, "\n## Skipped steps");
        for step in &summary.skipped_steps {
            let _ = writeln!(out, "- step {}: {}", step.step_id, step.intent);
        }
    }
    if !summary.approximations.is_empty() {
        let _ = writeln!(out, "\n## Approximations");
        for item in &summary.approximations {
            let _ = writeln!(out, "- {}", item);
        }
    }
    if !summary.replan_reasons.is_empty() {
        let _ = writeln!(out, "\n## Replans");
        for reason in &summary.replan_reasons {
            let _ = writeln!(out, "- {}", reason);
        }
    }
    if !summary.pending_jobs.is_empty() {
        let _ = writeln!(out, "\n## Jobs still pending at exit");
        for job in &summary.pending_jobs {
            let _ = writeln!(out, "- {}", job);
        }
    }
    out
}

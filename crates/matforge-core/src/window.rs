use std::collections::{HashMap, HashSet};

use matforge_types::{Plan, StepStatus};

use crate::error::{PlannerError, Result};

/// Structural checks on a candidate plan before it is accepted.
///
/// Dependencies must reference existing, strictly smaller step ids;
/// that rule makes self-references and cycles impossible by
/// construction, so revised plans stay schedulable.
pub fn validate_graph(plan: &Plan) -> Result<()> {
    if plan.steps.is_empty() {
        return Err(PlannerError::Validation("plan has no steps".to_string()));
    }

    let mut seen: HashSet<u32> = HashSet::new();
    for step in &plan.steps {
        if !seen.insert(step.step_id) {
            return Err(PlannerError::Validation(format!(
                "duplicate step id {}",
                step.step_id
            )));
        }
    }

    for step in &plan.steps {
        for dep in &step.depends_on {
            if !seen.contains(dep) {
                return Err(PlannerError::Validation(format!(
                    "step {} depends on unknown step {}",
                    step.step_id, dep
                )));
            }
            if *dep >= step.step_id {
                return Err(PlannerError::Validation(format!(
                    "step {} depends on step {}, which would cycle or run later",
                    step.step_id, dep
                )));
            }
        }
    }

    Ok(())
}

/// Next batch of runnable step ids, in step-id order, capped at
/// `window_size`. A step is runnable once every dependency is Done;
/// a failed dependency never unblocks its dependents.
pub fn next_window(plan: &Plan, window_size: usize) -> Vec<u32> {
    let status_by_id: HashMap<u32, StepStatus> =
        plan.steps.iter().map(|s| (s.step_id, s.status)).collect();

    let mut window: Vec<u32> = plan
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .filter(|s| {
            s.depends_on
                .iter()
                .all(|dep| status_by_id.get(dep) == Some(&StepStatus::Done))
        })
        .map(|s| s.step_id)
        .collect();
    window.sort_unstable();
    window.truncate(window_size.max(1));
    window
}

pub fn all_resolved(plan: &Plan) -> bool {
    plan.steps.iter().all(|s| s.status.is_terminal())
}

pub fn unresolved_ids(plan: &Plan) -> Vec<u32> {
    let mut ids: Vec<u32> = plan
        .steps
        .iter()
        .filter(|s| !s.status.is_terminal())
        .map(|s| s.step_id)
        .collect();
    ids.sort_unstable();
    ids
}

/// True when pending steps remain but none can ever become runnable.
pub fn has_deadlock(plan: &Plan) -> bool {
    !all_resolved(plan) && next_window(plan, usize::MAX).is_empty()
}

/// Fold a revised plan into the current one: every step that already
/// reached a terminal status is preserved verbatim, and the revision's
/// steps are appended with fresh monotonic ids so history stays stable.
///
/// Revision-internal dependencies are remapped to the fresh ids;
/// dependencies on preserved steps are kept as-is.
pub fn merge_revision(current: &Plan, revision: Plan) -> Plan {
    let mut merged = current.clone();
    merged.steps.retain(|s| s.status.is_terminal());
    merged.fidelity_level = revision.fidelity_level.or(merged.fidelity_level.take());

    let kept_ids: HashSet<u32> = merged.steps.iter().map(|s| s.step_id).collect();
    let mut next_id = current.max_step_id() + 1;
    let mut remap: HashMap<u32, u32> = HashMap::new();

    for mut step in revision.steps {
        let new_id = if kept_ids.contains(&step.step_id) || remap.values().any(|v| *v == step.step_id)
        {
            let id = next_id;
            next_id += 1;
            id
        } else {
            next_id = next_id.max(step.step_id + 1);
            step.step_id
        };
        remap.insert(step.step_id, new_id);
        step.step_id = new_id;
        step.status = StepStatus::Pending;
        step.was_skipped = false;
        for dep in &mut step.depends_on {
            if let Some(mapped) = remap.get(dep) {
                *dep = *mapped;
            }
        }
        merged.steps.push(step);
    }

    merged.steps.sort_by_key(|s| s.step_id);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use matforge_types::Step;

    fn step(id: u32, deps: &[u32]) -> Step {
        let mut s = Step::new(id, format!("step {}", id));
        s.depends_on = deps.to_vec();
        s
    }

    #[test]
    fn validation_rejects_structural_problems() {
        assert!(validate_graph(&Plan::new(vec![])).is_err());
        assert!(validate_graph(&Plan::new(vec![step(1, &[]), step(1, &[])])).is_err());
        assert!(validate_graph(&Plan::new(vec![step(1, &[7])])).is_err());
        assert!(validate_graph(&Plan::new(vec![step(1, &[1])])).is_err());
        assert!(validate_graph(&Plan::new(vec![step(1, &[2]), step(2, &[])])).is_err());
        assert!(validate_graph(&Plan::new(vec![step(1, &[]), step(2, &[1])])).is_ok());
    }

    #[test]
    fn window_respects_dependencies_and_size() {
        let mut plan = Plan::new(vec![
            step(1, &[]),
            step(2, &[]),
            step(3, &[1, 2]),
            step(4, &[]),
        ]);
        assert_eq!(next_window(&plan, 2), vec![1, 2]);

        plan.step_mut(1).expect("step").status = StepStatus::Done;
        plan.step_mut(2).expect("step").status = StepStatus::Done;
        assert_eq!(next_window(&plan, 4), vec![3, 4]);
    }

    #[test]
    fn failed_dependency_blocks_dependents_forever() {
        let mut plan = Plan::new(vec![step(1, &[]), step(2, &[1])]);
        plan.step_mut(1).expect("step").status = StepStatus::Failed;
        assert!(next_window(&plan, 4).is_empty());
        assert!(!all_resolved(&plan));
        assert!(has_deadlock(&plan));
        assert_eq!(unresolved_ids(&plan), vec![2]);
    }

    #[test]
    fn merge_preserves_terminal_steps_and_renumbers_the_rest() {
        let mut current = Plan::new(vec![step(1, &[]), step(2, &[1]), step(3, &[2])]);
        current.step_mut(1).expect("step").status = StepStatus::Done;
        current.step_mut(2).expect("step").status = StepStatus::Failed;

        // Revision reuses ids 1 and 2 for brand new work.
        let revision = Plan::new(vec![step(1, &[]), step(2, &[1])]);
        let merged = merge_revision(&current, revision);

        let ids: Vec<u32> = merged.steps.iter().map(|s| s.step_id).collect();
        assert_eq!(ids, vec![1, 2, 4, 5]);
        assert_eq!(merged.step(1).expect("step").status, StepStatus::Done);
        assert_eq!(merged.step(2).expect("step").status, StepStatus::Failed);
        assert_eq!(merged.step(4).expect("step").status, StepStatus::Pending);
        // Internal dependency followed the renumbering.
        assert_eq!(merged.step(5).expect("step").depends_on, vec![4]);
        assert!(validate_graph(&merged).is_ok());
    }

    #[test]
    fn merge_keeps_nonconflicting_revision_ids() {
        let mut current = Plan::new(vec![step(1, &[])]);
        current.step_mut(1).expect("step").status = StepStatus::Done;
        let revision = Plan::new(vec![step(2, &[1]), step(3, &[2])]);
        let merged = merge_revision(&current, revision);
        let ids: Vec<u32> = merged.steps.iter().map(|s| s.step_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(validate_graph(&merged).is_ok());
    }
}

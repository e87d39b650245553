use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use matforge_jobs::{JobRegistry, ResultFetcher, StatusPoller};
use matforge_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use matforge_safety::{ResourcePolicy, SafetyValidator};
use matforge_scheduler::{BatchExecutor, BatchTask};
use matforge_types::{
    ExecutionSummary, OrchestratorState, Phase, Plan, PlanStatus, PlannerConfig, PlannerEvent,
    Step, StepKind, StepOutcome, StepStatus,
};

use crate::error::{PlannerError, Result};
use crate::store::PlanStore;
use crate::summary::{build_summary, render_markdown};
use crate::traits::{
    CapabilityBuilder, HumanGate, HumanPrompt, PlanGenerator, PlanOutcome, ReplanHeuristic,
    StepExecutor, StepReport,
};
use crate::window::{has_deadlock, merge_revision, next_window, unresolved_ids, validate_graph};

/// Cap on workspace entries folded into the readiness prompt.
const LISTING_LIMIT: usize = 200;

/// Everything the orchestrator core delegates to surrounding code.
pub struct Collaborators {
    pub generator: Arc<dyn PlanGenerator>,
    pub executor: Arc<dyn StepExecutor>,
    pub capability_builder: Arc<dyn CapabilityBuilder>,
    pub human: Arc<dyn HumanGate>,
    pub heuristic: Option<Arc<dyn ReplanHeuristic>>,
    pub poller: Arc<dyn StatusPoller>,
    pub fetcher: Arc<dyn ResultFetcher>,
}

struct StepRunRecord {
    report: StepReport,
    used_fallback: bool,
}

/// The orchestrator state machine for one research run.
///
/// Single-threaded at the phase level: one phase executes at a time and
/// the plan is mutated only here. Concurrency lives inside the batch
/// executor, whose workers get read-only step snapshots and hand
/// results back for in-order post-processing.
pub struct ResearchPlanner {
    state: OrchestratorState,
    store: Arc<PlanStore>,
    collaborators: Collaborators,
    validator: SafetyValidator,
    jobs: Arc<JobRegistry>,
    batch: BatchExecutor,
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedSender<PlannerEvent>>,
    approximations: Vec<String>,
}

impl ResearchPlanner {
    pub fn new(
        goal: impl Into<String>,
        config: PlannerConfig,
        policy: ResourcePolicy,
        collaborators: Collaborators,
        store: Arc<PlanStore>,
    ) -> Result<Self> {
        let state = OrchestratorState::new(goal, config);
        Self::from_state(state, policy, collaborators, store)
    }

    /// Pick up a previously persisted run where it left off.
    pub fn resume(
        run_key: &str,
        policy: ResourcePolicy,
        collaborators: Collaborators,
        store: Arc<PlanStore>,
    ) -> Result<Self> {
        let state = store.load_state(run_key)?.ok_or_else(|| {
            PlannerError::InvalidOperation(format!("no persisted run with key {}", run_key))
        })?;
        Self::from_state(state, policy, collaborators, store)
    }

    fn from_state(
        state: OrchestratorState,
        policy: ResourcePolicy,
        collaborators: Collaborators,
        store: Arc<PlanStore>,
    ) -> Result<Self> {
        let mut batch = BatchExecutor::new(state.config.window_size);
        if let Some(rate) = state.config.rate {
            batch = batch
                .with_rate_limit(rate.per_sec, rate.burst)
                .map_err(|err| PlannerError::InvalidOperation(format!("{:#}", err)))?;
        }
        let jobs = Arc::new(JobRegistry::new(
            Arc::clone(&collaborators.poller),
            Arc::clone(&collaborators.fetcher),
            state.config.max_unknown_polls,
        ));
        Ok(Self {
            state,
            store,
            collaborators,
            validator: SafetyValidator::new(policy),
            jobs,
            batch,
            cancel: CancellationToken::new(),
            events: None,
            approximations: Vec::new(),
        })
    }

    /// Mirror the run's event stream to this channel in addition to the
    /// on-disk log.
    pub fn with_event_sink(mut self, sink: mpsc::UnboundedSender<PlannerEvent>) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn run_key(&self) -> &str {
        &self.state.run_key
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    pub fn job_registry(&self) -> Arc<JobRegistry> {
        Arc::clone(&self.jobs)
    }

    /// Drive the run to a terminal phase and return its summary.
    pub async fn run(&mut self) -> Result<ExecutionSummary> {
        if self.state.phase.is_terminal() {
            return Err(PlannerError::InvalidOperation(format!(
                "run {} already finished as {}",
                self.state.run_key,
                self.state.phase.as_str()
            )));
        }

        self.store.save_state(&self.state)?;
        self.emit(PlannerEvent::RunCreated {
            run_key: self.state.run_key.clone(),
            goal: self.state.goal.clone(),
            timestamp: Utc::now(),
        });
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run_started",
                component: "orchestrator",
                run_key: Some(&self.state.run_key),
                step_id: None,
                job_id: None,
                phase: Some(self.state.phase.as_str()),
                status: None,
                error_code: None,
                detail: Some(&redact_text(&self.state.goal)),
            },
        );

        while !self.state.phase.is_terminal() {
            if self.cancel.is_cancelled() {
                self.transition(Phase::Aborted, Some("cancellation requested".to_string()))?;
                break;
            }
            match self.state.phase {
                Phase::PreCheck => self.run_pre_check().await?,
                Phase::Planning => self.run_planning().await?,
                Phase::Preflight => self.run_preflight().await?,
                Phase::Executing => self.run_executing().await?,
                Phase::Replanning => self.run_replanning().await?,
                Phase::Completed | Phase::Failed | Phase::Aborted => break,
            }
        }

        self.finalize().await
    }

    // ---- phases -------------------------------------------------------

    async fn run_pre_check(&mut self) -> Result<()> {
        let listing = self.store.workspace_listing(LISTING_LIMIT);
        let readiness = match self
            .collaborators
            .generator
            .assess_readiness(&self.state.goal, &listing)
            .await
        {
            Ok(report) => report,
            Err(err) => {
                tracing::warn!(
                    run_key = %self.state.run_key,
                    "readiness assessment unavailable, planning anyway: {:#}",
                    err
                );
                crate::traits::ReadinessReport {
                    ready: true,
                    prerequisites: Vec::new(),
                }
            }
        };

        if !readiness.ready {
            for prerequisite in readiness.prerequisites {
                tracing::info!(run_key = %self.state.run_key, intent = %prerequisite, "running prerequisite");
                match self.collaborators.executor.run(&prerequisite, None).await {
                    Ok(report) => {
                        self.register_jobs(&report.submitted_jobs).await;
                        let _ = writeln!(
                            self.state.context,
                            "prerequisite `{}`: {}",
                            prerequisite, report.summary
                        );
                    }
                    Err(err) => {
                        tracing::warn!(intent = %prerequisite, "prerequisite failed: {:#}", err);
                        let _ = writeln!(
                            self.state.context,
                            "prerequisite `{}` failed: {:#}",
                            prerequisite, err
                        );
                    }
                }
            }
        }

        self.transition(Phase::Planning, None)
    }

    async fn run_planning(&mut self) -> Result<()> {
        let fix_rounds = self.state.config.max_plan_fix_rounds;
        let mut refusal: Option<String> = None;

        for attempt in 0..=fix_rounds {
            let context = match &refusal {
                None => self.state.context.clone(),
                Some(reason) => format!(
                    "{}\n\nThe previous plan was rejected: {}\nPlease fix and resubmit.",
                    self.state.context, reason
                ),
            };

            let outcome = self
                .collaborators
                .generator
                .generate(&self.state.goal, &context)
                .await;

            let reason = match outcome {
                Ok(PlanOutcome::Plan(plan)) => match self.accept_plan(plan) {
                    Ok(()) => return self.transition(Phase::Preflight, None),
                    Err(PlannerError::Validation(reason))
                    | Err(PlannerError::Refused(reason)) => reason,
                    Err(other) => return Err(other),
                },
                Ok(PlanOutcome::Refused { reason }) => reason,
                Err(err) => format!("generator error: {:#}", err),
            };

            tracing::warn!(
                run_key = %self.state.run_key,
                attempt,
                "plan attempt rejected: {}",
                reason
            );
            refusal = Some(reason);
        }

        let reason = format!(
            "plan refused after {} fix round(s): {}",
            fix_rounds,
            refusal.unwrap_or_default()
        );
        self.transition(Phase::Failed, Some(reason))
    }

    async fn run_preflight(&mut self) -> Result<()> {
        let plan = self.require_plan()?;
        let question = format!(
            "Execute this plan?\n{}\nReply 'go' to start, 'abort' to cancel, or describe changes.",
            render_plan_brief(plan)
        );
        let prompt = HumanPrompt {
            question,
            options: vec!["go".to_string(), "abort".to_string()],
            default_answer: "go".to_string(),
            timeout_secs: self.state.config.preflight_timeout_secs,
        };
        let (answer, _) = self.ask_human(prompt).await;
        self.emit(PlannerEvent::PreflightDecision {
            run_key: self.state.run_key.clone(),
            answer: answer.clone(),
            timestamp: Utc::now(),
        });

        match answer.trim().to_ascii_lowercase().as_str() {
            "" | "go" | "yes" | "y" => self.transition(Phase::Executing, None),
            "abort" | "no" | "stop" => {
                self.transition(Phase::Aborted, Some("aborted at preflight".to_string()))
            }
            _ => {
                let current = self.require_plan()?.clone();
                let outcome = self
                    .collaborators
                    .generator
                    .revise(&self.state.goal, &current, &answer)
                    .await;
                match outcome {
                    Ok(PlanOutcome::Plan(revised)) => match self.accept_plan(revised) {
                        // Still in preflight; the new plan gets its own gate.
                        Ok(()) => Ok(()),
                        Err(PlannerError::Validation(reason))
                        | Err(PlannerError::Refused(reason)) => self.transition(
                            Phase::Failed,
                            Some(format!("preflight revision invalid: {}", reason)),
                        ),
                        Err(other) => Err(other),
                    },
                    Ok(PlanOutcome::Refused { reason }) => self.transition(
                        Phase::Failed,
                        Some(format!("preflight revision refused: {}", reason)),
                    ),
                    Err(err) => self.transition(
                        Phase::Failed,
                        Some(format!("preflight revision failed: {:#}", err)),
                    ),
                }
            }
        }
    }

    async fn run_executing(&mut self) -> Result<()> {
        // Workers get owned snapshots; only this thread writes the plan.
        let snapshots: Vec<Step> = {
            let plan = self.require_plan()?;
            if has_deadlock(plan) {
                let reason = format!(
                    "dependency deadlock: steps {:?} can never run because a dependency failed",
                    unresolved_ids(plan)
                );
                return self.transition(Phase::Failed, Some(reason));
            }
            let window = next_window(plan, self.state.config.window_size);
            if window.is_empty() {
                self.drain_jobs().await;
                return self.transition(Phase::Completed, None);
            }
            window
                .iter()
                .filter_map(|id| plan.step(*id).cloned())
                .collect()
        };

        if self.cancel.is_cancelled() {
            return self.transition(
                Phase::Aborted,
                Some("cancellation requested before window dispatch".to_string()),
            );
        }

        // Steps flagged for confirmation get their own gate before the
        // window is dispatched. A skip is an operator decision, not a
        // failure, so it resolves the step for its dependents.
        let mut confirmed: Vec<Step> = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            if snapshot.requires_human_confirm {
                let prompt = HumanPrompt {
                    question: format!(
                        "Step {} requires confirmation before it runs: {}. \
                         Reply 'go', 'skip', or 'abort'.",
                        snapshot.step_id, snapshot.intent
                    ),
                    options: vec![
                        "go".to_string(),
                        "skip".to_string(),
                        "abort".to_string(),
                    ],
                    default_answer: "go".to_string(),
                    timeout_secs: self.state.config.human_timeout_secs,
                };
                let (answer, _) = self.ask_human(prompt).await;
                match answer.trim().to_ascii_lowercase().as_str() {
                    "abort" | "stop" => {
                        return self.transition(
                            Phase::Aborted,
                            Some(format!(
                                "operator aborted at confirmation of step {}",
                                snapshot.step_id
                            )),
                        )
                    }
                    "skip" | "no" => {
                        self.mark_skipped(
                            snapshot.step_id,
                            "skipped by operator at confirmation".to_string(),
                        );
                        continue;
                    }
                    _ => {}
                }
            }
            confirmed.push(snapshot);
        }
        if confirmed.is_empty() {
            // Everything in the window was skipped; recompute from the
            // updated plan on the next pass.
            self.state.updated_at = Utc::now();
            self.store.save_state(&self.state)?;
            return Ok(());
        }
        let snapshots = confirmed;
        let window: Vec<u32> = snapshots.iter().map(|s| s.step_id).collect();

        self.state.window_cursor += 1;
        self.emit(PlannerEvent::WindowDispatched {
            run_key: self.state.run_key.clone(),
            window_index: self.state.window_cursor,
            step_ids: window.clone(),
            timestamp: Utc::now(),
        });
        let tasks: Vec<BatchTask<StepRunRecord>> = snapshots
            .iter()
            .map(|step| {
                let step = step.clone();
                let executor = Arc::clone(&self.collaborators.executor);
                let builder = Arc::clone(&self.collaborators.capability_builder);
                BatchTask::new(step.step_id.to_string(), run_step(step, executor, builder))
            })
            .collect();
        let reports = self.batch.execute_batch(tasks).await;

        // Post-processing happens in window order, not completion order,
        // so branch skips and replan triggers are deterministic.
        let mut replan_reason: Option<String> = None;
        let mut abort_requested = false;

        for (snapshot, task_report) in snapshots.iter().zip(reports) {
            let duration_ms = task_report.duration_ms;
            let (report, used_fallback) = match task_report.output {
                Some(record) => (record.report, record.used_fallback),
                None => (
                    StepReport::failed(
                        task_report
                            .error
                            .unwrap_or_else(|| "worker did not report".to_string()),
                    ),
                    false,
                ),
            };

            self.register_jobs(&report.submitted_jobs).await;

            let status = if report.passed {
                StepStatus::Done
            } else {
                StepStatus::Failed
            };
            if let Some(step) = self
                .state
                .plan
                .as_mut()
                .and_then(|p| p.step_mut(snapshot.step_id))
            {
                step.status = status;
            }

            let outcome = StepOutcome {
                step_id: snapshot.step_id,
                intent: snapshot.intent.clone(),
                status,
                summary: report.summary.clone(),
                used_fallback,
                was_skipped: false,
                new_capability: report.new_capability_registered,
                duration_ms,
                finished_at: Utc::now(),
            };
            self.state.history.push(outcome.clone());
            self.emit(PlannerEvent::StepCompleted {
                run_key: self.state.run_key.clone(),
                step_id: snapshot.step_id,
                passed: report.passed,
                used_fallback,
                timestamp: Utc::now(),
            });

            if let Some(branch) = &snapshot.conditional_branch {
                let skip_target = if report.passed {
                    branch.on_fail
                } else {
                    branch.on_success
                };
                if let Some(target) = skip_target {
                    self.mark_skipped(
                        target,
                        format!("skipped by conditional branch of step {}", snapshot.step_id),
                    );
                }
            }

            // Trigger checks short-circuit: the first one wins and the
            // rest of the window is only written back, not re-judged.
            if replan_reason.is_some() || abort_requested {
                continue;
            }
            if !report.passed {
                match self.ask_about_failure(snapshot.step_id, &report.summary).await {
                    FailureDecision::Abort => abort_requested = true,
                    FailureDecision::Continue => {}
                    FailureDecision::Replan => {
                        replan_reason = Some(format!(
                            "step {} failed with no working fallback: {}",
                            snapshot.step_id, report.summary
                        ));
                    }
                }
            } else if report.new_capability_registered && self.pending_work_remains() {
                replan_reason = Some(format!(
                    "step {} registered new capability {}",
                    snapshot.step_id,
                    report.capability_ref.as_deref().unwrap_or("(unnamed)")
                ));
            } else if report.replan_requested {
                replan_reason = Some(format!(
                    "executor requested a replan after step {}",
                    snapshot.step_id
                ));
            } else if self.state.config.heuristic_check_enabled {
                if let Some(heuristic) = self.collaborators.heuristic.clone() {
                    let plan = self.require_plan()?.clone();
                    let flagged = heuristic
                        .should_replan(&self.state.goal, &plan, &outcome)
                        .await
                        .unwrap_or(false);
                    if flagged {
                        replan_reason = Some(format!(
                            "remaining plan flagged as stale after step {}",
                            snapshot.step_id
                        ));
                    }
                }
            }
        }

        self.jobs.refresh_pending().await;
        self.state.updated_at = Utc::now();
        self.store.save_state(&self.state)?;

        if abort_requested {
            return self.transition(
                Phase::Aborted,
                Some("operator aborted after step failure".to_string()),
            );
        }
        if let Some(reason) = replan_reason {
            self.state.replan_reasons.push(reason.clone());
            self.emit(PlannerEvent::ReplanTriggered {
                run_key: self.state.run_key.clone(),
                reason: reason.clone(),
                replan_count: self.state.replan_count,
                timestamp: Utc::now(),
            });
            return self.transition(Phase::Replanning, Some(reason));
        }
        Ok(())
    }

    async fn run_replanning(&mut self) -> Result<()> {
        let mut feedback = self
            .state
            .replan_reasons
            .last()
            .cloned()
            .unwrap_or_else(|| "replan requested".to_string());

        if self.state.replan_count >= self.state.config.max_replans {
            let prompt = HumanPrompt {
                question: format!(
                    "Replan budget exhausted ({} of {} used). Reply 'continue' to keep the \
                     current plan, 'extend' to allow one more replan, 'abort' to stop, or \
                     give revision feedback.",
                    self.state.replan_count, self.state.config.max_replans
                ),
                options: vec![
                    "continue".to_string(),
                    "extend".to_string(),
                    "abort".to_string(),
                ],
                default_answer: "continue".to_string(),
                timeout_secs: self.state.config.human_timeout_secs,
            };
            let (answer, _) = self.ask_human(prompt).await;
            match answer.trim().to_ascii_lowercase().as_str() {
                "abort" => {
                    return self.transition(
                        Phase::Aborted,
                        Some("operator aborted after replan budget exhausted".to_string()),
                    )
                }
                "" | "continue" => {
                    return self.transition(
                        Phase::Executing,
                        Some("replan budget exhausted, continuing current plan".to_string()),
                    )
                }
                "extend" => {}
                custom => feedback = custom.to_string(),
            }
        }

        let current = self.require_plan()?.clone();
        let outcome = self
            .collaborators
            .generator
            .revise(&self.state.goal, &current, &feedback)
            .await;

        match outcome {
            Ok(PlanOutcome::Plan(revision)) => {
                let mut merged = merge_revision(&current, revision);
                match validate_graph(&merged) {
                    Ok(()) => {
                        let report = self.validator.validate(&mut merged);
                        if !report.redirected_steps.is_empty() {
                            self.emit(PlannerEvent::PlanRedirected {
                                run_key: self.state.run_key.clone(),
                                redirected_steps: report.redirected_steps.clone(),
                                timestamp: Utc::now(),
                            });
                        }
                        merged.status = PlanStatus::Active;
                        self.emit(PlannerEvent::PlanGenerated {
                            run_key: self.state.run_key.clone(),
                            plan_id: merged.plan_id.clone(),
                            step_count: merged.steps.len(),
                            timestamp: Utc::now(),
                        });
                        self.state.plan = Some(merged);
                        self.state.replan_count += 1;
                    }
                    Err(err) => {
                        tracing::warn!(
                            run_key = %self.state.run_key,
                            "revised plan invalid, continuing current plan: {}",
                            err
                        );
                    }
                }
            }
            Ok(PlanOutcome::Refused { reason }) => {
                tracing::warn!(
                    run_key = %self.state.run_key,
                    "plan revision refused, continuing current plan: {}",
                    reason
                );
            }
            Err(err) => {
                tracing::warn!(
                    run_key = %self.state.run_key,
                    "plan revision failed, continuing current plan: {:#}",
                    err
                );
            }
        }

        self.transition(Phase::Executing, None)
    }

    // ---- helpers ------------------------------------------------------

    /// Normalize, structurally validate, and safety-screen a candidate
    /// plan, then install it. A plan the generator marked refused comes
    /// back as `PlannerError::Refused`, structural problems as
    /// `PlannerError::Validation`; planning consumes both as fix-round
    /// feedback.
    fn accept_plan(&mut self, mut plan: Plan) -> Result<()> {
        if plan.status == PlanStatus::Refused {
            return Err(PlannerError::Refused(
                plan.report
                    .unwrap_or_else(|| "generator refused the plan".to_string()),
            ));
        }
        plan.steps.sort_by_key(|s| s.step_id);
        validate_graph(&plan)?;

        let report = self.validator.validate(&mut plan);
        if !report.redirected_steps.is_empty() {
            self.emit(PlannerEvent::PlanRedirected {
                run_key: self.state.run_key.clone(),
                redirected_steps: report.redirected_steps.clone(),
                timestamp: Utc::now(),
            });
        }
        for violation in &report.residual {
            tracing::warn!(
                run_key = %self.state.run_key,
                step_id = violation.step_id,
                blocked = %violation.blocked_name,
                "restricted resource still referenced; proceeding, refusal is the operator's call"
            );
        }

        plan.status = PlanStatus::Active;
        self.emit(PlannerEvent::PlanGenerated {
            run_key: self.state.run_key.clone(),
            plan_id: plan.plan_id.clone(),
            step_count: plan.steps.len(),
            timestamp: Utc::now(),
        });
        self.state.plan = Some(plan);
        Ok(())
    }

    fn require_plan(&self) -> Result<&Plan> {
        self.state
            .plan
            .as_ref()
            .ok_or_else(|| PlannerError::InvalidOperation("no plan installed".to_string()))
    }

    fn pending_work_remains(&self) -> bool {
        self.state
            .plan
            .as_ref()
            .map(|p| p.steps.iter().any(|s| s.status == StepStatus::Pending))
            .unwrap_or(false)
    }

    fn mark_skipped(&mut self, target: u32, reason: String) {
        let Some(step) = self
            .state
            .plan
            .as_mut()
            .and_then(|p| p.step_mut(target))
        else {
            return;
        };
        if step.status != StepStatus::Pending {
            return;
        }
        step.status = StepStatus::Done;
        step.was_skipped = true;
        let intent = step.intent.clone();

        self.state.history.push(StepOutcome {
            step_id: target,
            intent,
            status: StepStatus::Done,
            summary: reason.clone(),
            used_fallback: false,
            was_skipped: true,
            new_capability: false,
            duration_ms: 0,
            finished_at: Utc::now(),
        });
        self.emit(PlannerEvent::StepSkipped {
            run_key: self.state.run_key.clone(),
            step_id: target,
            reason,
            timestamp: Utc::now(),
        });
    }

    async fn ask_about_failure(&self, step_id: u32, summary: &str) -> FailureDecision {
        let prompt = HumanPrompt {
            question: format!(
                "Step {} failed: {}. Reply 'replan' to revise the remaining plan, \
                 'continue' to keep going, or 'abort' to stop the run.",
                step_id, summary
            ),
            options: vec![
                "replan".to_string(),
                "continue".to_string(),
                "abort".to_string(),
            ],
            default_answer: "replan".to_string(),
            timeout_secs: self.state.config.human_timeout_secs,
        };
        let (answer, _) = self.ask_human(prompt).await;
        match answer.trim().to_ascii_lowercase().as_str() {
            "abort" | "stop" => FailureDecision::Abort,
            "continue" | "skip" | "ignore" => FailureDecision::Continue,
            _ => FailureDecision::Replan,
        }
    }

    /// One bounded question to the operator. The timeout and any gate
    /// error resolve to the prompt's default answer; the run never
    /// blocks indefinitely on a human.
    async fn ask_human(&self, prompt: HumanPrompt) -> (String, bool) {
        self.emit(PlannerEvent::HumanPromptIssued {
            run_key: self.state.run_key.clone(),
            prompt: prompt.question.clone(),
            default_answer: prompt.default_answer.clone(),
            timestamp: Utc::now(),
        });

        let wait = Duration::from_secs(prompt.timeout_secs.max(1));
        let asked = self.collaborators.human.ask(&prompt);
        let (answer, timed_out) = match tokio::time::timeout(wait, asked).await {
            Ok(Ok(answer)) => (answer, false),
            Ok(Err(err)) => {
                tracing::warn!(
                    run_key = %self.state.run_key,
                    "human gate failed, using default answer: {:#}",
                    err
                );
                (prompt.default_answer.clone(), false)
            }
            Err(_) => {
                tracing::info!(
                    run_key = %self.state.run_key,
                    default = %prompt.default_answer,
                    "human prompt timed out, using default answer"
                );
                (prompt.default_answer.clone(), true)
            }
        };

        self.emit(PlannerEvent::HumanPromptAnswered {
            run_key: self.state.run_key.clone(),
            answer: answer.clone(),
            timed_out,
            timestamp: Utc::now(),
        });
        (answer, timed_out)
    }

    async fn register_jobs(&self, jobs: &[crate::traits::SubmittedJob]) {
        for job in jobs {
            self.jobs
                .record_submit(&job.job_id, &job.source, job.external_ref.as_deref())
                .await;
            self.emit(PlannerEvent::JobRegistered {
                run_key: self.state.run_key.clone(),
                job_id: job.job_id.clone(),
                source: job.source.clone(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Wait for outstanding jobs before declaring the run complete,
    /// bounded by `max_job_drain_secs`. Past the bound the pending set
    /// is recorded as an approximation instead of blocking forever.
    async fn drain_jobs(&mut self) {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.state.config.max_job_drain_secs);
        loop {
            self.jobs.refresh_pending().await;
            let (finished, reason) = self.jobs.can_finish().await;
            if finished {
                return;
            }
            if tokio::time::Instant::now() >= deadline || self.cancel.is_cancelled() {
                tracing::warn!(run_key = %self.state.run_key, "{}", reason);
                self.approximations
                    .push(format!("run ended with jobs outstanding: {}", reason));
                return;
            }
            tokio::time::sleep(Duration::from_millis(self.state.config.job_poll_interval_ms))
                .await;
        }
    }

    fn transition(&mut self, phase: Phase, reason: Option<String>) -> Result<()> {
        tracing::info!(
            run_key = %self.state.run_key,
            from = self.state.phase.as_str(),
            to = phase.as_str(),
            reason = reason.as_deref().unwrap_or(""),
            "phase transition"
        );
        self.state.phase = phase;
        self.state.phase_reason = reason.clone();
        self.state.updated_at = Utc::now();
        self.store.save_state(&self.state)?;
        self.emit(PlannerEvent::PhaseChanged {
            run_key: self.state.run_key.clone(),
            phase,
            reason: reason.clone(),
            timestamp: Utc::now(),
        });
        emit_event(
            if phase == Phase::Failed {
                Level::WARN
            } else {
                Level::INFO
            },
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "phase_changed",
                component: "orchestrator",
                run_key: Some(&self.state.run_key),
                step_id: None,
                job_id: None,
                phase: Some(phase.as_str()),
                status: None,
                error_code: None,
                detail: reason.as_deref(),
            },
        );
        Ok(())
    }

    async fn finalize(&mut self) -> Result<ExecutionSummary> {
        let pending: Vec<String> = {
            let snapshot = self.jobs.snapshot().await;
            snapshot
                .iter()
                .filter(|r| !r.lifecycle.is_terminal())
                .map(|r| format!("{}:{}", r.job_id, r.lifecycle.as_str()))
                .collect()
        };
        let summary = build_summary(&self.state, self.approximations.clone(), pending);
        self.store
            .save_summary(&self.state.run_key, &render_markdown(&summary))?;

        let event = match self.state.phase {
            Phase::Completed => PlannerEvent::RunCompleted {
                run_key: self.state.run_key.clone(),
                timestamp: Utc::now(),
            },
            Phase::Aborted => PlannerEvent::RunAborted {
                run_key: self.state.run_key.clone(),
                reason: self.state.phase_reason.clone().unwrap_or_default(),
                timestamp: Utc::now(),
            },
            _ => PlannerEvent::RunFailed {
                run_key: self.state.run_key.clone(),
                reason: self.state.phase_reason.clone().unwrap_or_default(),
                timestamp: Utc::now(),
            },
        };
        self.emit(event);
        Ok(summary)
    }

    fn emit(&self, event: PlannerEvent) {
        if let Err(err) = self.store.append_event(&self.state.run_key, &event) {
            tracing::warn!(
                run_key = %self.state.run_key,
                "failed to append event to run log: {}",
                err
            );
        }
        if let Some(sink) = &self.events {
            let _ = sink.send(event);
        }
    }
}

enum FailureDecision {
    Replan,
    Continue,
    Abort,
}

/// Run one step in a worker: dispatch by kind, then attempt the
/// fallback text as a recovery action if the primary attempt failed.
async fn run_step(
    step: Step,
    executor: Arc<dyn StepExecutor>,
    builder: Arc<dyn CapabilityBuilder>,
) -> anyhow::Result<StepRunRecord> {
    let primary = match step.kind {
        StepKind::Normal => executor.run(&step.intent, step.fallback.as_deref()).await,
        StepKind::CapabilityEvolution => builder.run(&step.intent).await,
    };
    let mut report = match primary {
        Ok(report) => report,
        Err(err) => StepReport::failed(format!("{:#}", err)),
    };

    let mut used_fallback = false;
    if !report.passed {
        if let Some(fallback) = step.fallback.as_deref() {
            match executor.run(fallback, None).await {
                Ok(mut recovery) if recovery.passed => {
                    recovery.summary = format!("fallback succeeded: {}", recovery.summary);
                    let mut jobs = std::mem::take(&mut report.submitted_jobs);
                    jobs.append(&mut recovery.submitted_jobs);
                    recovery.submitted_jobs = jobs;
                    report = recovery;
                    used_fallback = true;
                }
                Ok(recovery) => {
                    report.summary = format!(
                        "{}; fallback also failed: {}",
                        report.summary, recovery.summary
                    );
                }
                Err(err) => {
                    report.summary =
                        format!("{}; fallback errored: {:#}", report.summary, err);
                }
            }
        }
    }

    Ok(StepRunRecord {
        report,
        used_fallback,
    })
}

fn render_plan_brief(plan: &Plan) -> String {
    let mut out = String::new();
    for step in &plan.steps {
        let deps = if step.depends_on.is_empty() {
            String::new()
        } else {
            format!(" (after {:?})", step.depends_on)
        };
        let _ = writeln!(out, "  {}. {}{}", step.step_id, step.intent, deps);
    }
    out
}

//! The orchestrator (§4.4) — the phased engine that drives a [`Task`]
//! from `queued` to a terminal phase.
//!
//! `Execute` is written as a straight sequence of phase blocks rather than
//! a generic step runner (§9): the sequence is short and every phase has a
//! distinct contract, so a plugin-style abstraction would cost more than
//! it buys. Every block follows the same shape: open a `PipelineStep`,
//! call an adapter, close the step, persist, and on error route through
//! `fail_task`. `Task` is threaded through as an owned value — each phase
//! function consumes the task it's handed and returns it (or an
//! `EngineError`), which keeps the ownership story linear and makes the
//! retry loop's `continue`/`break` control flow read like the spec's own
//! numbered steps.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::adapters::{AiBackend, DeployAdapter, GitAdapter, Notifier, TestRunner};
use crate::config::EngineConfig;
use crate::model::{
    Attempt, AttemptStatus, Change, ChangeAction, FailReason, FileChange, Issue, Phase,
    PipelineStep, Proposal, ProposalStatus, ProposalType, State, StepStatus, Task,
};
use crate::policy::{self, PolicyAction};
use crate::statemachine::StateMachine;
use crate::store::StateStore;

/// Errors returned by [`Engine::execute`] and [`Engine::resume`] (§7).
///
/// [`EngineError::AwaitingApproval`] is the distinguished non-error
/// signal from §4.4.4/§7: it short-circuits execution without marking the
/// task failed, because the task is already persisted in
/// `awaiting_approval`. Every other variant corresponds to a terminal
/// `failed`/`rollback` outcome or a precondition the caller got wrong.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The task paused for a human decision; it is not a failure.
    #[error("task {task_id} is awaiting approval")]
    AwaitingApproval { task_id: u64 },

    /// The task ran to a terminal `failed`/`rollback` phase.
    #[error("task {task_id} failed at {reason}: {cause}")]
    Failed {
        task_id: u64,
        reason: FailReason,
        cause: String,
    },

    /// `Execute` was called for an issue that already has an in-flight task.
    #[error("issue {issue_id} already has an in-flight task")]
    DuplicateInFlight { issue_id: String },

    #[error("task {task_id} not found")]
    TaskNotFound { task_id: u64 },

    #[error("task {task_id} is not awaiting approval (phase={phase})")]
    NotAwaitingApproval { task_id: u64, phase: Phase },

    #[error("task {task_id} has no pending proposal")]
    NoPendingProposal { task_id: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The orchestrator itself (§4.4.1): configuration, adapters, and the
/// state store it persists through.
pub struct Engine {
    config: EngineConfig,
    store: StateStore,
    ai: Arc<dyn AiBackend>,
    git: Arc<dyn GitAdapter>,
    deploy: Arc<dyn DeployAdapter>,
    test_runners: Vec<Arc<dyn TestRunner>>,
    notifiers: Vec<Arc<dyn Notifier>>,
    dry_run: bool,
    cancellation: CancellationToken,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        store: StateStore,
        ai: Arc<dyn AiBackend>,
        git: Arc<dyn GitAdapter>,
        deploy: Arc<dyn DeployAdapter>,
        test_runners: Vec<Arc<dyn TestRunner>>,
        notifiers: Vec<Arc<dyn Notifier>>,
    ) -> Self {
        Self {
            config,
            store,
            ai,
            git,
            deploy,
            test_runners,
            notifiers,
            dry_run: false,
            cancellation: CancellationToken::new(),
        }
    }

    /// Run `Execute` without performing any adapter calls, stopping right
    /// after the task is created in `queued` (§4.4.2 step 1).
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// A token the caller can cancel to abort the current or next phase
    /// (§5, "Cancellation and timeouts"). Checked between phase blocks;
    /// an already-cancelled token fails the task before its first adapter
    /// call runs.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // -----------------------------------------------------------------
    // Execute
    // -----------------------------------------------------------------

    /// Primary entry point (§4.4.2): create a task for `issue` and drive
    /// it through the full phase sequence. Returns the task id on
    /// `completed`; an [`EngineError`] otherwise.
    pub async fn execute(&self, issue: Issue) -> Result<u64, EngineError> {
        let task = self.create_task(issue).await?;
        if self.dry_run {
            return Ok(task.id);
        }
        self.run_task(task).await
    }

    async fn create_task(&self, issue: Issue) -> Result<Task, EngineError> {
        let result: Result<Task, EngineError> = self
            .store
            .with_state(|state| {
                if state.is_in_flight(&issue.id) {
                    return Err(EngineError::DuplicateInFlight {
                        issue_id: issue.id.clone(),
                    });
                }
                let id = state.alloc_task_id();
                let mut task = Task::new(id, issue.clone(), Utc::now());
                let idx = open_step(&mut task, Phase::Queued);
                close_step(&mut task, idx, StepStatus::Success, "task created".into(), None);
                state.tasks.push(task.clone());
                Ok(task)
            })
            .await
            .map_err(EngineError::Other)?;
        result
    }

    async fn run_task(&self, task: Task) -> Result<u64, EngineError> {
        let task = self.require_transition(task, Phase::Planning).await?;
        let task = self.run_planning(task).await?;
        let task = self.require_transition(task, Phase::Coding).await?;
        let (task, changes) = self.run_coding(task).await?;
        let task = self.apply_policy_gate(task, &changes).await?;
        let task = self.require_transition(task, Phase::Committing).await?;
        let mut task = self.run_committing(task, &changes).await?;

        // approval (§4.4.2 step 5, §9 open question 3): recorded as a
        // skipped pipeline step, no adapter call, no phase transition.
        let idx = open_step(&mut task, Phase::Approval);
        close_step(
            &mut task,
            idx,
            StepStatus::Skipped,
            "approval auto-skipped".into(),
            None,
        );

        let current_code: BTreeMap<String, String> =
            changes.into_iter().map(|c| (c.path, c.content)).collect();
        self.run_from_deploying(task, current_code).await
    }

    async fn run_planning(&self, task: Task) -> Result<Task, EngineError> {
        if self.cancellation.is_cancelled() {
            return Err(self.fail_task(task, FailReason::Unknown, "cancelled before planning".to_string()).await);
        }
        let mut task = task;
        let idx = open_step(&mut task, Phase::Planning);
        match self.ai.analyze_issue(&task.issue, "").await {
            Ok(plan) => {
                close_step(&mut task, idx, StepStatus::Success, plan.summary.clone(), None);
                task.attempts.push(Attempt::new(1, plan.summary));
                self.persist_task(&task).await.map_err(EngineError::Other)?;
                Ok(task)
            }
            Err(e) => {
                close_step(&mut task, idx, StepStatus::Failed, String::new(), Some(e.to_string()));
                Err(self.fail_task(task, FailReason::Ai, e.to_string()).await)
            }
        }
    }

    async fn run_coding(&self, mut task: Task) -> Result<(Task, Vec<FileChange>), EngineError> {
        let idx = open_step(&mut task, Phase::Coding);
        let plan = crate::adapters::Plan {
            summary: task.current_attempt().map(|a| a.plan_summary.clone()).unwrap_or_default(),
            steps: Vec::new(),
        };
        match self.ai.generate_code(&plan, &BTreeMap::new()).await {
            Ok(changes) => {
                close_step(
                    &mut task,
                    idx,
                    StepStatus::Success,
                    format!("{} file(s) changed", changes.len()),
                    None,
                );
                if let Some(attempt) = task.current_attempt_mut() {
                    attempt.changed_paths = changes.iter().map(|c| c.path.clone()).collect();
                }
                self.persist_task(&task).await.map_err(EngineError::Other)?;
                Ok((task, changes))
            }
            Err(e) => {
                close_step(&mut task, idx, StepStatus::Failed, String::new(), Some(e.to_string()));
                Err(self.fail_task(task, FailReason::Ai, e.to_string()).await)
            }
        }
    }

    /// §4.4.7: consulted before entering `committing`. A `block` violation
    /// aborts the task into `failed` with `fail_reason = config`; a `warn`
    /// violation is logged and execution continues.
    async fn apply_policy_gate(&self, task: Task, changes: &[FileChange]) -> Result<Task, EngineError> {
        let violations = policy::evaluate(&self.config.policy, &task, changes, !self.test_runners.is_empty());
        for v in &violations {
            match v.action {
                PolicyAction::Block => {
                    return Err(self.fail_task(task, FailReason::Config, v.message.clone()).await);
                }
                PolicyAction::Warn => {
                    tracing::warn!(task_id = task.id, rule = ?v.rule, message = %v.message, "policy warning");
                }
            }
        }
        Ok(task)
    }

    async fn run_committing(&self, mut task: Task, changes: &[FileChange]) -> Result<Task, EngineError> {
        let idx = open_step(&mut task, Phase::Committing);
        let (owner, repo) = split_repo(&task.issue.repo);

        if let Err(e) = self.git.clone_or_pull(&owner, &repo, "").await {
            close_step(&mut task, idx, StepStatus::Failed, String::new(), Some(e.to_string()));
            return Err(self.fail_task(task, FailReason::Git, e.to_string()).await);
        }
        if let Err(e) = self.git.create_branch(&task.branch).await {
            close_step(&mut task, idx, StepStatus::Failed, String::new(), Some(e.to_string()));
            return Err(self.fail_task(task, FailReason::Git, e.to_string()).await);
        }

        let title = format!("rig: auto-fix {}", task.issue.title);
        match self.git.commit_and_push(changes, &title).await {
            Ok(sha) => {
                close_step(&mut task, idx, StepStatus::Success, sha.clone(), None);
                task.commit_sha = Some(sha);
                self.persist_task(&task).await.map_err(EngineError::Other)?;
                Ok(task)
            }
            Err(e) => {
                close_step(&mut task, idx, StepStatus::Failed, String::new(), Some(e.to_string()));
                Err(self.fail_task(task, FailReason::Git, e.to_string()).await)
            }
        }
    }

    // -----------------------------------------------------------------
    // Deploying / testing / retry loop / reporting (§4.4.2 steps 6-9,
    // §4.4.3) — shared between the initial Execute pass and Resume,
    // which both enter at `deploying`.
    // -----------------------------------------------------------------

    async fn run_from_deploying(
        &self,
        mut task: Task,
        mut current_code: BTreeMap<String, String>,
    ) -> Result<u64, EngineError> {
        let mut retry_k: u32 = 0;

        loop {
            let task_after_deploy = self.require_transition(task, Phase::Deploying).await?;
            task = task_after_deploy;

            let vars = build_vars(&task);
            let idx = open_step(&mut task, Phase::Deploying);
            let deploy_result = self.deploy.deploy(&vars).await;
            match deploy_result {
                Ok(result) if result.success => {
                    close_step(&mut task, idx, StepStatus::Success, result.output.clone(), None);
                    if let Some(attempt) = task.current_attempt_mut() {
                        attempt.deploy_result = Some(result);
                    }
                    self.persist_task(&task).await.map_err(EngineError::Other)?;
                }
                Ok(result) => {
                    close_step(&mut task, idx, StepStatus::Failed, result.output.clone(), None);
                    let logs = result.output.clone();
                    if let Some(attempt) = task.current_attempt_mut() {
                        attempt.deploy_result = Some(result);
                    }
                    return Err(self.enter_deploy_failure_branch(task, logs).await);
                }
                Err(e) => {
                    close_step(&mut task, idx, StepStatus::Failed, String::new(), Some(e.to_string()));
                    return Err(self.fail_task(task, FailReason::Deploy, e.to_string()).await);
                }
            }

            task = self.require_transition(task, Phase::Testing).await?;
            let test_idx = open_step(&mut task, Phase::Testing);
            let mut all_passed = true;
            let mut combined_logs = String::new();
            let mut results = Vec::new();
            let mut run_error = None;
            for runner in &self.test_runners {
                match runner.run(&vars).await {
                    Ok(result) => {
                        if !result.passed {
                            all_passed = false;
                        }
                        combined_logs.push_str(&format!("[{}] {}\n", result.name, result.output));
                        results.push(result);
                    }
                    Err(e) => {
                        run_error = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = run_error {
                close_step(&mut task, test_idx, StepStatus::Failed, combined_logs, Some(e.to_string()));
                return Err(self.fail_task(task, FailReason::Test, e.to_string()).await);
            }
            if let Some(attempt) = task.current_attempt_mut() {
                attempt.test_results = results;
            }

            if all_passed {
                close_step(&mut task, test_idx, StepStatus::Success, combined_logs, None);
                if let Some(attempt) = task.current_attempt_mut() {
                    attempt.status = AttemptStatus::Passed;
                }
                self.persist_task(&task).await.map_err(EngineError::Other)?;
                break;
            }

            close_step(&mut task, test_idx, StepStatus::Failed, combined_logs.clone(), None);
            if let Some(attempt) = task.current_attempt_mut() {
                attempt.status = AttemptStatus::Failed;
                attempt.fail_reason = Some(FailReason::Test);
            }
            self.persist_task(&task).await.map_err(EngineError::Other)?;

            retry_k += 1;
            if self.config.max_retry > 0 && retry_k > self.config.max_retry {
                return Err(self
                    .exhaust_retries_and_rollback(
                        task,
                        format!(
                            "max_retry={} exceeded after {retry_k} attempt(s)",
                            self.config.max_retry
                        ),
                    )
                    .await);
            }

            // §4.4.3 steps 3-5: testing -> coding -> committing, seeded
            // with a fresh AI pass over the failure logs.
            task = self.require_transition(task, Phase::Coding).await?;
            let code_idx = open_step(&mut task, Phase::Coding);
            let new_changes = match self.ai.analyze_failure(&combined_logs, &current_code).await {
                Ok(c) => c,
                Err(e) => {
                    close_step(&mut task, code_idx, StepStatus::Failed, String::new(), Some(e.to_string()));
                    return Err(self.fail_task(task, FailReason::Ai, e.to_string()).await);
                }
            };
            close_step(
                &mut task,
                code_idx,
                StepStatus::Success,
                format!("{} file(s) changed", new_changes.len()),
                None,
            );

            let next_number = task.attempts.len() as u32 + 1;
            let mut attempt =
                Attempt::new(next_number, format!("Retry #{retry_k}: fix based on test failures"));
            attempt.changed_paths = new_changes.iter().map(|c| c.path.clone()).collect();
            task.attempts.push(attempt);
            current_code = new_changes.iter().map(|c| (c.path.clone(), c.content.clone())).collect();
            self.persist_task(&task).await.map_err(EngineError::Other)?;

            task = self.require_transition(task, Phase::Committing).await?;
            let commit_idx = open_step(&mut task, Phase::Committing);
            let title = format!("rig: auto-fix {}", task.issue.title);
            match self.git.commit_and_push(&new_changes, &title).await {
                Ok(sha) => {
                    close_step(&mut task, commit_idx, StepStatus::Success, sha.clone(), None);
                    task.commit_sha = Some(sha);
                }
                Err(e) => {
                    close_step(&mut task, commit_idx, StepStatus::Failed, String::new(), Some(e.to_string()));
                    return Err(self.fail_task(task, FailReason::Git, e.to_string()).await);
                }
            }

            let skip_idx = open_step(&mut task, Phase::Approval);
            close_step(&mut task, skip_idx, StepStatus::Skipped, "approval auto-skipped".into(), None);
            self.persist_task(&task).await.map_err(EngineError::Other)?;
        }

        self.run_reporting(task).await
    }

    async fn run_reporting(&self, mut task: Task) -> Result<u64, EngineError> {
        task = self.require_transition(task, Phase::Reporting).await?;
        let idx = open_step(&mut task, Phase::Reporting);
        let body = task.current_attempt().map(|a| a.plan_summary.clone()).unwrap_or_default();
        let title = format!("rig: {}", task.issue.title);
        match self.git.create_pr(&self.config.base_branch, &task.branch, &title, &body).await {
            Ok(pr) => {
                close_step(&mut task, idx, StepStatus::Success, pr.url.clone(), None);
                task.pr = Some(pr);
                self.persist_task(&task).await.map_err(EngineError::Other)?;
            }
            Err(e) => {
                close_step(&mut task, idx, StepStatus::Failed, String::new(), Some(e.to_string()));
                return Err(self.fail_task(task, FailReason::Git, e.to_string()).await);
            }
        }

        task = self.require_transition(task, Phase::Completed).await?;
        if let Err(e) = self.git.cleanup().await {
            tracing::warn!(task_id = task.id, error = %e, "workspace cleanup failed after completion");
        }
        let task_id = task.id;
        self.notify(&format!("task {task_id} completed")).await;
        self.persist_task(&task).await.map_err(EngineError::Other)?;
        Ok(task_id)
    }

    // -----------------------------------------------------------------
    // Deploy-failure branch / approval handoff (§4.4.4)
    // -----------------------------------------------------------------

    async fn enter_deploy_failure_branch(&self, mut task: Task, logs: String) -> EngineError {
        // Close out the in-progress attempt before handing off for a
        // human decision (§3 invariant 4: a new attempt is appended only
        // after the previous one has a terminal status), mirroring how
        // the retry loop closes an attempt on test failure.
        if let Some(attempt) = task.current_attempt_mut() {
            attempt.status = AttemptStatus::Failed;
            attempt.fail_reason = Some(FailReason::Deploy);
        }

        let infra_files = self.load_infra_files();
        let fix = match self.ai.analyze_deploy_failure(&logs, &infra_files).await {
            Ok(f) => f,
            Err(e) => return self.fail_task(task, FailReason::Ai, e.to_string()).await,
        };

        let proposal_id = match self.store.with_state(|state| state.alloc_proposal_id()).await {
            Ok(id) => id,
            Err(e) => return EngineError::Other(e),
        };

        let changes: Vec<Change> = fix
            .changes
            .iter()
            .map(|c| Change {
                path: c.path.clone(),
                action: c.action,
                reason: c.reason.clone(),
                before: infra_files.get(&c.path).cloned().unwrap_or_default(),
                after: c.content.clone(),
            })
            .collect();

        task.proposals.push(Proposal {
            id: proposal_id,
            kind: ProposalType::DeployFix,
            summary: fix.summary,
            reason: fix.reason,
            changes,
            status: ProposalStatus::Pending,
            created_at: Utc::now(),
            reviewed_at: None,
        });

        let idx = open_step(&mut task, Phase::AwaitingApproval);
        if let Err(e) = StateMachine::transition(&mut task, Phase::AwaitingApproval) {
            close_step(&mut task, idx, StepStatus::Failed, String::new(), Some(e.to_string()));
            return self.fail_task(task, FailReason::Infra, e.to_string()).await;
        }
        close_step(
            &mut task,
            idx,
            StepStatus::Success,
            "awaiting human approval for a deploy fix".into(),
            None,
        );

        let task_id = task.id;
        if let Err(e) = self.persist_task(&task).await {
            tracing::error!(task_id, error = %e, "failed to persist awaiting_approval state");
        }
        self.notify(&format!("task {task_id} is awaiting approval for a deploy fix")).await;
        EngineError::AwaitingApproval { task_id }
    }

    /// §4.4.5: continue a task paused at `awaiting_approval`.
    pub async fn resume(&self, task_id: u64, approved: bool) -> Result<u64, EngineError> {
        let mut task = self.load_task(task_id).await?;
        if task.phase != Phase::AwaitingApproval {
            return Err(EngineError::NotAwaitingApproval {
                task_id,
                phase: task.phase,
            });
        }
        let proposal_idx = task
            .proposals
            .iter()
            .rposition(|p| p.status == ProposalStatus::Pending)
            .ok_or(EngineError::NoPendingProposal { task_id })?;

        if !approved {
            task.proposals[proposal_idx].status = ProposalStatus::Rejected;
            task.proposals[proposal_idx].reviewed_at = Some(Utc::now());
            let task = self.require_transition(task, Phase::Failed).await?;
            self.persist_task(&task).await.map_err(EngineError::Other)?;
            return Err(EngineError::Failed {
                task_id,
                reason: FailReason::Infra,
                cause: "proposal rejected by operator".to_string(),
            });
        }

        task.proposals[proposal_idx].status = ProposalStatus::Approved;
        task.proposals[proposal_idx].reviewed_at = Some(Utc::now());
        let changes = task.proposals[proposal_idx].changes.clone();

        for change in &changes {
            if let Err(e) = apply_change(change) {
                return Err(self
                    .fail_task(
                        task,
                        FailReason::Infra,
                        format!("failed to apply proposal change {}: {e}", change.path),
                    )
                    .await);
            }
        }

        let next_number = task.attempts.len() as u32 + 1;
        let mut attempt = Attempt::new(next_number, "Resume after approval");
        attempt.changed_paths = changes.iter().map(|c| c.path.clone()).collect();
        task.attempts.push(attempt);

        let current_code: BTreeMap<String, String> = changes
            .iter()
            .filter(|c| c.action != ChangeAction::Delete)
            .map(|c| (c.path.clone(), c.after.clone()))
            .collect();

        self.persist_task(&task).await.map_err(EngineError::Other)?;
        self.run_from_deploying(task, current_code).await
    }

    // -----------------------------------------------------------------
    // Rollback / failure plumbing (§4.4.6, §4.4.8)
    // -----------------------------------------------------------------

    async fn exhaust_retries_and_rollback(&self, mut task: Task, cause: String) -> EngineError {
        self.transition_to_failed(&mut task, FailReason::Test, &cause).await;

        if self.config.rollback_enabled && StateMachine::is_valid_transition(task.phase, Phase::Rollback) {
            let idx = open_step(&mut task, Phase::Rollback);
            match self.deploy.rollback().await {
                Ok(result) => {
                    let status = if result.success { StepStatus::Success } else { StepStatus::Failed };
                    close_step(&mut task, idx, status, result.output, None);
                }
                Err(e) => {
                    tracing::error!(task_id = task.id, error = %e, "rollback adapter call failed");
                    close_step(&mut task, idx, StepStatus::Failed, String::new(), Some(e.to_string()));
                }
            }
            if let Err(e) = StateMachine::transition(&mut task, Phase::Rollback) {
                tracing::error!(task_id = task.id, error = %e, "failed -> rollback transition rejected");
            }
            if let Err(e) = self.persist_task(&task).await {
                tracing::error!(task_id = task.id, error = %e, "failed to persist rollback state");
            }
        }

        EngineError::Failed {
            task_id: task.id,
            reason: FailReason::Test,
            cause,
        }
    }

    async fn transition_to_failed(&self, task: &mut Task, reason: FailReason, cause: &str) {
        if let Err(e) = self.git.cleanup_branch(&task.branch).await {
            tracing::warn!(task_id = task.id, error = %e, "branch cleanup failed");
        }
        if let Err(e) = self.git.cleanup().await {
            tracing::warn!(task_id = task.id, error = %e, "workspace cleanup failed");
        }
        if let Some(attempt) = task.current_attempt_mut() {
            if attempt.status == AttemptStatus::Running {
                attempt.status = AttemptStatus::Failed;
                attempt.fail_reason = Some(reason);
            }
        }
        if let Err(e) = StateMachine::transition(task, Phase::Failed) {
            tracing::error!(task_id = task.id, error = %e, "transition to failed rejected");
        }
        self.notify(&format!("task {} failed at {reason}: {cause}", task.id)).await;
        if let Err(e) = self.persist_task(task).await {
            tracing::error!(task_id = task.id, error = %e, "failed to persist failed task");
        }
    }

    async fn fail_task(&self, mut task: Task, reason: FailReason, cause: impl Into<String>) -> EngineError {
        let cause = cause.into();
        self.transition_to_failed(&mut task, reason, &cause).await;
        EngineError::Failed {
            task_id: task.id,
            reason,
            cause,
        }
    }

    /// Attempt `task.phase -> to`; on rejection, an invalid transition is
    /// a bug (§7, "fatal bugs... route through failTask with infra_error").
    async fn require_transition(&self, mut task: Task, to: Phase) -> Result<Task, EngineError> {
        if let Err(e) = StateMachine::transition(&mut task, to) {
            return Err(self.fail_task(task, FailReason::Infra, e.to_string()).await);
        }
        Ok(task)
    }

    async fn persist_task(&self, task: &Task) -> anyhow::Result<()> {
        self.store
            .with_state(|state| {
                if let Some(slot) = state.find_task_mut(task.id) {
                    *slot = task.clone();
                }
            })
            .await
    }

    async fn load_task(&self, task_id: u64) -> Result<Task, EngineError> {
        let state: State = self.store.load().await.map_err(EngineError::Other)?;
        state.find_task(task_id).cloned().ok_or(EngineError::TaskNotFound { task_id })
    }

    async fn notify(&self, message: &str) {
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(message).await {
                tracing::warn!(error = %e, "notifier failed");
            }
        }
    }

    /// §4.4.4 step 1 / §9 "Infra-file glob safety": reject absolute
    /// patterns or ones containing `..`; after expansion, confirm every
    /// resolved match stays within the process working directory.
    /// Unreadable or out-of-bounds files are skipped with a log, not
    /// fatal — the fix attempt continues without them.
    fn load_infra_files(&self) -> BTreeMap<String, String> {
        let cwd = match std::env::current_dir() {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "cannot determine working directory for infra file globs");
                return BTreeMap::new();
            }
        };

        let mut files = BTreeMap::new();
        for pattern in &self.config.infra_file_globs {
            if Path::new(pattern).is_absolute() || pattern.split('/').any(|seg| seg == "..") {
                tracing::warn!(pattern, "rejecting unsafe infra file glob pattern");
                continue;
            }
            for candidate in expand_glob(&cwd, pattern) {
                let Ok(canonical) = candidate.canonicalize() else {
                    continue;
                };
                if !canonical.starts_with(&cwd) {
                    tracing::warn!(path = %canonical.display(), "infra file resolved outside the working directory, skipping");
                    continue;
                }
                match std::fs::read_to_string(&canonical) {
                    Ok(contents) => {
                        let rel = canonical
                            .strip_prefix(&cwd)
                            .unwrap_or(&canonical)
                            .to_string_lossy()
                            .to_string();
                        files.insert(rel, contents);
                    }
                    Err(e) => {
                        tracing::warn!(path = %canonical.display(), error = %e, "failed to read infra file, skipping");
                    }
                }
            }
        }
        files
    }
}

// ---------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------

/// Open a `PipelineStep` for `phase`, returning its index for later
/// closure (§9, "scoped acquisition... guaranteed closure on all exit
/// paths"). Every call site closes the step it opens before returning,
/// including on every error branch.
fn open_step(task: &mut Task, phase: Phase) -> usize {
    task.pipeline.push(PipelineStep {
        phase,
        status: StepStatus::Running,
        started_at: Utc::now(),
        ended_at: None,
        output: String::new(),
        error: None,
    });
    task.pipeline.len() - 1
}

fn close_step(task: &mut Task, idx: usize, status: StepStatus, output: String, error: Option<String>) {
    if let Some(step) = task.pipeline.get_mut(idx) {
        step.status = status;
        step.ended_at = Some(Utc::now());
        step.output = output;
        step.error = error;
    }
}

/// Build the deploy/test variable map (§4.4.2 step 6).
fn build_vars(task: &Task) -> BTreeMap<String, String> {
    let (owner, repo) = split_repo(&task.issue.repo);
    let mut vars = BTreeMap::new();
    vars.insert("BRANCH_NAME".to_string(), task.branch.clone());
    vars.insert("COMMIT_SHA".to_string(), task.commit_sha.clone().unwrap_or_default());
    vars.insert("ISSUE_ID".to_string(), task.issue.id.clone());
    vars.insert("ISSUE_NUMBER".to_string(), task.issue.id.clone());
    vars.insert("ISSUE_TITLE".to_string(), task.issue.title.clone());
    vars.insert("REPO_OWNER".to_string(), owner);
    vars.insert("REPO_NAME".to_string(), repo);
    vars
}

fn split_repo(repo: &str) -> (String, String) {
    match repo.split_once('/') {
        Some((owner, name)) => (owner.to_string(), name.to_string()),
        None => (String::new(), repo.to_string()),
    }
}

/// Apply one approved proposal `Change` to the filesystem (§4.4.5):
/// create/modify write `after` with mode `0644` after `MkdirAll`;
/// delete removes the file, tolerating it already being absent.
fn apply_change(change: &Change) -> anyhow::Result<()> {
    match change.action {
        ChangeAction::Create | ChangeAction::Modify => {
            if let Some(dir) = Path::new(&change.path).parent() {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir)?;
                }
            }
            std::fs::write(&change.path, change.after.as_bytes())?;
            set_mode_0644(&change.path);
            Ok(())
        }
        ChangeAction::Delete => match std::fs::remove_file(&change.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        },
    }
}

#[cfg(unix)]
fn set_mode_0644(path: &str) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o644);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_mode_0644(_path: &str) {}

/// Expand a `/`-separated glob pattern (`*`/`?` per segment, no `**`)
/// rooted at `base`, returning files that exist. Directories are never
/// returned even if a pattern happens to match one.
fn expand_glob(base: &Path, pattern: &str) -> Vec<PathBuf> {
    let mut current = vec![base.to_path_buf()];
    for segment in pattern.split('/') {
        let mut next = Vec::new();
        if segment.contains('*') || segment.contains('?') {
            for dir in &current {
                let Ok(entries) = std::fs::read_dir(dir) else { continue };
                for entry in entries.filter_map(|e| e.ok()) {
                    if let Some(name) = entry.file_name().to_str() {
                        if glob_segment_match(segment, name) {
                            next.push(dir.join(name));
                        }
                    }
                }
            }
        } else {
            for dir in &current {
                next.push(dir.join(segment));
            }
        }
        current = next;
    }
    current.into_iter().filter(|p| p.is_file()).collect()
}

fn glob_segment_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_segment_rec(&p, &t)
}

fn glob_segment_rec(p: &[char], t: &[char]) -> bool {
    match p.first() {
        None => t.is_empty(),
        Some('*') => glob_segment_rec(&p[1..], t) || (!t.is_empty() && glob_segment_rec(p, &t[1..])),
        Some('?') => !t.is_empty() && glob_segment_rec(&p[1..], &t[1..]),
        Some(c) => t.first() == Some(c) && glob_segment_rec(&p[1..], &t[1..]),
    }
}

//! `ApprovalHandoff` (§4.6): the surface a human (or a CLI/chat command
//! acting on their behalf) uses to look at tasks paused in
//! `awaiting_approval` and push them back into the engine.
//!
//! Deliberately thin — it has no state of its own. Listing reads straight
//! through the [`StateStore`]; approving/rejecting delegates to
//! [`Engine::resume`], which owns every invariant about what a valid
//! decision looks like. This mirrors how this lineage keeps review/approval
//! surfaces as pure read-and-delegate layers over one owning engine rather
//! than duplicating its state machine.

use anyhow::Result;

use crate::model::{Phase, Proposal, Task};
use crate::orchestrator::{Engine, EngineError};
use crate::store::StateStore;

/// A task paused for a decision, paired with the proposal it's paused on.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub task_id: u64,
    pub issue_id: String,
    pub proposal: Proposal,
}

/// Read-only view of what's waiting for a decision.
pub struct ApprovalHandoff<'a> {
    engine: &'a Engine,
}

impl<'a> ApprovalHandoff<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    fn store(&self) -> &StateStore {
        self.engine.store()
    }

    /// Every task currently in `awaiting_approval`, each with its pending
    /// proposal (§4.4.5: a task only enters this phase with exactly one
    /// pending proposal recorded).
    pub async fn list_pending(&self) -> Result<Vec<PendingApproval>> {
        let state = self.store().load().await?;
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.phase == Phase::AwaitingApproval)
            .filter_map(pending_for)
            .collect())
    }

    /// The pending approval for one task, if it is awaiting one.
    pub async fn get_pending(&self, task_id: u64) -> Result<Option<PendingApproval>> {
        let state = self.store().load().await?;
        Ok(state
            .find_task(task_id)
            .filter(|t| t.phase == Phase::AwaitingApproval)
            .and_then(pending_for))
    }

    /// Approve the pending proposal and resume execution at `deploying`
    /// (§4.4.5, §4.6).
    pub async fn approve(&self, task_id: u64) -> Result<u64, EngineError> {
        self.engine.resume(task_id, true).await
    }

    /// Reject the pending proposal; the task is failed with
    /// `fail_reason = infra_error` (§4.4.5, §4.6).
    pub async fn reject(&self, task_id: u64) -> Result<u64, EngineError> {
        self.engine.resume(task_id, false).await
    }
}

fn pending_for(task: &Task) -> Option<PendingApproval> {
    task.pending_proposal().map(|p| PendingApproval {
        task_id: task.id,
        issue_id: task.issue.id.clone(),
        proposal: p.clone(),
    })
}

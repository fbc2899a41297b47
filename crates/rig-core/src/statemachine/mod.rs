//! Task phase transitions.
//!
//! Validates and executes `Phase` transitions for a [`Task`](crate::model::Task),
//! enforcing the single transition table in §4.2 and the timestamping rule
//! (invariant 3, §3): `completed_at` is set the moment a task enters a
//! terminal-for-bookkeeping phase (`completed`, `failed`, `rollback`), and
//! left untouched on every other transition.

use chrono::Utc;

use crate::model::{Phase, Task};

/// Error returned when a requested phase transition is not in the table.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid transition: {from} -> {to} for task {task_id}")]
pub struct InvalidTransition {
    pub task_id: u64,
    pub from: Phase,
    pub to: Phase,
}

/// The phase transition table (§4.2).
///
/// A single source of truth: `Transition` is a total function over
/// `(Phase, Phase)` that either mutates the task or leaves it unchanged.
pub struct StateMachine;

impl StateMachine {
    /// Allowed destinations for `from`, per the table in §4.2. `completed`
    /// and `rollback` are terminal: no outgoing edges.
    fn allowed(from: Phase) -> &'static [Phase] {
        use Phase::*;
        match from {
            Queued => &[Planning, Failed],
            Planning => &[Coding, Failed],
            Coding => &[Committing, Failed],
            Committing => &[Approval, Deploying, Failed],
            Approval => &[Deploying, Failed],
            Deploying => &[Testing, Coding, AwaitingApproval, Failed],
            Testing => &[Reporting, Coding, Deploying, AwaitingApproval, Failed],
            Reporting => &[Completed, Failed],
            Failed => &[Rollback],
            AwaitingApproval => &[Coding, Deploying, Failed],
            Completed => &[],
            Rollback => &[],
        }
    }

    /// True iff `to` is reachable from `from` in one hop.
    pub fn is_valid_transition(from: Phase, to: Phase) -> bool {
        !from.is_terminal() && Self::allowed(from).contains(&to)
    }

    /// Attempt the transition `task.phase -> to`.
    ///
    /// On success, mutates `task.phase` and, if `to` is one of
    /// `{completed, failed, rollback}`, sets `task.completed_at = now`.
    /// On failure, `task` is left entirely unchanged.
    pub fn transition(task: &mut Task, to: Phase) -> Result<(), InvalidTransition> {
        let from = task.phase;
        if !Self::is_valid_transition(from, to) {
            return Err(InvalidTransition {
                task_id: task.id,
                from,
                to,
            });
        }
        task.phase = to;
        if matches!(to, Phase::Completed | Phase::Failed | Phase::Rollback) {
            task.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}

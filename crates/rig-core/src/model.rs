//! Domain types for the task orchestration engine.
//!
//! These are the types persisted in the state file (see [`crate::store`])
//! and mutated by the orchestrator (see [`crate::orchestrator`]). Enums
//! follow the same `Display`/`FromStr`/dedicated-parse-error shape used
//! throughout this codebase, minus any database-mapping derive since
//! there is no database here: everything round-trips through `serde_json`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Coarse-grained state a [`Task`] is in. See [`crate::statemachine`] for
/// the transition table over this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Queued,
    Planning,
    Coding,
    Committing,
    Approval,
    Deploying,
    Testing,
    Reporting,
    Completed,
    Failed,
    Rollback,
    AwaitingApproval,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Planning => "planning",
            Self::Coding => "coding",
            Self::Committing => "committing",
            Self::Approval => "approval",
            Self::Deploying => "deploying",
            Self::Testing => "testing",
            Self::Reporting => "reporting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rollback => "rollback",
            Self::AwaitingApproval => "awaiting_approval",
        };
        f.write_str(s)
    }
}

impl FromStr for Phase {
    type Err = PhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "planning" => Ok(Self::Planning),
            "coding" => Ok(Self::Coding),
            "committing" => Ok(Self::Committing),
            "approval" => Ok(Self::Approval),
            "deploying" => Ok(Self::Deploying),
            "testing" => Ok(Self::Testing),
            "reporting" => Ok(Self::Reporting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rollback" => Ok(Self::Rollback),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            other => Err(PhaseParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Phase`] string.
#[derive(Debug, Clone)]
pub struct PhaseParseError(pub String);

impl fmt::Display for PhaseParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid phase: {:?}", self.0)
    }
}

impl std::error::Error for PhaseParseError {}

// ---------------------------------------------------------------------------
// Attempt status / fail reason
// ---------------------------------------------------------------------------

/// Terminal or in-progress status of an [`Attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Passed,
    Failed,
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Failure-reason taxonomy from the orchestrator's `failTask` path (§4.4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    Config,
    Ai,
    Git,
    ApprovalTimeout,
    Deploy,
    Test,
    Infra,
    Unknown,
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config_error",
            Self::Ai => "ai_error",
            Self::Git => "git_error",
            Self::ApprovalTimeout => "approval_timeout",
            Self::Deploy => "deploy_error",
            Self::Test => "test_error",
            Self::Infra => "infra_error",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Pipeline step status
// ---------------------------------------------------------------------------

/// Status of one [`PipelineStep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Proposal type / status / change action
// ---------------------------------------------------------------------------

/// Kind of fix a [`Proposal`] addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalType {
    DeployFix,
    TestFix,
    InfraFix,
}

impl fmt::Display for ProposalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DeployFix => "deploy_fix",
            Self::TestFix => "test_fix",
            Self::InfraFix => "infra_fix",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of a [`Proposal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Filesystem action one [`Change`] within a proposal describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Modify,
    Delete,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Data structs
// ---------------------------------------------------------------------------

/// External identifier tuple plus display metadata (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub platform: String,
    pub repo: String,
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub body: String,
}

/// A pull-request reference, populated once `reporting` creates one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub title: String,
}

/// A single change within a [`Proposal`] (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub path: String,
    pub action: ChangeAction,
    pub reason: String,
    /// File content before the change; empty for `create`.
    #[serde(default)]
    pub before: String,
    /// File content after the change; empty for `delete`.
    #[serde(default)]
    pub after: String,
}

/// A generated file change produced by the AI adapter during planning/coding
/// or retry analysis, before it becomes part of a committed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub action: ChangeAction,
    pub content: String,
}

/// An AI-suggested set of file changes awaiting human review (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: ProposalType,
    pub summary: String,
    pub reason: String,
    pub changes: Vec<Change>,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// The outcome of one `Deploy.Deploy` call, recorded on an [`Attempt`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployResult {
    pub success: bool,
    pub output: String,
    pub duration_ms: u64,
}

/// The outcome of one test runner's `Run` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub passed: bool,
    pub output: String,
    pub duration_ms: u64,
}

/// One pass through code -> commit -> deploy -> test for a task (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub number: u32,
    pub plan_summary: String,
    pub changed_paths: Vec<String>,
    pub deploy_result: Option<DeployResult>,
    pub test_results: Vec<TestResult>,
    pub status: AttemptStatus,
    pub fail_reason: Option<FailReason>,
}

impl Attempt {
    pub fn new(number: u32, plan_summary: impl Into<String>) -> Self {
        Self {
            number,
            plan_summary: plan_summary.into(),
            changed_paths: Vec::new(),
            deploy_result: None,
            test_results: Vec::new(),
            status: AttemptStatus::Running,
            fail_reason: None,
        }
    }
}

/// A timed record of one phase execution (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub phase: Phase,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: String,
    pub error: Option<String>,
}

/// The unit of work tracked by the engine (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub issue: Issue,
    pub phase: Phase,
    pub branch: String,
    pub attempts: Vec<Attempt>,
    pub proposals: Vec<Proposal>,
    pub pipeline: Vec<PipelineStep>,
    pub pr: Option<PullRequest>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Commit SHA of the task's most recent push, threaded into the
    /// deploy variable map. Not part of the distilled data model; carried
    /// so `Resume` (a separate engine entry point, possibly a separate
    /// process) can rebuild `COMMIT_SHA` without recommitting.
    #[serde(default)]
    pub commit_sha: Option<String>,
}

impl Task {
    /// Derive a branch name from the issue id, as used throughout `committing`.
    pub fn branch_name_for(issue: &Issue) -> String {
        format!("rig/issue-{}", issue.id)
    }

    pub fn new(id: u64, issue: Issue, now: DateTime<Utc>) -> Self {
        let branch = Self::branch_name_for(&issue);
        Self {
            id,
            issue,
            phase: Phase::Queued,
            branch,
            attempts: Vec::new(),
            proposals: Vec::new(),
            pipeline: Vec::new(),
            pr: None,
            created_at: now,
            completed_at: None,
            commit_sha: None,
        }
    }

    /// The most recently appended attempt, if any.
    pub fn current_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    pub fn current_attempt_mut(&mut self) -> Option<&mut Attempt> {
        self.attempts.last_mut()
    }

    /// The newest proposal with `status = pending`, if any (invariant 5, §3).
    pub fn pending_proposal(&self) -> Option<&Proposal> {
        self.proposals.iter().rev().find(|p| p.status == ProposalStatus::Pending)
    }

    pub fn pending_proposal_mut(&mut self) -> Option<&mut Proposal> {
        self.proposals.iter_mut().rev().find(|p| p.status == ProposalStatus::Pending)
    }
}

/// Top-level persisted document (§6): `{"version":"1.0","tasks":[...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub version: String,
    pub tasks: Vec<Task>,
    #[serde(default = "default_first_id")]
    pub next_task_id: u64,
    #[serde(default = "default_first_id")]
    pub next_proposal_id: u64,
}

fn default_first_id() -> u64 {
    1
}

impl Default for State {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            tasks: Vec::new(),
            next_task_id: 1,
            next_proposal_id: 1,
        }
    }
}

/// Phases that are not in the `inactivePhases` set (§4.2): a task in one of
/// these phases is "active"/"in-flight" for duplicate-suppression purposes.
pub const INACTIVE_PHASES: [Phase; 4] = [
    Phase::Completed,
    Phase::Failed,
    Phase::Rollback,
    Phase::AwaitingApproval,
];

impl Phase {
    /// True if this phase counts as inactive for duplicate suppression (§4.2).
    pub fn is_inactive(&self) -> bool {
        INACTIVE_PHASES.contains(self)
    }

    /// True if this phase has no outgoing transitions (§4.2).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Rollback)
    }
}

impl State {
    /// Allocate the next task id and advance the counter.
    pub fn alloc_task_id(&mut self) -> u64 {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    /// Allocate the next proposal id and advance the counter.
    pub fn alloc_proposal_id(&mut self) -> u64 {
        let id = self.next_proposal_id;
        self.next_proposal_id += 1;
        id
    }

    pub fn find_task(&self, task_id: u64) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn find_task_mut(&mut self, task_id: u64) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    pub fn find_task_by_issue(&self, issue_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.issue.id == issue_id)
    }

    /// True iff some task for `issue_id` is active (§8 invariant 6).
    pub fn is_in_flight(&self, issue_id: &str) -> bool {
        self.tasks
            .iter()
            .any(|t| t.issue.id == issue_id && !t.phase.is_inactive())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_display_roundtrip() {
        let variants = [
            Phase::Queued,
            Phase::Planning,
            Phase::Coding,
            Phase::Committing,
            Phase::Approval,
            Phase::Deploying,
            Phase::Testing,
            Phase::Reporting,
            Phase::Completed,
            Phase::Failed,
            Phase::Rollback,
            Phase::AwaitingApproval,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: Phase = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn phase_invalid() {
        assert!("bogus".parse::<Phase>().is_err());
    }

    #[test]
    fn inactive_phases_match_table() {
        assert!(Phase::Completed.is_inactive());
        assert!(Phase::Failed.is_inactive());
        assert!(Phase::Rollback.is_inactive());
        assert!(Phase::AwaitingApproval.is_inactive());
        assert!(!Phase::Coding.is_inactive());
        assert!(!Phase::Deploying.is_inactive());
    }

    #[test]
    fn terminal_phases_match_table() {
        assert!(Phase::Completed.is_terminal());
        assert!(Phase::Rollback.is_terminal());
        assert!(!Phase::Failed.is_terminal());
        assert!(!Phase::AwaitingApproval.is_terminal());
    }

    #[test]
    fn state_default_is_empty_with_counters_at_one() {
        let state = State::default();
        assert_eq!(state.version, "1.0");
        assert!(state.tasks.is_empty());
        assert_eq!(state.next_task_id, 1);
        assert_eq!(state.next_proposal_id, 1);
    }

    #[test]
    fn alloc_task_id_is_monotonic() {
        let mut state = State::default();
        assert_eq!(state.alloc_task_id(), 1);
        assert_eq!(state.alloc_task_id(), 2);
        assert_eq!(state.alloc_task_id(), 3);
    }

    #[test]
    fn is_in_flight_true_only_for_active_phases() {
        let mut state = State::default();
        let issue = Issue {
            platform: "github".to_string(),
            repo: "acme/widgets".to_string(),
            id: "99".to_string(),
            title: "Widget broke".to_string(),
            url: "https://example.com/99".to_string(),
            labels: vec![],
            body: String::new(),
        };
        let id = state.alloc_task_id();
        let mut task = Task::new(id, issue.clone(), Utc::now());
        task.phase = Phase::Coding;
        state.tasks.push(task);

        assert!(state.is_in_flight("99"));

        state.tasks[0].phase = Phase::Completed;
        assert!(!state.is_in_flight("99"));
    }

    #[test]
    fn pending_proposal_is_the_newest_pending_one() {
        let mut task = Task::new(
            1,
            Issue {
                platform: "github".to_string(),
                repo: "acme/widgets".to_string(),
                id: "1".to_string(),
                title: "t".to_string(),
                url: "u".to_string(),
                labels: vec![],
                body: String::new(),
            },
            Utc::now(),
        );
        task.proposals.push(Proposal {
            id: 1,
            kind: ProposalType::DeployFix,
            summary: "first".to_string(),
            reason: "r".to_string(),
            changes: vec![],
            status: ProposalStatus::Rejected,
            created_at: Utc::now(),
            reviewed_at: Some(Utc::now()),
        });
        task.proposals.push(Proposal {
            id: 2,
            kind: ProposalType::DeployFix,
            summary: "second".to_string(),
            reason: "r".to_string(),
            changes: vec![],
            status: ProposalStatus::Pending,
            created_at: Utc::now(),
            reviewed_at: None,
        });

        let pending = task.pending_proposal().expect("should have a pending proposal");
        assert_eq!(pending.id, 2);
    }
}

//! Adapter contracts consumed by the orchestrator (§6).
//!
//! These traits are the only thing this crate defines for AI, source
//! control, deployment, testing, and notification: the wire protocols,
//! process execution, and network calls behind each one are explicitly
//! out of scope (§1). Each trait is object-safe, mirroring how this
//! lineage separates a narrow adapter contract (e.g. `Harness`) from the
//! concrete backends that implement it — `Box<dyn AiBackend>` and
//! friends are what the orchestrator actually holds.
//!
//! [`fixtures`] ships `Noop`/in-memory implementations used by the
//! orchestrator's own tests; there is no production backend here.

pub mod fixtures;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::model::{ChangeAction, DeployResult, FileChange, Issue, PullRequest, TestResult};

/// A plan produced by `AI.AnalyzeIssue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub summary: String,
    pub steps: Vec<String>,
}

/// One proposed change within a [`ProposedFix`] (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedChange {
    pub path: String,
    pub action: ChangeAction,
    pub reason: String,
    pub content: String,
}

/// The output of `AI.AnalyzeDeployFailure` (§4.4.4, §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedFix {
    pub summary: String,
    pub reason: String,
    pub changes: Vec<ProposedChange>,
}

/// Adapter interface for the AI backend (§6). Out of scope: the wire
/// protocol to any specific provider.
#[async_trait]
pub trait AiBackend: Send + Sync {
    /// Produce a plan for `issue` given joined project context.
    async fn analyze_issue(&self, issue: &Issue, project_context: &str) -> anyhow::Result<Plan>;

    /// Generate file changes implementing `plan`. `repo_files` is a
    /// path -> content snapshot of the files currently known to the
    /// agent; empty on the first pass (§4.4.2 step 3).
    async fn generate_code(
        &self,
        plan: &Plan,
        repo_files: &BTreeMap<String, String>,
    ) -> anyhow::Result<Vec<FileChange>>;

    /// Propose a fix for failing tests given `logs` and the current code.
    async fn analyze_failure(
        &self,
        logs: &str,
        current_code: &BTreeMap<String, String>,
    ) -> anyhow::Result<Vec<FileChange>>;

    /// Propose an infrastructure fix for a failed deploy given `logs` and
    /// the infra files read in the deploy-failure branch (§4.4.4).
    async fn analyze_deploy_failure(
        &self,
        logs: &str,
        infra_files: &BTreeMap<String, String>,
    ) -> anyhow::Result<ProposedFix>;
}

/// Adapter interface for source control (§6). Out of scope: the actual
/// VCS wire protocol.
#[async_trait]
pub trait GitAdapter: Send + Sync {
    async fn clone_or_pull(&self, owner: &str, repo: &str, token: &str) -> anyhow::Result<()>;

    async fn create_branch(&self, name: &str) -> anyhow::Result<()>;

    async fn commit_and_push(
        &self,
        changes: &[FileChange],
        message: &str,
    ) -> anyhow::Result<String>;

    async fn create_pr(
        &self,
        base: &str,
        head: &str,
        title: &str,
        body: &str,
    ) -> anyhow::Result<PullRequest>;

    /// Clean up the local workspace after a task completes or fails.
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// Best-effort removal of the remote branch, used by `failTask` (§4.4.8).
    async fn cleanup_branch(&self, name: &str) -> anyhow::Result<()>;
}

/// Adapter interface for the deployment target (§6). Out of scope: the
/// actual command/SSH execution.
#[async_trait]
pub trait DeployAdapter: Send + Sync {
    /// Validate the adapter is usable before the engine starts a task.
    async fn validate(&self) -> anyhow::Result<()>;

    async fn deploy(&self, vars: &BTreeMap<String, String>) -> anyhow::Result<DeployResult>;

    async fn rollback(&self) -> anyhow::Result<DeployResult>;
}

/// Adapter interface for one test runner (§6). The orchestrator holds an
/// ordered list of these and runs each in turn (§4.4.2 step 7).
#[async_trait]
pub trait TestRunner: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, vars: &BTreeMap<String, String>) -> anyhow::Result<TestResult>;
}

/// Best-effort notification sink (§6). Errors are logged by the caller
/// and never change task outcome.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> anyhow::Result<()>;
}

/// Helper used by fixtures and real adapters alike: wrap a closure's
/// wall-clock duration into milliseconds, matching the `duration_ms`
/// field recorded on [`DeployResult`]/[`TestResult`].
pub(crate) fn as_millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

// Compile-time object-safety assertions, matching this lineage's pattern
// of proving each adapter trait can be stored as `Box<dyn Trait>`.
const _: () = {
    fn _ai(_: &dyn AiBackend) {}
    fn _git(_: &dyn GitAdapter) {}
    fn _deploy(_: &dyn DeployAdapter) {}
    fn _test(_: &dyn TestRunner) {}
    fn _notifier(_: &dyn Notifier) {}
};

//! Placeholder adapters wired into the CLI's `Engine`.
//!
//! AI/Git/Deploy/Test backends are deliberately out of scope for this
//! codebase (§1): it defines the contracts an operator's own backend
//! must implement, not a concrete one. Every method here returns an
//! error naming the trait it stands in for, so a `dispatch`/`serve` run
//! fails loudly and immediately instead of silently doing nothing —
//! useful for exercising the engine's phase sequencing and exit-code
//! behavior ahead of a real backend being plugged in.
//!
//! [`TracingNotifier`] is the one exception: logging a message is itself
//! a legitimate notification channel, so it is implemented for real.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rig_core::adapters::{AiBackend, DeployAdapter, GitAdapter, Notifier, Plan, ProposedFix, TestRunner};
use rig_core::model::{DeployResult, FileChange, Issue, PullRequest, TestResult};

fn unimplemented(adapter: &str) -> anyhow::Error {
    anyhow::anyhow!(
        "{adapter} has no concrete implementation configured; this build only wires the contract"
    )
}

pub struct UnimplementedAi;

#[async_trait]
impl AiBackend for UnimplementedAi {
    async fn analyze_issue(&self, _issue: &Issue, _project_context: &str) -> anyhow::Result<Plan> {
        Err(unimplemented("AiBackend::analyze_issue"))
    }

    async fn generate_code(
        &self,
        _plan: &Plan,
        _repo_files: &BTreeMap<String, String>,
    ) -> anyhow::Result<Vec<FileChange>> {
        Err(unimplemented("AiBackend::generate_code"))
    }

    async fn analyze_failure(
        &self,
        _logs: &str,
        _current_code: &BTreeMap<String, String>,
    ) -> anyhow::Result<Vec<FileChange>> {
        Err(unimplemented("AiBackend::analyze_failure"))
    }

    async fn analyze_deploy_failure(
        &self,
        _logs: &str,
        _infra_files: &BTreeMap<String, String>,
    ) -> anyhow::Result<ProposedFix> {
        Err(unimplemented("AiBackend::analyze_deploy_failure"))
    }
}

pub struct UnimplementedGit;

#[async_trait]
impl GitAdapter for UnimplementedGit {
    async fn clone_or_pull(&self, _owner: &str, _repo: &str, _token: &str) -> anyhow::Result<()> {
        Err(unimplemented("GitAdapter::clone_or_pull"))
    }

    async fn create_branch(&self, _name: &str) -> anyhow::Result<()> {
        Err(unimplemented("GitAdapter::create_branch"))
    }

    async fn commit_and_push(&self, _changes: &[FileChange], _message: &str) -> anyhow::Result<String> {
        Err(unimplemented("GitAdapter::commit_and_push"))
    }

    async fn create_pr(
        &self,
        _base: &str,
        _head: &str,
        _title: &str,
        _body: &str,
    ) -> anyhow::Result<PullRequest> {
        Err(unimplemented("GitAdapter::create_pr"))
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn cleanup_branch(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct UnimplementedDeploy;

#[async_trait]
impl DeployAdapter for UnimplementedDeploy {
    async fn validate(&self) -> anyhow::Result<()> {
        Err(unimplemented("DeployAdapter::validate"))
    }

    async fn deploy(&self, _vars: &BTreeMap<String, String>) -> anyhow::Result<DeployResult> {
        Err(unimplemented("DeployAdapter::deploy"))
    }

    async fn rollback(&self) -> anyhow::Result<DeployResult> {
        Err(unimplemented("DeployAdapter::rollback"))
    }
}

pub struct UnimplementedTestRunner;

#[async_trait]
impl TestRunner for UnimplementedTestRunner {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn run(&self, _vars: &BTreeMap<String, String>) -> anyhow::Result<TestResult> {
        Err(unimplemented("TestRunner::run"))
    }
}

/// A `Notifier` that logs every message at `info` via `tracing`.
#[derive(Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, message: &str) -> anyhow::Result<()> {
        tracing::info!(%message, "notification");
        Ok(())
    }
}

//! In-memory/`Noop` adapter implementations used by this crate's own
//! tests (§6: "the crate ships the trait definitions... and
//! `Noop`/in-memory fixtures exercised by the orchestrator's own
//! tests"). None of these talk to a network, a process, or disk beyond
//! what a test explicitly wires up.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::model::{DeployResult, FileChange, Issue, PullRequest, TestResult};

use super::{AiBackend, DeployAdapter, GitAdapter, Notifier, Plan, ProposedFix, TestRunner};

/// An `AiBackend` whose four responses are fixed at construction time.
/// Every call returns a clone of the same canned value, and failure
/// analysis/deploy-failure analysis can be made to return an error by
/// constructing with `Err(..)` via [`ScriptedAi::failing`].
pub struct ScriptedAi {
    pub plan: Plan,
    pub generated: Vec<FileChange>,
    pub failure_fix: Vec<FileChange>,
    pub deploy_fix: Option<ProposedFix>,
    pub fail_analysis: bool,
}

impl ScriptedAi {
    pub fn new(plan: Plan, generated: Vec<FileChange>) -> Self {
        Self {
            plan,
            generated,
            failure_fix: Vec::new(),
            deploy_fix: None,
            fail_analysis: false,
        }
    }

    pub fn with_failure_fix(mut self, changes: Vec<FileChange>) -> Self {
        self.failure_fix = changes;
        self
    }

    pub fn with_deploy_fix(mut self, fix: ProposedFix) -> Self {
        self.deploy_fix = Some(fix);
        self
    }

    /// An `AiBackend` whose `analyze_failure` always errors, used to
    /// exercise the "AI analysis errors are fatal for the retry loop" path.
    pub fn failing() -> Self {
        Self {
            plan: Plan {
                summary: String::new(),
                steps: vec![],
            },
            generated: vec![],
            failure_fix: vec![],
            deploy_fix: None,
            fail_analysis: true,
        }
    }
}

#[async_trait]
impl AiBackend for ScriptedAi {
    async fn analyze_issue(&self, _issue: &Issue, _project_context: &str) -> anyhow::Result<Plan> {
        Ok(self.plan.clone())
    }

    async fn generate_code(
        &self,
        _plan: &Plan,
        _repo_files: &BTreeMap<String, String>,
    ) -> anyhow::Result<Vec<FileChange>> {
        Ok(self.generated.clone())
    }

    async fn analyze_failure(
        &self,
        _logs: &str,
        _current_code: &BTreeMap<String, String>,
    ) -> anyhow::Result<Vec<FileChange>> {
        if self.fail_analysis {
            anyhow::bail!("scripted AI failure analysis error");
        }
        Ok(self.failure_fix.clone())
    }

    async fn analyze_deploy_failure(
        &self,
        _logs: &str,
        _infra_files: &BTreeMap<String, String>,
    ) -> anyhow::Result<ProposedFix> {
        self.deploy_fix
            .clone()
            .ok_or_else(|| anyhow::anyhow!("ScriptedAi has no deploy_fix configured"))
    }
}

/// A `GitAdapter` that records every call it receives and always
/// succeeds. Useful for asserting on call order/arguments in tests.
#[derive(Default)]
pub struct RecordingGit {
    pub calls: Mutex<Vec<String>>,
    pub pr_counter: Mutex<u64>,
}

impl RecordingGit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl GitAdapter for RecordingGit {
    async fn clone_or_pull(&self, owner: &str, repo: &str, _token: &str) -> anyhow::Result<()> {
        self.record(format!("clone_or_pull {owner}/{repo}"));
        Ok(())
    }

    async fn create_branch(&self, name: &str) -> anyhow::Result<()> {
        self.record(format!("create_branch {name}"));
        Ok(())
    }

    async fn commit_and_push(
        &self,
        changes: &[FileChange],
        message: &str,
    ) -> anyhow::Result<String> {
        self.record(format!("commit_and_push {} files: {message}", changes.len()));
        Ok(format!("sha-{}", self.calls.lock().unwrap().len()))
    }

    async fn create_pr(
        &self,
        base: &str,
        head: &str,
        title: &str,
        _body: &str,
    ) -> anyhow::Result<PullRequest> {
        self.record(format!("create_pr {base} <- {head}: {title}"));
        let mut counter = self.pr_counter.lock().unwrap();
        *counter += 1;
        Ok(PullRequest {
            number: *counter,
            url: format!("https://example.com/pr/{counter}"),
            title: title.to_string(),
        })
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        self.record("cleanup");
        Ok(())
    }

    async fn cleanup_branch(&self, name: &str) -> anyhow::Result<()> {
        self.record(format!("cleanup_branch {name}"));
        Ok(())
    }
}

/// A `DeployAdapter` whose `deploy()` results are drawn from a
/// fixed, exhaustible queue; the last entry repeats once the queue is
/// drained. `rollback()` call count is tracked separately.
pub struct ScriptedDeploy {
    results: Mutex<VecDeque<DeployResult>>,
    last: Mutex<Option<DeployResult>>,
    pub rollback_calls: Mutex<u32>,
}

impl ScriptedDeploy {
    pub fn new(results: impl IntoIterator<Item = DeployResult>) -> Self {
        Self {
            results: Mutex::new(results.into_iter().collect()),
            last: Mutex::new(None),
            rollback_calls: Mutex::new(0),
        }
    }

    /// A deploy adapter that always succeeds.
    pub fn always_succeeds() -> Self {
        Self::new([DeployResult {
            success: true,
            output: "deployed".into(),
            duration_ms: 5,
        }])
    }

    pub fn rollback_call_count(&self) -> u32 {
        *self.rollback_calls.lock().unwrap()
    }
}

#[async_trait]
impl DeployAdapter for ScriptedDeploy {
    async fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn deploy(&self, _vars: &BTreeMap<String, String>) -> anyhow::Result<DeployResult> {
        let mut queue = self.results.lock().unwrap();
        let result = queue.pop_front().unwrap_or_else(|| {
            self.last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(DeployResult {
                    success: true,
                    output: "deployed".into(),
                    duration_ms: 5,
                })
        });
        *self.last.lock().unwrap() = Some(result.clone());
        Ok(result)
    }

    async fn rollback(&self) -> anyhow::Result<DeployResult> {
        *self.rollback_calls.lock().unwrap() += 1;
        Ok(DeployResult {
            success: true,
            output: "rolled back".into(),
            duration_ms: 1,
        })
    }
}

/// A named `TestRunner` whose pass/fail outcomes are drawn from a fixed,
/// exhaustible queue; the last entry repeats once drained.
pub struct ScriptedTestRunner {
    name: String,
    outcomes: Mutex<VecDeque<bool>>,
    last: Mutex<bool>,
}

impl ScriptedTestRunner {
    pub fn new(name: impl Into<String>, outcomes: impl IntoIterator<Item = bool>) -> Self {
        Self {
            name: name.into(),
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            last: Mutex::new(true),
        }
    }

    pub fn always_passes(name: impl Into<String>) -> Self {
        Self::new(name, [true])
    }
}

#[async_trait]
impl TestRunner for ScriptedTestRunner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _vars: &BTreeMap<String, String>) -> anyhow::Result<TestResult> {
        let mut queue = self.outcomes.lock().unwrap();
        let passed = queue.pop_front().unwrap_or_else(|| *self.last.lock().unwrap());
        *self.last.lock().unwrap() = passed;
        Ok(TestResult {
            name: self.name.clone(),
            kind: "scripted".into(),
            passed,
            output: if passed { "ok".into() } else { "failure".into() },
            duration_ms: 1,
        })
    }
}

/// A `Notifier` that swallows every message. The production default:
/// notifications are best-effort and the engine must work with none
/// configured.
#[derive(Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A `Notifier` that records every message it receives, for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    pub messages: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) -> anyhow::Result<()> {
        self.messages.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_deploy_repeats_last_result_once_drained() {
        let deploy = ScriptedDeploy::new([DeployResult {
            success: false,
            output: "boom".into(),
            duration_ms: 1,
        }]);
        let vars = BTreeMap::new();
        let first = deploy.deploy(&vars).await.unwrap();
        let second = deploy.deploy(&vars).await.unwrap();
        assert!(!first.success);
        assert!(!second.success);
    }

    #[tokio::test]
    async fn scripted_test_runner_yields_fail_then_pass() {
        let runner = ScriptedTestRunner::new("unit", [false, true]);
        let vars = BTreeMap::new();
        assert!(!runner.run(&vars).await.unwrap().passed);
        assert!(runner.run(&vars).await.unwrap().passed);
    }

    #[tokio::test]
    async fn recording_git_tracks_call_order() {
        let git = RecordingGit::new();
        git.clone_or_pull("acme", "widgets", "tok").await.unwrap();
        git.create_branch("rig/issue-1").await.unwrap();
        assert_eq!(
            git.calls(),
            vec![
                "clone_or_pull acme/widgets".to_string(),
                "create_branch rig/issue-1".to_string(),
            ]
        );
    }
}

//! Shared test scaffolding for `rig-core` and `rig-cli` integration tests.
//!
//! Everything here is in-memory or backed by a temp directory: there is no
//! external service to stand up, so unlike a database-backed test harness
//! this has no shared/lazy-initialized fixture to coordinate across test
//! binaries — every test gets its own [`tempfile::TempDir`] and its own
//! [`StateStore`].

use std::sync::Arc;

use rig_core::adapters::fixtures::{
    NoopNotifier, RecordingGit, ScriptedAi, ScriptedDeploy, ScriptedTestRunner,
};
use rig_core::adapters::Plan;
use rig_core::config::EngineConfig;
use rig_core::model::Issue;
use rig_core::orchestrator::Engine;
use rig_core::store::StateStore;

/// A fresh [`StateStore`] over a file inside a freshly created temp
/// directory. The directory is returned so the caller can keep it alive
/// for the lifetime of the test (it is removed on drop).
pub fn temp_store() -> (tempfile::TempDir, StateStore) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let store = StateStore::new(dir.path().join("state.json"));
    (dir, store)
}

/// A minimally-plausible [`Issue`] for tests that don't care about its
/// contents beyond having a stable id.
pub fn sample_issue(id: &str) -> Issue {
    Issue {
        platform: "github".to_string(),
        repo: "acme/widgets".to_string(),
        id: id.to_string(),
        title: format!("issue {id}"),
        url: format!("https://example.com/issues/{id}"),
        labels: vec![],
        body: String::new(),
    }
}

/// An [`Engine`] wired to all-succeeding fixture adapters and `store`,
/// suitable as a starting point for a happy-path test; callers override
/// individual adapters by building their own [`Engine::new`] call when a
/// test needs a specific failure mode.
pub fn happy_path_engine(store: StateStore) -> Engine {
    let plan = Plan {
        summary: "apply the requested fix".to_string(),
        steps: vec!["patch the affected file".to_string()],
    };
    Engine::new(
        EngineConfig::defaults(),
        store,
        Arc::new(ScriptedAi::new(plan, vec![])),
        Arc::new(RecordingGit::new()),
        Arc::new(ScriptedDeploy::always_succeeds()),
        vec![Arc::new(ScriptedTestRunner::always_passes("unit"))],
        vec![Arc::new(NoopNotifier)],
    )
}

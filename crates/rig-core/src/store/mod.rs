//! Durable, atomically-written snapshot of all tasks (§4.1).
//!
//! The store owns the on-disk state file: `Load` returns an empty
//! [`State`] if the file does not exist, `Save` writes to a `.tmp`
//! sibling and renames it into place, and `WithState` composes the two
//! under a process-wide mutex so concurrent callers in this process never
//! interleave a load/mutate/save cycle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use crate::model::{State, Task};

/// Durable state store backed by a single JSON file.
///
/// Cheap to clone: the mutex and path live behind an `Arc`, so every
/// clone serialises against the same on-disk file (§5, "Shared-resource
/// policy").
#[derive(Clone)]
pub struct StateStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state file. A missing file is not an error: it yields a
    /// fresh, empty [`State`] (§4.1).
    pub async fn load(&self) -> Result<State> {
        let _guard = self.lock.lock().await;
        Self::load_locked(&self.path).await
    }

    async fn load_locked(path: &Path) -> Result<State> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt state file at {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(State::default()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read state file at {}", path.display()))
            }
        }
    }

    /// Persist `state`, writing to `<path>.tmp` then renaming over `path`
    /// (§4.1, §6). Ensures the parent directory exists first; removes the
    /// temp file if the rename fails.
    pub async fn save(&self, state: &State) -> Result<()> {
        let _guard = self.lock.lock().await;
        Self::save_locked(&self.path, state).await
    }

    async fn save_locked(path: &Path, state: &State) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("failed to create directory {}", dir.display()))?;
            }
        }

        let tmp_path = Self::tmp_path(path);
        let body = serde_json::to_vec_pretty(state).context("failed to serialise state")?;
        tokio::fs::write(&tmp_path, &body)
            .await
            .with_context(|| format!("failed to write temp state file {}", tmp_path.display()))?;

        match tokio::fs::rename(&tmp_path, path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                Err(e).with_context(|| {
                    format!(
                        "failed to rename {} -> {}",
                        tmp_path.display(),
                        path.display()
                    )
                })
            }
        }
    }

    fn tmp_path(path: &Path) -> PathBuf {
        let mut s = path.as_os_str().to_owned();
        s.push(".tmp");
        PathBuf::from(s)
    }

    /// Load, apply `mutate`, and save, all under the store's mutex so the
    /// whole cycle is serialised against other callers in this process.
    ///
    /// `mutate` returns a value `T` threaded back out to the caller
    /// (typically a reference into the just-saved state, e.g. a new task
    /// id), alongside the mutated state that gets persisted.
    pub async fn with_state<T, F>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut State) -> T,
    {
        let _guard = self.lock.lock().await;
        let mut state = Self::load_locked(&self.path).await?;
        let out = mutate(&mut state);
        Self::save_locked(&self.path, &state).await?;
        Ok(out)
    }

    /// Convenience lookup: find a task by id in an already-loaded state.
    pub fn find_task(state: &State, task_id: u64) -> Option<&Task> {
        state.find_task(task_id)
    }

    /// Convenience lookup: find a task by the triggering issue's external id.
    pub fn find_task_by_issue(state: &State, issue_id: &str) -> Option<&Task> {
        state.find_task_by_issue(issue_id)
    }

    /// True iff some task for `issue_id` is active (§8 invariant 6).
    pub fn is_in_flight(state: &State, issue_id: &str) -> bool {
        state.is_in_flight(issue_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Issue, Task};
    use chrono::Utc;

    fn issue(id: &str) -> Issue {
        Issue {
            platform: "github".into(),
            repo: "acme/widgets".into(),
            id: id.into(),
            title: "t".into(),
            url: "u".into(),
            labels: vec![],
            body: String::new(),
        }
    }

    #[tokio::test]
    async fn load_missing_file_yields_default_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let state = store.load().await.unwrap();
        assert_eq!(state.version, "1.0");
        assert!(state.tasks.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_roundtrips_structurally() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);

        let mut state = State::default();
        let id = state.alloc_task_id();
        state.tasks.push(Task::new(id, issue("1"), Utc::now()));
        store.save(&state).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.tasks.len(), 1);
        assert_eq!(loaded.tasks[0].id, id);
        assert_eq!(loaded.next_task_id, state.next_task_id);
    }

    #[tokio::test]
    async fn save_leaves_no_tmp_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let store = StateStore::new(&path);
        store.save(&State::default()).await.unwrap();

        assert!(path.exists());
        let tmp = StateStore::tmp_path(&path);
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn with_state_persists_the_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let id = store
            .with_state(|state| {
                let id = state.alloc_task_id();
                state.tasks.push(Task::new(id, issue("42"), Utc::now()));
                id
            })
            .await
            .unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.tasks.len(), 1);
        assert_eq!(loaded.tasks[0].id, id);
    }

    #[tokio::test]
    async fn is_in_flight_reflects_loaded_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        store
            .with_state(|state| {
                let id = state.alloc_task_id();
                state.tasks.push(Task::new(id, issue("99"), Utc::now()));
            })
            .await
            .unwrap();

        let state = store.load().await.unwrap();
        assert!(StateStore::is_in_flight(&state, "99"));
        assert!(!StateStore::is_in_flight(&state, "100"));
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"not json").unwrap();
        let store = StateStore::new(&path);
        assert!(store.load().await.is_err());
    }
}

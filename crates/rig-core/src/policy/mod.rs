//! Pre-commit policy gate (§4.4.7).
//!
//! Consulted by the orchestrator before entering `committing`. Each rule
//! either `block`s the task into `failed` with `fail_reason = config`, or
//! `warn`s (logged, execution continues).

use serde::{Deserialize, Serialize};

use crate::model::{FileChange, Task};

/// One recognised policy rule and the value it's parameterised over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum PolicyRuleKind {
    /// Violation if `len(changes) > value`.
    MaxFileChanges { value: usize },
    /// Violation if any change path matches a pattern. A pattern ending
    /// in `/` matches as a directory prefix; otherwise it matches as a
    /// plain prefix or a `*`/`?` glob over the whole path.
    BlockedPaths { patterns: Vec<String> },
    /// Violation if no test runner is configured for this engine. Checked
    /// pre-commit (§4.4.7), before this attempt's own tests have had a
    /// chance to run, so it gates on whether tests *will* run rather than
    /// on past results.
    RequireTests,
    /// Violation if the task's attempt count exceeds `value`.
    MaxRetries { value: usize },
}

/// What to do when a rule is violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Block,
    Warn,
}

/// A configured rule plus the action to take on violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(flatten)]
    pub kind: PolicyRuleKind,
    pub action: PolicyAction,
}

/// One rule that was found to be violated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
    pub rule: PolicyRuleKind,
    pub action: PolicyAction,
    pub message: String,
}

/// Evaluate every configured rule against `changes`/`task`, returning
/// every violation found (both `warn` and `block` ones — the caller
/// decides what to do with each, matching §4.4.7's "each violation has
/// an action"). `has_test_runners` is the engine-level signal `RequireTests`
/// checks against — whether *any* runner is wired up, since no attempt's
/// own test results exist yet at this point in the phase sequence.
pub fn evaluate(
    rules: &[PolicyRule],
    task: &Task,
    changes: &[FileChange],
    has_test_runners: bool,
) -> Vec<PolicyViolation> {
    rules
        .iter()
        .filter_map(|rule| check(rule, task, changes, has_test_runners))
        .collect()
}

fn check(
    rule: &PolicyRule,
    task: &Task,
    changes: &[FileChange],
    has_test_runners: bool,
) -> Option<PolicyViolation> {
    let message = match &rule.kind {
        PolicyRuleKind::MaxFileChanges { value } => {
            if changes.len() > *value {
                Some(format!(
                    "change set has {} files, exceeds max_file_changes={value}",
                    changes.len()
                ))
            } else {
                None
            }
        }
        PolicyRuleKind::BlockedPaths { patterns } => changes
            .iter()
            .find(|c| patterns.iter().any(|p| path_matches(p, &c.path)))
            .map(|c| format!("path {:?} matches a blocked_paths pattern", c.path)),
        PolicyRuleKind::RequireTests => {
            if has_test_runners {
                None
            } else {
                Some("no test runner is configured for this engine".to_string())
            }
        }
        PolicyRuleKind::MaxRetries { value } => {
            if task.attempts.len() > *value {
                Some(format!(
                    "task has {} attempts, exceeds max_retries={value}",
                    task.attempts.len()
                ))
            } else {
                None
            }
        }
    }?;

    Some(PolicyViolation {
        rule: rule.kind.clone(),
        action: rule.action,
        message,
    })
}

/// Match a `blocked_paths` pattern against a file path (§4.4.7): a
/// trailing `/` means "prefix of directory"; otherwise the pattern is
/// tried as a plain prefix, then as a `*`/`?` glob over the whole path.
fn path_matches(pattern: &str, path: &str) -> bool {
    if let Some(dir) = pattern.strip_suffix('/') {
        return path == dir || path.starts_with(&format!("{dir}/"));
    }
    if path.starts_with(pattern) {
        return true;
    }
    glob_match(pattern, path)
}

/// A minimal `*`/`?` glob matcher (no character classes, no `**`):
/// `*` matches any run of characters, `?` matches exactly one.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_rec(&p, &t)
}

fn glob_match_rec(p: &[char], t: &[char]) -> bool {
    match p.first() {
        None => t.is_empty(),
        Some('*') => {
            glob_match_rec(&p[1..], t) || (!t.is_empty() && glob_match_rec(p, &t[1..]))
        }
        Some('?') => !t.is_empty() && glob_match_rec(&p[1..], &t[1..]),
        Some(c) => t.first() == Some(c) && glob_match_rec(&p[1..], &t[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeAction, Issue};
    use chrono::Utc;

    fn task() -> Task {
        Task::new(
            1,
            Issue {
                platform: "github".into(),
                repo: "acme/widgets".into(),
                id: "1".into(),
                title: "t".into(),
                url: "u".into(),
                labels: vec![],
                body: String::new(),
            },
            Utc::now(),
        )
    }

    fn change(path: &str) -> FileChange {
        FileChange {
            path: path.to_string(),
            action: ChangeAction::Modify,
            content: String::new(),
        }
    }

    #[test]
    fn max_file_changes_blocks_over_limit() {
        let rules = vec![PolicyRule {
            kind: PolicyRuleKind::MaxFileChanges { value: 1 },
            action: PolicyAction::Block,
        }];
        let changes = vec![change("a.rs"), change("b.rs")];
        let violations = evaluate(&rules, &task(), &changes, true);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].action, PolicyAction::Block);
    }

    #[test]
    fn max_file_changes_allows_at_limit() {
        let rules = vec![PolicyRule {
            kind: PolicyRuleKind::MaxFileChanges { value: 2 },
            action: PolicyAction::Block,
        }];
        let changes = vec![change("a.rs"), change("b.rs")];
        assert!(evaluate(&rules, &task(), &changes, true).is_empty());
    }

    #[test]
    fn blocked_paths_directory_prefix() {
        let rules = vec![PolicyRule {
            kind: PolicyRuleKind::BlockedPaths {
                patterns: vec!["secrets/".to_string()],
            },
            action: PolicyAction::Block,
        }];
        let changes = vec![change("secrets/prod.env")];
        assert_eq!(evaluate(&rules, &task(), &changes, true).len(), 1);
        let ok = vec![change("src/secrets_handler.rs")];
        assert!(evaluate(&rules, &task(), &ok, true).is_empty());
    }

    #[test]
    fn blocked_paths_glob() {
        let rules = vec![PolicyRule {
            kind: PolicyRuleKind::BlockedPaths {
                patterns: vec!["*.lock".to_string()],
            },
            action: PolicyAction::Warn,
        }];
        let changes = vec![change("Cargo.lock")];
        let v = evaluate(&rules, &task(), &changes, true);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].action, PolicyAction::Warn);
    }

    #[test]
    fn require_tests_violated_with_no_runner_configured() {
        let rules = vec![PolicyRule {
            kind: PolicyRuleKind::RequireTests,
            action: PolicyAction::Block,
        }];
        assert_eq!(evaluate(&rules, &task(), &[], false).len(), 1);
        assert!(evaluate(&rules, &task(), &[], true).is_empty());
    }

    #[test]
    fn max_retries_counts_attempts() {
        let mut t = task();
        t.attempts.push(crate::model::Attempt::new(1, "p1"));
        t.attempts.push(crate::model::Attempt::new(2, "p2"));
        let rules = vec![PolicyRule {
            kind: PolicyRuleKind::MaxRetries { value: 1 },
            action: PolicyAction::Block,
        }];
        assert_eq!(evaluate(&rules, &t, &[], true).len(), 1);
    }
}

//! Resolves the `rig.toml` path and scaffolds a fresh one for `rig init`.
//!
//! Unlike a global `~/.config/...` operator config, `rig.toml` is
//! project-scoped: it lives alongside the repository being orchestrated, so
//! resolution is a CLI-flag-or-default lookup rather than an XDG one.
//! [`rig_core::config::EngineConfig`] owns everything about what the file
//! means once it's found; this module only finds and seeds it.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

pub const DEFAULT_CONFIG_PATH: &str = "rig.toml";

pub fn resolve(flag: Option<PathBuf>) -> PathBuf {
    flag.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Write a default `rig.toml` at `path`. Refuses to overwrite an existing
/// file unless `force` is set.
pub fn scaffold(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    std::fs::write(path, TEMPLATE)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

const TEMPLATE: &str = r#"# rig.toml - task orchestration engine configuration.
#
# webhook_secret is better supplied via the RIG_WEBHOOK_SECRET environment
# variable than checked in here; the engine prefers the env var when both
# are set.

state_path = ".rig/state.json"
webhook_secret = ""
max_retry = 0
rollback_enabled = true
base_branch = "main"

# [[triggers]]
# event = "issues"
# labels = ["rig"]

# [[policy]]
# rule = "max_file_changes"
# value = 25
# action = "block"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaffold_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.toml");
        scaffold(&path, false).unwrap();
        assert!(scaffold(&path, false).is_err());
        scaffold(&path, true).unwrap();
    }

    #[test]
    fn scaffolded_file_parses_as_a_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.toml");
        scaffold(&path, false).unwrap();
        let config = rig_core::config::EngineConfig::load(&path).unwrap();
        assert_eq!(config.base_branch, "main");
        assert_eq!(config.max_retry, 0);
    }

    #[test]
    fn resolve_falls_back_to_default_path() {
        assert_eq!(resolve(None), PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(
            resolve(Some(PathBuf::from("/tmp/custom.toml"))),
            PathBuf::from("/tmp/custom.toml")
        );
    }
}

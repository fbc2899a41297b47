//! Engine configuration (§6.1).
//!
//! A small typed snapshot loaded from a TOML file, with environment
//! overrides for the one secret that must never live in a checked-in
//! file: the webhook secret. This mirrors the resolution chain used
//! elsewhere in this lineage (CLI flag > env var > config file >
//! default) without building out full validation machinery — deep
//! config validation is explicitly out of scope (§1, §6.1).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::policy::PolicyRule;

/// One `{event, labels?, keyword?}` trigger filter (§4.5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRule {
    pub event: String,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub keyword: Option<String>,
}

/// On-disk shape of `rig.toml`. Every field has a sane default so a
/// minimal or even empty file parses; the webhook secret is the one
/// field that should normally come from the environment instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub state_path: String,
    pub webhook_secret: String,
    pub max_retry: u32,
    pub rollback_enabled: bool,
    pub base_branch: String,
    pub triggers: Vec<TriggerRule>,
    pub policy: Vec<PolicyRule>,
    pub infra_file_globs: Vec<String>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            state_path: ".rig/state.json".to_string(),
            webhook_secret: String::new(),
            max_retry: 0,
            rollback_enabled: true,
            base_branch: "main".to_string(),
            triggers: Vec::new(),
            policy: Vec::new(),
            infra_file_globs: Vec::new(),
        }
    }
}

/// Fully resolved configuration, ready for use by the orchestrator and
/// ingress.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub state_path: PathBuf,
    pub webhook_secret: String,
    /// `0` means unlimited retries; `>0` bounds the retry loop (§9,
    /// resolved reading of the "two variants" open question).
    pub max_retry: u32,
    pub rollback_enabled: bool,
    pub base_branch: String,
    pub triggers: Vec<TriggerRule>,
    pub policy: Vec<PolicyRule>,
    pub infra_file_globs: Vec<String>,
}

impl EngineConfig {
    /// Load `path` (a `rig.toml`), apply the `RIG_WEBHOOK_SECRET`
    /// environment override, and return the resolved config.
    ///
    /// Resolution chain for the webhook secret: `RIG_WEBHOOK_SECRET` env
    /// > config file value > empty (which is a valid, if unusable,
    /// configuration: the ingress fails closed on an empty secret, per
    /// §4.5).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = match std::fs::read_to_string(path) {
            Ok(contents) => {
                toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigFile::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        Ok(Self::from_file(file))
    }

    fn from_file(file: ConfigFile) -> Self {
        let webhook_secret =
            std::env::var("RIG_WEBHOOK_SECRET").unwrap_or(file.webhook_secret);
        Self {
            state_path: PathBuf::from(file.state_path),
            webhook_secret,
            max_retry: file.max_retry,
            rollback_enabled: file.rollback_enabled,
            base_branch: file.base_branch,
            triggers: file.triggers,
            policy: file.policy,
            infra_file_globs: file.infra_file_globs,
        }
    }

    /// A config with sane defaults and no loaded file, for tests and for
    /// `rig init`-style scaffolding.
    pub fn defaults() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

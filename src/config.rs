use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::aggregator::ConflictPolicy;
use crate::orchestration::remote::RemoteConfig;
use crate::orchestration::scaling::ScalingConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound on agents running at once within a layer.
    pub max_concurrent_agents: usize,
    pub task_timeout_secs: u64,
    /// How long a cancelled execution may take to exit before it is killed.
    pub cancel_grace_secs: u64,
    pub workspace_dir: Option<String>,
    pub state_dir: Option<String>,
    pub branch_prefix: String,
    pub max_active_contexts: usize,
    pub allocation_backoff_ms: u64,
    /// When set, isolation contexts are git worktrees of this repository.
    pub repository: Option<String>,
    pub conflict_policy: ConflictPolicy,
    pub min_confidence: f64,
    pub scaling: ScalingConfig,
    pub remote: Option<RemoteConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 4,
            task_timeout_secs: 600,
            cancel_grace_secs: 5,
            workspace_dir: None,
            state_dir: None,
            branch_prefix: "dagrun".to_string(),
            max_active_contexts: 16,
            allocation_backoff_ms: 200,
            repository: None,
            conflict_policy: ConflictPolicy::default(),
            min_confidence: 0.7,
            scaling: ScalingConfig::default(),
            remote: None,
        }
    }
}

impl Config {
    pub fn dagrun_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".dagrun"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::dagrun_dir()?.join("dagrun.toml"))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn allocation_backoff(&self) -> Duration {
        Duration::from_millis(self.allocation_backoff_ms)
    }

    /// Root directory under which isolation namespaces are created.
    pub fn workspace_root(&self) -> Result<PathBuf> {
        match &self.workspace_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::dagrun_dir()?.join("workspaces")),
        }
    }

    /// Directory holding run manifests.
    pub fn state_root(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::dagrun_dir()?.join("runs")),
        }
    }

    pub fn repository_path(&self) -> Option<PathBuf> {
        self.repository.as_deref().map(expand_tilde)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        tracing::debug!(
            max_concurrent_agents = config.max_concurrent_agents,
            task_timeout_secs = config.task_timeout_secs,
            remote = config.remote.is_some(),
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_agents == 0 {
            return Err(Error::Validation(
                "max_concurrent_agents must be at least 1".to_string(),
            ));
        }
        if self.max_active_contexts == 0 {
            return Err(Error::Validation(
                "max_active_contexts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(Error::Validation(format!(
                "min_confidence must be within 0.0..=1.0, got {}",
                self.min_confidence
            )));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

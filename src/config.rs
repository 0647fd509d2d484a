//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::state::{AgentConfig, ResourceLimits};
use crate::{AppError, Result};

/// Host CLI used by the default workflows.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HostConfig {
    /// Host CLI binary (e.g. `claude`).
    #[serde(default = "default_host_cli")]
    pub cli: String,
    /// Arguments placed before the prompt.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            cli: default_host_cli(),
            args: Vec::new(),
        }
    }
}

fn default_host_cli() -> String {
    "claude".into()
}

/// Resource sampling configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MonitorConfig {
    /// Seconds between resource samples.
    #[serde(default = "default_monitor_interval")]
    pub interval_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_monitor_interval(),
        }
    }
}

fn default_monitor_interval() -> u64 {
    30
}

/// Discovery backoff configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BackoffConfig {
    /// Wait after the first empty discovery.
    #[serde(default = "default_initial_backoff")]
    pub initial_seconds: u64,
    /// Upper bound on the wait.
    #[serde(default = "default_max_backoff")]
    pub max_seconds: u64,
    /// Growth factor applied on each empty discovery.
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_seconds: default_initial_backoff(),
            max_seconds: default_max_backoff(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_initial_backoff() -> u64 {
    5
}

fn default_max_backoff() -> u64 {
    300
}

fn default_backoff_multiplier() -> u32 {
    2
}

fn default_goal() -> String {
    "Continuously improve the workspace".into()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".autopilot")
}

fn default_session_id() -> String {
    "default".into()
}

fn default_autosave_seconds() -> u64 {
    60
}

fn default_workflows() -> Vec<String> {
    ["code", "fix", "plan", "review", "commit", "epic"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

/// Global configuration parsed from `autopilot.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Workspace the agent operates on.
    pub workspace_root: PathBuf,
    /// Data directory, relative to the workspace root unless absolute.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Session id used when the CLI does not override it.
    #[serde(default = "default_session_id")]
    pub session_id: String,
    /// Goal handed to the planner.
    #[serde(default = "default_goal")]
    pub goal: String,
    /// Idle autosave interval; 0 disables autosave.
    #[serde(default = "default_autosave_seconds")]
    pub autosave_seconds: u64,
    /// Resource limits (MB and minutes).
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Resource sampling settings.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Discovery backoff settings.
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Host CLI for the default workflows.
    #[serde(default)]
    pub host: HostConfig,
    /// Workflow names registered at startup.
    #[serde(default = "default_workflows")]
    pub workflows: Vec<String>,
    /// Workflow names the safety check refuses to dispatch.
    #[serde(default)]
    pub denied_workflows: Vec<String>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Absolute data directory.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        if self.data_dir.is_absolute() {
            self.data_dir.clone()
        } else {
            self.workspace_root.join(&self.data_dir)
        }
    }

    /// Live state file for `session_id`.
    #[must_use]
    pub fn state_path(&self, session_id: &str) -> PathBuf {
        self.data_dir()
            .join("state")
            .join(format!("{session_id}.json"))
    }

    /// Directory holding session lock files.
    #[must_use]
    pub fn lock_dir(&self) -> PathBuf {
        self.data_dir().join("sessions")
    }

    /// Directory scanned for task files.
    #[must_use]
    pub fn inbox_dir(&self) -> PathBuf {
        self.data_dir().join("inbox")
    }

    /// Resource sampling interval.
    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.interval_seconds)
    }

    /// Session configuration recorded in the agent state.
    #[must_use]
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            goal: self.goal.clone(),
            workspace_root: self.workspace_root.clone(),
            resource_limits: self.limits.clone(),
            auto_save_seconds: self.autosave_seconds,
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.monitor.interval_seconds == 0 {
            return Err(AppError::Config(
                "monitor.interval_seconds must be greater than zero".into(),
            ));
        }

        if self.backoff.initial_seconds > self.backoff.max_seconds {
            return Err(AppError::Config(
                "backoff.initial_seconds must not exceed backoff.max_seconds".into(),
            ));
        }

        if self.backoff.multiplier == 0 {
            return Err(AppError::Config(
                "backoff.multiplier must be greater than zero".into(),
            ));
        }

        if self.limits.max_task_execution_minutes == Some(0) {
            return Err(AppError::Config(
                "limits.max_task_execution_minutes must be greater than zero".into(),
            ));
        }

        if let Some(denied) = self
            .denied_workflows
            .iter()
            .find(|name| !self.workflows.contains(name))
        {
            tracing::warn!(workflow = %denied, "denied workflow is not registered");
        }

        let canonical_root = self
            .workspace_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("workspace_root invalid: {err}")))?;
        self.workspace_root = canonical_root;

        Ok(())
    }
}

//! Configuration — data directory layout and engine settings.
//!
//! Settings live in `<data-dir>/config.json` and are read once at startup;
//! the engine treats them as read-only afterwards. Absent fields fall back
//! to defaults, so a partial (or missing) config file is always usable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Directory created inside the working directory to hold all engine state.
pub const DATA_DIR_NAME: &str = ".agent-queue";

/// Flag passed to the agent so it runs unattended.
const SKIP_PERMISSIONS_FLAG: &str = "--dangerously-skip-permissions";

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Agent command line. `None` means auto-detect the `claude` CLI.
    pub agent_command: Option<String>,
    /// Default number of attempts allowed for newly created tasks.
    pub default_max_retries: u32,
    /// Run tasks concurrently instead of one at a time.
    pub parallel_execution: bool,
    /// Worker slots in parallel mode.
    pub max_parallel: usize,
    /// Per-attempt timeout, in minutes.
    pub task_timeout_minutes: u64,
    /// Verbose logging toggle for front ends.
    pub debug_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_command: None,
            default_max_retries: 15,
            parallel_execution: false,
            max_parallel: 3,
            task_timeout_minutes: 30,
            debug_mode: false,
        }
    }
}

/// The resolved command line used to launch the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub command: String,
    pub args: Vec<String>,
}

impl Config {
    /// Load configuration from `<data_dir>/config.json`.
    ///
    /// A missing file yields the defaults; a present but malformed file is
    /// an error (silently ignoring a broken config hides real mistakes).
    pub async fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = data_dir.join("config.json");
        let content = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config: Config = serde_json::from_slice(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "defaultMaxRetries".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.task_timeout_minutes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "taskTimeoutMinutes".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Worker slots, clamped to a sane range.
    pub fn effective_max_parallel(&self) -> usize {
        self.max_parallel.clamp(1, 10)
    }

    /// Per-attempt timeout as a [`Duration`].
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_minutes * 60)
    }

    /// Resolve the agent command line.
    ///
    /// A configured command is split on whitespace; otherwise the `claude`
    /// CLI is assumed (`claude.cmd` on Windows). The skip-permissions flag
    /// is always appended so the agent never blocks on interactive prompts.
    pub fn agent_command(&self) -> AgentCommand {
        match &self.agent_command {
            Some(raw) => {
                let mut parts = raw.split_whitespace().map(String::from);
                let command = parts.next().unwrap_or_else(|| "claude".to_string());
                let mut args: Vec<String> = parts.collect();
                args.push(SKIP_PERMISSIONS_FLAG.to_string());
                AgentCommand { command, args }
            }
            None => {
                let command = if cfg!(windows) { "claude.cmd" } else { "claude" };
                AgentCommand {
                    command: command.to_string(),
                    args: vec![SKIP_PERMISSIONS_FLAG.to_string()],
                }
            }
        }
    }
}

/// Engine state directory for a given working directory.
pub fn data_dir(working_dir: &Path) -> PathBuf {
    working_dir.join(DATA_DIR_NAME)
}

//! Configuration for the tool call lifecycle engine.
//!
//! Loaded from `~/.toolcall/config.toml`. Every section is optional and
//! falls back to the defaults the engine ships with.
//!
//! ```toml
//! [tools]
//! command_tool = "executeCommand"
//! subtask_tool = "newTask"
//!
//! [subtask]
//! max_steps = 24
//! max_retries = 2
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Tool whose execution yields a live command output stream.
pub const DEFAULT_COMMAND_TOOL: &str = "executeCommand";
/// Tool whose execution spawns a recursive sub-task.
pub const DEFAULT_SUBTASK_TOOL: &str = "newTask";
pub const DEFAULT_SUBTASK_MAX_STEPS: u32 = 24;
pub const DEFAULT_SUBTASK_MAX_RETRIES: u32 = 2;

#[derive(Debug, Default, Deserialize)]
pub struct LifecycleConfig {
    pub tools: Option<ToolsConfig>,
    pub subtask: Option<SubtaskConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Names of the tools that get a streaming execution phase.
#[derive(Debug, Default, Deserialize)]
pub struct ToolsConfig {
    pub command_tool: Option<String>,
    pub subtask_tool: Option<String>,
}

/// Step and retry budget for recursively spawned sub-tasks.
#[derive(Debug, Default, Deserialize)]
pub struct SubtaskConfig {
    pub max_steps: Option<u32>,
    pub max_retries: Option<u32>,
}

/// Resolved sub-task limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubtaskLimits {
    pub max_steps: u32,
    pub max_retries: u32,
}

impl Default for SubtaskLimits {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_SUBTASK_MAX_STEPS,
            max_retries: DEFAULT_SUBTASK_MAX_RETRIES,
        }
    }
}

impl LifecycleConfig {
    /// Load the config from the default location.
    ///
    /// Returns `Ok(None)` when no config file exists.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    #[must_use]
    pub fn command_tool(&self) -> &str {
        self.tools
            .as_ref()
            .and_then(|tools| tools.command_tool.as_deref())
            .unwrap_or(DEFAULT_COMMAND_TOOL)
    }

    #[must_use]
    pub fn subtask_tool(&self) -> &str {
        self.tools
            .as_ref()
            .and_then(|tools| tools.subtask_tool.as_deref())
            .unwrap_or(DEFAULT_SUBTASK_TOOL)
    }

    #[must_use]
    pub fn subtask_limits(&self) -> SubtaskLimits {
        let defaults = SubtaskLimits::default();
        let Some(subtask) = self.subtask.as_ref() else {
            return defaults;
        };
        SubtaskLimits {
            max_steps: subtask.max_steps.unwrap_or(defaults.max_steps),
            max_retries: subtask.max_retries.unwrap_or(defaults.max_retries),
        }
    }
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".toolcall").join("config.toml"))
}

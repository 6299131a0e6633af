//! Configuration management for tern.
//!
//! Loads configuration from `${TERN_HOME}/config.toml` with sensible
//! defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Permission mode forwarded to agent backends.
///
/// Controls which tool invocations the backend surfaces for operator
/// approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    /// Backend asks for approval on risky tools (default).
    #[default]
    Default,
    /// File edits are auto-approved; other risky tools still ask.
    AcceptEdits,
    /// Read-only planning; mutating tools ask.
    Plan,
    /// Nothing asks. Use with caution.
    BypassPermissions,
}

impl PermissionMode {
    /// Returns the wire identifier understood by agent backends.
    pub fn id(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "accept-edits",
            PermissionMode::Plan => "plan",
            PermissionMode::BypassPermissions => "bypass-permissions",
        }
    }
}

/// Coding-agent backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentBackendConfig {
    /// Binary spawned by the CLI subprocess adapter.
    pub binary: String,
    /// Extra arguments appended to every spawn.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
    /// Agent-server endpoint. When set, the SDK streaming adapter is used
    /// instead of the subprocess adapter.
    pub endpoint: Option<String>,
}

impl Default for AgentBackendConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            extra_args: Vec::new(),
            endpoint: None,
        }
    }
}

/// Research backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    /// API key for the search provider. Falls back to `PARALLEL_API_KEY`.
    pub api_key: Option<String>,
    /// Maximum results per search (1-20).
    pub max_results: u32,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            max_results: 10,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default model for new conversations.
    pub model: Option<String>,
    /// Default permission mode for new conversations.
    pub permission_mode: PermissionMode,
    /// Seconds before an unanswered permission request auto-denies.
    pub permission_timeout_secs: u64,
    /// Days before a cached resume token is discarded.
    pub resume_token_max_age_days: i64,
    pub agent: AgentBackendConfig,
    pub research: ResearchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: None,
            permission_mode: PermissionMode::default(),
            permission_timeout_secs: 300,
            resume_token_max_age_days: 25,
            agent: AgentBackendConfig::default(),
            research: ResearchConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `${TERN_HOME}/config.toml`.
    ///
    /// A missing file yields defaults; a malformed file is an error.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_file())
    }

    /// Loads configuration from an explicit path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parse config {}", path.display()))
    }

    /// Writes the default configuration to `path` unless it already exists.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn init_at(path: &Path) -> Result<bool> {
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create config directory {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(&Self::default()).context("serialize config")?;
        fs::write(path, content).with_context(|| format!("write config {}", path.display()))?;
        Ok(true)
    }

    /// Timeout applied to pending permission requests.
    pub fn permission_timeout(&self) -> Duration {
        Duration::from_secs(self.permission_timeout_secs)
    }

    /// Validity window for cached resume tokens.
    pub fn resume_token_max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.resume_token_max_age_days)
    }
}

/// Path resolution for the tern state directory.
pub mod paths {
    use std::path::PathBuf;

    /// Returns the tern home directory.
    ///
    /// Resolution: `$TERN_HOME` > `~/.tern` > `./.tern`.
    pub fn tern_home() -> PathBuf {
        if let Ok(home) = std::env::var("TERN_HOME") {
            let trimmed = home.trim();
            if !trimmed.is_empty() {
                return PathBuf::from(trimmed);
            }
        }
        home_dir().map_or_else(|| PathBuf::from(".tern"), |home| home.join(".tern"))
    }

    /// Returns the user home directory, if resolvable.
    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME").map(PathBuf::from)
    }

    /// Returns the config file path.
    pub fn config_file() -> PathBuf {
        tern_home().join("config.toml")
    }

    /// Returns the directory holding persisted conversations.
    pub fn conversations_dir() -> PathBuf {
        tern_home().join("conversations")
    }

    /// Returns the directory for log files.
    pub fn logs_dir() -> PathBuf {
        tern_home().join("logs")
    }
}

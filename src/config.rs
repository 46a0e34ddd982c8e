//! Global configuration parsing and validation.
//!
//! Every field has a serde default, so an empty TOML document (or no config
//! file at all) yields a usable configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::rpc::codec::MAX_LINE_BYTES;
use crate::{AppError, Result};

/// Persistent shell settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ShellConfig {
    /// Shell binary launched for the persistent session.
    pub program: String,
    /// Arguments passed to the shell binary (login shell by default).
    pub args: Vec<String>,
    /// Initial working directory; `None` inherits the server's directory.
    pub working_dir: Option<PathBuf>,
    /// Timeout applied when a caller supplies none (30 minutes).
    pub default_timeout_ms: u64,
    /// Upper bound for caller-supplied timeouts on the `bash` tool.
    pub max_timeout_ms: u64,
    /// Interval between completion probes.
    pub poll_interval_ms: u64,
    /// Bound on the non-executing syntax check.
    pub syntax_check_timeout_ms: u64,
    /// Wait after a descendant kill for the shell to record its status.
    pub kill_grace_ms: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: "bash".into(),
            args: vec!["-l".into()],
            working_dir: None,
            default_timeout_ms: 30 * 60 * 1000,
            max_timeout_ms: 10 * 60 * 1000,
            poll_interval_ms: 20,
            syntax_check_timeout_ms: 1000,
            kill_grace_ms: 500,
        }
    }
}

impl ShellConfig {
    /// Timeout used when `exec` receives none.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Interval between completion probes.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Bound on the syntax pre-check.
    #[must_use]
    pub fn syntax_check_timeout(&self) -> Duration {
        Duration::from_millis(self.syntax_check_timeout_ms)
    }

    /// Grace period after a descendant kill.
    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Protocol server settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ServerConfig {
    /// Name reported in `serverInfo`.
    pub name: String,
    /// Version reported in `serverInfo`.
    pub version: String,
    /// Default `tools/list` page size when the caller sends no limit.
    pub page_size: usize,
    /// Interval of the output-stream liveness check.
    pub liveness_interval_ms: u64,
    /// Longest inbound line accepted before it is dropped unread.
    pub max_line_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").into(),
            version: env!("CARGO_PKG_VERSION").into(),
            page_size: 20,
            liveness_interval_ms: 5000,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }
}

impl ServerConfig {
    /// Interval of the output-stream liveness check.
    #[must_use]
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
    /// Persistent shell settings.
    pub shell: ShellConfig,
    /// Protocol server settings.
    pub server: ServerConfig,
}

impl Config {
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

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Override the shell's initial working directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the directory cannot be canonicalized.
    pub fn set_working_dir(&mut self, dir: &Path) -> Result<()> {
        let canonical = dir
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid working directory: {err}")))?;
        self.shell.working_dir = Some(canonical);
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.shell.program.trim().is_empty() {
            return Err(AppError::Config("shell.program must not be empty".into()));
        }

        if self.shell.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "shell.poll_interval_ms must be greater than zero".into(),
            ));
        }

        if self.shell.default_timeout_ms == 0 || self.shell.max_timeout_ms == 0 {
            return Err(AppError::Config(
                "shell timeouts must be greater than zero".into(),
            ));
        }

        if self.server.page_size == 0 {
            return Err(AppError::Config(
                "server.page_size must be greater than zero".into(),
            ));
        }

        if self.server.liveness_interval_ms == 0 {
            return Err(AppError::Config(
                "server.liveness_interval_ms must be greater than zero".into(),
            ));
        }

        if self.server.max_line_bytes == 0 {
            return Err(AppError::Config(
                "server.max_line_bytes must be greater than zero".into(),
            ));
        }

        if let Some(dir) = self.shell.working_dir.take() {
            self.set_working_dir(&dir)?;
        }

        Ok(())
    }
}

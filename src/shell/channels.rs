//! Side-channel files used to observe commands inside the persistent shell.
//!
//! The shell writes each command's stdout, stderr, exit status and resulting
//! working directory into four files inside a private temporary directory.
//! The directory handle is returned separately from [`SideChannels::create`]
//! so the exit monitor can own it and remove every file when the shell dies.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::{AppError, Result};

/// Paths of the four side-channel files for one shell session.
#[derive(Debug, Clone)]
pub struct SideChannels {
    /// Captured standard output of the current command.
    pub stdout: PathBuf,
    /// Captured standard error of the current command.
    pub stderr: PathBuf,
    /// Exit status; non-empty once the command has finished.
    pub status: PathBuf,
    /// Working directory of the shell after the last command.
    pub cwd: PathBuf,
}

impl SideChannels {
    /// Create a fresh temporary directory holding four empty side-channel files.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Shell` if the directory or any file cannot be created.
    pub fn create() -> Result<(Self, TempDir)> {
        let dir = tempfile::Builder::new()
            .prefix("agent-shell-")
            .tempdir()
            .map_err(|err| AppError::Shell(format!("failed to create side-channel dir: {err}")))?;

        let channels = Self::in_dir(dir.path());
        for path in channels.all() {
            std::fs::File::create(path).map_err(|err| {
                AppError::Shell(format!(
                    "failed to create side-channel file {}: {err}",
                    path.display()
                ))
            })?;
        }

        Ok((channels, dir))
    }

    fn in_dir(dir: &Path) -> Self {
        Self {
            stdout: dir.join("stdout"),
            stderr: dir.join("stderr"),
            status: dir.join("status"),
            cwd: dir.join("cwd"),
        }
    }

    /// All four paths, data channels first.
    #[must_use]
    pub fn all(&self) -> [&Path; 4] {
        [&self.stdout, &self.stderr, &self.status, &self.cwd]
    }

    /// Truncate stdout, stderr and status ahead of the next command.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Shell` if any file cannot be truncated.
    pub async fn truncate_outputs(&self) -> Result<()> {
        for path in [&self.stdout, &self.stderr, &self.status] {
            tokio::fs::File::create(path).await.map_err(|err| {
                AppError::Shell(format!("failed to truncate {}: {err}", path.display()))
            })?;
        }
        Ok(())
    }

    /// Read a side-channel file as (lossy) UTF-8; a missing file reads as empty.
    pub async fn read_lossy(path: &Path) -> String {
        match tokio::fs::read(path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        }
    }

    /// Parse the recorded exit status, if the shell has written one.
    pub async fn read_status(&self) -> Option<i32> {
        let raw = Self::read_lossy(&self.status).await;
        raw.trim().parse().ok()
    }
}

/// Quote `value` for safe interpolation into a POSIX shell command line.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Build the single line written to the shell for one command.
///
/// The exit status is saved into a variable before anything else runs so a
/// `cd` inside the command cannot clobber it; the status file is written last
/// because its becoming non-empty signals completion.
#[must_use]
pub fn compose_command_line(command: &str, channels: &SideChannels) -> String {
    let stdout = shell_quote(&channels.stdout.to_string_lossy());
    let stderr = shell_quote(&channels.stderr.to_string_lossy());
    let status = shell_quote(&channels.status.to_string_lossy());
    let cwd = shell_quote(&channels.cwd.to_string_lossy());

    format!(
        "eval {cmd} < /dev/null > {stdout} 2> {stderr}; __agent_shell_status=$?; \
         pwd > {cwd}; echo \"$__agent_shell_status\" > {status}\n",
        cmd = shell_quote(command),
    )
}

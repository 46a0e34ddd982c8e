//! Lazily created, self-replacing shell session.
//!
//! The manager is owned by the composition root and handed to tool handlers
//! by `Arc`. It spawns the shell on first use and transparently replaces it
//! when the previous one has died, so callers only ever see `exec`, `pwd`
//! and `set_cwd`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::session::{ExecOutput, ShellSession};
use crate::config::ShellConfig;
use crate::Result;

/// Process-wide accessor for the single persistent shell session.
#[derive(Debug)]
pub struct ShellManager {
    config: ShellConfig,
    current: Mutex<Option<Arc<ShellSession>>>,
}

impl ShellManager {
    /// Create a manager; no shell is spawned until first use.
    #[must_use]
    pub fn new(config: ShellConfig) -> Self {
        Self {
            config,
            current: Mutex::new(None),
        }
    }

    /// Shell settings used for new sessions.
    #[must_use]
    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    /// Return the live session, spawning or replacing it as needed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Shell` if a new shell cannot be spawned.
    pub async fn session(&self) -> Result<Arc<ShellSession>> {
        let mut current = self.current.lock().await;

        if let Some(session) = current.as_ref() {
            if session.is_alive() {
                return Ok(Arc::clone(session));
            }
            info!(session_id = session.id(), "shell session died, replacing");
        }

        let session = Arc::new(ShellSession::spawn(self.config.clone()).await?);
        *current = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Run a command on the live session. See [`ShellSession::exec`].
    ///
    /// # Errors
    ///
    /// Propagates spawn and execution failures.
    pub async fn exec(
        &self,
        command: &str,
        cancel: Option<CancellationToken>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput> {
        self.session().await?.exec(command, cancel, timeout).await
    }

    /// Working directory of the live session. See [`ShellSession::pwd`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Shell` if a new shell cannot be spawned.
    pub async fn pwd(&self) -> Result<PathBuf> {
        Ok(self.session().await?.pwd())
    }

    /// Change the live session's directory. See [`ShellSession::set_cwd`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for missing paths and propagates shell
    /// failures.
    pub async fn set_cwd(&self, path: &Path) -> Result<PathBuf> {
        self.session().await?.set_cwd(path).await
    }

    /// Tear down the current session, if any.
    pub async fn shutdown(&self) {
        let session = self.current.lock().await.take();
        if let Some(session) = session {
            session.shutdown().await;
        }
    }
}

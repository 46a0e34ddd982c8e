//! Persistent shell session.
//!
//! One long-lived login shell serves every command. Each command is written
//! to the shell's stdin as a single composite line whose output, exit status
//! and resulting working directory land in the session's side-channel files.
//! Completion is detected by polling a [`CompletionProbe`]. Timeouts and
//! cancellations kill the shell's descendants, never the shell itself, so
//! working directory and environment carry over between commands.
//!
//! The shell process is owned by an exit monitor task. When the shell exits
//! the monitor marks the session dead and removes the side-channel files;
//! [`ShellManager`](super::manager::ShellManager) then builds a replacement
//! on next use.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channels::{compose_command_line, shell_quote, SideChannels};
use super::probe::{CompletionProbe, StatusFileProbe};
use super::process;
use super::queue::{CommandQueue, CommandRunner};
use crate::config::ShellConfig;
use crate::{AppError, Result};

/// Exit code reported when the syntax pre-check rejects a command.
pub const SYNTAX_ERROR_EXIT_CODE: i32 = 128;

/// Exit code reported for timed-out commands (conventional `SIGTERM` status).
pub const TIMEOUT_EXIT_CODE: i32 = 143;

/// Note appended to stderr when a command times out.
pub const TIMEOUT_NOTE: &str = "Command execution timed out";

/// How long [`ShellSession::shutdown`] waits for the exit monitor.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Captured result of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOutput {
    /// Everything the command wrote to stdout.
    pub stdout: String,
    /// Everything the command wrote to stderr (plus a timeout note, if any).
    pub stderr: String,
    /// Exit status of the command.
    pub code: i32,
    /// Whether the command was cut short by a cancellation.
    pub interrupted: bool,
}

impl ExecOutput {
    fn syntax_error() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            code: SYNTAX_ERROR_EXIT_CODE,
            interrupted: false,
        }
    }
}

/// Why the poll loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    Finished,
    TimedOut,
    Interrupted,
}

/// State shared between the session handle and its queue's drain task.
#[derive(Debug)]
struct ShellCore {
    session_id: String,
    pid: u32,
    config: ShellConfig,
    channels: SideChannels,
    probe: Arc<dyn CompletionProbe>,
    stdin: Mutex<Option<ChildStdin>>,
    alive: Arc<AtomicBool>,
    interrupted: AtomicBool,
    /// Processes signalled by the most recent interrupt.
    interrupt_kills: AtomicUsize,
    cwd: StdMutex<PathBuf>,
}

/// A persistent shell process and the queue serializing commands onto it.
#[derive(Debug)]
pub struct ShellSession {
    core: Arc<ShellCore>,
    queue: CommandQueue,
    submit_order: Mutex<()>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ShellSession {
    /// Spawn a new shell session using the default status-file probe.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Shell` if the side channels cannot be created or
    /// the shell fails to spawn.
    pub async fn spawn(config: ShellConfig) -> Result<Self> {
        Self::spawn_with_probe(config, Arc::new(StatusFileProbe)).await
    }

    /// Spawn a new shell session with a custom completion probe.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Shell` if the side channels cannot be created or
    /// the shell fails to spawn.
    pub async fn spawn_with_probe(
        config: ShellConfig,
        probe: Arc<dyn CompletionProbe>,
    ) -> Result<Self> {
        let session_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_owned();
        let (channels, dir) = SideChannels::create()?;

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .env("AGENT_SHELL", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let initial_cwd = match &config.working_dir {
            Some(dir) => {
                cmd.current_dir(dir);
                dir.clone()
            }
            None => std::env::current_dir()
                .map_err(|err| AppError::Shell(format!("cannot resolve current dir: {err}")))?,
        };

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Shell(format!("failed to spawn shell `{}`: {err}", config.program))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| AppError::Shell("shell exited before it could be tracked".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Shell("failed to capture shell stdin".into()))?;

        info!(session_id, pid, program = config.program, "shell session started");

        let alive = Arc::new(AtomicBool::new(true));
        let monitor = monitor_exit(session_id.clone(), child, dir, Arc::clone(&alive));

        let core = Arc::new(ShellCore {
            session_id: session_id.clone(),
            pid,
            config,
            channels,
            probe,
            stdin: Mutex::new(Some(stdin)),
            alive,
            interrupted: AtomicBool::new(false),
            interrupt_kills: AtomicUsize::new(0),
            cwd: StdMutex::new(initial_cwd),
        });

        Ok(Self {
            queue: CommandQueue::start(Arc::clone(&core), &session_id),
            core,
            submit_order: Mutex::new(()),
            monitor: Mutex::new(Some(monitor)),
        })
    }

    /// Short identifier used in logs.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.core.session_id
    }

    /// Process id of the shell.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.core.pid
    }

    /// Whether the shell process is still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.core.alive.load(Ordering::SeqCst)
    }

    /// Paths of this session's side-channel files.
    #[must_use]
    pub fn side_channels(&self) -> &SideChannels {
        &self.core.channels
    }

    /// Run `command` in the persistent shell.
    ///
    /// Commands that fail the syntax pre-check return exit code
    /// [`SYNTAX_ERROR_EXIT_CODE`] without touching the queue. Otherwise the
    /// command waits its turn, then runs until it finishes, `timeout` elapses
    /// (default from config), or `cancel` fires after dispatch.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Shell` if the command cannot be written to the
    /// shell, the shell dies mid-command, or the queue has stopped.
    pub async fn exec(
        &self,
        command: &str,
        cancel: Option<CancellationToken>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput> {
        // Held across the pre-check so concurrent callers enqueue in call order.
        let order = self.submit_order.lock().await;

        if !self.syntax_ok(command).await {
            debug!(session_id = self.id(), "syntax pre-check rejected command");
            return Ok(ExecOutput::syntax_error());
        }

        let timeout = timeout.unwrap_or_else(|| self.core.config.default_timeout());
        let pending = self.queue.enqueue(command.to_owned(), cancel, timeout);
        drop(order);
        pending.await
    }

    /// Current working directory of the shell.
    ///
    /// Reads the cwd side channel; falls back to the last known value when
    /// the file is unreadable or empty.
    #[must_use]
    pub fn pwd(&self) -> PathBuf {
        self.core.refresh_cwd()
    }

    /// Change the shell's working directory.
    ///
    /// Relative paths resolve against the server process's directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the path does not exist, or
    /// `AppError::Shell` if `cd` fails inside the shell.
    pub async fn set_cwd(&self, path: &Path) -> Result<PathBuf> {
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|err| AppError::Shell(format!("cannot resolve current dir: {err}")))?
                .join(path)
        };

        if !tokio::fs::try_exists(&resolved).await.unwrap_or(false) {
            return Err(AppError::NotFound(format!(
                "path does not exist: {}",
                resolved.display()
            )));
        }

        let command = format!("cd {}", shell_quote(&resolved.to_string_lossy()));
        let output = self.exec(&command, None, None).await?;
        if output.code != 0 {
            return Err(AppError::Shell(format!(
                "cd to {} failed: {}",
                resolved.display(),
                output.stderr.trim()
            )));
        }

        Ok(self.pwd())
    }

    /// End the shell's input, terminate it, and wait for the exit monitor
    /// to remove the side-channel files.
    pub async fn shutdown(&self) {
        let stdin = self.core.stdin.lock().await.take();
        drop(stdin);

        if self.is_alive() {
            process::terminate(self.core.pid);
        }

        let Some(monitor) = self.monitor.lock().await.take() else {
            return;
        };

        match tokio::time::timeout(SHUTDOWN_WAIT, monitor).await {
            Ok(Ok(())) => debug!(session_id = self.id(), "shell session shut down"),
            Ok(Err(err)) => warn!(session_id = self.id(), %err, "exit monitor failed"),
            Err(_) => warn!(session_id = self.id(), "shell did not exit within grace period"),
        }
    }

    /// Non-executing parse of `command`, bounded by the configured timeout.
    ///
    /// A check that cannot run or does not finish in time lets the command
    /// through; only a definite parse failure rejects it.
    async fn syntax_ok(&self, command: &str) -> bool {
        let mut check = Command::new(&self.core.config.program);
        check
            .arg("-n")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.core.config.syntax_check_timeout(), check.status()).await
        {
            Ok(Ok(status)) => status.success(),
            Ok(Err(err)) => {
                warn!(%err, "syntax pre-check could not run");
                true
            }
            Err(_) => {
                debug!("syntax pre-check timed out");
                true
            }
        }
    }
}

impl ShellCore {
    async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| AppError::Shell("shell input is closed".into()))?;

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| AppError::Shell(format!("write to shell failed: {err}")))?;
        stdin
            .flush()
            .await
            .map_err(|err| AppError::Shell(format!("flush to shell failed: {err}")))
    }

    fn refresh_cwd(&self) -> PathBuf {
        let mut cached = self.cwd.lock().unwrap_or_else(PoisonError::into_inner);

        if let Ok(raw) = std::fs::read_to_string(&self.channels.cwd) {
            let trimmed = raw.trim_end_matches(['\n', '\r']);
            if !trimmed.is_empty() {
                *cached = PathBuf::from(trimmed);
            }
        }

        cached.clone()
    }

    async fn poll_until_done(&self, timeout: Duration) -> Result<Completion> {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            // The killed command may already have recorded its status.
            if self.interrupted.load(Ordering::SeqCst) {
                return Ok(Completion::Interrupted);
            }
            if self.probe.is_complete(&self.channels).await {
                return Ok(Completion::Finished);
            }
            if started.elapsed() >= timeout {
                return Ok(Completion::TimedOut);
            }
            if !self.alive.load(Ordering::SeqCst) {
                return Err(AppError::Shell(
                    "shell exited while a command was running".into(),
                ));
            }
        }
    }

    /// Give the shell a short window to record the killed command's status so
    /// it cannot be mistaken for the next command's completion.
    async fn await_trailing_status(&self) {
        let deadline = Instant::now() + self.config.kill_grace();
        while Instant::now() < deadline {
            if self.probe.is_complete(&self.channels).await {
                return;
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
        debug!(session_id = self.session_id, "no trailing status after kill");
    }

    async fn kill_descendants(&self) -> usize {
        match process::kill_descendants(self.pid).await {
            Ok(signalled) => signalled,
            Err(err) => {
                warn!(session_id = self.session_id, %err, "descendant kill failed");
                0
            }
        }
    }

    async fn run_command(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        self.interrupted.store(false, Ordering::SeqCst);
        self.interrupt_kills.store(0, Ordering::SeqCst);
        self.channels.truncate_outputs().await?;
        self.write_line(&compose_command_line(command, &self.channels))
            .await?;

        let completion = self.poll_until_done(timeout).await?;
        match completion {
            Completion::Finished => {}
            Completion::TimedOut => {
                warn!(
                    session_id = self.session_id,
                    ?timeout,
                    "command timed out, killing descendants"
                );
                self.kill_descendants().await;
                self.await_trailing_status().await;
            }
            Completion::Interrupted => self.await_trailing_status().await,
        }

        let stdout = SideChannels::read_lossy(&self.channels.stdout).await;
        let mut stderr = SideChannels::read_lossy(&self.channels.stderr).await;
        let status = self.channels.read_status().await;
        self.refresh_cwd();

        // An interrupt that found nothing to kill landed after the command
        // had already recorded its status.
        let completion = match completion {
            Completion::Interrupted
                if status.is_some() && self.interrupt_kills.load(Ordering::SeqCst) == 0 =>
            {
                debug!(session_id = self.session_id, "interrupt arrived after completion");
                Completion::Finished
            }
            other => other,
        };

        let output = match completion {
            Completion::Finished => ExecOutput {
                stdout,
                stderr,
                code: status.unwrap_or_else(|| {
                    warn!(session_id = self.session_id, "unparseable exit status");
                    1
                }),
                interrupted: false,
            },
            Completion::TimedOut => {
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(TIMEOUT_NOTE);
                ExecOutput {
                    stdout,
                    stderr,
                    code: TIMEOUT_EXIT_CODE,
                    interrupted: false,
                }
            }
            Completion::Interrupted => ExecOutput {
                stdout,
                stderr,
                code: status.unwrap_or(TIMEOUT_EXIT_CODE),
                interrupted: true,
            },
        };

        debug!(
            session_id = self.session_id,
            code = output.code,
            interrupted = output.interrupted,
            "command finished"
        );
        Ok(output)
    }
}

impl CommandRunner for ShellCore {
    fn run<'a>(
        &'a self,
        command: &'a str,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<ExecOutput>> + Send + 'a>> {
        Box::pin(self.run_command(command, timeout))
    }

    fn interrupt(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let signalled = self.kill_descendants().await;
            self.interrupt_kills.store(signalled, Ordering::SeqCst);
            self.interrupted.store(true, Ordering::SeqCst);
        })
    }
}

/// Own the shell process until it exits, then mark the session dead and
/// delete the side-channel files.
fn monitor_exit(
    session_id: String,
    mut child: Child,
    dir: TempDir,
    alive: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => {
                let reason = status.code().map_or_else(
                    || "terminated by signal".to_owned(),
                    |c| format!("exited with code {c}"),
                );
                info!(session_id, %reason, "shell process exited");
            }
            Err(err) => warn!(session_id, %err, "error waiting for shell process"),
        }

        alive.store(false, Ordering::SeqCst);

        if let Err(err) = dir.close() {
            warn!(session_id, %err, "failed to remove side-channel files");
        }
    })
}

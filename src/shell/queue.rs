//! FIFO command queue in front of one shell session.
//!
//! A single drain task owns the queue and dispatches one command at a time,
//! so at most one command runs against the shell and results resolve in
//! submission order. A command that fails does not stall the queue: its
//! error is delivered to its own caller and the drain loop moves on.
//!
//! # Cancellation
//!
//! A command's cancellation token is only observed once the command is
//! dispatched. Triggering it while the command still waits in the queue has
//! no effect, and a token that has already fired at dispatch time is not
//! listened to at all.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use super::session::ExecOutput;
use crate::{AppError, Result};

/// Executes one command at a time against a shell.
///
/// Implemented by the shell session; the queue only needs to run commands
/// and interrupt the one that is currently running.
pub trait CommandRunner: Send + Sync + 'static {
    /// Run `command` to completion or until `timeout` elapses.
    fn run<'a>(
        &'a self,
        command: &'a str,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<ExecOutput>> + Send + 'a>>;

    /// Interrupt the running command: kill its processes and flag it.
    fn interrupt(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// One command waiting for its turn on the shell.
struct QueuedCommand {
    seq: u64,
    command: String,
    cancel: Option<CancellationToken>,
    timeout: Duration,
    reply: oneshot::Sender<Result<ExecOutput>>,
}

/// Handle used to submit commands to the drain task.
#[derive(Debug)]
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<QueuedCommand>,
    next_seq: std::sync::atomic::AtomicU64,
    drain: JoinHandle<()>,
}

impl std::fmt::Debug for QueuedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedCommand")
            .field("seq", &self.seq)
            .field("command", &self.command)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl CommandQueue {
    /// Start the drain task for `runner`.
    ///
    /// The task ends once every `CommandQueue` handle has been dropped and
    /// the remaining queued commands have run.
    #[must_use]
    pub fn start<R: CommandRunner>(runner: Arc<R>, session_id: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let span = info_span!("command_queue", session_id);
        let drain = tokio::spawn(drain(runner, rx).instrument(span));

        Self {
            tx,
            next_seq: std::sync::atomic::AtomicU64::new(0),
            drain,
        }
    }

    /// Append a command to the queue and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns the runner's error for this command, or `AppError::Shell` if
    /// the drain task has stopped.
    pub async fn submit(
        &self,
        command: String,
        cancel: Option<CancellationToken>,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        self.enqueue(command, cancel, timeout).await
    }

    /// Append a command to the queue immediately; the returned future
    /// resolves with its result.
    ///
    /// The command's queue position is fixed when this function returns,
    /// not when the future is first polled.
    pub fn enqueue(
        &self,
        command: String,
        cancel: Option<CancellationToken>,
        timeout: Duration,
    ) -> impl Future<Output = Result<ExecOutput>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let seq = self
            .next_seq
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let sent = self
            .tx
            .send(QueuedCommand {
                seq,
                command,
                cancel,
                timeout,
                reply,
            })
            .map_err(|_| AppError::Shell("command queue is closed".into()));

        async move {
            sent?;
            rx.await
                .map_err(|_| AppError::Shell("command dropped before completion".into()))?
        }
    }

    /// Whether the drain task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.drain.is_finished()
    }
}

/// Drain loop: dispatch queued commands strictly one after another.
async fn drain<R: CommandRunner>(runner: Arc<R>, mut rx: mpsc::UnboundedReceiver<QueuedCommand>) {
    while let Some(job) = rx.recv().await {
        let span = info_span!("dispatch", seq = job.seq);
        let result = dispatch(runner.as_ref(), &job).instrument(span).await;

        if job.reply.send(result).is_err() {
            debug!(seq = job.seq, "caller went away before the result arrived");
        }
    }

    debug!("command queue drained, stopping");
}

async fn dispatch<R: CommandRunner>(runner: &R, job: &QueuedCommand) -> Result<ExecOutput> {
    let listener = match &job.cancel {
        Some(token) if token.is_cancelled() => {
            debug!("cancellation fired before dispatch; not observed");
            None
        }
        other => other.clone(),
    };

    let Some(token) = listener else {
        return runner.run(&job.command, job.timeout).await;
    };

    let run = runner.run(&job.command, job.timeout);
    tokio::pin!(run);

    tokio::select! {
        biased;
        result = &mut run => result,
        () = token.cancelled() => {
            debug!("cancellation received, interrupting running command");
            runner.interrupt().await;
            run.await
        }
    }
}

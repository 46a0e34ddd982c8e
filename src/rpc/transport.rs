//! Stdio transport: reader loop, writer task and liveness check.
//!
//! The reader drives a [`FramedRead`] over the input stream with
//! [`LineCodec`], hands each parsed envelope to the [`ProtocolServer`] and
//! routes the outcome. All output goes through one writer task fed by a
//! bounded channel, so responses are written whole, one at a time, and a
//! slow consumer makes producers wait instead of losing messages.
//!
//! The loop ends on end of input, an input error, a disconnect
//! notification, an unwritable output stream or the shutdown token. The
//! [`ExitReason`] says which.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::codec::LineCodec;
use super::message::{Message, RequestId, RpcError};
use crate::server::{Dispatch, ProtocolServer};
use crate::{AppError, Result};

/// Outbound messages buffered ahead of the writer.
const OUTBOUND_CAPACITY: usize = 64;

/// Bound on each shutdown step: running calls, then the writer.
const DRAIN_WAIT: Duration = Duration::from_secs(1);

/// Longest prefix of a rejected line echoed into logs.
const LOG_PREVIEW_CHARS: usize = 200;

/// Why the transport stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The input stream reached end of file.
    EndOfInput,
    /// The client sent `notifications/disconnect`.
    Disconnect,
    /// Reading the input stream failed.
    InputError,
    /// The output stream can no longer be written.
    OutputClosed,
    /// The shutdown token fired (SIGINT / SIGTERM).
    Signal,
}

impl ExitReason {
    /// Process exit status for this reason.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::EndOfInput | Self::Disconnect | Self::Signal => 0,
            Self::InputError | Self::OutputClosed => 1,
        }
    }
}

/// Item consumed by the writer task.
#[derive(Debug)]
enum Outbound {
    Message(Message),
    Flush,
}

/// Result of parsing one framed line.
#[derive(Debug)]
enum Inbound {
    Message(Message),
    /// Valid JSON carrying an id, but not a valid envelope.
    Rejected(Message),
    Discard,
}

/// Serve `server` over `input` / `output` until one of the exit conditions.
///
/// Running tool calls are cancelled on exit and queued output is flushed,
/// each within a short bound.
pub async fn serve<R, W>(
    server: Arc<ProtocolServer>,
    input: R,
    output: W,
    liveness_interval: Duration,
    shutdown: CancellationToken,
) -> ExitReason
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let writer = tokio::spawn(run_writer(output, out_rx));
    let calls = TaskTracker::new();

    let codec = LineCodec::with_max_length(server.max_line_bytes());
    let mut framed = FramedRead::new(input, codec);
    let mut liveness =
        tokio::time::interval_at(Instant::now() + liveness_interval, liveness_interval);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("stdio transport started");

    let reason = loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                info!("shutdown requested, stopping transport");
                break ExitReason::Signal;
            }

            _ = liveness.tick() => {
                if !output_writable(&writer, &out_tx) {
                    error!("output stream is no longer writable");
                    break ExitReason::OutputClosed;
                }
            }

            item = framed.next() => {
                let line = match item {
                    None => {
                        info!("input stream closed");
                        break ExitReason::EndOfInput;
                    }
                    Some(Err(err)) => {
                        error!(%err, "input stream failed");
                        break ExitReason::InputError;
                    }
                    Some(Ok(line)) => line,
                };

                let dispatch = match parse_line(&line) {
                    Inbound::Message(message) => server.handle(message),
                    Inbound::Rejected(reply) => Dispatch::Reply(reply),
                    Inbound::Discard => continue,
                };

                match dispatch {
                    Dispatch::Reply(reply) => {
                        if out_tx.send(Outbound::Message(reply)).await.is_err() {
                            error!("writer stopped, cannot deliver response");
                            break ExitReason::OutputClosed;
                        }
                    }
                    Dispatch::Deferred(pending) => {
                        let tx = out_tx.clone();
                        calls.spawn(async move {
                            let reply = pending.await;
                            if tx.send(Outbound::Message(reply)).await.is_err() {
                                debug!("output closed before deferred response was written");
                            }
                        });
                    }
                    Dispatch::Silent => {}
                    Dispatch::Disconnect => break ExitReason::Disconnect,
                }
            }
        }
    };

    info!(?reason, "stdio transport stopping");
    wind_down(&server, &calls, out_tx, writer).await;
    reason
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Serialize queued messages as NDJSON lines onto `output`.
///
/// Stops when every sender is gone or a write fails.
async fn run_writer<W>(mut output: W, mut rx: mpsc::Receiver<Outbound>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::new();

    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Message(message) => {
                let line = match serde_json::to_string(&message) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(%err, id = ?message.id, "failed to serialise outbound message");
                        continue;
                    }
                };

                buf.clear();
                codec.encode(line, &mut buf)?;
                output.write_all(&buf).await.map_err(|err| {
                    warn!(%err, "write to output failed");
                    AppError::Io(format!("write failed: {err}"))
                })?;
                output
                    .flush()
                    .await
                    .map_err(|err| AppError::Io(format!("flush failed: {err}")))?;
                debug!(id = ?message.id, "message written");
            }
            Outbound::Flush => output.flush().await.map_err(|err| {
                warn!(%err, "liveness flush failed");
                AppError::Io(format!("flush failed: {err}"))
            })?,
        }
    }

    debug!("outbound channel closed, writer stopping");
    Ok(())
}

/// The output counts as writable while the writer runs and accepts a flush.
///
/// A full channel is backpressure, not a dead stream.
fn output_writable(writer: &JoinHandle<Result<()>>, out_tx: &mpsc::Sender<Outbound>) -> bool {
    if writer.is_finished() || out_tx.is_closed() {
        return false;
    }
    match out_tx.try_send(Outbound::Flush) {
        Ok(()) | Err(TrySendError::Full(_)) => true,
        Err(TrySendError::Closed(_)) => false,
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn parse_line(line: &str) -> Inbound {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            warn!(%err, line = preview(line), "discarding malformed json");
            return Inbound::Discard;
        }
    };

    let id = value
        .get("id")
        .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());

    match serde_json::from_value::<Message>(value) {
        Ok(message) => Inbound::Message(message),
        Err(err) => {
            warn!(%err, line = preview(line), "discarding invalid envelope");
            match id {
                Some(id) => Inbound::Rejected(Message::error_response(
                    Some(id),
                    RpcError::invalid_request(format!("invalid envelope: {err}")),
                )),
                None => Inbound::Discard,
            }
        }
    }
}

fn preview(line: &str) -> &str {
    match line.char_indices().nth(LOG_PREVIEW_CHARS) {
        Some((end, _)) => &line[..end],
        None => line,
    }
}

async fn wind_down(
    server: &ProtocolServer,
    calls: &TaskTracker,
    out_tx: mpsc::Sender<Outbound>,
    writer: JoinHandle<Result<()>>,
) {
    let running = server.in_flight();
    if running > 0 {
        info!(running, "cancelling running tool calls");
        server.cancel_all();
    }

    calls.close();
    if tokio::time::timeout(DRAIN_WAIT, calls.wait()).await.is_err() {
        warn!("tool calls still running at exit");
    }

    drop(out_tx);
    match tokio::time::timeout(DRAIN_WAIT, writer).await {
        Ok(Ok(Ok(()))) => debug!("writer drained"),
        Ok(Ok(Err(err))) => warn!(%err, "writer stopped with error"),
        Ok(Err(err)) => warn!(%err, "writer task failed"),
        Err(_) => warn!("writer did not drain in time"),
    }
}

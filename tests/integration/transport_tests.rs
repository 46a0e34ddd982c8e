//! Stdio transport framing, ordering and exit reasons over in-memory pipes.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadBuf,
    ReadHalf,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use agent_shell::rpc::transport::{serve, ExitReason};
use agent_shell::server::ProtocolServer;

use super::test_helpers::{fake_tools, server_with};

const LONG_LIVENESS: Duration = Duration::from_secs(60);

struct Harness {
    client_tx: tokio::io::WriteHalf<DuplexStream>,
    client_rx: Lines<BufReader<ReadHalf<DuplexStream>>>,
    shutdown: CancellationToken,
    task: JoinHandle<ExitReason>,
}

fn start(server: Arc<ProtocolServer>) -> Harness {
    let (client, server_io) = tokio::io::duplex(64 * 1024);
    let (server_rx, server_tx) = tokio::io::split(server_io);
    let (client_rx, client_tx) = tokio::io::split(client);
    let shutdown = CancellationToken::new();

    let task = tokio::spawn(serve(
        server,
        server_rx,
        server_tx,
        LONG_LIVENESS,
        shutdown.clone(),
    ));

    Harness {
        client_tx,
        client_rx: BufReader::new(client_rx).lines(),
        shutdown,
        task,
    }
}

impl Harness {
    async fn send(&mut self, raw: &str) {
        self.client_tx.write_all(raw.as_bytes()).await.unwrap();
        self.client_tx.flush().await.unwrap();
    }

    async fn send_json(&mut self, message: &Value) {
        self.send(&format!("{message}\n")).await;
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.client_rx.next_line())
            .await
            .expect("response within 5s")
            .unwrap()
            .expect("stream open");
        serde_json::from_str(&line).unwrap()
    }

    /// Half-close the client side so the server reads end of input.
    async fn close_input(&mut self) {
        self.client_tx.shutdown().await.unwrap();
    }

    async fn finish(self) -> ExitReason {
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("transport stops within 5s")
            .unwrap()
    }
}

const PING_1: &str = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
const PING_2: &str = r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#;

/// Two messages split across two writes are each dispatched exactly once.
#[tokio::test]
async fn split_writes_frame_into_whole_messages() {
    let mut h = start(server_with(Vec::new()));

    let joined = format!("{PING_1}\n{PING_2}\n");
    let (head, tail) = joined.split_at(PING_1.len() / 2);
    h.send(head).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.send(tail).await;

    let first = h.recv().await;
    let second = h.recv().await;
    assert_eq!(first["id"], json!(1));
    assert_eq!(second["id"], json!(2));
    assert!(first["result"]["timestamp"].is_string());

    h.close_input().await;
    let mut rest = h.client_rx;
    let extra = tokio::time::timeout(Duration::from_secs(5), rest.next_line())
        .await
        .expect("writer closes")
        .unwrap();
    assert!(extra.is_none(), "no duplicate responses: {extra:?}");
    assert_eq!(h.task.await.unwrap(), ExitReason::EndOfInput);
}

#[tokio::test]
async fn malformed_line_is_discarded() {
    let mut h = start(server_with(Vec::new()));

    h.send("{this is not json\n").await;
    h.send(&format!("{PING_1}\n")).await;

    let reply = h.recv().await;
    assert_eq!(reply["id"], json!(1), "garbage produced no response");

    h.close_input().await;
    assert_eq!(h.finish().await, ExitReason::EndOfInput);
}

#[tokio::test]
async fn not_initialized_error_goes_over_the_wire() {
    let mut h = start(server_with(fake_tools()));

    h.send("{\"jsonrpc\":\"2.0\",\"id\":\"a\",\"method\":\"tools/list\"}\n").await;
    let reply = h.recv().await;
    assert_eq!(reply["id"], json!("a"));
    assert_eq!(reply["error"]["code"], json!(-32002));

    h.shutdown.cancel();
    assert_eq!(h.finish().await, ExitReason::Signal);
}

/// A slow tool call does not block responses to later requests.
#[tokio::test]
async fn long_tool_call_does_not_block_framing() {
    let mut h = start(server_with(fake_tools()));

    h.send_json(&json!({
        "jsonrpc": "2.0",
        "id": 0,
        "method": "initialize",
        "params": {"protocolVersion": "2025-06-18"},
    }))
    .await;
    assert_eq!(h.recv().await["id"], json!(0));

    h.send_json(&json!({
        "jsonrpc": "2.0",
        "id": 10,
        "method": "tools/call",
        "params": {"name": "slow"},
    }))
    .await;
    h.send(&format!("{PING_2}\n")).await;

    let reply = h.recv().await;
    assert_eq!(reply["id"], json!(2), "ping answered while the tool runs");

    h.send_json(&json!({
        "jsonrpc": "2.0",
        "method": "notifications/cancelled",
        "params": {"requestId": 10},
    }))
    .await;
    let cancelled = h.recv().await;
    assert_eq!(cancelled["id"], json!(10));
    assert_eq!(cancelled["result"]["content"][0]["text"], json!("cancelled"));

    h.close_input().await;
    assert_eq!(h.finish().await, ExitReason::EndOfInput);
}

#[tokio::test]
async fn disconnect_notification_stops_transport() {
    let mut h = start(server_with(Vec::new()));
    h.send("{\"jsonrpc\":\"2.0\",\"method\":\"notifications/disconnect\"}\n").await;
    assert_eq!(h.finish().await, ExitReason::Disconnect);
}

/// Output that cannot be written is detected by the liveness check.
#[tokio::test]
async fn unwritable_output_is_detected() {
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }
        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    let (_client, server_io) = tokio::io::duplex(1024);
    let task = tokio::spawn(serve(
        server_with(Vec::new()),
        server_io,
        BrokenPipe,
        Duration::from_millis(50),
        CancellationToken::new(),
    ));

    let reason = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("liveness check fires")
        .unwrap();
    assert_eq!(reason, ExitReason::OutputClosed);
    assert_eq!(reason.exit_code(), 1);
}

/// A request far larger than a typical message still gets its own response.
#[tokio::test]
async fn multi_megabyte_request_is_answered() {
    let mut h = start(server_with(Vec::new()));

    let heredoc = "z".repeat(1_100_000);
    h.send_json(&json!({
        "jsonrpc": "2.0",
        "id": 7,
        "method": "ping",
        "params": {"pad": heredoc},
    }))
    .await;
    h.send(&format!("{PING_1}\n")).await;

    assert_eq!(h.recv().await["id"], json!(7));
    assert_eq!(h.recv().await["id"], json!(1));

    h.close_input().await;
    assert_eq!(h.finish().await, ExitReason::EndOfInput);
}

/// A failing input stream stops the transport with a non-zero exit code.
#[tokio::test]
async fn input_error_stops_transport() {
    struct FailingInput;

    impl AsyncRead for FailingInput {
        fn poll_read(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        }
    }

    let (_client, server_io) = tokio::io::duplex(1024);
    let task = tokio::spawn(serve(
        server_with(Vec::new()),
        FailingInput,
        server_io,
        LONG_LIVENESS,
        CancellationToken::new(),
    ));

    let reason = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("transport stops on read error")
        .unwrap();
    assert_eq!(reason, ExitReason::InputError);
    assert_eq!(reason.exit_code(), 1);
}

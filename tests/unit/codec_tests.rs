//! Unit tests for the NDJSON line codec.

use bytes::BytesMut;
use serde_json::json;
use tokio_util::codec::{Decoder, Encoder};

use agent_shell::rpc::codec::{LineCodec, MAX_LINE_BYTES};

const SMALL_LIMIT: usize = 1024;

// ── Framing ─────────────────────────────────────────────────────────────────

/// Two messages in one buffer decode as two items.
#[test]
fn batched_lines_decode_separately() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from("{\"a\":1}\n{\"b\":2}\n");

    assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{\"a\":1}"));
    assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{\"b\":2}"));
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
}

/// A line without its newline is held until the newline arrives.
#[test]
fn partial_line_is_buffered_until_newline() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from("{\"method\":");

    assert_eq!(codec.decode(&mut buf).unwrap(), None, "no newline yet");

    buf.extend_from_slice(b"\"ping\"}\n");
    assert_eq!(
        codec.decode(&mut buf).unwrap().as_deref(),
        Some("{\"method\":\"ping\"}")
    );
}

/// Leading whitespace and blank lines are consumed without yielding items.
#[test]
fn blank_lines_and_leading_whitespace_are_skipped() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from("\n   \n\t {\"x\":true}  \r\n");

    assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{\"x\":true}"));
    assert!(buf.is_empty(), "consumed bytes are removed");
}

/// An oversized line is dropped and decoding resumes at the next line.
#[test]
fn overlong_line_is_skipped_not_fatal() {
    let mut codec = LineCodec::with_max_length(SMALL_LIMIT);
    let mut buf = BytesMut::with_capacity(SMALL_LIMIT + 32);
    buf.extend_from_slice(&vec![b'x'; SMALL_LIMIT + 1]);
    buf.extend_from_slice(b"\n{\"ok\":1}\n");

    assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{\"ok\":1}"));
}

/// Multi-megabyte requests, such as a large heredoc, fit under the default limit.
#[test]
fn default_limit_accepts_large_requests() {
    let payload = "y".repeat(2 * 1024 * 1024);
    let line = json!({"jsonrpc": "2.0", "id": 7, "method": "ping", "params": {"pad": payload}})
        .to_string();
    assert!(line.len() < MAX_LINE_BYTES);

    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from(format!("{line}\n").as_str());
    let decoded = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(decoded.len(), line.len());
}

/// An unterminated fragment at end of input is discarded.
#[test]
fn trailing_fragment_at_eof_is_discarded() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from("{\"a\":1}\n{\"partial\":");

    assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("{\"a\":1}"));
    assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    assert!(buf.is_empty());
}

// ── Encoding ────────────────────────────────────────────────────────────────

/// Encoded items are newline-terminated.
#[test]
fn encode_appends_newline() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::new();

    codec.encode("{\"id\":1}".to_owned(), &mut buf).unwrap();
    assert_eq!(&buf[..], b"{\"id\":1}\n");
}

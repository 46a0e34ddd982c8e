//! Newline-delimited JSON codec for the stdio transport.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! client that never sends `\n` cannot make the server buffer without bound.
//! The limit sits far above realistic request sizes and is configurable via
//! `[server] max_line_bytes`.
//!
//! Framing problems on a single line are never fatal: overlong lines and
//! lines that are not valid UTF-8 are logged and skipped, and decoding
//! continues with the next line. Only I/O errors from the underlying
//! stream surface as decoder errors.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Default maximum inbound line length: 64 MiB.
pub const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// Line codec for `FramedRead` over stdin and `Encoder` for stdout.
///
/// Each decoded item is one trimmed, non-empty line. Whitespace-only lines
/// are consumed silently.
#[derive(Debug)]
pub struct LineCodec(LinesCodec);

impl LineCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom line limit.
    #[must_use]
    pub fn with_max_length(max: usize) -> Self {
        Self(LinesCodec::new_with_max_length(max))
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode(src) {
                Ok(Some(line)) => {
                    if let Some(line) = non_blank(line) {
                        return Ok(Some(line));
                    }
                }
                Ok(None) => return Ok(None),
                Err(err) => skip_or_fail(err)?,
            }
        }
    }

    /// An unterminated trailing fragment at end of input is not a message;
    /// it is dropped.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        if !src.iter().all(u8::is_ascii_whitespace) {
            debug!(bytes = src.len(), "discarding unterminated input at eof");
        }
        src.clear();
        self.0 = LinesCodec::new_with_max_length(self.0.max_length());
        Ok(None)
    }
}

impl Encoder<String> for LineCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn non_blank(line: String) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == line.len() {
        Some(line)
    } else {
        Some(trimmed.to_owned())
    }
}

/// Swallow per-line framing errors; return stream errors.
fn skip_or_fail(err: LinesCodecError) -> Result<()> {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            warn!("inbound line exceeds length limit, skipping");
            Ok(())
        }
        LinesCodecError::Io(io) if io.kind() == std::io::ErrorKind::InvalidData => {
            warn!(error = %io, "inbound line is not valid utf-8, skipping");
            Ok(())
        }
        other => Err(map_codec_error(other)),
    }
}

fn map_codec_error(err: LinesCodecError) -> AppError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Protocol("line too long".into())
        }
        LinesCodecError::Io(io) => AppError::Io(io.to_string()),
    }
}

//! Newline-delimited line codec shared by the client stream and agent stdio.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so an
//! unterminated or oversized line can never grow a buffer without bound.
//!
//! Two policies exist for oversized lines:
//!
//! - **strict** (client frames): the decoder returns
//!   [`AppError::Protocol`]`("line too long: …")` and the caller closes the
//!   stream.
//! - **lenient** (agent output): the oversized line is discarded with a
//!   warning and decoding resumes at the next newline.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::{AppError, Result};

/// Maximum client frame size on the streaming socket: 16 MiB.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Maximum agent stdout/stderr line size: 1 MiB.
pub const MAX_AGENT_LINE_BYTES: usize = 1_048_576;

/// Line codec with a bounded line length.
#[derive(Debug)]
pub struct LineCodec {
    inner: LinesCodec,
    max_length: usize,
    lenient: bool,
}

impl LineCodec {
    /// Strict codec sized for client frames.
    #[must_use]
    pub fn frames() -> Self {
        Self::strict(MAX_FRAME_BYTES)
    }

    /// Lenient codec sized for agent output.
    #[must_use]
    pub fn agent_output() -> Self {
        Self::lenient(MAX_AGENT_LINE_BYTES)
    }

    /// Codec that fails on lines longer than `max_length`.
    #[must_use]
    pub fn strict(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            max_length,
            lenient: false,
        }
    }

    /// Codec that drops lines longer than `max_length` and keeps going.
    #[must_use]
    pub fn lenient(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            max_length,
            lenient: true,
        }
    }

    /// Configured maximum line length in bytes.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.inner.decode(src) {
                Err(LinesCodecError::MaxLineLengthExceeded) if self.lenient => {
                    warn!(max = self.max_length, "discarding oversized line");
                }
                other => return other.map_err(|e| map_codec_error(e, self.max_length)),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.inner.decode_eof(src) {
                Err(LinesCodecError::MaxLineLengthExceeded) if self.lenient => {
                    warn!(max = self.max_length, "discarding oversized trailing line");
                }
                other => return other.map_err(|e| map_codec_error(e, self.max_length)),
            }
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.inner
            .encode(item, dst)
            .map_err(|e| map_codec_error(e, self.max_length))
    }
}

fn map_codec_error(err: LinesCodecError, max_length: usize) -> AppError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => AppError::Protocol(format!(
            "line too long: exceeds maximum of {max_length} bytes"
        )),
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}

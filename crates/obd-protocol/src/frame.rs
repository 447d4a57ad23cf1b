//! Frame delimiting and the bus-safe frame codec
//!
//! ELM327 adapters end every response with a `>` prompt. The assembler
//! accumulates bytes across reads and cuts complete frames at that marker.

use crate::error::FrameCodecError;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::borrow::Cow;
use tracing::warn;

/// ELM-style end-of-response marker
pub const FRAME_TERMINATOR: u8 = b'>';

/// Longest frame accepted without a terminator before the buffer is discarded
pub const MAX_FRAME_LEN: usize = 4096;

/// One complete response from the device, terminator stripped and trimmed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    bytes: Vec<u8>,
}

impl RawFrame {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Frame as text; bytes that are not UTF-8 are replaced
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    /// True when every byte is printable ASCII or ASCII whitespace
    pub fn is_printable(&self) -> bool {
        self.bytes
            .iter()
            .all(|b| b.is_ascii_graphic() || b.is_ascii_whitespace())
    }

    /// Text for a bus payload: the frame itself when printable, base64 otherwise.
    /// The flag is true when the text is base64.
    pub fn to_bus_text(&self) -> (String, bool) {
        if self.is_printable() {
            (self.text().into_owned(), false)
        } else {
            (encode_frame(&self.bytes), true)
        }
    }
}

/// Encode raw bytes as standard base64
pub fn encode_frame(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard base64 back into raw bytes
pub fn decode_frame(text: &str) -> Result<Vec<u8>, FrameCodecError> {
    Ok(STANDARD.decode(text.trim())?)
}

/// Splits a byte stream into frames at [`FRAME_TERMINATOR`]
#[derive(Debug)]
pub struct FrameAssembler {
    buf: Vec<u8>,
    max_len: usize,
    /// Set after an overrun; bytes are dropped up to the next terminator
    discarding: bool,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(256),
            max_len,
            discarding: false,
        }
    }

    /// Feed bytes from one read, returning every frame completed by them.
    /// Frames that are empty after trimming are skipped, and a frame longer
    /// than the cap is dropped whole.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        let mut frames = Vec::new();

        for &byte in chunk {
            if byte == FRAME_TERMINATOR {
                if self.discarding {
                    self.discarding = false;
                } else {
                    let trimmed = trim_frame(&self.buf);
                    if !trimmed.is_empty() {
                        frames.push(RawFrame::new(trimmed));
                    }
                }
                self.buf.clear();
                continue;
            }

            if self.discarding {
                continue;
            }
            if self.buf.len() >= self.max_len {
                warn!(
                    "Discarding frame longer than {} bytes with no '>' terminator",
                    self.max_len
                );
                self.buf.clear();
                self.discarding = true;
                continue;
            }
            self.buf.push(byte);
        }

        frames
    }

    /// Drop any partial frame, e.g. after the device handle changes
    pub fn clear(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }

    /// Bytes buffered towards the next frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_frame(bytes: &[u8]) -> &[u8] {
    let is_pad = |b: &u8| b.is_ascii_whitespace() || *b == 0;
    let start = bytes.iter().position(|b| !is_pad(b)).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !is_pad(b)).map_or(start, |i| i + 1);
    &bytes[start..end]
}

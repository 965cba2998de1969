//! Newline-delimited framing
//!
//! One frame is one JSON object terminated by `\n`. The receiver
//! accumulates raw bytes and yields complete frames; a line that exceeds
//! the configured maximum is discarded up to its terminator and counted,
//! leaving the stream in sync for the next frame.

use bytes::{Bytes, BytesMut};
use tracing::warn;

/// Frame terminator on the wire
pub const FRAME_TERMINATOR: u8 = b'\n';

/// Default maximum frame length in bytes
pub const DEFAULT_MAX_FRAME_LEN: usize = 2048;

/// Accumulates a byte stream into newline-delimited frames
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_frame_len: usize,
    /// Inside an oversized line, discarding until the next terminator
    discarding: bool,
    dropped: u64,
}

impl FrameBuffer {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_len,
            discarding: false,
            dropped: 0,
        }
    }

    /// Feed raw bytes, returning every frame completed by them
    ///
    /// Returned frames exclude the terminator.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            match self.buf.iter().position(|&b| b == FRAME_TERMINATOR) {
                Some(pos) => {
                    let line = self.buf.split_to(pos + 1);
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    if pos > self.max_frame_len {
                        self.drop_oversize(pos);
                        continue;
                    }
                    frames.push(line.freeze().slice(..pos));
                }
                None => {
                    // No terminator yet. If the partial line is already
                    // past the limit there is no point buffering it.
                    if !self.discarding && self.buf.len() > self.max_frame_len {
                        self.drop_oversize(self.buf.len());
                        self.buf.clear();
                        self.discarding = true;
                    }
                    break;
                }
            }
        }
        frames
    }

    fn drop_oversize(&mut self, len: usize) {
        self.dropped += 1;
        warn!(
            len,
            limit = self.max_frame_len,
            "dropping oversized frame"
        );
    }

    /// Frames dropped for exceeding the limit
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Bytes buffered awaiting a terminator
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Encode one outbound frame: the serialized text plus the terminator
pub fn encode_frame(json: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(json.len() + 1);
    out.extend_from_slice(json.as_bytes());
    out.extend_from_slice(&[FRAME_TERMINATOR]);
    out.freeze()
}

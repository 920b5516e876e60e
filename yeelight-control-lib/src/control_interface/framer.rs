use bytes::{Buf, BytesMut};
use log::warn;

use crate::control_interface::protocol::{Inbound, LINE_TERMINATOR};

/// Longest line kept while waiting for its terminator. Real devices never come close.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Splits the inbound byte stream into protocol lines and decodes them.
///
/// Incomplete tails stay buffered until the next chunk completes them. Bytes are
/// buffered rather than text, so a UTF-8 sequence split between two reads is
/// reassembled before decoding. A line that outgrows [`MAX_LINE_LENGTH`] is dropped up
/// to its terminator.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: BytesMut,
    /// Bytes of `buffer` already known to contain no terminator.
    scanned: usize,
    /// Set while skipping the rest of an oversized line.
    discarding: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        LineFramer {
            buffer: BytesMut::with_capacity(1024),
            scanned: 0,
            discarding: false,
        }
    }

    /// Appends a chunk and returns every message completed by it, in arrival order.
    /// Malformed lines are logged and dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Inbound> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        while let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|&b| b == LINE_TERMINATOR)
        {
            let position = self.scanned + offset;
            let mut line = self.buffer.split_to(position + 1);
            self.scanned = 0;
            if self.discarding {
                self.discarding = false;
                continue;
            }
            line.truncate(position);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if let Some(message) = Self::decode_line(&line) {
                messages.push(message);
            }
        }
        self.scanned = self.buffer.len();

        if self.buffer.len() > MAX_LINE_LENGTH {
            if !self.discarding {
                warn!(
                    "Discarding line longer than {} bytes without a terminator",
                    MAX_LINE_LENGTH
                );
            }
            self.discarding = true;
            self.buffer.clear();
            self.scanned = 0;
        }
        messages
    }

    /// Number of bytes waiting for a terminator.
    pub fn buffered_len(&self) -> usize {
        self.buffer.remaining()
    }

    fn decode_line(line: &[u8]) -> Option<Inbound> {
        let text = match std::str::from_utf8(line) {
            Ok(text) => text.trim(),
            Err(e) => {
                warn!("Discarding line that is not valid UTF-8: {}", e);
                return None;
            }
        };
        if text.is_empty() {
            return None;
        }
        match Inbound::decode(text) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Discarding malformed line {:?}: {}", text, e);
                None
            }
        }
    }
}

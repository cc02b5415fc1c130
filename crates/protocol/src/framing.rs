//! Streaming OPC framer
//!
//! Reassembles length-prefixed OPC messages from arbitrarily fragmented
//! TCP reads. One framer per connection; bytes are copied into the
//! framer's own accumulator, so callers may reuse their read buffers
//! immediately.

use crate::error::{ProtocolError, Result};
use crate::message::{HEADER_SIZE, MAX_PAYLOAD_SIZE, OpcMessage};

/// Hard cap on bytes buffered per connection: one maximum-size message
/// plus slack for the next header. Exceeding this closes the connection.
pub const MAX_BUFFERED_BYTES: usize = 8 + MAX_PAYLOAD_SIZE;

/// Per-connection streaming reassembler.
#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently buffered waiting for the rest of a message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append freshly read bytes and drain every complete message.
    ///
    /// Returns the messages completed by this read, in wire order. An
    /// over-length condition is a protocol violation; the caller must
    /// drop the connection and stop using this framer.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<OpcMessage>> {
        self.buf.extend_from_slice(bytes);

        let mut messages = Vec::new();
        let mut cursor = 0;

        while self.buf.len() - cursor >= HEADER_SIZE {
            let header = &self.buf[cursor..cursor + HEADER_SIZE];
            let length = u16::from_be_bytes([header[2], header[3]]) as usize;
            let total = HEADER_SIZE + length;

            if self.buf.len() - cursor < total {
                break;
            }

            messages.push(OpcMessage {
                channel: header[0],
                command: header[1],
                data: self.buf[cursor + HEADER_SIZE..cursor + total].to_vec(),
            });
            cursor += total;
        }

        self.buf.drain(..cursor);

        if self.buf.len() > MAX_BUFFERED_BYTES {
            return Err(ProtocolError::BufferOverflow {
                size: self.buf.len(),
                max: MAX_BUFFERED_BYTES,
            });
        }

        Ok(messages)
    }
}

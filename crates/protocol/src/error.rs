//! Protocol error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A connection buffered more bytes than one maximum-size message
    /// without completing a frame. The connection must be closed.
    #[error("connection buffer overflow: {size} bytes buffered (limit {max})")]
    BufferOverflow { size: usize, max: usize },

    /// A System Exclusive payload too short to carry a system id.
    #[error("truncated system exclusive payload ({0} bytes)")]
    TruncatedSysEx(usize),

    /// A color correction payload that is not the expected JSON object.
    #[error("malformed color correction payload: {0}")]
    MalformedColorCorrection(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

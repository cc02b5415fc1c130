//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("channel error: {0}")]
    Channel(String),

    /// The submission queue to the USB thread is momentarily full.
    /// Callers treat this as a transient condition and retry later.
    #[error("USB submission queue full")]
    ChannelFull,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

//! Error types for tremolo-player

use thiserror::Error;

/// Main error type for the player and sync subsystem
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File or socket I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire payload decoding errors
    #[error("Decode error: {0}")]
    Decode(#[from] tremolo_common::codec::DecodeError),

    /// Transport-level failures (connect refused, socket reset, bad frame)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The connection closed underneath an operation
    #[error("Connection closed")]
    ConnectionClosed,

    /// Sync-stage failures
    #[error("Sync error: {0}")]
    Sync(String),

    /// Unknown or unroutable topic
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
}

/// Convenience Result type using the player Error
pub type Result<T> = std::result::Result<T, Error>;

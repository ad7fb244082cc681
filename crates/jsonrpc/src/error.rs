//! Error types for the JSON-RPC engine.

use std::io;

use thiserror::Error;

use crate::protocol::message::ErrorObject;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for client, server and channel operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying channel failed or was closed.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// A message could not be interpreted as JSON-RPC.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote peer answered with a structured error.
    #[error("RPC error: {0}")]
    Rpc(ErrorObject),

    /// The client is closing or closed; no reply will arrive.
    #[error("Client closed")]
    ClientClosed,

    /// The call was cancelled by its caller.
    #[error("Call cancelled")]
    Cancelled,

    /// The call's deadline passed before a reply arrived.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The server loop has already terminated.
    #[error("Server stopped")]
    ServerStopped,

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the structured error if this is a remote error response.
    #[must_use]
    pub const fn as_rpc(&self) -> Option<&ErrorObject> {
        match self {
            Self::Rpc(err) => Some(err),
            _ => None,
        }
    }
}

/// Channel-level errors. Any of these except `Closed` is fatal for the
/// channel instance that raised it.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel has been closed or has already failed.
    #[error("Channel closed")]
    Closed,

    /// A frame exceeded the configured limit.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The byte stream did not contain a valid frame.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ErrorObject> for Error {
    fn from(err: ErrorObject) -> Self {
        Self::Rpc(err)
    }
}

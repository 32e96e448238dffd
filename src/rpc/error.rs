//! Error types for the RPC layer.

use std::time::Duration;

use thiserror::Error;

use crate::message::RemoteError;

/// RPC-specific error types.
///
/// Connection-level failures (`Connect`, `Io`, `ConnectionClosed`, `Decode`)
/// are fatal to the connection; `Remote`, `Timeout` and `Convert` only affect
/// the one call that produced them.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Address resolution or connect failed.
    #[error("Connection to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Read or write failure on an established stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection is closed, or was never established.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A malformed frame was received.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The peer answered the call with an error.
    #[error("Remote error: {message}")]
    Remote {
        /// Neovim error type (0 = exception, 1 = validation), if present
        code: Option<i64>,
        /// Human-readable message from the peer
        message: String,
    },

    /// The call did not complete within the configured timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Arguments or results could not be converted.
    #[error("Conversion error: {0}")]
    Convert(String),
}

impl RpcError {
    /// Whether this error means the connection is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::Connect { .. }
                | RpcError::Io(_)
                | RpcError::ConnectionClosed
                | RpcError::Decode(_)
        )
    }
}

impl From<RemoteError> for RpcError {
    fn from(err: RemoteError) -> Self {
        RpcError::Remote {
            code: err.code,
            message: err.message,
        }
    }
}

/// Frame decoding failures. All of them are fatal: there is no way to
/// resynchronize a msgpack stream once a boundary is lost.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Bytes that do not form valid msgpack.
    #[error("invalid msgpack data: {0}")]
    InvalidData(String),

    /// An incomplete frame exceeded the buffering limit.
    #[error("frame of at least {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Valid msgpack that is not a msgpack-RPC message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

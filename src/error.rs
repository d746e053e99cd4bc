//! Error types shared across the crate.

use thiserror::Error;

use crate::net::frame::ErrorCode;

/// Why a stream ended abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResetReason {
    /// Peer sent a frame the stream state does not allow.
    #[error("protocol violation")]
    ProtocolViolation,

    /// Response headers exceeded the configured count or size.
    #[error("response headers exceed configured limits")]
    HeaderLimitExceeded,

    /// Peer sent more than the stream window allowed.
    #[error("flow control violation")]
    FlowControlViolation,

    /// Buffered bytes exceeded the local buffer limit.
    #[error("buffer limit exceeded")]
    BufferOverflow,

    /// Peer reset the stream.
    #[error("reset by peer: {0}")]
    RemoteReset(ErrorCode),

    /// The connection carrying the stream went away.
    #[error("connection closed")]
    ConnectionClosed,

    /// The caller reset or abandoned the stream.
    #[error("aborted by caller")]
    LocalAbort,
}

impl ResetReason {
    /// Whether the reset originated at the upstream peer.
    pub fn is_remote(&self) -> bool {
        matches!(self, ResetReason::RemoteReset(_))
    }

    /// Code carried by the reset frame we send for this reason.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ResetReason::ProtocolViolation | ResetReason::HeaderLimitExceeded => {
                ErrorCode::ProtocolError
            }
            ResetReason::FlowControlViolation | ResetReason::BufferOverflow => {
                ErrorCode::FlowControlError
            }
            ResetReason::RemoteReset(code) => *code,
            ResetReason::ConnectionClosed | ResetReason::LocalAbort => ErrorCode::Cancel,
        }
    }
}

/// Errors returned by stream operations on a `StreamHandle`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The request half already ended.
    #[error("stream closed")]
    StreamClosed,

    /// The operation is not legal in the current half state.
    #[error("invalid stream state: {0}")]
    InvalidState(&'static str),

    /// The stream was reset.
    #[error("stream reset: {0}")]
    Reset(ResetReason),

    /// No admission slot is free on the connection. The pool queues the
    /// request again.
    #[error("no stream capacity")]
    CapacityExceeded,

    /// The connection task is gone.
    #[error("connection gone")]
    ConnectionGone,
}

/// Errors returned while acquiring a stream from the pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no destination for cluster {0}")]
    NoDestination(String),

    #[error("failed to connect to {destination} after {attempts} attempts")]
    ConnectFailed { destination: String, attempts: u32 },

    #[error("pool is shut down")]
    Shutdown,
}

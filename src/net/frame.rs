//! Frames exchanged with the protocol codec.
//!
//! The codec owns the byte layout; this core only sees already-decoded
//! events (`Inbound`) and emits send requests (`Outbound`).

use bytes::Bytes;
use http::{HeaderMap, Request, StatusCode};

/// Connection-scoped stream identifier.
pub type StreamId = u32;

/// Reset / shutdown error codes (RFC 9113 Section 7 numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    StreamClosed = 0x5,
    RefusedStream = 0x7,
    Cancel = 0x8,
    EnhanceYourCalm = 0xb,
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x3 => Self::FlowControlError,
            0x5 => Self::StreamClosed,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0xb => Self::EnhanceYourCalm,
            _ => Self::InternalError,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Settings announced by one side. Absent fields leave the previous value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settings {
    pub max_concurrent_streams: Option<u32>,
    /// Initial per-stream window the sender will accept.
    pub initial_window_size: Option<u32>,
    /// Connection-level window the sender will accept. Only meaningful in the
    /// first settings of a connection; later growth uses window updates.
    pub connection_window_size: Option<u32>,
}

/// Frames this core asks the codec to send upstream.
#[derive(Debug)]
pub enum Outbound {
    Settings(Settings),
    Headers {
        stream_id: StreamId,
        request: Request<()>,
        end_stream: bool,
    },
    Data {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    Trailers {
        stream_id: StreamId,
        trailers: HeaderMap,
    },
    Reset {
        stream_id: StreamId,
        code: ErrorCode,
    },
    /// `stream_id == None` targets the connection window.
    WindowUpdate {
        stream_id: Option<StreamId>,
        increment: u32,
    },
}

/// Frames the codec decoded from the upstream peer.
#[derive(Debug)]
pub enum Inbound {
    Settings(Settings),
    Headers {
        stream_id: StreamId,
        status: StatusCode,
        headers: HeaderMap,
        end_stream: bool,
    },
    Data {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    Trailers {
        stream_id: StreamId,
        trailers: HeaderMap,
    },
    Reset {
        stream_id: StreamId,
        code: ErrorCode,
    },
    WindowUpdate {
        stream_id: Option<StreamId>,
        increment: u32,
    },
    /// Graceful shutdown: streams above `last_stream_id` were not processed.
    GoAway { last_stream_id: StreamId },
}

impl Inbound {
    /// Stream the frame belongs to, if it is stream-scoped.
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Inbound::Headers { stream_id, .. }
            | Inbound::Data { stream_id, .. }
            | Inbound::Trailers { stream_id, .. }
            | Inbound::Reset { stream_id, .. } => Some(*stream_id),
            Inbound::WindowUpdate { stream_id, .. } => *stream_id,
            Inbound::Settings(_) | Inbound::GoAway { .. } => None,
        }
    }
}

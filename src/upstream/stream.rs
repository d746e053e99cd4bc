//! Per-stream state owned by the connection task.
//!
//! # Responsibilities
//! - Track the request and response half states independently
//! - Account send and receive bytes against the stream windows
//! - Queue request bytes that the windows cannot cover yet
//!
//! # Design Decisions
//! - No I/O here; the connection task turns results into frames and events
//! - Half states only move forward; a reset makes both halves terminal at once

use std::collections::VecDeque;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::sync::oneshot;

use crate::error::{ResetReason, StreamError};
use crate::net::frame::{Outbound, StreamId};
use crate::upstream::flow_control::FlowControlWindow;
use crate::upstream::handle::ResponseEvent;
use crate::upstream::limits::HeaderLimits;
use crate::upstream::propagation::ResponseProgress;

/// Completion signal for a queued request chunk.
pub type Ack = oneshot::Sender<Result<(), StreamError>>;

/// State of one direction of a stream.
///
/// ```text
/// Idle → Open → HalfClosed → Closed
///   └──────┴────────┴──────→ Reset
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfState {
    Idle,
    Open,
    /// End marker seen, bytes still pending on this half.
    HalfClosed,
    Closed,
    Reset,
}

impl HalfState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HalfState::Closed | HalfState::Reset)
    }

    /// Whether the end marker for this half has been seen.
    pub fn is_ended(&self) -> bool {
        !matches!(self, HalfState::Idle | HalfState::Open)
    }
}

#[derive(Debug)]
enum Chunk {
    Data { data: Bytes, end_stream: bool },
    Trailers(HeaderMap),
}

#[derive(Debug)]
struct PendingChunk {
    chunk: Chunk,
    ack: Option<Ack>,
}

/// One request/response exchange.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    request: HalfState,
    response: HalfState,
    bytes_sent: u64,
    bytes_received: u64,
    send_window: FlowControlWindow,
    recv_window: FlowControlWindow,
    /// Drained bytes not yet returned to the peer.
    recv_credit: u32,
    pending: VecDeque<PendingChunk>,
    pending_bytes: usize,
    /// Received bytes the caller has not drained yet.
    undelivered: usize,
    buffer_limit: usize,
    headers_delivered: bool,
}

impl Stream {
    pub fn new(id: StreamId, send_window: u32, recv_window: u32, buffer_limit: usize) -> Self {
        Self {
            id,
            request: HalfState::Idle,
            response: HalfState::Idle,
            bytes_sent: 0,
            bytes_received: 0,
            send_window: FlowControlWindow::new(send_window),
            recv_window: FlowControlWindow::new(recv_window),
            recv_credit: 0,
            pending: VecDeque::new(),
            pending_bytes: 0,
            undelivered: 0,
            buffer_limit,
            headers_delivered: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn request_state(&self) -> HalfState {
        self.request
    }

    pub fn response_state(&self) -> HalfState {
        self.response
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn undelivered(&self) -> usize {
        self.undelivered
    }

    pub fn progress(&self) -> ResponseProgress {
        if self.response.is_ended() && self.response != HalfState::Reset {
            ResponseProgress::Complete
        } else if self.headers_delivered {
            ResponseProgress::HeadersDelivered
        } else {
            ResponseProgress::AwaitingHeaders
        }
    }

    pub fn send_window_mut(&mut self) -> &mut FlowControlWindow {
        &mut self.send_window
    }

    /// Both halves terminal and nothing left for the caller.
    pub fn is_finished(&self) -> bool {
        self.request.is_terminal() && self.response.is_terminal()
    }

    /// Begin the request half. A header-only request closes it immediately.
    pub fn open(&mut self, end_stream: bool) -> Result<(), StreamError> {
        if self.request != HalfState::Idle {
            return Err(StreamError::InvalidState("request already opened"));
        }
        self.request = if end_stream {
            HalfState::Closed
        } else {
            HalfState::Open
        };
        Ok(())
    }

    /// Queue request body bytes.
    ///
    /// On error the ack has already been answered with the same error. A
    /// `Reset` error means the caller overran the buffer limit and the
    /// stream must be reset.
    pub fn send_data(&mut self, data: Bytes, end_stream: bool, ack: Ack) -> Result<(), StreamError> {
        let result = if self.request != HalfState::Open {
            Err(StreamError::StreamClosed)
        } else if self.pending_bytes + data.len() > self.buffer_limit {
            Err(StreamError::Reset(ResetReason::BufferOverflow))
        } else {
            Ok(())
        };
        if let Err(err) = result {
            let _ = ack.send(Err(err.clone()));
            return Err(err);
        }

        self.pending_bytes += data.len();
        self.pending.push_back(PendingChunk {
            chunk: Chunk::Data { data, end_stream },
            ack: Some(ack),
        });
        if end_stream {
            self.request = HalfState::HalfClosed;
        }
        Ok(())
    }

    /// Queue request trailers; ends the request half.
    pub fn send_trailers(&mut self, trailers: HeaderMap, ack: Ack) -> Result<(), StreamError> {
        if self.request != HalfState::Open {
            let _ = ack.send(Err(StreamError::StreamClosed));
            return Err(StreamError::StreamClosed);
        }
        self.pending.push_back(PendingChunk {
            chunk: Chunk::Trailers(trailers),
            ack: Some(ack),
        });
        self.request = HalfState::HalfClosed;
        Ok(())
    }

    /// Move queued request bytes into frames as far as the windows allow.
    pub fn flush(
        &mut self,
        connection_window: &mut FlowControlWindow,
        max_frame_size: u32,
        out: &mut Vec<Outbound>,
    ) -> Result<usize, ResetReason> {
        let mut flushed = 0;
        while let Some(mut front) = self.pending.pop_front() {
            match front.chunk {
                Chunk::Trailers(trailers) => {
                    out.push(Outbound::Trailers {
                        stream_id: self.id,
                        trailers,
                    });
                    self.request = HalfState::Closed;
                    ack_ok(front.ack);
                }
                Chunk::Data {
                    ref mut data,
                    end_stream,
                } => {
                    if data.is_empty() {
                        out.push(Outbound::Data {
                            stream_id: self.id,
                            data: Bytes::new(),
                            end_stream,
                        });
                        if end_stream {
                            self.request = HalfState::Closed;
                        }
                        ack_ok(front.ack);
                        continue;
                    }

                    let credit = self
                        .send_window
                        .credit()
                        .min(connection_window.credit())
                        .min(max_frame_size) as usize;
                    let n = credit.min(data.len());
                    if n == 0 {
                        self.pending.push_front(front);
                        break;
                    }

                    self.send_window
                        .consume(n as u32)
                        .map_err(|_| ResetReason::FlowControlViolation)?;
                    connection_window
                        .consume(n as u32)
                        .map_err(|_| ResetReason::FlowControlViolation)?;

                    let part = data.split_to(n);
                    let last = data.is_empty();
                    out.push(Outbound::Data {
                        stream_id: self.id,
                        data: part,
                        end_stream: end_stream && last,
                    });
                    self.bytes_sent += n as u64;
                    self.pending_bytes -= n;
                    flushed += n;

                    if last {
                        if end_stream {
                            self.request = HalfState::Closed;
                        }
                        ack_ok(front.ack);
                    } else {
                        self.pending.push_front(front);
                    }
                }
            }
        }
        Ok(flushed)
    }

    pub fn on_response_headers(
        &mut self,
        status: StatusCode,
        headers: HeaderMap,
        end_stream: bool,
        limits: &HeaderLimits,
    ) -> Result<ResponseEvent, ResetReason> {
        if self.response != HalfState::Idle {
            return Err(ResetReason::ProtocolViolation);
        }
        limits
            .check(&headers)
            .map_err(|_| ResetReason::HeaderLimitExceeded)?;

        self.response = if end_stream {
            HalfState::Closed
        } else {
            HalfState::Open
        };
        self.headers_delivered = true;
        Ok(ResponseEvent::Headers {
            status,
            headers,
            end_stream,
        })
    }

    /// Account a response data frame. Connection-level accounting is the
    /// caller's job.
    pub fn on_response_data(&mut self, data: Bytes, end_stream: bool) -> Result<ResponseEvent, ResetReason> {
        if self.response != HalfState::Open {
            return Err(ResetReason::ProtocolViolation);
        }
        let len = data.len();
        if self.recv_window.consume(len as u32).is_err() {
            return Err(if self.undelivered + len > self.buffer_limit {
                ResetReason::BufferOverflow
            } else {
                ResetReason::FlowControlViolation
            });
        }

        self.undelivered += len;
        self.bytes_received += len as u64;
        if end_stream {
            self.end_response();
        }
        Ok(ResponseEvent::Data { data, end_stream })
    }

    pub fn on_response_trailers(&mut self, trailers: HeaderMap) -> Result<ResponseEvent, ResetReason> {
        if self.response != HalfState::Open {
            return Err(ResetReason::ProtocolViolation);
        }
        self.end_response();
        Ok(ResponseEvent::Trailers(trailers))
    }

    /// The caller drained `bytes`. Returns a stream window increment to send
    /// once half the window is owed back.
    pub fn on_consumed(&mut self, bytes: usize) -> Option<u32> {
        self.undelivered = self.undelivered.saturating_sub(bytes);
        if self.response == HalfState::HalfClosed && self.undelivered == 0 {
            self.response = HalfState::Closed;
        }
        if self.response.is_ended() {
            return None;
        }

        self.recv_credit += bytes as u32;
        if self.recv_credit >= self.recv_window.capacity() / 2 {
            let increment = std::mem::take(&mut self.recv_credit);
            if self.recv_window.replenish(increment).is_ok() {
                return Some(increment);
            }
        }
        None
    }

    /// Terminate both halves. Queued chunks are failed; returns the number of
    /// request bytes that were still queued.
    pub fn reset(&mut self, reason: ResetReason) -> usize {
        for half in [&mut self.request, &mut self.response] {
            if !half.is_terminal() {
                *half = HalfState::Reset;
            }
        }

        for pending in self.pending.drain(..) {
            if let Some(ack) = pending.ack {
                let _ = ack.send(Err(StreamError::Reset(reason)));
            }
        }
        std::mem::take(&mut self.pending_bytes)
    }

    fn end_response(&mut self) {
        self.response = if self.undelivered == 0 {
            HalfState::Closed
        } else {
            HalfState::HalfClosed
        };
    }
}

fn ack_ok(ack: Option<Ack>) {
    if let Some(ack) = ack {
        let _ = ack.send(Ok(()));
    }
}

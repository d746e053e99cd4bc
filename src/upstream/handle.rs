//! Caller-side handle to a stream owned by a connection task.
//!
//! The handle never owns stream state. It holds the stream id, the owning
//! connection's command sender and the receiving end of the stream's event
//! channel. Dropping it before the exchange finished resets the stream.

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use tokio::sync::{mpsc, oneshot};

use crate::error::{ResetReason, StreamError};
use crate::net::connection::ConnectionId;
use crate::net::frame::StreamId;
use crate::upstream::connection::ConnCommand;

/// Response-side events, delivered in arrival order.
#[derive(Debug)]
pub enum ResponseEvent {
    Headers {
        status: StatusCode,
        headers: HeaderMap,
        end_stream: bool,
    },
    Data {
        data: Bytes,
        end_stream: bool,
    },
    Trailers(HeaderMap),
    /// The stream failed before any headers reached the caller; `status` is
    /// the locally generated replacement.
    SyntheticFailure {
        status: StatusCode,
        reason: ResetReason,
    },
    /// The stream was reset after headers were delivered.
    Reset(ResetReason),
}

impl ResponseEvent {
    /// Whether no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        match self {
            ResponseEvent::Headers { end_stream, .. } | ResponseEvent::Data { end_stream, .. } => {
                *end_stream
            }
            ResponseEvent::Trailers(_)
            | ResponseEvent::SyntheticFailure { .. }
            | ResponseEvent::Reset(_) => true,
        }
    }
}

/// A fully collected response.
#[derive(Debug, Default)]
pub struct UpstreamResponse {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub trailers: Option<HeaderMap>,
    /// The response reached its end marker (a synthetic failure counts).
    pub complete: bool,
    pub reset: Option<ResetReason>,
}

#[derive(Debug)]
pub struct StreamHandle {
    id: StreamId,
    connection_id: ConnectionId,
    commands: mpsc::UnboundedSender<ConnCommand>,
    events: mpsc::UnboundedReceiver<ResponseEvent>,
    chunk_size: usize,
    request_ended: bool,
    response_ended: bool,
}

impl StreamHandle {
    pub(crate) fn new(
        id: StreamId,
        connection_id: ConnectionId,
        commands: mpsc::UnboundedSender<ConnCommand>,
        events: mpsc::UnboundedReceiver<ResponseEvent>,
        chunk_size: usize,
        request_ended: bool,
    ) -> Self {
        Self {
            id,
            connection_id,
            commands,
            events,
            chunk_size: chunk_size.max(1),
            request_ended,
            response_ended: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Send request body bytes. Resolves once every byte has been handed to
    /// the transport, which may wait for peer credit.
    pub async fn send_data(&mut self, mut data: Bytes, end_stream: bool) -> Result<(), StreamError> {
        if self.request_ended {
            return Err(StreamError::StreamClosed);
        }
        while data.len() > self.chunk_size {
            let chunk = data.split_to(self.chunk_size);
            self.send_chunk(chunk, false).await?;
        }
        self.send_chunk(data, end_stream).await?;
        if end_stream {
            self.request_ended = true;
        }
        Ok(())
    }

    async fn send_chunk(&mut self, data: Bytes, end_stream: bool) -> Result<(), StreamError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(ConnCommand::SendData {
                id: self.id,
                data,
                end_stream,
                ack,
            })
            .map_err(|_| StreamError::ConnectionGone)?;
        done.await.map_err(|_| StreamError::ConnectionGone)?
    }

    /// Send request trailers, ending the request.
    pub async fn send_trailers(&mut self, trailers: HeaderMap) -> Result<(), StreamError> {
        if self.request_ended {
            return Err(StreamError::StreamClosed);
        }
        let (ack, done) = oneshot::channel();
        self.commands
            .send(ConnCommand::SendTrailers {
                id: self.id,
                trailers,
                ack,
            })
            .map_err(|_| StreamError::ConnectionGone)?;
        done.await.map_err(|_| StreamError::ConnectionGone)??;
        self.request_ended = true;
        Ok(())
    }

    /// Next response event, or `None` once the stream is gone. Data is
    /// counted as drained when it is returned here.
    pub async fn next_event(&mut self) -> Option<ResponseEvent> {
        if self.response_ended {
            return None;
        }
        let event = self.events.recv().await?;
        if let ResponseEvent::Data { data, .. } = &event {
            if !data.is_empty() {
                let _ = self.commands.send(ConnCommand::Consumed {
                    id: self.id,
                    bytes: data.len(),
                });
            }
        }
        if matches!(
            event,
            ResponseEvent::SyntheticFailure { .. } | ResponseEvent::Reset(_)
        ) {
            self.request_ended = true;
        }
        if event.is_terminal() {
            self.response_ended = true;
        }
        Some(event)
    }

    /// Reset the stream from the caller side.
    pub fn reset(mut self) {
        let _ = self.commands.send(ConnCommand::Reset {
            id: self.id,
            reason: ResetReason::LocalAbort,
        });
        self.request_ended = true;
        self.response_ended = true;
    }

    /// Drain every remaining event into an `UpstreamResponse`.
    pub async fn collect(mut self) -> UpstreamResponse {
        let mut response = UpstreamResponse::default();
        let mut body = BytesMut::new();
        while let Some(event) = self.next_event().await {
            match event {
                ResponseEvent::Headers {
                    status,
                    headers,
                    end_stream,
                } => {
                    response.status = Some(status);
                    response.headers = headers;
                    response.complete = end_stream;
                }
                ResponseEvent::Data { data, end_stream } => {
                    body.extend_from_slice(&data);
                    response.complete = end_stream;
                }
                ResponseEvent::Trailers(trailers) => {
                    response.trailers = Some(trailers);
                    response.complete = true;
                }
                ResponseEvent::SyntheticFailure { status, reason } => {
                    response.status = Some(status);
                    response.complete = true;
                    response.reset = Some(reason);
                }
                ResponseEvent::Reset(reason) => {
                    response.complete = false;
                    response.reset = Some(reason);
                }
            }
        }
        response.body = body.freeze();
        response
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if !(self.request_ended && self.response_ended) {
            let _ = self.commands.send(ConnCommand::Abandon { id: self.id });
        }
    }
}

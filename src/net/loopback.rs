//! In-process upstream peer.
//!
//! # Responsibilities
//! - Answer every stream without a real network or codec
//! - Honour the core's flow-control windows and return credit at once
//! - Shape responses from request headers
//!
//! # Request Headers
//! - `response-size-bytes: N` → respond with N bytes instead of the echo
//! - `reset-after-request` → reset the stream once the request ends
//! - `no-end-stream` → never end the response

use std::collections::HashMap;
use std::io;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};

use crate::net::frame::{ErrorCode, Inbound, Outbound, Settings, StreamId};
use crate::net::transport::{pair, ConnectFuture, Connector, PeerTransport};
use crate::pool::destination::Destination;
use crate::upstream::flow_control::{FlowControlWindow, DEFAULT_WINDOW_SIZE};

pub const RESPONSE_SIZE_HEADER: &str = "response-size-bytes";
pub const RESET_AFTER_REQUEST_HEADER: &str = "reset-after-request";
pub const NO_END_STREAM_HEADER: &str = "no-end-stream";

/// What the loopback peer announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackSettings {
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub connection_window_size: u32,
    pub max_frame_size: u32,
}

impl Default for LoopbackSettings {
    fn default() -> Self {
        Self {
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_WINDOW_SIZE,
            connection_window_size: 1024 * 1024,
            max_frame_size: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopbackConnector {
    settings: LoopbackSettings,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: LoopbackSettings) -> Self {
        Self { settings }
    }
}

impl Connector for LoopbackConnector {
    fn connect(&self, destination: &Destination) -> ConnectFuture {
        let settings = self.settings;
        let destination = destination.to_string();
        Box::pin(async move {
            let (transport, peer) = pair();
            tokio::spawn(LoopbackPeer::new(settings, peer).run());
            tracing::trace!(destination = %destination, "Loopback peer started");
            Ok::<_, io::Error>(transport)
        })
    }
}

#[derive(Debug)]
struct PeerStream {
    response_size: Option<usize>,
    reset_after_request: bool,
    end_stream: bool,
    request_body: BytesMut,
    outgoing: Option<Bytes>,
    send_window: FlowControlWindow,
}

impl PeerStream {
    fn from_headers(headers: &HeaderMap, send_window: u32) -> Self {
        let response_size = headers
            .get(RESPONSE_SIZE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        Self {
            response_size,
            reset_after_request: headers.contains_key(RESET_AFTER_REQUEST_HEADER),
            end_stream: !headers.contains_key(NO_END_STREAM_HEADER),
            request_body: BytesMut::new(),
            outgoing: None,
            send_window: FlowControlWindow::new(send_window),
        }
    }
}

struct LoopbackPeer {
    settings: LoopbackSettings,
    transport: PeerTransport,
    streams: HashMap<StreamId, PeerStream>,
    /// The core's receive windows, as announced in its settings.
    core_stream_window: u32,
    send_window: FlowControlWindow,
}

impl LoopbackPeer {
    fn new(settings: LoopbackSettings, transport: PeerTransport) -> Self {
        Self {
            settings,
            transport,
            streams: HashMap::new(),
            core_stream_window: DEFAULT_WINDOW_SIZE,
            send_window: FlowControlWindow::default(),
        }
    }

    async fn run(mut self) {
        self.transport.send(Inbound::Settings(Settings {
            max_concurrent_streams: self.settings.max_concurrent_streams,
            initial_window_size: Some(self.settings.initial_window_size),
            connection_window_size: Some(self.settings.connection_window_size),
        }));

        while let Some(frame) = self.transport.recv().await {
            self.on_frame(frame);
            self.flush();
        }
    }

    fn on_frame(&mut self, frame: Outbound) {
        match frame {
            Outbound::Settings(settings) => {
                if let Some(window) = settings.initial_window_size {
                    self.core_stream_window = window;
                }
                if let Some(window) = settings.connection_window_size {
                    self.send_window = FlowControlWindow::new(window);
                }
            }
            Outbound::Headers {
                stream_id,
                request,
                end_stream,
            } => {
                let at_limit = self
                    .settings
                    .max_concurrent_streams
                    .is_some_and(|max| self.streams.len() >= max as usize);
                if at_limit {
                    self.transport.send(Inbound::Reset {
                        stream_id,
                        code: ErrorCode::RefusedStream,
                    });
                    return;
                }
                self.streams.insert(
                    stream_id,
                    PeerStream::from_headers(request.headers(), self.core_stream_window),
                );
                if end_stream {
                    self.respond(stream_id);
                }
            }
            Outbound::Data {
                stream_id,
                data,
                end_stream,
            } => {
                let Some(stream) = self.streams.get_mut(&stream_id) else {
                    return;
                };
                let len = data.len() as u32;
                stream.request_body.extend_from_slice(&data);
                if len > 0 {
                    if !end_stream {
                        self.transport.send(Inbound::WindowUpdate {
                            stream_id: Some(stream_id),
                            increment: len,
                        });
                    }
                    self.transport.send(Inbound::WindowUpdate {
                        stream_id: None,
                        increment: len,
                    });
                }
                if end_stream {
                    self.respond(stream_id);
                }
            }
            Outbound::Trailers { stream_id, .. } => self.respond(stream_id),
            Outbound::Reset { stream_id, .. } => {
                self.streams.remove(&stream_id);
            }
            Outbound::WindowUpdate {
                stream_id: None,
                increment,
            } => {
                let _ = self.send_window.replenish(increment);
            }
            Outbound::WindowUpdate {
                stream_id: Some(stream_id),
                increment,
            } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    let _ = stream.send_window.replenish(increment);
                }
            }
        }
    }

    fn respond(&mut self, stream_id: StreamId) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if stream.reset_after_request {
            self.streams.remove(&stream_id);
            self.transport.send(Inbound::Reset {
                stream_id,
                code: ErrorCode::InternalError,
            });
            return;
        }

        let body = match stream.response_size {
            Some(size) => Bytes::from(vec![b'a'; size]),
            None => std::mem::take(&mut stream.request_body).freeze(),
        };
        let headers_end = body.is_empty() && stream.end_stream;
        self.transport.send(Inbound::Headers {
            stream_id,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            end_stream: headers_end,
        });
        if headers_end {
            self.streams.remove(&stream_id);
        } else {
            stream.outgoing = Some(body);
        }
    }

    /// Send response bytes the core's windows allow.
    fn flush(&mut self) {
        let max_frame = self.settings.max_frame_size;
        let mut done = Vec::new();
        for (id, stream) in self.streams.iter_mut() {
            let Some(outgoing) = stream.outgoing.as_mut() else {
                continue;
            };
            while !outgoing.is_empty() {
                let n = stream
                    .send_window
                    .credit()
                    .min(self.send_window.credit())
                    .min(max_frame) as usize;
                let n = n.min(outgoing.len());
                if n == 0 {
                    break;
                }
                let _ = stream.send_window.consume(n as u32);
                let _ = self.send_window.consume(n as u32);
                let data = outgoing.split_to(n);
                self.transport.send(Inbound::Data {
                    stream_id: *id,
                    data,
                    end_stream: stream.end_stream && outgoing.is_empty(),
                });
            }
            if outgoing.is_empty() && stream.end_stream {
                done.push(*id);
            }
        }
        for id in done {
            self.streams.remove(&id);
        }
    }
}

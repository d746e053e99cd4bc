//! Shared utilities for the integration tests: a scripted fake upstream.
//!
//! The fake sits on the peer side of in-memory transports. Tests wait for
//! connections and streams, then script the upstream's side of each exchange.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Request, StatusCode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use upstream_mux::config::{ClusterConfig, MuxConfig};
use upstream_mux::net::frame::{ErrorCode, Inbound, Outbound, Settings, StreamId};
use upstream_mux::net::transport::{pair, ConnectFuture, Connector, PeerTransport};
use upstream_mux::pool::Destination;
use upstream_mux::upstream::FlowControlWindow;
use upstream_mux::{ConnectionPool, Stats, StreamHandle, UpstreamResponse};

pub const CLUSTER: &str = "cluster_0";
pub const WAIT: Duration = Duration::from_secs(5);

/// Await `fut`, failing the test if it takes longer than `WAIT`.
pub async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    match tokio::time::timeout(WAIT, fut).await {
        Ok(out) => out,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Poll `condition` until it holds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    within(what, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
}

pub fn test_config(adjust: impl FnOnce(&mut MuxConfig)) -> MuxConfig {
    let mut config = MuxConfig::default();
    config.clusters.push(ClusterConfig {
        name: CLUSTER.into(),
        address: "fake:0".into(),
    });
    adjust(&mut config);
    config
}

pub fn get(path: &str) -> Request<()> {
    Request::builder().uri(path).body(()).unwrap()
}

/// Issue a request with `body_len` bytes of body and collect the response.
pub fn spawn_request(
    pool: &ConnectionPool,
    request: Request<()>,
    body_len: usize,
) -> JoinHandle<UpstreamResponse> {
    let pool = pool.clone();
    tokio::spawn(async move {
        let mut handle = pool
            .acquire_stream(CLUSTER, request, body_len == 0)
            .await
            .unwrap();
        if body_len > 0 {
            handle
                .send_data(Bytes::from(vec![b'r'; body_len]), true)
                .await
                .unwrap();
        }
        handle.collect().await
    })
}

/// Open a stream whose request stays open.
pub fn spawn_acquire(pool: &ConnectionPool) -> JoinHandle<StreamHandle> {
    let pool = pool.clone();
    tokio::spawn(async move { pool.acquire_stream(CLUSTER, get("/"), false).await.unwrap() })
}

/// A pool wired to a fresh fake upstream.
pub fn start(config: &MuxConfig) -> (ConnectionPool, FakeUpstream, Stats) {
    let (connector, upstream) = fake_upstream();
    let stats = Stats::new();
    let pool = ConnectionPool::new(config, connector, stats.clone());
    (pool, upstream, stats)
}

#[derive(Debug, Clone)]
pub struct FakeConnector {
    connections: mpsc::UnboundedSender<PeerTransport>,
    settings: Arc<Mutex<Option<Settings>>>,
    fail_next: Arc<AtomicUsize>,
}

impl Connector for FakeConnector {
    fn connect(&self, _destination: &Destination) -> ConnectFuture {
        let fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let settings = *self.settings.lock().unwrap();
        let connections = self.connections.clone();
        Box::pin(async move {
            if fail {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            let (transport, peer) = pair();
            if let Some(settings) = settings {
                peer.send(Inbound::Settings(settings));
            }
            let _ = connections.send(peer);
            Ok(transport)
        })
    }
}

pub struct FakeUpstream {
    connections: mpsc::UnboundedReceiver<PeerTransport>,
    connector: FakeConnector,
}

pub fn fake_upstream() -> (Arc<FakeConnector>, FakeUpstream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = FakeConnector {
        connections: tx,
        settings: Arc::new(Mutex::new(Some(Settings::default()))),
        fail_next: Arc::new(AtomicUsize::new(0)),
    };
    (
        Arc::new(connector.clone()),
        FakeUpstream {
            connections: rx,
            connector,
        },
    )
}

impl FakeUpstream {
    /// Settings sent as soon as a connection is accepted; `None` sends nothing.
    pub fn set_initial_settings(&self, settings: Option<Settings>) {
        *self.connector.settings.lock().unwrap() = settings;
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.connector.fail_next.store(n, Ordering::SeqCst);
    }

    pub async fn wait_for_connection(&mut self) -> FakeConnection {
        let peer = within("upstream connection", self.connections.recv())
            .await
            .expect("connector dropped");
        FakeConnection::new(peer)
    }
}

#[derive(Debug)]
pub struct FakeStream {
    pub request: Request<()>,
    pub body: BytesMut,
    pub trailers: Option<HeaderMap>,
    pub end_stream: bool,
    pub reset: Option<ErrorCode>,
    send_window: FlowControlWindow,
}

/// Upstream side of one connection.
pub struct FakeConnection {
    peer: PeerTransport,
    streams: HashMap<StreamId, FakeStream>,
    new_streams: VecDeque<StreamId>,
    core_stream_window: u32,
    send_window: FlowControlWindow,
    pub core_settings: Option<Settings>,
    disconnected: bool,
}

impl FakeConnection {
    fn new(peer: PeerTransport) -> Self {
        Self {
            peer,
            streams: HashMap::new(),
            new_streams: VecDeque::new(),
            core_stream_window: 65_535,
            send_window: FlowControlWindow::default(),
            core_settings: None,
            disconnected: false,
        }
    }

    /// Process one frame from the core. Returns false once it closed the
    /// transport.
    async fn pump(&mut self) -> bool {
        let Some(frame) = self.peer.recv().await else {
            self.disconnected = true;
            return false;
        };
        match frame {
            Outbound::Settings(settings) => {
                if let Some(window) = settings.initial_window_size {
                    self.core_stream_window = window;
                }
                if let Some(window) = settings.connection_window_size {
                    self.send_window = FlowControlWindow::new(window);
                }
                self.core_settings = Some(settings);
            }
            Outbound::Headers {
                stream_id,
                request,
                end_stream,
            } => {
                self.streams.insert(
                    stream_id,
                    FakeStream {
                        request,
                        body: BytesMut::new(),
                        trailers: None,
                        end_stream,
                        reset: None,
                        send_window: FlowControlWindow::new(self.core_stream_window),
                    },
                );
                self.new_streams.push_back(stream_id);
            }
            Outbound::Data {
                stream_id,
                data,
                end_stream,
            } => {
                let len = data.len() as u32;
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.body.extend_from_slice(&data);
                    stream.end_stream |= end_stream;
                }
                if len > 0 {
                    if !end_stream {
                        self.peer.send(Inbound::WindowUpdate {
                            stream_id: Some(stream_id),
                            increment: len,
                        });
                    }
                    self.peer.send(Inbound::WindowUpdate {
                        stream_id: None,
                        increment: len,
                    });
                }
            }
            Outbound::Trailers {
                stream_id,
                trailers,
            } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.trailers = Some(trailers);
                    stream.end_stream = true;
                }
            }
            Outbound::Reset { stream_id, code } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.reset = Some(code);
                }
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
        true
    }

    async fn pump_until(&mut self, what: &str, mut done: impl FnMut(&Self) -> bool) {
        within(what, async {
            while !done(self) {
                assert!(self.pump().await, "core closed the connection while waiting for {what}");
            }
        })
        .await
    }

    pub async fn wait_for_new_stream(&mut self) -> StreamId {
        self.pump_until("new stream", |c| !c.new_streams.is_empty()).await;
        self.new_streams.pop_front().unwrap()
    }

    pub async fn wait_for_data(&mut self, id: StreamId, len: usize) {
        self.pump_until("request data", |c| c.streams[&id].body.len() >= len)
            .await
    }

    pub async fn wait_for_end_stream(&mut self, id: StreamId) {
        self.pump_until("end of request", |c| c.streams[&id].end_stream)
            .await
    }

    pub async fn wait_for_reset(&mut self, id: StreamId) -> ErrorCode {
        self.pump_until("stream reset", |c| {
            c.streams.get(&id).is_some_and(|s| s.reset.is_some())
        })
        .await;
        self.streams[&id].reset.unwrap()
    }

    pub async fn wait_for_settings(&mut self) -> Settings {
        self.pump_until("core settings", |c| c.core_settings.is_some())
            .await;
        self.core_settings.unwrap()
    }

    pub async fn wait_for_disconnect(&mut self) {
        within("disconnect", async {
            while self.pump().await {}
        })
        .await
    }

    pub fn stream(&self, id: StreamId) -> &FakeStream {
        &self.streams[&id]
    }

    pub fn encode_headers(&self, id: StreamId, status: u16, headers: HeaderMap, end_stream: bool) {
        self.peer.send(Inbound::Headers {
            stream_id: id,
            status: StatusCode::from_u16(status).unwrap(),
            headers,
            end_stream,
        });
    }

    /// Send `len` bytes of body, waiting for window credit from the core.
    pub async fn encode_data(&mut self, id: StreamId, len: usize, end_stream: bool) {
        let mut remaining = len;
        if remaining == 0 {
            self.peer.send(Inbound::Data {
                stream_id: id,
                data: Bytes::new(),
                end_stream,
            });
            return;
        }
        while remaining > 0 {
            let credit = self.streams[&id]
                .send_window
                .credit()
                .min(self.send_window.credit())
                .min(16 * 1024) as usize;
            if credit == 0 {
                self.pump_until("response credit", |c| {
                    c.streams[&id].send_window.credit() > 0 && c.send_window.credit() > 0
                })
                .await;
                continue;
            }
            let n = credit.min(remaining);
            let stream = self.streams.get_mut(&id).unwrap();
            stream.send_window.consume(n as u32).unwrap();
            self.send_window.consume(n as u32).unwrap();
            remaining -= n;
            self.peer.send(Inbound::Data {
                stream_id: id,
                data: Bytes::from(vec![b'a'; n]),
                end_stream: end_stream && remaining == 0,
            });
        }
    }

    /// Send a data frame ignoring flow control.
    pub fn encode_raw_data(&self, id: StreamId, len: usize, end_stream: bool) {
        self.peer.send(Inbound::Data {
            stream_id: id,
            data: Bytes::from(vec![b'a'; len]),
            end_stream,
        });
    }

    pub fn encode_trailers(&self, id: StreamId, trailers: HeaderMap) {
        self.peer.send(Inbound::Trailers {
            stream_id: id,
            trailers,
        });
    }

    pub fn encode_reset(&self, id: StreamId, code: ErrorCode) {
        self.peer.send(Inbound::Reset {
            stream_id: id,
            code,
        });
    }

    pub fn encode_goaway(&self, last_stream_id: StreamId) {
        self.peer.send(Inbound::GoAway { last_stream_id });
    }

    /// Grant send credit to the core (`None` targets the connection).
    pub fn grant(&self, id: Option<StreamId>, increment: u32) {
        self.peer.send(Inbound::WindowUpdate {
            stream_id: id,
            increment,
        });
    }

    pub fn send_settings(&self, settings: Settings) {
        self.peer.send(Inbound::Settings(settings));
    }

    /// Abrupt disconnect.
    pub fn close(self) {}
}

pub fn trailers(name: &'static str, value: &'static str) -> HeaderMap {
    let mut map = HeaderMap::new();
    map.insert(name, value.parse().unwrap());
    map
}

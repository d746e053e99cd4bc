//! One upstream transport carrying many streams.
//!
//! # Responsibilities
//! - Drive the connection state machine (Connecting → Active → ShuttingDown → Closed)
//! - Admit streams up to the negotiated concurrency limit
//! - Allocate stream ids and route peer frames to their stream
//! - Account connection-level windows and return receive credit
//! - Report capacity and lifecycle changes to the pool
//!
//! # Design Decisions
//! - One task per connection owns every stream; callers talk to it through
//!   `ConnCommand`s, so no lock guards connection state
//! - Frames produced during one turn are buffered and sent after flushing,
//!   in stream id order

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Request};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::schema::{TimeoutConfig, UpstreamConfig};
use crate::error::{PoolError, ResetReason, StreamError};
use crate::net::connection::{ConnectionId, ConnectionState};
use crate::net::frame::{ErrorCode, Inbound, Outbound, Settings, StreamId};
use crate::net::transport::{Connector, Transport};
use crate::observability::Stats;
use crate::pool::destination::Destination;
use crate::upstream::flow_control::FlowControlWindow;
use crate::upstream::handle::{ResponseEvent, StreamHandle};
use crate::upstream::limits::HeaderLimits;
use crate::upstream::propagation::{CallerOutcome, ResetPropagator, Terminal};
use crate::upstream::stream::{Ack, Stream};

/// Highest client-initiated stream id.
pub const MAX_STREAM_ID: StreamId = 0x7fff_ffff;

/// Odd, monotonically increasing stream ids. Never reused.
#[derive(Debug)]
pub struct StreamIdAllocator {
    next: Option<StreamId>,
}

impl StreamIdAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: StreamId) -> Self {
        Self { next: Some(first) }
    }

    pub fn next_id(&mut self) -> Option<StreamId> {
        let id = self.next.filter(|id| *id <= MAX_STREAM_ID)?;
        self.next = id.checked_add(2);
        Some(id)
    }

    pub fn is_exhausted(&self) -> bool {
        !matches!(self.next, Some(id) if id <= MAX_STREAM_ID)
    }
}

impl Default for StreamIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// A request waiting for a stream.
#[derive(Debug)]
pub struct PendingRequest {
    /// Arrival order at the pool; a bounced request keeps its place.
    pub seq: u64,
    pub request: Request<()>,
    pub end_stream: bool,
    pub reply: oneshot::Sender<Result<StreamHandle, PoolError>>,
}

impl PendingRequest {
    /// The waiter dropped its acquire future.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

/// Messages from the pool and stream handles to a connection task.
#[derive(Debug)]
pub enum ConnCommand {
    Open(PendingRequest),
    SendData {
        id: StreamId,
        data: Bytes,
        end_stream: bool,
        ack: Ack,
    },
    SendTrailers {
        id: StreamId,
        trailers: HeaderMap,
        ack: Ack,
    },
    Consumed {
        id: StreamId,
        bytes: usize,
    },
    Reset {
        id: StreamId,
        reason: ResetReason,
    },
    /// The handle was dropped before the exchange finished.
    Abandon {
        id: StreamId,
    },
    Shutdown,
}

/// Lifecycle and capacity changes reported to the pool.
#[derive(Debug)]
pub enum ConnectionEvent {
    Active { max_streams: u32 },
    Admitted { live: usize, max_streams: u32 },
    Capacity { live: usize, max_streams: u32 },
    /// The request could not be admitted and goes back to the queue.
    Rejected(PendingRequest),
    /// Peer announced graceful shutdown.
    GoAway,
    /// Stopped admitting for a local reason (stream ids exhausted).
    Draining,
    Closed,
    ConnectFailed,
}

#[derive(Debug)]
pub struct ConnectionReport {
    pub cluster: String,
    pub connection_id: ConnectionId,
    pub event: ConnectionEvent,
}

/// Everything a connection task needs besides its transport.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub destination: Destination,
    pub upstream: UpstreamConfig,
    pub timeouts: TimeoutConfig,
    pub stats: Stats,
    pub reports: mpsc::UnboundedSender<ConnectionReport>,
}

/// Start a connection task. The returned sender is its command channel.
pub fn spawn(
    context: ConnectionContext,
    connector: Arc<dyn Connector>,
) -> mpsc::UnboundedSender<ConnCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = UpstreamConnection::new(context, tx.clone());
    tokio::spawn(connection.run(connector, rx));
    tx
}

#[derive(Debug)]
struct StreamSlot {
    stream: Stream,
    events: mpsc::UnboundedSender<ResponseEvent>,
}

struct UpstreamConnection {
    id: ConnectionId,
    destination: Destination,
    state: ConnectionState,
    upstream: UpstreamConfig,
    timeouts: TimeoutConfig,
    limits: HeaderLimits,
    stats: Stats,
    propagator: ResetPropagator,
    streams_active_gauge: String,
    pending_send_gauge: String,
    rq_total_counter: String,
    destroy_with_active_counter: String,
    reports: mpsc::UnboundedSender<ConnectionReport>,
    commands: mpsc::UnboundedSender<ConnCommand>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    out: Vec<Outbound>,
    streams: BTreeMap<StreamId, StreamSlot>,
    ids: StreamIdAllocator,
    peer_max_streams: u32,
    peer_initial_window: u32,
    send_window: FlowControlWindow,
    recv_window: FlowControlWindow,
    recv_credit: u32,
    reported_pending: usize,
    handshake_deadline: Instant,
    idle_deadline: Option<Instant>,
    connect_failed: bool,
}

impl UpstreamConnection {
    fn new(context: ConnectionContext, commands: mpsc::UnboundedSender<ConnCommand>) -> Self {
        let root = context.upstream.protocol.stats_root();
        let prefix = context.destination.stat_prefix().to_string();
        Self {
            id: context.id,
            limits: HeaderLimits::from_config(&context.upstream),
            propagator: ResetPropagator::new(context.stats.clone(), &prefix),
            streams_active_gauge: format!("{root}.streams_active"),
            pending_send_gauge: format!("{root}.pending_send_bytes"),
            rq_total_counter: format!("{prefix}.upstream_rq_total"),
            destroy_with_active_counter: format!("{prefix}.upstream_cx_destroy_with_active_rq"),
            recv_window: FlowControlWindow::new(context.upstream.initial_connection_window_size),
            destination: context.destination,
            state: ConnectionState::Connecting,
            upstream: context.upstream,
            timeouts: context.timeouts,
            stats: context.stats,
            reports: context.reports,
            commands,
            outbound: None,
            out: Vec::new(),
            streams: BTreeMap::new(),
            ids: StreamIdAllocator::new(),
            peer_max_streams: u32::MAX,
            peer_initial_window: crate::upstream::flow_control::DEFAULT_WINDOW_SIZE,
            send_window: FlowControlWindow::default(),
            recv_credit: 0,
            reported_pending: 0,
            handshake_deadline: Instant::now(),
            idle_deadline: None,
            connect_failed: false,
        }
    }

    async fn run(
        mut self,
        connector: Arc<dyn Connector>,
        mut commands: mpsc::UnboundedReceiver<ConnCommand>,
    ) {
        tracing::debug!(
            connection_id = %self.id,
            destination = %self.destination,
            "Connecting upstream"
        );

        let Some(transport) = self.connect(connector.as_ref(), &mut commands).await else {
            self.finish(commands);
            return;
        };
        let Transport {
            outbound,
            mut inbound,
        } = transport;
        self.outbound = Some(outbound);
        let settings = self.local_settings();
        self.out.push(Outbound::Settings(settings));
        self.handshake_deadline = Instant::now() + self.timeouts.connect();

        loop {
            self.end_turn();
            if self.state == ConnectionState::Closed {
                break;
            }

            let deadline = self.deadline();
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(frame) => self.on_frame(frame),
                    None => self.on_disconnect(),
                },
                Some(command) = commands.recv() => self.on_command(command),
                _ = sleep_until(deadline) => self.on_timeout(),
            }
        }

        self.finish(commands);
    }

    async fn connect(
        &mut self,
        connector: &dyn Connector,
        commands: &mut mpsc::UnboundedReceiver<ConnCommand>,
    ) -> Option<Transport> {
        let connect = tokio::time::timeout(
            self.timeouts.connect(),
            connector.connect(&self.destination),
        );
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(Ok(transport)) => Some(transport),
                        Ok(Err(e)) => {
                            tracing::warn!(
                                connection_id = %self.id,
                                destination = %self.destination,
                                error = %e,
                                "Upstream connect failed"
                            );
                            self.connect_failed = true;
                            None
                        }
                        Err(_) => {
                            tracing::warn!(
                                connection_id = %self.id,
                                destination = %self.destination,
                                "Upstream connect timed out"
                            );
                            self.connect_failed = true;
                            None
                        }
                    };
                }
                Some(command) = commands.recv() => match command {
                    ConnCommand::Shutdown => return None,
                    other => self.reject_command(other),
                },
            }
        }
    }

    fn local_settings(&self) -> Settings {
        Settings {
            max_concurrent_streams: None,
            initial_window_size: Some(self.upstream.advertised_stream_window()),
            connection_window_size: Some(self.upstream.initial_connection_window_size),
        }
    }

    fn max_streams(&self) -> u32 {
        self.upstream.max_concurrent_streams.min(self.peer_max_streams)
    }

    fn report(&self, event: ConnectionEvent) {
        let _ = self.reports.send(ConnectionReport {
            cluster: self.destination.cluster.clone(),
            connection_id: self.id,
            event,
        });
    }

    fn transition(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(next) {
            return;
        }
        tracing::debug!(
            connection_id = %self.id,
            from = %self.state,
            to = %next,
            "Connection state change"
        );
        self.state = next;
    }

    fn deadline(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::Connecting => Some(self.handshake_deadline),
            _ => self.idle_deadline,
        }
    }

    // ---------------------------------------------------------------
    // Peer frames
    // ---------------------------------------------------------------

    fn on_frame(&mut self, frame: Inbound) {
        tracing::trace!(connection_id = %self.id, ?frame, "Frame received");
        match frame {
            Inbound::Settings(settings) => self.on_settings(settings),
            Inbound::Headers {
                stream_id,
                status,
                headers,
                end_stream,
            } => {
                let Some(slot) = self.streams.get_mut(&stream_id) else {
                    return;
                };
                match slot
                    .stream
                    .on_response_headers(status, headers, end_stream, &self.limits)
                {
                    Ok(event) => {
                        let _ = slot.events.send(event);
                    }
                    Err(reason) => self.reset_stream(stream_id, reason),
                }
            }
            Inbound::Data {
                stream_id,
                data,
                end_stream,
            } => self.on_data(stream_id, data, end_stream),
            Inbound::Trailers {
                stream_id,
                trailers,
            } => {
                let Some(slot) = self.streams.get_mut(&stream_id) else {
                    return;
                };
                match slot.stream.on_response_trailers(trailers) {
                    Ok(event) => {
                        let _ = slot.events.send(event);
                    }
                    Err(reason) => self.reset_stream(stream_id, reason),
                }
            }
            Inbound::Reset { stream_id, code } => {
                self.reset_stream(stream_id, ResetReason::RemoteReset(code));
            }
            Inbound::WindowUpdate {
                stream_id: None,
                increment,
            } => {
                if self.send_window.replenish(increment).is_err() {
                    tracing::warn!(
                        connection_id = %self.id,
                        increment,
                        "Connection send window overflow"
                    );
                    self.teardown();
                }
            }
            Inbound::WindowUpdate {
                stream_id: Some(stream_id),
                increment,
            } => {
                let Some(slot) = self.streams.get_mut(&stream_id) else {
                    return;
                };
                if slot.stream.send_window_mut().replenish(increment).is_err() {
                    self.reset_stream(stream_id, ResetReason::FlowControlViolation);
                }
            }
            Inbound::GoAway { last_stream_id } => self.on_goaway(last_stream_id),
        }
    }

    fn on_settings(&mut self, settings: Settings) {
        if let Some(max) = settings.max_concurrent_streams {
            if (max as usize) < self.streams.len() {
                tracing::debug!(
                    connection_id = %self.id,
                    max,
                    live = self.streams.len(),
                    "Peer lowered concurrency below live streams"
                );
            }
            self.peer_max_streams = max;
        }

        if let Some(window) = settings.initial_window_size {
            self.peer_initial_window = window;
            let overflowed: Vec<StreamId> = self
                .streams
                .iter_mut()
                .filter_map(|(id, slot)| slot.stream.send_window_mut().resize(window).err().map(|_| *id))
                .collect();
            for id in overflowed {
                self.reset_stream(id, ResetReason::FlowControlViolation);
            }
        }

        if self.state == ConnectionState::Connecting {
            if let Some(window) = settings.connection_window_size {
                self.send_window = FlowControlWindow::new(window);
            }
            self.transition(ConnectionState::Active);
            tracing::debug!(
                connection_id = %self.id,
                destination = %self.destination,
                max_streams = self.max_streams(),
                "Upstream connection active"
            );
            self.report(ConnectionEvent::Active {
                max_streams: self.max_streams(),
            });
        } else {
            self.report(ConnectionEvent::Capacity {
                live: self.streams.len(),
                max_streams: self.max_streams(),
            });
        }
    }

    fn on_data(&mut self, stream_id: StreamId, data: Bytes, end_stream: bool) {
        let len = data.len();
        if self.recv_window.consume(len as u32).is_err() {
            tracing::warn!(
                connection_id = %self.id,
                stream_id,
                len,
                "Peer overran the connection receive window"
            );
            self.reset_stream(stream_id, ResetReason::BufferOverflow);
            self.teardown();
            return;
        }

        let Some(slot) = self.streams.get_mut(&stream_id) else {
            tracing::trace!(connection_id = %self.id, stream_id, "Discarding stale data");
            self.release_connection_credit(len);
            return;
        };
        match slot.stream.on_response_data(data, end_stream) {
            Ok(event) => {
                let _ = slot.events.send(event);
            }
            Err(reason) => {
                self.release_connection_credit(len);
                self.reset_stream(stream_id, reason);
            }
        }
    }

    fn on_goaway(&mut self, last_stream_id: StreamId) {
        tracing::info!(
            connection_id = %self.id,
            destination = %self.destination,
            last_stream_id,
            live = self.streams.len(),
            "Upstream announced shutdown"
        );
        if self.state.can_transition_to(ConnectionState::ShuttingDown) {
            self.transition(ConnectionState::ShuttingDown);
            self.report(ConnectionEvent::GoAway);
        }

        let refused: Vec<StreamId> = self
            .streams
            .range((Bound::Excluded(last_stream_id), Bound::Unbounded))
            .map(|(id, _)| *id)
            .collect();
        for id in refused {
            self.reset_stream(id, ResetReason::RemoteReset(ErrorCode::RefusedStream));
        }
    }

    fn on_disconnect(&mut self) {
        tracing::debug!(
            connection_id = %self.id,
            destination = %self.destination,
            state = %self.state,
            live = self.streams.len(),
            "Upstream transport closed"
        );
        if self.state == ConnectionState::Connecting {
            self.connect_failed = true;
        }
        self.teardown();
    }

    fn on_timeout(&mut self) {
        if self.state == ConnectionState::Connecting {
            tracing::warn!(
                connection_id = %self.id,
                destination = %self.destination,
                "Upstream handshake timed out"
            );
            self.connect_failed = true;
        } else {
            tracing::debug!(connection_id = %self.id, "Idle timeout");
        }
        self.teardown();
    }

    // ---------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------

    fn on_command(&mut self, command: ConnCommand) {
        match command {
            ConnCommand::Open(request) => self.admit(request),
            ConnCommand::SendData {
                id,
                data,
                end_stream,
                ack,
            } => {
                let Some(slot) = self.streams.get_mut(&id) else {
                    let _ = ack.send(Err(StreamError::StreamClosed));
                    return;
                };
                if let Err(StreamError::Reset(reason)) = slot.stream.send_data(data, end_stream, ack) {
                    self.reset_stream(id, reason);
                }
            }
            ConnCommand::SendTrailers { id, trailers, ack } => {
                let Some(slot) = self.streams.get_mut(&id) else {
                    let _ = ack.send(Err(StreamError::StreamClosed));
                    return;
                };
                let _ = slot.stream.send_trailers(trailers, ack);
            }
            ConnCommand::Consumed { id, bytes } => {
                let Some(slot) = self.streams.get_mut(&id) else {
                    return;
                };
                if let Some(increment) = slot.stream.on_consumed(bytes) {
                    self.out.push(Outbound::WindowUpdate {
                        stream_id: Some(id),
                        increment,
                    });
                }
                self.release_connection_credit(bytes);
            }
            ConnCommand::Reset { id, reason } => self.reset_stream(id, reason),
            ConnCommand::Abandon { id } => self.reset_stream(id, ResetReason::LocalAbort),
            ConnCommand::Shutdown => {
                tracing::debug!(connection_id = %self.id, "Shutdown requested");
                self.teardown();
            }
        }
    }

    fn has_capacity(&self) -> Result<(), StreamError> {
        if self.state.admits_streams() && self.streams.len() < self.max_streams() as usize {
            Ok(())
        } else {
            Err(StreamError::CapacityExceeded)
        }
    }

    fn admit(&mut self, pending: PendingRequest) {
        if let Err(e) = self.has_capacity() {
            tracing::debug!(
                connection_id = %self.id,
                state = %self.state,
                live = self.streams.len(),
                error = %e,
                "Open bounced back to pool"
            );
            self.report(ConnectionEvent::Rejected(pending));
            return;
        }
        if pending.is_abandoned() {
            self.report(ConnectionEvent::Rejected(pending));
            return;
        }
        let Some(id) = self.ids.next_id() else {
            self.drain();
            self.report(ConnectionEvent::Rejected(pending));
            return;
        };

        let buffer_limit = self.upstream.buffer_limit_bytes as usize;
        let mut stream = Stream::new(
            id,
            self.peer_initial_window,
            self.upstream.advertised_stream_window(),
            buffer_limit,
        );
        if stream.open(pending.end_stream).is_err() {
            self.report(ConnectionEvent::Rejected(pending));
            return;
        }

        let PendingRequest {
            request,
            end_stream,
            reply,
            ..
        } = pending;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.out.push(Outbound::Headers {
            stream_id: id,
            request,
            end_stream,
        });
        self.streams.insert(
            id,
            StreamSlot {
                stream,
                events: events_tx,
            },
        );
        self.stats.gauge_add(&self.streams_active_gauge, 1);
        self.stats.inc(&self.rq_total_counter);
        tracing::debug!(
            connection_id = %self.id,
            stream_id = id,
            live = self.streams.len(),
            "Stream admitted"
        );
        self.report(ConnectionEvent::Admitted {
            live: self.streams.len(),
            max_streams: self.max_streams(),
        });

        let handle = StreamHandle::new(
            id,
            self.id,
            self.commands.clone(),
            events_rx,
            buffer_limit,
            end_stream,
        );
        // A waiter that vanished drops the handle, which abandons the stream.
        let _ = reply.send(Ok(handle));

        if self.ids.is_exhausted() {
            self.drain();
        }
    }

    fn drain(&mut self) {
        if self.state.can_transition_to(ConnectionState::ShuttingDown) {
            tracing::info!(connection_id = %self.id, "Stream ids exhausted, draining");
            self.transition(ConnectionState::ShuttingDown);
            self.report(ConnectionEvent::Draining);
        }
    }

    fn reject_command(&self, command: ConnCommand) {
        match command {
            ConnCommand::Open(pending) => self.report(ConnectionEvent::Rejected(pending)),
            ConnCommand::SendData { ack, .. } | ConnCommand::SendTrailers { ack, .. } => {
                let _ = ack.send(Err(StreamError::ConnectionGone));
            }
            _ => {}
        }
    }

    // ---------------------------------------------------------------
    // Stream teardown
    // ---------------------------------------------------------------

    /// Terminate a live stream and propagate the outcome. Unknown ids are
    /// stale and ignored.
    fn reset_stream(&mut self, id: StreamId, reason: ResetReason) {
        let Some(mut slot) = self.streams.remove(&id) else {
            return;
        };
        let progress = slot.stream.progress();
        let peer_closed = slot.stream.request_state().is_terminal()
            && slot.stream.response_state().is_ended();
        slot.stream.reset(reason);

        let undelivered = slot.stream.undelivered();
        if undelivered > 0 {
            self.release_connection_credit(undelivered);
        }
        if !reason.is_remote() && reason != ResetReason::ConnectionClosed && !peer_closed {
            self.out.push(Outbound::Reset {
                stream_id: id,
                code: reason.error_code(),
            });
        }

        tracing::debug!(
            connection_id = %self.id,
            stream_id = id,
            reason = %reason,
            "Stream reset"
        );
        match self.propagator.propagate(Terminal::Reset(reason), progress) {
            CallerOutcome::SyntheticFailure(status) => {
                let _ = slot
                    .events
                    .send(ResponseEvent::SyntheticFailure { status, reason });
            }
            CallerOutcome::Aborted => {
                let _ = slot.events.send(ResponseEvent::Reset(reason));
            }
            CallerOutcome::Complete | CallerOutcome::Abandoned => {}
        }
        self.stream_removed();
    }

    fn complete_stream(&mut self, id: StreamId) {
        let Some(slot) = self.streams.remove(&id) else {
            return;
        };
        self.propagator
            .propagate(Terminal::Complete, slot.stream.progress());
        tracing::trace!(
            connection_id = %self.id,
            stream_id = slot.stream.id(),
            sent = slot.stream.bytes_sent(),
            received = slot.stream.bytes_received(),
            "Stream complete"
        );
        self.stream_removed();
    }

    fn stream_removed(&mut self) {
        self.stats.gauge_add(&self.streams_active_gauge, -1);
        if self.state == ConnectionState::Active {
            self.report(ConnectionEvent::Capacity {
                live: self.streams.len(),
                max_streams: self.max_streams(),
            });
        }
    }

    /// Reset every live stream and close.
    fn teardown(&mut self) {
        if !self.streams.is_empty() {
            self.stats.inc(&self.destroy_with_active_counter);
        }
        let ids: Vec<StreamId> = self.streams.keys().copied().collect();
        for id in ids {
            self.reset_stream(id, ResetReason::ConnectionClosed);
        }
        self.transition(ConnectionState::Closed);
    }

    // ---------------------------------------------------------------
    // Flow control and output
    // ---------------------------------------------------------------

    fn release_connection_credit(&mut self, bytes: usize) {
        self.recv_credit += bytes as u32;
        if self.recv_credit >= self.recv_window.capacity() / 2 {
            let increment = std::mem::take(&mut self.recv_credit);
            if self.recv_window.replenish(increment).is_ok() {
                self.out.push(Outbound::WindowUpdate {
                    stream_id: None,
                    increment,
                });
            }
        }
    }

    /// Flush request bytes, retire finished streams and write buffered frames.
    fn end_turn(&mut self) {
        let max_frame_size = self.upstream.max_frame_size;
        let mut failed = Vec::new();
        for (id, slot) in self.streams.iter_mut() {
            if let Err(reason) = slot
                .stream
                .flush(&mut self.send_window, max_frame_size, &mut self.out)
            {
                failed.push((*id, reason));
            }
        }
        for (id, reason) in failed {
            self.reset_stream(id, reason);
        }

        let finished: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, slot)| slot.stream.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            self.complete_stream(id);
        }

        if self.state == ConnectionState::ShuttingDown && self.streams.is_empty() {
            self.transition(ConnectionState::Closed);
        }

        let pending: usize = self.streams.values().map(|s| s.stream.pending_bytes()).sum();
        self.stats.gauge_add(
            &self.pending_send_gauge,
            pending as i64 - self.reported_pending as i64,
        );
        self.reported_pending = pending;

        if self.streams.is_empty() && self.state == ConnectionState::Active {
            if self.idle_deadline.is_none() {
                self.idle_deadline = Some(Instant::now() + self.timeouts.idle());
            }
        } else {
            self.idle_deadline = None;
        }

        match &self.outbound {
            Some(outbound) => {
                for frame in self.out.drain(..) {
                    let _ = outbound.send(frame);
                }
            }
            None => self.out.clear(),
        }
    }

    fn finish(mut self, mut commands: mpsc::UnboundedReceiver<ConnCommand>) {
        self.teardown();
        self.end_turn();
        self.outbound = None;

        // Bounced opens reach the pool before the slot disappears.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            self.reject_command(command);
        }

        if self.connect_failed {
            self.report(ConnectionEvent::ConnectFailed);
        } else {
            self.report(ConnectionEvent::Closed);
        }
        tracing::debug!(
            connection_id = %self.id,
            destination = %self.destination,
            "Upstream connection closed"
        );
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

//! Per-destination connection pool.
//!
//! # Responsibilities
//! - Reuse connections with spare stream capacity
//! - Queue stream requests FIFO per destination when none has capacity
//! - Open new connections while demand exceeds what is already handshaking
//! - Stop routing to connections that announced shutdown and replace them
//! - Back off and eventually give up when connects keep failing

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use http::Request;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::schema::{MuxConfig, ReconnectConfig, TimeoutConfig, UpstreamConfig};
use crate::error::PoolError;
use crate::net::connection::{ConnectionId, ConnectionState};
use crate::net::transport::Connector;
use crate::observability::Stats;
use crate::pool::destination::{Destination, DestinationSelector, StaticSelector};
use crate::resilience::backoff::reconnect_delay;
use crate::upstream::connection::{
    self, ConnCommand, ConnectionContext, ConnectionEvent, ConnectionReport, PendingRequest,
};
use crate::upstream::handle::StreamHandle;

/// Pool view of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub state: String,
    pub live: usize,
    pub max_streams: u32,
}

/// Pool view of one destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DestinationSnapshot {
    pub connections: Vec<ConnectionSnapshot>,
    pub queued: usize,
}

enum PoolCommand {
    Acquire {
        cluster: String,
        pending: PendingRequest,
    },
    Snapshot {
        cluster: String,
        reply: oneshot::Sender<DestinationSnapshot>,
    },
    Shutdown,
}

/// Handle to the pool task. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    commands: mpsc::UnboundedSender<PoolCommand>,
    stats: Stats,
}

impl ConnectionPool {
    /// Create a pool resolving clusters from `config.clusters`.
    /// Must be called inside a tokio runtime.
    pub fn new(config: &MuxConfig, connector: Arc<dyn Connector>, stats: Stats) -> Self {
        let selector = Arc::new(StaticSelector::from_config(&config.clusters));
        Self::with_selector(config, connector, selector, stats)
    }

    pub fn with_selector(
        config: &MuxConfig,
        connector: Arc<dyn Connector>,
        selector: Arc<dyn DestinationSelector>,
        stats: Stats,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (retries_tx, retries_rx) = mpsc::unbounded_channel();

        let actor = PoolActor {
            upstream: config.upstream.clone(),
            timeouts: config.timeouts.clone(),
            reconnect: config.reconnect.clone(),
            connector,
            selector,
            stats: stats.clone(),
            entries: HashMap::new(),
            reports: reports_tx,
            retries: retries_tx,
            next_seq: 0,
        };
        tokio::spawn(actor.run(commands_rx, reports_rx, retries_rx));

        Self {
            commands: commands_tx,
            stats,
        }
    }

    /// Get a stream to `cluster`, waiting in the destination queue if every
    /// connection is at its limit. Dropping the future gives up the place.
    pub async fn acquire_stream(
        &self,
        cluster: &str,
        request: Request<()>,
        end_stream: bool,
    ) -> Result<StreamHandle, PoolError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(PoolCommand::Acquire {
                cluster: cluster.to_string(),
                pending: PendingRequest {
                    seq: 0,
                    request,
                    end_stream,
                    reply,
                },
            })
            .map_err(|_| PoolError::Shutdown)?;
        response.await.map_err(|_| PoolError::Shutdown)?
    }

    pub async fn snapshot(&self, cluster: &str) -> Result<DestinationSnapshot, PoolError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(PoolCommand::Snapshot {
                cluster: cluster.to_string(),
                reply,
            })
            .map_err(|_| PoolError::Shutdown)?;
        response.await.map_err(|_| PoolError::Shutdown)
    }

    /// Close every connection and fail queued requests.
    pub fn shutdown(&self) {
        let _ = self.commands.send(PoolCommand::Shutdown);
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct ConnectionSlot {
    id: ConnectionId,
    commands: mpsc::UnboundedSender<ConnCommand>,
    state: ConnectionState,
    live: usize,
    /// Opens sent and not yet answered.
    in_flight: usize,
    max_streams: u32,
}

impl ConnectionSlot {
    fn has_spare(&self) -> bool {
        self.state.admits_streams() && self.live + self.in_flight < self.max_streams as usize
    }

    fn is_draining(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::ShuttingDown | ConnectionState::Closed
        )
    }
}

#[derive(Debug)]
struct DestinationEntry {
    destination: Destination,
    connections: Vec<ConnectionSlot>,
    queue: VecDeque<PendingRequest>,
    connect_failures: u32,
    retry_scheduled: bool,
    cx_total: String,
    cx_connect_fail: String,
    cx_close_notify: String,
    rq_pending_total: String,
}

impl DestinationEntry {
    fn new(destination: Destination) -> Self {
        let prefix = destination.stat_prefix().to_string();
        Self {
            destination,
            connections: Vec::new(),
            queue: VecDeque::new(),
            connect_failures: 0,
            retry_scheduled: false,
            cx_total: format!("{prefix}.upstream_cx_total"),
            cx_connect_fail: format!("{prefix}.upstream_cx_connect_fail"),
            cx_close_notify: format!("{prefix}.upstream_cx_close_notify"),
            rq_pending_total: format!("{prefix}.upstream_rq_pending_total"),
        }
    }

    fn slot_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionSlot> {
        self.connections.iter_mut().find(|slot| slot.id == id)
    }

    fn has_spare_capacity(&self) -> bool {
        self.connections.iter().any(ConnectionSlot::has_spare)
    }

    fn waiting(&self) -> usize {
        self.queue.iter().filter(|p| !p.is_abandoned()).count()
    }

    /// Put a request back at its arrival position.
    fn requeue(&mut self, pending: PendingRequest) {
        let at = self.queue.partition_point(|p| p.seq < pending.seq);
        self.queue.insert(at, pending);
    }

    /// Opens sent to a connection that stopped admitting. They come back as
    /// rejections and must be served before anything behind them.
    fn awaiting_bounces(&self) -> bool {
        self.connections
            .iter()
            .any(|slot| slot.in_flight > 0 && !slot.state.admits_streams())
    }

    /// Hand queued requests to connections with spare capacity, oldest first.
    fn serve_queue(&mut self) {
        if self.awaiting_bounces() {
            return;
        }
        while let Some(pending) = self.queue.pop_front() {
            if pending.is_abandoned() {
                continue;
            }
            let Some(slot) = self.connections.iter_mut().find(|slot| slot.has_spare()) else {
                self.queue.push_front(pending);
                break;
            };
            match slot.commands.send(ConnCommand::Open(pending)) {
                Ok(()) => slot.in_flight += 1,
                Err(mpsc::error::SendError(command)) => {
                    slot.state = ConnectionState::Closed;
                    if let ConnCommand::Open(pending) = command {
                        self.queue.push_front(pending);
                    }
                }
            }
        }
    }

    /// How many new connections the current queue calls for.
    fn connections_wanted(&self, upstream: &UpstreamConfig) -> usize {
        if self.retry_scheduled {
            return 0;
        }
        let waiting = self.waiting();
        let per_connection = upstream.max_concurrent_streams as usize;
        let mut capacity = self
            .connections
            .iter()
            .filter(|slot| slot.state == ConnectionState::Connecting)
            .count()
            * per_connection;
        let mut open = self.connections.iter().filter(|slot| !slot.is_draining()).count();

        let mut wanted = 0;
        while waiting > capacity && open < upstream.max_connections_per_destination {
            wanted += 1;
            open += 1;
            capacity += per_connection;
        }
        wanted
    }

    fn fail_waiters(&mut self, error: PoolError) {
        for pending in self.queue.drain(..) {
            let _ = pending.reply.send(Err(error.clone()));
        }
    }

    fn snapshot(&self) -> DestinationSnapshot {
        DestinationSnapshot {
            connections: self
                .connections
                .iter()
                .map(|slot| ConnectionSnapshot {
                    id: slot.id.as_u64(),
                    state: slot.state.to_string(),
                    live: slot.live,
                    max_streams: slot.max_streams,
                })
                .collect(),
            queued: self.waiting(),
        }
    }
}

struct PoolActor {
    upstream: UpstreamConfig,
    timeouts: TimeoutConfig,
    reconnect: ReconnectConfig,
    connector: Arc<dyn Connector>,
    selector: Arc<dyn DestinationSelector>,
    stats: Stats,
    entries: HashMap<String, DestinationEntry>,
    reports: mpsc::UnboundedSender<ConnectionReport>,
    retries: mpsc::UnboundedSender<String>,
    next_seq: u64,
}

impl PoolActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PoolCommand>,
        mut reports: mpsc::UnboundedReceiver<ConnectionReport>,
        mut retries: mpsc::UnboundedReceiver<String>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(PoolCommand::Acquire { cluster, pending }) => self.acquire(cluster, pending),
                    Some(PoolCommand::Snapshot { cluster, reply }) => {
                        let snapshot = self
                            .entries
                            .get(&cluster)
                            .map(DestinationEntry::snapshot)
                            .unwrap_or_default();
                        let _ = reply.send(snapshot);
                    }
                    Some(PoolCommand::Shutdown) | None => break,
                },
                Some(report) = reports.recv() => self.on_report(report),
                Some(cluster) = retries.recv() => {
                    if let Some(entry) = self.entries.get_mut(&cluster) {
                        entry.retry_scheduled = false;
                    }
                    self.dispatch(&cluster);
                }
            }
        }
        self.shutdown();
    }

    fn acquire(&mut self, cluster: String, mut pending: PendingRequest) {
        if pending.is_abandoned() {
            return;
        }
        pending.seq = self.next_seq;
        self.next_seq += 1;
        let Some(destination) = self.selector.select(&cluster) else {
            tracing::warn!(cluster = %cluster, "No destination for cluster");
            let _ = pending.reply.send(Err(PoolError::NoDestination(cluster)));
            return;
        };

        let entry = self
            .entries
            .entry(cluster.clone())
            .or_insert_with(|| DestinationEntry::new(destination));
        if !entry.has_spare_capacity() {
            self.stats.inc(&entry.rq_pending_total);
        }
        entry.queue.push_back(pending);
        self.dispatch(&cluster);
    }

    fn dispatch(&mut self, cluster: &str) {
        let Some(entry) = self.entries.get_mut(cluster) else {
            return;
        };
        entry.serve_queue();
        let wanted = entry.connections_wanted(&self.upstream);
        for _ in 0..wanted {
            self.open_connection(cluster);
        }
    }

    fn open_connection(&mut self, cluster: &str) {
        let Some(entry) = self.entries.get_mut(cluster) else {
            return;
        };
        let id = ConnectionId::next();
        let context = ConnectionContext {
            id,
            destination: entry.destination.clone(),
            upstream: self.upstream.clone(),
            timeouts: self.timeouts.clone(),
            stats: self.stats.clone(),
            reports: self.reports.clone(),
        };
        let commands = connection::spawn(context, self.connector.clone());
        entry.connections.push(ConnectionSlot {
            id,
            commands,
            state: ConnectionState::Connecting,
            live: 0,
            in_flight: 0,
            max_streams: self.upstream.max_concurrent_streams,
        });
        self.stats.inc(&entry.cx_total);
        tracing::debug!(
            connection_id = %id,
            destination = %entry.destination,
            connections = entry.connections.len(),
            "Opening upstream connection"
        );
    }

    fn on_report(&mut self, report: ConnectionReport) {
        let ConnectionReport {
            cluster,
            connection_id,
            event,
        } = report;
        let Some(entry) = self.entries.get_mut(&cluster) else {
            return;
        };

        match event {
            ConnectionEvent::Active { max_streams } => {
                if let Some(slot) = entry.slot_mut(connection_id) {
                    slot.state = ConnectionState::Active;
                    slot.max_streams = max_streams;
                }
                entry.connect_failures = 0;
            }
            ConnectionEvent::Admitted { live, max_streams } => {
                if let Some(slot) = entry.slot_mut(connection_id) {
                    slot.in_flight = slot.in_flight.saturating_sub(1);
                    slot.live = live;
                    slot.max_streams = max_streams;
                }
            }
            ConnectionEvent::Capacity { live, max_streams } => {
                if let Some(slot) = entry.slot_mut(connection_id) {
                    slot.live = live;
                    slot.max_streams = max_streams;
                }
            }
            ConnectionEvent::Rejected(pending) => {
                if let Some(slot) = entry.slot_mut(connection_id) {
                    slot.in_flight = slot.in_flight.saturating_sub(1);
                }
                entry.requeue(pending);
            }
            ConnectionEvent::GoAway => {
                if let Some(slot) = entry.slot_mut(connection_id) {
                    slot.state = ConnectionState::ShuttingDown;
                }
                self.stats.inc(&entry.cx_close_notify);
                tracing::info!(
                    connection_id = %connection_id,
                    destination = %entry.destination,
                    "Upstream connection draining after close notify"
                );
            }
            ConnectionEvent::Draining => {
                if let Some(slot) = entry.slot_mut(connection_id) {
                    slot.state = ConnectionState::ShuttingDown;
                }
            }
            ConnectionEvent::Closed => {
                entry.connections.retain(|slot| slot.id != connection_id);
            }
            ConnectionEvent::ConnectFailed => {
                entry.connections.retain(|slot| slot.id != connection_id);
                entry.connect_failures += 1;
                self.stats.inc(&entry.cx_connect_fail);

                if entry.waiting() > 0 {
                    if entry.connect_failures >= self.reconnect.max_attempts {
                        tracing::warn!(
                            destination = %entry.destination,
                            attempts = entry.connect_failures,
                            "Giving up on destination"
                        );
                        let error = PoolError::ConnectFailed {
                            destination: entry.destination.to_string(),
                            attempts: entry.connect_failures,
                        };
                        entry.fail_waiters(error);
                        entry.connect_failures = 0;
                    } else if !entry.retry_scheduled {
                        let delay = reconnect_delay(&self.reconnect, entry.connect_failures);
                        tracing::debug!(
                            destination = %entry.destination,
                            attempt = entry.connect_failures,
                            delay_ms = delay.as_millis() as u64,
                            "Scheduling reconnect"
                        );
                        entry.retry_scheduled = true;
                        let retries = self.retries.clone();
                        let cluster = cluster.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = retries.send(cluster);
                        });
                    }
                }
            }
        }

        self.dispatch(&cluster);
    }

    fn shutdown(&mut self) {
        tracing::info!(destinations = self.entries.len(), "Connection pool shutting down");
        for entry in self.entries.values_mut() {
            for slot in &entry.connections {
                let _ = slot.commands.send(ConnCommand::Shutdown);
            }
            entry.fail_waiters(PoolError::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(seq: u64, path: &str) -> (PendingRequest, oneshot::Receiver<Result<StreamHandle, PoolError>>) {
        let (reply, rx) = oneshot::channel();
        let request = Request::builder().uri(path).body(()).unwrap();
        (
            PendingRequest {
                seq,
                request,
                end_stream: true,
                reply,
            },
            rx,
        )
    }

    fn slot(state: ConnectionState, in_flight: usize) -> (ConnectionSlot, mpsc::UnboundedReceiver<ConnCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (
            ConnectionSlot {
                id: ConnectionId::next(),
                commands,
                state,
                live: 0,
                in_flight,
                max_streams: 10,
            },
            rx,
        )
    }

    fn queued_paths(entry: &DestinationEntry) -> Vec<String> {
        entry
            .queue
            .iter()
            .map(|p| p.request.uri().to_string())
            .collect()
    }

    #[test]
    fn bounced_requests_keep_arrival_order() {
        let mut entry = DestinationEntry::new(Destination::new("c", "a:1"));
        let (c, _c_rx) = pending(2, "/c");
        entry.queue.push_back(c);

        // Rejections arrive in send order: a then b.
        let (a, _a_rx) = pending(0, "/a");
        let (b, _b_rx) = pending(1, "/b");
        entry.requeue(a);
        entry.requeue(b);
        assert_eq!(queued_paths(&entry), ["/a", "/b", "/c"]);
    }

    #[test]
    fn queue_waits_for_opens_on_a_draining_connection() {
        let mut entry = DestinationEntry::new(Destination::new("c", "a:1"));
        let (draining, _draining_rx) = slot(ConnectionState::ShuttingDown, 1);
        let (fresh, mut fresh_rx) = slot(ConnectionState::Active, 0);
        entry.connections.push(draining);
        entry.connections.push(fresh);

        let (b, _b_rx) = pending(1, "/b");
        entry.queue.push_back(b);
        entry.serve_queue();
        assert_eq!(queued_paths(&entry), ["/b"]);
        assert!(fresh_rx.try_recv().is_err());

        let (a, _a_rx) = pending(0, "/a");
        entry.connections[0].in_flight = 0;
        entry.requeue(a);
        entry.serve_queue();
        assert!(entry.queue.is_empty());

        let order: Vec<String> = std::iter::from_fn(|| fresh_rx.try_recv().ok())
            .map(|command| match command {
                ConnCommand::Open(p) => p.request.uri().to_string(),
                other => panic!("unexpected command {other:?}"),
            })
            .collect();
        assert_eq!(order, ["/a", "/b"]);
    }
}

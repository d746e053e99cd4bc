//! Transport seam between the multiplexing core and the codec.
//!
//! # Responsibilities
//! - Carry decoded frames in both directions
//! - Signal disconnects (inbound channel closes)
//! - Let the pool open new transports through a `Connector`
//!
//! # Design Decisions
//! - Frames travel over unbounded channels; backpressure is enforced by the
//!   flow-control windows, not by channel capacity
//! - Closing is dropping the outbound sender

use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::net::frame::{Inbound, Outbound};
use crate::pool::destination::Destination;

/// The core's end of an established upstream transport.
#[derive(Debug)]
pub struct Transport {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// The codec's (or a test peer's) end of a transport.
#[derive(Debug)]
pub struct PeerTransport {
    /// Frames the core asked to send.
    pub from_core: mpsc::UnboundedReceiver<Outbound>,
    /// Decoded peer frames for the core.
    pub to_core: mpsc::UnboundedSender<Inbound>,
}

impl PeerTransport {
    /// Deliver a frame to the core. Returns false once the core has gone.
    pub fn send(&self, frame: Inbound) -> bool {
        self.to_core.send(frame).is_ok()
    }

    /// Next frame from the core, `None` once it closed the transport.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.from_core.recv().await
    }
}

/// Build a connected in-memory transport pair.
pub fn pair() -> (Transport, PeerTransport) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    (
        Transport {
            outbound: out_tx,
            inbound: in_rx,
        },
        PeerTransport {
            from_core: out_rx,
            to_core: in_tx,
        },
    )
}

pub type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<Transport>> + Send>>;

/// Opens transports to a destination.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, destination: &Destination) -> ConnectFuture;
}

//! Connection pool subsystem.
//!
//! # Data Flow
//! ```text
//! acquire_stream(cluster, request)
//!     → destination.rs (cluster → Destination via DestinationSelector)
//!     → connection_pool.rs (per-destination entry)
//!         - connection with spare capacity → Open sent to its task
//!         - otherwise queue FIFO, open another connection if allowed
//!     → connection task replies with a StreamHandle
//!
//! Connection reports (Active, Capacity, GoAway, Closed, ConnectFailed)
//!     → entry bookkeeping → serve the queue head
//! ```
//!
//! # Design Decisions
//! - One pool task owns every entry; connections report to it over a channel
//! - Draining connections receive no new streams
//! - Abandoned waiters are skipped, never served

pub mod connection_pool;
pub mod destination;

pub use connection_pool::{ConnectionPool, ConnectionSnapshot, DestinationSnapshot};
pub use destination::{Destination, DestinationSelector, StaticSelector};

//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Pool needs a connection
//!     → transport.rs (Connector opens a Transport)
//!     → frame.rs (decoded frames cross the codec boundary)
//!     → connection.rs (identity, lifecycle state machine)
//!     → Hand off to upstream::connection task
//!
//! Connection States:
//!     Connecting → Active → ShuttingDown → Closed
//! ```
//!
//! # Design Decisions
//! - Wire encoding stays on the codec side of the frame enums
//! - loopback.rs is an in-process peer for the CLI and tests

pub mod connection;
pub mod frame;
pub mod loopback;
pub mod transport;

pub use connection::{ConnectionId, ConnectionState};
pub use frame::{ErrorCode, Inbound, Outbound, Settings, StreamId};
pub use transport::{Connector, PeerTransport, Transport};

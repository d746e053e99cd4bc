//! Multiplexed upstream subsystem.
//!
//! # Data Flow
//! ```text
//! Pool hands a PendingRequest to a connection task
//!     → connection.rs (admission under the concurrency limit, stream id)
//!     → stream.rs (half states, send/receive windows)
//!     → flow_control.rs (byte credit, stream and connection level)
//!     → handle.rs (caller sends body, reads ResponseEvents)
//!
//! Stream ends:
//!     → propagation.rs (caller outcome + rx/tx reset counters)
//!     → connection.rs reports capacity back to the pool
//! ```
//!
//! # Design Decisions
//! - The connection task owns every stream; handles carry only an id and a
//!   command sender
//! - Failures are a closed set of `ResetReason`s handled by `match`
//! - A reset before headers becomes a synthetic 503, after headers an abort

pub mod connection;
pub mod flow_control;
pub mod handle;
pub mod limits;
pub mod propagation;
pub mod stream;

pub use crate::error::ResetReason;
pub use flow_control::{FlowControlError, FlowControlWindow};
pub use handle::{ResponseEvent, StreamHandle, UpstreamResponse};
pub use limits::HeaderLimits;
pub use propagation::{CallerOutcome, ResetPropagator};
pub use stream::HalfState;

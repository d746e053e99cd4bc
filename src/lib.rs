//! Multiplexed upstream connection core for an HTTP proxy.
//!
//! Many independent request/response exchanges share a few upstream
//! connections. Each connection enforces its concurrency limit and flow
//! control, and turns stream resets and connection shutdowns into caller
//! outcomes and stats.

pub mod config;
pub mod error;
pub mod net;
pub mod observability;
pub mod pool;
pub mod resilience;
pub mod upstream;

pub use config::MuxConfig;
pub use error::{PoolError, ResetReason, StreamError};
pub use observability::Stats;
pub use pool::ConnectionPool;
pub use upstream::{ResponseEvent, StreamHandle, UpstreamResponse};

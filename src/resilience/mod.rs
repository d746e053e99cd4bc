//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Replacement connection fails to connect
//!     → pool counts the consecutive failure
//!     → backoff.rs (delay before the next attempt)
//!     → After reconnect.max_attempts failures: queued requests fail
//! ```
//!
//! # Design Decisions
//! - The only retry inside the core is opening a new connection
//! - Jitter keeps many destinations from reconnecting in lockstep

pub mod backoff;

//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the
//! multiplexing core. All types derive Serde traits for deserialization from
//! config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MuxConfig {
    /// Upstream connection and stream settings.
    pub upstream: UpstreamConfig,

    /// Handshake and idle deadlines.
    pub timeouts: TimeoutConfig,

    /// Replacement-connection backoff.
    pub reconnect: ReconnectConfig,

    /// Named upstream clusters and where to reach them.
    pub clusters: Vec<ClusterConfig>,

    /// Logging and metrics export.
    pub observability: ObservabilityConfig,
}

/// Multiplexing protocol family of the upstream connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http2,
    Http3,
}

impl Protocol {
    /// Prefix used for per-connection-class gauges.
    pub fn stats_root(&self) -> &'static str {
        match self {
            Protocol::Http2 => "http2",
            Protocol::Http3 => "http3",
        }
    }
}

/// Upstream connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Protocol family, used for stats naming.
    pub protocol: Protocol,

    /// Local ceiling on concurrent streams per connection. The effective
    /// limit is the lower of this and what the peer advertises.
    pub max_concurrent_streams: u32,

    /// Maximum non-draining connections opened per destination.
    pub max_connections_per_destination: usize,

    /// Initial per-stream receive window advertised to the peer.
    pub initial_stream_window_size: u32,

    /// Connection-level receive window advertised to the peer.
    pub initial_connection_window_size: u32,

    /// Largest DATA payload emitted in one frame.
    pub max_frame_size: u32,

    /// Watermark on buffered-but-undelivered bytes per stream, applied to
    /// both directions.
    pub buffer_limit_bytes: u32,

    /// Maximum number of response header fields, `:status` included.
    pub max_response_headers_count: u32,

    /// Maximum size of a response header block in KiB.
    pub max_response_headers_kb: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Http2,
            max_concurrent_streams: 100,
            max_connections_per_destination: 8,
            initial_stream_window_size: 65_535,
            initial_connection_window_size: 1024 * 1024,
            max_frame_size: 16_384,
            buffer_limit_bytes: 1024 * 1024,
            max_response_headers_count: 100,
            max_response_headers_kb: 60,
        }
    }
}

impl UpstreamConfig {
    /// Receive window actually advertised per stream. Never more than the
    /// buffer limit can hold.
    pub fn advertised_stream_window(&self) -> u32 {
        self.initial_stream_window_size.min(self.buffer_limit_bytes)
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment (connect + peer settings) timeout in seconds.
    pub connect_secs: u64,

    /// Seconds an active connection may sit without streams before it closes.
    pub idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            idle_secs: 60,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
}

/// Backoff for replacement connections after connect failures.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Consecutive connect failures tolerated before queued requests fail.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
        }
    }
}

/// Upstream cluster definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Cluster name used by callers and in stat names.
    pub name: String,

    /// Upstream address (e.g., "127.0.0.1:3000").
    pub address: String,
}

/// Logging and metrics export.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Level for this crate's events when `RUST_LOG` is unset.
    pub log_level: String,

    /// Serve the stats registry for Prometheus scraping.
    pub metrics_enabled: bool,

    /// Where the Prometheus listener binds.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

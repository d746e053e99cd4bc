//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, windows within protocol bounds)
//! - Detect duplicate cluster names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: MuxConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::MuxConfig;
use crate::upstream::flow_control::MAX_WINDOW_SIZE;

/// A single semantic problem found in a config.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} = {value} exceeds the maximum window size")]
    WindowTooLarge { field: &'static str, value: u32 },

    #[error("cluster `{0}` is defined more than once")]
    DuplicateCluster(String),

    #[error("cluster `{name}` has an invalid address `{address}`")]
    InvalidAddress { name: String, address: String },

    #[error("metrics address `{0}` is not a socket address")]
    InvalidMetricsAddress(String),
}

/// Check a parsed config for values the core cannot run with.
pub fn validate_config(config: &MuxConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let upstream = &config.upstream;

    let non_zero: [(&'static str, u64); 8] = [
        ("upstream.max_concurrent_streams", upstream.max_concurrent_streams.into()),
        ("upstream.max_connections_per_destination", upstream.max_connections_per_destination as u64),
        ("upstream.initial_stream_window_size", upstream.initial_stream_window_size.into()),
        ("upstream.initial_connection_window_size", upstream.initial_connection_window_size.into()),
        ("upstream.max_frame_size", upstream.max_frame_size.into()),
        ("upstream.buffer_limit_bytes", upstream.buffer_limit_bytes.into()),
        ("upstream.max_response_headers_count", upstream.max_response_headers_count.into()),
        ("timeouts.connect_secs", config.timeouts.connect_secs),
    ];
    for (field, value) in non_zero {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }

    for (field, value) in [
        ("upstream.initial_stream_window_size", upstream.initial_stream_window_size),
        ("upstream.initial_connection_window_size", upstream.initial_connection_window_size),
    ] {
        if i64::from(value) > MAX_WINDOW_SIZE {
            errors.push(ValidationError::WindowTooLarge { field, value });
        }
    }

    let mut seen = HashSet::new();
    for cluster in &config.clusters {
        if !seen.insert(cluster.name.as_str()) {
            errors.push(ValidationError::DuplicateCluster(cluster.name.clone()));
        }
        if cluster.address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidAddress {
                name: cluster.name.clone(),
                address: cluster.address.clone(),
            });
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

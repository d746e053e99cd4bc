//! Terminal stream events → caller outcome and reset counters.
//!
//! # Responsibilities
//! - Decide what the caller sees when a stream ends
//! - Attribute resets to the right direction (rx vs tx, upstream vs downstream)
//!
//! # Design Decisions
//! - `classify` is pure so the rules are testable without a connection
//! - A peer reset is only ever counted as rx; anything we initiate is tx

use http::StatusCode;

use crate::error::ResetReason;
use crate::observability::metrics::{Stats, DOWNSTREAM_RX_RESET, DOWNSTREAM_TX_RESET};

/// Status returned to the caller when the upstream fails before responding.
pub const SYNTHETIC_FAILURE_STATUS: StatusCode = StatusCode::SERVICE_UNAVAILABLE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Complete,
    Reset(ResetReason),
}

/// What the caller observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerOutcome {
    Complete,
    /// No headers reached the caller; a locally generated response replaces them.
    SyntheticFailure(StatusCode),
    /// Headers were delivered; the response ends incomplete.
    Aborted,
    /// The caller itself went away.
    Abandoned,
}

/// How far the response got before the stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseProgress {
    AwaitingHeaders,
    HeadersDelivered,
    /// The end marker was received.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Propagation {
    pub outcome: CallerOutcome,
    /// Reset counted against the upstream destination.
    pub upstream: Option<Direction>,
    /// Reset counted against the downstream side.
    pub downstream: Option<Direction>,
}

pub fn classify(terminal: Terminal, progress: ResponseProgress) -> Propagation {
    let reason = match terminal {
        Terminal::Complete => {
            return Propagation {
                outcome: CallerOutcome::Complete,
                upstream: None,
                downstream: None,
            }
        }
        Terminal::Reset(reason) => reason,
    };

    let upstream = match reason {
        ResetReason::RemoteReset(_) => Some(Direction::Rx),
        ResetReason::ConnectionClosed => None,
        _ => Some(Direction::Tx),
    };

    match (reason, progress) {
        // Caller walked away after a full response: only the request side
        // is cut short, and nothing counts as a reset.
        (ResetReason::LocalAbort, ResponseProgress::Complete) => Propagation {
            outcome: CallerOutcome::Abandoned,
            upstream: None,
            downstream: None,
        },
        (ResetReason::LocalAbort, _) => Propagation {
            outcome: CallerOutcome::Abandoned,
            upstream: Some(Direction::Tx),
            downstream: Some(Direction::Rx),
        },
        (_, ResponseProgress::Complete) => Propagation {
            outcome: CallerOutcome::Complete,
            upstream,
            downstream: None,
        },
        (_, ResponseProgress::HeadersDelivered) => Propagation {
            outcome: CallerOutcome::Aborted,
            upstream,
            downstream: Some(Direction::Tx),
        },
        (_, ResponseProgress::AwaitingHeaders) => Propagation {
            outcome: CallerOutcome::SyntheticFailure(SYNTHETIC_FAILURE_STATUS),
            upstream,
            downstream: None,
        },
    }
}

/// Applies `classify` results to the stats registry for one destination.
#[derive(Debug, Clone)]
pub struct ResetPropagator {
    stats: Stats,
    rx_reset: String,
    tx_reset: String,
}

impl ResetPropagator {
    pub fn new(stats: Stats, stat_prefix: &str) -> Self {
        Self {
            stats,
            rx_reset: format!("{stat_prefix}.rx_reset"),
            tx_reset: format!("{stat_prefix}.tx_reset"),
        }
    }

    pub fn propagate(&self, terminal: Terminal, progress: ResponseProgress) -> CallerOutcome {
        let propagation = classify(terminal, progress);
        match propagation.upstream {
            Some(Direction::Rx) => self.stats.inc(&self.rx_reset),
            Some(Direction::Tx) => self.stats.inc(&self.tx_reset),
            None => {}
        }
        match propagation.downstream {
            Some(Direction::Rx) => self.stats.inc(DOWNSTREAM_RX_RESET),
            Some(Direction::Tx) => self.stats.inc(DOWNSTREAM_TX_RESET),
            None => {}
        }
        propagation.outcome
    }
}

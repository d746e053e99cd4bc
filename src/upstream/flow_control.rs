//! Byte-credit accounting for one direction of a stream or connection.

use thiserror::Error;

/// Largest window a peer may grant (2^31 - 1).
pub const MAX_WINDOW_SIZE: i64 = 0x7fff_ffff;

/// Window size assumed before the peer says otherwise.
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlowControlError {
    /// Consuming would take more bytes than the window holds.
    #[error("window exceeded: {requested} bytes requested, {available} available")]
    Exceeded { requested: u32, available: i64 },

    /// Crediting would grow the window past the protocol maximum.
    #[error("window overflow")]
    Overflow,
}

/// A send or receive window.
///
/// `capacity` is the configured size; `available` is what is left of it.
/// Consumed bytes (`capacity - available`) never exceed the capacity. A
/// settings change may push `available` negative, in which case nothing can
/// be consumed until credit arrives.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    capacity: u32,
    available: i64,
}

impl FlowControlWindow {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            available: i64::from(capacity),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Remaining window (may be negative after a settings decrease).
    pub fn available(&self) -> i64 {
        self.available
    }

    /// How many bytes may be consumed right now.
    pub fn credit(&self) -> u32 {
        self.available.clamp(0, MAX_WINDOW_SIZE) as u32
    }

    /// Take `amount` bytes from the window. The window is unchanged on error.
    pub fn consume(&mut self, amount: u32) -> Result<(), FlowControlError> {
        let new = self.available - i64::from(amount);
        if new < 0 {
            return Err(FlowControlError::Exceeded {
                requested: amount,
                available: self.available,
            });
        }
        self.available = new;
        Ok(())
    }

    /// Return `increment` bytes of credit (peer window update, or the caller
    /// draining received bytes).
    pub fn replenish(&mut self, increment: u32) -> Result<(), FlowControlError> {
        let new = self.available + i64::from(increment);
        if new > MAX_WINDOW_SIZE {
            return Err(FlowControlError::Overflow);
        }
        self.available = new;
        if new > i64::from(self.capacity) {
            self.capacity = new as u32;
        }
        Ok(())
    }

    /// Apply a change of the initial window size. The delta may be negative.
    pub fn resize(&mut self, new_capacity: u32) -> Result<(), FlowControlError> {
        let delta = i64::from(new_capacity) - i64::from(self.capacity);
        let new = self.available + delta;
        if new > MAX_WINDOW_SIZE {
            return Err(FlowControlError::Overflow);
        }
        self.available = new;
        self.capacity = new_capacity;
        Ok(())
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

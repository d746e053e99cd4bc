//! Response header limits.
//!
//! # Responsibilities
//! - Enforce maximum response header count
//! - Enforce maximum response header block size
//!
//! # Design Decisions
//! - Checked when the headers frame arrives, before anything reaches the caller
//! - The `:status` pseudo-header counts toward both limits

use http::HeaderMap;

use crate::config::UpstreamConfig;

/// Size charged for the `:status` pseudo-header (name plus a 3-digit code).
const STATUS_PSEUDO_HEADER_BYTES: usize = ":status".len() + 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLimits {
    pub max_count: usize,
    pub max_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLimitViolation {
    TooMany { count: usize, max: usize },
    TooLarge { bytes: usize, max: usize },
}

impl HeaderLimits {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            max_count: config.max_response_headers_count as usize,
            max_bytes: config.max_response_headers_kb as usize * 1024,
        }
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<(), HeaderLimitViolation> {
        let count = headers.len() + 1;
        if count > self.max_count {
            return Err(HeaderLimitViolation::TooMany {
                count,
                max: self.max_count,
            });
        }

        let bytes = headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len())
            .sum::<usize>()
            + STATUS_PSEUDO_HEADER_BYTES;
        if bytes > self.max_bytes {
            return Err(HeaderLimitViolation::TooLarge {
                bytes,
                max: self.max_bytes,
            });
        }
        Ok(())
    }
}

impl Default for HeaderLimits {
    fn default() -> Self {
        Self::from_config(&UpstreamConfig::default())
    }
}

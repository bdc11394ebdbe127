//! ============================================================================
//! Oracle Configuration
//! ============================================================================
//! Explicit configuration context handed to the arbitration loop at
//! construction. Core components never read the environment themselves; the
//! CLI assembles this from flags, env vars, and provider files.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::tx_confirm::RetryConfig;
use crate::types::Address;

/// Default interval between event polls
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

/// Default upper bound on a single AI backend call
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default number of events arbitrated concurrently
pub const DEFAULT_MAX_CONCURRENT_EVENTS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Identity the oracle decides as; only escrows naming it are arbitrated
    pub arbiter: Address,
    pub poll_interval_ms: u64,
    /// First block scanned in a fresh session
    pub start_block: u64,
    pub max_concurrent_events: usize,
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl OracleConfig {
    pub fn new(arbiter: Address) -> Self {
        Self {
            arbiter,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            start_block: 0,
            max_concurrent_events: DEFAULT_MAX_CONCURRENT_EVENTS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            retry: RetryConfig::default(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

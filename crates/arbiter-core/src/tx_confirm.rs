//! ============================================================================
//! Ledger Write Retry & Confirmation Polling
//! ============================================================================
//! Provides robust ledger writes with:
//! - Exponential backoff with jitter for transient ledger errors
//! - Transaction confirmation status polling
//! - Conversion of confirmation outcomes into plain results
//! ============================================================================

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::ledger::Ledger;
use crate::types::*;

/// Configuration for write retry and confirmation behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of write attempts
    pub max_send_retries: u32,
    /// Maximum number of confirmation polling attempts
    pub max_confirm_retries: u32,
    /// Base delay between retries (multiplied by 2^attempt)
    pub base_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
    /// Confirmation polling interval
    pub poll_interval_ms: u64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_send_retries: 5,
            max_confirm_retries: 30,
            base_delay_ms: 500,
            max_delay_ms: 10000,
            poll_interval_ms: 1000,
            jitter: true,
        }
    }
}

/// Outcome of waiting for a submitted write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Included in a mined block
    Confirmed(u64),
    /// Rejected by the ledger
    Failed(String),
    /// Still pending when polling gave up (may still confirm)
    Timeout,
}

/// Calculate delay with exponential backoff and optional jitter
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt.min(63));
    let base_delay = config.base_delay_ms.saturating_mul(multiplier);
    let capped_delay = base_delay.min(config.max_delay_ms);

    let final_delay = if config.jitter {
        // 0-50% of the delay on top
        let jitter_factor = 1.0 + rand::thread_rng().gen_range(0.0..0.5);
        (capped_delay as f64 * jitter_factor) as u64
    } else {
        capped_delay
    };

    Duration::from_millis(final_delay)
}

/// Run a ledger write, retrying transient failures with backoff.
/// Permanent failures are returned on the first occurrence.
pub async fn send_with_retry<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut op: F,
) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let attempts = config.max_send_retries.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    info!("{} succeeded (attempt {})", label, attempt + 1);
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = calculate_delay(attempt, config);
                warn!(
                    "{} attempt {} failed, retrying in {:?}: {}",
                    label,
                    attempt + 1,
                    delay,
                    e
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Poll the ledger until `tx` is mined, fails, or polling is exhausted
pub async fn poll_confirmation(
    ledger: &dyn Ledger,
    tx: &TxHandle,
    config: &RetryConfig,
) -> ConfirmOutcome {
    debug!("Polling confirmation for {}", tx);

    for attempt in 0..config.max_confirm_retries {
        match ledger.tx_status(tx).await {
            Ok(TxStatus::Confirmed { block }) => {
                info!("Transaction confirmed: {} in block {} (poll attempt {})", tx, block, attempt + 1);
                return ConfirmOutcome::Confirmed(block);
            }
            Ok(TxStatus::Failed(reason)) => {
                warn!("Transaction failed on ledger: {}", reason);
                return ConfirmOutcome::Failed(reason);
            }
            Ok(TxStatus::Pending) | Ok(TxStatus::Unknown) => {
                debug!("Transaction not yet confirmed (attempt {})", attempt + 1);
            }
            Err(e) => {
                warn!("Error checking status (attempt {}): {}", attempt + 1, e);
            }
        }
        sleep(Duration::from_millis(config.poll_interval_ms)).await;
    }

    warn!(
        "Confirmation polling timed out for {} after {} attempts",
        tx, config.max_confirm_retries
    );
    ConfirmOutcome::Timeout
}

impl ConfirmOutcome {
    /// Convert into the block number, treating anything else as a violation
    /// of the write ordering the caller depends on
    pub fn into_block(self, tx: &TxHandle) -> Result<u64, OracleError> {
        match self {
            ConfirmOutcome::Confirmed(block) => Ok(block),
            ConfirmOutcome::Failed(msg) => Err(OracleError::CommitRevealViolation(format!(
                "transaction {} failed: {}",
                tx, msg
            ))),
            ConfirmOutcome::Timeout => Err(OracleError::CommitRevealViolation(format!(
                "transaction {} not confirmed in time",
                tx
            ))),
        }
    }
}

//! ============================================================================
//! ARBITER-CORE: Natural-Language Arbitration Oracle
//! ============================================================================
//! Watches an attestation ledger for escrow fulfillments and decides, by
//! asking an AI backend, whether each fulfillment satisfies the escrow's
//! natural-language demand:
//! - Demand / obligation / decision codec (ABI-style tuples)
//! - Provider router over OpenAI, OpenRouter and Anthropic backends
//! - Polling arbitration loop with per-event isolation
//! - Commit-reveal coordinator for the fulfiller side
//! - Ledger boundary with in-memory and redb-backed implementations
//! ============================================================================

pub mod arbiter;
pub mod codec;
pub mod commit_reveal;
pub mod config;
pub mod ledger;
pub mod provider;
pub mod shell;
pub mod tx_confirm;
pub mod types;

// Re-export main types for convenience
pub use types::*;
pub use arbiter::{ArbitrationLoop, CycleReport};
pub use commit_reveal::{AttemptState, CommitRevealCoordinator, FulfillmentReceipt};
pub use config::OracleConfig;
pub use ledger::{decisions_for, BlockClock, FileLedger, InMemoryLedger, Ledger};
pub use provider::{Backend, ProviderDescriptor, ProviderKind, ProviderRouter};
pub use shell::OracleShell;
pub use tx_confirm::RetryConfig;

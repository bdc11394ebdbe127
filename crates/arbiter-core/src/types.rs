//! ============================================================================
//! Core Types for the Arbitration Oracle
//! ============================================================================
//! Identifiers, the demand/obligation data model, ledger records and events,
//! and the error taxonomy shared by every component.
//! ============================================================================

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Fixed-width identifiers
// ============================================================================

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;
            pub const ZERO: Self = Self([0u8; $len]);

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; $len]
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, OracleError> {
                let arr: [u8; $len] = bytes.try_into().map_err(|_| {
                    OracleError::Decode(format!(
                        "{} expects {} bytes, got {}",
                        stringify!($name),
                        $len,
                        bytes.len()
                    ))
                })?;
                Ok(Self(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = OracleError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                let digits = trimmed
                    .strip_prefix("0x")
                    .or_else(|| trimmed.strip_prefix("0X"))
                    .unwrap_or(trimmed);
                let bytes = hex::decode(digits)
                    .map_err(|e| OracleError::Decode(format!("invalid hex '{}': {}", s, e)))?;
                Self::from_slice(&bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_bytes!(
    /// 32-byte attestation / schema identifier
    Uid,
    32
);

fixed_bytes!(
    /// 20-byte account identity (attester, recipient, signer)
    Address,
    20
);

fixed_bytes!(
    /// Opaque binding of (escrow, fulfiller, obligation record), produced by the ledger
    Commitment,
    32
);

fixed_bytes!(
    /// Handle of a submitted ledger write
    TxHandle,
    32
);

// ============================================================================
// Demand & Obligation
// ============================================================================

/// Natural-language demand attached to an escrow by the depositor.
/// Immutable once encoded into the escrow attestation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Demand {
    /// Requested arbitration provider (fuzzy-matched against registered names)
    pub provider: String,
    pub model: String,
    /// Template containing `{{demand}}` and `{{obligation}}` placeholders
    pub prompt_template: String,
    pub demand_text: String,
}

impl Demand {
    /// Reject demands that decoded structurally but carry content that only
    /// an incorrect encoder would produce.
    pub fn validate(&self) -> Result<(), OracleError> {
        if self.model.contains('\0') {
            return Err(OracleError::MalformedDemand(
                "model contains embedded NUL bytes".into(),
            ));
        }
        if self.model.is_empty() {
            return Err(OracleError::MalformedDemand("model is empty".into()));
        }
        if self.demand_text.is_empty() {
            return Err(OracleError::MalformedDemand("demand text is empty".into()));
        }
        Ok(())
    }
}

/// Fulfiller's obligation record, bound into the commit-reveal payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObligationRecord {
    /// ABI encoding of `{item: string}`
    pub payload: Vec<u8>,
    /// Fresh random value per fulfillment attempt
    pub salt: [u8; 32],
    /// Fixed schema id of the payload shape
    pub schema: Uid,
}

/// Escrow terms stored in the escrow attestation's data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowTerms {
    /// Oracle allowed to decide on fulfillments of this escrow
    pub arbiter: Address,
    /// Encoded [`Demand`]
    pub demand: Vec<u8>,
}

/// Verdict recorded for one fulfillment attestation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbitrationDecision {
    pub attestation_uid: Uid,
    pub decision: bool,
}

// ============================================================================
// Ledger records
// ============================================================================

/// Ledger-owned, UID-addressed record. Never mutated by the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub uid: Uid,
    pub schema: Uid,
    pub attester: Address,
    pub recipient: Address,
    pub ref_uid: Uid,
    /// Unix seconds
    pub time: i64,
    pub revocable: bool,
    pub revocation_time: Option<i64>,
    pub data: Vec<u8>,
}

impl Attestation {
    pub fn is_revoked(&self) -> bool {
        self.revocation_time.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTopic {
    Attested,
    Revoked,
}

/// Event emitted by the ledger when an attestation is created or revoked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub topic: EventTopic,
    pub uid: Uid,
    pub schema: Uid,
    pub attester: Address,
    pub recipient: Address,
    pub ref_uid: Uid,
    pub block: u64,
}

/// Event-filter query: inclusive block range, optional schema match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub topic: EventTopic,
    pub schema: Option<Uid>,
    pub from_block: u64,
    pub to_block: u64,
}

impl EventFilter {
    pub fn matches(&self, event: &LedgerEvent) -> bool {
        event.topic == self.topic
            && self.schema.map_or(true, |s| s == event.schema)
            && event.block >= self.from_block
            && event.block <= self.to_block
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// Submitted, not yet in a mined block
    Pending,
    Confirmed { block: u64 },
    Failed(String),
    Unknown,
}

// ============================================================================
// Errors
// ============================================================================

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by a ledger implementation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum LedgerError {
    #[error("Attestation not found: {0}")]
    AttestationNotFound(Uid),

    #[error("Escrow not found: {0}")]
    EscrowNotFound(Uid),

    #[error("Decision already recorded for fulfillment {0}")]
    DuplicateDecision(Uid),

    #[error("Unknown commitment: {0}")]
    CommitmentNotFound(Commitment),

    #[error("Commitment {0} already submitted")]
    CommitmentExists(Commitment),

    #[error("Commitment {0} is not yet mined")]
    CommitmentNotMined(Commitment),

    #[error("Commitment {0} already revealed")]
    AlreadyRevealed(Commitment),

    #[error("Bond for fulfillment {0} already reclaimed")]
    BondAlreadyReclaimed(Uid),

    #[error("No decision approving fulfillment {0}")]
    NotApproved(Uid),

    #[error("Escrow {0} already collected")]
    AlreadyCollected(Uid),

    #[error("Attestation {0} is revoked")]
    Revoked(Uid),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Ledger storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Transient failures worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}

/// Error taxonomy for the oracle and the fulfiller flow
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    /// Decoded structurally, but the content is invalid
    #[error("Malformed demand: {0}")]
    MalformedDemand(String),

    /// Byte layout does not match the expected tuple shape
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("No provider available")]
    NoProviderAvailable,

    #[error("Unrecognized provider: {0}")]
    UnrecognizedProvider(String),

    /// Provider registration misconfiguration
    #[error("Invalid provider configuration: {0}")]
    InvalidProvider(String),

    #[error("Arbitration failed via {provider}: {source}")]
    ArbitrationFailed {
        provider: String,
        #[source]
        source: BoxError,
    },

    #[error("Commit-reveal violation: {0}")]
    CommitRevealViolation(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl OracleError {
    /// Stable identifier for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            OracleError::MalformedDemand(_) => "malformed_demand",
            OracleError::Decode(_) => "decode_error",
            OracleError::NoProviderAvailable => "no_provider_available",
            OracleError::UnrecognizedProvider(_) => "unrecognized_provider",
            OracleError::InvalidProvider(_) => "invalid_provider",
            OracleError::ArbitrationFailed { .. } => "arbitration_failed",
            OracleError::CommitRevealViolation(_) => "commit_reveal_violation",
            OracleError::Ledger(_) => "ledger_error",
        }
    }
}

//! ============================================================================
//! Ledger Boundary - Attestation log, escrow and commit-reveal primitives
//! ============================================================================
//! The oracle only ever calls these primitives; the real ledger is an external
//! collaborator. Two local implementations share one rule set (`state`):
//! - InMemoryLedger: mutex-guarded state for tests and embedded use
//! - FileLedger: redb-backed state shared between CLI processes
//! ============================================================================

mod file;
mod memory;
mod state;

pub use file::FileLedger;
pub use memory::InMemoryLedger;
pub use state::{BlockClock, LedgerState, DEFAULT_BOND};

use async_trait::async_trait;

use crate::codec::{decode_decision, DECISION_SCHEMA};
use crate::types::*;

/// Primitives of the external attestation ledger.
///
/// Writes carry the sending identity explicitly; an implementation backed by
/// a real chain would bind `from` to its signer.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Height of the most recent mined block
    async fn latest_block(&self) -> Result<u64, LedgerError>;

    /// Mined events matching `filter`, in emission order
    async fn query_events(&self, filter: &EventFilter) -> Result<Vec<LedgerEvent>, LedgerError>;

    async fn get_attestation(&self, uid: &Uid) -> Result<Attestation, LedgerError>;

    async fn revoke(&self, from: &Address, uid: &Uid) -> Result<TxHandle, LedgerError>;

    async fn tx_status(&self, tx: &TxHandle) -> Result<TxStatus, LedgerError>;

    /// Create an escrow attestation naming `terms.arbiter` and carrying the demand
    async fn create_escrow(&self, from: &Address, terms: &EscrowTerms)
        -> Result<Attestation, LedgerError>;

    /// Record the arbiter's verdict on a fulfillment; at most once per fulfillment
    async fn record_decision(
        &self,
        from: &Address,
        fulfillment: &Uid,
        decision: bool,
    ) -> Result<Attestation, LedgerError>;

    /// Release an escrow to the fulfiller once a `true` decision exists
    async fn collect(
        &self,
        from: &Address,
        escrow: &Uid,
        fulfillment: &Uid,
    ) -> Result<TxHandle, LedgerError>;

    async fn compute_commitment(
        &self,
        escrow: &Uid,
        fulfiller: &Address,
        record: &ObligationRecord,
    ) -> Result<Commitment, LedgerError>;

    /// Submit a commitment together with the ledger-defined bond
    async fn commit(&self, from: &Address, commitment: &Commitment)
        -> Result<TxHandle, LedgerError>;

    /// Reveal an obligation against a mined commitment, creating the
    /// fulfillment attestation
    async fn reveal(
        &self,
        from: &Address,
        record: &ObligationRecord,
        escrow: &Uid,
    ) -> Result<Attestation, LedgerError>;

    async fn reclaim_bond(&self, from: &Address, fulfillment: &Uid)
        -> Result<TxHandle, LedgerError>;
}

/// Decision attestations referencing `fulfillment`, oldest first
pub async fn decisions_for(
    ledger: &dyn Ledger,
    fulfillment: &Uid,
) -> Result<Vec<(Attestation, ArbitrationDecision)>, OracleError> {
    let latest = ledger.latest_block().await?;
    let events = ledger
        .query_events(&EventFilter {
            topic: EventTopic::Attested,
            schema: Some(*DECISION_SCHEMA),
            from_block: 0,
            to_block: latest,
        })
        .await?;

    let mut decisions = Vec::new();
    for event in events.iter().filter(|e| e.ref_uid == *fulfillment) {
        let attestation = ledger.get_attestation(&event.uid).await?;
        let decision = decode_decision(&attestation.data)?;
        decisions.push((
            attestation,
            ArbitrationDecision {
                attestation_uid: *fulfillment,
                decision,
            },
        ));
    }
    Ok(decisions)
}

//! In-process ledger guarded by an async mutex.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::state::{BlockClock, LedgerState, DEFAULT_BOND};
use super::Ledger;
use crate::types::*;

pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    /// Ledger that mines every write immediately
    pub fn new() -> Self {
        Self::with_clock(BlockClock::instant())
    }

    pub fn with_clock(clock: BlockClock) -> Self {
        Self {
            state: Mutex::new(LedgerState::new(clock, DEFAULT_BOND)),
        }
    }

    /// Produce `blocks` blocks on a manual or instant clock
    pub async fn mine(&self, blocks: u64) {
        self.state.lock().await.mine(blocks);
    }

    pub async fn bonds_held(&self) -> u128 {
        self.state.lock().await.bonds_held()
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn latest_block(&self) -> Result<u64, LedgerError> {
        Ok(self.state.lock().await.height())
    }

    async fn query_events(&self, filter: &EventFilter) -> Result<Vec<LedgerEvent>, LedgerError> {
        Ok(self.state.lock().await.query_events(filter))
    }

    async fn get_attestation(&self, uid: &Uid) -> Result<Attestation, LedgerError> {
        self.state.lock().await.get_attestation(uid)
    }

    async fn revoke(&self, from: &Address, uid: &Uid) -> Result<TxHandle, LedgerError> {
        self.state.lock().await.revoke(from, uid)
    }

    async fn tx_status(&self, tx: &TxHandle) -> Result<TxStatus, LedgerError> {
        Ok(self.state.lock().await.tx_status(tx))
    }

    async fn create_escrow(
        &self,
        from: &Address,
        terms: &EscrowTerms,
    ) -> Result<Attestation, LedgerError> {
        Ok(self.state.lock().await.create_escrow(from, terms))
    }

    async fn record_decision(
        &self,
        from: &Address,
        fulfillment: &Uid,
        decision: bool,
    ) -> Result<Attestation, LedgerError> {
        self.state.lock().await.record_decision(from, fulfillment, decision)
    }

    async fn collect(
        &self,
        from: &Address,
        escrow: &Uid,
        fulfillment: &Uid,
    ) -> Result<TxHandle, LedgerError> {
        self.state.lock().await.collect(from, escrow, fulfillment)
    }

    async fn compute_commitment(
        &self,
        escrow: &Uid,
        fulfiller: &Address,
        record: &ObligationRecord,
    ) -> Result<Commitment, LedgerError> {
        Ok(self.state.lock().await.compute_commitment(escrow, fulfiller, record))
    }

    async fn commit(
        &self,
        from: &Address,
        commitment: &Commitment,
    ) -> Result<TxHandle, LedgerError> {
        self.state.lock().await.commit(from, commitment)
    }

    async fn reveal(
        &self,
        from: &Address,
        record: &ObligationRecord,
        escrow: &Uid,
    ) -> Result<Attestation, LedgerError> {
        self.state.lock().await.reveal(from, record, escrow)
    }

    async fn reclaim_bond(
        &self,
        from: &Address,
        fulfillment: &Uid,
    ) -> Result<TxHandle, LedgerError> {
        self.state.lock().await.reclaim_bond(from, fulfillment)
    }
}

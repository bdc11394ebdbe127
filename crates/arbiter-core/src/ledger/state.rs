//! Ledger rule set shared by the in-memory and file-backed ledgers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::codec::{
    decode_decision, decode_escrow_terms, encode_decision, encode_escrow_terms,
    DECISION_SCHEMA, ESCROW_SCHEMA, OBLIGATION_SCHEMA,
};
use crate::types::*;

/// Bond locked by each commit, in the ledger's base unit
pub const DEFAULT_BOND: u128 = 10_000_000_000_000_000;

/// How block height advances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockClock {
    /// Blocks are produced only by explicit `mine` calls
    Manual { height: u64 },
    /// Every write is mined in its own block immediately
    Instant { height: u64 },
    /// Height follows wall-clock time
    Interval { genesis_ms: i64, block_ms: u64 },
}

impl BlockClock {
    pub fn manual() -> Self {
        BlockClock::Manual { height: 0 }
    }

    pub fn instant() -> Self {
        BlockClock::Instant { height: 0 }
    }

    pub fn interval(block_ms: u64) -> Self {
        BlockClock::Interval {
            genesis_ms: chrono::Utc::now().timestamp_millis(),
            block_ms: block_ms.max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommitEntry {
    committer: Address,
    block: u64,
    bond: u128,
    revealed: Option<Uid>,
    bond_reclaimed: bool,
}

/// Full ledger state. Every mutation goes through one of the primitives
/// below, which enforce the boundary rules the oracle relies on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerState {
    clock: BlockClock,
    bond: u128,
    nonce: u64,
    attestations: HashMap<Uid, Attestation>,
    events: Vec<LedgerEvent>,
    txs: HashMap<TxHandle, u64>,
    commitments: HashMap<Commitment, CommitEntry>,
    /// fulfillment uid -> decision attestation uid
    decisions: HashMap<Uid, Uid>,
    /// escrow uid -> fulfillment uid it was released to
    collected: HashMap<Uid, Uid>,
}

impl LedgerState {
    pub fn new(clock: BlockClock, bond: u128) -> Self {
        Self {
            clock,
            bond,
            nonce: 0,
            attestations: HashMap::new(),
            events: Vec::new(),
            txs: HashMap::new(),
            commitments: HashMap::new(),
            decisions: HashMap::new(),
            collected: HashMap::new(),
        }
    }

    pub fn bond(&self) -> u128 {
        self.bond
    }

    /// Bonds locked by commitments not yet reclaimed
    pub fn bonds_held(&self) -> u128 {
        self.commitments.values().map(|c| c.bond).sum()
    }

    pub fn height(&self) -> u64 {
        match &self.clock {
            BlockClock::Manual { height } | BlockClock::Instant { height } => *height,
            BlockClock::Interval {
                genesis_ms,
                block_ms,
            } => {
                let elapsed = chrono::Utc::now().timestamp_millis() - genesis_ms;
                elapsed.max(0) as u64 / block_ms
            }
        }
    }

    /// Advance a manual or instant clock. Interval clocks ignore this.
    pub fn mine(&mut self, blocks: u64) {
        match &mut self.clock {
            BlockClock::Manual { height } | BlockClock::Instant { height } => *height += blocks,
            BlockClock::Interval { .. } => {}
        }
    }

    /// Block a write submitted now lands in
    fn next_block(&mut self) -> u64 {
        if let BlockClock::Instant { height } = &mut self.clock {
            *height += 1;
            return *height;
        }
        self.height() + 1
    }

    fn hash(&mut self, domain: &str, parts: &[&[u8]]) -> [u8; 32] {
        self.nonce += 1;
        let mut hasher = Sha256::new();
        hasher.update(domain.as_bytes());
        hasher.update(self.nonce.to_be_bytes());
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().into()
    }

    fn new_tx(&mut self) -> (TxHandle, u64) {
        let tx = TxHandle(self.hash("tx", &[]));
        let block = self.next_block();
        self.txs.insert(tx, block);
        (tx, block)
    }

    fn attest(
        &mut self,
        schema: Uid,
        attester: Address,
        recipient: Address,
        ref_uid: Uid,
        revocable: bool,
        data: Vec<u8>,
    ) -> Attestation {
        let uid = Uid(self.hash(
            "attestation",
            &[
                schema.0.as_slice(),
                attester.0.as_slice(),
                recipient.0.as_slice(),
                ref_uid.0.as_slice(),
                data.as_slice(),
            ],
        ));
        let (_, block) = self.new_tx();
        let attestation = Attestation {
            uid,
            schema,
            attester,
            recipient,
            ref_uid,
            time: chrono::Utc::now().timestamp(),
            revocable,
            revocation_time: None,
            data,
        };
        self.events.push(LedgerEvent {
            topic: EventTopic::Attested,
            uid,
            schema,
            attester,
            recipient,
            ref_uid,
            block,
        });
        self.attestations.insert(uid, attestation.clone());
        attestation
    }

    fn escrow(&self, uid: &Uid) -> Result<(&Attestation, EscrowTerms), LedgerError> {
        let escrow = self
            .attestations
            .get(uid)
            .filter(|a| a.schema == *ESCROW_SCHEMA)
            .ok_or(LedgerError::EscrowNotFound(*uid))?;
        let terms = decode_escrow_terms(&escrow.data)
            .map_err(|e| LedgerError::Storage(format!("escrow {} terms: {}", uid, e)))?;
        Ok((escrow, terms))
    }

    // ========================================================================
    // Attestation log
    // ========================================================================

    pub fn query_events(&self, filter: &EventFilter) -> Vec<LedgerEvent> {
        let height = self.height();
        self.events
            .iter()
            .filter(|e| e.block <= height && filter.matches(e))
            .cloned()
            .collect()
    }

    pub fn get_attestation(&self, uid: &Uid) -> Result<Attestation, LedgerError> {
        self.attestations
            .get(uid)
            .cloned()
            .ok_or(LedgerError::AttestationNotFound(*uid))
    }

    pub fn revoke(&mut self, from: &Address, uid: &Uid) -> Result<TxHandle, LedgerError> {
        let attestation = self
            .attestations
            .get(uid)
            .ok_or(LedgerError::AttestationNotFound(*uid))?;
        if attestation.attester != *from {
            return Err(LedgerError::Unauthorized(format!(
                "{} is not the attester of {}",
                from, uid
            )));
        }
        if !attestation.revocable {
            return Err(LedgerError::Unauthorized(format!("{} is not revocable", uid)));
        }
        if attestation.is_revoked() {
            return Err(LedgerError::Revoked(*uid));
        }

        let event = LedgerEvent {
            topic: EventTopic::Revoked,
            uid: *uid,
            schema: attestation.schema,
            attester: attestation.attester,
            recipient: attestation.recipient,
            ref_uid: attestation.ref_uid,
            block: 0,
        };
        let (tx, block) = self.new_tx();
        if let Some(a) = self.attestations.get_mut(uid) {
            a.revocation_time = Some(chrono::Utc::now().timestamp());
        }
        self.events.push(LedgerEvent { block, ..event });
        Ok(tx)
    }

    pub fn tx_status(&self, tx: &TxHandle) -> TxStatus {
        match self.txs.get(tx) {
            Some(block) if *block <= self.height() => TxStatus::Confirmed { block: *block },
            Some(_) => TxStatus::Pending,
            None => TxStatus::Unknown,
        }
    }

    // ========================================================================
    // Escrow
    // ========================================================================

    pub fn create_escrow(&mut self, from: &Address, terms: &EscrowTerms) -> Attestation {
        self.attest(
            *ESCROW_SCHEMA,
            *from,
            terms.arbiter,
            Uid::ZERO,
            true,
            encode_escrow_terms(terms),
        )
    }

    pub fn record_decision(
        &mut self,
        from: &Address,
        fulfillment: &Uid,
        decision: bool,
    ) -> Result<Attestation, LedgerError> {
        let obligation = self
            .attestations
            .get(fulfillment)
            .filter(|a| a.schema == *OBLIGATION_SCHEMA)
            .cloned()
            .ok_or(LedgerError::AttestationNotFound(*fulfillment))?;
        let (_, terms) = self.escrow(&obligation.ref_uid)?;
        if terms.arbiter != *from {
            return Err(LedgerError::Unauthorized(format!(
                "{} is not the arbiter of escrow {}",
                from, obligation.ref_uid
            )));
        }
        if self.decisions.contains_key(fulfillment) {
            return Err(LedgerError::DuplicateDecision(*fulfillment));
        }

        let attestation = self.attest(
            *DECISION_SCHEMA,
            *from,
            obligation.attester,
            *fulfillment,
            false,
            encode_decision(decision),
        );
        self.decisions.insert(*fulfillment, attestation.uid);
        Ok(attestation)
    }

    pub fn collect(
        &mut self,
        from: &Address,
        escrow_uid: &Uid,
        fulfillment: &Uid,
    ) -> Result<TxHandle, LedgerError> {
        let (escrow, _) = self.escrow(escrow_uid)?;
        if escrow.is_revoked() {
            return Err(LedgerError::Revoked(*escrow_uid));
        }
        let obligation = self
            .attestations
            .get(fulfillment)
            .ok_or(LedgerError::AttestationNotFound(*fulfillment))?;
        if obligation.ref_uid != *escrow_uid {
            return Err(LedgerError::Unauthorized(format!(
                "fulfillment {} does not reference escrow {}",
                fulfillment, escrow_uid
            )));
        }
        if obligation.recipient != *from {
            return Err(LedgerError::Unauthorized(format!(
                "{} is not the fulfiller of {}",
                from, fulfillment
            )));
        }
        if self.collected.contains_key(escrow_uid) {
            return Err(LedgerError::AlreadyCollected(*escrow_uid));
        }
        let approved = self
            .decisions
            .get(fulfillment)
            .and_then(|uid| self.attestations.get(uid))
            .map(|a| decode_decision(&a.data).unwrap_or(false))
            .unwrap_or(false);
        if !approved {
            return Err(LedgerError::NotApproved(*fulfillment));
        }

        let (tx, _) = self.new_tx();
        self.collected.insert(*escrow_uid, *fulfillment);
        Ok(tx)
    }

    // ========================================================================
    // Commit-reveal
    // ========================================================================

    pub fn compute_commitment(
        &self,
        escrow: &Uid,
        fulfiller: &Address,
        record: &ObligationRecord,
    ) -> Commitment {
        let payload_hash = Sha256::digest(&record.payload);
        let mut hasher = Sha256::new();
        hasher.update(b"commitment");
        hasher.update(escrow.as_bytes());
        hasher.update(fulfiller.as_bytes());
        hasher.update(payload_hash);
        hasher.update(record.salt);
        hasher.update(record.schema.as_bytes());
        Commitment(hasher.finalize().into())
    }

    pub fn commit(&mut self, from: &Address, commitment: &Commitment) -> Result<TxHandle, LedgerError> {
        if self.commitments.contains_key(commitment) {
            return Err(LedgerError::CommitmentExists(*commitment));
        }
        let (tx, block) = self.new_tx();
        self.commitments.insert(
            *commitment,
            CommitEntry {
                committer: *from,
                block,
                bond: self.bond,
                revealed: None,
                bond_reclaimed: false,
            },
        );
        Ok(tx)
    }

    pub fn reveal(
        &mut self,
        from: &Address,
        record: &ObligationRecord,
        escrow_uid: &Uid,
    ) -> Result<Attestation, LedgerError> {
        let (escrow, _) = self.escrow(escrow_uid)?;
        if escrow.is_revoked() {
            return Err(LedgerError::Revoked(*escrow_uid));
        }
        if record.schema != *OBLIGATION_SCHEMA {
            return Err(LedgerError::Unauthorized(format!(
                "unsupported obligation schema {}",
                record.schema
            )));
        }

        // A payload that differs from the committed one hashes to a commitment
        // that was never submitted.
        let commitment = self.compute_commitment(escrow_uid, from, record);
        let height = self.height();
        let entry = self
            .commitments
            .get(&commitment)
            .ok_or(LedgerError::CommitmentNotFound(commitment))?;
        if entry.revealed.is_some() {
            return Err(LedgerError::AlreadyRevealed(commitment));
        }
        if entry.block > height {
            return Err(LedgerError::CommitmentNotMined(commitment));
        }

        let attestation = self.attest(
            *OBLIGATION_SCHEMA,
            *from,
            *from,
            *escrow_uid,
            true,
            record.payload.clone(),
        );
        if let Some(entry) = self.commitments.get_mut(&commitment) {
            entry.revealed = Some(attestation.uid);
        }
        Ok(attestation)
    }

    pub fn reclaim_bond(&mut self, from: &Address, fulfillment: &Uid) -> Result<TxHandle, LedgerError> {
        let entry = self
            .commitments
            .values()
            .find(|c| c.revealed == Some(*fulfillment))
            .ok_or(LedgerError::AttestationNotFound(*fulfillment))?;
        if entry.committer != *from {
            return Err(LedgerError::Unauthorized(format!(
                "{} did not commit fulfillment {}",
                from, fulfillment
            )));
        }
        if entry.bond_reclaimed {
            return Err(LedgerError::BondAlreadyReclaimed(*fulfillment));
        }

        let (tx, _) = self.new_tx();
        if let Some(entry) = self
            .commitments
            .values_mut()
            .find(|c| c.revealed == Some(*fulfillment))
        {
            entry.bond_reclaimed = true;
            entry.bond = 0;
        }
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_demand, encode_obligation_item};

    const DEPOSITOR: Address = Address([1; 20]);
    const FULFILLER: Address = Address([2; 20]);
    const ORACLE: Address = Address([3; 20]);

    fn escrow(state: &mut LedgerState) -> Uid {
        let demand = Demand {
            provider: "OpenAI".into(),
            model: "gpt-4o-mini".into(),
            prompt_template: "{{demand}} {{obligation}}".into(),
            demand_text: "The sky is blue".into(),
        };
        state
            .create_escrow(
                &DEPOSITOR,
                &EscrowTerms {
                    arbiter: ORACLE,
                    demand: encode_demand(&demand),
                },
            )
            .uid
    }

    fn record(item: &str) -> ObligationRecord {
        ObligationRecord {
            payload: encode_obligation_item(item),
            salt: [5; 32],
            schema: *OBLIGATION_SCHEMA,
        }
    }

    fn revealed(state: &mut LedgerState, escrow_uid: &Uid) -> Uid {
        let rec = record("The sky appears blue today");
        let c = state.compute_commitment(escrow_uid, &FULFILLER, &rec);
        state.commit(&FULFILLER, &c).unwrap();
        state.reveal(&FULFILLER, &rec, escrow_uid).unwrap().uid
    }

    #[test]
    fn test_manual_clock_gates_visibility() {
        let mut state = LedgerState::new(BlockClock::manual(), DEFAULT_BOND);
        let uid = escrow(&mut state);
        let filter = EventFilter {
            topic: EventTopic::Attested,
            schema: None,
            from_block: 0,
            to_block: u64::MAX,
        };
        assert!(state.query_events(&filter).is_empty());
        state.mine(1);
        let events = state.query_events(&filter);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].uid, uid);
    }

    #[test]
    fn test_reveal_requires_mined_commit() {
        let mut state = LedgerState::new(BlockClock::manual(), DEFAULT_BOND);
        let escrow_uid = escrow(&mut state);
        let rec = record("answer");
        let c = state.compute_commitment(&escrow_uid, &FULFILLER, &rec);
        let tx = state.commit(&FULFILLER, &c).unwrap();
        assert_eq!(state.tx_status(&tx), TxStatus::Pending);
        assert_eq!(
            state.reveal(&FULFILLER, &rec, &escrow_uid).unwrap_err(),
            LedgerError::CommitmentNotMined(c)
        );
        state.mine(1);
        assert!(matches!(state.tx_status(&tx), TxStatus::Confirmed { .. }));
        assert!(state.reveal(&FULFILLER, &rec, &escrow_uid).is_ok());
    }

    #[test]
    fn test_reveal_rejects_mismatched_payload() {
        let mut state = LedgerState::new(BlockClock::instant(), DEFAULT_BOND);
        let escrow_uid = escrow(&mut state);
        let c = state.compute_commitment(&escrow_uid, &FULFILLER, &record("original"));
        state.commit(&FULFILLER, &c).unwrap();
        let err = state.reveal(&FULFILLER, &record("copied"), &escrow_uid).unwrap_err();
        assert!(matches!(err, LedgerError::CommitmentNotFound(_)));

        // another party cannot reveal someone else's commitment
        let err = state.reveal(&DEPOSITOR, &record("original"), &escrow_uid).unwrap_err();
        assert!(matches!(err, LedgerError::CommitmentNotFound(_)));
    }

    #[test]
    fn test_decision_rules() {
        let mut state = LedgerState::new(BlockClock::instant(), DEFAULT_BOND);
        let escrow_uid = escrow(&mut state);
        let fulfillment = revealed(&mut state, &escrow_uid);

        let err = state.record_decision(&DEPOSITOR, &fulfillment, true).unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        let decision = state.record_decision(&ORACLE, &fulfillment, true).unwrap();
        assert_eq!(decision.ref_uid, fulfillment);
        assert_eq!(
            state.record_decision(&ORACLE, &fulfillment, false).unwrap_err(),
            LedgerError::DuplicateDecision(fulfillment)
        );
    }

    #[test]
    fn test_collect_requires_approval_once() {
        let mut state = LedgerState::new(BlockClock::instant(), DEFAULT_BOND);
        let escrow_uid = escrow(&mut state);
        let fulfillment = revealed(&mut state, &escrow_uid);

        assert_eq!(
            state.collect(&FULFILLER, &escrow_uid, &fulfillment).unwrap_err(),
            LedgerError::NotApproved(fulfillment)
        );
        state.record_decision(&ORACLE, &fulfillment, true).unwrap();
        assert!(state.collect(&FULFILLER, &escrow_uid, &fulfillment).is_ok());
        assert_eq!(
            state.collect(&FULFILLER, &escrow_uid, &fulfillment).unwrap_err(),
            LedgerError::AlreadyCollected(escrow_uid)
        );
    }

    #[test]
    fn test_rejected_fulfillment_cannot_collect() {
        let mut state = LedgerState::new(BlockClock::instant(), DEFAULT_BOND);
        let escrow_uid = escrow(&mut state);
        let fulfillment = revealed(&mut state, &escrow_uid);
        state.record_decision(&ORACLE, &fulfillment, false).unwrap();
        assert_eq!(
            state.collect(&FULFILLER, &escrow_uid, &fulfillment).unwrap_err(),
            LedgerError::NotApproved(fulfillment)
        );
    }

    #[test]
    fn test_bond_reclaimed_once() {
        let mut state = LedgerState::new(BlockClock::instant(), DEFAULT_BOND);
        let escrow_uid = escrow(&mut state);
        let fulfillment = revealed(&mut state, &escrow_uid);

        assert!(matches!(
            state.reclaim_bond(&DEPOSITOR, &fulfillment).unwrap_err(),
            LedgerError::Unauthorized(_)
        ));
        assert_eq!(state.bonds_held(), DEFAULT_BOND);
        assert!(state.reclaim_bond(&FULFILLER, &fulfillment).is_ok());
        assert_eq!(state.bonds_held(), 0);
        assert_eq!(
            state.reclaim_bond(&FULFILLER, &fulfillment).unwrap_err(),
            LedgerError::BondAlreadyReclaimed(fulfillment)
        );
    }

    #[test]
    fn test_revoke() {
        let mut state = LedgerState::new(BlockClock::instant(), DEFAULT_BOND);
        let escrow_uid = escrow(&mut state);
        assert!(state.revoke(&FULFILLER, &escrow_uid).is_err());
        state.revoke(&DEPOSITOR, &escrow_uid).unwrap();
        assert!(state.get_attestation(&escrow_uid).unwrap().is_revoked());
        assert_eq!(
            state.revoke(&DEPOSITOR, &escrow_uid).unwrap_err(),
            LedgerError::Revoked(escrow_uid)
        );
        let revoked = state.query_events(&EventFilter {
            topic: EventTopic::Revoked,
            schema: None,
            from_block: 0,
            to_block: u64::MAX,
        });
        assert_eq!(revoked.len(), 1);
    }
}

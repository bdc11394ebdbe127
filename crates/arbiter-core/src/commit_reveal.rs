//! ============================================================================
//! Commit-Reveal Coordinator - Fulfiller Side
//! ============================================================================
//! Drives one fulfillment attempt through the ledger's anti-front-running
//! protocol:
//!   Unstarted -> Committed -> Revealed -> BondReclaimed
//! Attempts are tracked locally by commitment. All writes for this fulfiller
//! go through one signer lock.
//! ============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::codec::{encode_obligation_item, OBLIGATION_SCHEMA};
use crate::ledger::Ledger;
use crate::tx_confirm::{poll_confirmation, send_with_retry, RetryConfig};
use crate::types::*;

/// Local progress of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptState {
    Committed {
        tx: TxHandle,
        confirmed_block: Option<u64>,
    },
    Revealed {
        fulfillment: Uid,
    },
    BondReclaimed {
        fulfillment: Uid,
    },
}

/// Result of a complete fulfillment run
#[derive(Debug, Clone)]
pub struct FulfillmentReceipt {
    pub commitment: Commitment,
    pub commit_tx: TxHandle,
    pub commit_block: u64,
    pub fulfillment: Attestation,
    pub bond_tx: TxHandle,
}

pub struct CommitRevealCoordinator {
    ledger: Arc<dyn Ledger>,
    fulfiller: Address,
    retry: RetryConfig,
    attempts: Mutex<HashMap<Commitment, AttemptState>>,
    signer: Mutex<()>,
}

impl CommitRevealCoordinator {
    pub fn new(ledger: Arc<dyn Ledger>, fulfiller: Address) -> Self {
        Self {
            ledger,
            fulfiller,
            retry: RetryConfig::default(),
            attempts: Mutex::new(HashMap::new()),
            signer: Mutex::new(()),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn fulfiller(&self) -> Address {
        self.fulfiller
    }

    /// Obligation record for `item` with a fresh random salt
    pub fn new_obligation(item: &str) -> ObligationRecord {
        ObligationRecord {
            payload: encode_obligation_item(item),
            salt: rand::random::<[u8; 32]>(),
            schema: *OBLIGATION_SCHEMA,
        }
    }

    pub async fn attempt_state(&self, commitment: &Commitment) -> Option<AttemptState> {
        self.attempts.lock().await.get(commitment).cloned()
    }

    pub async fn compute_commitment(
        &self,
        escrow: &Uid,
        record: &ObligationRecord,
    ) -> Result<Commitment, OracleError> {
        Ok(self
            .ledger
            .compute_commitment(escrow, &self.fulfiller, record)
            .await?)
    }

    /// Submit the commitment with the ledger-defined bond
    pub async fn commit(&self, commitment: &Commitment) -> Result<TxHandle, OracleError> {
        if self.attempts.lock().await.contains_key(commitment) {
            return Err(OracleError::CommitRevealViolation(format!(
                "commitment {} already submitted",
                commitment
            )));
        }

        let ledger = self.ledger.as_ref();
        let from = &self.fulfiller;
        let tx = self
            .write("commit", move || ledger.commit(from, commitment))
            .await?;

        info!("Committed {} (tx {})", commitment, tx);
        self.attempts.lock().await.insert(
            *commitment,
            AttemptState::Committed {
                tx,
                confirmed_block: None,
            },
        );
        Ok(tx)
    }

    /// Poll until the commit transaction is mined
    pub async fn wait_for_commit(&self, commitment: &Commitment) -> Result<u64, OracleError> {
        let tx = match self.attempt_state(commitment).await {
            Some(AttemptState::Committed {
                confirmed_block: Some(block),
                ..
            }) => return Ok(block),
            Some(AttemptState::Committed { tx, .. }) => tx,
            Some(other) => {
                return Err(OracleError::CommitRevealViolation(format!(
                    "commitment {} is past the commit stage: {:?}",
                    commitment, other
                )))
            }
            None => {
                return Err(OracleError::CommitRevealViolation(format!(
                    "no commit for {}",
                    commitment
                )))
            }
        };

        let block = poll_confirmation(self.ledger.as_ref(), &tx, &self.retry)
            .await
            .into_block(&tx)?;
        self.mark_confirmed(commitment, tx, block).await;
        Ok(block)
    }

    /// Reveal the obligation, creating the fulfillment attestation
    pub async fn do_obligation(
        &self,
        record: &ObligationRecord,
        escrow: &Uid,
    ) -> Result<Attestation, OracleError> {
        let commitment = self.compute_commitment(escrow, record).await?;

        match self.attempt_state(&commitment).await {
            Some(AttemptState::Committed {
                confirmed_block: Some(_),
                ..
            }) => {}
            Some(AttemptState::Committed { tx, .. }) => match self.ledger.tx_status(&tx).await? {
                TxStatus::Confirmed { block } => self.mark_confirmed(&commitment, tx, block).await,
                status => {
                    return Err(OracleError::CommitRevealViolation(format!(
                        "commit {} not confirmed ({:?})",
                        tx, status
                    )))
                }
            },
            Some(_) => {
                return Err(OracleError::CommitRevealViolation(format!(
                    "commitment {} already revealed",
                    commitment
                )))
            }
            None => {
                return Err(OracleError::CommitRevealViolation(format!(
                    "no commit for {}",
                    commitment
                )))
            }
        }

        let ledger = self.ledger.as_ref();
        let from = &self.fulfiller;
        let attestation = self
            .write("reveal", move || ledger.reveal(from, record, escrow))
            .await?;

        info!("Revealed obligation {} for escrow {}", attestation.uid, escrow);
        self.attempts.lock().await.insert(
            commitment,
            AttemptState::Revealed {
                fulfillment: attestation.uid,
            },
        );
        Ok(attestation)
    }

    pub async fn reclaim_bond(&self, fulfillment: &Uid) -> Result<TxHandle, OracleError> {
        let commitment = {
            let attempts = self.attempts.lock().await;
            let found = attempts.iter().find_map(|(c, state)| match state {
                AttemptState::Revealed { fulfillment: f } if f == fulfillment => Some(Ok(*c)),
                AttemptState::BondReclaimed { fulfillment: f } if f == fulfillment => {
                    Some(Err(OracleError::CommitRevealViolation(format!(
                        "bond for {} already reclaimed",
                        fulfillment
                    ))))
                }
                _ => None,
            });
            match found {
                Some(result) => result?,
                None => {
                    return Err(OracleError::CommitRevealViolation(format!(
                        "no revealed fulfillment {}",
                        fulfillment
                    )))
                }
            }
        };

        let ledger = self.ledger.as_ref();
        let from = &self.fulfiller;
        let tx = self
            .write("reclaim bond", move || ledger.reclaim_bond(from, fulfillment))
            .await?;

        info!("Reclaimed bond for {} (tx {})", fulfillment, tx);
        self.attempts.lock().await.insert(
            commitment,
            AttemptState::BondReclaimed {
                fulfillment: *fulfillment,
            },
        );
        Ok(tx)
    }

    /// Commit, wait for the commit to be mined, reveal, reclaim the bond
    pub async fn fulfill(&self, escrow: &Uid, item: &str) -> Result<FulfillmentReceipt, OracleError> {
        let record = Self::new_obligation(item);
        let commitment = self.compute_commitment(escrow, &record).await?;
        let commit_tx = self.commit(&commitment).await?;
        let commit_block = self.wait_for_commit(&commitment).await?;
        let fulfillment = self.do_obligation(&record, escrow).await?;
        let bond_tx = self.reclaim_bond(&fulfillment.uid).await?;

        Ok(FulfillmentReceipt {
            commitment,
            commit_tx,
            commit_block,
            fulfillment,
            bond_tx,
        })
    }

    async fn mark_confirmed(&self, commitment: &Commitment, tx: TxHandle, block: u64) {
        debug!("Commit {} confirmed in block {}", tx, block);
        self.attempts.lock().await.insert(
            *commitment,
            AttemptState::Committed {
                tx,
                confirmed_block: Some(block),
            },
        );
    }

    async fn write<T, F, Fut>(&self, label: &str, op: F) -> Result<T, OracleError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let _signer = self.signer.lock().await;
        Ok(send_with_retry(&self.retry, label, op).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_obligation_item, encode_demand};
    use crate::ledger::{BlockClock, InMemoryLedger};
    use std::time::Duration;

    const DEPOSITOR: Address = Address([1; 20]);
    const ARBITER: Address = Address([2; 20]);
    const FULFILLER: Address = Address([3; 20]);

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_send_retries: 2,
            max_confirm_retries: 200,
            base_delay_ms: 1,
            max_delay_ms: 2,
            poll_interval_ms: 5,
            jitter: false,
        }
    }

    async fn escrow(ledger: &dyn Ledger) -> Uid {
        let demand = Demand {
            provider: "OpenAI".into(),
            model: "gpt-4o-mini".into(),
            prompt_template: "{{demand}} / {{obligation}}".into(),
            demand_text: "The sky is blue".into(),
        };
        ledger
            .create_escrow(
                &DEPOSITOR,
                &EscrowTerms {
                    arbiter: ARBITER,
                    demand: encode_demand(&demand),
                },
            )
            .await
            .unwrap()
            .uid
    }

    #[test]
    fn test_new_obligation_uses_fresh_salt() {
        let a = CommitRevealCoordinator::new_obligation("x");
        let b = CommitRevealCoordinator::new_obligation("x");
        assert_eq!(a.payload, b.payload);
        assert_eq!(a.schema, *OBLIGATION_SCHEMA);
        assert_ne!(a.salt, b.salt);
    }

    #[tokio::test]
    async fn test_fulfill_full_flow() {
        let ledger = Arc::new(InMemoryLedger::new());
        let escrow_uid = escrow(ledger.as_ref()).await;
        let coordinator =
            CommitRevealCoordinator::new(ledger.clone(), FULFILLER).with_retry(fast_retry());

        let receipt = coordinator
            .fulfill(&escrow_uid, "The sky appears blue today")
            .await
            .unwrap();

        assert_eq!(receipt.fulfillment.ref_uid, escrow_uid);
        assert_eq!(receipt.fulfillment.recipient, FULFILLER);
        assert_eq!(
            decode_obligation_item(&receipt.fulfillment.data).unwrap(),
            "The sky appears blue today"
        );
        assert_eq!(ledger.bonds_held().await, 0);
        assert_eq!(
            coordinator.attempt_state(&receipt.commitment).await,
            Some(AttemptState::BondReclaimed {
                fulfillment: receipt.fulfillment.uid
            })
        );
    }

    #[tokio::test]
    async fn test_reveal_without_commit_fails() {
        let ledger = Arc::new(InMemoryLedger::new());
        let escrow_uid = escrow(ledger.as_ref()).await;
        let coordinator = CommitRevealCoordinator::new(ledger, FULFILLER).with_retry(fast_retry());

        let record = CommitRevealCoordinator::new_obligation("item");
        let err = coordinator
            .do_obligation(&record, &escrow_uid)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "commit_reveal_violation");
    }

    #[tokio::test]
    async fn test_reveal_before_confirmation_fails() {
        let ledger = Arc::new(InMemoryLedger::with_clock(BlockClock::manual()));
        let escrow_uid = escrow(ledger.as_ref()).await;
        ledger.mine(1).await;
        let coordinator =
            CommitRevealCoordinator::new(ledger.clone(), FULFILLER).with_retry(fast_retry());

        let record = CommitRevealCoordinator::new_obligation("item");
        let commitment = coordinator
            .compute_commitment(&escrow_uid, &record)
            .await
            .unwrap();
        coordinator.commit(&commitment).await.unwrap();

        let err = coordinator
            .do_obligation(&record, &escrow_uid)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "commit_reveal_violation");

        ledger.mine(1).await;
        let fulfillment = coordinator.do_obligation(&record, &escrow_uid).await.unwrap();
        assert_eq!(fulfillment.ref_uid, escrow_uid);
    }

    #[tokio::test]
    async fn test_wait_for_commit_with_background_miner() {
        let ledger = Arc::new(InMemoryLedger::with_clock(BlockClock::manual()));
        let escrow_uid = escrow(ledger.as_ref()).await;
        ledger.mine(1).await;
        let coordinator =
            CommitRevealCoordinator::new(ledger.clone(), FULFILLER).with_retry(fast_retry());

        let miner = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                ledger.mine(1).await;
            })
        };

        let receipt = coordinator.fulfill(&escrow_uid, "item").await.unwrap();
        assert_eq!(receipt.commit_block, 2);
        miner.await.unwrap();
    }

    #[tokio::test]
    async fn test_reclaim_bond_only_once() {
        let ledger = Arc::new(InMemoryLedger::new());
        let escrow_uid = escrow(ledger.as_ref()).await;
        let coordinator = CommitRevealCoordinator::new(ledger, FULFILLER).with_retry(fast_retry());

        let record = CommitRevealCoordinator::new_obligation("item");
        let commitment = coordinator
            .compute_commitment(&escrow_uid, &record)
            .await
            .unwrap();
        coordinator.commit(&commitment).await.unwrap();
        coordinator.wait_for_commit(&commitment).await.unwrap();
        let fulfillment = coordinator.do_obligation(&record, &escrow_uid).await.unwrap();

        coordinator.reclaim_bond(&fulfillment.uid).await.unwrap();
        let err = coordinator.reclaim_bond(&fulfillment.uid).await.unwrap_err();
        assert_eq!(err.kind(), "commit_reveal_violation");

        let unknown = coordinator.reclaim_bond(&Uid([0xee; 32])).await.unwrap_err();
        assert_eq!(unknown.kind(), "commit_reveal_violation");
    }

    #[tokio::test]
    async fn test_double_commit_rejected_locally() {
        let ledger = Arc::new(InMemoryLedger::new());
        let coordinator = CommitRevealCoordinator::new(ledger, FULFILLER).with_retry(fast_retry());

        let commitment = Commitment([5; 32]);
        coordinator.commit(&commitment).await.unwrap();
        assert!(coordinator.commit(&commitment).await.is_err());
    }
}

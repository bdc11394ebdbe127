//! ============================================================================
//! Arbitration Loop - Watch Fulfillments, Decide, Record
//! ============================================================================
//! One cycle: poll obligation events from the cursor to the latest block,
//! arbitrate each new fulfillment whose escrow names this oracle, record the
//! verdict, advance the cursor. Per-event failures, panics included, are
//! logged and skipped; they never stop the loop.
//! ============================================================================

use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{
    decode_demand, decode_escrow_terms, decode_obligation_item, ESCROW_SCHEMA, OBLIGATION_SCHEMA,
};
use crate::config::OracleConfig;
use crate::ledger::Ledger;
use crate::provider::ProviderRouter;
use crate::tx_confirm::send_with_retry;
use crate::types::*;

/// Counts from one polling cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// New decisions recorded this cycle
    pub decided: usize,
    /// Fulfillments that already carried a decision
    pub already_decided: usize,
    /// Events dropped because of an error
    pub skipped: usize,
    /// Events for another arbiter, or revoked fulfillments
    pub ignored: usize,
}

impl CycleReport {
    pub fn total(&self) -> usize {
        self.decided + self.already_decided + self.skipped + self.ignored
    }

    fn tally(&mut self, outcome: EventOutcome) {
        match outcome {
            EventOutcome::Decided => self.decided += 1,
            EventOutcome::AlreadyDecided => self.already_decided += 1,
            EventOutcome::Skipped => self.skipped += 1,
            EventOutcome::Ignored => self.ignored += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventOutcome {
    Decided,
    AlreadyDecided,
    Skipped,
    Ignored,
}

pub struct ArbitrationLoop {
    ledger: Arc<dyn Ledger>,
    router: Arc<ProviderRouter>,
    config: OracleConfig,
    token: CancellationToken,
    /// Next block to scan
    cursor: AtomicU64,
    decided: Mutex<HashSet<Uid>>,
    /// One in-flight decision write for the arbiter identity
    signer: Mutex<()>,
}

impl ArbitrationLoop {
    /// Refuses to start without at least one registered provider
    pub fn new(
        ledger: Arc<dyn Ledger>,
        router: Arc<ProviderRouter>,
        config: OracleConfig,
    ) -> Result<Self, OracleError> {
        if router.is_empty() {
            error!("Cannot start arbitration loop: no providers registered");
            return Err(OracleError::NoProviderAvailable);
        }
        Ok(Self {
            ledger,
            router,
            cursor: AtomicU64::new(config.start_block),
            config,
            token: CancellationToken::new(),
            decided: Mutex::new(HashSet::new()),
            signer: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Token cancelled by [`unwatch`](Self::unwatch)
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_watching(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Stop polling. Idempotent; in-flight arbitrations finish normally.
    pub fn unwatch(&self) {
        if !self.token.is_cancelled() {
            info!("Unwatching fulfillment events");
        }
        self.token.cancel();
    }

    /// Poll until [`unwatch`](Self::unwatch) is called
    pub async fn run(&self) {
        info!(
            "Arbitration loop started as {} from block {} (every {:?}, {} providers)",
            self.config.arbiter,
            self.cursor(),
            self.config.poll_interval(),
            self.router.len()
        );

        while !self.token.is_cancelled() {
            match self.poll_once().await {
                Ok(report) if report.total() > 0 => info!(
                    decided = report.decided,
                    already_decided = report.already_decided,
                    skipped = report.skipped,
                    ignored = report.ignored,
                    "Cycle complete"
                ),
                Ok(_) => {}
                Err(e) => warn!(kind = e.kind(), error = %e, "Poll failed, retrying next interval"),
            }

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = sleep(self.config.poll_interval()) => {}
            }
        }

        info!("Arbitration loop stopped at block {}", self.cursor());
    }

    /// Run exactly one polling cycle
    pub async fn poll_once(&self) -> Result<CycleReport, OracleError> {
        let from = self.cursor();
        let latest = self.ledger.latest_block().await?;
        if latest < from {
            return Ok(CycleReport::default());
        }

        let events = self
            .ledger
            .query_events(&EventFilter {
                topic: EventTopic::Attested,
                schema: Some(*OBLIGATION_SCHEMA),
                from_block: from,
                to_block: latest,
            })
            .await?;
        debug!("Blocks {}..={}: {} fulfillment events", from, latest, events.len());

        let outcomes: Vec<EventOutcome> = stream::iter(events)
            .map(|event| self.process_event(event))
            .buffer_unordered(self.config.max_concurrent_events.max(1))
            .collect()
            .await;

        let mut report = CycleReport::default();
        for outcome in outcomes {
            report.tally(outcome);
        }
        self.cursor.store(latest + 1, Ordering::SeqCst);
        Ok(report)
    }

    async fn process_event(&self, event: LedgerEvent) -> EventOutcome {
        let uid = event.uid;
        match AssertUnwindSafe(self.handle_event(&uid)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(uid = %uid, "Arbitration panicked, skipping fulfillment");
                EventOutcome::Skipped
            }
        }
    }

    async fn handle_event(&self, uid: &Uid) -> EventOutcome {
        if self.decided.lock().await.contains(uid) {
            return EventOutcome::AlreadyDecided;
        }

        match self.arbitrate_event(uid).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(uid = %uid, kind = e.kind(), error = %e, "Skipping fulfillment");
                EventOutcome::Skipped
            }
        }
    }

    async fn arbitrate_event(&self, uid: &Uid) -> Result<EventOutcome, OracleError> {
        let fulfillment = self.ledger.get_attestation(uid).await?;
        if fulfillment.is_revoked() {
            debug!(uid = %uid, "Fulfillment revoked, ignoring");
            return Ok(EventOutcome::Ignored);
        }

        let escrow = self.ledger.get_attestation(&fulfillment.ref_uid).await?;
        if escrow.schema != *ESCROW_SCHEMA {
            debug!(uid = %uid, "Fulfillment does not reference an escrow, ignoring");
            return Ok(EventOutcome::Ignored);
        }
        let terms = decode_escrow_terms(&escrow.data)?;
        if terms.arbiter != self.config.arbiter {
            debug!(uid = %uid, arbiter = %terms.arbiter, "Escrow names another arbiter");
            return Ok(EventOutcome::Ignored);
        }

        let obligation = decode_obligation_item(&fulfillment.data)?;
        let demand = decode_demand(&terms.demand)?;
        let decision = self.router.arbitrate(&demand, &obligation).await?;

        match self.record_decision(uid, decision).await {
            Ok(attestation) => {
                info!(uid = %uid, decision, decision_uid = %attestation.uid, "Decision recorded");
                self.decided.lock().await.insert(*uid);
                Ok(EventOutcome::Decided)
            }
            Err(LedgerError::DuplicateDecision(_)) => {
                info!(uid = %uid, "Fulfillment already decided");
                self.decided.lock().await.insert(*uid);
                Ok(EventOutcome::AlreadyDecided)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn record_decision(&self, uid: &Uid, decision: bool) -> Result<Attestation, LedgerError> {
        let _signer = self.signer.lock().await;
        let ledger = self.ledger.as_ref();
        let from = &self.config.arbiter;
        send_with_retry(&self.config.retry, "record decision", move || {
            ledger.record_decision(from, uid, decision)
        })
        .await
    }
}

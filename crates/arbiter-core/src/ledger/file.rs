// ============================================================================
// FileLedger - Local Ledger File (redb)
// ============================================================================
// Persistent development ledger shared by separate CLI processes (oracle,
// depositor, fulfiller). The database is opened per operation so processes
// can interleave; lock contention surfaces as a retryable error.
// Default path: ~/.nla-oracle/ledger.redb
// ============================================================================

use async_trait::async_trait;
use redb::{Database, DatabaseError, ReadableTable, TableDefinition};
use std::future::ready;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use super::state::{BlockClock, LedgerState};
use super::Ledger;
use crate::tx_confirm::{send_with_retry, RetryConfig};
use crate::types::*;

const LEDGER: TableDefinition<&str, &[u8]> = TableDefinition::new("ledger");
const STATE_KEY: &str = "state";

#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    retry: RetryConfig,
    /// One open handle per process at a time
    lock: Mutex<()>,
}

impl FileLedger {
    /// ~/.nla-oracle/ledger.redb
    pub fn default_path() -> Result<PathBuf, LedgerError> {
        let home = dirs::home_dir()
            .ok_or_else(|| LedgerError::Storage("Cannot determine home directory".into()))?;
        Ok(home.join(".nla-oracle").join("ledger.redb"))
    }

    /// Create the ledger file if it does not exist yet. An existing ledger is
    /// left untouched.
    pub fn init(path: &Path, clock: BlockClock, bond: u128) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LedgerError::Storage(format!("Failed to create {}: {}", parent.display(), e)))?;
        }

        let db = open_db(path)?;
        let write_txn = db.begin_write().map_err(storage)?;
        {
            let mut table = write_txn.open_table(LEDGER).map_err(storage)?;
            let exists = table.get(STATE_KEY).map_err(storage)?.is_some();
            if exists {
                info!("Ledger already initialised at {}", path.display());
            } else {
                let bytes = bincode::serialize(&LedgerState::new(clock, bond))
                    .map_err(|e| LedgerError::Storage(format!("Failed to serialize ledger: {}", e)))?;
                table.insert(STATE_KEY, bytes.as_slice()).map_err(storage)?;
                info!("Initialised ledger at {}", path.display());
            }
        }
        write_txn.commit().map_err(storage)?;

        Ok(Self {
            path: path.to_path_buf(),
            retry: RetryConfig::default(),
            lock: Mutex::new(()),
        })
    }

    /// Open an existing ledger file
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if !path.exists() {
            return Err(LedgerError::Storage(format!(
                "No ledger at {} (run `nla-oracle init` first)",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            retry: RetryConfig::default(),
            lock: Mutex::new(()),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn bonds_held(&self) -> Result<u128, LedgerError> {
        self.read(|s| Ok(s.bonds_held())).await
    }

    async fn read<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        F: Fn(&LedgerState) -> Result<T, LedgerError> + Send + Sync,
        T: Send,
    {
        send_with_retry(&self.retry, "ledger read", || ready(self.inspect(&op))).await
    }

    async fn write<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        F: Fn(&mut LedgerState) -> Result<T, LedgerError> + Send + Sync,
        T: Send,
    {
        send_with_retry(&self.retry, "ledger write", || ready(self.transact(&op))).await
    }

    /// Apply `op` to a read snapshot. No write lock, no commit.
    fn inspect<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        F: Fn(&LedgerState) -> Result<T, LedgerError>,
    {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| LedgerError::Storage("Ledger lock poisoned".into()))?;
        let db = open_db(&self.path)?;
        let read_txn = db.begin_read().map_err(storage)?;
        let table = read_txn.open_table(LEDGER).map_err(storage)?;
        let state = load_state(&table)?;
        op(&state)
    }

    /// Load state, apply `op`, and persist the result if `op` succeeded
    fn transact<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        F: Fn(&mut LedgerState) -> Result<T, LedgerError>,
    {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| LedgerError::Storage("Ledger lock poisoned".into()))?;
        let db = open_db(&self.path)?;
        let write_txn = db.begin_write().map_err(storage)?;
        let result = {
            let mut table = write_txn.open_table(LEDGER).map_err(storage)?;
            let mut state = load_state(&table)?;
            let result = op(&mut state);
            if result.is_ok() {
                let bytes = bincode::serialize(&state)
                    .map_err(|e| LedgerError::Storage(format!("Failed to serialize ledger: {}", e)))?;
                table.insert(STATE_KEY, bytes.as_slice()).map_err(storage)?;
            }
            result
        };
        if result.is_ok() {
            write_txn.commit().map_err(storage)?;
            debug!("Ledger write committed");
        } else {
            write_txn.abort().map_err(storage)?;
        }
        result
    }
}

fn load_state(table: &impl ReadableTable<&'static str, &'static [u8]>) -> Result<LedgerState, LedgerError> {
    match table.get(STATE_KEY).map_err(storage)? {
        Some(value) => bincode::deserialize(value.value())
            .map_err(|e| LedgerError::Storage(format!("Failed to deserialize ledger: {}", e))),
        None => Err(LedgerError::Storage("Ledger is not initialised".into())),
    }
}

fn open_db(path: &Path) -> Result<Database, LedgerError> {
    match Database::create(path) {
        Ok(db) => Ok(db),
        Err(DatabaseError::DatabaseAlreadyOpen) => Err(LedgerError::Unavailable(format!(
            "{} is in use by another process",
            path.display()
        ))),
        Err(e) => Err(LedgerError::Storage(format!("Failed to open ledger: {}", e))),
    }
}

fn storage(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

#[async_trait]
impl Ledger for FileLedger {
    async fn latest_block(&self) -> Result<u64, LedgerError> {
        self.read(|s| Ok(s.height())).await
    }

    async fn query_events(&self, filter: &EventFilter) -> Result<Vec<LedgerEvent>, LedgerError> {
        self.read(|s| Ok(s.query_events(filter))).await
    }

    async fn get_attestation(&self, uid: &Uid) -> Result<Attestation, LedgerError> {
        self.read(|s| s.get_attestation(uid)).await
    }

    async fn revoke(&self, from: &Address, uid: &Uid) -> Result<TxHandle, LedgerError> {
        self.write(|s| s.revoke(from, uid)).await
    }

    async fn tx_status(&self, tx: &TxHandle) -> Result<TxStatus, LedgerError> {
        self.read(|s| Ok(s.tx_status(tx))).await
    }

    async fn create_escrow(
        &self,
        from: &Address,
        terms: &EscrowTerms,
    ) -> Result<Attestation, LedgerError> {
        self.write(|s| Ok(s.create_escrow(from, terms))).await
    }

    async fn record_decision(
        &self,
        from: &Address,
        fulfillment: &Uid,
        decision: bool,
    ) -> Result<Attestation, LedgerError> {
        self.write(|s| s.record_decision(from, fulfillment, decision)).await
    }

    async fn collect(
        &self,
        from: &Address,
        escrow: &Uid,
        fulfillment: &Uid,
    ) -> Result<TxHandle, LedgerError> {
        self.write(|s| s.collect(from, escrow, fulfillment)).await
    }

    async fn compute_commitment(
        &self,
        escrow: &Uid,
        fulfiller: &Address,
        record: &ObligationRecord,
    ) -> Result<Commitment, LedgerError> {
        self.read(|s| Ok(s.compute_commitment(escrow, fulfiller, record))).await
    }

    async fn commit(
        &self,
        from: &Address,
        commitment: &Commitment,
    ) -> Result<TxHandle, LedgerError> {
        self.write(|s| s.commit(from, commitment)).await
    }

    async fn reveal(
        &self,
        from: &Address,
        record: &ObligationRecord,
        escrow: &Uid,
    ) -> Result<Attestation, LedgerError> {
        self.write(|s| s.reveal(from, record, escrow)).await
    }

    async fn reclaim_bond(
        &self,
        from: &Address,
        fulfillment: &Uid,
    ) -> Result<TxHandle, LedgerError> {
        self.write(|s| s.reclaim_bond(from, fulfillment)).await
    }
}

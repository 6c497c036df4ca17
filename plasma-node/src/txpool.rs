//! Durable transaction pool
//!
//! Entries live in the `txpool` column family under `pool || merkle hash`.
//! Each entry carries an insertion sequence so block production keeps
//! arrival order. Pushing a transaction also reserves its inputs in the
//! `details` column family, so a competing spend is refused before it
//! reaches a block.

use crate::error::{Error, Result};
use crate::storage::{pool_key, reserved_key, Storage, CF_DETAILS, CF_TXPOOL, PREFIX_POOL};
use crate::transaction::Transaction;
use ethers::types::H256;
use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stored pool entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoolEntry {
    sequence: u64,
    #[serde(with = "serde_bytes")]
    tx: Vec<u8>,
}

/// Pending transactions awaiting a block
#[derive(Debug)]
pub struct TxPool {
    storage: Arc<Storage>,
    next_sequence: AtomicU64,
}

impl TxPool {
    /// Open the pool, resuming the sequence after any persisted entries
    pub fn new(storage: Arc<Storage>) -> Result<Self> {
        let pool = Self {
            storage,
            next_sequence: AtomicU64::new(0),
        };
        let next = pool
            .entries()?
            .iter()
            .map(|(_, entry)| entry.sequence + 1)
            .max()
            .unwrap_or(0);
        pool.next_sequence.store(next, Ordering::SeqCst);
        Ok(pool)
    }

    fn entries(&self) -> Result<Vec<(Box<[u8]>, PoolEntry)>> {
        let mut entries = self
            .storage
            .scan_prefix(CF_TXPOOL, PREFIX_POOL)?
            .into_iter()
            .map(|(key, value)| -> Result<_> {
                Ok((key, bincode::deserialize::<PoolEntry>(&value)?))
            })
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by_key(|(_, entry)| entry.sequence);
        Ok(entries)
    }

    /// Insert a transaction and reserve its inputs
    pub fn push(&self, tx: &Transaction) -> Result<H256> {
        let merkle_hash = tx.merkle_hash();
        let entry = PoolEntry {
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            tx: tx.encode(true),
        };

        let cf_pool = self.storage.cf_handle(CF_TXPOOL)?;
        let cf_details = self.storage.cf_handle(CF_DETAILS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_pool, pool_key(&merkle_hash), bincode::serialize(&entry)?);
        for (_, input) in tx.spent_inputs() {
            batch.put_cf(cf_details, reserved_key(input), merkle_hash.as_bytes());
        }
        self.storage.db().write(batch)?;

        tracing::debug!(
            merkle_hash = ?merkle_hash,
            sequence = entry.sequence,
            "Transaction pooled"
        );
        Ok(merkle_hash)
    }

    /// Remove and return the oldest transaction, releasing its inputs
    pub fn pop(&self) -> Result<Option<Transaction>> {
        let Some((key, entry)) = self.entries()?.into_iter().next() else {
            return Ok(None);
        };
        let tx = Transaction::decode(&entry.tx)?;
        self.delete_entry(&key, &tx)?;
        Ok(Some(tx))
    }

    /// Remove a transaction by merkle hash, releasing its inputs
    pub fn remove(&self, merkle_hash: &H256) -> Result<bool> {
        let key = pool_key(merkle_hash);
        let cf_pool = self.storage.cf_handle(CF_TXPOOL)?;
        let Some(bytes) = self.storage.db().get_cf(cf_pool, &key)? else {
            return Ok(false);
        };
        let entry: PoolEntry = bincode::deserialize(&bytes)?;
        let tx = Transaction::decode(&entry.tx)?;
        self.delete_entry(&key, &tx)?;
        Ok(true)
    }

    /// Drop a transaction's entry and input reservations, whether or not it
    /// is still pooled
    pub fn release(&self, tx: &Transaction) -> Result<()> {
        self.delete_entry(&pool_key(&tx.merkle_hash()), tx)
    }

    fn delete_entry(&self, key: &[u8], tx: &Transaction) -> Result<()> {
        let cf_pool = self.storage.cf_handle(CF_TXPOOL)?;
        let cf_details = self.storage.cf_handle(CF_DETAILS)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_pool, key);
        for (_, input) in tx.spent_inputs() {
            batch.delete_cf(cf_details, reserved_key(input));
        }
        self.storage.db().write(batch)?;
        Ok(())
    }

    /// True if the transaction is pooled
    pub fn contains(&self, merkle_hash: &H256) -> Result<bool> {
        let cf_pool = self.storage.cf_handle(CF_TXPOOL)?;
        Ok(self
            .storage
            .db()
            .get_pinned_cf(cf_pool, pool_key(merkle_hash))?
            .is_some())
    }

    /// Iterate the current contents in arrival order
    ///
    /// The iterator works on a snapshot taken when it is created; calling
    /// `list_all` again restarts from the pool's state at that time.
    pub fn list_all(&self) -> Result<impl Iterator<Item = Result<Transaction>>> {
        Ok(self
            .entries()?
            .into_iter()
            .map(|(_, entry)| Transaction::decode(&entry.tx).map_err(Error::from)))
    }

    /// Number of pooled transactions
    pub fn len(&self) -> Result<usize> {
        self.storage.pool_len()
    }

    /// True if nothing is pooled
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every pooled transaction in one batch and return them in
    /// arrival order
    ///
    /// Exactly the keys that were read are deleted, so a concurrent push
    /// is neither lost nor included twice. Input reservations stay in place
    /// until the block spending them is numbered.
    pub fn drain_all(&self) -> Result<Vec<Transaction>> {
        let entries = self.entries()?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let cf_pool = self.storage.cf_handle(CF_TXPOOL)?;
        let mut batch = WriteBatch::default();
        let mut txs = Vec::with_capacity(entries.len());
        for (key, entry) in entries {
            txs.push(Transaction::decode(&entry.tx)?);
            batch.delete_cf(cf_pool, key);
        }
        self.storage.db().write(batch)?;

        tracing::debug!(count = txs.len(), "Transaction pool drained");
        Ok(txs)
    }
}

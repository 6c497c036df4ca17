//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `blocks` - Numbered blocks (key: block hash)
//! - `indices` - `num || number` → hash, `root || root` → block,
//!   `tx || merkle hash` → transaction
//! - `details` - UTXO entries, head pointer, per-block details, exit and
//!   spent markers, reserved inputs, pending root submissions, watcher and
//!   production cursors
//! - `txpool` - Pending transactions (see [`crate::txpool`])
//!
//! # UTXO keys
//!
//! `utxo || owner(20) || block(32, BE) || txindex(32, BE) || oindex(32, BE)`,
//! value is the encoded transaction that created the output.

use crate::{
    block::{Block, BlockHeader},
    error::{Error, Result},
    transaction::{Output, Transaction, TxLookup, UtxoPosition},
    Config,
};
use ethers::types::{Address, H256};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};
use serde::{Deserialize, Serialize};

/// Column family names
pub(crate) const CF_BLOCKS: &str = "blocks";
pub(crate) const CF_INDICES: &str = "indices";
pub(crate) const CF_DETAILS: &str = "details";
pub(crate) const CF_TXPOOL: &str = "txpool";

const PREFIX_NUMBER: &[u8] = b"num";
const PREFIX_ROOT: &[u8] = b"root";
const PREFIX_TX: &[u8] = b"tx";

const PREFIX_UTXO: &[u8] = b"utxo";
const PREFIX_BLOCK_DETAILS: &[u8] = b"block";
const PREFIX_EXIT: &[u8] = b"exit";
const PREFIX_RESERVED: &[u8] = b"reserved";
const PREFIX_PENDING: &[u8] = b"pending";
const PREFIX_SPENT: &[u8] = b"spent";
const KEY_HEAD: &[u8] = b"head";
const KEY_WATCHER_CURSOR: &[u8] = b"watcher-cursor";
const KEY_PRODUCTION_TRIGGER: &[u8] = b"production-trigger";
const KEY_CONTIGUOUS: &[u8] = b"contiguous-through";

pub(crate) const PREFIX_POOL: &[u8] = b"pool";

/// Summary of a committed block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDetails {
    /// Block hash
    pub hash: H256,
    /// Block number
    pub number: u64,
    /// Header
    pub header: BlockHeader,
    /// Number of transactions
    pub tx_count: u64,
    /// Synthetic deposit block
    pub deposit: bool,
}

/// Unspent output with its creating transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Position of the output
    pub position: UtxoPosition,
    /// The output itself
    pub output: Output,
    /// Transaction that created it
    pub tx: Transaction,
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_BLOCKS, Self::cf_options_blocks()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_DETAILS, Self::cf_options_details()),
            ColumnFamilyDescriptor::new(CF_TXPOOL, Self::cf_options_txpool()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB");

        Ok(Self { db })
    }

    // Column family options

    fn cf_options_blocks() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_details() -> Options {
        let mut opts = Options::default();
        // UTXO lookups dominate reads
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_txpool() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::None);
        opts
    }

    // Helpers

    pub(crate) fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    pub(crate) fn db(&self) -> &DB {
        &self.db
    }

    /// Collect `(key, value)` pairs whose key starts with `prefix`
    pub(crate) fn scan_prefix(
        &self,
        cf_name: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf_handle(cf_name)?;
        let mut entries = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }

    fn get_h256(&self, cf_name: &str, key: &[u8]) -> Result<Option<H256>> {
        let cf = self.cf_handle(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) if bytes.len() == 32 => Ok(Some(H256::from_slice(&bytes))),
            Some(bytes) => Err(Error::Storage(format!(
                "Corrupt hash entry of {} bytes",
                bytes.len()
            ))),
            None => Ok(None),
        }
    }

    fn get_block_at(&self, cf_name: &str, key: &[u8]) -> Result<Option<Block>> {
        let cf = self.cf_handle(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(Block::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // Block operations

    /// Get block by hash
    pub fn get_block(&self, hash: H256) -> Result<Option<Block>> {
        self.get_block_at(CF_BLOCKS, hash.as_bytes())
    }

    /// Hash of the block indexed under `number`
    pub fn get_block_hash(&self, number: u64) -> Result<Option<H256>> {
        self.get_h256(CF_INDICES, &number_key(number))
    }

    /// Get block by number
    pub fn get_block_by_number(&self, number: u64) -> Result<Option<Block>> {
        match self.get_block_hash(number)? {
            Some(hash) => self.get_block(hash),
            None => Ok(None),
        }
    }

    /// Get block by Merkle root, numbered or not
    pub fn get_block_by_root(&self, root: H256) -> Result<Option<Block>> {
        self.get_block_at(CF_INDICES, &root_key(&root))
    }

    /// Details of a numbered block
    pub fn get_block_details(&self, hash: H256) -> Result<Option<BlockDetails>> {
        let cf = self.cf_handle(CF_DETAILS)?;
        match self.db.get_cf(cf, details_key(&hash))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Highest committed block
    pub fn head(&self) -> Result<Option<BlockDetails>> {
        let cf = self.cf_handle(CF_DETAILS)?;
        match self.db.get_cf(cf, KEY_HEAD)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Number of the head block, 0 when nothing is committed
    pub fn head_number(&self) -> Result<u64> {
        Ok(self.head()?.map(|head| head.number).unwrap_or(0))
    }

    /// Get transaction by merkle hash
    pub fn get_tx(&self, merkle_hash: H256) -> Result<Option<Transaction>> {
        let cf = self.cf_handle(CF_INDICES)?;
        match self.db.get_cf(cf, tx_key(&merkle_hash))? {
            Some(bytes) => Ok(Some(Transaction::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persist a block
    ///
    /// The root index is always written. A numbered block additionally
    /// records its details, hash/number/tx indices, consumes its inputs and
    /// creates its outputs. Everything goes through one `WriteBatch`.
    pub fn commit_block(&self, block: &Block, deposit: bool) -> Result<()> {
        let encoded = block.encode();
        let cf_indices = self.cf_handle(CF_INDICES)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_indices, root_key(&block.header.root), &encoded);

        let number = block.number();
        if number != 0 {
            let cf_blocks = self.cf_handle(CF_BLOCKS)?;
            let cf_details = self.cf_handle(CF_DETAILS)?;
            let cf_pool = self.cf_handle(CF_TXPOOL)?;
            let hash = block.hash();

            batch.put_cf(cf_blocks, hash.as_bytes(), &encoded);
            batch.put_cf(cf_indices, number_key(number), hash.as_bytes());

            let details = BlockDetails {
                hash,
                number,
                header: block.header.clone(),
                tx_count: block.transactions.len() as u64,
                deposit,
            };
            let details_bytes = bincode::serialize(&details)?;
            batch.put_cf(cf_details, details_key(&hash), &details_bytes);

            // Head only moves forward
            if self.head_number()? < number {
                batch.put_cf(cf_details, KEY_HEAD, &details_bytes);
            }

            for (tx_index, tx) in block.transactions.iter().enumerate() {
                let tx_bytes = tx.encode(true);
                let merkle_hash = tx.merkle_hash();
                batch.put_cf(cf_indices, tx_key(&merkle_hash), &tx_bytes);

                for (_, input) in tx.spent_inputs() {
                    if let Some(source) = self.tx_at(input.block_number, input.tx_index)? {
                        if let Some(spent) = source.outputs.get(usize::from(input.output_index)) {
                            batch.delete_cf(cf_details, utxo_key(&spent.owner, input));
                        }
                    }
                    batch.delete_cf(cf_details, reserved_key(input));
                    batch.put_cf(cf_details, spent_key(input), merkle_hash.as_bytes());
                }

                for (output_index, output) in tx.outputs.iter().enumerate() {
                    if output.owner.is_zero() {
                        continue;
                    }
                    let position =
                        UtxoPosition::new(number, tx_index as u32, output_index as u8);
                    if self.is_exited_locally(position)? {
                        continue;
                    }
                    batch.put_cf(cf_details, utxo_key(&output.owner, position), &tx_bytes);
                }

                batch.delete_cf(cf_pool, pool_key(&merkle_hash));
            }
        }

        self.db.write(batch).map_err(|e| {
            tracing::error!(block_number = number, error = %e, "Block batch write failed");
            Error::from(e)
        })?;

        if number != 0 {
            self.advance_contiguous()?;
        }

        tracing::debug!(
            block_number = number,
            root = ?block.header.root,
            tx_count = block.transactions.len(),
            "Block written"
        );

        Ok(())
    }

    /// Highest `n` such that blocks `1..=n` are all committed
    pub fn contiguous_through(&self) -> Result<u64> {
        Ok(self.get_u64(KEY_CONTIGUOUS)?.unwrap_or(0))
    }

    /// Walk the number index past the stored contiguous mark and persist it
    pub fn advance_contiguous(&self) -> Result<u64> {
        let stored = self.contiguous_through()?;
        let mut through = stored;
        while self.get_block_hash(through + 1)?.is_some() {
            through += 1;
        }
        if through != stored {
            self.put_u64(KEY_CONTIGUOUS, through)?;
        }
        Ok(through)
    }

    // UTXO operations

    /// Transaction behind a live UTXO entry
    pub fn get_utxo(&self, owner: &Address, position: UtxoPosition) -> Result<Option<Transaction>> {
        let cf = self.cf_handle(CF_DETAILS)?;
        match self.db.get_cf(cf, utxo_key(owner, position))? {
            Some(bytes) => Ok(Some(Transaction::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// True if a live UTXO entry exists
    pub fn has_utxo(&self, owner: &Address, position: UtxoPosition) -> Result<bool> {
        let cf = self.cf_handle(CF_DETAILS)?;
        Ok(self.db.get_pinned_cf(cf, utxo_key(owner, position))?.is_some())
    }

    /// All live outputs owned by `owner`, ordered by position
    pub fn get_utxos(&self, owner: &Address) -> Result<Vec<Utxo>> {
        let mut prefix = PREFIX_UTXO.to_vec();
        prefix.extend_from_slice(owner.as_bytes());

        let mut utxos = Vec::new();
        for (key, value) in self.scan_prefix(CF_DETAILS, &prefix)? {
            let position = UtxoPosition::from_key_bytes(&key[prefix.len()..]).ok_or_else(|| {
                Error::Storage(format!("Corrupt UTXO key of {} bytes", key.len()))
            })?;
            let tx = Transaction::decode(&value)?;
            let output = tx
                .outputs
                .get(usize::from(position.output_index))
                .copied()
                .ok_or_else(|| Error::Storage(format!("UTXO {} has no output", position)))?;
            utxos.push(Utxo {
                position,
                output,
                tx,
            });
        }
        Ok(utxos)
    }

    // Exits

    /// Record an exit and drop the matching UTXO entry (atomic)
    pub fn mark_exited(&self, owner: &Address, position: UtxoPosition) -> Result<()> {
        let cf = self.cf_handle(CF_DETAILS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, exit_key(position), owner.as_bytes());
        batch.delete_cf(cf, utxo_key(owner, position));
        self.db.write(batch)?;
        Ok(())
    }

    /// Drop a UTXO entry the root chain reports as exited
    pub fn delete_utxo(&self, owner: &Address, position: UtxoPosition) -> Result<()> {
        self.mark_exited(owner, position)
    }

    /// True if an exit marker exists for `position`
    pub fn is_exited_locally(&self, position: UtxoPosition) -> Result<bool> {
        let cf = self.cf_handle(CF_DETAILS)?;
        Ok(self.db.get_pinned_cf(cf, exit_key(position))?.is_some())
    }

    /// True once a committed block consumed `position`
    pub fn is_spent(&self, position: UtxoPosition) -> Result<bool> {
        let cf = self.cf_handle(CF_DETAILS)?;
        Ok(self.db.get_pinned_cf(cf, spent_key(position))?.is_some())
    }

    // Reserved inputs

    /// True if a pooled or unnumbered transaction already spends `position`
    pub fn is_reserved(&self, position: UtxoPosition) -> Result<bool> {
        let cf = self.cf_handle(CF_DETAILS)?;
        Ok(self.db.get_pinned_cf(cf, reserved_key(position))?.is_some())
    }

    // Event watcher cursor

    fn get_u64(&self, key: &[u8]) -> Result<Option<u64>> {
        let cf = self.cf_handle(CF_DETAILS)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    Error::Storage(format!("Corrupt counter {}", String::from_utf8_lossy(key)))
                })?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn put_u64(&self, key: &[u8], value: u64) -> Result<()> {
        let cf = self.cf_handle(CF_DETAILS)?;
        self.db.put_cf(cf, key, value.to_be_bytes())?;
        Ok(())
    }

    /// Last fully processed root-chain block
    pub fn watcher_cursor(&self) -> Result<Option<u64>> {
        self.get_u64(KEY_WATCHER_CURSOR)
    }

    /// Persist the watcher cursor
    pub fn set_watcher_cursor(&self, block_number: u64) -> Result<()> {
        self.put_u64(KEY_WATCHER_CURSOR, block_number)
    }

    /// Root-chain height of the last block production trigger
    pub fn production_trigger(&self) -> Result<Option<u64>> {
        self.get_u64(KEY_PRODUCTION_TRIGGER)
    }

    /// Persist the production trigger height
    pub fn set_production_trigger(&self, height: u64) -> Result<()> {
        self.put_u64(KEY_PRODUCTION_TRIGGER, height)
    }

    // Pending root submissions

    /// Remember a produced root that still has to reach the root chain
    pub fn add_pending_submission(&self, root: H256) -> Result<()> {
        let cf = self.cf_handle(CF_DETAILS)?;
        self.db.put_cf(cf, pending_key(&root), b"")?;
        Ok(())
    }

    /// Forget a pending root
    pub fn remove_pending_submission(&self, root: H256) -> Result<()> {
        let cf = self.cf_handle(CF_DETAILS)?;
        self.db.delete_cf(cf, pending_key(&root))?;
        Ok(())
    }

    /// Roots awaiting submission
    pub fn pending_submissions(&self) -> Result<Vec<H256>> {
        Ok(self
            .scan_prefix(CF_DETAILS, PREFIX_PENDING)?
            .into_iter()
            .filter_map(|(key, _)| {
                let suffix = &key[PREFIX_PENDING.len()..];
                (suffix.len() == 32).then(|| H256::from_slice(suffix))
            })
            .collect())
    }

    /// Number of pooled transactions
    pub fn pool_len(&self) -> Result<usize> {
        Ok(self.scan_prefix(CF_TXPOOL, PREFIX_POOL)?.len())
    }
}

impl TxLookup for Storage {
    fn tx_at(&self, block_number: u64, tx_index: u32) -> Result<Option<Transaction>> {
        Ok(self
            .get_block_by_number(block_number)?
            .and_then(|block| block.transactions.into_iter().nth(tx_index as usize)))
    }
}

// Key helpers

fn number_key(number: u64) -> Vec<u8> {
    let mut key = PREFIX_NUMBER.to_vec();
    key.extend_from_slice(&number.to_be_bytes());
    key
}

fn root_key(root: &H256) -> Vec<u8> {
    let mut key = PREFIX_ROOT.to_vec();
    key.extend_from_slice(root.as_bytes());
    key
}

fn tx_key(merkle_hash: &H256) -> Vec<u8> {
    let mut key = PREFIX_TX.to_vec();
    key.extend_from_slice(merkle_hash.as_bytes());
    key
}

fn details_key(hash: &H256) -> Vec<u8> {
    let mut key = PREFIX_BLOCK_DETAILS.to_vec();
    key.extend_from_slice(hash.as_bytes());
    key
}

/// `utxo || owner || position`
pub(crate) fn utxo_key(owner: &Address, position: UtxoPosition) -> Vec<u8> {
    let mut key = PREFIX_UTXO.to_vec();
    key.extend_from_slice(owner.as_bytes());
    key.extend_from_slice(&position.to_key_bytes());
    key
}

fn exit_key(position: UtxoPosition) -> Vec<u8> {
    let mut key = PREFIX_EXIT.to_vec();
    key.extend_from_slice(&position.to_key_bytes());
    key
}

pub(crate) fn reserved_key(position: UtxoPosition) -> Vec<u8> {
    let mut key = PREFIX_RESERVED.to_vec();
    key.extend_from_slice(&position.to_key_bytes());
    key
}

fn spent_key(position: UtxoPosition) -> Vec<u8> {
    let mut key = PREFIX_SPENT.to_vec();
    key.extend_from_slice(&position.to_key_bytes());
    key
}

fn pending_key(root: &H256) -> Vec<u8> {
    let mut key = PREFIX_PENDING.to_vec();
    key.extend_from_slice(root.as_bytes());
    key
}

pub(crate) fn pool_key(merkle_hash: &H256) -> Vec<u8> {
    let mut key = PREFIX_POOL.to_vec();
    key.extend_from_slice(merkle_hash.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::transaction::InputSlot;
    use ethers::types::U256;
    use tempfile::TempDir;

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Storage::open(&config).unwrap(), temp_dir)
    }

    fn deposit_block(number: u64, owner: Address, amount: u64) -> Block {
        Block::new(number, vec![Transaction::deposit(owner, U256::from(amount))]).unwrap()
    }

    #[test]
    fn test_storage_open() {
        let (storage, _temp) = test_storage();
        for cf in [CF_BLOCKS, CF_INDICES, CF_DETAILS, CF_TXPOOL] {
            assert!(storage.db.cf_handle(cf).is_some());
        }
        assert!(storage.head().unwrap().is_none());
        assert_eq!(storage.head_number().unwrap(), 0);
    }

    #[test]
    fn test_utxo_key_layout() {
        let owner = Address::repeat_byte(0xee);
        let key = utxo_key(&owner, UtxoPosition::new(7, 2, 1));
        assert_eq!(key.len(), 4 + 20 + 96);
        assert_eq!(&key[..4], b"utxo");
        assert_eq!(&key[4..24], owner.as_bytes());
        assert_eq!(key[24 + 31], 7);
        assert_eq!(key[24 + 63], 2);
        assert_eq!(key[24 + 95], 1);
    }

    #[test]
    fn test_commit_numbered_block() {
        let (storage, _temp) = test_storage();
        let owner = Address::repeat_byte(1);
        let block = deposit_block(1, owner, 50);

        storage.commit_block(&block, true).unwrap();

        let by_hash = storage.get_block(block.hash()).unwrap().unwrap();
        assert_eq!(by_hash.encode(), block.encode());
        assert_eq!(storage.get_block_by_number(1).unwrap().unwrap(), block);
        assert_eq!(storage.get_block_by_root(block.header.root).unwrap().unwrap(), block);

        let head = storage.head().unwrap().unwrap();
        assert_eq!(head.number, 1);
        assert!(head.deposit);
        assert_eq!(head.tx_count, 1);

        let tx = &block.transactions[0];
        assert_eq!(storage.get_tx(tx.merkle_hash()).unwrap().as_ref(), Some(tx));

        let utxos = storage.get_utxos(&owner).unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].position, UtxoPosition::new(1, 0, 0));
        assert_eq!(utxos[0].output.amount, U256::from(50));
        assert_eq!(storage.tx_at(1, 0).unwrap().as_ref(), Some(tx));
        assert!(storage.tx_at(1, 1).unwrap().is_none());
    }

    #[test]
    fn test_unnumbered_block_only_indexed_by_root() {
        let (storage, _temp) = test_storage();
        let block = deposit_block(0, Address::repeat_byte(1), 5);

        storage.commit_block(&block, false).unwrap();

        assert!(storage.get_block_by_root(block.header.root).unwrap().is_some());
        assert!(storage.get_block(block.hash()).unwrap().is_none());
        assert!(storage.head().unwrap().is_none());
        assert!(storage.get_utxos(&Address::repeat_byte(1)).unwrap().is_empty());
    }

    #[test]
    fn test_spend_moves_utxo() {
        let (storage, _temp) = test_storage();
        let alice = KeyPair::generate();
        let bob = Address::repeat_byte(0xbb);

        storage
            .commit_block(&deposit_block(1, alice.address(), 100), true)
            .unwrap();

        let mut transfer = Transaction::new(
            [UtxoPosition::new(1, 0, 0), UtxoPosition::NULL],
            [Output::new(bob, U256::from(100)), Output::default()],
            U256::zero(),
        );
        transfer.sign(InputSlot::First, &alice).unwrap();
        storage
            .commit_block(&Block::new(7, vec![transfer]).unwrap(), false)
            .unwrap();

        assert!(storage.get_utxos(&alice.address()).unwrap().is_empty());
        assert!(storage.is_spent(UtxoPosition::new(1, 0, 0)).unwrap());
        let bob_utxos = storage.get_utxos(&bob).unwrap();
        assert_eq!(bob_utxos.len(), 1);
        assert_eq!(bob_utxos[0].position, UtxoPosition::new(7, 0, 0));
        assert!(!storage.is_spent(UtxoPosition::new(7, 0, 0)).unwrap());
        assert_eq!(storage.head_number().unwrap(), 7);
    }

    #[test]
    fn test_contiguous_through_stops_at_gap() {
        let (storage, _temp) = test_storage();
        let owner = Address::repeat_byte(4);
        assert_eq!(storage.contiguous_through().unwrap(), 0);

        storage.commit_block(&deposit_block(1, owner, 1), true).unwrap();
        storage.commit_block(&deposit_block(3, owner, 3), true).unwrap();
        assert_eq!(storage.contiguous_through().unwrap(), 1);
        assert_eq!(storage.head_number().unwrap(), 3);

        storage.commit_block(&deposit_block(2, owner, 2), true).unwrap();
        assert_eq!(storage.contiguous_through().unwrap(), 3);
    }

    #[test]
    fn test_head_only_moves_forward() {
        let (storage, _temp) = test_storage();
        storage
            .commit_block(&deposit_block(5, Address::repeat_byte(1), 1), true)
            .unwrap();
        storage
            .commit_block(&deposit_block(3, Address::repeat_byte(2), 1), true)
            .unwrap();

        assert_eq!(storage.head_number().unwrap(), 5);
        assert!(storage.get_block_by_number(3).unwrap().is_some());
    }

    #[test]
    fn test_prefix_scan_is_bounded() {
        let (storage, _temp) = test_storage();
        let a = Address::repeat_byte(0x10);
        let b = Address::repeat_byte(0x11);
        storage.commit_block(&deposit_block(1, a, 1), true).unwrap();
        storage.commit_block(&deposit_block(2, b, 2), true).unwrap();

        assert_eq!(storage.get_utxos(&a).unwrap().len(), 1);
        assert_eq!(storage.get_utxos(&b).unwrap().len(), 1);
    }

    #[test]
    fn test_exit_marker() {
        let (storage, _temp) = test_storage();
        let owner = Address::repeat_byte(3);
        let position = UtxoPosition::new(1, 0, 0);
        storage.commit_block(&deposit_block(1, owner, 9), true).unwrap();

        storage.mark_exited(&owner, position).unwrap();

        assert!(storage.is_exited_locally(position).unwrap());
        assert!(!storage.has_utxo(&owner, position).unwrap());
        assert!(storage.get_utxos(&owner).unwrap().is_empty());
    }

    #[test]
    fn test_watcher_cursor_and_pending() {
        let (storage, _temp) = test_storage();
        assert_eq!(storage.watcher_cursor().unwrap(), None);
        storage.set_watcher_cursor(42).unwrap();
        assert_eq!(storage.watcher_cursor().unwrap(), Some(42));

        assert_eq!(storage.production_trigger().unwrap(), None);
        storage.set_production_trigger(17).unwrap();
        assert_eq!(storage.production_trigger().unwrap(), Some(17));

        let root = H256::repeat_byte(7);
        storage.add_pending_submission(root).unwrap();
        assert_eq!(storage.pending_submissions().unwrap(), vec![root]);
        storage.remove_pending_submission(root).unwrap();
        assert!(storage.pending_submissions().unwrap().is_empty());
    }
}

//! Child chain engine
//!
//! Ties storage, the single-writer actor and the root chain together behind
//! the API the node exposes: transaction submission, block import and the
//! read methods a request layer serves.
//!
//! # Example
//!
//! ```no_run
//! use plasma_node::{root_chain::MockRootChain, Chain, Config};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> plasma_node::Result<()> {
//!     let chain = Chain::open(Config::default(), Arc::new(MockRootChain::new())).await?;
//!     let head = chain.get_latest_block_number()?;
//!     println!("head: {}", head);
//!     Ok(())
//! }
//! ```

use crate::{
    actor::{spawn_chain_actor, ChainHandle, TxAnnouncement},
    block::{Block, BlockHeader},
    error::ValidationError,
    event_watcher::EventWatcher,
    merkle::MerkleProof,
    metrics::Metrics,
    root_chain::{RootChain, RootChainEvent, CHILD_BLOCK_CREATED, DEPOSIT_BLOCK_CREATED, START_EXIT},
    storage::Utxo,
    transaction::{Transaction, UtxoPosition},
    txpool::TxPool,
    Config, Error, Result, Storage,
};
use ethers::types::{Address, H256};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

const ANNOUNCEMENT_CAPACITY: usize = 1024;

/// Block selector accepted by [`Chain::get_block`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    /// Current head
    Latest,
    /// Block number
    Number(u64),
    /// Block hash
    Hash(H256),
}

impl FromStr for BlockTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "latest" {
            return Ok(BlockTag::Latest);
        }
        if s.starts_with("0x") && s.len() == 66 {
            return H256::from_str(s)
                .map(BlockTag::Hash)
                .map_err(|e| Error::Other(format!("Invalid block hash {}: {}", s, e)));
        }
        s.parse::<u64>()
            .map(BlockTag::Number)
            .map_err(|_| Error::Other(format!("Unrecognized block tag: {}", s)))
    }
}

/// Child chain engine
pub struct Chain {
    /// Actor handle for mutations
    handle: ChainHandle,

    /// Direct storage access (for reads)
    storage: Arc<Storage>,

    root_chain: Arc<dyn RootChain>,
    announcements: broadcast::Sender<TxAnnouncement>,
    metrics: Arc<Metrics>,
    config: Config,

    /// Root chain height at the last production trigger, mirrored in storage
    last_submission: AtomicU64,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("storage", &self.storage)
            .field("root_chain", &self.root_chain)
            .field("authority", &self.config.chain.authority)
            .field("last_submission", &self.last_submission.load(Ordering::Relaxed))
            .finish()
    }
}

impl Chain {
    /// Open the chain and spawn its writer; must run inside a Tokio runtime
    pub async fn open(config: Config, root_chain: Arc<dyn RootChain>) -> Result<Self> {
        let metrics = Arc::new(
            Metrics::new()
                .map_err(|e| Error::Other(format!("Metrics registration failed: {}", e)))?,
        );
        Self::open_with_metrics(config, root_chain, metrics).await
    }

    /// Open the chain reporting into an existing metrics set
    pub async fn open_with_metrics(
        config: Config,
        root_chain: Arc<dyn RootChain>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        let pool = TxPool::new(storage.clone())?;
        metrics.set_txpool_size(pool.len()?);

        let (announcements, _) = broadcast::channel(ANNOUNCEMENT_CAPACITY);
        let handle = spawn_chain_actor(
            storage.clone(),
            pool,
            root_chain.clone(),
            announcements.clone(),
            metrics.clone(),
        );

        storage.advance_contiguous()?;
        let last_submission = storage.production_trigger()?.unwrap_or(0);

        tracing::info!(
            data_dir = %config.data_dir.display(),
            head = storage.head_number()?,
            last_submission,
            authority = config.chain.authority,
            "Chain opened"
        );

        Ok(Self {
            handle,
            storage,
            root_chain,
            announcements,
            metrics,
            config,
            last_submission: AtomicU64::new(last_submission),
        })
    }

    /// Direct storage access
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Root chain collaborator
    pub fn root_chain(&self) -> &Arc<dyn RootChain> {
        &self.root_chain
    }

    /// Metrics
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Receive every transaction admitted from now on
    pub fn subscribe_txs(&self) -> broadcast::Receiver<TxAnnouncement> {
        self.announcements.subscribe()
    }

    /// Admit a transaction, never re-announcing it to `excluded` peers
    ///
    /// Returns the merkle hash, or `None` when an input is already spent,
    /// reserved or exited.
    pub async fn add_tx(&self, tx_bytes: Vec<u8>, excluded: Vec<String>) -> Result<Option<H256>> {
        self.handle.add_tx(tx_bytes, excluded).await
    }

    /// Commit a block, flagging single-deposit blocks as deposits
    pub async fn put_block(&self, block: Block) -> Result<()> {
        let deposit = block.transactions.len() == 1 && block.transactions[0].is_deposit();
        self.handle.put_block(block, deposit).await
    }

    /// Commit a block received from a peer once the root chain confirms
    /// its root under the block's number
    pub async fn import_block(&self, block: Block) -> Result<()> {
        let number = block.number();
        let committed = self.root_chain.get_child_chain(number).await?;
        match committed {
            Some((root, _)) if root == block.header.root => self.put_block(block).await,
            other => Err(Error::InvalidBlock {
                number,
                reason: ValidationError::UncommittedRoot(format!(
                    "block carries {:?}, root chain holds {:?}",
                    block.header.root,
                    other.map(|(root, _)| root)
                )),
            }),
        }
    }

    /// Import peer blocks independently; returns how many were applied
    pub async fn import_blocks(&self, blocks: Vec<Block>) -> usize {
        let mut applied = 0;
        for block in blocks {
            let number = block.number();
            match self.import_block(block).await {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!(block_number = number, error = %e, "Skipping block"),
            }
        }
        applied
    }

    /// Commit a root-chain-confirmed deposit block
    pub async fn add_deposit_block(
        &self,
        header: BlockHeader,
        transactions: Vec<Transaction>,
    ) -> Result<()> {
        self.handle
            .put_block(Block::from_parts(header, transactions), true)
            .await
    }

    /// Drain the pool into a block and submit its root
    pub async fn produce_block(&self) -> Result<Option<Block>> {
        self.handle.produce_block().await
    }

    /// Give a produced root its assigned number
    pub async fn assign_block_number(&self, root: H256, number: u64) -> Result<bool> {
        self.handle.assign_block_number(root, number).await
    }

    /// Record an exit and drop the exited output
    pub async fn mark_exited(&self, owner: Address, position: UtxoPosition) -> Result<()> {
        self.handle.mark_exited(owner, position).await
    }

    /// Root chain height at which blocks were last produced
    pub fn last_submission_height(&self) -> u64 {
        self.last_submission.load(Ordering::SeqCst)
    }

    /// Produce a block once the root chain has advanced far enough
    pub async fn on_root_block(&self, height: u64) -> Result<()> {
        if !self.config.chain.authority {
            return Ok(());
        }
        let last = self.last_submission.load(Ordering::SeqCst);
        if height < last.saturating_add(self.config.chain.block_interval) {
            return Ok(());
        }
        self.storage.set_production_trigger(height)?;
        self.last_submission.store(height, Ordering::SeqCst);
        self.produce_block().await?;
        Ok(())
    }

    /// Apply one root chain event
    ///
    /// Events carrying invalid data are logged and skipped; only failures
    /// worth retrying are returned.
    pub async fn handle_event(&self, event: RootChainEvent) -> Result<()> {
        let result = match event {
            RootChainEvent::DepositBlockCreated {
                block_number,
                root,
                tx_bytes,
            } => {
                let result = match Transaction::decode(&tx_bytes) {
                    Ok(tx) => {
                        self.add_deposit_block(BlockHeader::new(block_number, root), vec![tx])
                            .await
                    }
                    Err(e) => Err(e.into()),
                };
                match result {
                    Err(e @ (Error::InvalidBlock { .. } | Error::Decode(_))) => {
                        // Non-canonical encodings (e.g. zero-padded amounts) hash
                        // differently here and cannot match the contract's root
                        self.metrics.record_deposit_skipped();
                        tracing::error!(
                            block_number,
                            root = ?root,
                            error = %e,
                            "Deposit not credited"
                        );
                        Ok(())
                    }
                    other => other,
                }
            }
            RootChainEvent::ChildBlockCreated { block_number, root } => self
                .assign_block_number(root, block_number)
                .await
                .map(|_| ()),
            RootChainEvent::StartExit { owner, position } => {
                self.mark_exited(owner, position).await
            }
        };

        match result {
            Err(e @ (Error::InvalidBlock { .. } | Error::Decode(_) | Error::Validation(_))) => {
                tracing::warn!(error = %e, "Ignoring invalid root chain event");
                Ok(())
            }
            other => other,
        }
    }

    /// Wire block production and contract events into `watcher`
    pub fn register_handlers(self: &Arc<Self>, watcher: &mut EventWatcher) {
        let chain = self.clone();
        watcher.on_block(move |height| {
            let chain = chain.clone();
            async move { chain.on_root_block(height).await }
        });

        for name in [DEPOSIT_BLOCK_CREATED, CHILD_BLOCK_CREATED, START_EXIT] {
            let chain = self.clone();
            watcher.on(name, move |event| {
                let chain = chain.clone();
                async move { chain.handle_event(event).await }
            });
        }
    }

    /// Resolve `"latest"`, a decimal number or a `0x` hash; anything else
    /// resolves to nothing
    pub fn get_block(&self, tag: &str) -> Result<Option<Block>> {
        match tag.parse::<BlockTag>() {
            Ok(tag) => self.get_block_by_tag(tag),
            Err(_) => Ok(None),
        }
    }

    /// Resolve a parsed block tag
    pub fn get_block_by_tag(&self, tag: BlockTag) -> Result<Option<Block>> {
        match tag {
            BlockTag::Latest => self.get_latest_block(),
            BlockTag::Number(number) => self.get_block_by_number(number),
            BlockTag::Hash(hash) => self.get_block_by_hash(hash),
        }
    }

    /// Head block number, 0 before any block
    pub fn get_latest_block_number(&self) -> Result<u64> {
        self.storage.head_number()
    }

    /// Head block
    pub fn get_latest_block(&self) -> Result<Option<Block>> {
        match self.storage.head()? {
            Some(details) => self.storage.get_block(details.hash),
            None => Ok(None),
        }
    }

    /// Block by number
    pub fn get_block_by_number(&self, number: u64) -> Result<Option<Block>> {
        self.storage.get_block_by_number(number)
    }

    /// Block by hash
    pub fn get_block_by_hash(&self, hash: H256) -> Result<Option<Block>> {
        self.storage.get_block(hash)
    }

    /// Submit an encoded transaction from a client
    pub async fn send_tx(&self, tx_bytes: Vec<u8>) -> Result<Option<H256>> {
        self.add_tx(tx_bytes, Vec::new()).await
    }

    /// Transactions waiting for the next block
    pub fn pending_tx_count(&self) -> Result<usize> {
        self.storage.pool_len()
    }

    /// Committed transaction by merkle hash
    pub fn get_tx_by_hash(&self, merkle_hash: H256) -> Result<Option<Transaction>> {
        self.storage.get_tx(merkle_hash)
    }

    /// Transaction that created a live output owned by `owner`
    pub fn get_tx_by_pos(
        &self,
        owner: Address,
        block_number: u64,
        tx_index: u32,
        output_index: u8,
    ) -> Result<Option<Transaction>> {
        self.storage.get_utxo(
            &owner,
            UtxoPosition::new(block_number, tx_index, output_index),
        )
    }

    /// Live outputs of `owner`
    pub fn get_utxos(&self, owner: Address) -> Result<Vec<Utxo>> {
        self.storage.get_utxos(&owner)
    }

    /// Inclusion proof for a committed transaction
    pub fn get_merkle_proof(
        &self,
        block_number: u64,
        tx_index: usize,
    ) -> Result<Option<MerkleProof>> {
        Ok(self
            .storage
            .get_block_by_number(block_number)?
            .and_then(|block| block.merkle_proof(tx_index)))
    }

    /// Stop the writer; pending requests already queued are served first
    pub async fn shutdown(&self) -> Result<()> {
        self.handle.shutdown().await
    }
}

//! Single-writer actor for the child chain
//!
//! Every mutation of the UTXO set, the block indices and the pool goes
//! through one task, so two transactions racing for the same input can
//! never both be admitted.
//!
//! ```text
//!   RPC / SyncManager / EventWatcher handlers
//!                     │
//!                     │ ChainHandle (Clone)
//!                     ▼
//!        mpsc::channel (bounded mailbox)
//!                     │
//!                     ▼
//!   ┌──────────────────────────────────────┐
//!   │          ChainActor (one task)        │
//!   │  add_tx / put_block / produce_block  │
//!   │  assign_block_number / mark_exited   │
//!   └──────────────────┬───────────────────┘
//!                      │ WriteBatch
//!                      ▼
//!                  Storage (RocksDB)
//! ```
//!
//! Reads bypass the actor and go straight to [`Storage`].

use crate::block::Block;
use crate::error::ValidationError;
use crate::metrics::Metrics;
use crate::root_chain::RootChain;
use crate::transaction::{Transaction, UtxoPosition};
use crate::txpool::TxPool;
use crate::{Error, Result, Storage};
use ethers::types::{Address, H256};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Newly admitted transaction, to be gossiped to peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxAnnouncement {
    /// Encoded transaction
    pub tx_bytes: Vec<u8>,
    /// Peer identities that must not receive it (the sender)
    pub excluded: Vec<String>,
}

/// Message sent to the chain actor
#[derive(Debug)]
pub enum ChainMessage {
    /// Admit a transfer transaction into the pool
    AddTx {
        tx_bytes: Vec<u8>,
        excluded: Vec<String>,
        response: oneshot::Sender<Result<Option<H256>>>,
    },

    /// Validate and commit a block
    PutBlock {
        block: Block,
        deposit: bool,
        response: oneshot::Sender<Result<()>>,
    },

    /// Drain the pool into a new block and submit its root
    ProduceBlock {
        response: oneshot::Sender<Result<Option<Block>>>,
    },

    /// Give a locally known root its root-chain block number
    AssignBlockNumber {
        root: H256,
        number: u64,
        response: oneshot::Sender<Result<bool>>,
    },

    /// Record an exit reported by the root chain
    MarkExited {
        owner: Address,
        position: UtxoPosition,
        response: oneshot::Sender<Result<()>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that owns every chain mutation
pub struct ChainActor {
    storage: Arc<Storage>,
    pool: TxPool,
    root_chain: Arc<dyn RootChain>,
    announcements: broadcast::Sender<TxAnnouncement>,
    metrics: Arc<Metrics>,
    mailbox: mpsc::Receiver<ChainMessage>,
}

impl ChainActor {
    /// Create new actor
    pub fn new(
        storage: Arc<Storage>,
        pool: TxPool,
        root_chain: Arc<dyn RootChain>,
        announcements: broadcast::Sender<TxAnnouncement>,
        metrics: Arc<Metrics>,
        mailbox: mpsc::Receiver<ChainMessage>,
    ) -> Self {
        Self {
            storage,
            pool,
            root_chain,
            announcements,
            metrics,
            mailbox,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                ChainMessage::Shutdown => break,
                msg => self.handle_message(msg).await,
            }
        }
        tracing::info!("Chain actor stopped");
    }

    async fn handle_message(&mut self, msg: ChainMessage) {
        match msg {
            ChainMessage::AddTx {
                tx_bytes,
                excluded,
                response,
            } => {
                let result = self.add_tx(tx_bytes, excluded).await;
                match &result {
                    Ok(Some(_)) => self.metrics.record_tx_accepted(),
                    Ok(None) | Err(_) => self.metrics.record_tx_rejected(),
                }
                let _ = response.send(result);
            }

            ChainMessage::PutBlock {
                block,
                deposit,
                response,
            } => {
                let _ = response.send(self.put_block(block, deposit));
            }

            ChainMessage::ProduceBlock { response } => {
                let _ = response.send(self.produce_block().await);
            }

            ChainMessage::AssignBlockNumber {
                root,
                number,
                response,
            } => {
                let _ = response.send(self.assign_block_number(root, number));
            }

            ChainMessage::MarkExited {
                owner,
                position,
                response,
            } => {
                let result = self.storage.mark_exited(&owner, position);
                if result.is_ok() {
                    tracing::info!(owner = ?owner, position = %position, "Output exited");
                }
                let _ = response.send(result);
            }

            ChainMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }

    /// Admit a transfer; `Ok(None)` is a silent rejection
    async fn add_tx(&mut self, tx_bytes: Vec<u8>, excluded: Vec<String>) -> Result<Option<H256>> {
        let tx = Transaction::decode(&tx_bytes)?;
        if tx.is_deposit() {
            return Err(ValidationError::Malformed(
                "deposits enter through the root chain".to_string(),
            )
            .into());
        }

        tx.validate(&*self.storage)?;
        tx.verify_signatures(&*self.storage)?;

        for (_, position) in tx.spent_inputs() {
            let owner = Transaction::resolve_input(&*self.storage, position)?.owner;

            if !self.storage.has_utxo(&owner, position)? {
                tracing::debug!(position = %position, "Input already spent");
                return Ok(None);
            }

            if self.storage.is_reserved(position)? {
                tracing::debug!(
                    position = %position,
                    "Input already claimed by a pending transaction"
                );
                return Ok(None);
            }

            match self.root_chain.is_exited(position).await {
                Ok(true) => {
                    self.storage.delete_utxo(&owner, position)?;
                    tracing::info!(position = %position, "Dropped UTXO exited on the root chain");
                    return Ok(None);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        position = %position,
                        error = %e,
                        "Exit check failed, admitting"
                    );
                }
            }
        }

        let merkle_hash = self.pool.push(&tx)?;
        // No subscribers is fine: the node may run without peers
        let _ = self.announcements.send(TxAnnouncement {
            tx_bytes: tx.encode(true),
            excluded,
        });

        tracing::debug!(merkle_hash = ?merkle_hash, "Transaction accepted");
        Ok(Some(merkle_hash))
    }

    fn put_block(&mut self, block: Block, deposit: bool) -> Result<()> {
        let number = block.number();

        if number != 0 {
            if let Some(existing) = self.storage.get_block_hash(number)? {
                if existing == block.hash() {
                    tracing::debug!(block_number = number, "Block already committed");
                    return Ok(());
                }
                return Err(Error::InvalidBlock {
                    number,
                    reason: ValidationError::Malformed(format!(
                        "conflicts with committed block {:?}",
                        existing
                    )),
                });
            }
        }

        block
            .validate(&*self.storage)
            .and_then(|()| self.check_spends(&block, deposit))
            .map_err(|e| match e {
                Error::Validation(reason) => Error::InvalidBlock { number, reason },
                other => other,
            })?;

        let started = Instant::now();
        self.storage.commit_block(&block, deposit)?;

        if number != 0 {
            self.metrics
                .record_block_committed(started.elapsed().as_secs_f64());
            self.metrics.set_txpool_size(self.pool.len()?);
            tracing::info!(
                block_number = number,
                hash = ?block.hash(),
                tx_count = block.transactions.len(),
                deposit,
                "Block committed"
            );
        }
        Ok(())
    }

    /// Deposit shape, input signatures and liveness of every spent input
    ///
    /// An input is live while its UTXO entry exists, or after a local exit
    /// marker as long as no committed block consumed it.
    fn check_spends(&self, block: &Block, deposit: bool) -> Result<()> {
        if deposit {
            if block.transactions.len() != 1 || !block.transactions[0].is_deposit() {
                return Err(ValidationError::Malformed(
                    "deposit block must hold exactly one deposit".to_string(),
                )
                .into());
            }
            return Ok(());
        }

        for tx in &block.transactions {
            if tx.is_deposit() {
                return Err(ValidationError::Malformed(
                    "deposit outside a deposit block".to_string(),
                )
                .into());
            }
            tx.verify_signatures(&*self.storage)?;

            for (_, position) in tx.spent_inputs() {
                if self.storage.is_spent(position)? {
                    return Err(ValidationError::SpentInput(position.to_string()).into());
                }
                let owner = Transaction::resolve_input(&*self.storage, position)?.owner;
                if !self.storage.has_utxo(&owner, position)?
                    && !self.storage.is_exited_locally(position)?
                {
                    return Err(ValidationError::SpentInput(position.to_string()).into());
                }
            }
        }
        Ok(())
    }

    async fn produce_block(&mut self) -> Result<Option<Block>> {
        self.retry_pending_submissions().await?;

        let drained = self.pool.drain_all()?;
        if drained.is_empty() {
            return Ok(None);
        }

        let mut transactions = Vec::with_capacity(drained.len());
        for tx in drained {
            match tx.validate(&*self.storage) {
                Ok(()) => transactions.push(tx),
                Err(e) => {
                    tracing::warn!(
                        merkle_hash = ?tx.merkle_hash(),
                        error = %e,
                        "Dropping invalid pooled transaction"
                    );
                    self.pool.release(&tx)?;
                }
            }
        }
        if transactions.is_empty() {
            return Ok(None);
        }

        let block = Block::new(0, transactions)?;
        let root = block.header.root;
        self.put_block(block.clone(), false)?;
        self.storage.add_pending_submission(root)?;
        self.metrics.set_txpool_size(self.pool.len()?);

        tracing::info!(root = ?root, tx_count = block.transactions.len(), "Block produced");
        self.submit(root).await;
        Ok(Some(block))
    }

    async fn retry_pending_submissions(&mut self) -> Result<()> {
        for root in self.storage.pending_submissions()? {
            match self.storage.get_block_by_root(root)? {
                Some(block) if block.number() == 0 => {
                    tracing::info!(root = ?root, "Retrying block submission");
                    self.submit(root).await;
                }
                _ => self.storage.remove_pending_submission(root)?,
            }
        }
        Ok(())
    }

    /// Submit a root; failures are logged and retried on the next trigger
    async fn submit(&mut self, root: H256) -> bool {
        let expected = match self.root_chain.current_child_block().await {
            Ok(number) => number,
            Err(e) => {
                tracing::warn!(root = ?root, error = %e, "Cannot read child block counter");
                return false;
            }
        };

        match self.root_chain.submit_block(root, expected).await {
            Ok(()) => {
                if let Err(e) = self.storage.remove_pending_submission(root) {
                    tracing::error!(root = ?root, error = %e, "Failed to clear pending submission");
                }
                self.metrics.record_block_submitted();
                tracing::info!(root = ?root, child_block = expected, "Block submitted");
                true
            }
            Err(e) => {
                tracing::warn!(root = ?root, error = %e, "Block submission failed, will retry");
                false
            }
        }
    }

    fn assign_block_number(&mut self, root: H256, number: u64) -> Result<bool> {
        let Some(mut block) = self.storage.get_block_by_root(root)? else {
            tracing::debug!(root = ?root, block_number = number, "Root not produced locally");
            return Ok(false);
        };

        if block.number() != 0 && block.number() != number {
            tracing::warn!(
                root = ?root,
                committed = block.number(),
                assigned = number,
                "Root already numbered, ignoring reassignment"
            );
            return Ok(false);
        }

        block.header.number = number;
        self.put_block(block, false)?;
        self.storage.remove_pending_submission(root)?;
        Ok(true)
    }
}

/// Handle for sending messages to the actor
#[derive(Clone, Debug)]
pub struct ChainHandle {
    sender: mpsc::Sender<ChainMessage>,
}

impl ChainHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<ChainMessage>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> ChainMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Admit a transaction
    pub async fn add_tx(&self, tx_bytes: Vec<u8>, excluded: Vec<String>) -> Result<Option<H256>> {
        self.request(|response| ChainMessage::AddTx {
            tx_bytes,
            excluded,
            response,
        })
        .await
    }

    /// Commit a block
    pub async fn put_block(&self, block: Block, deposit: bool) -> Result<()> {
        self.request(|response| ChainMessage::PutBlock {
            block,
            deposit,
            response,
        })
        .await
    }

    /// Produce and submit a block from the pool
    pub async fn produce_block(&self) -> Result<Option<Block>> {
        self.request(|response| ChainMessage::ProduceBlock { response })
            .await
    }

    /// Number a produced root
    pub async fn assign_block_number(&self, root: H256, number: u64) -> Result<bool> {
        self.request(|response| ChainMessage::AssignBlockNumber {
            root,
            number,
            response,
        })
        .await
    }

    /// Record an exit
    pub async fn mark_exited(&self, owner: Address, position: UtxoPosition) -> Result<()> {
        self.request(|response| ChainMessage::MarkExited {
            owner,
            position,
            response,
        })
        .await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(ChainMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the chain actor
pub fn spawn_chain_actor(
    storage: Arc<Storage>,
    pool: TxPool,
    root_chain: Arc<dyn RootChain>,
    announcements: broadcast::Sender<TxAnnouncement>,
    metrics: Arc<Metrics>,
) -> ChainHandle {
    let (tx, rx) = mpsc::channel(1000); // Bounded channel for backpressure
    let actor = ChainActor::new(storage, pool, root_chain, announcements, metrics, rx);

    tokio::spawn(async move {
        actor.run().await;
    });

    ChainHandle::new(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::root_chain::MockRootChain;
    use crate::transaction::{InputSlot, Output};
    use crate::Config;
    use ethers::types::U256;
    use tempfile::TempDir;

    struct Fixture {
        handle: ChainHandle,
        storage: Arc<Storage>,
        root_chain: Arc<MockRootChain>,
        announcements: broadcast::Receiver<TxAnnouncement>,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();

        let storage = Arc::new(Storage::open(&config).unwrap());
        let pool = TxPool::new(storage.clone()).unwrap();
        let root_chain = Arc::new(MockRootChain::new());
        let (sender, announcements) = broadcast::channel(16);
        let handle = spawn_chain_actor(
            storage.clone(),
            pool,
            root_chain.clone(),
            sender,
            Arc::new(Metrics::new().unwrap()),
        );
        Fixture {
            handle,
            storage,
            root_chain,
            announcements,
            _temp: temp,
        }
    }

    fn signed_spend(
        position: UtxoPosition,
        key: &KeyPair,
        to: Address,
        amount: u64,
    ) -> Transaction {
        let mut tx = Transaction::new(
            [position, UtxoPosition::NULL],
            [Output::new(to, U256::from(amount)), Output::default()],
            U256::zero(),
        );
        tx.sign(InputSlot::First, key).unwrap();
        tx
    }

    async fn fund(fx: &Fixture, owner: Address, amount: u64) -> UtxoPosition {
        let deposit = Transaction::deposit(owner, U256::from(amount));
        let number = fx.root_chain.deposit(&deposit).unwrap();
        let block = Block::new(number, vec![deposit]).unwrap();
        fx.handle.put_block(block, true).await.unwrap();
        UtxoPosition::new(number, 0, 0)
    }

    #[tokio::test]
    async fn test_actor_spawn_and_shutdown() {
        let fx = fixture();
        fx.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_tx_accepts_and_announces() {
        let mut fx = fixture();
        let alice = KeyPair::generate();
        let position = fund(&fx, alice.address(), 100).await;

        let tx = signed_spend(position, &alice, Address::repeat_byte(0xb0), 100);
        let hash = fx
            .handle
            .add_tx(tx.encode(true), vec!["10.0.0.9:4000".to_string()])
            .await
            .unwrap();
        assert_eq!(hash, Some(tx.merkle_hash()));

        let announcement = fx.announcements.recv().await.unwrap();
        assert_eq!(announcement.tx_bytes, tx.encode(true));
        assert_eq!(announcement.excluded, vec!["10.0.0.9:4000".to_string()]);

        // Second spend of the same input is silently refused
        let competing = signed_spend(position, &alice, Address::repeat_byte(0xc0), 100);
        assert_eq!(
            fx.handle.add_tx(competing.encode(true), vec![]).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_add_tx_rejections() {
        let fx = fixture();
        let alice = KeyPair::generate();
        let mallory = KeyPair::generate();
        let position = fund(&fx, alice.address(), 100).await;

        let deposit = Transaction::deposit(alice.address(), U256::one());
        assert!(matches!(
            fx.handle.add_tx(deposit.encode(true), vec![]).await,
            Err(Error::Validation(ValidationError::Malformed(_)))
        ));

        let forged = signed_spend(position, &mallory, mallory.address(), 100);
        assert!(matches!(
            fx.handle.add_tx(forged.encode(true), vec![]).await,
            Err(Error::Validation(ValidationError::InvalidSignature(0)))
        ));

        let greedy = signed_spend(position, &alice, alice.address(), 101);
        assert!(matches!(
            fx.handle.add_tx(greedy.encode(true), vec![]).await,
            Err(Error::Validation(ValidationError::InsufficientFunds { .. }))
        ));

        assert!(matches!(
            fx.handle.add_tx(vec![0x01, 0x02], vec![]).await,
            Err(Error::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_add_tx_drops_exited_input() {
        let fx = fixture();
        let alice = KeyPair::generate();
        let position = fund(&fx, alice.address(), 10).await;
        fx.root_chain.start_exit(alice.address(), position);

        let tx = signed_spend(position, &alice, Address::repeat_byte(1), 10);
        assert_eq!(fx.handle.add_tx(tx.encode(true), vec![]).await.unwrap(), None);
        assert!(!fx.storage.has_utxo(&alice.address(), position).unwrap());
    }

    #[tokio::test]
    async fn test_produce_submit_and_number() {
        let fx = fixture();
        let alice = KeyPair::generate();
        let bob = Address::repeat_byte(0xb0);
        let position = fund(&fx, alice.address(), 100).await;

        assert!(fx.handle.produce_block().await.unwrap().is_none());

        let tx = signed_spend(position, &alice, bob, 100);
        fx.handle.add_tx(tx.encode(true), vec![]).await.unwrap();

        let block = fx.handle.produce_block().await.unwrap().unwrap();
        assert_eq!(block.number(), 0);
        assert_eq!(fx.root_chain.submitted_roots(), vec![block.header.root]);
        assert!(fx.storage.pending_submissions().unwrap().is_empty());

        // Root chain numbered the block 2 (deposit took 1)
        assert!(fx.handle.assign_block_number(block.header.root, 2).await.unwrap());
        assert_eq!(fx.storage.head_number().unwrap(), 2);
        assert!(fx.storage.get_utxos(&alice.address()).unwrap().is_empty());
        assert_eq!(
            fx.storage.get_utxos(&bob).unwrap()[0].position,
            UtxoPosition::new(2, 0, 0)
        );
        assert!(!fx.storage.is_reserved(position).unwrap());

        // Replayed event is a no-op
        assert!(fx.handle.assign_block_number(block.header.root, 2).await.unwrap());
        assert!(!fx.handle.assign_block_number(block.header.root, 3).await.unwrap());
        assert!(!fx.handle.assign_block_number(H256::repeat_byte(1), 4).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_submission_is_retried() {
        let fx = fixture();
        let alice = KeyPair::generate();
        let position = fund(&fx, alice.address(), 5).await;
        let tx = signed_spend(position, &alice, Address::repeat_byte(2), 5);
        fx.handle.add_tx(tx.encode(true), vec![]).await.unwrap();

        fx.root_chain.set_fail_submissions(true);
        let block = fx.handle.produce_block().await.unwrap().unwrap();
        assert_eq!(
            fx.storage.pending_submissions().unwrap(),
            vec![block.header.root]
        );

        fx.root_chain.set_fail_submissions(false);
        assert!(fx.handle.produce_block().await.unwrap().is_none());
        assert_eq!(fx.root_chain.submitted_roots(), vec![block.header.root]);
        assert!(fx.storage.pending_submissions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_block_refuses_second_spend_of_an_output() {
        let fx = fixture();
        let alice = KeyPair::generate();
        let bob = Address::repeat_byte(0xb0);
        let carol = Address::repeat_byte(0xca);
        let position = fund(&fx, alice.address(), 100).await;

        let to_bob = signed_spend(position, &alice, bob, 100);
        fx.handle
            .put_block(Block::new(2, vec![to_bob]).unwrap(), false)
            .await
            .unwrap();

        let to_carol = signed_spend(position, &alice, carol, 100);
        assert!(matches!(
            fx.handle
                .put_block(Block::new(3, vec![to_carol]).unwrap(), false)
                .await,
            Err(Error::InvalidBlock {
                number: 3,
                reason: ValidationError::SpentInput(_)
            })
        ));
        assert!(fx.storage.get_block_by_number(3).unwrap().is_none());
        assert!(fx.storage.get_utxos(&carol).unwrap().is_empty());
        assert_eq!(fx.storage.get_utxos(&bob).unwrap().len(), 1);
        assert_eq!(fx.storage.head_number().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_put_block_checks_signatures_and_deposit_shape() {
        let fx = fixture();
        let alice = KeyPair::generate();
        let mallory = KeyPair::generate();
        let position = fund(&fx, alice.address(), 10).await;

        let forged = signed_spend(position, &mallory, mallory.address(), 10);
        assert!(matches!(
            fx.handle
                .put_block(Block::new(2, vec![forged]).unwrap(), false)
                .await,
            Err(Error::InvalidBlock {
                reason: ValidationError::InvalidSignature(0),
                ..
            })
        ));

        let minted = Transaction::deposit(mallory.address(), U256::from(1_000));
        let honest = signed_spend(position, &alice, alice.address(), 10);
        assert!(matches!(
            fx.handle
                .put_block(Block::new(2, vec![honest, minted]).unwrap(), false)
                .await,
            Err(Error::InvalidBlock {
                reason: ValidationError::Malformed(_),
                ..
            })
        ));
        assert!(fx.storage.get_utxos(&mallory.address()).unwrap().is_empty());
        assert!(fx.storage.has_utxo(&alice.address(), position).unwrap());
    }

    #[tokio::test]
    async fn test_put_block_rejects_invalid_and_conflicting() {
        let fx = fixture();
        let owner = Address::repeat_byte(7);
        fund(&fx, owner, 1).await;

        let mut bad_root = Block::new(5, vec![Transaction::deposit(owner, U256::one())]).unwrap();
        bad_root.header.root = H256::repeat_byte(3);
        assert!(matches!(
            fx.handle.put_block(bad_root, true).await,
            Err(Error::InvalidBlock {
                number: 5,
                reason: ValidationError::RootMismatch { .. }
            })
        ));
        assert!(fx.storage.get_block_by_number(5).unwrap().is_none());

        let conflicting = Block::new(1, vec![Transaction::deposit(owner, U256::from(2))]).unwrap();
        assert!(matches!(
            fx.handle.put_block(conflicting, true).await,
            Err(Error::InvalidBlock { number: 1, .. })
        ));
    }
}

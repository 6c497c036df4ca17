//! In-memory root chain
//!
//! Mines one root chain block per state-changing call and records the
//! matching contract event in it.

use super::{RootChain, RootChainEvent};
use crate::block::Block;
use crate::transaction::{Transaction, UtxoPosition};
use crate::{Error, Result};
use async_trait::async_trait;
use ethers::types::{Address, H256};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug)]
struct MockState {
    height: u64,
    next_child_block: u64,
    child_chain: BTreeMap<u64, (H256, u64)>,
    events: BTreeMap<u64, Vec<RootChainEvent>>,
    exits: HashSet<UtxoPosition>,
    fail_submissions: bool,
    fail_reads: bool,
    submitted: Vec<H256>,
}

impl MockState {
    fn mine(&mut self, event: Option<RootChainEvent>) -> u64 {
        self.height += 1;
        if let Some(event) = event {
            self.events.entry(self.height).or_default().push(event);
        }
        self.height
    }
}

/// Root chain simulated in memory
#[derive(Debug)]
pub struct MockRootChain {
    state: Mutex<MockState>,
}

impl Default for MockRootChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRootChain {
    /// Fresh chain at height 0 whose first child block is 1
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                height: 0,
                next_child_block: 1,
                child_chain: BTreeMap::new(),
                events: BTreeMap::new(),
                exits: HashSet::new(),
                fail_submissions: false,
                fail_reads: false,
                submitted: Vec::new(),
            }),
        }
    }

    /// Accept a deposit and emit `DepositBlockCreated`; returns the child block number
    pub fn deposit(&self, tx: &Transaction) -> Result<u64> {
        let root = Block::compute_root(std::slice::from_ref(tx))?;
        let mut state = self.state.lock();
        let block_number = state.next_child_block;
        state.next_child_block += 1;
        state.child_chain.insert(block_number, (root, now()));
        state.mine(Some(RootChainEvent::DepositBlockCreated {
            block_number,
            root,
            tx_bytes: tx.encode(true),
        }));
        Ok(block_number)
    }

    /// Start an exit and emit `StartExit`
    pub fn start_exit(&self, owner: Address, position: UtxoPosition) {
        let mut state = self.state.lock();
        state.exits.insert(position);
        state.mine(Some(RootChainEvent::StartExit { owner, position }));
    }

    /// Mine `count` empty blocks
    pub fn mine(&self, count: u64) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.mine(None);
        }
    }

    /// Make `submit_block` fail until reset
    pub fn set_fail_submissions(&self, fail: bool) {
        self.state.lock().fail_submissions = fail;
    }

    /// Make every read fail until reset
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Roots accepted so far, in submission order
    pub fn submitted_roots(&self) -> Vec<H256> {
        self.state.lock().submitted.clone()
    }

    fn check_reads(&self) -> Result<()> {
        if self.state.lock().fail_reads {
            return Err(Error::RootChain("mock RPC unavailable".to_string()));
        }
        Ok(())
    }
}

fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[async_trait]
impl RootChain for MockRootChain {
    async fn block_number(&self) -> Result<u64> {
        self.check_reads()?;
        Ok(self.state.lock().height)
    }

    async fn current_child_block(&self) -> Result<u64> {
        self.check_reads()?;
        Ok(self.state.lock().next_child_block)
    }

    async fn submit_block(&self, root: H256, expected_child_block: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_submissions {
            return Err(Error::RootChain("submission rejected".to_string()));
        }
        if expected_child_block != state.next_child_block {
            return Err(Error::RootChain(format!(
                "expected child block {}, contract is at {}",
                expected_child_block, state.next_child_block
            )));
        }
        let block_number = state.next_child_block;
        state.next_child_block += 1;
        state.child_chain.insert(block_number, (root, now()));
        state.submitted.push(root);
        state.mine(Some(RootChainEvent::ChildBlockCreated { block_number, root }));
        Ok(())
    }

    async fn get_child_chain(&self, block_number: u64) -> Result<Option<(H256, u64)>> {
        self.check_reads()?;
        Ok(self.state.lock().child_chain.get(&block_number).copied())
    }

    async fn is_exited(&self, position: UtxoPosition) -> Result<bool> {
        self.check_reads()?;
        Ok(self.state.lock().exits.contains(&position))
    }

    async fn events_in_block(&self, block_number: u64) -> Result<Vec<RootChainEvent>> {
        self.check_reads()?;
        Ok(self
            .state
            .lock()
            .events
            .get(&block_number)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    #[tokio::test]
    async fn test_deposit_and_submit_numbering() {
        let chain = MockRootChain::new();
        let tx = Transaction::deposit(Address::repeat_byte(1), U256::from(10));

        assert_eq!(chain.deposit(&tx).unwrap(), 1);
        assert_eq!(chain.current_child_block().await.unwrap(), 2);

        let root = H256::repeat_byte(5);
        assert!(chain.submit_block(root, 3).await.is_err());
        chain.submit_block(root, 2).await.unwrap();

        assert_eq!(chain.block_number().await.unwrap(), 2);
        assert_eq!(
            chain.events_in_block(2).await.unwrap(),
            vec![RootChainEvent::ChildBlockCreated {
                block_number: 2,
                root
            }]
        );
        assert_eq!(chain.get_child_chain(2).await.unwrap().map(|c| c.0), Some(root));
    }

    #[tokio::test]
    async fn test_exits_and_failures() {
        let chain = MockRootChain::new();
        let position = UtxoPosition::new(1, 0, 0);
        assert!(!chain.is_exited(position).await.unwrap());

        chain.start_exit(Address::repeat_byte(2), position);
        assert!(chain.is_exited(position).await.unwrap());

        chain.set_fail_submissions(true);
        assert!(chain.submit_block(H256::zero(), 1).await.is_err());

        chain.set_fail_reads(true);
        assert!(chain.block_number().await.is_err());
    }
}

//! Root chain collaborator
//!
//! The child chain only needs a narrow view of the root chain contract:
//! its height, the child block counter, root submission, exit lookups and
//! the events emitted in a given block.

mod eth;
mod mock;

pub use eth::EthRootChain;
pub use mock::MockRootChain;

use crate::transaction::UtxoPosition;
use crate::Result;
use async_trait::async_trait;
use ethers::types::{Address, H256};

/// Event name for [`RootChainEvent::ChildBlockCreated`]
pub const CHILD_BLOCK_CREATED: &str = "ChildBlockCreated";
/// Event name for [`RootChainEvent::DepositBlockCreated`]
pub const DEPOSIT_BLOCK_CREATED: &str = "DepositBlockCreated";
/// Event name for [`RootChainEvent::StartExit`]
pub const START_EXIT: &str = "StartExit";

/// Decoded root chain contract event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootChainEvent {
    /// An operator-submitted root received its child block number
    ChildBlockCreated {
        /// Assigned child block number
        block_number: u64,
        /// Submitted root
        root: H256,
    },
    /// A deposit was turned into a child block
    DepositBlockCreated {
        /// Assigned child block number
        block_number: u64,
        /// Root of the one-transaction deposit block
        root: H256,
        /// Encoded deposit transaction
        tx_bytes: Vec<u8>,
    },
    /// An exit was started for an output
    StartExit {
        /// Exiting owner
        owner: Address,
        /// Exiting output
        position: UtxoPosition,
    },
}

impl RootChainEvent {
    /// Contract event name, used as the dispatch key
    pub fn name(&self) -> &'static str {
        match self {
            RootChainEvent::ChildBlockCreated { .. } => CHILD_BLOCK_CREATED,
            RootChainEvent::DepositBlockCreated { .. } => DEPOSIT_BLOCK_CREATED,
            RootChainEvent::StartExit { .. } => START_EXIT,
        }
    }
}

/// Access to the root chain contract
#[async_trait]
pub trait RootChain: Send + Sync + std::fmt::Debug {
    /// Current root chain height
    async fn block_number(&self) -> Result<u64>;

    /// Number the contract will assign to the next submitted root
    async fn current_child_block(&self) -> Result<u64>;

    /// Submit a block root, expecting it to become `expected_child_block`
    async fn submit_block(&self, root: H256, expected_child_block: u64) -> Result<()>;

    /// Root and timestamp recorded for a child block
    async fn get_child_chain(&self, block_number: u64) -> Result<Option<(H256, u64)>>;

    /// True if an exit has been started for `position`
    async fn is_exited(&self, position: UtxoPosition) -> Result<bool>;

    /// Events emitted by the contract in one root chain block
    async fn events_in_block(&self, block_number: u64) -> Result<Vec<RootChainEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let event = RootChainEvent::StartExit {
            owner: Address::zero(),
            position: UtxoPosition::new(1, 0, 0),
        };
        assert_eq!(event.name(), "StartExit");
        assert_eq!(
            RootChainEvent::ChildBlockCreated {
                block_number: 1,
                root: H256::zero()
            }
            .name(),
            "ChildBlockCreated"
        );
    }
}

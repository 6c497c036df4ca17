//! Root chain access over JSON-RPC

use super::{RootChain, RootChainEvent};
use crate::config::RootChainConfig;
use crate::crypto::KeyPair;
use crate::transaction::UtxoPosition;
use crate::{Error, Result};
use async_trait::async_trait;
use ethers::abi::RawLog;
use ethers::contract::{abigen, EthLogDecode};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Filter, H256, U256, U64};
use std::sync::Arc;

abigen!(
    RootChainContract,
    r#"[
        function deposit(bytes txBytes) payable
        function submitBlock(bytes32 root, uint256 expectedChildBlock)
        function startExit(uint256 exitId, bytes txBytes, bytes proof, bytes sigs)
        function challengeExit(uint256 exitId, bytes txBytes, bytes proof, bytes sigs, bytes confirmSig)
        function getExit(uint256 exitId) view returns (address, uint256, uint256)
        function getChildChain(uint256 blockNumber) view returns (bytes32, uint256)
        function currentChildBlock() view returns (uint256)
        event ChildBlockCreated(uint256 blockNumber, bytes32 root)
        event DepositBlockCreated(uint256 blockNumber, bytes32 root, bytes txBytes)
        event StartExit(address indexed owner, uint256 blockNumber, uint256 txIndex, uint256 outputIndex)
    ]"#
);

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Root chain contract reached through an HTTP provider
#[derive(Debug)]
pub struct EthRootChain {
    provider: Provider<Http>,
    address: Address,
    reader: RootChainContract<Provider<Http>>,
    writer: Option<RootChainContract<SignerClient>>,
}

impl EthRootChain {
    /// Connect to the configured endpoint and contract
    ///
    /// Without an operator key the instance is read-only and
    /// `submit_block` fails.
    pub fn new(config: &RootChainConfig) -> Result<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| Error::Config(format!("Invalid root chain RPC URL: {}", e)))?;
        let address = config
            .contract_address
            .parse::<Address>()
            .map_err(|e| Error::Config(format!("Invalid contract address: {}", e)))?;

        let reader = RootChainContract::new(address, Arc::new(provider.clone()));
        let writer = match &config.operator_key {
            Some(key) => {
                let wallet = KeyPair::from_hex(key)?
                    .wallet()
                    .clone()
                    .with_chain_id(config.chain_id);
                tracing::info!(operator = ?wallet.address(), "Root chain operator configured");
                let client = SignerMiddleware::new(provider.clone(), wallet);
                Some(RootChainContract::new(address, Arc::new(client)))
            }
            None => None,
        };

        Ok(Self {
            provider,
            address,
            reader,
            writer,
        })
    }
}

fn rpc_error(context: &str, err: impl std::fmt::Display) -> Error {
    Error::RootChain(format!("{}: {}", context, err))
}

fn to_u64(value: U256, field: &str) -> Result<u64> {
    if value > U256::from(u64::MAX) {
        return Err(Error::RootChain(format!("{} {} exceeds u64", field, value)));
    }
    Ok(value.low_u64())
}

fn to_position(block_number: U256, tx_index: U256, output_index: U256) -> Result<UtxoPosition> {
    let tx_index = to_u64(tx_index, "txIndex")?;
    let output_index = to_u64(output_index, "outputIndex")?;
    Ok(UtxoPosition::new(
        to_u64(block_number, "blockNumber")?,
        u32::try_from(tx_index).map_err(|e| rpc_error("txIndex", e))?,
        u8::try_from(output_index).map_err(|e| rpc_error("outputIndex", e))?,
    ))
}

fn convert_event(event: RootChainContractEvents) -> Result<RootChainEvent> {
    Ok(match event {
        RootChainContractEvents::ChildBlockCreatedFilter(e) => RootChainEvent::ChildBlockCreated {
            block_number: to_u64(e.block_number, "blockNumber")?,
            root: H256::from(e.root),
        },
        RootChainContractEvents::DepositBlockCreatedFilter(e) => {
            RootChainEvent::DepositBlockCreated {
                block_number: to_u64(e.block_number, "blockNumber")?,
                root: H256::from(e.root),
                tx_bytes: e.tx_bytes.to_vec(),
            }
        }
        RootChainContractEvents::StartExitFilter(e) => RootChainEvent::StartExit {
            owner: e.owner,
            position: to_position(e.block_number, e.tx_index, e.output_index)?,
        },
    })
}

#[async_trait]
impl RootChain for EthRootChain {
    async fn block_number(&self) -> Result<u64> {
        let height = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| rpc_error("eth_blockNumber", e))?;
        Ok(height.as_u64())
    }

    async fn current_child_block(&self) -> Result<u64> {
        let value = self
            .reader
            .current_child_block()
            .call()
            .await
            .map_err(|e| rpc_error("currentChildBlock", e))?;
        to_u64(value, "currentChildBlock")
    }

    async fn submit_block(&self, root: H256, expected_child_block: u64) -> Result<()> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| Error::RootChain("No operator key configured".to_string()))?;

        let call = writer.submit_block(root.to_fixed_bytes(), U256::from(expected_child_block));
        let pending = call
            .send()
            .await
            .map_err(|e| rpc_error("submitBlock", e))?;
        let receipt = pending
            .await
            .map_err(|e| rpc_error("submitBlock receipt", e))?
            .ok_or_else(|| Error::RootChain("submitBlock transaction dropped".to_string()))?;

        if receipt.status == Some(U64::zero()) {
            return Err(Error::RootChain(format!(
                "submitBlock reverted in tx {:?}",
                receipt.transaction_hash
            )));
        }

        tracing::info!(
            root = ?root,
            child_block = expected_child_block,
            tx_hash = ?receipt.transaction_hash,
            "Block root submitted"
        );
        Ok(())
    }

    async fn get_child_chain(&self, block_number: u64) -> Result<Option<(H256, u64)>> {
        let (root, timestamp) = self
            .reader
            .get_child_chain(U256::from(block_number))
            .call()
            .await
            .map_err(|e| rpc_error("getChildChain", e))?;
        let root = H256::from(root);
        if root.is_zero() {
            return Ok(None);
        }
        Ok(Some((root, to_u64(timestamp, "timestamp")?)))
    }

    async fn is_exited(&self, position: UtxoPosition) -> Result<bool> {
        let (owner, _amount, _position) = self
            .reader
            .get_exit(position.exit_id())
            .call()
            .await
            .map_err(|e| rpc_error("getExit", e))?;
        Ok(!owner.is_zero())
    }

    async fn events_in_block(&self, block_number: u64) -> Result<Vec<RootChainEvent>> {
        let filter = Filter::new()
            .address(self.address)
            .from_block(block_number)
            .to_block(block_number);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| rpc_error("eth_getLogs", e))?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let raw = RawLog {
                topics: log.topics.clone(),
                data: log.data.to_vec(),
            };
            match RootChainContractEvents::decode_log(&raw) {
                Ok(event) => match convert_event(event) {
                    Ok(event) => events.push(event),
                    Err(e) => tracing::warn!(block_number, error = %e, "Skipping malformed event"),
                },
                Err(_) => {
                    tracing::debug!(block_number, topics = ?log.topics, "Ignoring unknown log")
                }
            }
        }
        Ok(events)
    }
}

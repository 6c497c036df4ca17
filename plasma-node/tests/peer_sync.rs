//! Two nodes on loopback filling gaps over REQ:BLOCKS / RES:BLOCKS and
//! relaying ADD:TX

use ethers::types::U256;
use plasma_node::{
    crypto::KeyPair, root_chain::MockRootChain, transaction::InputSlot, Block, Config, Node,
    Output, Transaction, UtxoPosition,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn peer_config(temp_dir: &TempDir, peers: Vec<String>) -> Config {
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    config.network.listen_host = "127.0.0.1".to_string();
    config.network.external_host = "127.0.0.1".to_string();
    config.network.port = 0;
    config.network.peers = peers;
    config.network.maintenance_interval_ms = 50;
    // Keep the watchers out of the way; blocks arrive through peers only
    config.root_chain.start_block = u64::MAX / 2;
    config
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn test_two_nodes_converge_and_relay() {
    let root_chain = Arc::new(MockRootChain::new());
    let alice = KeyPair::generate();

    // Four deposit blocks known to the root chain
    let deposits: Vec<Transaction> = (1u64..=4)
        .map(|i| Transaction::deposit(alice.address(), U256::from(i * 10)))
        .collect();
    let blocks: Vec<Block> = deposits
        .iter()
        .map(|tx| {
            let number = root_chain.deposit(tx).unwrap();
            Block::new(number, vec![tx.clone()]).unwrap()
        })
        .collect();

    // B holds blocks 2 to 4
    let temp_b = TempDir::new().unwrap();
    let node_b = Node::open(peer_config(&temp_b, vec![]), root_chain.clone())
        .await
        .unwrap();
    for block in &blocks[1..] {
        node_b.chain().put_block(block.clone()).await.unwrap();
    }
    let addr_b = node_b.start().await.unwrap();

    // A holds blocks 1 and 3 and knows B; block 2 is a gap below its head
    let temp_a = TempDir::new().unwrap();
    let node_a = Node::open(
        peer_config(&temp_a, vec![format!("127.0.0.1:{}", addr_b.port())]),
        root_chain.clone(),
    )
    .await
    .unwrap();
    for block in [&blocks[0], &blocks[2]] {
        node_a.chain().put_block(block.clone()).await.unwrap();
    }
    assert_eq!(node_a.chain().get_latest_block_number().unwrap(), 3);
    assert_eq!(node_a.chain().storage().contiguous_through().unwrap(), 1);
    node_a.start().await.unwrap();

    let chain_a = node_a.chain().clone();
    let converged = eventually(|| {
        let chain_a = chain_a.clone();
        async move { chain_a.storage().contiguous_through().unwrap() == 4 }
    })
    .await;
    assert!(converged, "node A never filled its gap");

    assert_eq!(chain_a.get_latest_block_number().unwrap(), 4);
    for block in &blocks[1..] {
        let synced = chain_a.get_block_by_number(block.number()).unwrap().unwrap();
        assert_eq!(synced.encode(), block.encode());
    }
    assert_eq!(node_b.chain().get_latest_block_number().unwrap(), 4);
    assert_eq!(chain_a.get_utxos(alice.address()).unwrap().len(), 4);

    // B fetched block 1 from A the same way
    let chain_b = node_b.chain().clone();
    let filled = eventually(|| {
        let chain_b = chain_b.clone();
        async move { chain_b.storage().contiguous_through().unwrap() == 4 }
    })
    .await;
    assert!(filled, "node B never fetched block 1");

    // B learned about A from its messages
    let identity_a = node_a.sync().identity();
    let known = eventually(|| {
        let ids = node_b.sync().peer_ids();
        let identity_a = identity_a.clone();
        async move { ids.contains(&identity_a) }
    })
    .await;
    assert!(known, "node B never registered node A");

    // A transaction sent to A reaches B's pool
    let mut spend = Transaction::new(
        [UtxoPosition::new(3, 0, 0), UtxoPosition::NULL],
        [Output::new(alice.address(), U256::from(30)), Output::default()],
        U256::zero(),
    );
    spend.sign(InputSlot::First, &alice).unwrap();
    assert!(chain_a.send_tx(spend.encode(true)).await.unwrap().is_some());

    let relayed = eventually(|| {
        let chain_b = chain_b.clone();
        async move { chain_b.pending_tx_count().unwrap() == 1 }
    })
    .await;
    assert!(relayed, "transaction never reached node B");

    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();
}

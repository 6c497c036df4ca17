//! End-to-end flow against the in-memory root chain:
//! deposit → transfer → block submission → numbering → exit

use ethers::types::{Address, U256};
use plasma_node::{
    crypto::KeyPair, root_chain::MockRootChain, root_chain::RootChain, transaction::InputSlot,
    Config, Node, Output, Transaction, UtxoPosition,
};
use std::sync::Arc;
use tempfile::TempDir;

async fn operator_node(root_chain: Arc<MockRootChain>) -> (Node, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    config.chain.authority = true;
    config.chain.block_interval = 1;
    config.network.listen_host = "127.0.0.1".to_string();
    config.network.port = 0;
    let node = Node::open(config, root_chain).await.unwrap();
    (node, temp_dir)
}

#[tokio::test]
async fn test_deposit_transfer_exit() {
    let root_chain = Arc::new(MockRootChain::new());
    let (node, _temp) = operator_node(root_chain.clone()).await;
    let chain = node.chain().clone();
    let watcher = node.watcher().clone();

    let alice = KeyPair::generate();
    let bob = KeyPair::generate();

    // Deposit 100 to alice: child block 1
    let deposit = Transaction::deposit(alice.address(), U256::from(100));
    assert_eq!(root_chain.deposit(&deposit).unwrap(), 1);
    watcher.poll_once().await.unwrap();

    let utxos = chain.get_utxos(alice.address()).unwrap();
    assert_eq!(utxos.len(), 1);
    assert_eq!(utxos[0].position, UtxoPosition::new(1, 0, 0));
    assert_eq!(utxos[0].output.amount, U256::from(100));
    assert!(chain.storage().head().unwrap().unwrap().deposit);

    // Alice pays bob 100
    let mut transfer = Transaction::new(
        [UtxoPosition::new(1, 0, 0), UtxoPosition::NULL],
        [Output::new(bob.address(), U256::from(100)), Output::default()],
        U256::zero(),
    );
    transfer.sign(InputSlot::First, &alice).unwrap();
    let hash = chain.send_tx(transfer.encode(true)).await.unwrap();
    assert_eq!(hash, Some(transfer.merkle_hash()));
    assert_eq!(chain.pending_tx_count().unwrap(), 1);

    // Next root chain block triggers production and submission
    root_chain.mine(1);
    watcher.poll_once().await.unwrap();
    assert_eq!(root_chain.submitted_roots().len(), 1);
    assert_eq!(chain.pending_tx_count().unwrap(), 0);

    // ChildBlockCreated numbers the block 2
    watcher.poll_once().await.unwrap();
    assert_eq!(chain.get_latest_block_number().unwrap(), 2);
    assert!(chain.get_utxos(alice.address()).unwrap().is_empty());
    let bob_utxos = chain.get_utxos(bob.address()).unwrap();
    assert_eq!(bob_utxos.len(), 1);
    assert_eq!(bob_utxos[0].position, UtxoPosition::new(2, 0, 0));
    assert_eq!(
        chain.get_tx_by_hash(transfer.merkle_hash()).unwrap(),
        Some(transfer.clone())
    );

    // Proof and confirmation for an exit
    let (committed_root, _) = root_chain.get_child_chain(2).await.unwrap().unwrap();
    let proof = chain.get_merkle_proof(2, 0).unwrap().unwrap();
    assert_eq!(proof.root, committed_root);
    assert_eq!(proof.leaf, transfer.merkle_hash());
    assert!(proof.verify());
    let confirmation = transfer.confirm_signature(committed_root, &alice).unwrap();
    assert_eq!(
        confirmation.recover(transfer.confirmation_hash(committed_root)),
        Some(alice.address())
    );

    // Double spend of the consumed deposit is silently refused
    let mut replay = Transaction::new(
        [UtxoPosition::new(1, 0, 0), UtxoPosition::NULL],
        [Output::new(alice.address(), U256::from(100)), Output::default()],
        U256::zero(),
    );
    replay.sign(InputSlot::First, &alice).unwrap();
    assert_eq!(chain.send_tx(replay.encode(true)).await.unwrap(), None);

    // Bob exits his output on the root chain
    root_chain.start_exit(bob.address(), UtxoPosition::new(2, 0, 0));
    watcher.poll_once().await.unwrap();
    assert!(chain.get_utxos(bob.address()).unwrap().is_empty());
    assert!(chain
        .storage()
        .is_exited_locally(UtxoPosition::new(2, 0, 0))
        .unwrap());

    // Replaying every event from scratch changes nothing
    chain.storage().set_watcher_cursor(0).unwrap();
    watcher.poll_once().await.unwrap();
    assert_eq!(chain.get_latest_block_number().unwrap(), 2);
    assert!(chain.get_utxos(bob.address()).unwrap().is_empty());
    assert!(chain.get_utxos(alice.address()).unwrap().is_empty());

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_node_start_and_stop() {
    let root_chain = Arc::new(MockRootChain::new());
    let (node, _temp) = operator_node(root_chain.clone()).await;

    let addr = node.start().await.unwrap();
    assert_ne!(addr.port(), 0);
    assert_eq!(node.sync().identity(), format!("127.0.0.1:{}", addr.port()));

    node.stop().await.unwrap();

    // Listener is closed after stop
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_submission_failure_recovers() {
    let root_chain = Arc::new(MockRootChain::new());
    let (node, _temp) = operator_node(root_chain.clone()).await;
    let chain = node.chain().clone();
    let watcher = node.watcher().clone();

    let alice = KeyPair::generate();
    root_chain
        .deposit(&Transaction::deposit(alice.address(), U256::from(3)))
        .unwrap();
    watcher.poll_once().await.unwrap();

    let mut tx = Transaction::new(
        [UtxoPosition::new(1, 0, 0), UtxoPosition::NULL],
        [Output::new(Address::repeat_byte(0xcc), U256::from(3)), Output::default()],
        U256::zero(),
    );
    tx.sign(InputSlot::First, &alice).unwrap();
    chain.send_tx(tx.encode(true)).await.unwrap();

    root_chain.set_fail_submissions(true);
    root_chain.mine(1);
    watcher.poll_once().await.unwrap();
    assert!(root_chain.submitted_roots().is_empty());
    assert_eq!(chain.storage().pending_submissions().unwrap().len(), 1);

    // Next trigger resubmits the same root
    root_chain.set_fail_submissions(false);
    root_chain.mine(1);
    watcher.poll_once().await.unwrap();
    watcher.poll_once().await.unwrap();
    assert_eq!(root_chain.submitted_roots().len(), 1);
    assert_eq!(chain.get_latest_block_number().unwrap(), 2);
    assert!(chain.storage().pending_submissions().unwrap().is_empty());

    node.stop().await.unwrap();
}

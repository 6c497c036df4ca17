//! Peer-to-peer block and transaction exchange
//!
//! Every node listens for line-delimited JSON messages and keeps one
//! outbound connection per known peer. A message from an unknown sender
//! registers that sender, so replies always travel over our own outbound
//! connection to the sender's advertised `host:port`.
//!
//! ```text
//!  TcpListener ──► reader task per socket ──► inbound mpsc ──► dispatcher
//!                                                               │
//!        Chain (add_tx / import_blocks / reads) ◄──────────────┘
//!                │ broadcast (TxAnnouncement)
//!                ▼
//!            relay task ──► Peer::send ──► outbound TcpStream
//! ```

mod message;
mod peer;

pub use message::{Message, Payload};
pub use peer::{Peer, PeerState};

use crate::config::NetworkConfig;
use crate::{Chain, Error, Result};
use dashmap::DashMap;
use ethers::types::Bytes;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

/// Longest accepted message line
const MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;
const INBOUND_CAPACITY: usize = 1024;

/// Registry of peers plus the protocol driving them
pub struct SyncManager {
    chain: Arc<Chain>,
    config: NetworkConfig,
    identity: RwLock<String>,
    peers: DashMap<String, Arc<Peer>>,
    next_generation: AtomicU64,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("identity", &*self.identity.read())
            .field("peers", &self.peers.len())
            .finish()
    }
}

impl SyncManager {
    /// Create a stopped manager
    pub fn new(chain: Arc<Chain>, config: NetworkConfig) -> Self {
        let identity = format!("{}:{}", config.external_host, config.port);
        Self {
            chain,
            config,
            identity: RwLock::new(identity),
            peers: DashMap::new(),
            next_generation: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Identity advertised in the `from` field
    pub fn identity(&self) -> String {
        self.identity.read().clone()
    }

    /// Bind the listener and start the background tasks; returns the bound
    /// address
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let bind = format!("{}:{}", self.config.listen_host, self.config.port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| Error::Network(format!("Failed to bind {}: {}", bind, e)))?;
        let local_addr = listener.local_addr()?;
        *self.identity.write() = format!("{}:{}", self.config.external_host, local_addr.port());

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let accept = tokio::spawn(accept_loop(listener, inbound_tx, self.cancel.clone()));
        let dispatch = tokio::spawn(self.clone().dispatch_loop(inbound_rx));
        let maintenance = tokio::spawn(self.clone().maintenance_loop());
        let relay = tokio::spawn(self.clone().relay_loop());
        self.tasks.lock().extend([accept, dispatch, maintenance, relay]);

        tracing::info!(addr = %local_addr, identity = %self.identity(), "P2P listening");
        Ok(local_addr)
    }

    /// Cancel every task, close every peer and the listener
    pub async fn stop(&self) {
        self.cancel.cancel();
        for peer in self.peers.iter() {
            peer.close();
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Sync task ended abnormally");
            }
        }
        self.peers.clear();
        tracing::info!("Sync manager stopped");
    }

    /// Known peer identities
    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Identities of peers with a live connection
    pub fn connected_peers(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|entry| entry.value().state() == PeerState::Connected)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Register `id`, dialing it unless a live entry already exists
    pub fn add_peer(&self, id: &str) -> Option<Arc<Peer>> {
        if !is_valid_identity(id) || id == self.identity() {
            return None;
        }
        if let Some(existing) = self.peers.get(id) {
            if !existing.is_closed() {
                return Some(existing.clone());
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let peer = Arc::new(Peer::connect(
            id.to_string(),
            generation,
            self.cancel.child_token(),
        ));
        if let Some(replaced) = self.peers.insert(id.to_string(), peer.clone()) {
            replaced.close();
        }
        tracing::debug!(peer = %id, generation, "Peer registered");
        Some(peer)
    }

    /// Drop closed peers from the registry
    pub fn prune(&self) {
        self.peers.retain(|id, peer| {
            let keep = !peer.is_closed();
            if !keep {
                tracing::debug!(peer = %id, "Pruning closed peer");
            }
            keep
        });
    }

    /// Send `payload` to every peer not in `excluded`; returns how many
    /// peers it was queued for
    pub fn broadcast_message(&self, payload: Payload, excluded: &[String]) -> Result<usize> {
        let line = Message::new(self.identity(), payload).encode()?;
        let mut sent = 0;
        for entry in self.peers.iter() {
            if excluded.iter().any(|id| id == entry.key()) {
                continue;
            }
            if entry.value().send(line.clone()) {
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Gossip an admitted transaction
    pub fn broadcast_new_tx(&self, tx_bytes: Vec<u8>, excluded: &[String]) -> Result<usize> {
        self.broadcast_message(Payload::AddTx(Bytes::from(tx_bytes)), excluded)
    }

    fn send_to(&self, id: &str, payload: Payload) -> Result<()> {
        let line = Message::new(self.identity(), payload).encode()?;
        match self.add_peer(id) {
            Some(peer) if peer.send(line) => Ok(()),
            _ => Err(Error::Network(format!("Peer {} unavailable", id))),
        }
    }

    /// Apply one inbound message
    pub async fn handle_message(&self, message: Message) {
        let from = message.from;
        if from == self.identity() || self.add_peer(&from).is_none() {
            tracing::debug!(peer = %from, "Ignoring message from invalid sender");
            return;
        }
        tracing::debug!(peer = %from, kind = message.payload.kind(), "Peer message");

        let result = match message.payload {
            Payload::Ping => Ok(()),
            Payload::ReqPeers => {
                let peers = self.peer_ids().into_iter().filter(|id| *id != from).collect();
                self.send_to(&from, Payload::ResPeers(peers))
            }
            Payload::ResPeers(peers) => {
                for id in peers {
                    self.add_peer(&id);
                }
                Ok(())
            }
            Payload::ReqBlocks(start) => self.serve_blocks(&from, start),
            Payload::ResBlocks(encoded) => {
                let mut blocks = Vec::with_capacity(encoded.len());
                for bytes in encoded {
                    match crate::block::Block::decode(&bytes) {
                        Ok(block) => blocks.push(block),
                        Err(e) => {
                            tracing::debug!(peer = %from, error = %e, "Skipping undecodable block")
                        }
                    }
                }
                let applied = self.chain.import_blocks(blocks).await;
                if applied > 0 {
                    tracing::info!(peer = %from, applied, "Blocks synced from peer");
                }
                Ok(())
            }
            Payload::AddTx(tx) => self
                .chain
                .add_tx(tx.to_vec(), vec![from.clone()])
                .await
                .map(|_| ()),
        };

        if let Err(e) = result {
            tracing::debug!(peer = %from, error = %e, "Peer message not applied");
        }
    }

    fn serve_blocks(&self, to: &str, start: u64) -> Result<()> {
        let window = self.config.blocks_per_request;
        let mut blocks = Vec::new();
        for number in start..start.saturating_add(window) {
            if let Some(block) = self.chain.get_block_by_number(number)? {
                blocks.push(Bytes::from(block.encode()));
            }
        }
        tracing::debug!(peer = %to, start, count = blocks.len(), "Serving blocks");
        self.send_to(to, Payload::ResBlocks(blocks))
    }

    /// One maintenance pass
    pub async fn maintain(&self) {
        self.prune();
        for id in &self.config.peers {
            self.add_peer(id);
        }
        if let Err(e) = self.broadcast_message(Payload::Ping, &[]) {
            tracing::warn!(error = %e, "Ping broadcast failed");
        }
        self.chain
            .metrics()
            .set_peers_connected(self.connected_peers().len());

        if let Err(e) = self.sync_check().await {
            tracing::warn!(error = %e, "Sync check failed");
        }
    }

    /// Ask a few random peers for the lowest missing block and those after
    /// it when the root chain knows of more
    ///
    /// Starts from the contiguous mark rather than the head, so a block
    /// skipped while deposits kept arriving is still fetched.
    pub async fn sync_check(&self) -> Result<()> {
        let next = self.chain.storage().contiguous_through()?.saturating_add(1);
        let current = self.chain.root_chain().current_child_block().await?;
        if next >= current {
            return Ok(());
        }

        let targets: Vec<String> = {
            let connected = self.connected_peers();
            connected
                .choose_multiple(&mut rand::thread_rng(), self.config.sync_fanout)
                .cloned()
                .collect()
        };
        if targets.is_empty() {
            return Ok(());
        }

        tracing::debug!(next, current, peers = ?targets, "Requesting missing blocks");
        for id in targets {
            self.send_to(&id, Payload::ReqBlocks(next))?;
        }
        Ok(())
    }

    async fn dispatch_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<String>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = inbound.recv() => {
                    let Some(line) = line else { break };
                    match Message::decode(&line) {
                        Ok(message) => self.handle_message(message).await,
                        Err(e) => tracing::debug!(error = %e, "Dropping malformed peer message"),
                    }
                }
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut interval =
            time::interval(Duration::from_millis(self.config.maintenance_interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => self.maintain().await,
            }
        }
    }

    async fn relay_loop(self: Arc<Self>) {
        let mut announcements = BroadcastStream::new(self.chain.subscribe_txs());
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = announcements.next() => match next {
                    Some(Ok(announcement)) => {
                        if let Err(e) =
                            self.broadcast_new_tx(announcement.tx_bytes, &announcement.excluded)
                        {
                            tracing::warn!(error = %e, "Transaction broadcast failed");
                        }
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        tracing::warn!(skipped, "Transaction relay lagged");
                    }
                    None => break,
                },
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbound: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "P2P accept failed");
                    continue;
                }
            },
        };
        tokio::spawn(read_lines(stream, remote_addr, inbound.clone(), cancel.clone()));
    }
}

async fn read_lines(
    stream: TcpStream,
    remote_addr: SocketAddr,
    inbound: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next() => line,
        };
        match line {
            Some(Ok(line)) => {
                if inbound.send(line).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::debug!(remote = %remote_addr, error = %e, "Dropping inbound connection");
                break;
            }
            None => break,
        }
    }
}

fn is_valid_identity(id: &str) -> bool {
    match id.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().map_or(false, |p| p != 0),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::root_chain::MockRootChain;
    use crate::{Block, Config, Transaction};
    use ethers::types::{Address, U256};
    use tempfile::TempDir;

    async fn manager() -> (Arc<SyncManager>, TempDir) {
        let temp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        config.network.listen_host = "127.0.0.1".to_string();
        config.network.port = 0;
        let network = config.network.clone();
        let chain = Chain::open(config, Arc::new(MockRootChain::new())).await.unwrap();
        (Arc::new(SyncManager::new(Arc::new(chain), network)), temp)
    }

    #[test]
    fn test_identity_validation() {
        assert!(is_valid_identity("127.0.0.1:30303"));
        assert!(is_valid_identity("node.example:1"));
        assert!(!is_valid_identity("127.0.0.1"));
        assert!(!is_valid_identity(":30303"));
        assert!(!is_valid_identity("host:0"));
        assert!(!is_valid_identity("host:99999"));
    }

    #[tokio::test]
    async fn test_registry_ignores_self_and_invalid() {
        let (sync, _temp) = manager().await;
        let own = sync.identity();
        assert!(sync.add_peer(&own).is_none());
        assert!(sync.add_peer("garbage").is_none());

        let first = sync.add_peer("127.0.0.1:1").unwrap();
        let again = sync.add_peer("127.0.0.1:1").unwrap();
        assert_eq!(first.generation(), again.generation());
        assert_eq!(sync.peer_ids(), vec!["127.0.0.1:1".to_string()]);
        sync.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_respects_exclusion() {
        let (sync, _temp) = manager().await;
        sync.add_peer("127.0.0.1:1");
        sync.add_peer("127.0.0.1:2");

        let sent = sync
            .broadcast_new_tx(vec![0xc0], &["127.0.0.1:1".to_string()])
            .unwrap();
        assert!(sent <= 1);
        sync.stop().await;
    }

    #[tokio::test]
    async fn test_forged_blocks_from_peer_are_refused() {
        let (sync, _temp) = manager().await;
        let mallory = Address::repeat_byte(0x66);
        let forged = Block::new(
            999,
            vec![Transaction::deposit(mallory, U256::exp10(30))],
        )
        .unwrap();

        sync.handle_message(Message::new(
            "127.0.0.1:7".to_string(),
            Payload::ResBlocks(vec![Bytes::from(forged.encode())]),
        ))
        .await;

        assert_eq!(sync.chain.get_latest_block_number().unwrap(), 0);
        assert!(sync.chain.get_block_by_number(999).unwrap().is_none());
        assert!(sync.chain.get_utxos(mallory).unwrap().is_empty());
        sync.stop().await;
    }

    #[tokio::test]
    async fn test_start_binds_and_receives_ping() {
        let (sync, _temp) = manager().await;
        let addr = sync.start().await.unwrap();
        assert_eq!(sync.identity(), format!("127.0.0.1:{}", addr.port()));

        // A remote that only pings gets registered
        let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_id = remote.local_addr().unwrap().to_string();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let line = Message::new(remote_id.clone(), Payload::Ping).encode().unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut stream, format!("{}\n", line).as_bytes())
            .await
            .unwrap();

        for _ in 0..100 {
            if sync.peer_ids().contains(&remote_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(sync.peer_ids().contains(&remote_id));
        sync.stop().await;
    }
}

//! Node composition: chain, root chain watcher and peer sync

use crate::event_watcher::EventWatcher;
use crate::root_chain::RootChain;
use crate::sync::SyncManager;
use crate::{Chain, Config, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running child chain node
#[derive(Debug)]
pub struct Node {
    chain: Arc<Chain>,
    watcher: Arc<EventWatcher>,
    sync: Arc<SyncManager>,
    cancel: CancellationToken,
    watcher_task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Open storage and wire the components; nothing runs until `start`
    pub async fn open(config: Config, root_chain: Arc<dyn RootChain>) -> Result<Self> {
        let network = config.network.clone();
        let start_block = config.root_chain.start_block;
        let poll_interval = Duration::from_millis(config.root_chain.poll_interval_ms);

        let chain = Arc::new(Chain::open(config, root_chain.clone()).await?);

        let mut watcher = EventWatcher::new(
            root_chain,
            chain.storage().clone(),
            chain.metrics().clone(),
            start_block,
            poll_interval,
        );
        chain.register_handlers(&mut watcher);

        let sync = Arc::new(SyncManager::new(chain.clone(), network));

        Ok(Self {
            chain,
            watcher: Arc::new(watcher),
            sync,
            cancel: CancellationToken::new(),
            watcher_task: Mutex::new(None),
        })
    }

    /// Start polling the root chain and serving peers; returns the P2P
    /// listen address
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = self.sync.start().await?;
        let task = self.watcher.clone().spawn(self.cancel.child_token());
        *self.watcher_task.lock() = Some(task);
        tracing::info!(p2p = %addr, identity = %self.sync.identity(), "Node started");
        Ok(addr)
    }

    /// Stop both loops, close the listener and stop the chain writer
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        self.sync.stop().await;

        let task = self.watcher_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Event watcher ended abnormally");
            }
        }

        self.chain.shutdown().await?;
        tracing::info!("Node stopped");
        Ok(())
    }

    /// Chain engine
    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    /// Peer sync
    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    /// Root chain watcher
    pub fn watcher(&self) -> &Arc<EventWatcher> {
        &self.watcher
    }
}

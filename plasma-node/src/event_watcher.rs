//! Root chain block and event dispatch
//!
//! Each tick reads the root chain height and walks every unseen block in
//! order. For each block the "new block" handlers run first, then every
//! contract event in that block goes to the handlers registered under its
//! name. The cursor is persisted only after a block has been fully
//! dispatched, so a crash replays the block instead of skipping it. Handlers
//! must therefore tolerate replays.

use crate::metrics::Metrics;
use crate::root_chain::{RootChain, RootChainEvent};
use crate::{Result, Storage};
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

type BlockHandler = Arc<dyn Fn(u64) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type EventHandler = Arc<dyn Fn(RootChainEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Polls the root chain and dispatches what it finds
pub struct EventWatcher {
    root_chain: Arc<dyn RootChain>,
    storage: Arc<Storage>,
    metrics: Arc<Metrics>,
    start_block: u64,
    poll_interval: Duration,
    block_handlers: Vec<BlockHandler>,
    event_handlers: HashMap<String, Vec<EventHandler>>,
}

impl std::fmt::Debug for EventWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWatcher")
            .field("start_block", &self.start_block)
            .field("poll_interval", &self.poll_interval)
            .field("block_handlers", &self.block_handlers.len())
            .field("events", &self.event_handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EventWatcher {
    /// Create a watcher that begins at `start_block` when no cursor is stored
    pub fn new(
        root_chain: Arc<dyn RootChain>,
        storage: Arc<Storage>,
        metrics: Arc<Metrics>,
        start_block: u64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            root_chain,
            storage,
            metrics,
            start_block,
            poll_interval,
            block_handlers: Vec::new(),
            event_handlers: HashMap::new(),
        }
    }

    /// Register a handler called with every new root chain block number
    pub fn on_block<F, Fut>(&mut self, handler: F)
    where
        F: Fn(u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.block_handlers
            .push(Arc::new(move |number| handler(number).boxed()));
    }

    /// Register a handler for events named `name`
    pub fn on<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(RootChainEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.event_handlers
            .entry(name.to_string())
            .or_default()
            .push(Arc::new(move |event| handler(event).boxed()));
    }

    /// Last fully dispatched root chain block
    pub fn cursor(&self) -> Result<Option<u64>> {
        self.storage.watcher_cursor()
    }

    /// Dispatch every block up to the current height; returns how many were
    /// processed
    ///
    /// Stops at the first failing block, leaving the cursor just before it.
    pub async fn poll_once(&self) -> Result<u64> {
        let height = self.root_chain.block_number().await?;
        let mut next = match self.storage.watcher_cursor()? {
            Some(cursor) => cursor + 1,
            None => self.start_block,
        };

        let mut processed = 0;
        while next <= height {
            self.dispatch_block(next).await?;
            self.storage.set_watcher_cursor(next)?;
            self.metrics.set_watcher_cursor(next);
            next += 1;
            processed += 1;
        }

        if processed > 0 {
            tracing::debug!(height, processed, "Root chain blocks dispatched");
        }
        Ok(processed)
    }

    async fn dispatch_block(&self, number: u64) -> Result<()> {
        for handler in &self.block_handlers {
            handler(number).await?;
        }

        for event in self.root_chain.events_in_block(number).await? {
            let Some(handlers) = self.event_handlers.get(event.name()) else {
                continue;
            };
            tracing::debug!(block_number = number, event = event.name(), "Dispatching event");
            for handler in handlers {
                handler(event.clone()).await?;
            }
        }
        Ok(())
    }

    /// Poll on a fixed interval until `cancel` fires
    ///
    /// A poll already in progress when cancellation arrives runs to
    /// completion.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Event watcher stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.poll_once().await {
                            tracing::warn!(
                                error = %e,
                                "Root chain poll failed, retrying next tick"
                            );
                        }
                    }
                }
            }
        })
    }
}

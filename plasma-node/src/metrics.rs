//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `plasma_blocks_total` - Numbered blocks committed
//! - `plasma_blocks_submitted_total` - Roots accepted by the root chain
//! - `plasma_txs_accepted_total` - Transactions admitted to the pool
//! - `plasma_txs_rejected_total` - Transactions refused by `add_tx`
//! - `plasma_deposits_skipped_total` - Deposit events that could not be credited
//! - `plasma_txpool_size` - Pooled transactions
//! - `plasma_peers_connected` - Connected peers
//! - `plasma_watcher_cursor` - Last processed root-chain block
//! - `plasma_block_commit_duration_seconds` - Block commit latency

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics collector
///
/// Every node owns its own registry, so several nodes can share a process.
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Numbered blocks committed
    pub blocks_total: IntCounter,

    /// Roots accepted by the root chain
    pub blocks_submitted: IntCounter,

    /// Transactions admitted to the pool
    pub txs_accepted: IntCounter,

    /// Transactions refused
    pub txs_rejected: IntCounter,

    /// Deposit events left uncredited
    pub deposits_skipped: IntCounter,

    /// Pool size
    pub txpool_size: IntGauge,

    /// Connected peers
    pub peers_connected: IntGauge,

    /// Event watcher cursor
    pub watcher_cursor: IntGauge,

    /// Block commit latency
    pub commit_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let blocks_total = IntCounter::new("plasma_blocks_total", "Numbered blocks committed")?;
        registry.register(Box::new(blocks_total.clone()))?;

        let blocks_submitted = IntCounter::new(
            "plasma_blocks_submitted_total",
            "Block roots accepted by the root chain",
        )?;
        registry.register(Box::new(blocks_submitted.clone()))?;

        let txs_accepted =
            IntCounter::new("plasma_txs_accepted_total", "Transactions admitted to the pool")?;
        registry.register(Box::new(txs_accepted.clone()))?;

        let txs_rejected =
            IntCounter::new("plasma_txs_rejected_total", "Transactions refused by add_tx")?;
        registry.register(Box::new(txs_rejected.clone()))?;

        let deposits_skipped = IntCounter::new(
            "plasma_deposits_skipped_total",
            "Deposit events that could not be credited",
        )?;
        registry.register(Box::new(deposits_skipped.clone()))?;

        let txpool_size = IntGauge::new("plasma_txpool_size", "Pooled transactions")?;
        registry.register(Box::new(txpool_size.clone()))?;

        let peers_connected = IntGauge::new("plasma_peers_connected", "Connected peers")?;
        registry.register(Box::new(peers_connected.clone()))?;

        let watcher_cursor =
            IntGauge::new("plasma_watcher_cursor", "Last processed root-chain block")?;
        registry.register(Box::new(watcher_cursor.clone()))?;

        let commit_duration = Histogram::with_opts(
            HistogramOpts::new(
                "plasma_block_commit_duration_seconds",
                "Histogram of block commit latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(commit_duration.clone()))?;

        Ok(Self {
            blocks_total,
            blocks_submitted,
            txs_accepted,
            txs_rejected,
            deposits_skipped,
            txpool_size,
            peers_connected,
            watcher_cursor,
            commit_duration,
            registry,
        })
    }

    /// Record a committed block
    pub fn record_block_committed(&self, duration_seconds: f64) {
        self.blocks_total.inc();
        self.commit_duration.observe(duration_seconds);
    }

    /// Record a root accepted by the root chain
    pub fn record_block_submitted(&self) {
        self.blocks_submitted.inc();
    }

    /// Record an admitted transaction
    pub fn record_tx_accepted(&self) {
        self.txs_accepted.inc();
        self.txpool_size.inc();
    }

    /// Record a refused transaction
    pub fn record_tx_rejected(&self) {
        self.txs_rejected.inc();
    }

    /// Record a deposit event that was not credited
    pub fn record_deposit_skipped(&self) {
        self.deposits_skipped.inc();
    }

    /// Set pool size
    pub fn set_txpool_size(&self, size: usize) {
        self.txpool_size.set(size as i64);
    }

    /// Set connected peer count
    pub fn set_peers_connected(&self, count: usize) {
        self.peers_connected.set(count as i64);
    }

    /// Set watcher cursor
    pub fn set_watcher_cursor(&self, block_number: u64) {
        self.watcher_cursor.set(block_number as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every metric
    pub fn gather_text(&self) -> String {
        use prometheus::Encoder;
        let mut buffer = Vec::new();
        let encoder = prometheus::TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_tx_accepted();
        metrics.record_tx_rejected();
        metrics.record_block_committed(0.002);
        metrics.set_watcher_cursor(12);

        assert_eq!(metrics.txs_accepted.get(), 1);
        assert_eq!(metrics.txpool_size.get(), 1);
        assert_eq!(metrics.blocks_total.get(), 1);
        assert_eq!(metrics.watcher_cursor.get(), 12);
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_block_submitted();
        assert_eq!(b.blocks_submitted.get(), 0);
        assert!(a.gather_text().contains("plasma_blocks_submitted_total 1"));
    }
}

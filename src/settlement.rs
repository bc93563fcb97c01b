//! Settlement bridge to the chain gateway.
//!
//! Terminal position events buffer here, batch, and ship to the chain
//! gateway. Each instruction carries its pair id plus a bridge-assigned
//! monotonic sequence, so the settlement contract can reject duplicates
//! and a resubmitted batch confirms to the same transaction. Failed
//! batches retry with exponential backoff up to a bound, then land in a
//! quarantine queue and raise an operator alarm.

use alloy_primitives::Address;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::fixed::{Amount, SignedAmount};
use crate::models::{amount_str, signed_str, PairStatus};

/// A mark price pushed by the chain gateway.
#[derive(Debug, Clone, Copy)]
pub struct MarkPriceUpdate {
    pub token: Address,
    pub price: Amount,
    /// Unix millis.
    pub timestamp: i64,
}

/// An on-chain deposit observed by the gateway.
#[derive(Debug, Clone, Copy)]
pub struct DepositEvent {
    pub trader: Address,
    pub amount: Amount,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Events the matching core finalizes toward the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SettlementEvent {
    PairOpened {
        pair_id: u64,
        token: Address,
        long_trader: Address,
        short_trader: Address,
        #[serde(with = "amount_str")]
        size: Amount,
        #[serde(with = "amount_str")]
        entry_price: Amount,
    },
    PairClosed {
        pair_id: u64,
        token: Address,
        status: PairStatus,
        #[serde(with = "amount_str")]
        size: Amount,
        #[serde(with = "amount_str")]
        exit_price: Amount,
        #[serde(with = "signed_str")]
        pnl_long: SignedAmount,
        #[serde(with = "signed_str")]
        pnl_short: SignedAmount,
    },
    InsuranceDraw {
        pair_id: u64,
        token: Address,
        #[serde(with = "amount_str")]
        amount: Amount,
    },
}

impl SettlementEvent {
    pub fn pair_id(&self) -> u64 {
        match self {
            SettlementEvent::PairOpened { pair_id, .. }
            | SettlementEvent::PairClosed { pair_id, .. }
            | SettlementEvent::InsuranceDraw { pair_id, .. } => *pair_id,
        }
    }

    /// Traders named by the event, for per-user settlement history.
    pub fn traders(&self) -> Vec<Address> {
        match self {
            SettlementEvent::PairOpened {
                long_trader,
                short_trader,
                ..
            } => vec![*long_trader, *short_trader],
            _ => Vec::new(),
        }
    }
}

/// One idempotent instruction: the pair id plus bridge sequence is the
/// duplicate-rejection key on chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementInstruction {
    pub seq: u64,
    pub event: SettlementEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementBatch {
    pub instructions: Vec<SettlementInstruction>,
}

/// The chain-side surface the core consumes. Implementations live
/// outside the core; the in-process stub below serves tests and
/// chainless deployments.
#[async_trait]
pub trait ChainGateway: Send + Sync {
    async fn subscribe_mark_prices(&self) -> anyhow::Result<mpsc::Receiver<MarkPriceUpdate>>;
    async fn subscribe_deposits(&self) -> anyhow::Result<mpsc::Receiver<DepositEvent>>;
    async fn submit_settlement(&self, batch: &SettlementBatch) -> EngineResult<String>;
    async fn get_tx_status(&self, tx_id: &str) -> EngineResult<TxStatus>;
}

/// Producer handle the matching workers push events through. Sending
/// never blocks; a closed bridge only logs.
#[derive(Clone)]
pub struct SettlementSink {
    tx: mpsc::UnboundedSender<SettlementEvent>,
}

impl SettlementSink {
    pub fn send(&self, event: SettlementEvent) {
        if self.tx.send(event).is_err() {
            warn!("settlement bridge closed; event dropped");
        }
    }
}

/// Bridge configuration slice.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl From<&crate::config::Config> for BridgeConfig {
    fn from(cfg: &crate::config::Config) -> Self {
        Self {
            batch_size: cfg.settlement_batch_size,
            flush_interval_ms: cfg.settlement_flush_interval_ms,
            max_retries: cfg.settlement_max_retries,
            backoff_base_ms: cfg.settlement_backoff_base_ms,
            backoff_max_ms: cfg.settlement_backoff_max_ms,
        }
    }
}

#[derive(Debug, Default)]
pub struct BridgeStats {
    pub submitted_batches: u64,
    pub confirmed_batches: u64,
    pub quarantined_batches: u64,
}

pub struct SettlementBridge {
    gateway: Arc<dyn ChainGateway>,
    repo: Arc<dyn crate::repo::Repository>,
    config: BridgeConfig,
    next_seq: u64,
    pending: Vec<SettlementInstruction>,
    /// Batches that exhausted retries; operator territory.
    quarantine: Arc<Mutex<VecDeque<SettlementBatch>>>,
    stats: Arc<Mutex<BridgeStats>>,
}

impl SettlementBridge {
    pub fn new(
        gateway: Arc<dyn ChainGateway>,
        repo: Arc<dyn crate::repo::Repository>,
        config: BridgeConfig,
    ) -> (Self, SettlementSink, mpsc::UnboundedReceiver<SettlementEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                gateway,
                repo,
                config,
                next_seq: 1,
                pending: Vec::new(),
                quarantine: Arc::new(Mutex::new(VecDeque::new())),
                stats: Arc::new(Mutex::new(BridgeStats::default())),
            },
            SettlementSink { tx },
            rx,
        )
    }

    pub fn quarantine_handle(&self) -> Arc<Mutex<VecDeque<SettlementBatch>>> {
        self.quarantine.clone()
    }

    pub fn stats_handle(&self) -> Arc<Mutex<BridgeStats>> {
        self.stats.clone()
    }

    /// Drive the bridge until the event channel closes, then flush what
    /// remains.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SettlementEvent>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_millis(self.config.flush_interval_ms));
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            self.enqueue(event).await;
                            if self.pending.len() >= self.config.batch_size {
                                self.flush().await;
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }
        self.flush().await;
        info!("settlement bridge drained");
    }

    async fn enqueue(&mut self, event: SettlementEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let instruction = SettlementInstruction { seq, event };
        if let Err(e) = self.repo.settlement_append(&instruction).await {
            warn!(error = %e, "settlement log append failed");
        }
        self.pending.push(instruction);
    }

    async fn flush(&mut self) {
        while !self.pending.is_empty() {
            let take = self.pending.len().min(self.config.batch_size);
            let batch = SettlementBatch {
                instructions: self.pending.drain(..take).collect(),
            };
            self.submit_with_retry(batch).await;
        }
    }

    async fn submit_with_retry(&mut self, batch: SettlementBatch) {
        let mut backoff = self.config.backoff_base_ms;
        for attempt in 0..=self.config.max_retries {
            match self.try_submit(&batch).await {
                Ok(tx_id) => {
                    self.stats.lock().confirmed_batches += 1;
                    debug!(tx_id, instructions = batch.instructions.len(), "batch confirmed");
                    return;
                }
                Err(e) => {
                    if attempt == self.config.max_retries {
                        break;
                    }
                    debug!(error = %e, attempt, backoff_ms = backoff, "settlement retry");
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(self.config.backoff_max_ms);
                }
            }
        }
        error!(
            instructions = batch.instructions.len(),
            "settlement batch exhausted retries; quarantined, operator action required"
        );
        self.stats.lock().quarantined_batches += 1;
        self.quarantine.lock().push_back(batch);
    }

    async fn try_submit(&mut self, batch: &SettlementBatch) -> EngineResult<String> {
        self.stats.lock().submitted_batches += 1;
        let tx_id = self.gateway.submit_settlement(batch).await?;
        // Poll the transaction to a terminal state.
        loop {
            match self.gateway.get_tx_status(&tx_id).await? {
                TxStatus::Confirmed => return Ok(tx_id),
                TxStatus::Failed => {
                    return Err(EngineError::ChainGatewayUnavailable(format!(
                        "tx {tx_id} failed"
                    )))
                }
                TxStatus::Pending => {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-process stub gateway
// ---------------------------------------------------------------------------

/// Chainless gateway: marks and deposits are injected by the operator
/// surface (or tests), settlements auto-confirm, and duplicate
/// (pair, seq) instructions confirm idempotently to the same tx id.
pub struct StubChainGateway {
    marks_inject: mpsc::Sender<MarkPriceUpdate>,
    deposits_inject: mpsc::Sender<DepositEvent>,
    marks_rx: Mutex<Option<mpsc::Receiver<MarkPriceUpdate>>>,
    deposits_rx: Mutex<Option<mpsc::Receiver<DepositEvent>>>,
    seen: Mutex<std::collections::HashMap<(u64, u64), String>>,
    next_tx: Mutex<u64>,
}

impl StubChainGateway {
    pub fn new() -> Arc<Self> {
        let (marks_inject, marks_rx) = mpsc::channel(1_024);
        let (deposits_inject, deposits_rx) = mpsc::channel(1_024);
        Arc::new(Self {
            marks_inject,
            deposits_inject,
            marks_rx: Mutex::new(Some(marks_rx)),
            deposits_rx: Mutex::new(Some(deposits_rx)),
            seen: Mutex::new(std::collections::HashMap::new()),
            next_tx: Mutex::new(1),
        })
    }

    /// Push a mark update as if the chain had published one.
    pub async fn inject_mark(&self, update: MarkPriceUpdate) {
        let _ = self.marks_inject.send(update).await;
    }

    /// Credit a deposit as if observed on chain.
    pub async fn inject_deposit(&self, event: DepositEvent) {
        let _ = self.deposits_inject.send(event).await;
    }
}

#[async_trait]
impl ChainGateway for StubChainGateway {
    async fn subscribe_mark_prices(&self) -> anyhow::Result<mpsc::Receiver<MarkPriceUpdate>> {
        self.marks_rx
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("mark stream already subscribed"))
    }

    async fn subscribe_deposits(&self) -> anyhow::Result<mpsc::Receiver<DepositEvent>> {
        self.deposits_rx
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("deposit stream already subscribed"))
    }

    async fn submit_settlement(&self, batch: &SettlementBatch) -> EngineResult<String> {
        let mut seen = self.seen.lock();
        // Idempotence: a batch keyed by its first instruction replays to
        // the same tx id.
        if let Some(first) = batch.instructions.first() {
            let key = (first.event.pair_id(), first.seq);
            if let Some(existing) = seen.get(&key) {
                return Ok(existing.clone());
            }
            let mut next = self.next_tx.lock();
            let tx_id = format!("0xstub{:08x}", *next);
            *next += 1;
            seen.insert(key, tx_id.clone());
            return Ok(tx_id);
        }
        Ok("0xstubempty".to_string())
    }

    async fn get_tx_status(&self, _tx_id: &str) -> EngineResult<TxStatus> {
        Ok(TxStatus::Confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::sqlite::SqliteRepository;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_repo() -> Arc<dyn crate::repo::Repository> {
        Arc::new(SqliteRepository::open_in_memory().unwrap())
    }

    fn event(pair_id: u64) -> SettlementEvent {
        SettlementEvent::PairClosed {
            pair_id,
            token: Address::repeat_byte(0x11),
            status: PairStatus::Closed,
            size: crate::fixed::ONE,
            exit_price: 2 * crate::fixed::ONE,
            pnl_long: 5,
            pnl_short: -5,
        }
    }

    fn config() -> BridgeConfig {
        BridgeConfig {
            batch_size: 4,
            flush_interval_ms: 10,
            max_retries: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 4,
        }
    }

    /// Gateway that fails a configurable number of submissions first.
    struct FlakyGateway {
        inner: Arc<StubChainGateway>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl ChainGateway for FlakyGateway {
        async fn subscribe_mark_prices(&self) -> anyhow::Result<mpsc::Receiver<MarkPriceUpdate>> {
            self.inner.subscribe_mark_prices().await
        }
        async fn subscribe_deposits(&self) -> anyhow::Result<mpsc::Receiver<DepositEvent>> {
            self.inner.subscribe_deposits().await
        }
        async fn submit_settlement(&self, batch: &SettlementBatch) -> EngineResult<String> {
            if self.failures_left.load(Ordering::Relaxed) > 0 {
                self.failures_left.fetch_sub(1, Ordering::Relaxed);
                return Err(EngineError::ChainGatewayUnavailable("flaky".into()));
            }
            self.inner.submit_settlement(batch).await
        }
        async fn get_tx_status(&self, tx_id: &str) -> EngineResult<TxStatus> {
            self.inner.get_tx_status(tx_id).await
        }
    }

    #[tokio::test]
    async fn events_batch_and_confirm() {
        let gateway = StubChainGateway::new();
        let (bridge, sink, rx) = SettlementBridge::new(gateway, test_repo(), config());
        let stats = bridge.stats_handle();
        let handle = tokio::spawn(bridge.run(rx));

        for id in 1..=6u64 {
            sink.send(event(id));
        }
        drop(sink);
        handle.await.unwrap();

        let s = stats.lock();
        assert!(s.confirmed_batches >= 2);
        assert_eq!(s.quarantined_batches, 0);
    }

    #[tokio::test]
    async fn transient_failures_retry_to_success() {
        let gateway = Arc::new(FlakyGateway {
            inner: StubChainGateway::new(),
            failures_left: AtomicU32::new(2),
        });
        let (bridge, sink, rx) = SettlementBridge::new(gateway, test_repo(), config());
        let stats = bridge.stats_handle();
        let handle = tokio::spawn(bridge.run(rx));

        sink.send(event(1));
        drop(sink);
        handle.await.unwrap();

        let s = stats.lock();
        assert_eq!(s.confirmed_batches, 1);
        assert_eq!(s.quarantined_batches, 0);
        assert!(s.submitted_batches >= 3);
    }

    #[tokio::test]
    async fn exhausted_retries_quarantine() {
        let gateway = Arc::new(FlakyGateway {
            inner: StubChainGateway::new(),
            failures_left: AtomicU32::new(100),
        });
        let (bridge, sink, rx) = SettlementBridge::new(gateway, test_repo(), config());
        let stats = bridge.stats_handle();
        let quarantine = bridge.quarantine_handle();
        let handle = tokio::spawn(bridge.run(rx));

        sink.send(event(1));
        drop(sink);
        handle.await.unwrap();

        assert_eq!(stats.lock().quarantined_batches, 1);
        assert_eq!(quarantine.lock().len(), 1);
    }

    #[tokio::test]
    async fn replayed_batch_confirms_to_same_tx() {
        let gateway = StubChainGateway::new();
        let batch = SettlementBatch {
            instructions: vec![SettlementInstruction {
                seq: 1,
                event: event(1),
            }],
        };
        let first = gateway.submit_settlement(&batch).await.unwrap();
        let second = gateway.submit_settlement(&batch).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn stub_streams_deliver_injected_values() {
        let gateway = StubChainGateway::new();
        let mut marks = gateway.subscribe_mark_prices().await.unwrap();
        gateway
            .inject_mark(MarkPriceUpdate {
                token: Address::repeat_byte(0x11),
                price: crate::fixed::ONE,
                timestamp: 1,
            })
            .await;
        let got = marks.recv().await.unwrap();
        assert_eq!(got.price, crate::fixed::ONE);
    }
}

//! The matching and settlement core.
//!
//! One worker task per active token owns that token's order book, stop
//! park, and pair slice, and consumes a command channel: no two commands
//! for the same token ever run concurrently, while different tokens run
//! in parallel. Global ledgers (balances, nonces, funding, marks) are
//! shared structures with their own short locks.

pub mod book;
pub mod funding;
pub mod lifecycle;
pub mod positions;
pub mod risk;
pub mod worker;

use alloy_primitives::Address;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::auth::{NonceRegistry, OrderMessage, OrderValidator};
use crate::broadcast::{Broadcaster, EventPayload, Topic};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::fixed::LEVERAGE_ONE;
use crate::klines::TradeAggregator;
use crate::ledger::BalanceLedger;
use crate::marks::MarkPriceFeed;
use crate::models::{BookDepth, OrderType};
use crate::repo::Repository;
use crate::settlement::SettlementSink;

use funding::FundingEngine;
use lifecycle::{TokenParams, TokenRegistry};
use positions::PairStore;
use worker::{SubmitOutcome, TokenCommand, TokenWorker};

/// Everything a token worker shares with the rest of the process.
pub struct EngineShared {
    pub config: Config,
    pub validator: OrderValidator,
    pub nonces: NonceRegistry,
    pub ledger: BalanceLedger,
    pub registry: TokenRegistry,
    pub pairs: PairStore,
    pub funding: FundingEngine,
    pub marks: MarkPriceFeed,
    pub aggregator: TradeAggregator,
    pub broadcaster: Broadcaster,
    pub repo: Arc<dyn Repository>,
    pub settlements: SettlementSink,
    pub next_order_id: AtomicU64,
    pub next_trade_id: AtomicU64,
}

impl EngineShared {
    pub fn order_id(&self) -> u64 {
        self.next_order_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn trade_id(&self) -> u64 {
        self.next_trade_id.fetch_add(1, Ordering::Relaxed)
    }
}

struct WorkerHandle {
    tx: mpsc::UnboundedSender<TokenCommand>,
}

/// Process-wide engine facade: validation, nonce sequencing, and routing
/// of token commands to the owning worker.
pub struct MatchingEngine {
    shared: Arc<EngineShared>,
    workers: RwLock<HashMap<Address, WorkerHandle>>,
}

impl MatchingEngine {
    pub fn new(
        config: Config,
        repo: Arc<dyn Repository>,
        broadcaster: Broadcaster,
        settlements: SettlementSink,
    ) -> Self {
        let validator = OrderValidator::new(config.chain_id, config.verifying_contract);
        let funding = FundingEngine::new(config.funding_k_bps, config.funding_max_rate_bps);
        let shared = Arc::new(EngineShared {
            validator,
            nonces: NonceRegistry::new(),
            ledger: BalanceLedger::new(),
            registry: TokenRegistry::new(),
            pairs: PairStore::new(),
            funding,
            marks: MarkPriceFeed::new(),
            aggregator: TradeAggregator::new(),
            broadcaster,
            repo,
            settlements,
            next_order_id: AtomicU64::new(1),
            next_trade_id: AtomicU64::new(1),
            config,
        });
        Self {
            shared,
            workers: RwLock::new(HashMap::new()),
        }
    }

    pub fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    /// Restore persisted state (nonces, balances, active pairs, funding
    /// indices) before serving.
    pub async fn restore_from_repo(&self) -> anyhow::Result<()> {
        let shared = &self.shared;
        for (trader, nonce) in shared.repo.nonces_all().await? {
            shared.nonces.hydrate(trader, nonce);
        }
        for (trader, balances) in shared.repo.balances_all().await? {
            shared.ledger.hydrate(trader, balances);
        }
        let pairs = shared.repo.positions_all_active().await?;
        let restored = pairs.len();
        for pair in pairs {
            shared
                .registry
                .apply_oi_delta(pair.token, pair.size as i128, 1);
            shared.pairs.restore(pair);
        }
        let next_order = shared.repo.orders_max_id().await?.saturating_add(1);
        shared.next_order_id.store(next_order, Ordering::Relaxed);
        let next_trade = shared.repo.trades_max_id().await?.saturating_add(1);
        shared.next_trade_id.store(next_trade, Ordering::Relaxed);
        info!(restored_pairs = restored, "engine state restored");
        Ok(())
    }

    fn worker_tx(&self, token: Address) -> EngineResult<mpsc::UnboundedSender<TokenCommand>> {
        if let Some(handle) = self.workers.read().get(&token) {
            return Ok(handle.tx.clone());
        }
        // Spawn lazily for known tokens.
        self.shared.registry.state(token)?;
        let mut workers = self.workers.write();
        let handle = workers.entry(token).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = TokenWorker::new(token, self.shared.clone());
            tokio::spawn(worker.run(rx));
            WorkerHandle { tx }
        });
        Ok(handle.tx.clone())
    }

    /// Fan a command to every live worker.
    pub fn broadcast_command(&self, make: impl Fn() -> TokenCommand) {
        for handle in self.workers.read().values() {
            let _ = handle.tx.send(make());
        }
    }

    pub fn command_token(&self, token: Address, cmd: TokenCommand) -> EngineResult<()> {
        self.worker_tx(token)?
            .send(cmd)
            .map_err(|_| EngineError::TokenNotTrading(token))
    }

    /// Full submission pipeline: signature, parameters, nonce
    /// reservation, then the owning worker. The nonce commits only when
    /// the submission was not a pure rejection.
    pub async fn submit_order(&self, msg: OrderMessage) -> EngineResult<SubmitOutcome> {
        let params = self.shared.registry.params(msg.token)?;
        Self::validate_message(&self.shared.validator, &msg, &params)?;
        self.shared.nonces.reserve(msg.trader, msg.nonce)?;

        let outcome = self.route_submission(&msg).await;
        if outcome.is_ok() {
            self.shared.nonces.commit(msg.trader, msg.nonce)?;
            if let Err(e) = self.shared.repo.nonces_persist(msg.trader, msg.nonce).await {
                warn!(error = %e, "nonce persist failed");
            }
        } else {
            self.shared.nonces.abandon(msg.trader, msg.nonce);
        }
        outcome
    }

    async fn route_submission(&self, msg: &OrderMessage) -> EngineResult<SubmitOutcome> {
        let (reply, rx) = oneshot::channel();
        self.command_token(
            msg.token,
            TokenCommand::Submit {
                msg: msg.clone(),
                reply,
            },
        )?;
        rx.await
            .map_err(|_| EngineError::TokenNotTrading(msg.token))?
    }

    /// Static message validation against a parameter snapshot.
    pub fn validate_message(
        validator: &OrderValidator,
        msg: &OrderMessage,
        params: &TokenParams,
    ) -> EngineResult<()> {
        validator.verify(msg)?;
        if msg.deadline <= crate::models::now_secs() {
            return Err(EngineError::Expired);
        }
        if msg.size == 0 {
            return Err(EngineError::InvalidOrderParameters("zero size".into()));
        }
        if msg.size < params.min_order_size {
            return Err(EngineError::SizeBelowMinimum);
        }
        if msg.leverage < LEVERAGE_ONE || msg.leverage > params.max_leverage {
            return Err(EngineError::LeverageOutOfRange);
        }
        match msg.order_type {
            OrderType::Market => {
                if msg.price != 0 {
                    return Err(EngineError::InvalidOrderParameters(
                        "market order carries a price".into(),
                    ));
                }
            }
            _ => {
                if msg.price == 0 {
                    return Err(EngineError::InvalidOrderParameters(
                        "limit price required".into(),
                    ));
                }
                if msg.price % params.tick_size != 0 {
                    return Err(EngineError::PriceNotOnTick);
                }
            }
        }
        Ok(())
    }

    /// Cancel a resting or parked order.
    pub async fn cancel_order(
        &self,
        token: Address,
        order_id: u64,
        trader: Address,
    ) -> EngineResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command_token(
            token,
            TokenCommand::Cancel {
                order_id,
                trader,
                reply,
            },
        )?;
        rx.await.map_err(|_| EngineError::OrderNotFound)?
    }

    pub async fn depth(&self, token: Address, levels: usize) -> EngineResult<BookDepth> {
        let (reply, rx) = oneshot::channel();
        self.command_token(token, TokenCommand::Depth { levels, reply })?;
        rx.await.map_err(|_| EngineError::UnknownToken(token))
    }

    // --- admin surface ---

    pub fn admin_create(&self, token: Address) -> EngineResult<()> {
        let params = TokenParams::from_defaults(
            &self.shared.config.token_defaults,
            self.shared.config.funding_interval_secs,
            self.shared.config.risk_tick_interval_ms,
        );
        self.shared.registry.create(token, params)
    }

    pub fn admin_activate(&self, token: Address) -> EngineResult<()> {
        // Auto-create on first activate so `admin token activate` is the
        // one-step listing path.
        if self.shared.registry.state(token).is_err() {
            self.admin_create(token)?;
        }
        let event = self.shared.registry.activate(token)?;
        self.publish_lifecycle(&event);
        self.worker_tx(token)?;
        Ok(())
    }

    pub fn admin_pause(&self, token: Address, reason: &str) -> EngineResult<()> {
        let event = self.shared.registry.pause(token, reason)?;
        self.publish_lifecycle(&event);
        Ok(())
    }

    pub fn admin_resume(&self, token: Address) -> EngineResult<()> {
        let event = self.shared.registry.resume(token)?;
        self.publish_lifecycle(&event);
        Ok(())
    }

    pub fn admin_delist(&self, token: Address) -> EngineResult<()> {
        let event = self.shared.registry.delist(token)?;
        self.publish_lifecycle(&event);
        if let Some(handle) = self.workers.write().remove(&token) {
            let _ = handle.tx.send(TokenCommand::Shutdown);
        }
        Ok(())
    }

    pub fn admin_set_param(&self, token: Address, key: &str, value: &str) -> EngineResult<()> {
        self.shared.registry.set_param(token, key, value)
    }

    fn publish_lifecycle(&self, event: &lifecycle::LifecycleEvent) {
        self.shared.broadcaster.publish(
            Topic::Lifecycle(event.token),
            EventPayload::Lifecycle {
                token: event.token,
                state: event.state.as_str().to_string(),
                reason: event.reason.clone(),
            },
        );
    }

    /// Graceful drain: stop accepting (workers keep running for the
    /// drain command), cancel resting orders releasing collateral, then
    /// flush the aggregator.
    pub async fn drain_all(&self) {
        let txs: Vec<(Address, mpsc::UnboundedSender<TokenCommand>)> = self
            .workers
            .read()
            .iter()
            .map(|(t, h)| (*t, h.tx.clone()))
            .collect();
        for (token, tx) in txs {
            let (reply, rx) = oneshot::channel();
            if tx.send(TokenCommand::Drain { reply }).is_ok() {
                match rx.await {
                    Ok(cancelled) => {
                        info!(%token, cancelled, "book drained");
                    }
                    Err(_) => warn!(%token, "worker dropped during drain"),
                }
            }
        }
        self.flush_aggregator().await;
    }

    /// Persist buffered trades and k-line buckets.
    pub async fn flush_aggregator(&self) {
        let batch = self.shared.aggregator.take_flush();
        if batch.trades.is_empty() && batch.closed_buckets.is_empty() && batch.open_buckets.is_empty()
        {
            return;
        }
        if let Err(e) = self.shared.repo.trades_append(&batch.trades).await {
            warn!(error = %e, "trade flush failed; tail retained in memory");
        }
        for bucket in batch.closed_buckets.iter().chain(batch.open_buckets.iter()) {
            if let Err(e) = self.shared.repo.klines_upsert(bucket).await {
                warn!(error = %e, "kline flush failed");
                break;
            }
        }
    }
}

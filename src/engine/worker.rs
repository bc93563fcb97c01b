//! Per-token worker.
//!
//! Exactly one task per token consumes this command stream, so the book,
//! the stop park, and the token's pair slice never see concurrent
//! mutation. Producers get synchronous-feeling replies through oneshot
//! channels. An invariant violation flips the worker into quarantine:
//! resting orders cancel with `Expired`, collateral stays locked, and the
//! token stops accepting commands until an operator intervenes.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::broadcast::{EventPayload, Topic};
use crate::error::{EngineError, EngineResult};
use crate::fixed::{self, Amount};
use crate::ledger::FEE_ACCOUNT;
use crate::models::{
    now_ms, now_secs, BookDepth, Order, OrderStatus, OrderType, PairStatus, Side, Trade,
};
use crate::settlement::SettlementEvent;

use super::book::{BookOrder, Fill, OrderBook, TakerOrder};
use super::lifecycle::{TokenParams, TokenState};
use super::positions::{CloseReason, FillParty, PairClose};
use super::risk;
use super::EngineShared;

/// One fill reported back to the submitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillSummary {
    #[serde(with = "crate::models::amount_str")]
    pub price: Amount,
    #[serde(with = "crate::models::amount_str")]
    pub size: Amount,
    pub counterparty: Address,
}

/// Reply to a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub order_id: u64,
    pub status: OrderStatus,
    pub fills: Vec<FillSummary>,
}

/// Commands a token worker serializes.
pub enum TokenCommand {
    Submit {
        msg: crate::auth::OrderMessage,
        reply: oneshot::Sender<EngineResult<SubmitOutcome>>,
    },
    Cancel {
        order_id: u64,
        trader: Address,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    Depth {
        levels: usize,
        reply: oneshot::Sender<BookDepth>,
    },
    PruneExpired,
    MarkUpdated,
    RiskTick,
    FundingTick,
    Drain {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// A non-terminal order owned by the worker (resting or parked stop),
/// with its remaining ledger lock.
struct TrackedOrder {
    order: Order,
    locked_remaining: Amount,
    /// Reference price the lock was computed at.
    lock_ref_price: Amount,
}

/// Per-fill taker context shared between external submissions and
/// internal (stop trigger / auto-deleverage) executions.
struct TakerCtx {
    order_id: u64,
    trader: Address,
    side: Side,
    leverage: u128,
    lock_ref_price: Amount,
    locked_remaining: Amount,
    taker_fee_bps: u128,
    maker_fee_bps: u128,
}

pub struct TokenWorker {
    token: Address,
    shared: Arc<EngineShared>,
    book: OrderBook,
    orders: HashMap<u64, TrackedOrder>,
    /// Parked stop orders in arrival order.
    stops: Vec<u64>,
    last_risk_sweep_ms: i64,
    quarantined: bool,
}

impl TokenWorker {
    pub fn new(token: Address, shared: Arc<EngineShared>) -> Self {
        Self {
            token,
            shared,
            book: OrderBook::new(token),
            orders: HashMap::new(),
            stops: Vec::new(),
            last_risk_sweep_ms: 0,
            quarantined: false,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<TokenCommand>) {
        debug!(token = %self.token, "token worker started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                TokenCommand::Submit { msg, reply } => {
                    let result = self.handle_submit(&msg).await;
                    if let Err(e) = &result {
                        if e.is_invariant_violation() {
                            self.enter_quarantine(e.code()).await;
                        }
                    }
                    let _ = reply.send(result);
                }
                TokenCommand::Cancel {
                    order_id,
                    trader,
                    reply,
                } => {
                    let _ = reply.send(self.handle_cancel(order_id, trader).await);
                }
                TokenCommand::Depth { levels, reply } => {
                    let _ = reply.send(self.book.depth(levels, now_ms()));
                }
                TokenCommand::PruneExpired => self.handle_prune().await,
                TokenCommand::MarkUpdated => {
                    self.trigger_stops().await;
                    self.risk_scan(true).await;
                }
                TokenCommand::RiskTick => self.risk_scan(false).await,
                TokenCommand::FundingTick => self.funding_tick().await,
                TokenCommand::Drain { reply } => {
                    let _ = reply.send(self.drain(OrderStatus::Cancelled, true).await);
                }
                TokenCommand::Shutdown => break,
            }
        }
        debug!(token = %self.token, "token worker stopped");
    }

    // --- submission -----------------------------------------------------

    async fn handle_submit(&mut self, msg: &crate::auth::OrderMessage) -> EngineResult<SubmitOutcome> {
        if self.quarantined {
            return Err(EngineError::TokenNotTrading(self.token));
        }
        let params = self.shared.registry.ensure_tradable(self.token)?;
        let active_pairs = self
            .shared
            .pairs
            .active_by_trader(msg.trader)
            .iter()
            .filter(|p| p.token == self.token)
            .count();
        // Orders in the reducing direction always pass the cap.
        if active_pairs >= self.shared.config.max_pairs_per_trader
            && self
                .shared
                .pairs
                .closable_size(self.token, msg.trader, msg.side)
                == 0
        {
            return Err(EngineError::PositionLimitExceeded);
        }
        let order_id = self.shared.order_id();
        let now = now_ms();
        let mut order = Order {
            id: order_id,
            trader: msg.trader,
            token: msg.token,
            side: msg.side,
            order_type: msg.order_type,
            size_original: msg.size,
            size_remaining: msg.size,
            limit_price: msg.price,
            leverage: msg.leverage,
            deadline: msg.deadline,
            nonce: msg.nonce,
            signature: format!("0x{}", hex::encode(msg.signature)),
            status: OrderStatus::New,
            created_at: now,
            updated_at: now,
        };

        if msg.order_type.is_stop() {
            return self.park_stop(order).await;
        }

        let reference_price = self.reference_price(&order, &params)?;
        let collateral = fixed::collateral_for(order.size_remaining, reference_price, order.leverage)?;
        self.shared.ledger.lock(order.trader, collateral)?;

        let mut ctx = TakerCtx {
            order_id,
            trader: order.trader,
            side: order.side,
            leverage: order.leverage,
            lock_ref_price: reference_price,
            locked_remaining: collateral,
            taker_fee_bps: params.taker_fee_bps,
            maker_fee_bps: params.maker_fee_bps,
        };

        let taker = TakerOrder {
            id: order_id,
            trader: order.trader,
            side: order.side,
            order_type: order.order_type,
            limit_price: order.limit_price,
            size: order.size_remaining,
            leverage: order.leverage,
            deadline: order.deadline,
        };
        metrics::increment_counter!("memeperp_orders_submitted_total");
        let outcome = self.book.match_taker(&taker, now_secs());
        for expired in &outcome.evicted_expired {
            self.finalize_evicted(expired, OrderStatus::Expired, true).await;
        }

        let mut fills = Vec::with_capacity(outcome.fills.len());
        for fill in &outcome.fills {
            let summary = self.process_fill(&mut ctx, fill, true).await?;
            fills.push(summary);
        }

        order.size_remaining = outcome.taker_remaining;
        let status = if outcome.taker_remaining == 0 {
            // Exactly filled; release any rounding dust left on the lock.
            self.release_lock_dust(&mut ctx);
            OrderStatus::Filled
        } else if order.order_type == OrderType::Market {
            self.release_lock_dust(&mut ctx);
            if fills.is_empty() {
                order.status = OrderStatus::Rejected;
                order.updated_at = now_ms();
                self.persist_order(&order).await;
                return Err(EngineError::NoLiquidity);
            }
            // Partial market fill: remainder auto-cancels.
            OrderStatus::Filled
        } else {
            // Limit residual rests at its own price.
            let resting = BookOrder {
                id: order.id,
                trader: order.trader,
                side: order.side,
                price: order.limit_price,
                size_original: order.size_original,
                size_remaining: order.size_remaining,
                leverage: order.leverage,
                deadline: order.deadline,
                seq: 0,
            };
            self.book.rest(resting);
            let status = if fills.is_empty() {
                OrderStatus::New
            } else {
                OrderStatus::PartiallyFilled
            };
            self.orders.insert(
                order.id,
                TrackedOrder {
                    order: order.clone(),
                    locked_remaining: ctx.locked_remaining,
                    lock_ref_price: ctx.lock_ref_price,
                },
            );
            status
        };

        order.status = status;
        order.updated_at = now_ms();
        if let Some(tracked) = self.orders.get_mut(&order.id) {
            tracked.order.status = status;
            tracked.order.size_remaining = order.size_remaining;
            tracked.order.updated_at = order.updated_at;
        }
        self.persist_order(&order).await;
        self.publish_book();

        Ok(SubmitOutcome {
            order_id,
            status,
            fills,
        })
    }

    /// Reference price for collateral sizing and the market-order
    /// deviation gate.
    fn reference_price(&self, order: &Order, params: &TokenParams) -> EngineResult<Amount> {
        if order.order_type == OrderType::Limit {
            return Ok(order.limit_price);
        }
        // Market order: prefer the mark, cross-checked against the book.
        let best_opposite = match order.side {
            Side::Long => self.book.best_ask(),
            Side::Short => self.book.best_bid(),
        };
        let mark = self
            .shared
            .marks
            .mark(self.token, now_ms(), params.mark_stale_after_ms);

        match (mark, best_opposite) {
            (Some(mark), Some(best)) => {
                let deviation = mark.price.abs_diff(best);
                let bound = fixed::apply_bps(best, params.max_price_deviation_bps)?;
                if deviation > bound {
                    return Err(EngineError::PriceDeviationExceeded);
                }
                Ok(mark.price)
            }
            (Some(mark), None) => Ok(mark.price),
            (None, Some(best)) => Ok(best),
            (None, None) => Err(EngineError::NoLiquidity),
        }
    }

    async fn park_stop(&mut self, mut order: Order) -> EngineResult<SubmitOutcome> {
        // The trigger price doubles as the collateral reference.
        let collateral =
            fixed::collateral_for(order.size_remaining, order.limit_price, order.leverage)?;
        self.shared.ledger.lock(order.trader, collateral)?;
        order.status = OrderStatus::New;
        let outcome = SubmitOutcome {
            order_id: order.id,
            status: order.status,
            fills: Vec::new(),
        };
        self.persist_order(&order).await;
        self.stops.push(order.id);
        self.orders.insert(
            order.id,
            TrackedOrder {
                lock_ref_price: order.limit_price,
                locked_remaining: collateral,
                order,
            },
        );
        Ok(outcome)
    }

    /// Apply one fill: fees, pair bookkeeping, collateral adjustment,
    /// trade recording, broadcast.
    async fn process_fill(
        &mut self,
        ctx: &mut TakerCtx,
        fill: &Fill,
        charge_fees: bool,
    ) -> EngineResult<FillSummary> {
        let notional = fixed::notional(fill.size, fill.price)?;
        let taker_fee = if charge_fees {
            fixed::fee_for(notional, ctx.taker_fee_bps)?
        } else {
            0
        };
        let maker_fee = if charge_fees {
            fixed::fee_for(notional, ctx.maker_fee_bps)?
        } else {
            0
        };

        let funding_index = self.shared.funding.index(self.token);
        let application = self.shared.pairs.apply_fill(
            self.token,
            ctx.side,
            FillParty {
                trader: ctx.trader,
                leverage: ctx.leverage,
            },
            FillParty {
                trader: fill.maker_trader,
                leverage: fill.maker_leverage,
            },
            fill.size,
            fill.price,
            funding_index,
        )?;

        // Collateral accounting. The taker's lock share was sized at the
        // reference price; the maker's at its limit (= execution) price.
        let taker_share = fixed::collateral_for(fill.size, ctx.lock_ref_price, ctx.leverage)?
            .min(ctx.locked_remaining);
        ctx.locked_remaining -= taker_share;
        let (needed_long, needed_short) = application
            .opened
            .as_ref()
            .map(|p| (p.long_collateral, p.short_collateral))
            .unwrap_or((0, 0));
        let (taker_needed, maker_needed) = match ctx.side {
            Side::Long => (needed_long, needed_short),
            Side::Short => (needed_short, needed_long),
        };
        if taker_needed > taker_share {
            // Execution above the reference (price improvement for a
            // short); top up the lock from available.
            if let Err(e) = self.shared.ledger.lock(ctx.trader, taker_needed - taker_share) {
                warn!(
                    token = %self.token,
                    trader = %ctx.trader,
                    error = %e,
                    "collateral top-up failed; pair backed at reference terms"
                );
            }
        } else if taker_share > taker_needed {
            self.shared.ledger.release(ctx.trader, taker_share - taker_needed);
        }

        let maker_share = {
            let tracked = self.orders.get_mut(&fill.maker_order_id);
            match tracked {
                Some(t) => {
                    let share = fixed::collateral_for(fill.size, fill.price, fill.maker_leverage)?
                        .min(t.locked_remaining);
                    t.locked_remaining -= share;
                    t.order.size_remaining = fill.maker_remaining;
                    t.order.status = if fill.maker_remaining == 0 {
                        OrderStatus::Filled
                    } else {
                        OrderStatus::PartiallyFilled
                    };
                    t.order.updated_at = now_ms();
                    share
                }
                None => fixed::collateral_for(fill.size, fill.price, fill.maker_leverage)?,
            }
        };
        if maker_share > maker_needed {
            self.shared
                .ledger
                .release(fill.maker_trader, maker_share - maker_needed);
        }

        // Settle the offsets this fill produced.
        for close in &application.closed {
            self.apply_close(close).await?;
        }

        if let Some(pair) = &application.opened {
            self.shared
                .registry
                .apply_oi_delta(self.token, pair.size as i128, 1);
            self.repo_save_pair(pair).await;
            self.shared.settlements.send(SettlementEvent::PairOpened {
                pair_id: pair.pair_id,
                token: self.token,
                long_trader: pair.long_trader,
                short_trader: pair.short_trader,
                size: pair.size,
                entry_price: pair.entry_price,
            });
            self.publish_positions(&[pair.long_trader, pair.short_trader]);
        }

        // The trade record and its downstream fan-out.
        let trade = Trade {
            id: self.shared.trade_id(),
            token: self.token,
            maker_order_id: fill.maker_order_id,
            taker_order_id: ctx.order_id,
            maker: fill.maker_trader,
            taker: ctx.trader,
            price: fill.price,
            size: fill.size,
            timestamp: now_ms(),
            maker_fee,
            taker_fee,
            pair_id: application.opened.as_ref().map(|p| p.pair_id),
        };

        if charge_fees {
            for (payer, fee) in [(ctx.trader, taker_fee), (fill.maker_trader, maker_fee)] {
                if fee > 0 {
                    if let Err(e) = self.shared.ledger.transfer(payer, FEE_ACCOUNT, fee) {
                        warn!(token = %self.token, %payer, error = %e, "fee collection failed");
                    }
                }
            }
        }

        metrics::increment_counter!("memeperp_trades_total");
        self.shared.marks.record_trade_price(self.token, trade.price, trade.timestamp);
        self.shared.registry.record_trade(self.token, trade.price, trade.size);
        for bucket in self.shared.aggregator.record(&trade) {
            self.shared.broadcaster.publish(
                Topic::Klines(self.token, bucket.resolution),
                EventPayload::Kline(bucket),
            );
        }
        self.shared
            .broadcaster
            .publish(Topic::Trades(self.token), EventPayload::Trade(trade.clone()));

        // Fully filled makers leave the tracked set; release lock dust.
        if fill.maker_remaining == 0 {
            if let Some(t) = self.orders.remove(&fill.maker_order_id) {
                if t.locked_remaining > 0 {
                    self.shared.ledger.release(fill.maker_trader, t.locked_remaining);
                }
                self.persist_order(&t.order).await;
            }
        } else if let Some(t) = self.orders.get(&fill.maker_order_id) {
            let order = t.order.clone();
            self.persist_order(&order).await;
        }

        Ok(FillSummary {
            price: fill.price,
            size: fill.size,
            counterparty: fill.maker_trader,
        })
    }

    /// Ledger settlement plus fan-out for a pair close of any kind.
    async fn apply_close(&mut self, close: &PairClose) -> EngineResult<()> {
        self.shared.ledger.settle_pair(&close.settlement)?;
        self.shared.registry.apply_oi_delta(
            self.token,
            -(close.size_closed as i128),
            if close.fully_closed { -1 } else { 0 },
        );

        if close.settlement.insurance_draw > 0 {
            self.shared.settlements.send(SettlementEvent::InsuranceDraw {
                pair_id: close.pair_id,
                token: self.token,
                amount: close.settlement.insurance_draw,
            });
            self.shared.broadcaster.publish(
                Topic::Lifecycle(self.token),
                EventPayload::InsuranceDraw {
                    pair_id: close.pair_id,
                    token: self.token,
                    amount: close.settlement.insurance_draw,
                },
            );
        }

        self.shared.settlements.send(SettlementEvent::PairClosed {
            pair_id: close.pair_id,
            token: self.token,
            status: close.status,
            size: close.size_closed,
            exit_price: close.exit_price,
            pnl_long: close.settlement.pnl_long,
            pnl_short: close.settlement.pnl_short,
        });

        let payload = EventPayload::PairClosed {
            pair_id: close.pair_id,
            token: self.token,
            status: close.status,
            exit_price: close.exit_price,
            pnl_long: close.settlement.pnl_long,
            pnl_short: close.settlement.pnl_short,
        };
        for trader in [close.settlement.long_trader, close.settlement.short_trader] {
            self.shared
                .broadcaster
                .publish(Topic::Positions(trader), payload.clone());
        }
        self.publish_positions(&[close.settlement.long_trader, close.settlement.short_trader]);

        if let Ok(pair) = self.shared.pairs.get(close.pair_id) {
            self.repo_save_pair(&pair).await;
        }
        Ok(())
    }

    fn release_lock_dust(&self, ctx: &mut TakerCtx) {
        if ctx.locked_remaining > 0 {
            self.shared.ledger.release(ctx.trader, ctx.locked_remaining);
            ctx.locked_remaining = 0;
        }
    }

    // --- cancellation & expiry ------------------------------------------

    async fn handle_cancel(&mut self, order_id: u64, trader: Address) -> EngineResult<()> {
        match self.orders.get(&order_id) {
            Some(tracked) if tracked.order.trader == trader => {}
            _ => return Err(EngineError::OrderNotFound),
        }

        self.book.cancel(order_id);
        self.stops.retain(|id| *id != order_id);
        let Some(mut tracked) = self.orders.remove(&order_id) else {
            return Err(EngineError::OrderNotFound);
        };
        if tracked.locked_remaining > 0 {
            self.shared.ledger.release(trader, tracked.locked_remaining);
        }
        tracked.order.status = OrderStatus::Cancelled;
        tracked.order.updated_at = now_ms();
        self.persist_order(&tracked.order).await;
        self.publish_book();
        Ok(())
    }

    async fn finalize_evicted(&mut self, evicted: &BookOrder, status: OrderStatus, release: bool) {
        if let Some(mut tracked) = self.orders.remove(&evicted.id) {
            if release && tracked.locked_remaining > 0 {
                self.shared
                    .ledger
                    .release(tracked.order.trader, tracked.locked_remaining);
            }
            tracked.order.status = status;
            tracked.order.size_remaining = evicted.size_remaining;
            tracked.order.updated_at = now_ms();
            self.persist_order(&tracked.order).await;
        }
    }

    async fn handle_prune(&mut self) {
        let now = now_secs();
        let evicted = self.book.prune_expired(now);
        for order in &evicted {
            self.finalize_evicted(order, OrderStatus::Expired, true).await;
        }

        let expired_stops: Vec<u64> = self
            .stops
            .iter()
            .copied()
            .filter(|id| {
                self.orders
                    .get(id)
                    .map(|t| t.order.deadline <= now)
                    .unwrap_or(true)
            })
            .collect();
        for id in expired_stops {
            self.stops.retain(|s| *s != id);
            if let Some(mut tracked) = self.orders.remove(&id) {
                if tracked.locked_remaining > 0 {
                    self.shared
                        .ledger
                        .release(tracked.order.trader, tracked.locked_remaining);
                }
                tracked.order.status = OrderStatus::Expired;
                tracked.order.updated_at = now_ms();
                self.persist_order(&tracked.order).await;
            }
        }
        if !evicted.is_empty() {
            self.publish_book();
        }
    }

    async fn drain(&mut self, status: OrderStatus, release: bool) -> usize {
        let resting = self.book.drain();
        let mut cancelled = resting.len();
        for order in &resting {
            self.finalize_evicted(order, status, release).await;
        }
        let parked: Vec<u64> = self.stops.drain(..).collect();
        for id in parked {
            if let Some(mut tracked) = self.orders.remove(&id) {
                if release && tracked.locked_remaining > 0 {
                    self.shared
                        .ledger
                        .release(tracked.order.trader, tracked.locked_remaining);
                }
                tracked.order.status = status;
                tracked.order.updated_at = now_ms();
                self.persist_order(&tracked.order).await;
                cancelled += 1;
            }
        }
        self.publish_book();
        cancelled
    }

    async fn enter_quarantine(&mut self, reason: &str) {
        if self.quarantined {
            return;
        }
        self.quarantined = true;
        error!(token = %self.token, reason, "invariant violation; quarantining token");
        // Orders cancel with Expired and funds stay locked until an
        // operator intervenes.
        self.drain(OrderStatus::Expired, false).await;
        if let Ok(event) = self.shared.registry.quarantine(self.token, reason) {
            self.shared.broadcaster.publish(
                Topic::Lifecycle(self.token),
                EventPayload::Lifecycle {
                    token: self.token,
                    state: event.state.as_str().to_string(),
                    reason: event.reason,
                },
            );
        }
    }

    // --- stops -----------------------------------------------------------

    async fn trigger_stops(&mut self) {
        if self.quarantined || self.stops.is_empty() {
            return;
        }
        let Ok(params) = self.shared.registry.params(self.token) else {
            return;
        };
        let Some(mark) = self
            .shared
            .marks
            .mark(self.token, now_ms(), params.mark_stale_after_ms)
        else {
            return;
        };

        let triggered: Vec<u64> = self
            .stops
            .iter()
            .copied()
            .filter(|id| {
                self.orders
                    .get(id)
                    .map(|t| match t.order.side {
                        // Stop-long fires when the mark rises to the
                        // trigger, stop-short when it falls to it.
                        Side::Long => mark.price >= t.order.limit_price,
                        Side::Short => mark.price <= t.order.limit_price,
                    })
                    .unwrap_or(false)
            })
            .collect();

        for id in triggered {
            self.stops.retain(|s| *s != id);
            let Some(tracked) = self.orders.remove(&id) else {
                continue;
            };
            info!(token = %self.token, order_id = id, "stop order triggered");
            self.execute_triggered_stop(tracked, &params).await;
        }
    }

    async fn execute_triggered_stop(&mut self, tracked: TrackedOrder, params: &TokenParams) {
        let mut order = tracked.order;
        let effective_type = match order.order_type {
            OrderType::StopLimit => OrderType::Limit,
            _ => OrderType::Market,
        };
        let mut ctx = TakerCtx {
            order_id: order.id,
            trader: order.trader,
            side: order.side,
            leverage: order.leverage,
            lock_ref_price: tracked.lock_ref_price,
            locked_remaining: tracked.locked_remaining,
            taker_fee_bps: params.taker_fee_bps,
            maker_fee_bps: params.maker_fee_bps,
        };
        let taker = TakerOrder {
            id: order.id,
            trader: order.trader,
            side: order.side,
            order_type: effective_type,
            limit_price: order.limit_price,
            size: order.size_remaining,
            leverage: order.leverage,
            deadline: order.deadline,
        };
        let outcome = self.book.match_taker(&taker, now_secs());
        for expired in &outcome.evicted_expired {
            self.finalize_evicted(expired, OrderStatus::Expired, true).await;
        }
        let mut any_fill = false;
        for fill in &outcome.fills {
            match self.process_fill(&mut ctx, fill, true).await {
                Ok(_) => any_fill = true,
                Err(e) => {
                    if e.is_invariant_violation() {
                        self.enter_quarantine(e.code()).await;
                        return;
                    }
                    warn!(token = %self.token, error = %e, "stop execution fill failed");
                }
            }
        }

        order.size_remaining = outcome.taker_remaining;
        if outcome.taker_remaining == 0 {
            self.release_lock_dust(&mut ctx);
            order.status = OrderStatus::Filled;
        } else if effective_type == OrderType::Limit {
            let resting = BookOrder {
                id: order.id,
                trader: order.trader,
                side: order.side,
                price: order.limit_price,
                size_original: order.size_original,
                size_remaining: order.size_remaining,
                leverage: order.leverage,
                deadline: order.deadline,
                seq: 0,
            };
            self.book.rest(resting);
            order.status = if any_fill {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::New
            };
            order.updated_at = now_ms();
            self.orders.insert(
                order.id,
                TrackedOrder {
                    order: order.clone(),
                    locked_remaining: ctx.locked_remaining,
                    lock_ref_price: ctx.lock_ref_price,
                },
            );
            self.persist_order(&order).await;
            self.publish_book();
            return;
        } else {
            // Stop-market remainder cancels; collateral returns.
            self.release_lock_dust(&mut ctx);
            order.status = if any_fill {
                OrderStatus::Filled
            } else {
                OrderStatus::Cancelled
            };
        }
        order.updated_at = now_ms();
        self.persist_order(&order).await;
        self.publish_book();
    }

    // --- risk ------------------------------------------------------------

    async fn risk_scan(&mut self, reactive: bool) {
        if self.quarantined {
            return;
        }
        let Ok(params) = self.shared.registry.params(self.token) else {
            return;
        };
        let now = now_ms();
        if !reactive && now - self.last_risk_sweep_ms < params.risk_tick_interval_ms as i64 {
            return;
        }
        self.last_risk_sweep_ms = now;

        // Circuit breaker: a mark feed lost well past its staleness
        // horizon pauses the token (risk decisions continue on fallback).
        if let Some(age) = self.shared.marks.chain_age_ms(self.token, now) {
            if age > 2 * params.mark_stale_after_ms as i64
                && self.shared.registry.state(self.token) == Ok(TokenState::Active)
            {
                if let Ok(event) = self
                    .shared
                    .registry
                    .pause(self.token, "mark feed stale beyond limit")
                {
                    warn!(token = %self.token, age_ms = age, "circuit breaker paused token");
                    self.shared.broadcaster.publish(
                        Topic::Lifecycle(self.token),
                        EventPayload::Lifecycle {
                            token: self.token,
                            state: event.state.as_str().to_string(),
                            reason: event.reason,
                        },
                    );
                }
            }
        }

        let Some(mark) = self
            .shared
            .marks
            .mark(self.token, now, params.mark_stale_after_ms)
        else {
            return;
        };
        if mark.stale {
            debug!(token = %self.token, "risk scan on stale mark");
        }

        // Assess every active pair, worst margin first.
        let mut breaches: Vec<(u64, risk::Breach)> = Vec::new();
        for pair in self.shared.pairs.active_by_token(self.token) {
            match risk::assess_pair(&pair, mark.price, params.maintenance_margin_bps) {
                Ok(Some(breach)) => breaches.push((pair.pair_id, breach)),
                Ok(None) => {}
                Err(e) => {
                    if e.is_invariant_violation() {
                        self.enter_quarantine(e.code()).await;
                        return;
                    }
                }
            }
        }
        breaches.sort_by_key(|(_, b)| b.margin_bps);

        for (pair_id, breach) in breaches {
            if let Err(e) = self.liquidate(pair_id, breach, mark.price).await {
                if e.is_invariant_violation() {
                    self.enter_quarantine(e.code()).await;
                    return;
                }
                warn!(token = %self.token, pair_id, error = %e, "liquidation failed");
            }
        }
    }

    async fn liquidate(&mut self, pair_id: u64, breach: risk::Breach, mark: Amount) -> EngineResult<()> {
        // The pair may have been consumed by an earlier close this sweep.
        let Ok(pair) = self.shared.pairs.get(pair_id) else {
            return Ok(());
        };
        if pair.status != PairStatus::Active {
            return Ok(());
        }
        let survivor_side = breach.side.opposite();
        let survivor = FillParty {
            trader: pair.trader_on(survivor_side),
            leverage: pair.leverage(survivor_side),
        };
        let size = pair.size;

        let funding_index = self.shared.funding.index(self.token);
        let close = self.shared.pairs.close_slice(
            pair_id,
            size,
            mark,
            funding_index,
            CloseReason::Liquidation(breach.side),
            self.shared.config.liquidation_fee_bps,
        )?;
        metrics::increment_counter!("memeperp_liquidations_total");
        info!(
            token = %self.token,
            pair_id,
            side = ?breach.side,
            margin_bps = breach.margin_bps,
            "pair liquidated"
        );
        self.apply_close(&close).await?;

        if breach.both_breached {
            self.auto_deleverage(pair_id, survivor, survivor_side, size, mark).await;
        }
        Ok(())
    }

    /// ADL hook: the surviving side of a double breach is returned to the
    /// book as a synthetic market order at mark. Without crossing
    /// liquidity the closure stands as a force-close at mark and the pair
    /// is annotated accordingly.
    async fn auto_deleverage(
        &mut self,
        pair_id: u64,
        survivor: FillParty,
        side: Side,
        size: Amount,
        mark: Amount,
    ) {
        let collateral = match fixed::collateral_for(size, mark, survivor.leverage) {
            Ok(c) => c,
            Err(_) => return,
        };
        if self.shared.ledger.lock(survivor.trader, collateral).is_err() {
            self.shared.pairs.mark_adl(pair_id);
            return;
        }
        let params = match self.shared.registry.params(self.token) {
            Ok(p) => p,
            Err(_) => {
                self.shared.ledger.release(survivor.trader, collateral);
                return;
            }
        };
        let order_id = self.shared.order_id();
        let mut ctx = TakerCtx {
            order_id,
            trader: survivor.trader,
            side,
            leverage: survivor.leverage,
            lock_ref_price: mark,
            locked_remaining: collateral,
            // Re-pairing is engine-initiated; no fees.
            taker_fee_bps: params.taker_fee_bps,
            maker_fee_bps: params.maker_fee_bps,
        };
        let taker = TakerOrder {
            id: order_id,
            trader: survivor.trader,
            side,
            order_type: OrderType::Market,
            limit_price: 0,
            size,
            leverage: survivor.leverage,
            deadline: now_secs() + 60,
        };
        let outcome = self.book.match_taker(&taker, now_secs());
        let mut any_fill = false;
        for fill in &outcome.fills {
            match self.process_fill(&mut ctx, fill, false).await {
                Ok(_) => any_fill = true,
                Err(e) => warn!(token = %self.token, error = %e, "adl re-pair fill failed"),
            }
        }
        self.release_lock_dust(&mut ctx);
        if !any_fill {
            self.shared.pairs.mark_adl(pair_id);
            info!(token = %self.token, pair_id, "no re-pair liquidity; pair closed via adl");
        } else {
            self.publish_book();
        }
    }

    // --- funding ---------------------------------------------------------

    async fn funding_tick(&mut self) {
        if self.quarantined {
            return;
        }
        let Ok(params) = self.shared.registry.params(self.token) else {
            return;
        };
        let Ok(stats) = self.shared.registry.stats(self.token) else {
            return;
        };
        let Some(mark) = self
            .shared
            .marks
            .mark(self.token, now_ms(), params.mark_stale_after_ms)
        else {
            return;
        };

        let tick = match self.shared.funding.maybe_tick(
            self.token,
            stats.open_interest_long,
            stats.open_interest_short,
            mark.price,
            0,
            now_secs(),
            params.funding_interval_secs,
        ) {
            Ok(Some(tick)) => tick,
            Ok(None) => return,
            Err(e) => {
                warn!(token = %self.token, error = %e, "funding tick failed");
                return;
            }
        };

        // Keeper sweep: fold the fresh index into every active pair so
        // margin ratios see it without waiting for a close.
        if let Err(e) = self
            .shared
            .pairs
            .accrue_token_funding(self.token, tick.index)
        {
            if e.is_invariant_violation() {
                self.enter_quarantine(e.code()).await;
                return;
            }
        }
        if let Err(e) = self
            .shared
            .repo
            .funding_persist(self.token, tick.index, now_secs())
            .await
        {
            warn!(token = %self.token, error = %e, "funding persist failed");
        }
        self.shared.broadcaster.publish(
            Topic::Funding(self.token),
            EventPayload::Funding {
                token: self.token,
                rate_bps: tick.rate_bps,
                index: tick.index,
            },
        );
    }

    // --- plumbing --------------------------------------------------------

    fn publish_book(&self) {
        let depth = self.book.depth(10, now_ms());
        self.shared
            .broadcaster
            .publish(Topic::Book(self.token), EventPayload::BookSnapshot(depth));
    }

    fn publish_positions(&self, traders: &[Address]) {
        for trader in traders {
            for view in self.shared.pairs.position_views(*trader) {
                if view.token == self.token {
                    self.shared
                        .broadcaster
                        .publish(Topic::Positions(*trader), EventPayload::Position(view));
                }
            }
        }
    }

    /// Repository writes retry a few times; history lags rather than
    /// blocking the matching path.
    async fn persist_order(&self, order: &Order) {
        for attempt in 0..3u32 {
            match self.shared.repo.orders_save(order).await {
                Ok(()) => return,
                Err(e) if attempt + 1 < 3 => {
                    debug!(error = %e, attempt, "order persist retry");
                    tokio::time::sleep(std::time::Duration::from_millis(50 << attempt)).await;
                }
                Err(e) => {
                    warn!(order_id = order.id, error = %e, "order persist failed");
                    return;
                }
            }
        }
    }

    async fn repo_save_pair(&self, pair: &crate::models::PairedPosition) {
        for attempt in 0..3u32 {
            match self.shared.repo.positions_save(pair).await {
                Ok(()) => return,
                Err(e) if attempt + 1 < 3 => {
                    debug!(error = %e, attempt, "pair persist retry");
                    tokio::time::sleep(std::time::Duration::from_millis(50 << attempt)).await;
                }
                Err(e) => {
                    warn!(pair_id = pair.pair_id, error = %e, "pair persist failed");
                    return;
                }
            }
        }
    }
}

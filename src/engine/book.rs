//! Per-token limit order book.
//!
//! Two price ladders (bids iterated descending, asks ascending), each an
//! ordered map from price to a FIFO level. Matching walks the opposite
//! ladder from the best price outward, executes at the maker's limit
//! price, and enforces price-time priority through per-book arrival
//! sequence numbers. Expired makers encountered mid-walk are evicted, do
//! not match, and have their collateral released by the caller.
//!
//! Invariant at rest: `best_bid < best_ask` (or a side is empty). Every
//! queued order has non-zero remaining size and a future deadline as of
//! its last touch.

use alloy_primitives::Address;
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::fixed::Amount;
use crate::models::{BookDepth, DepthLevel, OrderType, Side};

/// A resting maker order. Collateral for the full size was locked when it
/// was accepted; the book itself never touches the ledger.
#[derive(Debug, Clone)]
pub struct BookOrder {
    pub id: u64,
    pub trader: Address,
    pub side: Side,
    pub price: Amount,
    pub size_original: Amount,
    pub size_remaining: Amount,
    /// 1e4 scale; carried so pair construction can use the maker's terms.
    pub leverage: u128,
    /// Unix seconds.
    pub deadline: u64,
    /// Arrival sequence; lower wins inside a level.
    pub seq: u64,
}

/// An incoming taker before any book interaction.
#[derive(Debug, Clone)]
pub struct TakerOrder {
    pub id: u64,
    pub trader: Address,
    pub side: Side,
    pub order_type: OrderType,
    pub limit_price: Amount,
    pub size: Amount,
    pub leverage: u128,
    pub deadline: u64,
}

/// One maker consumption from a taker walk.
#[derive(Debug, Clone)]
pub struct Fill {
    pub maker_order_id: u64,
    pub maker_trader: Address,
    pub maker_leverage: u128,
    /// Execution price = maker's limit price.
    pub price: Amount,
    pub size: Amount,
    pub maker_remaining: Amount,
}

/// Result of a taker walk. The caller turns fills into trades and decides
/// what to do with the residual.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub fills: Vec<Fill>,
    pub taker_remaining: Amount,
    /// Makers evicted because their deadline passed; collateral must be
    /// released and status set to Expired.
    pub evicted_expired: Vec<BookOrder>,
}

#[derive(Debug, Default)]
struct Level {
    orders: VecDeque<BookOrder>,
    total_size: Amount,
}

impl Level {
    fn push(&mut self, order: BookOrder) {
        self.total_size = self.total_size.saturating_add(order.size_remaining);
        self.orders.push_back(order);
    }

    fn remove(&mut self, order_id: u64) -> Option<BookOrder> {
        let pos = self.orders.iter().position(|o| o.id == order_id)?;
        let order = self.orders.remove(pos)?;
        self.total_size = self.total_size.saturating_sub(order.size_remaining);
        Some(order)
    }
}

pub struct OrderBook {
    token: Address,
    bids: BTreeMap<Amount, Level>,
    asks: BTreeMap<Amount, Level>,
    /// order id -> (side, price) for O(log n) cancellation.
    index: HashMap<u64, (Side, Amount)>,
    next_seq: u64,
    pub last_trade_price: Amount,
}

impl OrderBook {
    pub fn new(token: Address) -> Self {
        Self {
            token,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
            last_trade_price: 0,
        }
    }

    pub fn token(&self) -> Address {
        self.token
    }

    pub fn best_bid(&self) -> Option<Amount> {
        self.bids.last_key_value().map(|(p, _)| *p)
    }

    pub fn best_ask(&self) -> Option<Amount> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    pub fn resting_orders(&self) -> usize {
        self.index.len()
    }

    fn ladder(&mut self, side: Side) -> &mut BTreeMap<Amount, Level> {
        match side {
            Side::Long => &mut self.bids,
            Side::Short => &mut self.asks,
        }
    }

    /// Best opposite price that crosses the taker, if any.
    fn best_crossing(&self, taker: &TakerOrder) -> Option<Amount> {
        match taker.side {
            // A long taker lifts the lowest ask.
            Side::Long => {
                let best = *self.asks.first_key_value()?.0;
                match taker.order_type {
                    OrderType::Market => Some(best),
                    _ if best <= taker.limit_price => Some(best),
                    _ => None,
                }
            }
            // A short taker hits the highest bid.
            Side::Short => {
                let best = *self.bids.last_key_value()?.0;
                match taker.order_type {
                    OrderType::Market => Some(best),
                    _ if best >= taker.limit_price => Some(best),
                    _ => None,
                }
            }
        }
    }

    /// Walk the opposite ladder consuming crossing liquidity in
    /// price-time order. Self-owned makers are skipped, never consumed.
    pub fn match_taker(&mut self, taker: &TakerOrder, now_secs: u64) -> MatchOutcome {
        let mut outcome = MatchOutcome {
            taker_remaining: taker.size,
            ..Default::default()
        };
        let mut last_price = None;

        'walk: while outcome.taker_remaining > 0 {
            let Some(level_price) = self.best_crossing(taker) else {
                break;
            };
            let (ladder, index) = match taker.side.opposite() {
                Side::Long => (&mut self.bids, &mut self.index),
                Side::Short => (&mut self.asks, &mut self.index),
            };
            let Some(level) = ladder.get_mut(&level_price) else {
                break;
            };

            // Consume the FIFO queue at this level.
            let mut skipped_self: Vec<BookOrder> = Vec::new();
            while outcome.taker_remaining > 0 {
                let Some(mut maker) = level.orders.pop_front() else {
                    break;
                };
                level.total_size = level.total_size.saturating_sub(maker.size_remaining);

                if maker.deadline <= now_secs {
                    index.remove(&maker.id);
                    outcome.evicted_expired.push(maker);
                    continue;
                }
                if maker.trader == taker.trader {
                    skipped_self.push(maker);
                    continue;
                }

                let fill = maker.size_remaining.min(outcome.taker_remaining);
                maker.size_remaining -= fill;
                outcome.taker_remaining -= fill;
                last_price = Some(maker.price);
                outcome.fills.push(Fill {
                    maker_order_id: maker.id,
                    maker_trader: maker.trader,
                    maker_leverage: maker.leverage,
                    price: maker.price,
                    size: fill,
                    maker_remaining: maker.size_remaining,
                });

                if maker.size_remaining > 0 {
                    // Partially consumed maker goes back to the front.
                    level.total_size = level.total_size.saturating_add(maker.size_remaining);
                    level.orders.push_front(maker);
                    debug_assert_eq!(outcome.taker_remaining, 0);
                } else {
                    index.remove(&maker.id);
                }
            }

            // Skipped self orders keep their queue position ahead of any
            // later arrivals at this level.
            for maker in skipped_self.into_iter().rev() {
                level.total_size = level.total_size.saturating_add(maker.size_remaining);
                level.orders.push_front(maker);
            }

            if level.orders.is_empty() {
                ladder.remove(&level_price);
            } else if level.orders.iter().all(|o| o.trader == taker.trader) {
                // Only self liquidity left at the best level; stop rather
                // than spin on it.
                break 'walk;
            }
        }

        if let Some(price) = last_price {
            self.last_trade_price = price;
        }
        outcome
    }

    /// Rest a limit residual at its own price. Returns the assigned
    /// arrival sequence.
    pub fn rest(&mut self, mut order: BookOrder) -> u64 {
        self.next_seq += 1;
        order.seq = self.next_seq;
        let seq = order.seq;
        self.index.insert(order.id, (order.side, order.price));
        self.ladder(order.side)
            .entry(order.price)
            .or_default()
            .push(order);
        seq
    }

    /// Remove a resting order by id.
    pub fn cancel(&mut self, order_id: u64) -> Option<BookOrder> {
        let (side, price) = self.index.remove(&order_id)?;
        let ladder = self.ladder(side);
        let level = ladder.get_mut(&price)?;
        let order = level.remove(order_id);
        if level.orders.is_empty() {
            ladder.remove(&price);
        }
        order
    }

    /// Evict every resting order whose deadline has passed.
    pub fn prune_expired(&mut self, now_secs: u64) -> Vec<BookOrder> {
        let mut expired_ids: Vec<u64> = Vec::new();
        for ladder in [&self.bids, &self.asks] {
            for level in ladder.values() {
                for order in &level.orders {
                    if order.deadline <= now_secs {
                        expired_ids.push(order.id);
                    }
                }
            }
        }
        expired_ids
            .into_iter()
            .filter_map(|id| self.cancel(id))
            .collect()
    }

    /// Drain the whole book (graceful shutdown, quarantine).
    pub fn drain(&mut self) -> Vec<BookOrder> {
        let ids: Vec<u64> = self.index.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.cancel(id)).collect()
    }

    /// Top-N aggregated depth per side.
    pub fn depth(&self, levels: usize, now_ms: i64) -> BookDepth {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(levels)
            .map(|(price, level)| DepthLevel {
                price: *price,
                total_size: level.total_size,
                order_count: level.orders.len(),
            })
            .collect();
        let asks = self
            .asks
            .iter()
            .take(levels)
            .map(|(price, level)| DepthLevel {
                price: *price,
                total_size: level.total_size,
                order_count: level.orders.len(),
            })
            .collect();
        BookDepth {
            token: self.token,
            bids,
            asks,
            best_bid: self.best_bid().unwrap_or(0),
            best_ask: self.best_ask().unwrap_or(0),
            last_trade_price: self.last_trade_price,
            timestamp: now_ms,
        }
    }

    /// True when the ladders cross; must never hold at rest.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::ONE;

    const FUTURE: u64 = 4_000_000_000;

    fn token() -> Address {
        Address::repeat_byte(0x11)
    }

    fn trader(tag: u8) -> Address {
        Address::repeat_byte(tag)
    }

    fn resting(id: u64, side: Side, price: Amount, size: Amount, who: u8) -> BookOrder {
        BookOrder {
            id,
            trader: trader(who),
            side,
            price,
            size_original: size,
            size_remaining: size,
            leverage: 5 * crate::fixed::LEVERAGE_ONE,
            deadline: FUTURE,
            seq: 0,
        }
    }

    fn taker(id: u64, side: Side, order_type: OrderType, price: Amount, size: Amount, who: u8) -> TakerOrder {
        TakerOrder {
            id,
            trader: trader(who),
            side,
            order_type,
            limit_price: price,
            size,
            leverage: 5 * crate::fixed::LEVERAGE_ONE,
            deadline: FUTURE,
        }
    }

    #[test]
    fn market_taker_consumes_best_first() {
        let mut book = OrderBook::new(token());
        book.rest(resting(1, Side::Short, 2 * ONE, ONE, 0x0a));
        book.rest(resting(2, Side::Short, 3 * ONE, ONE, 0x0b));

        let out = book.match_taker(
            &taker(10, Side::Long, OrderType::Market, 0, ONE, 0x0c),
            1_000,
        );
        assert_eq!(out.fills.len(), 1);
        assert_eq!(out.fills[0].price, 2 * ONE);
        assert_eq!(out.taker_remaining, 0);
        assert_eq!(book.best_ask(), Some(3 * ONE));
    }

    #[test]
    fn limit_taker_stops_at_its_price() {
        let mut book = OrderBook::new(token());
        book.rest(resting(1, Side::Short, 2 * ONE, ONE, 0x0a));
        book.rest(resting(2, Side::Short, 3 * ONE, ONE, 0x0a));

        let out = book.match_taker(
            &taker(10, Side::Long, OrderType::Limit, 2 * ONE, 3 * ONE, 0x0c),
            1_000,
        );
        assert_eq!(out.fills.len(), 1);
        assert_eq!(out.taker_remaining, 2 * ONE);
        // The 3.0 ask does not cross a 2.0 limit.
        assert_eq!(book.best_ask(), Some(3 * ONE));
    }

    #[test]
    fn execution_at_maker_price_improves_taker() {
        let mut book = OrderBook::new(token());
        book.rest(resting(1, Side::Short, 2 * ONE, ONE, 0x0a));
        let out = book.match_taker(
            &taker(10, Side::Long, OrderType::Limit, 5 * ONE, ONE, 0x0c),
            1_000,
        );
        assert_eq!(out.fills[0].price, 2 * ONE);
    }

    #[test]
    fn price_time_priority_within_level() {
        let mut book = OrderBook::new(token());
        book.rest(resting(1, Side::Short, 2 * ONE, ONE, 0x0a));
        book.rest(resting(2, Side::Short, 2 * ONE, ONE, 0x0b));

        let out = book.match_taker(
            &taker(10, Side::Long, OrderType::Market, 0, ONE + ONE / 2, 0x0c),
            1_000,
        );
        // First maker fully consumed before the second sees any fill.
        assert_eq!(out.fills[0].maker_order_id, 1);
        assert_eq!(out.fills[0].size, ONE);
        assert_eq!(out.fills[1].maker_order_id, 2);
        assert_eq!(out.fills[1].size, ONE / 2);
        assert_eq!(out.fills[1].maker_remaining, ONE / 2);
    }

    #[test]
    fn exact_fill_removes_level_without_residue() {
        let mut book = OrderBook::new(token());
        book.rest(resting(1, Side::Short, 2 * ONE, ONE, 0x0a));
        let out = book.match_taker(
            &taker(10, Side::Long, OrderType::Limit, 2 * ONE, ONE, 0x0c),
            1_000,
        );
        assert_eq!(out.taker_remaining, 0);
        assert_eq!(book.best_ask(), None);
        assert_eq!(book.resting_orders(), 0);
    }

    #[test]
    fn expired_maker_is_evicted_and_skipped() {
        let mut book = OrderBook::new(token());
        let mut dead = resting(1, Side::Short, 2 * ONE, ONE, 0x0a);
        dead.deadline = 500;
        book.rest(dead);
        book.rest(resting(2, Side::Short, 2 * ONE, ONE, 0x0b));

        let out = book.match_taker(
            &taker(10, Side::Long, OrderType::Market, 0, ONE, 0x0c),
            1_000,
        );
        assert_eq!(out.evicted_expired.len(), 1);
        assert_eq!(out.evicted_expired[0].id, 1);
        assert_eq!(out.fills.len(), 1);
        assert_eq!(out.fills[0].maker_order_id, 2);
    }

    #[test]
    fn self_liquidity_is_never_consumed() {
        let mut book = OrderBook::new(token());
        book.rest(resting(1, Side::Short, 2 * ONE, ONE, 0x0c));
        let out = book.match_taker(
            &taker(10, Side::Long, OrderType::Market, 0, ONE, 0x0c),
            1_000,
        );
        assert!(out.fills.is_empty());
        assert_eq!(out.taker_remaining, ONE);
        // The skipped order keeps resting.
        assert_eq!(book.resting_orders(), 1);
    }

    #[test]
    fn self_order_keeps_queue_position() {
        let mut book = OrderBook::new(token());
        book.rest(resting(1, Side::Short, 2 * ONE, ONE, 0x0c));
        book.rest(resting(2, Side::Short, 2 * ONE, ONE, 0x0a));
        // Taker 0x0c skips its own maker but fills against 0x0a.
        let out = book.match_taker(
            &taker(10, Side::Long, OrderType::Market, 0, ONE, 0x0c),
            1_000,
        );
        assert_eq!(out.fills.len(), 1);
        assert_eq!(out.fills[0].maker_order_id, 2);
        // A third party now takes: the self-skipped order is still first.
        let out = book.match_taker(
            &taker(11, Side::Long, OrderType::Market, 0, ONE, 0x0b),
            1_000,
        );
        assert_eq!(out.fills[0].maker_order_id, 1);
    }

    #[test]
    fn cancel_unknown_returns_none() {
        let mut book = OrderBook::new(token());
        assert!(book.cancel(99).is_none());
        book.rest(resting(1, Side::Long, ONE, ONE, 0x0a));
        assert!(book.cancel(1).is_some());
        assert!(book.cancel(1).is_none());
    }

    #[test]
    fn prune_evicts_only_expired() {
        let mut book = OrderBook::new(token());
        let mut dead = resting(1, Side::Long, ONE, ONE, 0x0a);
        dead.deadline = 500;
        book.rest(dead);
        book.rest(resting(2, Side::Long, ONE, ONE, 0x0b));

        let evicted = book.prune_expired(1_000);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, 1);
        assert_eq!(book.resting_orders(), 1);
    }

    #[test]
    fn depth_aggregates_levels() {
        let mut book = OrderBook::new(token());
        book.rest(resting(1, Side::Long, ONE, ONE, 0x0a));
        book.rest(resting(2, Side::Long, ONE, ONE, 0x0b));
        book.rest(resting(3, Side::Long, ONE / 2, ONE, 0x0a));
        book.rest(resting(4, Side::Short, 2 * ONE, ONE, 0x0b));

        let depth = book.depth(10, 0);
        assert_eq!(depth.bids.len(), 2);
        assert_eq!(depth.bids[0].price, ONE);
        assert_eq!(depth.bids[0].total_size, 2 * ONE);
        assert_eq!(depth.bids[0].order_count, 2);
        assert_eq!(depth.best_ask, 2 * ONE);
        assert!(!book.is_crossed());
    }

    #[test]
    fn book_stays_uncrossed_after_taker_walk() {
        let mut book = OrderBook::new(token());
        book.rest(resting(1, Side::Long, 19 * ONE / 10, ONE, 0x0a));
        book.rest(resting(2, Side::Short, 21 * ONE / 10, ONE, 0x0b));
        let out = book.match_taker(
            &taker(10, Side::Long, OrderType::Limit, 2 * ONE, ONE, 0x0c),
            1_000,
        );
        assert!(out.fills.is_empty());
        assert!(!book.is_crossed());
    }
}

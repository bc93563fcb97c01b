//! Trade log and k-line (OHLCV) aggregation.
//!
//! Trades append to an in-memory buffer that a background task drains to
//! the repository; losing the unflushed tail on a crash is acceptable
//! because pair state, not the trade log, is the settlement source of
//! truth. K-lines bucket trades per resolution; a bucket becomes
//! immutable the moment its window closes and is flushed with the next
//! drain. Gaps (no-trade buckets) are not synthesized here.

use alloy_primitives::Address;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::fixed::Amount;
use crate::models::{amount_str, Trade};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl Resolution {
    pub const ALL: [Resolution; 6] = [
        Resolution::M1,
        Resolution::M5,
        Resolution::M15,
        Resolution::H1,
        Resolution::H4,
        Resolution::D1,
    ];

    pub fn seconds(self) -> i64 {
        match self {
            Resolution::M1 => 60,
            Resolution::M5 => 300,
            Resolution::M15 => 900,
            Resolution::H1 => 3_600,
            Resolution::H4 => 14_400,
            Resolution::D1 => 86_400,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::M1 => "1m",
            Resolution::M5 => "5m",
            Resolution::M15 => "15m",
            Resolution::H1 => "1h",
            Resolution::H4 => "4h",
            Resolution::D1 => "1d",
        }
    }

    pub fn parse(s: &str) -> Option<Resolution> {
        match s {
            "1m" => Some(Resolution::M1),
            "5m" => Some(Resolution::M5),
            "15m" => Some(Resolution::M15),
            "1h" => Some(Resolution::H1),
            "4h" => Some(Resolution::H4),
            "1d" => Some(Resolution::D1),
            _ => None,
        }
    }
}

/// One OHLCV bucket. `bucket_start` is unix seconds, aligned to the
/// resolution window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KlineBucket {
    pub token: Address,
    pub resolution: Resolution,
    pub bucket_start: i64,
    #[serde(with = "amount_str")]
    pub open: Amount,
    #[serde(with = "amount_str")]
    pub high: Amount,
    #[serde(with = "amount_str")]
    pub low: Amount,
    #[serde(with = "amount_str")]
    pub close: Amount,
    #[serde(with = "amount_str")]
    pub volume: Amount,
    pub trade_count: u64,
}

impl KlineBucket {
    fn seed(token: Address, resolution: Resolution, bucket_start: i64, trade: &Trade) -> Self {
        Self {
            token,
            resolution,
            bucket_start,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.size,
            trade_count: 1,
        }
    }

    fn absorb(&mut self, trade: &Trade) {
        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
        self.close = trade.price;
        self.volume = self.volume.saturating_add(trade.size);
        self.trade_count += 1;
    }
}

#[derive(Debug, Default)]
struct AggregatorState {
    /// Open bucket per (token, resolution).
    current: HashMap<(Address, Resolution), KlineBucket>,
    /// Closed buckets awaiting flush.
    closed: Vec<KlineBucket>,
    /// Unflushed trades.
    pending_trades: Vec<Trade>,
}

/// Single-writer aggregation over the executed trade stream. The matching
/// workers call `record`; a background driver drains with `take_flush`.
#[derive(Debug, Default)]
pub struct TradeAggregator {
    state: Mutex<AggregatorState>,
}

/// A drained batch ready for repository writes: the raw trades plus every
/// bucket (closed buckets final, current buckets upserted in place).
#[derive(Debug, Default)]
pub struct FlushBatch {
    pub trades: Vec<Trade>,
    pub closed_buckets: Vec<KlineBucket>,
    pub open_buckets: Vec<KlineBucket>,
}

impl TradeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one executed trade into the log buffer and every resolution.
    /// Returns the updated buckets for broadcast.
    pub fn record(&self, trade: &Trade) -> Vec<KlineBucket> {
        let mut state = self.state.lock();
        state.pending_trades.push(trade.clone());

        let ts_secs = trade.timestamp / 1_000;
        let mut updated = Vec::with_capacity(Resolution::ALL.len());
        for resolution in Resolution::ALL {
            let start = ts_secs - ts_secs.rem_euclid(resolution.seconds());
            let key = (trade.token, resolution);
            match state.current.get_mut(&key) {
                Some(bucket) if bucket.bucket_start == start => {
                    bucket.absorb(trade);
                    updated.push(bucket.clone());
                }
                Some(bucket) if bucket.bucket_start < start => {
                    let finished = std::mem::replace(
                        bucket,
                        KlineBucket::seed(trade.token, resolution, start, trade),
                    );
                    let fresh = bucket.clone();
                    state.closed.push(finished);
                    updated.push(fresh);
                }
                Some(_) => {
                    // Late trade for an already-rolled window; closed
                    // buckets are immutable, so it is dropped from the
                    // k-line view (it is still in the trade log).
                }
                None => {
                    let bucket = KlineBucket::seed(trade.token, resolution, start, trade);
                    state.current.insert(key, bucket.clone());
                    updated.push(bucket);
                }
            }
        }
        updated
    }

    /// Drain everything that needs persisting.
    pub fn take_flush(&self) -> FlushBatch {
        let mut state = self.state.lock();
        FlushBatch {
            trades: std::mem::take(&mut state.pending_trades),
            closed_buckets: std::mem::take(&mut state.closed),
            open_buckets: state.current.values().cloned().collect(),
        }
    }

    /// Open bucket for a (token, resolution), if any trade has printed in
    /// the current window.
    pub fn current_bucket(&self, token: Address, resolution: Resolution) -> Option<KlineBucket> {
        self.state
            .lock()
            .current
            .get(&(token, resolution))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::ONE;

    fn trade(ts_ms: i64, price: Amount, size: Amount) -> Trade {
        Trade {
            id: 1,
            token: Address::repeat_byte(0x11),
            maker_order_id: 1,
            taker_order_id: 2,
            maker: Address::repeat_byte(0x0a),
            taker: Address::repeat_byte(0x0b),
            price,
            size,
            timestamp: ts_ms,
            maker_fee: 0,
            taker_fee: 0,
            pair_id: None,
        }
    }

    #[test]
    fn first_trade_seeds_every_resolution() {
        let agg = TradeAggregator::new();
        let updated = agg.record(&trade(60_000, 2 * ONE, ONE));
        assert_eq!(updated.len(), Resolution::ALL.len());
        for bucket in updated {
            assert_eq!(bucket.open, 2 * ONE);
            assert_eq!(bucket.close, 2 * ONE);
            assert_eq!(bucket.volume, ONE);
            assert_eq!(bucket.trade_count, 1);
            assert_eq!(bucket.bucket_start % bucket.resolution.seconds(), 0);
        }
    }

    #[test]
    fn ohlcv_tracks_within_bucket() {
        let agg = TradeAggregator::new();
        agg.record(&trade(60_000, 2 * ONE, ONE));
        agg.record(&trade(61_000, 3 * ONE, ONE));
        agg.record(&trade(62_000, ONE, ONE));
        let b = agg
            .current_bucket(Address::repeat_byte(0x11), Resolution::M1)
            .unwrap();
        assert_eq!(b.open, 2 * ONE);
        assert_eq!(b.high, 3 * ONE);
        assert_eq!(b.low, ONE);
        assert_eq!(b.close, ONE);
        assert_eq!(b.volume, 3 * ONE);
        assert_eq!(b.trade_count, 3);
    }

    #[test]
    fn window_rollover_closes_bucket() {
        let agg = TradeAggregator::new();
        agg.record(&trade(60_000, 2 * ONE, ONE));
        agg.record(&trade(125_000, 3 * ONE, ONE)); // next 1m window

        let flush = agg.take_flush();
        let closed_1m: Vec<_> = flush
            .closed_buckets
            .iter()
            .filter(|b| b.resolution == Resolution::M1)
            .collect();
        assert_eq!(closed_1m.len(), 1);
        assert_eq!(closed_1m[0].bucket_start, 60);
        assert_eq!(closed_1m[0].close, 2 * ONE);

        let b = agg
            .current_bucket(Address::repeat_byte(0x11), Resolution::M1)
            .unwrap();
        assert_eq!(b.bucket_start, 120);
        assert_eq!(b.open, 3 * ONE);
    }

    #[test]
    fn flush_drains_trades_once() {
        let agg = TradeAggregator::new();
        agg.record(&trade(60_000, 2 * ONE, ONE));
        let first = agg.take_flush();
        assert_eq!(first.trades.len(), 1);
        let second = agg.take_flush();
        assert!(second.trades.is_empty());
        assert!(second.closed_buckets.is_empty());
        // Open buckets are still reported for upsert.
        assert!(!second.open_buckets.is_empty());
    }

    #[test]
    fn resolution_string_round_trip() {
        for r in Resolution::ALL {
            assert_eq!(Resolution::parse(r.as_str()), Some(r));
        }
        assert!(Resolution::parse("2m").is_none());
    }
}

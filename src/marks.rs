//! Per-token mark price store.
//!
//! The chain gateway pushes mark updates; each token holds its latest
//! accepted point in an `ArcSwap` slot so the risk path reads without
//! locking. An update is accepted only if it is newer than the held point
//! and within the token's `max_price_step` of the last good price,
//! otherwise it is quarantined and the last good price is retained. When
//! the chain mark goes stale the feed falls back to the last trade price
//! and flags the result `Stale`.

use alloy_primitives::Address;
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::fixed::{self, Amount};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkSource {
    Chain,
    LastTrade,
}

/// A mark price read. `stale` is set when the value came from the
/// last-trade fallback; risk decisions made under it still execute but
/// are logged as degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPoint {
    #[serde(with = "crate::models::amount_str")]
    pub price: Amount,
    /// Unix millis of the underlying observation.
    pub timestamp: i64,
    pub source: MarkSource,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    chain: Option<(Amount, i64)>,
    last_trade: Option<(Amount, i64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkUpdate {
    Accepted,
    /// Older than the held point; dropped.
    OutOfDate,
    /// Step exceeded the per-token bound; dropped and logged.
    Quarantined,
}

#[derive(Default)]
pub struct MarkPriceFeed {
    slots: RwLock<HashMap<Address, Arc<ArcSwap<Slot>>>>,
}

impl MarkPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, token: Address) -> Arc<ArcSwap<Slot>> {
        if let Some(slot) = self.slots.read().get(&token) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(token)
            .or_insert_with(|| Arc::new(ArcSwap::from_pointee(Slot::default())))
            .clone()
    }

    /// Apply a pushed chain mark. `max_step_bps` is the token's accepted
    /// relative move versus the last good chain price.
    pub fn update_from_chain(
        &self,
        token: Address,
        price: Amount,
        timestamp: i64,
        max_step_bps: u128,
    ) -> MarkUpdate {
        if price == 0 {
            return MarkUpdate::Quarantined;
        }
        let slot = self.slot(token);
        let current = **slot.load();

        if let Some((held_price, held_ts)) = current.chain {
            if timestamp <= held_ts {
                return MarkUpdate::OutOfDate;
            }
            let step = held_price.abs_diff(price);
            let bound = fixed::apply_bps(held_price, max_step_bps).unwrap_or(0);
            if step > bound {
                warn!(
                    %token,
                    held = %held_price,
                    proposed = %price,
                    max_step_bps = %max_step_bps,
                    "mark update outside step bound; quarantined"
                );
                return MarkUpdate::Quarantined;
            }
        }

        slot.store(Arc::new(Slot {
            chain: Some((price, timestamp)),
            last_trade: current.last_trade,
        }));
        MarkUpdate::Accepted
    }

    /// Record an executed trade price for the staleness fallback.
    pub fn record_trade_price(&self, token: Address, price: Amount, timestamp: i64) {
        let slot = self.slot(token);
        let current = **slot.load();
        if let Some((_, held_ts)) = current.last_trade {
            if timestamp < held_ts {
                return;
            }
        }
        slot.store(Arc::new(Slot {
            chain: current.chain,
            last_trade: Some((price, timestamp)),
        }));
    }

    /// Current mark for risk and pricing. `now` unix millis.
    pub fn mark(&self, token: Address, now: i64, stale_after_ms: u64) -> Option<MarkPoint> {
        let slot = self.slot(token);
        let current = **slot.load();

        if let Some((price, ts)) = current.chain {
            if now.saturating_sub(ts) <= stale_after_ms as i64 {
                return Some(MarkPoint {
                    price,
                    timestamp: ts,
                    source: MarkSource::Chain,
                    stale: false,
                });
            }
        }
        if let Some((price, ts)) = current.last_trade {
            return Some(MarkPoint {
                price,
                timestamp: ts,
                source: MarkSource::LastTrade,
                stale: true,
            });
        }
        // A stale chain mark with no trade history still beats nothing.
        current.chain.map(|(price, ts)| MarkPoint {
            price,
            timestamp: ts,
            source: MarkSource::Chain,
            stale: true,
        })
    }

    /// Millis since the newest chain observation, if any.
    pub fn chain_age_ms(&self, token: Address, now: i64) -> Option<i64> {
        let slot = self.slot(token);
        let current = **slot.load();
        current.chain.map(|(_, ts)| now.saturating_sub(ts))
    }
}

//! Per-token funding index.
//!
//! Every funding period the rate is derived from the open-interest
//! imbalance (plus an optional mark-vs-index premium), clipped, and folded
//! into a cumulative index denominated in quote per unit of size:
//!
//!   rate_bps = clip(k * (OI_L - OI_S) / (OI_L + OI_S) + premium, ±max)
//!   index   += rate_bps * mark / BPS_ONE
//!
//! Pairs accrue lazily against the index on touch (see the pair store);
//! a positive index delta means longs pay shorts.

use alloy_primitives::Address;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::EngineResult;
use crate::fixed::{self, Amount, SignedAmount, BPS_ONE};

#[derive(Debug, Clone, Copy, Default)]
struct TokenFunding {
    index: SignedAmount,
    last_rate_bps: i128,
    last_tick_secs: u64,
}

/// A completed funding period for one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FundingTick {
    pub token: Address,
    pub rate_bps: i128,
    pub index: SignedAmount,
}

pub struct FundingEngine {
    k_bps: u128,
    max_rate_bps: u128,
    tokens: RwLock<HashMap<Address, TokenFunding>>,
}

impl FundingEngine {
    pub fn new(k_bps: u128, max_rate_bps: u128) -> Self {
        Self {
            k_bps,
            max_rate_bps,
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Current cumulative index for a token.
    pub fn index(&self, token: Address) -> SignedAmount {
        self.tokens
            .read()
            .get(&token)
            .map(|t| t.index)
            .unwrap_or(0)
    }

    /// Most recent period rate, for display and broadcast.
    pub fn last_rate_bps(&self, token: Address) -> i128 {
        self.tokens
            .read()
            .get(&token)
            .map(|t| t.last_rate_bps)
            .unwrap_or(0)
    }

    /// Restore from the repository.
    pub fn hydrate(&self, token: Address, index: SignedAmount, last_tick_secs: u64) {
        self.tokens.write().insert(
            token,
            TokenFunding {
                index,
                last_rate_bps: 0,
                last_tick_secs,
            },
        );
    }

    /// The clipped period rate for the given imbalance and premium.
    pub fn period_rate_bps(
        &self,
        oi_long: Amount,
        oi_short: Amount,
        premium_bps: i128,
    ) -> EngineResult<i128> {
        let total = oi_long.saturating_add(oi_short);
        let imbalance_term = if total == 0 {
            0
        } else {
            let long_i = i128::try_from(oi_long)
                .map_err(|_| crate::error::EngineError::ArithmeticOverflow)?;
            let short_i = i128::try_from(oi_short)
                .map_err(|_| crate::error::EngineError::ArithmeticOverflow)?;
            fixed::mul_div_signed(self.k_bps as i128, long_i - short_i, total)?
        };
        let raw = imbalance_term + premium_bps;
        let cap = self.max_rate_bps as i128;
        Ok(raw.clamp(-cap, cap))
    }

    /// Advance the token's funding period if `interval_secs` has elapsed.
    /// Returns the tick to broadcast, or `None` when inside the period.
    #[allow(clippy::too_many_arguments)]
    pub fn maybe_tick(
        &self,
        token: Address,
        oi_long: Amount,
        oi_short: Amount,
        mark: Amount,
        premium_bps: i128,
        now_secs: u64,
        interval_secs: u64,
    ) -> EngineResult<Option<FundingTick>> {
        {
            let tokens = self.tokens.read();
            if let Some(state) = tokens.get(&token) {
                if now_secs < state.last_tick_secs + interval_secs {
                    return Ok(None);
                }
            }
        }

        let rate_bps = self.period_rate_bps(oi_long, oi_short, premium_bps)?;
        // Index moves by the rate applied to the mark, making accrual
        // `delta * size / ONE` a quote amount.
        let mark_i =
            i128::try_from(mark).map_err(|_| crate::error::EngineError::ArithmeticOverflow)?;
        let delta = fixed::mul_div_signed(rate_bps, mark_i, BPS_ONE)?;

        let mut tokens = self.tokens.write();
        let state = tokens.entry(token).or_default();
        if state.last_tick_secs != 0 && now_secs < state.last_tick_secs + interval_secs {
            return Ok(None);
        }
        state.index += delta;
        state.last_rate_bps = rate_bps;
        state.last_tick_secs = now_secs;
        Ok(Some(FundingTick {
            token,
            rate_bps,
            index: state.index,
        }))
    }
}

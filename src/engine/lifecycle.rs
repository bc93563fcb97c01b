//! Token lifecycle and parameter vault.
//!
//! The registry is the authoritative source for per-token trading
//! parameters and state. Parameter changes apply to new orders only;
//! resting orders keep the parameters they were accepted under, which is
//! why validation reads a `TokenParams` snapshot once per submission.
//!
//! States: Pretrade → Active ⇄ Paused → Delisted, plus Quarantined, the
//! invariant-violation halt that only an operator can clear.

use alloy_primitives::Address;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::config::TokenDefaults;
use crate::error::{EngineError, EngineResult};
use crate::fixed::Amount;
use crate::models::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    Pretrade,
    Active,
    Paused,
    Delisted,
    Quarantined,
}

impl TokenState {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenState::Pretrade => "pretrade",
            TokenState::Active => "active",
            TokenState::Paused => "paused",
            TokenState::Delisted => "delisted",
            TokenState::Quarantined => "quarantined",
        }
    }
}

/// Per-token trading parameters. A snapshot is taken at validation time;
/// later admin changes only affect subsequent orders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenParams {
    #[serde(with = "crate::models::amount_str")]
    pub max_leverage: u128,
    #[serde(with = "crate::models::amount_str")]
    pub maker_fee_bps: u128,
    #[serde(with = "crate::models::amount_str")]
    pub taker_fee_bps: u128,
    #[serde(with = "crate::models::amount_str")]
    pub tick_size: Amount,
    #[serde(with = "crate::models::amount_str")]
    pub min_order_size: Amount,
    #[serde(with = "crate::models::amount_str")]
    pub maintenance_margin_bps: u128,
    #[serde(with = "crate::models::amount_str")]
    pub max_price_step_bps: u128,
    #[serde(with = "crate::models::amount_str")]
    pub max_price_deviation_bps: u128,
    pub mark_stale_after_ms: u64,
    pub funding_interval_secs: u64,
    pub risk_tick_interval_ms: u64,
    pub trading_enabled: bool,
}

impl TokenParams {
    pub fn from_defaults(d: &TokenDefaults, funding_interval_secs: u64, risk_tick_ms: u64) -> Self {
        Self {
            max_leverage: d.max_leverage,
            maker_fee_bps: d.maker_fee_bps,
            taker_fee_bps: d.taker_fee_bps,
            tick_size: d.tick_size,
            min_order_size: d.min_order_size,
            maintenance_margin_bps: d.maintenance_margin_bps,
            max_price_step_bps: d.max_price_step_bps,
            max_price_deviation_bps: d.max_price_deviation_bps,
            mark_stale_after_ms: d.mark_stale_after_ms,
            funding_interval_secs,
            risk_tick_interval_ms: risk_tick_ms,
            trading_enabled: true,
        }
    }

    /// Apply one admin `params set` key. Values are raw scaled integers.
    pub fn set(&mut self, key: &str, value: &str) -> EngineResult<()> {
        let parse_u128 = |v: &str| {
            v.parse::<u128>()
                .map_err(|_| EngineError::InvalidOrderParameters(format!("bad value: {v}")))
        };
        let parse_u64 = |v: &str| {
            v.parse::<u64>()
                .map_err(|_| EngineError::InvalidOrderParameters(format!("bad value: {v}")))
        };
        match key {
            "max_leverage" => self.max_leverage = parse_u128(value)?,
            "maker_fee_bps" => self.maker_fee_bps = parse_u128(value)?,
            "taker_fee_bps" => self.taker_fee_bps = parse_u128(value)?,
            "tick_size" => {
                let v = parse_u128(value)?;
                if v == 0 {
                    return Err(EngineError::InvalidOrderParameters("tick_size 0".into()));
                }
                self.tick_size = v;
            }
            "min_order_size" => self.min_order_size = parse_u128(value)?,
            "maintenance_margin_bps" => self.maintenance_margin_bps = parse_u128(value)?,
            "max_price_step_bps" => self.max_price_step_bps = parse_u128(value)?,
            "max_price_deviation_bps" => self.max_price_deviation_bps = parse_u128(value)?,
            "mark_stale_after_ms" => self.mark_stale_after_ms = parse_u64(value)?,
            "funding_interval_secs" => self.funding_interval_secs = parse_u64(value)?,
            "risk_tick_interval_ms" => self.risk_tick_interval_ms = parse_u64(value)?,
            "trading_enabled" => {
                self.trading_enabled = matches!(value, "1" | "true" | "on");
            }
            other => {
                return Err(EngineError::InvalidOrderParameters(format!(
                    "unknown parameter: {other}"
                )))
            }
        }
        Ok(())
    }
}

/// Rolling 24h stats kept as hourly buckets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenStats {
    #[serde(with = "crate::models::amount_str")]
    pub last_price: Amount,
    #[serde(with = "crate::models::amount_str")]
    pub volume_24h: Amount,
    pub trade_count_24h: u64,
    #[serde(with = "crate::models::amount_str")]
    pub open_interest_long: Amount,
    #[serde(with = "crate::models::amount_str")]
    pub open_interest_short: Amount,
    pub position_count: u64,
    pub created_at: i64,
    pub state_changed_at: i64,
    #[serde(skip)]
    hourly: VecDeque<(i64, Amount, u64)>,
}

impl TokenStats {
    fn record_trade(&mut self, price: Amount, size: Amount, now: i64) {
        self.last_price = price;
        let hour = now / 3_600_000;
        match self.hourly.back_mut() {
            Some((h, vol, count)) if *h == hour => {
                *vol = vol.saturating_add(size);
                *count += 1;
            }
            _ => self.hourly.push_back((hour, size, 1)),
        }
        while let Some((h, _, _)) = self.hourly.front() {
            if hour - h >= 24 {
                self.hourly.pop_front();
            } else {
                break;
            }
        }
        self.volume_24h = self.hourly.iter().map(|(_, v, _)| v).sum();
        self.trade_count_24h = self.hourly.iter().map(|(_, _, c)| c).sum();
    }
}

#[derive(Debug, Clone)]
struct TokenEntry {
    state: TokenState,
    params: TokenParams,
    stats: TokenStats,
}

/// A lifecycle transition to announce on `lifecycle:<token>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub token: Address,
    pub state: TokenState,
    pub reason: String,
}

#[derive(Default)]
pub struct TokenRegistry {
    tokens: RwLock<HashMap<Address, TokenEntry>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token in `Pretrade`.
    pub fn create(&self, token: Address, params: TokenParams) -> EngineResult<()> {
        let mut map = self.tokens.write();
        if map.contains_key(&token) {
            return Err(EngineError::InvalidOrderParameters(format!(
                "token already listed: {token}"
            )));
        }
        let now = now_ms();
        map.insert(
            token,
            TokenEntry {
                state: TokenState::Pretrade,
                params,
                stats: TokenStats {
                    created_at: now,
                    state_changed_at: now,
                    ..Default::default()
                },
            },
        );
        Ok(())
    }

    pub fn activate(&self, token: Address) -> EngineResult<LifecycleEvent> {
        // Quarantined -> Active is the explicit operator-intervention path.
        self.transition(token, TokenState::Active, "admin activate", |state| {
            matches!(
                state,
                TokenState::Pretrade | TokenState::Paused | TokenState::Quarantined
            )
        })
    }

    pub fn pause(&self, token: Address, reason: &str) -> EngineResult<LifecycleEvent> {
        self.transition(token, TokenState::Paused, reason, |state| {
            matches!(state, TokenState::Active)
        })
    }

    pub fn resume(&self, token: Address) -> EngineResult<LifecycleEvent> {
        self.transition(token, TokenState::Active, "admin resume", |state| {
            matches!(state, TokenState::Paused)
        })
    }

    /// Delist; refused while any pair on the token remains active.
    pub fn delist(&self, token: Address) -> EngineResult<LifecycleEvent> {
        {
            let map = self.tokens.read();
            let entry = map.get(&token).ok_or(EngineError::UnknownToken(token))?;
            if entry.stats.position_count > 0 {
                return Err(EngineError::InvalidOrderParameters(
                    "token has active pairs".into(),
                ));
            }
        }
        self.transition(token, TokenState::Delisted, "admin delist", |state| {
            matches!(state, TokenState::Active | TokenState::Paused | TokenState::Pretrade)
        })
    }

    /// Invariant-violation halt. Always permitted except from Delisted.
    pub fn quarantine(&self, token: Address, reason: &str) -> EngineResult<LifecycleEvent> {
        self.transition(token, TokenState::Quarantined, reason, |state| {
            !matches!(state, TokenState::Delisted)
        })
    }

    fn transition(
        &self,
        token: Address,
        to: TokenState,
        reason: &str,
        allowed: impl Fn(TokenState) -> bool,
    ) -> EngineResult<LifecycleEvent> {
        let mut map = self.tokens.write();
        let entry = map.get_mut(&token).ok_or(EngineError::UnknownToken(token))?;
        if !allowed(entry.state) {
            return Err(EngineError::InvalidOrderParameters(format!(
                "illegal transition {} -> {}",
                entry.state.as_str(),
                to.as_str()
            )));
        }
        entry.state = to;
        entry.stats.state_changed_at = now_ms();
        Ok(LifecycleEvent {
            token,
            state: to,
            reason: reason.to_string(),
        })
    }

    pub fn state(&self, token: Address) -> EngineResult<TokenState> {
        self.tokens
            .read()
            .get(&token)
            .map(|e| e.state)
            .ok_or(EngineError::UnknownToken(token))
    }

    /// Snapshot of the token's parameters for a single submission.
    pub fn params(&self, token: Address) -> EngineResult<TokenParams> {
        self.tokens
            .read()
            .get(&token)
            .map(|e| e.params.clone())
            .ok_or(EngineError::UnknownToken(token))
    }

    pub fn set_param(&self, token: Address, key: &str, value: &str) -> EngineResult<()> {
        let mut map = self.tokens.write();
        let entry = map.get_mut(&token).ok_or(EngineError::UnknownToken(token))?;
        entry.params.set(key, value)
    }

    /// Gate for the submission pipeline: token must be Active with
    /// trading enabled.
    pub fn ensure_tradable(&self, token: Address) -> EngineResult<TokenParams> {
        let map = self.tokens.read();
        let entry = map.get(&token).ok_or(EngineError::UnknownToken(token))?;
        if entry.state != TokenState::Active || !entry.params.trading_enabled {
            return Err(EngineError::TokenNotTrading(token));
        }
        Ok(entry.params.clone())
    }

    pub fn stats(&self, token: Address) -> EngineResult<TokenStats> {
        self.tokens
            .read()
            .get(&token)
            .map(|e| e.stats.clone())
            .ok_or(EngineError::UnknownToken(token))
    }

    pub fn record_trade(&self, token: Address, price: Amount, size: Amount) {
        if let Some(entry) = self.tokens.write().get_mut(&token) {
            entry.stats.record_trade(price, size, now_ms());
        }
    }

    /// Open-interest and pair-count deltas from the position store.
    pub fn apply_oi_delta(&self, token: Address, size_delta: i128, pair_delta: i64) {
        if let Some(entry) = self.tokens.write().get_mut(&token) {
            let stats = &mut entry.stats;
            if size_delta >= 0 {
                let d = size_delta.unsigned_abs();
                stats.open_interest_long = stats.open_interest_long.saturating_add(d);
                stats.open_interest_short = stats.open_interest_short.saturating_add(d);
            } else {
                let d = size_delta.unsigned_abs();
                stats.open_interest_long = stats.open_interest_long.saturating_sub(d);
                stats.open_interest_short = stats.open_interest_short.saturating_sub(d);
            }
            stats.position_count = if pair_delta >= 0 {
                stats.position_count.saturating_add(pair_delta as u64)
            } else {
                stats.position_count.saturating_sub(pair_delta.unsigned_abs())
            };
        }
    }

    pub fn all_tokens(&self) -> Vec<(Address, TokenState)> {
        self.tokens
            .read()
            .iter()
            .map(|(a, e)| (*a, e.state))
            .collect()
    }

    pub fn active_tokens(&self) -> Vec<Address> {
        self.tokens
            .read()
            .iter()
            .filter(|(_, e)| e.state == TokenState::Active)
            .map(|(a, _)| *a)
            .collect()
    }
}

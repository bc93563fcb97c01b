//! Engine configuration.
//!
//! Values come from an optional TOML file (`serve --config <path>`) with
//! environment-variable overrides on top, so a bare `memeperp serve` with
//! a `.env` file works the same way the file-driven deployment does.

use alloy_primitives::Address;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{env, path::Path, str::FromStr};

/// Per-token parameter defaults applied when a token is activated without
/// explicit overrides. All of these are per-token mutable through the
/// lifecycle admin surface afterwards.
#[derive(Debug, Clone)]
pub struct TokenDefaults {
    /// Maximum leverage, 1e4 scale (20x = 200_000).
    pub max_leverage: u128,
    pub maker_fee_bps: u128,
    pub taker_fee_bps: u128,
    /// Minimum price increment, 1e18 scale.
    pub tick_size: u128,
    /// Minimum order size, 1e18 scale.
    pub min_order_size: u128,
    /// Maintenance margin ratio in bps.
    pub maintenance_margin_bps: u128,
    /// Maximum accepted relative mark step, bps.
    pub max_price_step_bps: u128,
    /// Maximum mark-vs-book deviation for market orders, bps.
    pub max_price_deviation_bps: u128,
    /// Mark feed staleness horizon before falling back to last trade, ms.
    pub mark_stale_after_ms: u64,
}

impl Default for TokenDefaults {
    fn default() -> Self {
        Self {
            max_leverage: 20 * crate::fixed::LEVERAGE_ONE,
            maker_fee_bps: 2,
            taker_fee_bps: 5,
            tick_size: 1_000_000_000_000_000, // 1e15
            min_order_size: 10_000_000_000_000_000, // 0.01
            maintenance_margin_bps: 50,
            max_price_step_bps: 1_500,
            max_price_deviation_bps: 500,
            mark_stale_after_ms: 30_000,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    /// EIP-712 domain chain id.
    pub chain_id: u64,
    /// EIP-712 verifying contract (the settlement contract address).
    pub verifying_contract: Address,
    /// Risk sweep cadence, ms.
    pub risk_tick_interval_ms: u64,
    /// Funding period, seconds.
    pub funding_interval_secs: u64,
    /// Funding imbalance coefficient `k`, bps.
    pub funding_k_bps: u128,
    /// Funding rate clamp, bps.
    pub funding_max_rate_bps: u128,
    /// Liquidation fee taken from seized collateral, bps.
    pub liquidation_fee_bps: u128,
    /// Cap on a trader's active pairs per token.
    pub max_pairs_per_trader: usize,
    /// Resting-order expiry prune cadence, ms.
    pub expiry_prune_interval_ms: u64,
    /// Trade log / k-line flush cadence, ms.
    pub flush_interval_ms: u64,
    /// Settlement batch: max events per batch and flush cadence.
    pub settlement_batch_size: usize,
    pub settlement_flush_interval_ms: u64,
    pub settlement_max_retries: u32,
    pub settlement_backoff_base_ms: u64,
    pub settlement_backoff_max_ms: u64,
    /// Broadcast channel capacity per topic.
    pub broadcast_capacity: usize,
    /// Optional Prometheus exporter listen address.
    pub metrics_addr: Option<String>,
    pub token_defaults: TokenDefaults,
}

/// TOML shape: every field optional so a partial file works.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    port: Option<u16>,
    database_path: Option<String>,
    chain_id: Option<u64>,
    verifying_contract: Option<String>,
    risk_tick_interval_ms: Option<u64>,
    funding_interval_secs: Option<u64>,
    // `toml` cannot deserialize u128, so these are read as u64 and widened below.
    funding_k_bps: Option<u64>,
    funding_max_rate_bps: Option<u64>,
    liquidation_fee_bps: Option<u64>,
    max_pairs_per_trader: Option<usize>,
    expiry_prune_interval_ms: Option<u64>,
    flush_interval_ms: Option<u64>,
    settlement_batch_size: Option<usize>,
    settlement_flush_interval_ms: Option<u64>,
    settlement_max_retries: Option<u32>,
    settlement_backoff_base_ms: Option<u64>,
    settlement_backoff_max_ms: Option<u64>,
    broadcast_capacity: Option<usize>,
    metrics_addr: Option<String>,
}

fn env_parse<T: FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(fallback)
}

impl Config {
    /// Load from an optional TOML file, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let file: FileConfig = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("read config file {}", p.display()))?;
                toml::from_str(&raw).with_context(|| format!("parse config file {}", p.display()))?
            }
            None => FileConfig::default(),
        };

        let verifying_contract = env::var("VERIFYING_CONTRACT")
            .ok()
            .or(file.verifying_contract)
            .unwrap_or_else(|| "0x0000000000000000000000000000000000000001".to_string());
        let verifying_contract = verifying_contract
            .parse::<Address>()
            .context("invalid verifying contract address")?;

        Ok(Self {
            port: env_parse("PORT", file.port.unwrap_or(8080)),
            database_path: env::var("DATABASE_PATH")
                .ok()
                .or(file.database_path)
                .unwrap_or_else(|| "./memeperp.db".to_string()),
            chain_id: env_parse("CHAIN_ID", file.chain_id.unwrap_or(8453)),
            verifying_contract,
            risk_tick_interval_ms: env_parse(
                "RISK_TICK_INTERVAL_MS",
                file.risk_tick_interval_ms.unwrap_or(500),
            ),
            funding_interval_secs: env_parse(
                "FUNDING_INTERVAL_SECS",
                file.funding_interval_secs.unwrap_or(3600),
            ),
            funding_k_bps: env_parse::<u64>("FUNDING_K_BPS", file.funding_k_bps.unwrap_or(125))
                as u128,
            funding_max_rate_bps: env_parse::<u64>(
                "FUNDING_MAX_RATE_BPS",
                file.funding_max_rate_bps.unwrap_or(75),
            ) as u128,
            liquidation_fee_bps: env_parse::<u64>(
                "LIQUIDATION_FEE_BPS",
                file.liquidation_fee_bps.unwrap_or(100),
            ) as u128,
            max_pairs_per_trader: env_parse(
                "MAX_PAIRS_PER_TRADER",
                file.max_pairs_per_trader.unwrap_or(512),
            ),
            expiry_prune_interval_ms: env_parse(
                "EXPIRY_PRUNE_INTERVAL_MS",
                file.expiry_prune_interval_ms.unwrap_or(2_000),
            ),
            flush_interval_ms: env_parse("FLUSH_INTERVAL_MS", file.flush_interval_ms.unwrap_or(1_000)),
            settlement_batch_size: env_parse(
                "SETTLEMENT_BATCH_SIZE",
                file.settlement_batch_size.unwrap_or(64),
            ),
            settlement_flush_interval_ms: env_parse(
                "SETTLEMENT_FLUSH_INTERVAL_MS",
                file.settlement_flush_interval_ms.unwrap_or(2_000),
            ),
            settlement_max_retries: env_parse(
                "SETTLEMENT_MAX_RETRIES",
                file.settlement_max_retries.unwrap_or(8),
            ),
            settlement_backoff_base_ms: env_parse(
                "SETTLEMENT_BACKOFF_BASE_MS",
                file.settlement_backoff_base_ms.unwrap_or(250),
            ),
            settlement_backoff_max_ms: env_parse(
                "SETTLEMENT_BACKOFF_MAX_MS",
                file.settlement_backoff_max_ms.unwrap_or(30_000),
            ),
            broadcast_capacity: env_parse(
                "BROADCAST_CAPACITY",
                file.broadcast_capacity.unwrap_or(1_024),
            ),
            metrics_addr: env::var("METRICS_ADDR").ok().or(file.metrics_addr),
            token_defaults: TokenDefaults::default(),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }
}

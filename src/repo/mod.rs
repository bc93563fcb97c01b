//! Durable store interface.
//!
//! The core consumes these operations; the concrete store is external to
//! the matching path. The bundled SQLite implementation backs
//! single-node deployments and every test.

pub mod sqlite;

use alloy_primitives::Address;
use async_trait::async_trait;

use crate::fixed::SignedAmount;
use crate::klines::{KlineBucket, Resolution};
use crate::ledger::Balances;
use crate::models::{Order, OrderStatus, PairedPosition, Trade};
use crate::settlement::SettlementInstruction;

#[async_trait]
pub trait Repository: Send + Sync {
    // --- orders ---
    async fn orders_save(&self, order: &Order) -> anyhow::Result<()>;
    async fn orders_get(&self, id: u64) -> anyhow::Result<Option<Order>>;
    async fn orders_by_trader(
        &self,
        trader: Address,
        status: Option<OrderStatus>,
        limit: usize,
    ) -> anyhow::Result<Vec<Order>>;
    async fn orders_max_id(&self) -> anyhow::Result<u64>;

    // --- trades ---
    async fn trades_append(&self, trades: &[Trade]) -> anyhow::Result<()>;
    async fn trades_by_token(
        &self,
        token: Address,
        limit: usize,
        before_id: Option<u64>,
    ) -> anyhow::Result<Vec<Trade>>;
    async fn trades_by_trader(&self, trader: Address, limit: usize) -> anyhow::Result<Vec<Trade>>;
    async fn trades_max_id(&self) -> anyhow::Result<u64>;

    // --- positions ---
    async fn positions_save(&self, pair: &PairedPosition) -> anyhow::Result<()>;
    async fn positions_get(&self, pair_id: u64) -> anyhow::Result<Option<PairedPosition>>;
    async fn positions_by_trader(&self, trader: Address) -> anyhow::Result<Vec<PairedPosition>>;
    async fn positions_by_token(&self, token: Address) -> anyhow::Result<Vec<PairedPosition>>;
    async fn positions_all_active(&self) -> anyhow::Result<Vec<PairedPosition>>;

    // --- k-lines ---
    async fn klines_upsert(&self, bucket: &KlineBucket) -> anyhow::Result<()>;
    async fn klines_range(
        &self,
        token: Address,
        resolution: Resolution,
        from: i64,
        to: i64,
    ) -> anyhow::Result<Vec<KlineBucket>>;

    // --- balances ---
    async fn balances_persist(&self, trader: Address, balances: Balances) -> anyhow::Result<()>;
    async fn balances_all(&self) -> anyhow::Result<Vec<(Address, Balances)>>;

    // --- nonces ---
    async fn nonces_persist(&self, trader: Address, value: u64) -> anyhow::Result<()>;
    async fn nonces_all(&self) -> anyhow::Result<Vec<(Address, u64)>>;

    // --- settlement log ---
    async fn settlement_append(&self, instruction: &SettlementInstruction) -> anyhow::Result<()>;
    async fn settlement_by_trader(
        &self,
        trader: Address,
        limit: usize,
    ) -> anyhow::Result<Vec<SettlementInstruction>>;

    // --- funding indices ---
    async fn funding_persist(
        &self,
        token: Address,
        index: SignedAmount,
        updated_secs: u64,
    ) -> anyhow::Result<()>;
    async fn funding_all(&self) -> anyhow::Result<Vec<(Address, SignedAmount, u64)>>;
}

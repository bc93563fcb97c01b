//! SQLite repository.
//!
//! One connection behind an async mutex, WAL mode, schema created on
//! open. Scaled integers are stored as decimal TEXT (SQLite integers are
//! 64-bit), addresses as 0x-prefixed lowercase hex.

use alloy_primitives::Address;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, Row};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::fixed::SignedAmount;
use crate::klines::{KlineBucket, Resolution};
use crate::ledger::Balances;
use crate::models::{Order, OrderStatus, OrderType, PairStatus, PairedPosition, Side, Trade};
use crate::settlement::SettlementInstruction;

use super::Repository;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY,
    trader TEXT NOT NULL,
    token TEXT NOT NULL,
    side TEXT NOT NULL,
    order_type TEXT NOT NULL,
    size_original TEXT NOT NULL,
    size_remaining TEXT NOT NULL,
    limit_price TEXT NOT NULL,
    leverage TEXT NOT NULL,
    deadline INTEGER NOT NULL,
    nonce INTEGER NOT NULL,
    signature TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_orders_trader ON orders(trader, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_orders_trader_status ON orders(trader, status, created_at DESC);

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY,
    token TEXT NOT NULL,
    maker_order_id INTEGER NOT NULL,
    taker_order_id INTEGER NOT NULL,
    maker TEXT NOT NULL,
    taker TEXT NOT NULL,
    price TEXT NOT NULL,
    size TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    maker_fee TEXT NOT NULL,
    taker_fee TEXT NOT NULL,
    pair_id INTEGER
);
CREATE INDEX IF NOT EXISTS idx_trades_token ON trades(token, id DESC);
CREATE INDEX IF NOT EXISTS idx_trades_maker ON trades(maker, id DESC);
CREATE INDEX IF NOT EXISTS idx_trades_taker ON trades(taker, id DESC);

CREATE TABLE IF NOT EXISTS positions (
    pair_id INTEGER PRIMARY KEY,
    token TEXT NOT NULL,
    long_trader TEXT NOT NULL,
    short_trader TEXT NOT NULL,
    size TEXT NOT NULL,
    entry_price TEXT NOT NULL,
    long_collateral TEXT NOT NULL,
    short_collateral TEXT NOT NULL,
    long_leverage TEXT NOT NULL,
    short_leverage TEXT NOT NULL,
    opened_at INTEGER NOT NULL,
    funding_long TEXT NOT NULL,
    funding_short TEXT NOT NULL,
    last_funding_index TEXT NOT NULL,
    status TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_positions_token ON positions(token, status);
CREATE INDEX IF NOT EXISTS idx_positions_long ON positions(long_trader, status);
CREATE INDEX IF NOT EXISTS idx_positions_short ON positions(short_trader, status);

CREATE TABLE IF NOT EXISTS klines (
    token TEXT NOT NULL,
    resolution TEXT NOT NULL,
    bucket_start INTEGER NOT NULL,
    open TEXT NOT NULL,
    high TEXT NOT NULL,
    low TEXT NOT NULL,
    close TEXT NOT NULL,
    volume TEXT NOT NULL,
    trade_count INTEGER NOT NULL,
    PRIMARY KEY (token, resolution, bucket_start)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS balances (
    trader TEXT PRIMARY KEY,
    available TEXT NOT NULL,
    locked TEXT NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS nonces (
    trader TEXT PRIMARY KEY,
    value INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS settlement_log (
    seq INTEGER PRIMARY KEY,
    pair_id INTEGER NOT NULL,
    traders TEXT NOT NULL,
    event_json TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_settlement_pair ON settlement_log(pair_id);

CREATE TABLE IF NOT EXISTS funding_indices (
    token TEXT PRIMARY KEY,
    idx TEXT NOT NULL,
    updated_secs INTEGER NOT NULL
) WITHOUT ROWID;
"#;

#[derive(Clone)]
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

fn addr_str(a: Address) -> String {
    format!("{a:#x}")
}

fn parse_addr(s: &str) -> Result<Address> {
    s.parse::<Address>().context("bad address in repository")
}

fn parse_u128(s: &str) -> Result<u128> {
    s.parse::<u128>().context("bad amount in repository")
}

fn parse_i128(s: &str) -> Result<i128> {
    s.parse::<i128>().context("bad signed amount in repository")
}

impl SqliteRepository {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open repository db")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory repository")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA_SQL).context("create schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn read_order(row: &Row) -> Result<Order> {
        Ok(Order {
            id: row.get::<_, i64>(0)? as u64,
            trader: parse_addr(&row.get::<_, String>(1)?)?,
            token: parse_addr(&row.get::<_, String>(2)?)?,
            side: match row.get::<_, String>(3)?.as_str() {
                "long" => Side::Long,
                _ => Side::Short,
            },
            order_type: match row.get::<_, String>(4)?.as_str() {
                "market" => OrderType::Market,
                "limit" => OrderType::Limit,
                "stop_limit" => OrderType::StopLimit,
                _ => OrderType::StopMarket,
            },
            size_original: parse_u128(&row.get::<_, String>(5)?)?,
            size_remaining: parse_u128(&row.get::<_, String>(6)?)?,
            limit_price: parse_u128(&row.get::<_, String>(7)?)?,
            leverage: parse_u128(&row.get::<_, String>(8)?)?,
            deadline: row.get::<_, i64>(9)? as u64,
            nonce: row.get::<_, i64>(10)? as u64,
            signature: row.get(11)?,
            status: OrderStatus::parse(&row.get::<_, String>(12)?)
                .context("bad order status in repository")?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn read_trade(row: &Row) -> Result<Trade> {
        Ok(Trade {
            id: row.get::<_, i64>(0)? as u64,
            token: parse_addr(&row.get::<_, String>(1)?)?,
            maker_order_id: row.get::<_, i64>(2)? as u64,
            taker_order_id: row.get::<_, i64>(3)? as u64,
            maker: parse_addr(&row.get::<_, String>(4)?)?,
            taker: parse_addr(&row.get::<_, String>(5)?)?,
            price: parse_u128(&row.get::<_, String>(6)?)?,
            size: parse_u128(&row.get::<_, String>(7)?)?,
            timestamp: row.get(8)?,
            maker_fee: parse_u128(&row.get::<_, String>(9)?)?,
            taker_fee: parse_u128(&row.get::<_, String>(10)?)?,
            pair_id: row.get::<_, Option<i64>>(11)?.map(|v| v as u64),
        })
    }

    fn read_position(row: &Row) -> Result<PairedPosition> {
        Ok(PairedPosition {
            pair_id: row.get::<_, i64>(0)? as u64,
            token: parse_addr(&row.get::<_, String>(1)?)?,
            long_trader: parse_addr(&row.get::<_, String>(2)?)?,
            short_trader: parse_addr(&row.get::<_, String>(3)?)?,
            size: parse_u128(&row.get::<_, String>(4)?)?,
            entry_price: parse_u128(&row.get::<_, String>(5)?)?,
            long_collateral: parse_u128(&row.get::<_, String>(6)?)?,
            short_collateral: parse_u128(&row.get::<_, String>(7)?)?,
            long_leverage: parse_u128(&row.get::<_, String>(8)?)?,
            short_leverage: parse_u128(&row.get::<_, String>(9)?)?,
            opened_at: row.get(10)?,
            accumulated_funding_long: parse_i128(&row.get::<_, String>(11)?)?,
            accumulated_funding_short: parse_i128(&row.get::<_, String>(12)?)?,
            last_funding_index: parse_i128(&row.get::<_, String>(13)?)?,
            status: PairStatus::parse(&row.get::<_, String>(14)?)
                .context("bad pair status in repository")?,
        })
    }

    fn read_kline(row: &Row, token: Address, resolution: Resolution) -> Result<KlineBucket> {
        Ok(KlineBucket {
            token,
            resolution,
            bucket_start: row.get(0)?,
            open: parse_u128(&row.get::<_, String>(1)?)?,
            high: parse_u128(&row.get::<_, String>(2)?)?,
            low: parse_u128(&row.get::<_, String>(3)?)?,
            close: parse_u128(&row.get::<_, String>(4)?)?,
            volume: parse_u128(&row.get::<_, String>(5)?)?,
            trade_count: row.get::<_, i64>(6)? as u64,
        })
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn orders_save(&self, order: &Order) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO orders (id, trader, token, side, order_type, size_original,
                size_remaining, limit_price, leverage, deadline, nonce, signature,
                status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(id) DO UPDATE SET
                size_remaining = excluded.size_remaining,
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![
                order.id as i64,
                addr_str(order.trader),
                addr_str(order.token),
                if order.side.is_long() { "long" } else { "short" },
                match order.order_type {
                    OrderType::Market => "market",
                    OrderType::Limit => "limit",
                    OrderType::StopLimit => "stop_limit",
                    OrderType::StopMarket => "stop_market",
                },
                order.size_original.to_string(),
                order.size_remaining.to_string(),
                order.limit_price.to_string(),
                order.leverage.to_string(),
                order.deadline as i64,
                order.nonce as i64,
                order.signature,
                order.status.as_str(),
                order.created_at,
                order.updated_at,
            ],
        )
        .context("save order")?;
        Ok(())
    }

    async fn orders_get(&self, id: u64) -> Result<Option<Order>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, trader, token, side, order_type, size_original, size_remaining,
                    limit_price, leverage, deadline, nonce, signature, status,
                    created_at, updated_at
             FROM orders WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id as i64])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::read_order(row)?)),
            None => Ok(None),
        }
    }

    async fn orders_by_trader(
        &self,
        trader: Address,
        status: Option<OrderStatus>,
        limit: usize,
    ) -> Result<Vec<Order>> {
        fn collect(rows: &mut rusqlite::Rows<'_>) -> Result<Vec<Order>> {
            let mut orders = Vec::new();
            while let Some(row) = rows.next()? {
                orders.push(SqliteRepository::read_order(row)?);
            }
            Ok(orders)
        }

        let conn = self.conn.lock().await;
        match status {
            Some(status) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, trader, token, side, order_type, size_original, size_remaining,
                            limit_price, leverage, deadline, nonce, signature, status,
                            created_at, updated_at
                     FROM orders WHERE trader = ?1 AND status = ?2
                     ORDER BY created_at DESC LIMIT ?3",
                )?;
                let mut rows = stmt.query(params![addr_str(trader), status.as_str(), limit as i64])?;
                collect(&mut rows)
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, trader, token, side, order_type, size_original, size_remaining,
                            limit_price, leverage, deadline, nonce, signature, status,
                            created_at, updated_at
                     FROM orders WHERE trader = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(params![addr_str(trader), limit as i64])?;
                collect(&mut rows)
            }
        }
    }

    async fn orders_max_id(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let max: Option<i64> = conn
            .query_row("SELECT MAX(id) FROM orders", [], |row| row.get(0))
            .context("max order id")?;
        Ok(max.unwrap_or(0) as u64)
    }

    async fn trades_append(&self, trades: &[Trade]) -> Result<()> {
        if trades.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin trade batch")?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO trades (id, token, maker_order_id, taker_order_id,
                    maker, taker, price, size, timestamp, maker_fee, taker_fee, pair_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for t in trades {
                stmt.execute(params![
                    t.id as i64,
                    addr_str(t.token),
                    t.maker_order_id as i64,
                    t.taker_order_id as i64,
                    addr_str(t.maker),
                    addr_str(t.taker),
                    t.price.to_string(),
                    t.size.to_string(),
                    t.timestamp,
                    t.maker_fee.to_string(),
                    t.taker_fee.to_string(),
                    t.pair_id.map(|v| v as i64),
                ])?;
            }
        }
        tx.commit().context("commit trade batch")?;
        Ok(())
    }

    async fn trades_by_token(
        &self,
        token: Address,
        limit: usize,
        before_id: Option<u64>,
    ) -> Result<Vec<Trade>> {
        let conn = self.conn.lock().await;
        let before = before_id.map(|v| v as i64).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare_cached(
            "SELECT id, token, maker_order_id, taker_order_id, maker, taker, price, size,
                    timestamp, maker_fee, taker_fee, pair_id
             FROM trades WHERE token = ?1 AND id < ?2
             ORDER BY id DESC LIMIT ?3",
        )?;
        let mut rows = stmt.query(params![addr_str(token), before, limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::read_trade(row)?);
        }
        Ok(out)
    }

    async fn trades_by_trader(&self, trader: Address, limit: usize) -> Result<Vec<Trade>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, token, maker_order_id, taker_order_id, maker, taker, price, size,
                    timestamp, maker_fee, taker_fee, pair_id
             FROM trades WHERE maker = ?1 OR taker = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![addr_str(trader), limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::read_trade(row)?);
        }
        Ok(out)
    }

    async fn trades_max_id(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let max: Option<i64> = conn
            .query_row("SELECT MAX(id) FROM trades", [], |row| row.get(0))
            .context("max trade id")?;
        Ok(max.unwrap_or(0) as u64)
    }

    async fn positions_save(&self, pair: &PairedPosition) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO positions (pair_id, token, long_trader, short_trader, size,
                entry_price, long_collateral, short_collateral, long_leverage,
                short_leverage, opened_at, funding_long, funding_short,
                last_funding_index, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(pair_id) DO UPDATE SET
                size = excluded.size,
                long_collateral = excluded.long_collateral,
                short_collateral = excluded.short_collateral,
                funding_long = excluded.funding_long,
                funding_short = excluded.funding_short,
                last_funding_index = excluded.last_funding_index,
                status = excluded.status",
            params![
                pair.pair_id as i64,
                addr_str(pair.token),
                addr_str(pair.long_trader),
                addr_str(pair.short_trader),
                pair.size.to_string(),
                pair.entry_price.to_string(),
                pair.long_collateral.to_string(),
                pair.short_collateral.to_string(),
                pair.long_leverage.to_string(),
                pair.short_leverage.to_string(),
                pair.opened_at,
                pair.accumulated_funding_long.to_string(),
                pair.accumulated_funding_short.to_string(),
                pair.last_funding_index.to_string(),
                pair.status.as_str(),
            ],
        )
        .context("save position")?;
        Ok(())
    }

    async fn positions_get(&self, pair_id: u64) -> Result<Option<PairedPosition>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT pair_id, token, long_trader, short_trader, size, entry_price,
                    long_collateral, short_collateral, long_leverage, short_leverage,
                    opened_at, funding_long, funding_short, last_funding_index, status
             FROM positions WHERE pair_id = ?1",
        )?;
        let mut rows = stmt.query(params![pair_id as i64])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::read_position(row)?)),
            None => Ok(None),
        }
    }

    async fn positions_by_trader(&self, trader: Address) -> Result<Vec<PairedPosition>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT pair_id, token, long_trader, short_trader, size, entry_price,
                    long_collateral, short_collateral, long_leverage, short_leverage,
                    opened_at, funding_long, funding_short, last_funding_index, status
             FROM positions WHERE long_trader = ?1 OR short_trader = ?1
             ORDER BY pair_id",
        )?;
        let mut rows = stmt.query(params![addr_str(trader)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::read_position(row)?);
        }
        Ok(out)
    }

    async fn positions_by_token(&self, token: Address) -> Result<Vec<PairedPosition>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT pair_id, token, long_trader, short_trader, size, entry_price,
                    long_collateral, short_collateral, long_leverage, short_leverage,
                    opened_at, funding_long, funding_short, last_funding_index, status
             FROM positions WHERE token = ?1 ORDER BY pair_id",
        )?;
        let mut rows = stmt.query(params![addr_str(token)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::read_position(row)?);
        }
        Ok(out)
    }

    async fn positions_all_active(&self) -> Result<Vec<PairedPosition>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT pair_id, token, long_trader, short_trader, size, entry_price,
                    long_collateral, short_collateral, long_leverage, short_leverage,
                    opened_at, funding_long, funding_short, last_funding_index, status
             FROM positions WHERE status = 'active' ORDER BY pair_id",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::read_position(row)?);
        }
        Ok(out)
    }

    async fn klines_upsert(&self, bucket: &KlineBucket) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO klines (token, resolution, bucket_start, open, high, low, close,
                volume, trade_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(token, resolution, bucket_start) DO UPDATE SET
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume,
                trade_count = excluded.trade_count",
            params![
                addr_str(bucket.token),
                bucket.resolution.as_str(),
                bucket.bucket_start,
                bucket.open.to_string(),
                bucket.high.to_string(),
                bucket.low.to_string(),
                bucket.close.to_string(),
                bucket.volume.to_string(),
                bucket.trade_count as i64,
            ],
        )
        .context("upsert kline")?;
        Ok(())
    }

    async fn klines_range(
        &self,
        token: Address,
        resolution: Resolution,
        from: i64,
        to: i64,
    ) -> Result<Vec<KlineBucket>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT bucket_start, open, high, low, close, volume, trade_count
             FROM klines WHERE token = ?1 AND resolution = ?2
               AND bucket_start >= ?3 AND bucket_start <= ?4
             ORDER BY bucket_start",
        )?;
        let mut rows = stmt.query(params![addr_str(token), resolution.as_str(), from, to])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::read_kline(row, token, resolution)?);
        }
        Ok(out)
    }

    async fn balances_persist(&self, trader: Address, balances: Balances) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO balances (trader, available, locked, updated_at)
             VALUES (?1, ?2, ?3, strftime('%s', 'now'))
             ON CONFLICT(trader) DO UPDATE SET
                available = excluded.available,
                locked = excluded.locked,
                updated_at = excluded.updated_at",
            params![
                addr_str(trader),
                balances.available.to_string(),
                balances.locked.to_string(),
            ],
        )
        .context("persist balances")?;
        Ok(())
    }

    async fn balances_all(&self) -> Result<Vec<(Address, Balances)>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT trader, available, locked FROM balances")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push((
                parse_addr(&row.get::<_, String>(0)?)?,
                Balances {
                    available: parse_u128(&row.get::<_, String>(1)?)?,
                    locked: parse_u128(&row.get::<_, String>(2)?)?,
                },
            ));
        }
        Ok(out)
    }

    async fn nonces_persist(&self, trader: Address, value: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO nonces (trader, value, updated_at)
             VALUES (?1, ?2, strftime('%s', 'now'))
             ON CONFLICT(trader) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![addr_str(trader), value as i64],
        )
        .context("persist nonce")?;
        Ok(())
    }

    async fn nonces_all(&self) -> Result<Vec<(Address, u64)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT trader, value FROM nonces")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push((
                parse_addr(&row.get::<_, String>(0)?)?,
                row.get::<_, i64>(1)? as u64,
            ));
        }
        Ok(out)
    }

    async fn settlement_append(&self, instruction: &SettlementInstruction) -> Result<()> {
        let conn = self.conn.lock().await;
        let traders = instruction
            .event
            .traders()
            .iter()
            .map(|a| addr_str(*a))
            .collect::<Vec<_>>()
            .join(",");
        conn.execute(
            "INSERT OR IGNORE INTO settlement_log (seq, pair_id, traders, event_json, created_at)
             VALUES (?1, ?2, ?3, ?4, strftime('%s', 'now'))",
            params![
                instruction.seq as i64,
                instruction.event.pair_id() as i64,
                traders,
                serde_json::to_string(&instruction.event).context("encode settlement event")?,
            ],
        )
        .context("append settlement")?;
        Ok(())
    }

    async fn settlement_by_trader(
        &self,
        trader: Address,
        limit: usize,
    ) -> Result<Vec<SettlementInstruction>> {
        let conn = self.conn.lock().await;
        let needle = format!("%{}%", addr_str(trader));
        let mut stmt = conn.prepare_cached(
            "SELECT seq, event_json FROM settlement_log
             WHERE traders LIKE ?1 ORDER BY seq DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![needle, limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let seq = row.get::<_, i64>(0)? as u64;
            let event = serde_json::from_str(&row.get::<_, String>(1)?)
                .context("decode settlement event")?;
            out.push(SettlementInstruction { seq, event });
        }
        Ok(out)
    }

    async fn funding_persist(
        &self,
        token: Address,
        index: SignedAmount,
        updated_secs: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO funding_indices (token, idx, updated_secs)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(token) DO UPDATE SET
                idx = excluded.idx,
                updated_secs = excluded.updated_secs",
            params![addr_str(token), index.to_string(), updated_secs as i64],
        )
        .context("persist funding index")?;
        Ok(())
    }

    async fn funding_all(&self) -> Result<Vec<(Address, SignedAmount, u64)>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT token, idx, updated_secs FROM funding_indices")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push((
                parse_addr(&row.get::<_, String>(0)?)?,
                parse_i128(&row.get::<_, String>(1)?)?,
                row.get::<_, i64>(2)? as u64,
            ));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::ONE;

    fn repo() -> SqliteRepository {
        SqliteRepository::open_in_memory().unwrap()
    }

    fn order() -> Order {
        Order {
            id: 1,
            trader: Address::repeat_byte(0x0a),
            token: Address::repeat_byte(0x11),
            side: Side::Long,
            order_type: OrderType::Limit,
            size_original: ONE,
            size_remaining: ONE,
            limit_price: 2 * ONE,
            leverage: 50_000,
            deadline: 4_000_000_000,
            nonce: 1,
            signature: "0xdead".into(),
            status: OrderStatus::New,
            created_at: 1,
            updated_at: 1,
        }
    }

    #[tokio::test]
    async fn order_round_trip_and_status_update() {
        let repo = repo();
        let mut o = order();
        repo.orders_save(&o).await.unwrap();

        o.status = OrderStatus::Filled;
        o.size_remaining = 0;
        o.updated_at = 2;
        repo.orders_save(&o).await.unwrap();

        let loaded = repo.orders_get(1).await.unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Filled);
        assert_eq!(loaded.size_remaining, 0);
        assert_eq!(loaded.limit_price, 2 * ONE);
        assert_eq!(repo.orders_max_id().await.unwrap(), 1);

        let by_trader = repo
            .orders_by_trader(o.trader, Some(OrderStatus::Filled), 10)
            .await
            .unwrap();
        assert_eq!(by_trader.len(), 1);
        assert!(repo
            .orders_by_trader(o.trader, Some(OrderStatus::New), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn trade_batch_append_and_queries() {
        let repo = repo();
        let token = Address::repeat_byte(0x11);
        let trades: Vec<Trade> = (1..=3u64)
            .map(|id| Trade {
                id,
                token,
                maker_order_id: 1,
                taker_order_id: 2,
                maker: Address::repeat_byte(0x0a),
                taker: Address::repeat_byte(0x0b),
                price: 2 * ONE,
                size: ONE,
                timestamp: id as i64,
                maker_fee: 0,
                taker_fee: 0,
                pair_id: Some(id),
            })
            .collect();
        repo.trades_append(&trades).await.unwrap();
        // Replays are ignored, not duplicated.
        repo.trades_append(&trades).await.unwrap();

        assert_eq!(repo.trades_max_id().await.unwrap(), 3);
        let page = repo.trades_by_token(token, 2, None).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, 3);
        let older = repo.trades_by_token(token, 10, Some(2)).await.unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].id, 1);
        assert_eq!(
            repo.trades_by_trader(Address::repeat_byte(0x0a), 10)
                .await
                .unwrap()
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn position_round_trip() {
        let repo = repo();
        let pair = PairedPosition {
            pair_id: 5,
            token: Address::repeat_byte(0x11),
            long_trader: Address::repeat_byte(0x0a),
            short_trader: Address::repeat_byte(0x0b),
            size: ONE,
            entry_price: 2 * ONE,
            long_collateral: 2 * ONE / 5,
            short_collateral: 2 * ONE / 5,
            long_leverage: 50_000,
            short_leverage: 50_000,
            opened_at: 10,
            accumulated_funding_long: -7,
            accumulated_funding_short: 7,
            last_funding_index: 42,
            status: PairStatus::Active,
        };
        repo.positions_save(&pair).await.unwrap();

        let loaded = repo.positions_get(5).await.unwrap().unwrap();
        assert_eq!(loaded.accumulated_funding_long, -7);
        assert_eq!(loaded.status, PairStatus::Active);
        assert_eq!(repo.positions_all_active().await.unwrap().len(), 1);
        assert_eq!(
            repo.positions_by_trader(pair.short_trader).await.unwrap().len(),
            1
        );

        let mut closed = pair.clone();
        closed.status = PairStatus::Closed;
        closed.size = 0;
        repo.positions_save(&closed).await.unwrap();
        assert!(repo.positions_all_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn kline_upsert_and_range() {
        let repo = repo();
        let token = Address::repeat_byte(0x11);
        let mut bucket = KlineBucket {
            token,
            resolution: Resolution::M1,
            bucket_start: 60,
            open: ONE,
            high: ONE,
            low: ONE,
            close: ONE,
            volume: ONE,
            trade_count: 1,
        };
        repo.klines_upsert(&bucket).await.unwrap();
        bucket.high = 2 * ONE;
        bucket.trade_count = 2;
        repo.klines_upsert(&bucket).await.unwrap();

        let range = repo.klines_range(token, Resolution::M1, 0, 120).await.unwrap();
        assert_eq!(range.len(), 1);
        assert_eq!(range[0].high, 2 * ONE);
        assert_eq!(range[0].trade_count, 2);
        assert!(repo
            .klines_range(token, Resolution::M5, 0, 120)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn balances_nonces_funding_round_trip() {
        let repo = repo();
        let trader = Address::repeat_byte(0x0a);
        repo.balances_persist(
            trader,
            Balances {
                available: 3 * ONE,
                locked: ONE,
            },
        )
        .await
        .unwrap();
        repo.nonces_persist(trader, 9).await.unwrap();
        repo.funding_persist(Address::repeat_byte(0x11), -55, 1_000)
            .await
            .unwrap();

        assert_eq!(repo.balances_all().await.unwrap()[0].1.available, 3 * ONE);
        assert_eq!(repo.nonces_all().await.unwrap()[0].1, 9);
        let funding = repo.funding_all().await.unwrap();
        assert_eq!(funding[0].1, -55);
        assert_eq!(funding[0].2, 1_000);
    }

    #[tokio::test]
    async fn settlement_log_by_trader() {
        let repo = repo();
        let long = Address::repeat_byte(0x0a);
        let short = Address::repeat_byte(0x0b);
        let instruction = SettlementInstruction {
            seq: 1,
            event: crate::settlement::SettlementEvent::PairOpened {
                pair_id: 1,
                token: Address::repeat_byte(0x11),
                long_trader: long,
                short_trader: short,
                size: ONE,
                entry_price: 2 * ONE,
            },
        };
        repo.settlement_append(&instruction).await.unwrap();
        repo.settlement_append(&instruction).await.unwrap(); // idempotent

        let for_long = repo.settlement_by_trader(long, 10).await.unwrap();
        assert_eq!(for_long.len(), 1);
        assert!(repo
            .settlement_by_trader(Address::repeat_byte(0x0c), 10)
            .await
            .unwrap()
            .is_empty());
    }
}

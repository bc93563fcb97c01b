//! Core domain types shared across the engine.
//!
//! Wire rule: every 1e18/1e4-scaled integer crosses JSON boundaries as a
//! base-10 decimal string (`amount_str` / `signed_str`), never as a JSON
//! number. Addresses are 0x-prefixed lowercase hex.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

use crate::fixed::{Amount, SignedAmount};

/// Serde helpers: u128 amounts as decimal strings on the wire.
pub mod amount_str {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse::<u128>()
            .map_err(|_| D::Error::custom(format!("not a base-10 integer: {raw}")))
    }
}

/// Serde helpers: i128 amounts as decimal strings on the wire.
pub mod signed_str {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &i128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i128, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse::<i128>()
            .map_err(|_| D::Error::custom(format!("not a base-10 integer: {raw}")))
    }
}

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn is_long(self) -> bool {
        matches!(self, Side::Long)
    }
}

/// Wire order types. Discriminants match the submission message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopLimit,
    StopMarket,
}

impl OrderType {
    pub fn from_wire(v: u8) -> Option<OrderType> {
        match v {
            0 => Some(OrderType::Market),
            1 => Some(OrderType::Limit),
            2 => Some(OrderType::StopLimit),
            3 => Some(OrderType::StopMarket),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            OrderType::Market => 0,
            OrderType::Limit => 1,
            OrderType::StopLimit => 2,
            OrderType::StopMarket => 3,
        }
    }

    /// Stop orders park until their trigger price prints.
    pub fn is_stop(self) -> bool {
        matches!(self, OrderType::StopLimit | OrderType::StopMarket)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Expired,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Expired | OrderStatus::Rejected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Expired => "expired",
            OrderStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "new" => Some(OrderStatus::New),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "expired" => Some(OrderStatus::Expired),
            "rejected" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }
}

/// A validated order inside the engine. The signed wire message it came
/// from is kept verbatim for history queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub trader: Address,
    pub token: Address,
    pub side: Side,
    pub order_type: OrderType,
    #[serde(with = "amount_str")]
    pub size_original: Amount,
    #[serde(with = "amount_str")]
    pub size_remaining: Amount,
    /// 0 for market orders; the trigger price for stop orders.
    #[serde(with = "amount_str")]
    pub limit_price: Amount,
    /// 1e4 scale.
    #[serde(with = "amount_str")]
    pub leverage: u128,
    /// Unix seconds.
    pub deadline: u64,
    pub nonce: u64,
    /// 0x-prefixed 65-byte signature as submitted.
    pub signature: String,
    pub status: OrderStatus,
    /// Unix millis.
    pub created_at: i64,
    pub updated_at: i64,
}

/// An executed fill. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub token: Address,
    pub maker_order_id: u64,
    pub taker_order_id: u64,
    pub maker: Address,
    pub taker: Address,
    #[serde(with = "amount_str")]
    pub price: Amount,
    #[serde(with = "amount_str")]
    pub size: Amount,
    /// Unix millis.
    pub timestamp: i64,
    #[serde(with = "amount_str")]
    pub maker_fee: Amount,
    #[serde(with = "amount_str")]
    pub taker_fee: Amount,
    /// The pair opened by this fill, if the fill opened one (offsetting
    /// fills close existing pairs instead; those closures go to the
    /// settlement log).
    pub pair_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairStatus {
    Active,
    Closed,
    LiquidatedLong,
    LiquidatedShort,
    AdlClosed,
}

impl PairStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PairStatus::Active => "active",
            PairStatus::Closed => "closed",
            PairStatus::LiquidatedLong => "liquidated_long",
            PairStatus::LiquidatedShort => "liquidated_short",
            PairStatus::AdlClosed => "adl_closed",
        }
    }

    pub fn parse(s: &str) -> Option<PairStatus> {
        match s {
            "active" => Some(PairStatus::Active),
            "closed" => Some(PairStatus::Closed),
            "liquidated_long" => Some(PairStatus::LiquidatedLong),
            "liquidated_short" => Some(PairStatus::LiquidatedShort),
            "adl_closed" => Some(PairStatus::AdlClosed),
            _ => None,
        }
    }
}

/// A long-short pair of equal opposite exposure. The atomic unit of pnl,
/// funding, and liquidation accounting; there is no unilateral position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedPosition {
    pub pair_id: u64,
    pub token: Address,
    pub long_trader: Address,
    pub short_trader: Address,
    #[serde(with = "amount_str")]
    pub size: Amount,
    #[serde(with = "amount_str")]
    pub entry_price: Amount,
    #[serde(with = "amount_str")]
    pub long_collateral: Amount,
    #[serde(with = "amount_str")]
    pub short_collateral: Amount,
    #[serde(with = "amount_str")]
    pub long_leverage: u128,
    #[serde(with = "amount_str")]
    pub short_leverage: u128,
    /// Unix millis.
    pub opened_at: i64,
    /// Funding owed by each side since open: positive means the side
    /// pays at settlement, negative that it collects. The two fields sum
    /// to zero for the life of the pair.
    #[serde(with = "signed_str")]
    pub accumulated_funding_long: SignedAmount,
    #[serde(with = "signed_str")]
    pub accumulated_funding_short: SignedAmount,
    /// Funding index snapshot at the last accrual touch.
    #[serde(with = "signed_str")]
    pub last_funding_index: SignedAmount,
    pub status: PairStatus,
}

impl PairedPosition {
    pub fn trader_side(&self, trader: Address) -> Option<Side> {
        if self.long_trader == trader {
            Some(Side::Long)
        } else if self.short_trader == trader {
            Some(Side::Short)
        } else {
            None
        }
    }

    pub fn trader_on(&self, side: Side) -> Address {
        match side {
            Side::Long => self.long_trader,
            Side::Short => self.short_trader,
        }
    }

    pub fn collateral(&self, side: Side) -> Amount {
        match side {
            Side::Long => self.long_collateral,
            Side::Short => self.short_collateral,
        }
    }

    pub fn leverage(&self, side: Side) -> u128 {
        match side {
            Side::Long => self.long_leverage,
            Side::Short => self.short_leverage,
        }
    }

    pub fn accumulated_funding(&self, side: Side) -> SignedAmount {
        match side {
            Side::Long => self.accumulated_funding_long,
            Side::Short => self.accumulated_funding_short,
        }
    }
}

/// Derived per-trader, per-token aggregate over active pairs. Never
/// persisted as truth; recomputed from the pair set on query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionView {
    pub trader: Address,
    pub token: Address,
    pub side: Side,
    #[serde(with = "amount_str")]
    pub size: Amount,
    /// Size-weighted average entry.
    #[serde(with = "amount_str")]
    pub entry_price: Amount,
    #[serde(with = "amount_str")]
    pub collateral: Amount,
    #[serde(with = "signed_str")]
    pub accumulated_funding: SignedAmount,
    pub pair_count: usize,
}

/// Aggregated depth level returned by book queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthLevel {
    #[serde(with = "amount_str")]
    pub price: Amount,
    #[serde(with = "amount_str")]
    pub total_size: Amount,
    pub order_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookDepth {
    pub token: Address,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    #[serde(with = "amount_str")]
    pub best_bid: Amount,
    #[serde(with = "amount_str")]
    pub best_ask: Amount,
    #[serde(with = "amount_str")]
    pub last_trade_price: Amount,
    /// Unix millis.
    pub timestamp: i64,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_type_wire_round_trip() {
        for v in 0..=3u8 {
            let t = OrderType::from_wire(v).unwrap();
            assert_eq!(t.to_wire(), v);
        }
        assert!(OrderType::from_wire(4).is_none());
    }

    #[test]
    fn amounts_serialize_as_strings() {
        let trade = Trade {
            id: 1,
            token: Address::ZERO,
            maker_order_id: 1,
            taker_order_id: 2,
            maker: Address::ZERO,
            taker: Address::ZERO,
            price: 2 * crate::fixed::ONE,
            size: crate::fixed::ONE,
            timestamp: 0,
            maker_fee: 0,
            taker_fee: 0,
            pair_id: Some(1),
        };
        let json = serde_json::to_value(&trade).unwrap();
        assert_eq!(json["price"], "2000000000000000000");
        let back: Trade = serde_json::from_value(json).unwrap();
        assert_eq!(back.price, trade.price);
    }

    #[test]
    fn status_string_round_trip() {
        for s in [
            OrderStatus::New,
            OrderStatus::PartiallyFilled,
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Expired,
            OrderStatus::Rejected,
        ] {
            assert_eq!(OrderStatus::parse(s.as_str()), Some(s));
        }
    }
}

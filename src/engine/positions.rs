//! Paired position store.
//!
//! Exposure exists only as long-short pairs created at match time, so the
//! collateral backing every open position is locked and locally held by
//! construction. A fill first offsets the taker's opposite pairs (FIFO by
//! open time), then the maker's, and only the remainder opens a new pair.
//! Closing a pair settles both sides at the exit price; the counterparty
//! of an offset pair is cash-settled early.
//!
//! Funding accrual is lazy: any touch (close, liquidate, keeper sweep)
//! rolls the token funding index into the pair before the touch acts.

use alloy_primitives::Address;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{EngineError, EngineResult};
use crate::fixed::{self, Amount, SignedAmount, ONE};
use crate::ledger::PairSettlement;
use crate::models::{now_ms, PairStatus, PairedPosition, PositionView, Side};

/// Why a pair (or a slice of one) settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Voluntary,
    Liquidation(Side),
    AutoDeleverage,
}

/// One settled closure, sized `size_closed` at `exit_price`. The
/// settlement is ready for the balance ledger; the insurance fields and
/// pnl already include realized funding.
#[derive(Debug, Clone)]
pub struct PairClose {
    pub pair_id: u64,
    pub token: Address,
    pub status: PairStatus,
    pub size_closed: Amount,
    pub exit_price: Amount,
    pub settlement: PairSettlement,
    /// True when the pair is fully closed (no active remainder).
    pub fully_closed: bool,
}

/// Result of folding one fill into the store.
#[derive(Debug, Default)]
pub struct FillApplication {
    pub closed: Vec<PairClose>,
    pub opened: Option<PairedPosition>,
}

/// One side of a new fill, as the pair store needs it.
#[derive(Debug, Clone, Copy)]
pub struct FillParty {
    pub trader: Address,
    pub leverage: u128,
}

#[derive(Default)]
pub struct PairStore {
    pairs: RwLock<HashMap<u64, PairedPosition>>,
    /// Active pair ids per token, in open order (FIFO for offsets).
    by_token: RwLock<HashMap<Address, Vec<u64>>>,
    /// Active pair ids per trader, in open order.
    by_trader: RwLock<HashMap<Address, Vec<u64>>>,
    next_id: AtomicU64,
}

impl PairStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    /// Restore an active pair from the repository at startup.
    pub fn restore(&self, pair: PairedPosition) {
        let id = pair.pair_id;
        self.next_id.fetch_max(id + 1, Ordering::Relaxed);
        if pair.status == PairStatus::Active {
            self.by_token.write().entry(pair.token).or_default().push(id);
            self.by_trader
                .write()
                .entry(pair.long_trader)
                .or_default()
                .push(id);
            self.by_trader
                .write()
                .entry(pair.short_trader)
                .or_default()
                .push(id);
        }
        self.pairs.write().insert(id, pair);
    }

    pub fn get(&self, pair_id: u64) -> EngineResult<PairedPosition> {
        self.pairs
            .read()
            .get(&pair_id)
            .cloned()
            .ok_or(EngineError::PairNotFound(pair_id))
    }

    /// Fold a fill into the store: offset the taker's opposite pairs,
    /// then the maker's, then open a pair with the remainder.
    ///
    /// `taker_side` is the direction the taker traded; the maker traded
    /// the opposite. `funding_index` is the token's current index so
    /// every touched pair accrues before settling.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_fill(
        &self,
        token: Address,
        taker_side: Side,
        taker: FillParty,
        maker: FillParty,
        size: Amount,
        price: Amount,
        funding_index: SignedAmount,
    ) -> EngineResult<FillApplication> {
        let mut result = FillApplication::default();
        let mut remaining = size;

        // Taker reduces existing exposure first, then the maker.
        for (party, incoming_side) in [(taker, taker_side), (maker, taker_side.opposite())] {
            if remaining == 0 {
                break;
            }
            let consumed = self.offset_fifo(
                token,
                party.trader,
                incoming_side,
                remaining,
                price,
                funding_index,
                &mut result.closed,
            )?;
            remaining -= consumed;
        }

        if remaining > 0 {
            let (long, short) = match taker_side {
                Side::Long => (taker, maker),
                Side::Short => (maker, taker),
            };
            if long.trader == short.trader {
                return Err(EngineError::PairMismatched(
                    "pair would self-reference one trader".into(),
                ));
            }
            let pair = self.open_pair(token, long, short, remaining, price, funding_index)?;
            result.opened = Some(pair);
        }

        Ok(result)
    }

    fn open_pair(
        &self,
        token: Address,
        long: FillParty,
        short: FillParty,
        size: Amount,
        price: Amount,
        funding_index: SignedAmount,
    ) -> EngineResult<PairedPosition> {
        let pair_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pair = PairedPosition {
            pair_id,
            token,
            long_trader: long.trader,
            short_trader: short.trader,
            size,
            entry_price: price,
            long_collateral: fixed::collateral_for(size, price, long.leverage)?,
            short_collateral: fixed::collateral_for(size, price, short.leverage)?,
            long_leverage: long.leverage,
            short_leverage: short.leverage,
            opened_at: now_ms(),
            accumulated_funding_long: 0,
            accumulated_funding_short: 0,
            last_funding_index: funding_index,
            status: PairStatus::Active,
        };

        self.by_token.write().entry(token).or_default().push(pair_id);
        {
            let mut by_trader = self.by_trader.write();
            by_trader.entry(long.trader).or_default().push(pair_id);
            by_trader.entry(short.trader).or_default().push(pair_id);
        }
        self.pairs.write().insert(pair_id, pair.clone());
        Ok(pair)
    }

    /// Consume up to `cap` of `trader`'s exposure opposite to
    /// `incoming_side`, closing pairs FIFO at `price`. Returns the size
    /// consumed.
    #[allow(clippy::too_many_arguments)]
    fn offset_fifo(
        &self,
        token: Address,
        trader: Address,
        incoming_side: Side,
        cap: Amount,
        price: Amount,
        funding_index: SignedAmount,
        closed: &mut Vec<PairClose>,
    ) -> EngineResult<Amount> {
        let closing_side = incoming_side.opposite();
        let candidates: Vec<u64> = {
            let pairs = self.pairs.read();
            self.by_token
                .read()
                .get(&token)
                .map(|ids| {
                    ids.iter()
                        .copied()
                        .filter(|id| {
                            pairs
                                .get(id)
                                .map(|p| {
                                    p.status == PairStatus::Active
                                        && p.trader_side(trader) == Some(closing_side)
                                })
                                .unwrap_or(false)
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut consumed: Amount = 0;
        for pair_id in candidates {
            if consumed >= cap {
                break;
            }
            let slice = cap - consumed;
            let close = self.close_slice(
                pair_id,
                slice,
                price,
                funding_index,
                CloseReason::Voluntary,
                0,
            )?;
            consumed += close.size_closed;
            closed.push(close);
        }
        Ok(consumed)
    }

    /// Accrue the funding index into a pair. Owed amounts grow on the
    /// long side when the index rises.
    fn accrue_funding(pair: &mut PairedPosition, funding_index: SignedAmount) -> EngineResult<()> {
        let delta = funding_index - pair.last_funding_index;
        if delta != 0 {
            let size_i = i128::try_from(pair.size).map_err(|_| EngineError::ArithmeticOverflow)?;
            let owed = fixed::mul_div_signed(delta, size_i, ONE)?;
            pair.accumulated_funding_long += owed;
            pair.accumulated_funding_short -= owed;
        }
        pair.last_funding_index = funding_index;
        Ok(())
    }

    /// Keeper sweep: roll the current index into every active pair of a
    /// token. Returns the number of pairs touched.
    pub fn accrue_token_funding(
        &self,
        token: Address,
        funding_index: SignedAmount,
    ) -> EngineResult<usize> {
        let ids: Vec<u64> = self
            .by_token
            .read()
            .get(&token)
            .cloned()
            .unwrap_or_default();
        let mut pairs = self.pairs.write();
        let mut touched = 0;
        for id in ids {
            if let Some(pair) = pairs.get_mut(&id) {
                if pair.status == PairStatus::Active {
                    Self::accrue_funding(pair, funding_index)?;
                    touched += 1;
                }
            }
        }
        Ok(touched)
    }

    /// Close `size` of a pair (clamped to the pair size) at `exit_price`.
    /// Voluntary closes settle both sides zero-sum; liquidations forfeit
    /// the losing side's collateral slice and route the fee/shortfall
    /// through the liquidator and insurance accounts.
    pub fn close_slice(
        &self,
        pair_id: u64,
        size: Amount,
        exit_price: Amount,
        funding_index: SignedAmount,
        reason: CloseReason,
        liquidation_fee_bps: u128,
    ) -> EngineResult<PairClose> {
        let mut pairs = self.pairs.write();
        let pair = pairs
            .get_mut(&pair_id)
            .ok_or(EngineError::PairNotFound(pair_id))?;
        if pair.status != PairStatus::Active {
            return Err(EngineError::PairNotFound(pair_id));
        }

        Self::accrue_funding(pair, funding_index)?;

        let size_closed = size.min(pair.size);
        if size_closed == 0 {
            return Err(EngineError::PairMismatched("zero-size close".into()));
        }
        let fully_closed = size_closed == pair.size;

        // Proportional slices of collateral and accrued funding.
        let long_collateral = fixed::mul_div_floor(pair.long_collateral, size_closed, pair.size)?;
        let short_collateral = fixed::mul_div_floor(pair.short_collateral, size_closed, pair.size)?;
        let funding_long = if fully_closed {
            pair.accumulated_funding_long
        } else {
            fixed::mul_div_signed(
                pair.accumulated_funding_long,
                i128::try_from(size_closed).map_err(|_| EngineError::ArithmeticOverflow)?,
                pair.size,
            )?
        };
        let funding_short = -funding_long;

        let price_pnl_long = fixed::leg_pnl(pair.entry_price, exit_price, size_closed, true)?;
        // Funding owed subtracts from settled pnl.
        let pnl_long_raw = price_pnl_long - funding_long;
        let pnl_short_raw = -price_pnl_long - funding_short;

        let (settlement, status) = match reason {
            CloseReason::Voluntary => (
                PairSettlement {
                    long_trader: pair.long_trader,
                    short_trader: pair.short_trader,
                    long_collateral_released: long_collateral,
                    short_collateral_released: short_collateral,
                    pnl_long: pnl_long_raw,
                    pnl_short: pnl_short_raw,
                    fee_long: 0,
                    fee_short: 0,
                    liquidation_fee: 0,
                    insurance_draw: 0,
                    insurance_contribution: 0,
                },
                PairStatus::Closed,
            ),
            CloseReason::AutoDeleverage => (
                PairSettlement {
                    long_trader: pair.long_trader,
                    short_trader: pair.short_trader,
                    long_collateral_released: long_collateral,
                    short_collateral_released: short_collateral,
                    pnl_long: pnl_long_raw,
                    pnl_short: pnl_short_raw,
                    fee_long: 0,
                    fee_short: 0,
                    liquidation_fee: 0,
                    insurance_draw: 0,
                    insurance_contribution: 0,
                },
                PairStatus::AdlClosed,
            ),
            CloseReason::Liquidation(losing_side) => {
                let (loser_collateral, winner_raw) = match losing_side {
                    Side::Long => (long_collateral, pnl_short_raw),
                    Side::Short => (short_collateral, pnl_long_raw),
                };
                // The liquidated side forfeits its remaining collateral.
                let loser_pnl = -i128::try_from(loser_collateral)
                    .map_err(|_| EngineError::ArithmeticOverflow)?;
                let fee = fixed::fee_for(loser_collateral, liquidation_fee_bps)?
                    .min(loser_collateral);
                // The winner is owed its raw pnl minus the liquidation
                // fee, floored at zero.
                let fee_i = i128::try_from(fee).map_err(|_| EngineError::ArithmeticOverflow)?;
                let winner_pnl = (winner_raw - fee_i).max(0);

                let net = loser_pnl + winner_pnl + fee_i;
                let (draw, contribution) = if net > 0 {
                    (net.unsigned_abs(), 0)
                } else {
                    (0, net.unsigned_abs())
                };

                let (pnl_long, pnl_short) = match losing_side {
                    Side::Long => (loser_pnl, winner_pnl),
                    Side::Short => (winner_pnl, loser_pnl),
                };
                (
                    PairSettlement {
                        long_trader: pair.long_trader,
                        short_trader: pair.short_trader,
                        long_collateral_released: long_collateral,
                        short_collateral_released: short_collateral,
                        pnl_long,
                        pnl_short,
                        fee_long: 0,
                        fee_short: 0,
                        liquidation_fee: fee,
                        insurance_draw: draw,
                        insurance_contribution: contribution,
                    },
                    match losing_side {
                        Side::Long => PairStatus::LiquidatedLong,
                        Side::Short => PairStatus::LiquidatedShort,
                    },
                )
            }
        };

        // Shrink or finalize the pair. Entry price is unchanged on a
        // partial close.
        if fully_closed {
            pair.status = status;
            pair.size = 0;
            pair.long_collateral = 0;
            pair.short_collateral = 0;
            pair.accumulated_funding_long = 0;
            pair.accumulated_funding_short = 0;
        } else {
            pair.size -= size_closed;
            pair.long_collateral -= long_collateral;
            pair.short_collateral -= short_collateral;
            pair.accumulated_funding_long -= funding_long;
            pair.accumulated_funding_short -= funding_short;
        }
        let token = pair.token;
        let long_trader = pair.long_trader;
        let short_trader = pair.short_trader;
        drop(pairs);

        if fully_closed {
            self.unindex(pair_id, token, long_trader, short_trader);
        }

        Ok(PairClose {
            pair_id,
            token,
            status,
            size_closed,
            exit_price,
            settlement,
            fully_closed,
        })
    }

    fn unindex(&self, pair_id: u64, token: Address, long_trader: Address, short_trader: Address) {
        if let Some(ids) = self.by_token.write().get_mut(&token) {
            ids.retain(|id| *id != pair_id);
        }
        let mut by_trader = self.by_trader.write();
        for trader in [long_trader, short_trader] {
            if let Some(ids) = by_trader.get_mut(&trader) {
                ids.retain(|id| *id != pair_id);
            }
        }
    }

    /// All active pairs on a token, in open order.
    pub fn active_by_token(&self, token: Address) -> Vec<PairedPosition> {
        let ids = self
            .by_token
            .read()
            .get(&token)
            .cloned()
            .unwrap_or_default();
        let pairs = self.pairs.read();
        ids.iter().filter_map(|id| pairs.get(id).cloned()).collect()
    }

    /// All active pairs a trader participates in.
    pub fn active_by_trader(&self, trader: Address) -> Vec<PairedPosition> {
        let ids = self
            .by_trader
            .read()
            .get(&trader)
            .cloned()
            .unwrap_or_default();
        let pairs = self.pairs.read();
        ids.iter().filter_map(|id| pairs.get(id).cloned()).collect()
    }

    /// Exposure a trader could close with an `incoming_side` order.
    pub fn closable_size(&self, token: Address, trader: Address, incoming_side: Side) -> Amount {
        let closing_side = incoming_side.opposite();
        self.active_by_trader(trader)
            .iter()
            .filter(|p| p.token == token && p.trader_side(trader) == Some(closing_side))
            .map(|p| p.size)
            .sum()
    }

    /// Derived position views for a trader, one per (token, side) with
    /// size-weighted entry.
    pub fn position_views(&self, trader: Address) -> Vec<PositionView> {
        let mut grouped: HashMap<(Address, Side), Vec<PairedPosition>> = HashMap::new();
        for pair in self.active_by_trader(trader) {
            if let Some(side) = pair.trader_side(trader) {
                grouped.entry((pair.token, side)).or_default().push(pair);
            }
        }

        let mut views: Vec<PositionView> = grouped
            .into_iter()
            .filter_map(|((token, side), pairs)| {
                let size: Amount = pairs.iter().map(|p| p.size).sum();
                if size == 0 {
                    return None;
                }
                let weighted: u128 = pairs
                    .iter()
                    .filter_map(|p| fixed::mul_div_floor(p.entry_price, p.size, ONE).ok())
                    .sum();
                let entry_price = fixed::mul_div_floor(weighted, ONE, size).ok()?;
                Some(PositionView {
                    trader,
                    token,
                    side,
                    size,
                    entry_price,
                    collateral: pairs.iter().map(|p| p.collateral(side)).sum(),
                    accumulated_funding: pairs
                        .iter()
                        .map(|p| p.accumulated_funding(side))
                        .sum(),
                    pair_count: pairs.len(),
                })
            })
            .collect();
        views.sort_by_key(|v| (v.token, v.side.is_long()));
        views
    }

    /// Number of active pairs (all tokens).
    pub fn active_count(&self) -> usize {
        self.by_token.read().values().map(|v| v.len()).sum()
    }

    /// Annotate a liquidation-closed pair as ended by auto-deleverage:
    /// its survivor found no re-pair liquidity and the close stands as a
    /// force-close at mark.
    pub fn mark_adl(&self, pair_id: u64) {
        let mut pairs = self.pairs.write();
        if let Some(pair) = pairs.get_mut(&pair_id) {
            if matches!(
                pair.status,
                PairStatus::LiquidatedLong | PairStatus::LiquidatedShort
            ) {
                pair.status = PairStatus::AdlClosed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::LEVERAGE_ONE;

    fn token() -> Address {
        Address::repeat_byte(0x11)
    }

    fn alice() -> FillParty {
        FillParty {
            trader: Address::repeat_byte(0x0a),
            leverage: 5 * LEVERAGE_ONE,
        }
    }

    fn bob() -> FillParty {
        FillParty {
            trader: Address::repeat_byte(0x0b),
            leverage: 5 * LEVERAGE_ONE,
        }
    }

    fn carol() -> FillParty {
        FillParty {
            trader: Address::repeat_byte(0x0c),
            leverage: 10 * LEVERAGE_ONE,
        }
    }

    #[test]
    fn fill_with_no_prior_exposure_opens_pair() {
        let store = PairStore::new();
        let result = store
            .apply_fill(token(), Side::Long, alice(), bob(), ONE, 2 * ONE, 0)
            .unwrap();
        assert!(result.closed.is_empty());
        let pair = result.opened.unwrap();
        assert_eq!(pair.pair_id, 1);
        assert_eq!(pair.long_trader, alice().trader);
        assert_eq!(pair.short_trader, bob().trader);
        assert_eq!(pair.entry_price, 2 * ONE);
        // (1 * 2) / 5x = 0.4 quote per side.
        assert_eq!(pair.long_collateral, 2 * ONE / 5);
        assert_eq!(pair.short_collateral, 2 * ONE / 5);
    }

    #[test]
    fn self_pair_is_refused() {
        let store = PairStore::new();
        let result = store.apply_fill(token(), Side::Long, alice(), alice(), ONE, 2 * ONE, 0);
        assert!(matches!(result, Err(EngineError::PairMismatched(_))));
    }

    #[test]
    fn opposite_fill_offsets_fifo_and_realizes_pnl() {
        let store = PairStore::new();
        // Alice long vs Bob short at 2.0, then Alice long vs Carol short at 2.0.
        store
            .apply_fill(token(), Side::Long, alice(), bob(), ONE, 2 * ONE, 0)
            .unwrap();
        store
            .apply_fill(token(), Side::Long, alice(), carol(), ONE, 2 * ONE, 0)
            .unwrap();

        // Alice sells 1.5 at 3.0: closes pair 1 fully, pair 2 halfway.
        let result = store
            .apply_fill(
                token(),
                Side::Short,
                alice(),
                carol(),
                3 * ONE / 2,
                3 * ONE,
                0,
            )
            .unwrap();
        assert_eq!(result.closed.len(), 2);
        assert!(result.opened.is_none());

        let first = &result.closed[0];
        assert_eq!(first.pair_id, 1);
        assert!(first.fully_closed);
        assert_eq!(first.settlement.pnl_long, ONE as i128);
        assert_eq!(first.settlement.pnl_short, -(ONE as i128));

        let second = &result.closed[1];
        assert_eq!(second.pair_id, 2);
        assert!(!second.fully_closed);
        assert_eq!(second.size_closed, ONE / 2);

        // Pair 2 keeps its entry and proportional collateral.
        let remainder = store.get(2).unwrap();
        assert_eq!(remainder.size, ONE / 2);
        assert_eq!(remainder.entry_price, 2 * ONE);
        assert_eq!(remainder.long_collateral, ONE / 5);
    }

    #[test]
    fn partial_close_keeps_entry_price() {
        let store = PairStore::new();
        store
            .apply_fill(token(), Side::Long, alice(), bob(), 2 * ONE, 2 * ONE, 0)
            .unwrap();
        let close = store
            .close_slice(1, ONE, 2 * ONE, 0, CloseReason::Voluntary, 0)
            .unwrap();
        assert!(!close.fully_closed);
        let pair = store.get(1).unwrap();
        assert_eq!(pair.entry_price, 2 * ONE);
        assert_eq!(pair.size, ONE);
        assert_eq!(pair.status, PairStatus::Active);
    }

    #[test]
    fn funding_accrual_is_symmetric_and_lazy() {
        let store = PairStore::new();
        store
            .apply_fill(token(), Side::Long, alice(), bob(), ONE, 2 * ONE, 0)
            .unwrap();

        // Index moves by +0.01 quote per unit of size.
        let index = (ONE / 100) as i128;
        store.accrue_token_funding(token(), index).unwrap();
        let pair = store.get(1).unwrap();
        assert_eq!(pair.accumulated_funding_long, (ONE / 100) as i128);
        assert_eq!(
            pair.accumulated_funding_long,
            -pair.accumulated_funding_short
        );
        assert_eq!(pair.last_funding_index, index);

        // Re-accruing at the same index is a no-op.
        store.accrue_token_funding(token(), index).unwrap();
        let again = store.get(1).unwrap();
        assert_eq!(again.accumulated_funding_long, pair.accumulated_funding_long);
    }

    #[test]
    fn close_settles_funding_into_pnl() {
        let store = PairStore::new();
        store
            .apply_fill(token(), Side::Long, alice(), bob(), ONE, 2 * ONE, 0)
            .unwrap();
        let index = (ONE / 100) as i128;

        // Close at entry: price pnl zero, so the whole settlement is the
        // funding transfer from long to short.
        let close = store
            .close_slice(1, ONE, 2 * ONE, index, CloseReason::Voluntary, 0)
            .unwrap();
        assert_eq!(close.settlement.pnl_long, -((ONE / 100) as i128));
        assert_eq!(close.settlement.pnl_short, (ONE / 100) as i128);
        assert_eq!(
            close.settlement.pnl_long + close.settlement.pnl_short,
            0
        );
    }

    #[test]
    fn liquidation_forfeits_collateral_and_draws_insurance() {
        let store = PairStore::new();
        store
            .apply_fill(token(), Side::Long, alice(), bob(), ONE, 2 * ONE, 0)
            .unwrap();

        // Mark collapses to 1.6: Alice's 0.4 collateral exactly covers
        // the 0.4 loss; the 1% fee is short by exactly its own size.
        let close = store
            .close_slice(
                1,
                ONE,
                8 * ONE / 5,
                0,
                CloseReason::Liquidation(Side::Long),
                100,
            )
            .unwrap();
        assert_eq!(close.status, PairStatus::LiquidatedLong);
        let s = &close.settlement;
        assert_eq!(s.pnl_long, -((2 * ONE / 5) as i128));
        let fee = fixed::fee_for(2 * ONE / 5, 100).unwrap();
        assert_eq!(s.liquidation_fee, fee);
        assert_eq!(s.pnl_short, (2 * ONE / 5) as i128 - fee as i128);
        // Loser's collateral exactly covered the winner's pnl, so the
        // only imbalance is the fee the winner gave up.
        assert_eq!(s.insurance_draw, 0);
        assert_eq!(s.insurance_contribution, 0);
        assert_eq!(
            s.pnl_long + s.pnl_short + s.liquidation_fee as i128,
            0
        );
    }

    #[test]
    fn deep_underwater_liquidation_draws_the_gap() {
        let store = PairStore::new();
        store
            .apply_fill(token(), Side::Long, alice(), bob(), ONE, 2 * ONE, 0)
            .unwrap();
        // Mark gaps to 1.0: loss 1.0 against 0.4 collateral.
        let close = store
            .close_slice(1, ONE, ONE, 0, CloseReason::Liquidation(Side::Long), 0)
            .unwrap();
        let s = &close.settlement;
        assert_eq!(s.pnl_long, -((2 * ONE / 5) as i128));
        assert_eq!(s.pnl_short, ONE as i128);
        assert_eq!(s.insurance_draw, (3 * ONE / 5) as u128);
        assert_eq!(s.insurance_contribution, 0);
    }

    #[test]
    fn shallow_liquidation_contributes_excess_margin() {
        let store = PairStore::new();
        store
            .apply_fill(token(), Side::Long, alice(), bob(), ONE, 2 * ONE, 0)
            .unwrap();
        // Barely past maintenance: loss 0.395 against 0.4 collateral.
        let exit = 2 * ONE - 395 * ONE / 1000;
        let close = store
            .close_slice(1, ONE, exit, 0, CloseReason::Liquidation(Side::Long), 0)
            .unwrap();
        let s = &close.settlement;
        assert_eq!(s.pnl_long, -((2 * ONE / 5) as i128));
        assert_eq!(s.pnl_short, (395 * ONE / 1000) as i128);
        // The 0.005 of forfeited margin not owed to the winner banks in
        // the insurance fund.
        assert_eq!(s.insurance_contribution, (5 * ONE / 1000) as u128);
        assert_eq!(s.insurance_draw, 0);
    }

    #[test]
    fn views_aggregate_across_pairs() {
        let store = PairStore::new();
        store
            .apply_fill(token(), Side::Long, alice(), bob(), ONE, 2 * ONE, 0)
            .unwrap();
        store
            .apply_fill(token(), Side::Long, alice(), carol(), ONE, 4 * ONE, 0)
            .unwrap();

        let views = store.position_views(alice().trader);
        assert_eq!(views.len(), 1);
        let v = &views[0];
        assert_eq!(v.side, Side::Long);
        assert_eq!(v.size, 2 * ONE);
        assert_eq!(v.entry_price, 3 * ONE);
        assert_eq!(v.pair_count, 2);

        // Bob only sees his short.
        let bob_views = store.position_views(bob().trader);
        assert_eq!(bob_views.len(), 1);
        assert_eq!(bob_views[0].side, Side::Short);
        assert_eq!(bob_views[0].size, ONE);
    }

    #[test]
    fn closable_size_counts_only_opposite_side() {
        let store = PairStore::new();
        store
            .apply_fill(token(), Side::Long, alice(), bob(), ONE, 2 * ONE, 0)
            .unwrap();
        assert_eq!(store.closable_size(token(), alice().trader, Side::Short), ONE);
        assert_eq!(store.closable_size(token(), alice().trader, Side::Long), 0);
        assert_eq!(store.closable_size(token(), bob().trader, Side::Long), ONE);
    }

    #[test]
    fn restore_rebuilds_indices_and_id_counter() {
        let store = PairStore::new();
        let pair = PairedPosition {
            pair_id: 7,
            token: token(),
            long_trader: alice().trader,
            short_trader: bob().trader,
            size: ONE,
            entry_price: 2 * ONE,
            long_collateral: 2 * ONE / 5,
            short_collateral: 2 * ONE / 5,
            long_leverage: 5 * LEVERAGE_ONE,
            short_leverage: 5 * LEVERAGE_ONE,
            opened_at: 0,
            accumulated_funding_long: 0,
            accumulated_funding_short: 0,
            last_funding_index: 0,
            status: PairStatus::Active,
        };
        store.restore(pair);
        assert_eq!(store.active_by_token(token()).len(), 1);

        let next = store
            .apply_fill(token(), Side::Long, carol(), bob(), ONE, 2 * ONE, 0)
            .unwrap();
        assert_eq!(next.opened.unwrap().pair_id, 8);
    }
}

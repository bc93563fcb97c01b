//! Balance ledger: available and locked quote collateral per trader.
//!
//! Every mutation is short and single-trader, so each account carries its
//! own lock; operations touching two accounts acquire them in address
//! order. Pair settlement is one atomic operation that releases both
//! sides' collateral, applies pnl and fees, and enforces conservation:
//! a broken zero-sum is a fatal invariant, not a recoverable error.

use alloy_primitives::{address, Address};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::fixed::{Amount, SignedAmount};

/// Protocol fee sink (maker/taker fees).
pub const FEE_ACCOUNT: Address = address!("00000000000000000000000000000000000000fe");
/// Liquidation fee recipient.
pub const LIQUIDATOR_ACCOUNT: Address = address!("00000000000000000000000000000000000000f1");
/// Insurance fund; drawn when a liquidated side's collateral cannot cover
/// its loss. Real residency is on-chain; this mirror may be topped up via
/// deposits like any account.
pub const INSURANCE_ACCOUNT: Address = address!("00000000000000000000000000000000000000f5");

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Balances {
    pub available: Amount,
    pub locked: Amount,
}

/// Inputs to the atomic pair settlement.
///
/// Conservation requirement:
/// `pnl_long + pnl_short + liquidation_fee + insurance_contribution
///  == insurance_draw`
/// (all as signed quote). Trading fees move trader → fee sink and are
/// conserving by construction; the liquidation fee moves seized
/// collateral to the liquidator account; an insurance draw injects the
/// shortfall a bankrupt side could not cover, while a contribution banks
/// seized margin left over after the counterparty was made whole.
#[derive(Debug, Clone)]
pub struct PairSettlement {
    pub long_trader: Address,
    pub short_trader: Address,
    pub long_collateral_released: Amount,
    pub short_collateral_released: Amount,
    pub pnl_long: SignedAmount,
    pub pnl_short: SignedAmount,
    pub fee_long: Amount,
    pub fee_short: Amount,
    pub liquidation_fee: Amount,
    pub insurance_draw: Amount,
    pub insurance_contribution: Amount,
}

#[derive(Debug, Default)]
pub struct BalanceLedger {
    accounts: RwLock<HashMap<Address, Arc<Mutex<Balances>>>>,
}

impl BalanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn account(&self, trader: Address) -> Arc<Mutex<Balances>> {
        if let Some(acct) = self.accounts.read().get(&trader) {
            return acct.clone();
        }
        self.accounts
            .write()
            .entry(trader)
            .or_insert_with(Default::default)
            .clone()
    }

    pub fn balances(&self, trader: Address) -> Balances {
        *self.account(trader).lock()
    }

    /// Credit freshly deposited funds.
    pub fn deposit(&self, trader: Address, amount: Amount) {
        let acct = self.account(trader);
        let mut b = acct.lock();
        b.available = b.available.saturating_add(amount);
    }

    /// Move available → locked; fails without touching state if short.
    pub fn lock(&self, trader: Address, amount: Amount) -> EngineResult<()> {
        let acct = self.account(trader);
        let mut b = acct.lock();
        if b.available < amount {
            return Err(EngineError::InsufficientBalance);
        }
        b.available -= amount;
        b.locked += amount;
        Ok(())
    }

    /// Move locked → available. Saturating: cancellation paths may race a
    /// settlement that already consumed part of the lock.
    pub fn release(&self, trader: Address, amount: Amount) {
        let acct = self.account(trader);
        let mut b = acct.lock();
        let freed = amount.min(b.locked);
        if freed < amount {
            warn!(
                %trader,
                requested = %amount,
                freed = %freed,
                "release exceeded locked balance; clamping"
            );
        }
        b.locked -= freed;
        b.available += freed;
    }

    /// available(from) → available(to). Locks taken in address order.
    pub fn transfer(&self, from: Address, to: Address, amount: Amount) -> EngineResult<()> {
        if from == to || amount == 0 {
            return Ok(());
        }
        let a = self.account(from);
        let b = self.account(to);
        let (first, second) = if from < to { (&a, &b) } else { (&b, &a) };
        let mut first_guard = first.lock();
        let mut second_guard = second.lock();
        let (from_b, to_b) = if from < to {
            (&mut *first_guard, &mut *second_guard)
        } else {
            (&mut *second_guard, &mut *first_guard)
        };
        if from_b.available < amount {
            return Err(EngineError::InsufficientBalance);
        }
        from_b.available -= amount;
        to_b.available = to_b.available.saturating_add(amount);
        Ok(())
    }

    /// Atomic settlement of one pair: release both locks, apply pnl and
    /// fees, move protocol shares. Enforces conservation before mutating.
    pub fn settle_pair(&self, s: &PairSettlement) -> EngineResult<()> {
        let liq_fee =
            i128::try_from(s.liquidation_fee).map_err(|_| EngineError::ArithmeticOverflow)?;
        let draw = i128::try_from(s.insurance_draw).map_err(|_| EngineError::ArithmeticOverflow)?;
        let contribution = i128::try_from(s.insurance_contribution)
            .map_err(|_| EngineError::ArithmeticOverflow)?;
        let net = s
            .pnl_long
            .checked_add(s.pnl_short)
            .and_then(|v| v.checked_add(liq_fee))
            .and_then(|v| v.checked_add(contribution))
            .ok_or(EngineError::ArithmeticOverflow)?;
        if net != draw {
            return Err(EngineError::ZeroSumBroken);
        }

        self.settle_side(
            s.long_trader,
            s.long_collateral_released,
            s.pnl_long,
            s.fee_long,
        );
        self.settle_side(
            s.short_trader,
            s.short_collateral_released,
            s.pnl_short,
            s.fee_short,
        );

        let total_fees = s.fee_long.saturating_add(s.fee_short);
        if total_fees > 0 {
            self.deposit(FEE_ACCOUNT, total_fees);
        }
        if s.liquidation_fee > 0 {
            self.deposit(LIQUIDATOR_ACCOUNT, s.liquidation_fee);
        }
        if s.insurance_contribution > 0 {
            self.deposit(INSURANCE_ACCOUNT, s.insurance_contribution);
        }
        if s.insurance_draw > 0 {
            let acct = self.account(INSURANCE_ACCOUNT);
            let mut b = acct.lock();
            if b.available < s.insurance_draw {
                warn!(
                    draw = %s.insurance_draw,
                    available = %b.available,
                    "insurance fund mirror short; draw recorded, bridge escalates"
                );
                b.available = 0;
            } else {
                b.available -= s.insurance_draw;
            }
        }
        Ok(())
    }

    fn settle_side(&self, trader: Address, collateral: Amount, pnl: SignedAmount, fee: Amount) {
        let acct = self.account(trader);
        let mut b = acct.lock();

        let freed = collateral.min(b.locked);
        if freed < collateral {
            warn!(%trader, "settlement released more than locked; clamping");
        }
        b.locked -= freed;
        b.available += freed;

        if pnl >= 0 {
            b.available = b.available.saturating_add(pnl.unsigned_abs());
        } else {
            let loss = pnl.unsigned_abs();
            if loss > b.available {
                warn!(%trader, loss = %loss, available = %b.available, "loss exceeds balance; clamping");
                b.available = 0;
            } else {
                b.available -= loss;
            }
        }

        if fee > b.available {
            warn!(%trader, fee = %fee, "fee exceeds balance; clamping");
            b.available = 0;
        } else {
            b.available -= fee;
        }
    }

    /// Reconciliation against an on-chain balance report. Deposits the
    /// engine has not seen raise `available`; a chain view lower than the
    /// ledger is logged and kept, never silently overwritten.
    pub fn sync_from_chain(&self, trader: Address, on_chain_total: Amount) {
        let acct = self.account(trader);
        let mut b = acct.lock();
        let tracked = b.available.saturating_add(b.locked);
        if on_chain_total > tracked {
            let delta = on_chain_total - tracked;
            b.available = b.available.saturating_add(delta);
        } else if on_chain_total < tracked {
            warn!(
                %trader,
                tracked = %tracked,
                on_chain = %on_chain_total,
                "chain balance below engine ledger; keeping ledger"
            );
        }
    }

    /// Snapshot for persistence.
    pub fn snapshot(&self) -> Vec<(Address, Balances)> {
        self.accounts
            .read()
            .iter()
            .map(|(a, acct)| (*a, *acct.lock()))
            .collect()
    }

    /// Restore one account from the repository.
    pub fn hydrate(&self, trader: Address, balances: Balances) {
        let acct = self.account(trader);
        *acct.lock() = balances;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::ONE;

    fn alice() -> Address {
        Address::repeat_byte(0x0a)
    }

    fn bob() -> Address {
        Address::repeat_byte(0x0b)
    }

    fn funded(trader: Address, ledger: &BalanceLedger, amount: Amount) {
        ledger.deposit(trader, amount);
    }

    #[test]
    fn lock_requires_available() {
        let ledger = BalanceLedger::new();
        funded(alice(), &ledger, ONE);
        assert_eq!(
            ledger.lock(alice(), 2 * ONE),
            Err(EngineError::InsufficientBalance)
        );
        ledger.lock(alice(), ONE).unwrap();
        let b = ledger.balances(alice());
        assert_eq!(b.available, 0);
        assert_eq!(b.locked, ONE);
    }

    #[test]
    fn release_is_saturating() {
        let ledger = BalanceLedger::new();
        funded(alice(), &ledger, ONE);
        ledger.lock(alice(), ONE).unwrap();
        ledger.release(alice(), 3 * ONE);
        let b = ledger.balances(alice());
        assert_eq!(b.available, ONE);
        assert_eq!(b.locked, 0);
    }

    #[test]
    fn transfer_moves_available() {
        let ledger = BalanceLedger::new();
        funded(alice(), &ledger, ONE);
        ledger.transfer(alice(), bob(), ONE / 2).unwrap();
        assert_eq!(ledger.balances(alice()).available, ONE / 2);
        assert_eq!(ledger.balances(bob()).available, ONE / 2);
        assert_eq!(
            ledger.transfer(alice(), bob(), ONE),
            Err(EngineError::InsufficientBalance)
        );
    }

    #[test]
    fn settle_pair_is_zero_sum() {
        let ledger = BalanceLedger::new();
        funded(alice(), &ledger, ONE);
        funded(bob(), &ledger, ONE);
        ledger.lock(alice(), ONE / 2).unwrap();
        ledger.lock(bob(), ONE / 2).unwrap();

        // Alice wins 0.1, Bob loses 0.1, both pay 0.01 fees.
        let s = PairSettlement {
            long_trader: alice(),
            short_trader: bob(),
            long_collateral_released: ONE / 2,
            short_collateral_released: ONE / 2,
            pnl_long: (ONE / 10) as i128,
            pnl_short: -((ONE / 10) as i128),
            fee_long: ONE / 100,
            fee_short: ONE / 100,
            liquidation_fee: 0,
            insurance_draw: 0,
            insurance_contribution: 0,
        };
        ledger.settle_pair(&s).unwrap();

        let a = ledger.balances(alice());
        let b = ledger.balances(bob());
        assert_eq!(a.available, ONE + ONE / 10 - ONE / 100);
        assert_eq!(a.locked, 0);
        assert_eq!(b.available, ONE - ONE / 10 - ONE / 100);
        assert_eq!(ledger.balances(FEE_ACCOUNT).available, 2 * (ONE / 100));

        // Total quote across all accounts is conserved.
        let total: u128 = ledger
            .snapshot()
            .iter()
            .map(|(_, bal)| bal.available + bal.locked)
            .sum();
        assert_eq!(total, 2 * ONE);
    }

    #[test]
    fn broken_zero_sum_is_fatal() {
        let ledger = BalanceLedger::new();
        let s = PairSettlement {
            long_trader: alice(),
            short_trader: bob(),
            long_collateral_released: 0,
            short_collateral_released: 0,
            pnl_long: 5,
            pnl_short: -4,
            fee_long: 0,
            fee_short: 0,
            liquidation_fee: 0,
            insurance_draw: 0,
            insurance_contribution: 0,
        };
        assert_eq!(ledger.settle_pair(&s), Err(EngineError::ZeroSumBroken));
    }

    #[test]
    fn liquidation_settlement_balances_with_fee_and_draw() {
        let ledger = BalanceLedger::new();
        funded(alice(), &ledger, ONE);
        funded(bob(), &ledger, ONE);
        funded(INSURANCE_ACCOUNT, &ledger, ONE);
        ledger.lock(alice(), ONE / 2).unwrap();
        ledger.lock(bob(), ONE / 2).unwrap();

        // Alice is liquidated: loses her full 0.5 collateral; of that,
        // 0.05 goes to the liquidator and 0.45 to Bob; Bob's win of 0.6
        // needs a 0.15 insurance draw on top.
        let s = PairSettlement {
            long_trader: alice(),
            short_trader: bob(),
            long_collateral_released: ONE / 2,
            short_collateral_released: ONE / 2,
            pnl_long: -((ONE / 2) as i128),
            pnl_short: (6 * ONE / 10) as i128,
            fee_long: 0,
            fee_short: 0,
            liquidation_fee: ONE / 20,
            insurance_draw: (ONE / 10) + (ONE / 20),
            insurance_contribution: 0,
        };
        ledger.settle_pair(&s).unwrap();

        assert_eq!(ledger.balances(alice()).available, ONE / 2);
        assert_eq!(ledger.balances(bob()).available, ONE + 6 * ONE / 10);
        assert_eq!(ledger.balances(LIQUIDATOR_ACCOUNT).available, ONE / 20);
        assert_eq!(
            ledger.balances(INSURANCE_ACCOUNT).available,
            ONE - (ONE / 10) - (ONE / 20)
        );
    }

    #[test]
    fn chain_sync_only_raises() {
        let ledger = BalanceLedger::new();
        funded(alice(), &ledger, ONE);
        ledger.sync_from_chain(alice(), 3 * ONE);
        assert_eq!(ledger.balances(alice()).available, 3 * ONE);
        ledger.sync_from_chain(alice(), ONE);
        assert_eq!(ledger.balances(alice()).available, 3 * ONE);
    }
}

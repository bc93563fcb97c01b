//! Risk assessment for paired positions.
//!
//! For each side of a pair:
//! `margin_ratio = (collateral + pnl - funding_owed) / (size * mark)`.
//! A side whose ratio falls to the maintenance floor is liquidatable. The
//! liquidation price is the closed-form mark at which the ratio equals
//! maintenance:
//!
//!   long:  P = (E*S + F - C) / (S * (1 - m))
//!   short: P = (C + E*S - F) / (S * (1 + m))
//!
//! with C collateral, E entry, S size, F funding owed, m the maintenance
//! ratio. The periodic sweep and the reactive post-mark scan both funnel
//! through `assess_pair`; when both sides breach in one observation the
//! worse margin is liquidated first and the survivor goes through the
//! auto-deleverage hook.

use alloy_primitives::U256;

use crate::error::{EngineError, EngineResult};
use crate::fixed::{self, Amount, BPS_ONE, ONE};
use crate::models::{PairedPosition, Side};

/// A side that has hit maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breach {
    pub side: Side,
    pub margin_bps: i128,
    /// Set when the opposite side breached in the same observation; the
    /// survivor must be re-paired or force-closed (ADL).
    pub both_breached: bool,
}

/// Margin ratio of one side in bps. Negative when the side is underwater
/// past its collateral.
pub fn side_margin_bps(pair: &PairedPosition, side: Side, mark: Amount) -> EngineResult<i128> {
    let notional = fixed::notional(pair.size, mark)?;
    if notional == 0 {
        return Err(EngineError::PairMismatched("zero notional".into()));
    }
    let collateral = i128::try_from(pair.collateral(side)).map_err(|_| EngineError::ArithmeticOverflow)?;
    let pnl = fixed::leg_pnl(pair.entry_price, mark, pair.size, side.is_long())?;
    let equity = collateral + pnl - pair.accumulated_funding(side);
    fixed::mul_div_signed(
        equity,
        BPS_ONE as i128,
        notional,
    )
}

/// The mark price at which `side` hits the maintenance ratio. `None` when
/// no positive price can liquidate the side (e.g. a long whose collateral
/// covers the full entry notional plus funding).
pub fn liquidation_price(
    pair: &PairedPosition,
    side: Side,
    maintenance_bps: u128,
) -> EngineResult<Option<Amount>> {
    if pair.size == 0 {
        return Ok(None);
    }
    let entry_notional = fixed::notional(pair.size, pair.entry_price)?;
    let entry_notional =
        i128::try_from(entry_notional).map_err(|_| EngineError::ArithmeticOverflow)?;
    let collateral =
        i128::try_from(pair.collateral(side)).map_err(|_| EngineError::ArithmeticOverflow)?;
    let funding = pair.accumulated_funding(side);

    let (numerator, denom_bps) = match side {
        Side::Long => (
            entry_notional + funding - collateral,
            (BPS_ONE as i128) - maintenance_bps as i128,
        ),
        Side::Short => (
            collateral + entry_notional - funding,
            (BPS_ONE as i128) + maintenance_bps as i128,
        ),
    };
    if numerator <= 0 || denom_bps <= 0 {
        return Ok(None);
    }

    // P = numerator * ONE * BPS / (S * denom_bps), in 256-bit space.
    let wide = U256::from(numerator.unsigned_abs())
        * U256::from(ONE)
        * U256::from(BPS_ONE)
        / (U256::from(pair.size) * U256::from(denom_bps.unsigned_abs()));
    let price = u128::try_from(wide).map_err(|_| EngineError::ArithmeticOverflow)?;
    Ok(Some(price))
}

/// Evaluate a pair against the maintenance floor at `mark`. Returns the
/// side to liquidate first, if any.
pub fn assess_pair(
    pair: &PairedPosition,
    mark: Amount,
    maintenance_bps: u128,
) -> EngineResult<Option<Breach>> {
    let long_bps = side_margin_bps(pair, Side::Long, mark)?;
    let short_bps = side_margin_bps(pair, Side::Short, mark)?;
    let floor = maintenance_bps as i128;

    let long_breached = long_bps <= floor;
    let short_breached = short_bps <= floor;
    Ok(match (long_breached, short_breached) {
        (false, false) => None,
        (true, false) => Some(Breach {
            side: Side::Long,
            margin_bps: long_bps,
            both_breached: false,
        }),
        (false, true) => Some(Breach {
            side: Side::Short,
            margin_bps: short_bps,
            both_breached: false,
        }),
        // Pathological double breach (large jumps): worst margin first.
        (true, true) => {
            if long_bps <= short_bps {
                Some(Breach {
                    side: Side::Long,
                    margin_bps: long_bps,
                    both_breached: true,
                })
            } else {
                Some(Breach {
                    side: Side::Short,
                    margin_bps: short_bps,
                    both_breached: true,
                })
            }
        }
    })
}

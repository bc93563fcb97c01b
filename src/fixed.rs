//! Fixed-point arithmetic for prices, sizes, leverage, and rates.
//!
//! All monetary values are unsigned scaled integers. Prices and sizes use
//! a 1e18 scale, leverage uses 1e4 (10x = 100_000), and rates/ratios are
//! basis points on a 1e4 scale (100% = 10_000). Signed quantities (pnl,
//! funding) use the same scales on `i128`.
//!
//! Every multiply-then-divide goes through a 256-bit intermediate so that
//! `size * price` style products cannot wrap. Overflow of the final result
//! is an invariant error, never a silent truncation.

use crate::error::{EngineError, EngineResult};
use alloy_primitives::U256;

/// 1.0 in price/size scale.
pub const ONE: u128 = 1_000_000_000_000_000_000;
/// 1x leverage.
pub const LEVERAGE_ONE: u128 = 10_000;
/// 100% in basis points.
pub const BPS_ONE: u128 = 10_000;

/// Unsigned quote/base amount, 1e18 scale.
pub type Amount = u128;
/// Signed amount (pnl, funding), 1e18 scale.
pub type SignedAmount = i128;

/// `a * b / denom` rounded toward zero, with a 256-bit intermediate.
pub fn mul_div_floor(a: u128, b: u128, denom: u128) -> EngineResult<u128> {
    if denom == 0 {
        return Err(EngineError::ArithmeticOverflow);
    }
    let wide = U256::from(a) * U256::from(b) / U256::from(denom);
    u128::try_from(wide).map_err(|_| EngineError::ArithmeticOverflow)
}

/// `a * b / denom` rounded away from zero. Used for fees so that dust
/// rounds against the fee payer, never against the ledger.
pub fn mul_div_ceil(a: u128, b: u128, denom: u128) -> EngineResult<u128> {
    if denom == 0 {
        return Err(EngineError::ArithmeticOverflow);
    }
    let num = U256::from(a) * U256::from(b);
    let d = U256::from(denom);
    let wide = (num + d - U256::from(1u8)) / d;
    u128::try_from(wide).map_err(|_| EngineError::ArithmeticOverflow)
}

/// Signed `a * b / denom` rounded toward zero.
pub fn mul_div_signed(a: i128, b: i128, denom: u128) -> EngineResult<i128> {
    if denom == 0 {
        return Err(EngineError::ArithmeticOverflow);
    }
    let negative = (a < 0) != (b < 0);
    let mag = mul_div_floor(a.unsigned_abs(), b.unsigned_abs(), denom)?;
    let mag = i128::try_from(mag).map_err(|_| EngineError::ArithmeticOverflow)?;
    Ok(if negative { -mag } else { mag })
}

/// Quote notional of `size` base units at `price`: `size * price / 1e18`.
pub fn notional(size: Amount, price: Amount) -> EngineResult<Amount> {
    mul_div_floor(size, price, ONE)
}

/// Initial collateral for a position leg: `notional / leverage`.
/// Rounded up so the margin backing a pair is never short by dust.
pub fn collateral_for(size: Amount, price: Amount, leverage: u128) -> EngineResult<Amount> {
    if leverage == 0 {
        return Err(EngineError::ArithmeticOverflow);
    }
    let value = notional(size, price)?;
    mul_div_ceil(value, LEVERAGE_ONE, leverage)
}

/// Fee on a notional, in basis points, rounded up.
pub fn fee_for(notional: Amount, fee_bps: u128) -> EngineResult<Amount> {
    mul_div_ceil(notional, fee_bps, BPS_ONE)
}

/// `value * bps / 1e4`, floor. For maintenance thresholds and rate math.
pub fn apply_bps(value: Amount, bps: u128) -> EngineResult<Amount> {
    mul_div_floor(value, bps, BPS_ONE)
}

/// Signed pnl of a directional leg: `(exit - entry) * size * dir` where
/// `dir` is +1 for long and -1 for short.
pub fn leg_pnl(entry: Amount, exit: Amount, size: Amount, long: bool) -> EngineResult<SignedAmount> {
    let diff: i128 = if exit >= entry {
        i128::try_from(exit - entry).map_err(|_| EngineError::ArithmeticOverflow)?
    } else {
        -i128::try_from(entry - exit).map_err(|_| EngineError::ArithmeticOverflow)?
    };
    let size_i = i128::try_from(size).map_err(|_| EngineError::ArithmeticOverflow)?;
    let pnl = mul_div_signed(diff, size_i, ONE)?;
    Ok(if long { pnl } else { -pnl })
}

/// Parse a base-10 decimal-string wire amount into its raw scaled integer.
pub fn parse_wire_amount(s: &str) -> EngineResult<u128> {
    s.parse::<u128>()
        .map_err(|_| EngineError::InvalidOrderParameters(format!("not a base-10 integer: {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_div_uses_wide_intermediate() {
        // 3e30 * 5e24 overflows a bare u128 product; the 256-bit
        // intermediate still lands the exact quotient.
        let a = 3_000_000_000_000_000_000_000_000_000_000u128;
        let b = 5_000_000_000_000_000_000_000_000u128;
        let r = mul_div_floor(a, b, ONE).unwrap();
        assert_eq!(r, 15_000_000_000_000_000_000_000_000_000_000_000_000u128);
    }

    #[test]
    fn mul_div_rejects_zero_denominator() {
        assert_eq!(
            mul_div_floor(1, 1, 0),
            Err(EngineError::ArithmeticOverflow)
        );
    }

    #[test]
    fn mul_div_overflow_is_detected() {
        let r = mul_div_floor(u128::MAX, u128::MAX, 1);
        assert_eq!(r, Err(EngineError::ArithmeticOverflow));
    }

    #[test]
    fn ceil_rounds_up_only_on_remainder() {
        assert_eq!(mul_div_ceil(10, 1, 3).unwrap(), 4);
        assert_eq!(mul_div_ceil(9, 1, 3).unwrap(), 3);
        assert_eq!(mul_div_floor(10, 1, 3).unwrap(), 3);
    }

    #[test]
    fn collateral_matches_simple_fill() {
        // size 1e18 at price 2e18, 5x leverage -> 0.4e18 quote
        let c = collateral_for(ONE, 2 * ONE, 5 * LEVERAGE_ONE).unwrap();
        assert_eq!(c, 400_000_000_000_000_000);
    }

    #[test]
    fn fees_round_against_the_payer() {
        // 30 bps of 1 quote unit of notional
        let f = fee_for(ONE, 30).unwrap();
        assert_eq!(f, 3_000_000_000_000_000);
        // indivisible notional rounds up
        assert_eq!(fee_for(1, 1).unwrap(), 1);
    }

    #[test]
    fn leg_pnl_signs() {
        let entry = 2 * ONE;
        let exit = 3 * ONE;
        assert_eq!(leg_pnl(entry, exit, ONE, true).unwrap(), ONE as i128);
        assert_eq!(leg_pnl(entry, exit, ONE, false).unwrap(), -(ONE as i128));
        assert_eq!(leg_pnl(exit, entry, ONE, true).unwrap(), -(ONE as i128));
        assert_eq!(leg_pnl(entry, entry, ONE, true).unwrap(), 0);
    }

    #[test]
    fn signed_mul_div_rounds_toward_zero() {
        assert_eq!(mul_div_signed(-10, 1, 3).unwrap(), -3);
        assert_eq!(mul_div_signed(10, -1, 3).unwrap(), -3);
        assert_eq!(mul_div_signed(-10, -1, 3).unwrap(), 3);
    }
}

//! Engine error taxonomy.
//!
//! Every error that can cross a module boundary carries a stable string
//! code so the API layer and subscribers see the same vocabulary the
//! repository stores. Classes:
//! - Validation / capacity / not-found: rejected synchronously, no state change
//! - Transient: retried internally with backoff, surfaced only when exhausted
//! - Invariant: fatal for the owning token; triggers quarantine

use alloy_primitives::Address;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    // --- Validation (reject, no state change) ---
    #[error("signature does not recover to the claimed trader")]
    BadSignature,
    #[error("nonce {got} is not the next nonce for trader (expected {expected})")]
    BadNonce { expected: u64, got: u64 },
    #[error("order deadline has passed")]
    Expired,
    #[error("unknown token {0}")]
    UnknownToken(Address),
    #[error("token {0} is not accepting orders")]
    TokenNotTrading(Address),
    #[error("invalid order parameters: {0}")]
    InvalidOrderParameters(String),
    #[error("mark price deviates too far from the book")]
    PriceDeviationExceeded,
    #[error("limit price is not a multiple of the tick size")]
    PriceNotOnTick,
    #[error("order size is below the token minimum")]
    SizeBelowMinimum,
    #[error("leverage outside the allowed range")]
    LeverageOutOfRange,
    #[error("no liquidity on the opposite side")]
    NoLiquidity,

    // --- Capacity (reject) ---
    #[error("insufficient available balance")]
    InsufficientBalance,
    #[error("position limit exceeded")]
    PositionLimitExceeded,

    // --- Not found (reject) ---
    #[error("order not found or already terminal")]
    OrderNotFound,
    #[error("pair {0} not found")]
    PairNotFound(u64),

    // --- Transient (retried internally) ---
    #[error("repository unavailable: {0}")]
    RepositoryUnavailable(String),
    #[error("chain gateway unavailable: {0}")]
    ChainGatewayUnavailable(String),

    // --- Invariant violations (fatal for the token) ---
    #[error("pair settlement does not sum to zero")]
    ZeroSumBroken,
    #[error("persisted nonce sequence has a gap for trader {0}")]
    NonceGap(Address),
    #[error("pair state inconsistent: {0}")]
    PairMismatched(String),
    #[error("fixed-point arithmetic overflow")]
    ArithmeticOverflow,
}

impl EngineError {
    /// Stable wire/storage code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::BadSignature => "BadSignature",
            EngineError::BadNonce { .. } => "BadNonce",
            EngineError::Expired => "Expired",
            EngineError::UnknownToken(_) => "UnknownToken",
            EngineError::TokenNotTrading(_) => "TokenNotTrading",
            EngineError::InvalidOrderParameters(_) => "InvalidOrderParameters",
            EngineError::PriceDeviationExceeded => "PriceDeviationExceeded",
            EngineError::PriceNotOnTick => "PriceNotOnTick",
            EngineError::SizeBelowMinimum => "SizeBelowMinimum",
            EngineError::LeverageOutOfRange => "LeverageOutOfRange",
            EngineError::NoLiquidity => "NoLiquidity",
            EngineError::InsufficientBalance => "InsufficientBalance",
            EngineError::PositionLimitExceeded => "PositionLimitExceeded",
            EngineError::OrderNotFound => "OrderNotFound",
            EngineError::PairNotFound(_) => "PairNotFound",
            EngineError::RepositoryUnavailable(_) => "RepositoryUnavailable",
            EngineError::ChainGatewayUnavailable(_) => "ChainGatewayUnavailable",
            EngineError::ZeroSumBroken => "ZeroSumBroken",
            EngineError::NonceGap(_) => "NonceGap",
            EngineError::PairMismatched(_) => "PairMismatched",
            EngineError::ArithmeticOverflow => "ArithmeticOverflow",
        }
    }

    /// Validation and capacity errors reject the submission without
    /// touching engine state.
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            EngineError::RepositoryUnavailable(_)
                | EngineError::ChainGatewayUnavailable(_)
                | EngineError::ZeroSumBroken
                | EngineError::NonceGap(_)
                | EngineError::PairMismatched(_)
                | EngineError::ArithmeticOverflow
        )
    }

    /// Transient errors are retried internally and never quarantine a token.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::RepositoryUnavailable(_) | EngineError::ChainGatewayUnavailable(_)
        )
    }

    /// Invariant violations halt the owning token worker.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            EngineError::ZeroSumBroken
                | EngineError::NonceGap(_)
                | EngineError::PairMismatched(_)
                | EngineError::ArithmeticOverflow
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::BadSignature.code(), "BadSignature");
        assert_eq!(
            EngineError::BadNonce {
                expected: 2,
                got: 5
            }
            .code(),
            "BadNonce"
        );
        assert_eq!(EngineError::ZeroSumBroken.code(), "ZeroSumBroken");
    }

    #[test]
    fn classification_is_disjoint() {
        let all = [
            EngineError::BadSignature,
            EngineError::InsufficientBalance,
            EngineError::OrderNotFound,
            EngineError::RepositoryUnavailable("down".into()),
            EngineError::ZeroSumBroken,
            EngineError::ArithmeticOverflow,
        ];
        for e in all {
            let classes = [
                e.is_rejection(),
                e.is_transient(),
                e.is_invariant_violation(),
            ];
            assert_eq!(classes.iter().filter(|c| **c).count(), 1, "{e:?}");
        }
    }
}

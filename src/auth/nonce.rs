//! Per-trader nonce sequencing with tentative reservation.
//!
//! Accepted orders carry `nonce == last + 1`. A submission reserves its
//! nonce while it runs the matching pipeline; `commit` advances the
//! counter, `abandon` releases it untouched. A reservation also excludes
//! concurrent submissions from the same trader, which gives the per-trader
//! serial order the engine guarantees.

use alloy_primitives::Address;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Default, Clone)]
struct NonceState {
    last: u64,
    in_flight: Option<u64>,
}

#[derive(Debug, Default)]
pub struct NonceRegistry {
    traders: Mutex<HashMap<Address, NonceState>>,
}

impl NonceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a trader's counter from the repository at startup.
    pub fn hydrate(&self, trader: Address, last: u64) {
        let mut map = self.traders.lock();
        map.entry(trader).or_default().last = last;
    }

    /// Last committed nonce for a trader (0 if never seen).
    pub fn last(&self, trader: Address) -> u64 {
        self.traders
            .lock()
            .get(&trader)
            .map(|s| s.last)
            .unwrap_or(0)
    }

    /// Tentatively reserve `nonce` for an in-flight submission.
    pub fn reserve(&self, trader: Address, nonce: u64) -> EngineResult<()> {
        let mut map = self.traders.lock();
        let state = map.entry(trader).or_default();
        let expected = state.last + 1;
        if state.in_flight.is_some() {
            // Another submission from this trader is mid-pipeline; its
            // nonce is not yet committed, so this one cannot be next.
            return Err(EngineError::BadNonce {
                expected,
                got: nonce,
            });
        }
        if nonce != expected {
            return Err(EngineError::BadNonce {
                expected,
                got: nonce,
            });
        }
        state.in_flight = Some(nonce);
        Ok(())
    }

    /// Commit a reserved nonce: the submission was accepted into the book
    /// or produced at least one trade.
    pub fn commit(&self, trader: Address, nonce: u64) -> EngineResult<()> {
        let mut map = self.traders.lock();
        let state = map.entry(trader).or_default();
        if state.in_flight != Some(nonce) {
            return Err(EngineError::NonceGap(trader));
        }
        state.in_flight = None;
        state.last = nonce;
        Ok(())
    }

    /// Release a reservation without advancing; used when the submission
    /// ends in a pure rejection.
    pub fn abandon(&self, trader: Address, nonce: u64) {
        let mut map = self.traders.lock();
        if let Some(state) = map.get_mut(&trader) {
            if state.in_flight == Some(nonce) {
                state.in_flight = None;
            }
        }
    }

    /// Snapshot of committed counters, for persistence.
    pub fn snapshot(&self) -> Vec<(Address, u64)> {
        self.traders
            .lock()
            .iter()
            .map(|(a, s)| (*a, s.last))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trader() -> Address {
        Address::repeat_byte(0xaa)
    }

    #[test]
    fn contiguous_sequence_from_one() {
        let reg = NonceRegistry::new();
        for n in 1..=5u64 {
            reg.reserve(trader(), n).unwrap();
            reg.commit(trader(), n).unwrap();
        }
        assert_eq!(reg.last(trader()), 5);
    }

    #[test]
    fn stale_and_future_nonces_rejected() {
        let reg = NonceRegistry::new();
        reg.reserve(trader(), 1).unwrap();
        reg.commit(trader(), 1).unwrap();

        assert_eq!(
            reg.reserve(trader(), 1),
            Err(EngineError::BadNonce {
                expected: 2,
                got: 1
            })
        );
        // Too-high arrivals are rejected, not buffered.
        assert_eq!(
            reg.reserve(trader(), 7),
            Err(EngineError::BadNonce {
                expected: 2,
                got: 7
            })
        );
    }

    #[test]
    fn abandoned_reservation_does_not_consume() {
        let reg = NonceRegistry::new();
        reg.reserve(trader(), 1).unwrap();
        reg.abandon(trader(), 1);
        assert_eq!(reg.last(trader()), 0);
        // Same nonce is usable again.
        reg.reserve(trader(), 1).unwrap();
        reg.commit(trader(), 1).unwrap();
    }

    #[test]
    fn in_flight_reservation_blocks_concurrent_submission() {
        let reg = NonceRegistry::new();
        reg.reserve(trader(), 1).unwrap();
        assert!(matches!(
            reg.reserve(trader(), 1),
            Err(EngineError::BadNonce { .. })
        ));
        assert!(matches!(
            reg.reserve(trader(), 2),
            Err(EngineError::BadNonce { .. })
        ));
        reg.commit(trader(), 1).unwrap();
        reg.reserve(trader(), 2).unwrap();
    }

    #[test]
    fn hydrate_restores_counter() {
        let reg = NonceRegistry::new();
        reg.hydrate(trader(), 41);
        assert!(matches!(
            reg.reserve(trader(), 41),
            Err(EngineError::BadNonce { .. })
        ));
        reg.reserve(trader(), 42).unwrap();
        reg.commit(trader(), 42).unwrap();
        assert_eq!(reg.last(trader()), 42);
    }

    #[test]
    fn commit_of_unreserved_nonce_is_a_gap() {
        let reg = NonceRegistry::new();
        assert_eq!(
            reg.commit(trader(), 3),
            Err(EngineError::NonceGap(trader()))
        );
    }
}

//! Cached spendable budgets with live reservation counters.

use std::sync::Arc;

use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A cached answer to "how much of a token can this owner move via this
/// path", plus a live reservation counter.
///
/// The first chain query freezes `initial_amount` for invariant checks;
/// `amount` is then maintained by the engine as settled rings consume
/// budget. Reservations live only for the duration of one ring's fill
/// computation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Spendable {
    pub initialized: bool,
    pub amount: BigInt,
    pub reserved: BigInt,
    pub initial_amount: BigInt,
}

impl Spendable {
    /// Live budget: `amount - reserved`, floored at zero.
    pub fn available(&self) -> BigInt {
        let available = &self.amount - &self.reserved;
        if available.is_negative() {
            BigInt::zero()
        } else {
            available
        }
    }

    pub fn reserve(&mut self, delta: &BigInt) {
        self.reserved += delta;
    }

    pub fn release_reservation(&mut self) {
        self.reserved = BigInt::zero();
    }
}

/// Shared handle to a spendable record.
///
/// Broker spendables are deliberately aliased across orders that reuse the
/// same `(broker, owner, token)` triple so that their reservations
/// interact; per-order token spendables use a handle of their own.
pub type SharedSpendable = Arc<RwLock<Spendable>>;

/// Fresh, uninitialized spendable handle.
pub fn shared_spendable() -> SharedSpendable {
    Arc::new(RwLock::new(Spendable::default()))
}

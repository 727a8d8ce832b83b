//! Cross-ring all-or-none resolution.
//!
//! After every ring has computed its fills and committed them, an
//! all-or-none order is only acceptable if it ended up completely filled
//! across the whole batch. Invalidating one such order invalidates the
//! rings containing it, which reverts their fills, which may leave another
//! all-or-none order unfilled — so the process iterates to a fixed point.
//!
//! Each pass either invalidates at least one more order or stops, so the
//! loop terminates in at most `|orders|` iterations.

use tracing::warn;

use ringmatch_types::SharedOrder;

use crate::ring::Ring;
use crate::validator::OrderValidator;

/// Run the all-or-none fixed point. Returns the number of passes taken.
pub fn resolve_all_or_none(
    validator: &OrderValidator<'_>,
    orders: &[SharedOrder],
    rings: &mut [Ring],
) -> usize {
    let mut iterations = 0;
    loop {
        iterations += 1;

        let mut changed = false;
        for shared in orders {
            let mut order = shared.write();
            if !order.valid {
                continue;
            }
            let was_valid = order.valid;
            validator.validate_all_or_none(&mut order);
            if was_valid && !order.valid {
                warn!(order = ?order.hash, "all-or-none order not fully filled; invalidated");
                changed = true;
            }
        }
        if !changed {
            return iterations;
        }

        for ring in rings.iter_mut() {
            let was_valid = ring.valid;
            ring.check_orders_valid();
            if was_valid && !ring.valid {
                ring.revert_order_stats();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use num_bigint::BigInt;
    use parking_lot::RwLock;
    use primitive_types::H160;
    use ringmatch_chain::{Keccak256Hasher, StaticSignatureVerifier};
    use ringmatch_types::{Order, OrderParams};

    use crate::EngineConfig;

    fn addr(n: u64) -> H160 {
        H160::from_low_u64_be(n)
    }

    fn aon_order(filled: i64, total: i64) -> SharedOrder {
        let mut order = Order::from_params(OrderParams {
            owner: addr(1),
            token_s: addr(10),
            token_b: addr(11),
            fee_token: addr(12),
            amount_s: BigInt::from(total),
            amount_b: BigInt::from(total),
            all_or_none: true,
            ..OrderParams::default()
        });
        order.filled_amount_s = BigInt::from(filled);
        Arc::new(RwLock::new(order))
    }

    #[test]
    fn fully_filled_aon_order_survives() {
        let config = EngineConfig::default();
        let hasher = Keccak256Hasher;
        let verifier = StaticSignatureVerifier::new();
        let validator = OrderValidator {
            config: &config,
            hasher: &hasher,
            verifier: &verifier,
        };

        let orders = vec![aon_order(1_000, 1_000)];
        let iterations = resolve_all_or_none(&validator, &orders, &mut []);
        assert_eq!(iterations, 1);
        assert!(orders[0].read().valid);
    }

    #[test]
    fn partially_filled_aon_order_is_invalidated() {
        let config = EngineConfig::default();
        let hasher = Keccak256Hasher;
        let verifier = StaticSignatureVerifier::new();
        let validator = OrderValidator {
            config: &config,
            hasher: &hasher,
            verifier: &verifier,
        };

        let orders = vec![aon_order(400, 1_000)];
        let iterations = resolve_all_or_none(&validator, &orders, &mut []);
        assert_eq!(iterations, 2);
        assert!(!orders[0].read().valid);
    }
}

//! Order domain types.

use std::sync::Arc;

use num_bigint::BigInt;
use num_traits::Zero;
use parking_lot::RwLock;
use primitive_types::{H160, H256};
use serde::{Deserialize, Serialize};

use crate::spendable::{shared_spendable, SharedSpendable};
use crate::token::TokenType;

/// The immutable, signed order fields as submitted by the order owner.
///
/// Produced by the ingress deserializer, which is out of scope here; the
/// engine never mutates these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderParams {
    // ========================================================================
    // Parties
    // ========================================================================
    pub owner: H160,
    /// Receives the bought tokens; usually the owner.
    pub token_recipient: H160,
    pub broker: Option<H160>,
    pub wallet_addr: Option<H160>,
    pub dual_auth_addr: Option<H160>,

    // ========================================================================
    // Tokens and amounts
    // ========================================================================
    pub token_s: H160,
    pub token_b: H160,
    pub fee_token: H160,
    pub amount_s: BigInt,
    pub amount_b: BigInt,
    pub fee_amount: BigInt,

    pub tranche_s: H160,
    pub tranche_b: H160,
    pub tranche_fee: H160,
    pub token_type_s: TokenType,
    pub token_type_b: TokenType,
    pub token_type_fee: TokenType,
    /// Opaque payload forwarded to ERC1400 `canSend` probes and transfers
    /// of the sold token.
    pub transfer_data_s: Vec<u8>,

    // ========================================================================
    // Validity and fill policy
    // ========================================================================
    /// Unix seconds; the order is not valid before this time.
    pub valid_since: u64,
    /// Unix seconds; zero means no expiry.
    pub valid_until: u64,
    /// Must be 100%-filled or 0%-filled across the whole batch.
    pub all_or_none: bool,

    // ========================================================================
    // Fee model (percentages in tenths of a percent unless noted)
    // ========================================================================
    pub fee_percentage: u32,
    pub token_s_fee_percentage: u32,
    pub token_b_fee_percentage: u32,
    /// Whole percent of the fee routed to the wallet.
    pub wallet_split_percentage: u32,
    /// Signed: positive waives part of the miner fee this order pays;
    /// negative makes the order a recipient of other orders' miner fees.
    pub waive_fee_percentage: i32,

    // ========================================================================
    // Signatures
    // ========================================================================
    pub sig: Option<Vec<u8>>,
    pub dual_auth_sig: Option<Vec<u8>>,
}

impl Default for OrderParams {
    fn default() -> Self {
        Self {
            owner: H160::zero(),
            token_recipient: H160::zero(),
            broker: None,
            wallet_addr: None,
            dual_auth_addr: None,
            token_s: H160::zero(),
            token_b: H160::zero(),
            fee_token: H160::zero(),
            amount_s: BigInt::zero(),
            amount_b: BigInt::zero(),
            fee_amount: BigInt::zero(),
            tranche_s: H160::zero(),
            tranche_b: H160::zero(),
            tranche_fee: H160::zero(),
            token_type_s: TokenType::Erc20,
            token_type_b: TokenType::Erc20,
            token_type_fee: TokenType::Erc20,
            transfer_data_s: Vec::new(),
            valid_since: 0,
            valid_until: 0,
            all_or_none: false,
            fee_percentage: 0,
            token_s_fee_percentage: 0,
            token_b_fee_percentage: 0,
            wallet_split_percentage: 0,
            waive_fee_percentage: 0,
            sig: None,
            dual_auth_sig: None,
        }
    }
}

/// An order plus the mutable settlement state the engine maintains for it.
#[derive(Debug, Clone)]
pub struct Order {
    pub params: OrderParams,

    /// P2P orders pay fees in the traded tokens instead of the fee token.
    pub p2p: bool,
    pub hash: H256,
    pub broker_interceptor: Option<H160>,
    pub valid: bool,

    pub filled_amount_s: BigInt,
    /// Pre-simulation fill, frozen for the report and for AON reverts.
    pub initial_filled_amount_s: BigInt,

    pub token_spendable_s: SharedSpendable,
    pub token_spendable_fee: SharedSpendable,
    pub broker_spendable_s: Option<SharedSpendable>,
    pub broker_spendable_fee: Option<SharedSpendable>,
}

impl Order {
    pub fn from_params(params: OrderParams) -> Self {
        Self {
            params,
            p2p: false,
            hash: H256::zero(),
            broker_interceptor: None,
            valid: true,
            filled_amount_s: BigInt::zero(),
            initial_filled_amount_s: BigInt::zero(),
            token_spendable_s: shared_spendable(),
            token_spendable_fee: shared_spendable(),
            broker_spendable_s: None,
            broker_spendable_fee: None,
        }
    }

    /// The address the trade delegate keys fills under: the broker when one
    /// is set, the owner otherwise.
    pub fn effective_broker(&self) -> H160 {
        self.params.broker.unwrap_or(self.params.owner)
    }

    /// Unfilled remainder of the sold amount, floored at zero.
    pub fn remaining_amount_s(&self) -> BigInt {
        let remaining = &self.params.amount_s - &self.filled_amount_s;
        if remaining < BigInt::zero() {
            BigInt::zero()
        } else {
            remaining
        }
    }
}

/// Orders are shared between the batch and every ring participation that
/// references them; fills accumulate across rings.
pub type SharedOrder = Arc<RwLock<Order>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_broker_falls_back_to_owner() {
        let owner = H160::from_low_u64_be(1);
        let broker = H160::from_low_u64_be(2);

        let mut order = Order::from_params(OrderParams {
            owner,
            ..OrderParams::default()
        });
        assert_eq!(order.effective_broker(), owner);

        order.params.broker = Some(broker);
        assert_eq!(order.effective_broker(), broker);
    }

    #[test]
    fn remaining_amount_never_negative() {
        let mut order = Order::from_params(OrderParams {
            amount_s: BigInt::from(100),
            ..OrderParams::default()
        });
        order.filled_amount_s = BigInt::from(150);
        assert_eq!(order.remaining_amount_s(), BigInt::zero());
    }
}

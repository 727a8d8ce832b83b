//! Egress types: transfers, settlement events, and the simulator report.

use std::collections::BTreeMap;

use num_bigint::BigInt;
use num_traits::Zero;
use primitive_types::{H160, H256};
use serde::Serialize;

use crate::balance_book::BalanceBook;
use crate::token::TokenType;

/// One token movement the settlement would perform on chain.
///
/// For ERC20 both tranches are the zero address. For ERC1400 the
/// destination tranche is whatever the token's `canSend` probe returned,
/// which may differ from the source tranche.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferItem {
    pub token: H160,
    pub from: H160,
    pub to: H160,
    pub amount: BigInt,
    pub token_type: TokenType,
    pub from_tranche: H160,
    pub to_tranche: H160,
    pub data: Option<Vec<u8>>,
}

/// Per-order fill record inside a [`RingMinedEvent`].
#[derive(Debug, Clone, Serialize)]
pub struct Fill {
    pub order_hash: H256,
    pub owner: H160,
    pub token_s: H160,
    pub amount_s: BigInt,
    pub split: BigInt,
    /// For non-P2P orders this includes the fee taken from the bought
    /// amount.
    pub fee_amount: BigInt,
}

/// A ring that settled.
#[derive(Debug, Clone, Serialize)]
pub struct RingMinedEvent {
    pub ring_index: u64,
    pub ring_hash: H256,
    pub fee_recipient: H160,
    pub fills: Vec<Fill>,
}

/// A ring that was invalidated before payment; no transfers were emitted
/// for it.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidRingEvent {
    pub ring_hash: H256,
}

/// The complete outcome of one simulation.
///
/// Books are sorted internally, so two identical simulations serialize
/// identically.
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorReport {
    /// Whether the modeled on-chain transaction would revert. A reverted
    /// report carries no events or transfers.
    pub reverted: bool,
    pub ring_mined_events: Vec<RingMinedEvent>,
    pub invalid_ring_events: Vec<InvalidRingEvent>,
    pub transfer_items: Vec<TransferItem>,
    pub fee_balances_before: BalanceBook,
    pub fee_balances_after: BalanceBook,
    pub filled_amounts_before: BTreeMap<H256, BigInt>,
    pub filled_amounts_after: BTreeMap<H256, BigInt>,
    pub balances_before: BalanceBook,
    pub balances_after: BalanceBook,
}

impl SimulatorReport {
    /// An empty report for a simulation whose transaction would revert.
    pub fn reverted() -> Self {
        Self {
            reverted: true,
            ring_mined_events: Vec::new(),
            invalid_ring_events: Vec::new(),
            transfer_items: Vec::new(),
            fee_balances_before: BalanceBook::new(),
            fee_balances_after: BalanceBook::new(),
            filled_amounts_before: BTreeMap::new(),
            filled_amounts_after: BTreeMap::new(),
            balances_before: BalanceBook::new(),
            balances_after: BalanceBook::new(),
        }
    }
}

/// Collapse transfers with identical `(token, from, to, token_type,
/// from_tranche, data)` tuples by summing their amounts.
///
/// The merge is associative and commutative in `amount`; output order is
/// first occurrence of each tuple, so a deterministic input yields a
/// deterministic output. The first transfer's destination tranche wins,
/// which is safe because `canSend` is a function of the key fields.
pub fn merge_transfers(items: &[TransferItem]) -> Vec<TransferItem> {
    type Key = (H160, H160, H160, TokenType, H160, Option<Vec<u8>>);

    let mut order: Vec<Key> = Vec::new();
    let mut merged: BTreeMap<Vec<u8>, TransferItem> = BTreeMap::new();

    fn key_bytes(key: &Key) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(128);
        bytes.extend_from_slice(key.0.as_bytes());
        bytes.extend_from_slice(key.1.as_bytes());
        bytes.extend_from_slice(key.2.as_bytes());
        bytes.push(match key.3 {
            TokenType::Erc20 => 0,
            TokenType::Erc1400 => 1,
        });
        bytes.extend_from_slice(key.4.as_bytes());
        if let Some(data) = &key.5 {
            bytes.push(1);
            bytes.extend_from_slice(data);
        } else {
            bytes.push(0);
        }
        bytes
    }

    for item in items {
        if item.amount.is_zero() {
            continue;
        }
        let key: Key = (
            item.token,
            item.from,
            item.to,
            item.token_type,
            item.from_tranche,
            item.data.clone(),
        );
        let bytes = key_bytes(&key);
        match merged.get_mut(&bytes) {
            Some(existing) => existing.amount += &item.amount,
            None => {
                order.push(key);
                merged.insert(bytes, item.clone());
            }
        }
    }

    order
        .iter()
        .map(|key| merged[&key_bytes(key)].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u64) -> H160 {
        H160::from_low_u64_be(n)
    }

    fn transfer(from: u64, to: u64, amount: i64) -> TransferItem {
        TransferItem {
            token: addr(100),
            from: addr(from),
            to: addr(to),
            amount: BigInt::from(amount),
            token_type: TokenType::Erc20,
            from_tranche: H160::zero(),
            to_tranche: H160::zero(),
            data: None,
        }
    }

    #[test]
    fn identical_tuples_collapse_by_summing() {
        let merged = merge_transfers(&[transfer(1, 2, 10), transfer(1, 2, 5), transfer(2, 1, 3)]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].amount, BigInt::from(15));
        assert_eq!(merged[1].amount, BigInt::from(3));
    }

    #[test]
    fn merging_is_order_insensitive_in_amounts() {
        let forward = merge_transfers(&[transfer(1, 2, 10), transfer(1, 2, 5)]);
        let backward = merge_transfers(&[transfer(1, 2, 5), transfer(1, 2, 10)]);
        assert_eq!(forward[0].amount, backward[0].amount);
    }

    #[test]
    fn zero_amounts_are_dropped() {
        let merged = merge_transfers(&[transfer(1, 2, 0)]);
        assert!(merged.is_empty());
    }

    #[test]
    fn differing_data_keeps_transfers_apart() {
        let mut with_data = transfer(1, 2, 10);
        with_data.data = Some(vec![0xAA]);
        let merged = merge_transfers(&[with_data, transfer(1, 2, 5)]);
        assert_eq!(merged.len(), 2);
    }
}

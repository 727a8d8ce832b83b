//! Sparse additive accumulator over `(owner, token, tranche)` triples.
//!
//! Backed by a `BTreeMap` keyed by the triple, so iteration order is
//! intrinsic to the key and reports built from a book are reproducible.
//! Insertion order is not observable.

use std::collections::{BTreeMap, BTreeSet};

use num_bigint::BigInt;
use num_traits::Zero;
use primitive_types::H160;
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};

/// One materialized `(owner, token, tranche) -> amount` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceEntry {
    pub owner: H160,
    pub token: H160,
    pub tranche: H160,
    pub amount: BigInt,
}

/// Sparse triple-keyed accumulator.
///
/// A triple that was ever written (including an explicit zero) is "known";
/// absent triples read as zero. Deltas may be negative and the book itself
/// never rejects — non-negativity is a settlement invariant checked by the
/// engine, not a property of the container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceBook {
    balances: BTreeMap<(H160, H160, H160), BigInt>,
}

impl BalanceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to the triple, creating a zero entry first on absence.
    pub fn add(&mut self, owner: H160, token: H160, tranche: H160, delta: &BigInt) {
        let slot = self
            .balances
            .entry((owner, token, tranche))
            .or_insert_with(BigInt::zero);
        *slot += delta;
    }

    /// Current amount for the triple; zero if it was never written.
    pub fn get(&self, owner: H160, token: H160, tranche: H160) -> BigInt {
        self.balances
            .get(&(owner, token, tranche))
            .cloned()
            .unwrap_or_else(BigInt::zero)
    }

    /// Whether the triple was ever written, including an explicit zero.
    pub fn is_known(&self, owner: H160, token: H160, tranche: H160) -> bool {
        self.balances.contains_key(&(owner, token, tranche))
    }

    /// Deep clone.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// All entries, sorted by `(owner, token, tranche)`.
    pub fn enumerate(&self) -> Vec<BalanceEntry> {
        self.balances
            .iter()
            .map(|((owner, token, tranche), amount)| BalanceEntry {
                owner: *owner,
                token: *token,
                tranche: *tranche,
                amount: amount.clone(),
            })
            .collect()
    }

    /// Distinct tokens present in the book, sorted.
    pub fn tokens(&self) -> BTreeSet<H160> {
        self.balances.keys().map(|(_, token, _)| *token).collect()
    }

    /// Merge every entry of `other` into this book.
    pub fn merge(&mut self, other: &BalanceBook) {
        for ((owner, token, tranche), amount) in &other.balances {
            self.add(*owner, *token, *tranche, amount);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }
}

impl Serialize for BalanceBook {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let entries = self.enumerate();
        let mut seq = serializer.serialize_seq(Some(entries.len()))?;
        for entry in &entries {
            seq.serialize_element(entry)?;
        }
        seq.end()
    }
}

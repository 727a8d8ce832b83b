//! In-memory chain snapshot for tests and miner pre-flight.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use num_bigint::BigInt;
use num_traits::Zero;
use primitive_types::{H160, H256};

use ringmatch_types::{cancelled_sentinel, Result, RingMatchError, TokenType};

use crate::{CanSendOutcome, ChainView, SignatureVerifier};

/// How an ERC1400 token answers `canSend` for one `(token, tranche)` pair.
#[derive(Debug, Clone, Copy)]
pub struct CanSendRule {
    pub status: u8,
    /// Destination tranche; `None` mirrors the source tranche.
    pub dest_tranche: Option<H160>,
}

impl Default for CanSendRule {
    fn default() -> Self {
        Self {
            status: 0xa1,
            dest_tranche: None,
        }
    }
}

/// An owned, immutable snapshot of chain state implementing [`ChainView`].
///
/// Assembled with builder-style `with_*` setters. Unset allowances are
/// unlimited so that simple scenarios only need balances; everything else
/// defaults to empty/zero.
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshot {
    /// `(token, tranche, owner) -> balance`.
    balances: BTreeMap<(H160, H160, H160), BigInt>,
    /// `(token, tranche, owner) -> delegate allowance`; absent = unlimited.
    allowances: BTreeMap<(H160, H160, H160), BigInt>,
    /// `(owner, broker, token) -> interceptor allowance`; absent = unlimited.
    broker_allowances: BTreeMap<(H160, H160, H160), BigInt>,
    filled: BTreeMap<H256, BigInt>,
    cancelled: BTreeSet<H256>,
    /// `(token, owner) -> fee holder balance`.
    fee_balances: BTreeMap<(H160, H160), BigInt>,
    burn_rates: BTreeMap<H160, u32>,
    /// `(broker, owner) -> (interceptor, registered)`.
    brokers: BTreeMap<(H160, H160), (Option<H160>, bool)>,
    /// `(token, tranche) -> rule`; absent = accept, same tranche.
    can_send_rules: BTreeMap<(H160, H160), CanSendRule>,
}

impl InMemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(
        mut self,
        token: H160,
        tranche: H160,
        owner: H160,
        amount: impl Into<BigInt>,
    ) -> Self {
        self.balances.insert((token, tranche, owner), amount.into());
        self
    }

    /// ERC20 convenience: balance in the zero tranche.
    pub fn with_erc20_balance(self, token: H160, owner: H160, amount: impl Into<BigInt>) -> Self {
        self.with_balance(token, H160::zero(), owner, amount)
    }

    pub fn with_allowance(
        mut self,
        token: H160,
        tranche: H160,
        owner: H160,
        amount: impl Into<BigInt>,
    ) -> Self {
        self.allowances
            .insert((token, tranche, owner), amount.into());
        self
    }

    pub fn with_broker_allowance(
        mut self,
        owner: H160,
        broker: H160,
        token: H160,
        amount: impl Into<BigInt>,
    ) -> Self {
        self.broker_allowances
            .insert((owner, broker, token), amount.into());
        self
    }

    pub fn with_filled(mut self, order_hash: H256, amount: impl Into<BigInt>) -> Self {
        self.filled.insert(order_hash, amount.into());
        self
    }

    pub fn with_cancelled(mut self, order_hash: H256) -> Self {
        self.cancelled.insert(order_hash);
        self
    }

    pub fn with_fee_balance(mut self, token: H160, owner: H160, amount: impl Into<BigInt>) -> Self {
        self.fee_balances.insert((token, owner), amount.into());
        self
    }

    pub fn with_burn_rate(mut self, token: H160, rate: u32) -> Self {
        self.burn_rates.insert(token, rate);
        self
    }

    pub fn with_broker(
        mut self,
        broker: H160,
        owner: H160,
        interceptor: Option<H160>,
        registered: bool,
    ) -> Self {
        self.brokers.insert((broker, owner), (interceptor, registered));
        self
    }

    pub fn with_can_send_rule(mut self, token: H160, tranche: H160, rule: CanSendRule) -> Self {
        self.can_send_rules.insert((token, tranche), rule);
        self
    }
}

#[async_trait]
impl ChainView for InMemorySnapshot {
    async fn batch_get_filled_and_check_cancelled(&self, words: Vec<H256>) -> Result<Vec<BigInt>> {
        if words.len() % 5 != 0 {
            return Err(RingMatchError::ChainRead {
                reason: format!("packed query length {} is not a multiple of 5", words.len()),
            });
        }

        let mut results = Vec::with_capacity(words.len() / 5);
        for record in words.chunks(5) {
            let order_hash = record[2];
            if self.cancelled.contains(&order_hash) {
                results.push(cancelled_sentinel());
            } else {
                results.push(
                    self.filled
                        .get(&order_hash)
                        .cloned()
                        .unwrap_or_else(BigInt::zero),
                );
            }
        }
        Ok(results)
    }

    async fn filled(&self, order_hash: H256) -> Result<BigInt> {
        Ok(self
            .filled
            .get(&order_hash)
            .cloned()
            .unwrap_or_else(BigInt::zero))
    }

    async fn fee_balances(&self, token: H160, owner: H160) -> Result<BigInt> {
        Ok(self
            .fee_balances
            .get(&(token, owner))
            .cloned()
            .unwrap_or_else(BigInt::zero))
    }

    async fn burn_rate(&self, token: H160) -> Result<u32> {
        Ok(self.burn_rates.get(&token).copied().unwrap_or(0))
    }

    async fn broker_registry(&self, broker: H160, owner: H160) -> Result<(Option<H160>, bool)> {
        Ok(self
            .brokers
            .get(&(broker, owner))
            .cloned()
            .unwrap_or((None, false)))
    }

    async fn balance_of(
        &self,
        _token_type: TokenType,
        token: H160,
        tranche: H160,
        owner: H160,
    ) -> Result<BigInt> {
        Ok(self
            .balances
            .get(&(token, tranche, owner))
            .cloned()
            .unwrap_or_else(BigInt::zero))
    }

    async fn allowance_of(
        &self,
        _token_type: TokenType,
        token: H160,
        tranche: H160,
        owner: H160,
    ) -> Result<BigInt> {
        Ok(self
            .allowances
            .get(&(token, tranche, owner))
            .cloned()
            .unwrap_or_else(cancelled_sentinel))
    }

    async fn broker_allowance(
        &self,
        _interceptor: H160,
        owner: H160,
        broker: H160,
        token: H160,
    ) -> Result<BigInt> {
        Ok(self
            .broker_allowances
            .get(&(owner, broker, token))
            .cloned()
            .unwrap_or_else(cancelled_sentinel))
    }

    async fn can_send(
        &self,
        token: H160,
        _from: H160,
        _to: H160,
        from_tranche: H160,
        _amount: &BigInt,
        _data: &[u8],
    ) -> Result<CanSendOutcome> {
        let rule = self
            .can_send_rules
            .get(&(token, from_tranche))
            .copied()
            .unwrap_or_default();
        Ok(CanSendOutcome {
            status: rule.status,
            dest_tranche: rule.dest_tranche.unwrap_or(from_tranche),
        })
    }
}

/// Accept-all signature verifier with an explicit reject list, for tests
/// and pre-flight runs where real signatures are unavailable.
#[derive(Debug, Clone, Default)]
pub struct StaticSignatureVerifier {
    rejected: BTreeSet<H160>,
}

impl StaticSignatureVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rejected_signer(mut self, signer: H160) -> Self {
        self.rejected.insert(signer);
        self
    }
}

impl SignatureVerifier for StaticSignatureVerifier {
    fn verify(&self, signer: H160, _hash: H256, _sig: &[u8]) -> bool {
        !self.rejected.contains(&signer)
    }
}

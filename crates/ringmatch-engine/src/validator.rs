//! Per-order validation, hashing, and spendable management.

use num_bigint::BigInt;
use num_traits::Zero;
use primitive_types::{H160, H256};
use tracing::warn;

use ringmatch_chain::{ChainView, Hasher, SignatureVerifier};
use ringmatch_types::{
    to_word, zero_address, Order, Result, SharedOrder, SharedSpendable, TokenType,
};

use crate::EngineConfig;

/// Stateless helper over an [`Order`] and the chain view.
///
/// Validation failures never error: they flip `order.valid` and the ring
/// machinery picks that up on the next `check_orders_valid`.
pub struct OrderValidator<'a> {
    pub config: &'a EngineConfig,
    pub hasher: &'a dyn Hasher,
    pub verifier: &'a dyn SignatureVerifier,
}

impl<'a> OrderValidator<'a> {
    /// Structural validity against the configured block timestamp.
    pub fn validate_info(&self, order: &mut Order) {
        let now = self.config.block_timestamp;
        let p = &order.params;

        let valid = !p.amount_s.is_zero()
            && !p.amount_b.is_zero()
            && p.owner != zero_address()
            && p.fee_token != zero_address()
            && p.valid_since <= now
            && (p.valid_until == 0 || p.valid_until > now);

        if order.valid && !valid {
            warn!(owner = ?p.owner, "order failed info validation");
        }
        order.valid = order.valid && valid;
    }

    /// P2P orders pay fees in the traded tokens instead of the fee token.
    pub fn check_p2p(&self, order: &mut Order) {
        order.p2p =
            order.params.token_s_fee_percentage > 0 || order.params.token_b_fee_percentage > 0;
    }

    /// Deterministic hash over the canonical order fields.
    pub fn compute_hash(&self, order: &Order) -> H256 {
        let p = &order.params;
        let mut buf = Vec::with_capacity(384);

        buf.extend_from_slice(p.owner.as_bytes());
        buf.extend_from_slice(p.token_recipient.as_bytes());
        buf.extend_from_slice(p.broker.unwrap_or_else(zero_address).as_bytes());
        buf.extend_from_slice(p.wallet_addr.unwrap_or_else(zero_address).as_bytes());
        buf.extend_from_slice(p.dual_auth_addr.unwrap_or_else(zero_address).as_bytes());
        buf.extend_from_slice(p.token_s.as_bytes());
        buf.extend_from_slice(p.token_b.as_bytes());
        buf.extend_from_slice(p.fee_token.as_bytes());
        buf.extend_from_slice(&to_word(&p.amount_s));
        buf.extend_from_slice(&to_word(&p.amount_b));
        buf.extend_from_slice(&to_word(&p.fee_amount));
        buf.extend_from_slice(p.tranche_s.as_bytes());
        buf.extend_from_slice(p.tranche_b.as_bytes());
        buf.extend_from_slice(p.tranche_fee.as_bytes());
        buf.push(token_type_code(p.token_type_s));
        buf.push(token_type_code(p.token_type_b));
        buf.push(token_type_code(p.token_type_fee));
        buf.extend_from_slice(&p.valid_since.to_be_bytes());
        buf.extend_from_slice(&p.valid_until.to_be_bytes());
        buf.push(p.all_or_none as u8);
        buf.extend_from_slice(&(p.fee_percentage as u16).to_be_bytes());
        buf.extend_from_slice(&(p.token_s_fee_percentage as u16).to_be_bytes());
        buf.extend_from_slice(&(p.token_b_fee_percentage as u16).to_be_bytes());
        buf.extend_from_slice(&(p.wallet_split_percentage as u16).to_be_bytes());
        buf.extend_from_slice(&(p.waive_fee_percentage as i16).to_be_bytes());
        buf.extend_from_slice(self.hasher.hash(&p.transfer_data_s).as_bytes());

        self.hasher.hash(&buf)
    }

    /// Broker registry lookup. Unregistered brokers invalidate the order;
    /// registered ones may install an interceptor that further constrains
    /// spendables.
    pub async fn resolve_broker(&self, order: &SharedOrder, chain: &dyn ChainView) -> Result<()> {
        let (broker, owner) = {
            let o = order.read();
            (o.params.broker, o.params.owner)
        };
        let Some(broker) = broker else {
            return Ok(());
        };

        let (interceptor, registered) = chain.broker_registry(broker, owner).await?;
        let mut o = order.write();
        if registered {
            o.broker_interceptor = interceptor;
        } else {
            warn!(?broker, ?owner, "broker not registered; order invalidated");
            o.valid = false;
        }
        Ok(())
    }

    /// Verify the order signature: the broker signs when one is set, the
    /// owner otherwise. Unsigned orders are registry-approved and carry
    /// nothing to check.
    pub fn check_order_signature(&self, order: &mut Order) {
        let Some(sig) = order.params.sig.clone() else {
            return;
        };
        let signer = order.params.broker.unwrap_or(order.params.owner);
        if !self.verifier.verify(signer, order.hash, &sig) {
            warn!(?signer, "order signature rejected");
            order.valid = false;
        }
    }

    /// The dual-auth address signs the mining hash, binding the order to
    /// this specific batch.
    pub fn check_dual_auth_signature(&self, order: &mut Order, mining_hash: H256) {
        let Some(dual_auth) = order.params.dual_auth_addr else {
            return;
        };
        let verified = match &order.params.dual_auth_sig {
            Some(sig) => self.verifier.verify(dual_auth, mining_hash, sig),
            None => false,
        };
        if !verified {
            warn!(?dual_auth, "dual-auth signature rejected");
            order.valid = false;
        }
    }

    /// Live spendable for the sold token: balance ∧ allowance, further
    /// min-ed with the broker path when an interceptor is present.
    pub async fn get_spendable_s(
        &self,
        order: &SharedOrder,
        chain: &dyn ChainView,
    ) -> Result<BigInt> {
        let (token_type, token, tranche, owner, broker, interceptor, token_sp, broker_sp) = {
            let o = order.read();
            (
                o.params.token_type_s,
                o.params.token_s,
                o.params.tranche_s,
                o.params.owner,
                o.params.broker,
                o.broker_interceptor,
                o.token_spendable_s.clone(),
                o.broker_spendable_s.clone(),
            )
        };
        self.get_spendable(
            chain, token_type, token, tranche, owner, broker, interceptor, &token_sp, &broker_sp,
        )
        .await
    }

    /// Live spendable for the fee token.
    pub async fn get_spendable_fee(
        &self,
        order: &SharedOrder,
        chain: &dyn ChainView,
    ) -> Result<BigInt> {
        let (token_type, token, tranche, owner, broker, interceptor, token_sp, broker_sp) = {
            let o = order.read();
            (
                o.params.token_type_fee,
                o.params.fee_token,
                o.params.tranche_fee,
                o.params.owner,
                o.params.broker,
                o.broker_interceptor,
                o.token_spendable_fee.clone(),
                o.broker_spendable_fee.clone(),
            )
        };
        self.get_spendable(
            chain, token_type, token, tranche, owner, broker, interceptor, &token_sp, &broker_sp,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn get_spendable(
        &self,
        chain: &dyn ChainView,
        token_type: TokenType,
        token: H160,
        tranche: H160,
        owner: H160,
        broker: Option<H160>,
        interceptor: Option<H160>,
        token_spendable: &SharedSpendable,
        broker_spendable: &Option<SharedSpendable>,
    ) -> Result<BigInt> {
        let mut available = self
            .get_token_spendable(chain, token_type, token, tranche, owner, token_spendable)
            .await?;

        if let (Some(broker), Some(interceptor), Some(broker_spendable)) =
            (broker, interceptor, broker_spendable)
        {
            let broker_available = self
                .get_broker_spendable(chain, interceptor, owner, broker, token, broker_spendable)
                .await?;
            available = available.min(broker_available);
        }
        Ok(available)
    }

    /// First query initializes the record from the chain and freezes its
    /// `initial_amount`; later queries reuse the cache.
    pub async fn get_token_spendable(
        &self,
        chain: &dyn ChainView,
        token_type: TokenType,
        token: H160,
        tranche: H160,
        owner: H160,
        spendable: &SharedSpendable,
    ) -> Result<BigInt> {
        let initialized = spendable.read().initialized;
        if !initialized {
            let balance = chain.balance_of(token_type, token, tranche, owner).await?;
            let allowance = chain.allowance_of(token_type, token, tranche, owner).await?;
            let amount = balance.min(allowance);

            let mut s = spendable.write();
            if !s.initialized {
                s.initialized = true;
                s.amount = amount.clone();
                s.initial_amount = amount;
            }
        }
        Ok(spendable.read().available())
    }

    async fn get_broker_spendable(
        &self,
        chain: &dyn ChainView,
        interceptor: H160,
        owner: H160,
        broker: H160,
        token: H160,
        spendable: &SharedSpendable,
    ) -> Result<BigInt> {
        let initialized = spendable.read().initialized;
        if !initialized {
            let amount = chain.broker_allowance(interceptor, owner, broker, token).await?;
            let mut s = spendable.write();
            if !s.initialized {
                s.initialized = true;
                s.amount = amount.clone();
                s.initial_amount = amount;
            }
        }
        Ok(spendable.read().available())
    }

    /// Reserve sold-token budget for the duration of one ring's fill
    /// computation.
    pub fn reserve_amount_s(&self, order: &Order, amount: &BigInt) {
        order.token_spendable_s.write().reserve(amount);
        if let Some(broker_spendable) = &order.broker_spendable_s {
            broker_spendable.write().reserve(amount);
        }
    }

    /// Reserve fee-token budget for the duration of one ring's fill
    /// computation.
    pub fn reserve_amount_fee(&self, order: &Order, amount: &BigInt) {
        order.token_spendable_fee.write().reserve(amount);
        if let Some(broker_spendable) = &order.broker_spendable_fee {
            broker_spendable.write().reserve(amount);
        }
    }

    /// Reservations do not persist across rings.
    pub fn reset_reservations(&self, order: &Order) {
        order.token_spendable_s.write().release_reservation();
        order.token_spendable_fee.write().release_reservation();
        if let Some(broker_spendable) = &order.broker_spendable_s {
            broker_spendable.write().release_reservation();
        }
        if let Some(broker_spendable) = &order.broker_spendable_fee {
            broker_spendable.write().release_reservation();
        }
    }

    /// All-or-none orders must be completely filled after settlement
    /// planning.
    pub fn validate_all_or_none(&self, order: &mut Order) {
        if order.params.all_or_none && order.filled_amount_s < order.params.amount_s {
            order.valid = false;
        }
    }
}

fn token_type_code(token_type: TokenType) -> u8 {
    match token_type {
        TokenType::Erc20 => 0,
        TokenType::Erc1400 => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::RwLock;
    use ringmatch_chain::{InMemorySnapshot, Keccak256Hasher, StaticSignatureVerifier};
    use ringmatch_types::OrderParams;

    fn addr(n: u64) -> H160 {
        H160::from_low_u64_be(n)
    }

    fn base_params() -> OrderParams {
        OrderParams {
            owner: addr(1),
            token_recipient: addr(1),
            token_s: addr(10),
            token_b: addr(11),
            fee_token: addr(12),
            amount_s: BigInt::from(1000),
            amount_b: BigInt::from(1000),
            fee_amount: BigInt::from(10),
            ..OrderParams::default()
        }
    }

    fn validator_fixture() -> (Keccak256Hasher, StaticSignatureVerifier) {
        (Keccak256Hasher, StaticSignatureVerifier::new())
    }

    fn make_validator<'a>(
        config: &'a EngineConfig,
        hasher: &'a Keccak256Hasher,
        verifier: &'a StaticSignatureVerifier,
    ) -> OrderValidator<'a> {
        OrderValidator {
            config,
            hasher,
            verifier,
        }
    }

    #[test]
    fn validate_info_rejects_time_window_violations() {
        let config = EngineConfig {
            block_timestamp: 1_000,
            ..EngineConfig::default()
        };
        let (hasher, verifier) = validator_fixture();
        let validator = make_validator(&config, &hasher, &verifier);

        let mut order = Order::from_params(OrderParams {
            valid_since: 2_000,
            ..base_params()
        });
        validator.validate_info(&mut order);
        assert!(!order.valid);

        let mut order = Order::from_params(OrderParams {
            valid_until: 1_000,
            ..base_params()
        });
        validator.validate_info(&mut order);
        assert!(!order.valid);

        // valid_until == 0 means no expiry
        let mut order = Order::from_params(base_params());
        validator.validate_info(&mut order);
        assert!(order.valid);
    }

    #[test]
    fn validate_info_rejects_zero_amounts_and_missing_parties() {
        let config = EngineConfig::default();
        let (hasher, verifier) = validator_fixture();
        let validator = make_validator(&config, &hasher, &verifier);

        let mut order = Order::from_params(OrderParams {
            amount_s: BigInt::zero(),
            ..base_params()
        });
        validator.validate_info(&mut order);
        assert!(!order.valid);

        let mut order = Order::from_params(OrderParams {
            fee_token: zero_address(),
            ..base_params()
        });
        validator.validate_info(&mut order);
        assert!(!order.valid);

        let mut order = Order::from_params(OrderParams {
            owner: zero_address(),
            ..base_params()
        });
        validator.validate_info(&mut order);
        assert!(!order.valid);
    }

    #[test]
    fn p2p_flag_follows_traded_token_fee_percentages() {
        let config = EngineConfig::default();
        let (hasher, verifier) = validator_fixture();
        let validator = make_validator(&config, &hasher, &verifier);

        let mut order = Order::from_params(base_params());
        validator.check_p2p(&mut order);
        assert!(!order.p2p);

        order.params.token_b_fee_percentage = 5;
        validator.check_p2p(&mut order);
        assert!(order.p2p);
    }

    #[test]
    fn order_hash_is_sensitive_to_amounts() {
        let config = EngineConfig::default();
        let (hasher, verifier) = validator_fixture();
        let validator = make_validator(&config, &hasher, &verifier);

        let order_a = Order::from_params(base_params());
        let order_b = Order::from_params(OrderParams {
            amount_s: BigInt::from(1001),
            ..base_params()
        });

        assert_ne!(
            validator.compute_hash(&order_a),
            validator.compute_hash(&order_b)
        );
        assert_eq!(
            validator.compute_hash(&order_a),
            validator.compute_hash(&order_a)
        );
    }

    #[tokio::test]
    async fn spendable_is_cached_after_first_query() {
        let config = EngineConfig::default();
        let (hasher, verifier) = validator_fixture();
        let validator = make_validator(&config, &hasher, &verifier);

        let snapshot =
            InMemorySnapshot::new().with_erc20_balance(addr(10), addr(1), 700);
        let order: SharedOrder = Arc::new(RwLock::new(Order::from_params(base_params())));

        let first = validator.get_spendable_s(&order, &snapshot).await.unwrap();
        assert_eq!(first, BigInt::from(700));

        // A later query reads the cache, net of reservations, and records
        // the frozen initial amount.
        {
            let o = order.read();
            validator.reserve_amount_s(&o, &BigInt::from(200));
        }
        let second = validator.get_spendable_s(&order, &snapshot).await.unwrap();
        assert_eq!(second, BigInt::from(500));

        let spendable = order.read().token_spendable_s.clone();
        assert_eq!(spendable.read().initial_amount, BigInt::from(700));
    }

    #[tokio::test]
    async fn spendable_is_capped_by_allowance() {
        let config = EngineConfig::default();
        let (hasher, verifier) = validator_fixture();
        let validator = make_validator(&config, &hasher, &verifier);

        let snapshot = InMemorySnapshot::new()
            .with_erc20_balance(addr(10), addr(1), 700)
            .with_allowance(addr(10), zero_address(), addr(1), 300);
        let order: SharedOrder = Arc::new(RwLock::new(Order::from_params(base_params())));

        let spendable = validator.get_spendable_s(&order, &snapshot).await.unwrap();
        assert_eq!(spendable, BigInt::from(300));
    }

    #[tokio::test]
    async fn broker_path_constrains_spendable() {
        let config = EngineConfig::default();
        let (hasher, verifier) = validator_fixture();
        let validator = make_validator(&config, &hasher, &verifier);

        let broker = addr(5);
        let interceptor = addr(6);
        let snapshot = InMemorySnapshot::new()
            .with_erc20_balance(addr(10), addr(1), 700)
            .with_broker(broker, addr(1), Some(interceptor), true)
            .with_broker_allowance(addr(1), broker, addr(10), 250);

        let order: SharedOrder = Arc::new(RwLock::new(Order::from_params(OrderParams {
            broker: Some(broker),
            ..base_params()
        })));
        validator.resolve_broker(&order, &snapshot).await.unwrap();
        order.write().broker_spendable_s = Some(ringmatch_types::shared_spendable());

        let spendable = validator.get_spendable_s(&order, &snapshot).await.unwrap();
        assert_eq!(spendable, BigInt::from(250));
    }

    #[tokio::test]
    async fn unregistered_broker_invalidates_order() {
        let config = EngineConfig::default();
        let (hasher, verifier) = validator_fixture();
        let validator = make_validator(&config, &hasher, &verifier);

        let snapshot = InMemorySnapshot::new();
        let order: SharedOrder = Arc::new(RwLock::new(Order::from_params(OrderParams {
            broker: Some(addr(5)),
            ..base_params()
        })));

        validator.resolve_broker(&order, &snapshot).await.unwrap();
        assert!(!order.read().valid);
    }

    #[test]
    fn rejected_signature_invalidates_order() {
        let config = EngineConfig::default();
        let hasher = Keccak256Hasher;
        let verifier = StaticSignatureVerifier::new().with_rejected_signer(addr(1));
        let validator = make_validator(&config, &hasher, &verifier);

        let mut order = Order::from_params(OrderParams {
            sig: Some(vec![1, 2, 3]),
            ..base_params()
        });
        order.hash = validator.compute_hash(&order);
        validator.check_order_signature(&mut order);
        assert!(!order.valid);
    }

    #[test]
    fn dual_auth_requires_a_signature_over_the_mining_hash() {
        let config = EngineConfig::default();
        let (hasher, verifier) = validator_fixture();
        let validator = make_validator(&config, &hasher, &verifier);

        let mining_hash = H256::from_low_u64_be(99);

        let mut order = Order::from_params(OrderParams {
            dual_auth_addr: Some(addr(7)),
            dual_auth_sig: None,
            ..base_params()
        });
        validator.check_dual_auth_signature(&mut order, mining_hash);
        assert!(!order.valid);

        let mut order = Order::from_params(OrderParams {
            dual_auth_addr: Some(addr(7)),
            dual_auth_sig: Some(vec![9]),
            ..base_params()
        });
        validator.check_dual_auth_signature(&mut order, mining_hash);
        assert!(order.valid);
    }
}

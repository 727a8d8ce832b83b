//! The batch driver: validates orders, constructs rings, runs the
//! all-or-none fixed point, performs payments, and assembles the report.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use parking_lot::RwLock;
use primitive_types::{H160, H256};
use tracing::{info, warn};

use ringmatch_chain::{ChainView, Hasher, Keccak256Hasher, SignatureVerifier, StaticSignatureVerifier};
use ringmatch_types::{
    cancelled_sentinel, merge_transfers, shared_spendable, zero_address, BalanceBook,
    InvalidRingEvent, Mining, Order, Result, RingMatchError, RingMinedEvent, RingsInput,
    SharedOrder, SharedSpendable, SimulatorReport, TransferItem,
};

use crate::aon::resolve_all_or_none;
use crate::ring::Ring;
use crate::validator::OrderValidator;
use crate::EngineConfig;

/// The settlement engine.
///
/// Holds no mutable state besides a monotonically incrementing ring index
/// used to label RingMined events; each `simulate` call is otherwise a
/// pure function of its input and the chain snapshot.
pub struct SettlementEngine {
    config: EngineConfig,
    hasher: Arc<dyn Hasher>,
    verifier: Arc<dyn SignatureVerifier>,
    ring_index: AtomicU64,
}

impl SettlementEngine {
    /// Engine with the protocol's keccak hashing and an accept-all
    /// verifier, suitable for pre-flight runs without real signatures.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_components(
            config,
            Arc::new(Keccak256Hasher),
            Arc::new(StaticSignatureVerifier::new()),
        )
    }

    pub fn with_components(
        config: EngineConfig,
        hasher: Arc<dyn Hasher>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            config,
            hasher,
            verifier,
            ring_index: AtomicU64::new(0),
        }
    }

    /// Simulate one batch against a chain snapshot.
    ///
    /// Fatal conditions (miner signature, malformed input, payment-time
    /// transfer refusals, post-simulation invariant breaches) surface as
    /// errors; everything else degrades to order- or ring-invalidation
    /// recorded in the report.
    pub async fn simulate(
        &self,
        input: &RingsInput,
        chain: &dyn ChainView,
    ) -> Result<SimulatorReport> {
        let validator = OrderValidator {
            config: &self.config,
            hasher: self.hasher.as_ref(),
            verifier: self.verifier.as_ref(),
        };

        let orders: Vec<SharedOrder> = input
            .orders
            .iter()
            .cloned()
            .map(|params| Arc::new(RwLock::new(Order::from_params(params))))
            .collect();

        for shared in &orders {
            let mut order = shared.write();
            validator.check_p2p(&mut order);
            validator.validate_info(&mut order);
            order.hash = validator.compute_hash(&order);
            validator.check_order_signature(&mut order);
        }
        for shared in &orders {
            validator.resolve_broker(shared, chain).await?;
        }
        self.assign_broker_spendables(&orders);

        self.fetch_filled_and_cancelled(&orders, chain).await?;

        let mut rings = Vec::with_capacity(input.rings.len());
        for indices in &input.rings {
            for &index in indices {
                if index >= orders.len() {
                    return Err(RingMatchError::OrderIndexOutOfBounds {
                        index,
                        order_count: orders.len(),
                    });
                }
            }
            let members: Vec<SharedOrder> =
                indices.iter().map(|&index| orders[index].clone()).collect();
            rings.push(Ring::new(members, self.hasher.as_ref()));
        }

        let mut mining = Mining::from_input(input);
        mining.hash = self.mining_hash(&rings, &mining);
        self.check_miner_signature(&mining, input.transaction_origin)?;
        for shared in &orders {
            let mut order = shared.write();
            validator.check_dual_auth_signature(&mut order, mining.hash);
        }

        for ring in &mut rings {
            ring.check_orders_valid();
            ring.check_for_sub_rings();
            ring.calculate_fill_amount_and_fee(&validator, chain).await?;
            if ring.valid {
                ring.adjust_order_states();
            }
        }

        resolve_all_or_none(&validator, &orders, &mut rings);

        let mut raw_transfers: Vec<TransferItem> = Vec::new();
        let mut ring_mined_events = Vec::new();
        let mut invalid_ring_events = Vec::new();
        let mut fee_delta = BalanceBook::new();
        let mut expected_burn = BalanceBook::new();

        for ring in &mut rings {
            if ring.valid {
                let fills = ring.do_payments(&mining, &self.config, chain).await?;
                let ring_index = self.ring_index.fetch_add(1, Ordering::Relaxed);
                ring_mined_events.push(RingMinedEvent {
                    ring_index,
                    ring_hash: ring.hash,
                    fee_recipient: mining.fee_recipient,
                    fills,
                });
                raw_transfers.extend(ring.transfers.iter().cloned());
                fee_delta.merge(&ring.fee_balances);
                expected_burn.merge(&ring.burned);
            } else {
                invalid_ring_events.push(InvalidRingEvent { ring_hash: ring.hash });
            }
        }

        let transfer_items = merge_transfers(&raw_transfers);

        let balances_before = self
            .snapshot_balances(&transfer_items, &rings, &mining, chain)
            .await?;
        let mut balances_after = balances_before.copy();
        for item in &transfer_items {
            balances_after.add(item.from, item.token, item.from_tranche, &(-&item.amount));
            balances_after.add(item.to, item.token, item.to_tranche, &item.amount);
        }

        let mut fee_balances_before = BalanceBook::new();
        for entry in fee_delta.enumerate() {
            if !fee_balances_before.is_known(entry.owner, entry.token, entry.tranche) {
                let balance = chain.fee_balances(entry.token, entry.owner).await?;
                fee_balances_before.add(entry.owner, entry.token, entry.tranche, &balance);
            }
        }
        let mut fee_balances_after = fee_balances_before.copy();
        fee_balances_after.merge(&fee_delta);

        let mut filled_amounts_before = BTreeMap::new();
        let mut filled_amounts_after = BTreeMap::new();
        for shared in &orders {
            let order = shared.read();
            filled_amounts_before.insert(order.hash, order.initial_filled_amount_s.clone());
            filled_amounts_after.insert(order.hash, order.filled_amount_s.clone());
        }

        let report = SimulatorReport {
            reverted: false,
            ring_mined_events,
            invalid_ring_events,
            transfer_items,
            fee_balances_before,
            fee_balances_after,
            filled_amounts_before,
            filled_amounts_after,
            balances_before,
            balances_after,
        };

        self.validate_rings(&rings, &orders, &expected_burn, &report)?;

        info!(
            rings_settled = report.ring_mined_events.len(),
            rings_invalid = report.invalid_ring_events.len(),
            transfers = report.transfer_items.len(),
            "simulation complete"
        );
        Ok(report)
    }

    /// Pre-flight convenience: map revert-class failures to an empty
    /// report flagged `reverted` instead of an error.
    pub async fn simulate_or_revert(
        &self,
        input: &RingsInput,
        chain: &dyn ChainView,
    ) -> Result<SimulatorReport> {
        match self.simulate(input, chain).await {
            Ok(report) => Ok(report),
            Err(err) if err.is_revert() => {
                warn!(%err, "simulation would revert");
                Ok(SimulatorReport::reverted())
            }
            Err(err) => Err(err),
        }
    }

    /// One broker spendable per distinct `(broker, owner, token)` across
    /// the batch, shared by reference between orders using the triple.
    fn assign_broker_spendables(&self, orders: &[SharedOrder]) {
        let mut spendables: BTreeMap<(H160, H160, H160), SharedSpendable> = BTreeMap::new();
        for shared in orders {
            let mut order = shared.write();
            if order.broker_interceptor.is_none() {
                continue;
            }
            let Some(broker) = order.params.broker else {
                continue;
            };
            let owner = order.params.owner;
            let token_s = order.params.token_s;
            let fee_token = order.params.fee_token;

            order.broker_spendable_s = Some(
                spendables
                    .entry((broker, owner, token_s))
                    .or_insert_with(shared_spendable)
                    .clone(),
            );
            order.broker_spendable_fee = Some(
                spendables
                    .entry((broker, owner, fee_token))
                    .or_insert_with(shared_spendable)
                    .clone(),
            );
        }
    }

    /// Batched fill/cancellation lookup. Cancelled orders are invalidated;
    /// everything else gets its on-chain fill as the starting point.
    async fn fetch_filled_and_cancelled(
        &self,
        orders: &[SharedOrder],
        chain: &dyn ChainView,
    ) -> Result<()> {
        let mut words = Vec::with_capacity(orders.len() * 5);
        for shared in orders {
            let order = shared.read();
            let p = &order.params;
            words.push(address_word(order.effective_broker()));
            words.push(address_word(p.owner));
            words.push(order.hash);
            words.push(H256::from_low_u64_be(p.valid_since));

            // tokenS xor tokenB in the high 20 bytes, 12 pad bytes.
            let mut xor_word = [0u8; 32];
            for (byte, (a, b)) in xor_word
                .iter_mut()
                .zip(p.token_s.as_bytes().iter().zip(p.token_b.as_bytes()))
            {
                *byte = a ^ b;
            }
            words.push(H256::from_slice(&xor_word));
        }

        let fills = chain.batch_get_filled_and_check_cancelled(words).await?;
        if fills.len() != orders.len() {
            return Err(RingMatchError::ChainRead {
                reason: format!(
                    "batch query returned {} fills for {} orders",
                    fills.len(),
                    orders.len()
                ),
            });
        }

        let sentinel = cancelled_sentinel();
        for (shared, filled) in orders.iter().zip(&fills) {
            let mut order = shared.write();
            if *filled == sentinel {
                warn!(order = ?order.hash, "order cancelled on chain");
                order.valid = false;
            } else {
                order.filled_amount_s = filled.clone();
                order.initial_filled_amount_s = filled.clone();
            }
        }
        Ok(())
    }

    /// Hash over the ordered ring hashes plus miner and fee recipient.
    fn mining_hash(&self, rings: &[Ring], mining: &Mining) -> H256 {
        let mut buf = Vec::with_capacity(rings.len() * 32 + 40);
        for ring in rings {
            buf.extend_from_slice(ring.hash.as_bytes());
        }
        buf.extend_from_slice(mining.miner.as_bytes());
        buf.extend_from_slice(mining.fee_recipient.as_bytes());
        self.hasher.hash(&buf)
    }

    /// The miner signature is mandatory: either an explicit signature over
    /// the mining hash, or the miner being the transaction origin itself.
    fn check_miner_signature(&self, mining: &Mining, transaction_origin: H160) -> Result<()> {
        let authorized = match &mining.sig {
            Some(sig) => self.verifier.verify(mining.miner, mining.hash, sig),
            None => mining.miner == transaction_origin,
        };
        if !authorized {
            return Err(RingMatchError::InvalidMinerSignature {
                miner: format!("{:?}", mining.miner),
            });
        }
        Ok(())
    }

    /// Pre-simulation balances of every `(owner, token, tranche)` a
    /// transfer touches, plus the fee recipient's sold-token balances.
    async fn snapshot_balances(
        &self,
        transfer_items: &[TransferItem],
        rings: &[Ring],
        mining: &Mining,
        chain: &dyn ChainView,
    ) -> Result<BalanceBook> {
        let mut book = BalanceBook::new();
        for item in transfer_items {
            for (holder, tranche) in [(item.from, item.from_tranche), (item.to, item.to_tranche)] {
                if !book.is_known(holder, item.token, tranche) {
                    let balance = chain
                        .balance_of(item.token_type, item.token, tranche, holder)
                        .await?;
                    book.add(holder, item.token, tranche, &balance);
                }
            }
        }

        for ring in rings {
            if !ring.valid {
                continue;
            }
            for p in &ring.participations {
                let (token_s, token_type_s) = {
                    let o = p.order.read();
                    (o.params.token_s, o.params.token_type_s)
                };
                let tranche = zero_address();
                if !book.is_known(mining.fee_recipient, token_s, tranche) {
                    let balance = chain
                        .balance_of(token_type_s, token_s, tranche, mining.fee_recipient)
                        .await?;
                    book.add(mining.fee_recipient, token_s, tranche, &balance);
                }
            }
        }
        Ok(book)
    }

    /// Post-simulation invariants over the assembled report. A breach here
    /// means the simulator and the protocol disagree, which is fatal.
    fn validate_rings(
        &self,
        rings: &[Ring],
        orders: &[SharedOrder],
        expected_burn: &BalanceBook,
        report: &SimulatorReport,
    ) -> Result<()> {
        for ring in rings {
            if ring.valid {
                ring.validate_settlement(&self.config)?;
            }
        }

        // Applying every transfer leaves no balance negative.
        for entry in report.balances_after.enumerate() {
            if entry.amount.is_negative() {
                return Err(RingMatchError::SettlementInvariant {
                    reason: format!(
                        "balance of owner {:?} token {:?} would go negative: {}",
                        entry.owner, entry.token, entry.amount
                    ),
                });
            }
        }

        // Per owner and token, orders spend at least what the transfers
        // move; rebates account for the difference.
        let tranche = zero_address();
        let mut spent = BalanceBook::new();
        for ring in rings {
            if !ring.valid {
                continue;
            }
            for p in &ring.participations {
                let o = p.order.read();
                spent.add(
                    o.params.owner,
                    o.params.token_s,
                    tranche,
                    &(&p.fill_amount_s + &p.split_s),
                );
                spent.add(o.params.owner, o.params.fee_token, tranche, &p.fee_amount);
            }
        }
        let mut transferred = BalanceBook::new();
        for item in &report.transfer_items {
            transferred.add(item.from, item.token, tranche, &item.amount);
        }
        for entry in transferred.enumerate() {
            if spent.get(entry.owner, entry.token, tranche) < entry.amount {
                return Err(RingMatchError::SettlementInvariant {
                    reason: format!(
                        "owner {:?} transfers more of token {:?} than the fills spend",
                        entry.owner, entry.token
                    ),
                });
            }
        }

        // All-or-none orders end up fully filled or untouched.
        for shared in orders {
            let order = shared.read();
            if !order.params.all_or_none {
                continue;
            }
            let delta = &order.filled_amount_s - &order.initial_filled_amount_s;
            if !delta.is_zero() && order.filled_amount_s != order.params.amount_s {
                return Err(RingMatchError::SettlementInvariant {
                    reason: format!(
                        "all-or-none order {:?} partially filled: {}",
                        order.hash, order.filled_amount_s
                    ),
                });
            }
        }

        // Transfers into the fee holder mirror the fee balance deltas per
        // token.
        let mut credited: BTreeMap<H160, BigInt> = BTreeMap::new();
        for item in &report.transfer_items {
            if item.to == self.config.fee_holder {
                *credited.entry(item.token).or_insert_with(BigInt::zero) += &item.amount;
            }
        }
        let mut fee_tokens = report.fee_balances_after.tokens();
        fee_tokens.extend(report.fee_balances_before.tokens());
        fee_tokens.extend(credited.keys().copied());
        for token in fee_tokens {
            let mut delta = BigInt::zero();
            for entry in report.fee_balances_after.enumerate() {
                if entry.token == token {
                    delta += &entry.amount;
                }
            }
            for entry in report.fee_balances_before.enumerate() {
                if entry.token == token {
                    delta -= &entry.amount;
                }
            }
            let expected = credited.get(&token).cloned().unwrap_or_else(BigInt::zero);
            if delta != expected {
                return Err(RingMatchError::SettlementInvariant {
                    reason: format!(
                        "fee holder mirror broken for token {token:?}: credited {expected}, booked {delta}"
                    ),
                });
            }
        }

        // Accumulated burn matches the burn-address fee balances.
        let mut burn_tokens = expected_burn.tokens();
        burn_tokens.extend(report.fee_balances_after.tokens());
        for token in burn_tokens {
            let booked = report
                .fee_balances_after
                .get(self.config.burn_address, token, tranche)
                - report
                    .fee_balances_before
                    .get(self.config.burn_address, token, tranche);
            if expected_burn.get(self.config.burn_address, token, tranche) != booked {
                return Err(RingMatchError::SettlementInvariant {
                    reason: format!("burn accounting diverges for token {token:?}"),
                });
            }
        }

        Ok(())
    }
}

/// A 20-byte address right-aligned in a 32-byte word, EVM style.
fn address_word(address: H160) -> H256 {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    H256::from_slice(&word)
}

//! Ring settlement: the cyclic fill fixed point, fee/burn/rebate
//! distribution, transfer emission, and per-ring invariant checks.
//!
//! A ring is an ordered sequence of 2..=8 participations where
//! participation `i` sells to participation `i-1 (mod n)` and buys from
//! `i+1 (mod n)`. Settlement back-propagates fill amounts around the cycle
//! until every seller delivers exactly what its buyer can absorb; the
//! excess becomes miner margin.

use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use primitive_types::{H160, H256};
use tracing::{debug, info, warn};

use ringmatch_chain::{ChainView, Hasher};
use ringmatch_types::{
    mul_div, zero_address, BalanceBook, Fill, Mining, Result, RingMatchError, SharedOrder,
    TokenType, TransferItem, MAX_RING_SIZE, MIN_RING_SIZE, WALLET_SPLIT_BASE,
};

use crate::validator::OrderValidator;
use crate::EngineConfig;

/// One order's slot inside a ring. All amounts start at zero and are
/// filled in by `calculate_fill_amount_and_fee` and `do_payments`.
#[derive(Debug, Clone)]
pub struct Participation {
    pub order: SharedOrder,
    pub fill_amount_s: BigInt,
    pub fill_amount_b: BigInt,
    /// Margin: the excess of the sold amount over what the buyer must
    /// receive, awarded to the miner (non-P2P) or taker (P2P).
    pub split_s: BigInt,
    pub fee_amount: BigInt,
    pub fee_amount_s: BigInt,
    pub fee_amount_b: BigInt,
    pub rebate_fee: BigInt,
    pub rebate_s: BigInt,
    pub rebate_b: BigInt,
    pub ring_spendable_s: BigInt,
    pub ring_spendable_fee: BigInt,
    /// Whether a margin transfer was actually emitted; ERC1400 sold
    /// tokens never distribute margin.
    pub margin_transferred: bool,
}

impl Participation {
    fn new(order: SharedOrder) -> Self {
        Self {
            order,
            fill_amount_s: BigInt::zero(),
            fill_amount_b: BigInt::zero(),
            split_s: BigInt::zero(),
            fee_amount: BigInt::zero(),
            fee_amount_s: BigInt::zero(),
            fee_amount_b: BigInt::zero(),
            rebate_fee: BigInt::zero(),
            rebate_s: BigInt::zero(),
            rebate_b: BigInt::zero(),
            ring_spendable_s: BigInt::zero(),
            ring_spendable_fee: BigInt::zero(),
            margin_transferred: false,
        }
    }
}

/// A cyclic chain of orders and the settlement state computed for it.
#[derive(Debug, Clone)]
pub struct Ring {
    pub participations: Vec<Participation>,
    pub hash: H256,
    pub valid: bool,
    /// Sum of `-waive_fee_percentage` over participations with negative
    /// waive; the share of every miner fee redistributed to those orders.
    pub miner_fees_to_orders_percentage: u32,
    /// Fee credits this ring produces, keyed by recipient.
    pub fee_balances: BalanceBook,
    /// Burn credits, tracked separately so the engine can cross-check the
    /// burn entries of `fee_balances`.
    pub burned: BalanceBook,
    /// Transfers emitted by `do_payments`, before batch-level merging.
    pub transfers: Vec<TransferItem>,
}

impl Ring {
    pub fn new(orders: Vec<SharedOrder>, hasher: &dyn Hasher) -> Self {
        let mut buf = Vec::with_capacity(orders.len() * 34);
        for order in &orders {
            let o = order.read();
            buf.extend_from_slice(o.hash.as_bytes());
            buf.extend_from_slice(&(o.params.waive_fee_percentage as i16).to_be_bytes());
        }
        let hash = hasher.hash(&buf);

        Self {
            participations: orders.into_iter().map(Participation::new).collect(),
            hash,
            valid: true,
            miner_fees_to_orders_percentage: 0,
            fee_balances: BalanceBook::new(),
            burned: BalanceBook::new(),
            transfers: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.participations.len()
    }

    fn prev_index(&self, i: usize) -> usize {
        (i + self.size() - 1) % self.size()
    }

    /// Size bounds, per-order validity, and token continuity around the
    /// cycle: each seller's token must be what its buyer ordered.
    pub fn check_orders_valid(&mut self) {
        let n = self.size();
        let mut valid = self.valid && (MIN_RING_SIZE..=MAX_RING_SIZE).contains(&n);

        if valid {
            for i in 0..n {
                let prev = self.prev_index(i);
                let o = self.participations[i].order.read();
                if !o.valid {
                    valid = false;
                    break;
                }
                let po = self.participations[prev].order.read();
                if o.params.token_s != po.params.token_b
                    || o.params.token_type_s != po.params.token_type_b
                {
                    valid = false;
                    break;
                }
            }
        }

        if self.valid && !valid {
            warn!(ring = ?self.hash, "ring invalidated by order check");
        }
        self.valid = valid;
    }

    /// No two orders may sell the same token; such a ring contains a
    /// shorter settleable cycle.
    pub fn check_for_sub_rings(&mut self) {
        let n = self.size();
        for i in 0..n {
            let token_s = self.participations[i].order.read().params.token_s;
            for j in (i + 1)..n {
                if self.participations[j].order.read().params.token_s == token_s {
                    warn!(ring = ?self.hash, "sub-ring detected");
                    self.valid = false;
                    return;
                }
            }
        }
    }

    /// The central fill computation: per-order max fills, two resize
    /// sweeps to the ring's fixed point, reservation of sold amounts, and
    /// per-pair fee and feasibility checks.
    pub async fn calculate_fill_amount_and_fee(
        &mut self,
        validator: &OrderValidator<'_>,
        chain: &dyn ChainView,
    ) -> Result<()> {
        if !self.valid {
            return Ok(());
        }
        let n = self.size();

        for i in 0..n {
            self.set_max_fill_amounts(i, validator, chain).await?;
        }

        let base = validator.config.fee_percentage_base;
        let mut smallest = 0;
        for i in (0..n).rev() {
            smallest = self.resize(i, smallest, base);
        }
        for i in (smallest..n).rev() {
            self.resize(i, smallest, base);
        }

        // Reserve the sold amounts so a later query from the same owner in
        // this ring sees the reduced budget.
        for p in &self.participations {
            let order = p.order.read();
            validator.reserve_amount_s(&order, &p.fill_amount_s);
        }

        let mut valid = true;
        for i in 0..n {
            let prev = self.prev_index(i);
            if !self.calculate_fees(i, prev, validator, chain).await? {
                valid = false;
                break;
            }
            let waive = self.participations[i].order.read().params.waive_fee_percentage;
            if waive < 0 {
                self.miner_fees_to_orders_percentage += (-waive) as u32;
            }
        }
        if self.miner_fees_to_orders_percentage > base {
            valid = false;
        }

        if valid {
            valid = self.probe_security_token_legs(chain).await?;
        }

        if self.valid && !valid {
            warn!(ring = ?self.hash, "ring fill computation infeasible");
        }
        self.valid = self.valid && valid;

        for p in &self.participations {
            let order = p.order.read();
            validator.reset_reservations(&order);
        }
        Ok(())
    }

    /// Step 1: the largest fill this order supports on its own, limited by
    /// its unfilled remainder, its spendable, and fee affordability.
    async fn set_max_fill_amounts(
        &mut self,
        i: usize,
        validator: &OrderValidator<'_>,
        chain: &dyn ChainView,
    ) -> Result<()> {
        let order = self.participations[i].order.clone();
        let ring_spendable_s = validator.get_spendable_s(&order, chain).await?;

        let (p2p, amount_s, amount_b, fee_amount_total, fee_token, token_s, token_b, owner, recipient, remaining) = {
            let o = order.read();
            (
                o.p2p,
                o.params.amount_s.clone(),
                o.params.amount_b.clone(),
                o.params.fee_amount.clone(),
                o.params.fee_token,
                o.params.token_s,
                o.params.token_b,
                o.params.owner,
                o.params.token_recipient,
                o.remaining_amount_s(),
            )
        };

        let p = &mut self.participations[i];
        p.ring_spendable_s = ring_spendable_s;
        p.fill_amount_s = p.ring_spendable_s.clone().min(remaining);

        if !p2p {
            // No need to check the fee budget when the fee is paid from
            // the bought amount.
            let fee_from_bought =
                fee_token == token_b && owner == recipient && fee_amount_total <= amount_b;
            if !fee_from_bought {
                let fee_amount = mul_div(&fee_amount_total, &p.fill_amount_s, &amount_s);
                p.ring_spendable_fee = validator.get_spendable_fee(&order, chain).await?;

                if fee_token == token_s && &p.fill_amount_s + &fee_amount > p.ring_spendable_s {
                    // Sell amount and fee compete for the same budget:
                    // split it proportionally.
                    let total = &amount_s + &fee_amount_total;
                    p.fill_amount_s = mul_div(&p.ring_spendable_s, &amount_s, &total);
                } else if fee_amount > p.ring_spendable_fee {
                    let affordable = p.ring_spendable_fee.clone();
                    p.fill_amount_s = mul_div(&affordable, &amount_s, &fee_amount_total);
                }
            }
        }
        p.fill_amount_b = mul_div(&p.fill_amount_s, &amount_b, &amount_s);
        debug!(
            index = i,
            fill_s = %p.fill_amount_s,
            fill_b = %p.fill_amount_b,
            "initial max fill"
        );
        Ok(())
    }

    /// Step 2: shrink the predecessor whenever it wants more than this
    /// participation can deliver after its sell-side fee.
    fn resize(&mut self, i: usize, smallest: usize, base: u32) -> usize {
        let prev = self.prev_index(i);

        let post_fee_fill_amount_s = {
            let p = &self.participations[i];
            let pct = p.order.read().params.token_s_fee_percentage;
            if pct > 0 {
                mul_div(
                    &p.fill_amount_s,
                    &BigInt::from(base.saturating_sub(pct)),
                    &BigInt::from(base),
                )
            } else {
                p.fill_amount_s.clone()
            }
        };

        let prev_p = &mut self.participations[prev];
        if prev_p.fill_amount_b > post_fee_fill_amount_s {
            prev_p.fill_amount_b = post_fee_fill_amount_s;
            let o = prev_p.order.read();
            prev_p.fill_amount_s =
                mul_div(&prev_p.fill_amount_b, &o.params.amount_s, &o.params.amount_b);
            return i;
        }
        smallest
    }

    /// Step 4: per-pair fee computation and the margin feasibility check.
    /// Returns false when the ring cannot settle.
    async fn calculate_fees(
        &mut self,
        i: usize,
        prev: usize,
        validator: &OrderValidator<'_>,
        chain: &dyn ChainView,
    ) -> Result<bool> {
        let order = self.participations[i].order.clone();
        let (p2p, amount_s, fee_amount_total, fee_token, token_b, owner, recipient, s_pct, b_pct) = {
            let o = order.read();
            (
                o.p2p,
                o.params.amount_s.clone(),
                o.params.fee_amount.clone(),
                o.params.fee_token,
                o.params.token_b,
                o.params.owner,
                o.params.token_recipient,
                o.params.token_s_fee_percentage,
                o.params.token_b_fee_percentage,
            )
        };
        let base = BigInt::from(validator.config.fee_percentage_base);

        let fill_amount_s = self.participations[i].fill_amount_s.clone();
        let fill_amount_b = self.participations[i].fill_amount_b.clone();

        let mut fee_amount;
        let fee_amount_s;
        let mut fee_amount_b;
        if p2p {
            // P2P orders pay percentage fees in the traded tokens and
            // never touch the fee token.
            fee_amount = BigInt::zero();
            fee_amount_s = mul_div(&fill_amount_s, &BigInt::from(s_pct), &base);
            fee_amount_b = mul_div(&fill_amount_b, &BigInt::from(b_pct), &base);
        } else {
            fee_amount = mul_div(&fee_amount_total, &fill_amount_s, &amount_s);
            fee_amount_s = BigInt::zero();
            fee_amount_b = BigInt::zero();

            if fee_token == token_b && owner == recipient && fill_amount_b >= fee_amount {
                // The whole fee is taken from the bought amount.
                fee_amount_b = fee_amount;
                fee_amount = BigInt::zero();
            }

            if !fee_amount.is_zero() {
                let ring_spendable_fee = validator.get_spendable_fee(&order, chain).await?;
                self.participations[i].ring_spendable_fee = ring_spendable_fee.clone();
                if fee_amount > ring_spendable_fee {
                    return Ok(false);
                }
                let o = order.read();
                validator.reserve_amount_fee(&o, &fee_amount);
            }
        }

        let prev_fill_amount_b = self.participations[prev].fill_amount_b.clone();
        let post_fee = &fill_amount_s - &fee_amount_s;
        if post_fee < prev_fill_amount_b {
            return Ok(false);
        }

        let p = &mut self.participations[i];
        p.split_s = &post_fee - &prev_fill_amount_b;
        p.fill_amount_s = &prev_fill_amount_b + &fee_amount_s;
        p.fee_amount = fee_amount;
        p.fee_amount_s = fee_amount_s;
        p.fee_amount_b = fee_amount_b;
        Ok(true)
    }

    /// ERC1400 sold-token legs must clear a `canSend` probe, and the
    /// destination tranche the token picks must be the one the buyer
    /// ordered.
    async fn probe_security_token_legs(&self, chain: &dyn ChainView) -> Result<bool> {
        let n = self.size();
        for i in 0..n {
            let prev = self.prev_index(i);
            let p = &self.participations[i];
            let (token_type_s, token_s, tranche_s, owner, data) = {
                let o = p.order.read();
                (
                    o.params.token_type_s,
                    o.params.token_s,
                    o.params.tranche_s,
                    o.params.owner,
                    o.params.transfer_data_s.clone(),
                )
            };
            if token_type_s != TokenType::Erc1400 {
                continue;
            }
            let (recipient, tranche_b) = {
                let po = self.participations[prev].order.read();
                (po.params.token_recipient, po.params.tranche_b)
            };
            let outcome = chain
                .can_send(token_s, owner, recipient, tranche_s, &p.fill_amount_s, &data)
                .await?;
            if !outcome.is_success() || outcome.dest_tranche != tranche_b {
                warn!(ring = ?self.hash, token = ?token_s, status = outcome.status,
                      "security token refused leg or redirected to an unexpected tranche");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Commit this ring's fills to the shared order state.
    pub fn adjust_order_states(&self) {
        for p in &self.participations {
            let total = &p.fill_amount_s + &p.split_s;
            let mut o = p.order.write();
            o.filled_amount_s += &total;
            debug_assert!(o.filled_amount_s <= o.params.amount_s);

            o.token_spendable_s.write().amount -= &total;
            o.token_spendable_fee.write().amount -= &p.fee_amount;
            if let Some(spendable) = &o.broker_spendable_s {
                spendable.write().amount -= &total;
            }
            if let Some(spendable) = &o.broker_spendable_fee {
                spendable.write().amount -= &p.fee_amount;
            }
        }
    }

    /// Inverse of [`Ring::adjust_order_states`], used when the ring is
    /// invalidated during the all-or-none fixed point.
    pub fn revert_order_stats(&self) {
        for p in &self.participations {
            let total = &p.fill_amount_s + &p.split_s;
            let mut o = p.order.write();
            o.filled_amount_s -= &total;
            debug_assert!(!o.filled_amount_s.is_negative());

            o.token_spendable_s.write().amount += &total;
            o.token_spendable_fee.write().amount += &p.fee_amount;
            if let Some(spendable) = &o.broker_spendable_s {
                spendable.write().amount += &total;
            }
            if let Some(spendable) = &o.broker_spendable_fee {
                spendable.write().amount += &p.fee_amount;
            }
        }
    }

    /// Distribute fees and emit transfers. Returns the RingMined fill
    /// records; the transfers land in `self.transfers` and the fee credits
    /// in `self.fee_balances`.
    pub async fn do_payments(
        &mut self,
        mining: &Mining,
        config: &EngineConfig,
        chain: &dyn ChainView,
    ) -> Result<Vec<Fill>> {
        let n = self.size();

        // Rebates must be known before any transfer amount is final.
        for i in 0..n {
            let (fee_token, token_s, token_b) = {
                let o = self.participations[i].order.read();
                (o.params.fee_token, o.params.token_s, o.params.token_b)
            };
            let amount_fee = self.participations[i].fee_amount.clone();
            let amount_s = self.participations[i].fee_amount_s.clone();
            let amount_b = self.participations[i].fee_amount_b.clone();

            let rebate_fee = self
                .pay_fees_and_burn(i, fee_token, amount_fee, mining, config, chain)
                .await?;
            let rebate_s = self
                .pay_fees_and_burn(i, token_s, amount_s, mining, config, chain)
                .await?;
            let rebate_b = self
                .pay_fees_and_burn(i, token_b, amount_b, mining, config, chain)
                .await?;

            let p = &mut self.participations[i];
            p.rebate_fee = rebate_fee;
            p.rebate_s = rebate_s;
            p.rebate_b = rebate_b;
        }

        for i in 0..n {
            let prev = self.prev_index(i);
            self.emit_transfers(i, prev, mining, config, chain).await?;
        }

        let fills = self.generate_fills();
        info!(ring = ?self.hash, transfers = self.transfers.len(), "ring settled");
        Ok(fills)
    }

    /// Split one fee amount between wallet, miner, burn, and waive
    /// recipients; returns the part rebated to the order.
    async fn pay_fees_and_burn(
        &mut self,
        idx: usize,
        token: H160,
        amount: BigInt,
        mining: &Mining,
        config: &EngineConfig,
        chain: &dyn ChainView,
    ) -> Result<BigInt> {
        if amount.is_zero() {
            return Ok(BigInt::zero());
        }
        let (p2p, wallet_addr, wallet_split_percentage, waive) = {
            let o = self.participations[idx].order.read();
            (
                o.p2p,
                o.params.wallet_addr,
                o.params.wallet_split_percentage,
                o.params.waive_fee_percentage,
            )
        };

        // A P2P order without a wallet keeps its own fee.
        if p2p && wallet_addr.is_none() {
            return Ok(amount);
        }

        let wallet_split = if p2p {
            WALLET_SPLIT_BASE
        } else if wallet_addr.is_some() {
            wallet_split_percentage
        } else {
            0
        };

        let base = BigInt::from(config.fee_percentage_base);
        let wallet_fee = mul_div(
            &amount,
            &BigInt::from(wallet_split),
            &BigInt::from(WALLET_SPLIT_BASE),
        );
        let mut miner_fee = &amount - &wallet_fee;
        if waive > 0 {
            let keep = config.fee_percentage_base.saturating_sub(waive as u32);
            miner_fee = mul_div(&miner_fee, &BigInt::from(keep), &base);
        } else if waive < 0 {
            // This order pays no miner fee; it receives other orders'
            // miner fees instead.
            miner_fee = BigInt::zero();
        }

        let raw_rate = chain.burn_rate(token).await?;
        let burn_rate = BigInt::from(if p2p { raw_rate >> 16 } else { raw_rate & 0xffff });
        // The burn-rebate rate is structurally part of the protocol but is
        // currently always zero.
        let rebate_rate = BigInt::zero();

        let miner_burn = mul_div(&miner_fee, &burn_rate, &base);
        let miner_rebate = mul_div(&miner_fee, &rebate_rate, &base);
        miner_fee = miner_fee - &miner_burn - &miner_rebate;

        let wallet_burn = mul_div(&wallet_fee, &burn_rate, &base);
        let wallet_rebate = mul_div(&wallet_fee, &rebate_rate, &base);
        let wallet_fee = wallet_fee - &wallet_burn - &wallet_rebate;

        let tranche = zero_address();
        let mut credited = BigInt::zero();

        let mut fee_to_miner = miner_fee.clone();
        if self.miner_fees_to_orders_percentage > 0 && miner_fee > BigInt::zero() {
            for j in 0..self.size() {
                if j == idx {
                    continue;
                }
                let (other_waive, other_owner) = {
                    let o = self.participations[j].order.read();
                    (o.params.waive_fee_percentage, o.params.owner)
                };
                if other_waive < 0 {
                    let share = mul_div(&miner_fee, &BigInt::from(-other_waive), &base);
                    if !share.is_zero() {
                        self.fee_balances.add(other_owner, token, tranche, &share);
                        credited += &share;
                    }
                }
            }
            let keep = config
                .fee_percentage_base
                .saturating_sub(self.miner_fees_to_orders_percentage);
            fee_to_miner = mul_div(&miner_fee, &BigInt::from(keep), &base);
        }

        if let Some(wallet) = wallet_addr {
            if !wallet_fee.is_zero() {
                self.fee_balances.add(wallet, token, tranche, &wallet_fee);
                credited += &wallet_fee;
            }
        }
        if !fee_to_miner.is_zero() {
            self.fee_balances
                .add(mining.fee_recipient, token, tranche, &fee_to_miner);
            credited += &fee_to_miner;
        }
        let total_burn = &miner_burn + &wallet_burn;
        if !total_burn.is_zero() {
            self.fee_balances
                .add(config.burn_address, token, tranche, &total_burn);
            self.burned.add(config.burn_address, token, tranche, &total_burn);
            credited += &total_burn;
        }

        let rebate = &amount - &credited;
        debug_assert!(!rebate.is_negative());
        Ok(rebate)
    }

    /// The four logical transfers of one participation: trade delivery,
    /// sell-side fees, fee-token fee, and margin.
    async fn emit_transfers(
        &mut self,
        i: usize,
        prev: usize,
        mining: &Mining,
        config: &EngineConfig,
        chain: &dyn ChainView,
    ) -> Result<()> {
        let (owner, token_s, token_type_s, tranche_s, fee_token, token_type_fee, tranche_fee, data_s) = {
            let o = self.participations[i].order.read();
            (
                o.params.owner,
                o.params.token_s,
                o.params.token_type_s,
                o.params.tranche_s,
                o.params.fee_token,
                o.params.token_type_fee,
                o.params.tranche_fee,
                o.params.transfer_data_s.clone(),
            )
        };
        let prev_recipient = self.participations[prev].order.read().params.token_recipient;

        let p = &self.participations[i];
        let prev_p = &self.participations[prev];

        let prev_fee_b = &prev_p.fee_amount_b - &prev_p.rebate_b;
        let delivery = &p.fill_amount_s - &p.fee_amount_s - &prev_fee_b;
        let mut sell_side_fees = (&p.fee_amount_s - &p.rebate_s) + &prev_fee_b;
        let mut fee_token_fee = &p.fee_amount - &p.rebate_fee;
        if token_s == fee_token {
            // Fold the fee-token fee into the sold-token fee transfer.
            sell_side_fees += &fee_token_fee;
            fee_token_fee = BigInt::zero();
        }
        // Security tokens do not distribute margin.
        let margin = if token_type_s == TokenType::Erc1400 {
            BigInt::zero()
        } else {
            p.split_s.clone()
        };

        let data = if token_type_s == TokenType::Erc1400 && !data_s.is_empty() {
            Some(data_s)
        } else {
            None
        };

        self.push_transfer(chain, token_type_s, token_s, owner, prev_recipient, tranche_s, delivery, data.clone())
            .await?;
        self.push_transfer(chain, token_type_s, token_s, owner, config.fee_holder, tranche_s, sell_side_fees, data.clone())
            .await?;
        self.push_transfer(chain, token_type_fee, fee_token, owner, config.fee_holder, tranche_fee, fee_token_fee, None)
            .await?;
        let margin_transferred = self
            .push_transfer(chain, token_type_s, token_s, owner, mining.fee_recipient, tranche_s, margin, data)
            .await?;
        self.participations[i].margin_transferred = margin_transferred;
        Ok(())
    }

    /// Resolve tranches and record a transfer; zero-amount and
    /// self-transfers are suppressed. Returns whether a transfer was
    /// actually recorded.
    #[allow(clippy::too_many_arguments)]
    async fn push_transfer(
        &mut self,
        chain: &dyn ChainView,
        token_type: TokenType,
        token: H160,
        from: H160,
        to: H160,
        from_tranche: H160,
        amount: BigInt,
        data: Option<Vec<u8>>,
    ) -> Result<bool> {
        if amount.is_zero() || from == to {
            return Ok(false);
        }

        let (from_tranche, to_tranche) = match token_type {
            TokenType::Erc20 => (zero_address(), zero_address()),
            TokenType::Erc1400 => {
                // The payment-time probe is authoritative for the
                // destination tranche; a refusal here is fatal.
                let outcome = chain
                    .can_send(
                        token,
                        from,
                        to,
                        from_tranche,
                        &amount,
                        data.as_deref().unwrap_or(&[]),
                    )
                    .await?;
                if !outcome.is_success() {
                    return Err(RingMatchError::TransferRefused {
                        token: format!("{token:?}"),
                        status: outcome.status,
                    });
                }
                (from_tranche, outcome.dest_tranche)
            }
        };

        self.transfers.push(TransferItem {
            token,
            from,
            to,
            amount,
            token_type,
            from_tranche,
            to_tranche,
            data,
        });
        Ok(true)
    }

    /// RingMined fill records. Non-P2P fee amounts include the part taken
    /// from the bought token.
    pub fn generate_fills(&self) -> Vec<Fill> {
        self.participations
            .iter()
            .map(|p| {
                let o = p.order.read();
                let fee_amount = if o.p2p {
                    p.fee_amount.clone()
                } else {
                    &p.fee_amount + &p.fee_amount_b
                };
                Fill {
                    order_hash: o.hash,
                    owner: o.params.owner,
                    token_s: o.params.token_s,
                    amount_s: p.fill_amount_s.clone(),
                    split: p.split_s.clone(),
                    fee_amount,
                }
            })
            .collect()
    }

    /// Per-ring settlement invariants, checked after `do_payments`.
    pub fn validate_settlement(&self, config: &EngineConfig) -> Result<()> {
        let n = self.size();
        for i in 0..n {
            let prev = self.prev_index(i);
            let p = &self.participations[i];
            let prev_p = &self.participations[prev];
            let o = p.order.read();

            // Ring closure: the seller delivers exactly what the buyer
            // absorbs.
            if &p.fill_amount_s - &p.fee_amount_s != prev_p.fill_amount_b {
                return Err(invariant(format!(
                    "ring closure broken at participation {i}: {} - {} != {}",
                    p.fill_amount_s, p.fee_amount_s, prev_p.fill_amount_b
                )));
            }

            // Rate respect to 8 digits.
            let lhs = (&p.fill_amount_s + &p.split_s) * &o.params.amount_b;
            let rhs = &p.fill_amount_b * &o.params.amount_s;
            if !(lhs.is_zero() && rhs.is_zero()) {
                let diff = (&lhs - &rhs).abs();
                let bound = lhs.clone().max(rhs.clone());
                if diff * BigInt::from(100_000_000u64) > bound {
                    return Err(invariant(format!(
                        "fill rate diverges from order rate at participation {i}"
                    )));
                }
            }

            // Non-negativity.
            for (name, value) in [
                ("fill_amount_s", &p.fill_amount_s),
                ("fill_amount_b", &p.fill_amount_b),
                ("split_s", &p.split_s),
                ("fee_amount", &p.fee_amount),
                ("fee_amount_s", &p.fee_amount_s),
                ("fee_amount_b", &p.fee_amount_b),
                ("rebate_fee", &p.rebate_fee),
                ("rebate_s", &p.rebate_s),
                ("rebate_b", &p.rebate_b),
            ] {
                if value.is_negative() {
                    return Err(invariant(format!(
                        "{name} negative at participation {i}: {value}"
                    )));
                }
            }

            // Fill and fee bounds.
            if &p.fill_amount_s + &p.split_s > o.params.amount_s
                || p.fill_amount_b > o.params.amount_b
                || p.fee_amount > o.params.fee_amount
            {
                return Err(invariant(format!("fill bounds exceeded at participation {i}")));
            }

            // Rebate bounds.
            if p.rebate_fee > p.fee_amount
                || p.rebate_s > p.fee_amount_s
                || p.rebate_b > p.fee_amount_b
            {
                return Err(invariant(format!("rebate exceeds fee at participation {i}")));
            }

            // Spendable safety.
            if o.params.token_s == o.params.fee_token {
                if &p.fill_amount_s + &p.split_s + &p.fee_amount > p.ring_spendable_s {
                    return Err(invariant(format!(
                        "combined sell and fee exceed spendable at participation {i}"
                    )));
                }
            } else if &p.fill_amount_s + &p.split_s > p.ring_spendable_s
                || p.fee_amount > p.ring_spendable_fee
            {
                return Err(invariant(format!("spendable exceeded at participation {i}")));
            }

            // Fee mode exclusivity.
            if o.p2p {
                if !p.fee_amount.is_zero() {
                    return Err(invariant(format!(
                        "P2P order charged a fee-token fee at participation {i}"
                    )));
                }
            } else {
                if !p.fee_amount_s.is_zero() {
                    return Err(invariant(format!(
                        "non-P2P order charged a sell-side fee at participation {i}"
                    )));
                }
                if !p.fee_amount.is_zero() && !p.fee_amount_b.is_zero() {
                    return Err(invariant(format!(
                        "non-P2P order charged in both fee modes at participation {i}"
                    )));
                }
            }

            // Security tokens never pay out margin.
            if o.params.token_type_s == TokenType::Erc1400 && p.margin_transferred {
                return Err(invariant(format!(
                    "margin transferred for security token at participation {i}"
                )));
            }
        }
        Ok(())
    }
}

fn invariant(reason: String) -> RingMatchError {
    RingMatchError::SettlementInvariant { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::RwLock;
    use ringmatch_chain::{InMemorySnapshot, Keccak256Hasher, StaticSignatureVerifier};
    use ringmatch_types::{Order, OrderParams, RingsInput};

    fn addr(n: u64) -> H160 {
        H160::from_low_u64_be(n)
    }

    const TOKEN_X: u64 = 100;
    const TOKEN_Y: u64 = 101;
    const FEE_TOKEN: u64 = 102;

    fn order(owner: u64, token_s: u64, token_b: u64, amount_s: i64, amount_b: i64) -> SharedOrder {
        Arc::new(RwLock::new(Order::from_params(OrderParams {
            owner: addr(owner),
            token_recipient: addr(owner),
            token_s: addr(token_s),
            token_b: addr(token_b),
            fee_token: addr(FEE_TOKEN),
            amount_s: BigInt::from(amount_s),
            amount_b: BigInt::from(amount_b),
            ..OrderParams::default()
        })))
    }

    fn hashed(orders: Vec<SharedOrder>) -> Vec<SharedOrder> {
        let config = EngineConfig::default();
        let hasher = Keccak256Hasher;
        let verifier = StaticSignatureVerifier::new();
        let validator = OrderValidator {
            config: &config,
            hasher: &hasher,
            verifier: &verifier,
        };
        for shared in &orders {
            let mut o = shared.write();
            o.hash = validator.compute_hash(&o);
        }
        orders
    }

    fn fixture<'a>(
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

    fn mining() -> Mining {
        Mining::from_input(&RingsInput {
            orders: vec![],
            rings: vec![],
            fee_recipient: Some(addr(900)),
            miner: None,
            sig: None,
            transaction_origin: addr(900),
        })
    }

    #[test]
    fn sub_ring_detection_rejects_repeated_sell_tokens() {
        let hasher = Keccak256Hasher;
        let orders = hashed(vec![
            order(1, TOKEN_X, TOKEN_Y, 100, 100),
            order(2, TOKEN_Y, TOKEN_X, 100, 100),
            order(3, TOKEN_X, TOKEN_Y, 100, 100),
        ]);
        let mut ring = Ring::new(orders, &hasher);
        ring.check_for_sub_rings();
        assert!(!ring.valid);
    }

    #[test]
    fn token_continuity_is_required() {
        let hasher = Keccak256Hasher;
        let orders = hashed(vec![
            order(1, TOKEN_X, TOKEN_Y, 100, 100),
            order(2, TOKEN_Y, FEE_TOKEN, 100, 100),
        ]);
        let mut ring = Ring::new(orders, &hasher);
        ring.check_orders_valid();
        assert!(!ring.valid);
    }

    #[test]
    fn ring_size_bounds_are_enforced() {
        let hasher = Keccak256Hasher;
        let mut ring = Ring::new(hashed(vec![order(1, TOKEN_X, TOKEN_Y, 100, 100)]), &hasher);
        ring.check_orders_valid();
        assert!(!ring.valid);
    }

    #[tokio::test]
    async fn resize_shrinks_an_oversized_buyer() {
        let config = EngineConfig::default();
        let hasher = Keccak256Hasher;
        let verifier = StaticSignatureVerifier::new();
        let validator = fixture(&config, &hasher, &verifier);

        // A wants 1000 Y but B can only deliver 400 Y.
        let snapshot = InMemorySnapshot::new()
            .with_erc20_balance(addr(TOKEN_X), addr(1), 1_000)
            .with_erc20_balance(addr(TOKEN_Y), addr(2), 400);
        let orders = hashed(vec![
            order(1, TOKEN_X, TOKEN_Y, 1_000, 1_000),
            order(2, TOKEN_Y, TOKEN_X, 1_000, 1_000),
        ]);
        let mut ring = Ring::new(orders, &hasher);
        ring.check_orders_valid();
        ring.calculate_fill_amount_and_fee(&validator, &snapshot)
            .await
            .unwrap();

        assert!(ring.valid);
        assert_eq!(ring.participations[0].fill_amount_s, BigInt::from(400));
        assert_eq!(ring.participations[0].fill_amount_b, BigInt::from(400));
        assert_eq!(ring.participations[1].fill_amount_s, BigInt::from(400));
        assert_eq!(ring.participations[1].fill_amount_b, BigInt::from(400));
    }

    #[tokio::test]
    async fn margin_accrues_to_the_cheaper_seller() {
        let config = EngineConfig::default();
        let hasher = Keccak256Hasher;
        let verifier = StaticSignatureVerifier::new();
        let validator = fixture(&config, &hasher, &verifier);

        let snapshot = InMemorySnapshot::new()
            .with_erc20_balance(addr(TOKEN_X), addr(1), 1_100)
            .with_erc20_balance(addr(TOKEN_Y), addr(2), 1_000);
        let orders = hashed(vec![
            order(1, TOKEN_X, TOKEN_Y, 1_100, 1_000),
            order(2, TOKEN_Y, TOKEN_X, 1_000, 1_000),
        ]);
        let mut ring = Ring::new(orders, &hasher);
        ring.check_orders_valid();
        ring.calculate_fill_amount_and_fee(&validator, &snapshot)
            .await
            .unwrap();

        assert!(ring.valid);
        assert_eq!(ring.participations[0].split_s, BigInt::from(100));
        assert_eq!(ring.participations[0].fill_amount_s, BigInt::from(1_000));
        assert_eq!(ring.participations[1].split_s, BigInt::zero());
    }

    #[tokio::test]
    async fn fee_shortfall_scales_the_fill_down() {
        let config = EngineConfig::default();
        let hasher = Keccak256Hasher;
        let verifier = StaticSignatureVerifier::new();
        let validator = fixture(&config, &hasher, &verifier);

        // Owner 1 can only afford half the fee, so only half the order
        // fills.
        let snapshot = InMemorySnapshot::new()
            .with_erc20_balance(addr(TOKEN_X), addr(1), 1_000)
            .with_erc20_balance(addr(TOKEN_Y), addr(2), 1_000)
            .with_erc20_balance(addr(FEE_TOKEN), addr(1), 25);
        let orders = hashed(vec![
            order(1, TOKEN_X, TOKEN_Y, 1_000, 1_000),
            order(2, TOKEN_Y, TOKEN_X, 1_000, 1_000),
        ]);
        orders[0].write().params.fee_amount = BigInt::from(50);
        let orders = hashed(orders);

        let mut ring = Ring::new(orders, &hasher);
        ring.check_orders_valid();
        ring.calculate_fill_amount_and_fee(&validator, &snapshot)
            .await
            .unwrap();

        assert!(ring.valid);
        assert_eq!(ring.participations[0].fill_amount_s, BigInt::from(500));
        assert_eq!(ring.participations[0].fee_amount, BigInt::from(25));
        assert_eq!(ring.participations[1].fill_amount_b, BigInt::from(500));
    }

    #[tokio::test]
    async fn waive_sum_above_base_invalidates_the_ring() {
        let config = EngineConfig::default();
        let hasher = Keccak256Hasher;
        let verifier = StaticSignatureVerifier::new();
        let validator = fixture(&config, &hasher, &verifier);

        let snapshot = InMemorySnapshot::new()
            .with_erc20_balance(addr(TOKEN_X), addr(1), 1_000)
            .with_erc20_balance(addr(TOKEN_Y), addr(2), 1_000);
        let orders = hashed(vec![
            order(1, TOKEN_X, TOKEN_Y, 1_000, 1_000),
            order(2, TOKEN_Y, TOKEN_X, 1_000, 1_000),
        ]);
        orders[0].write().params.waive_fee_percentage = -600;
        orders[1].write().params.waive_fee_percentage = -600;
        let orders = hashed(orders);

        let mut ring = Ring::new(orders, &hasher);
        ring.check_orders_valid();
        ring.calculate_fill_amount_and_fee(&validator, &snapshot)
            .await
            .unwrap();
        assert!(!ring.valid);
    }

    #[tokio::test]
    async fn adjust_and_revert_round_trip_order_state() {
        let config = EngineConfig::default();
        let hasher = Keccak256Hasher;
        let verifier = StaticSignatureVerifier::new();
        let validator = fixture(&config, &hasher, &verifier);

        let snapshot = InMemorySnapshot::new()
            .with_erc20_balance(addr(TOKEN_X), addr(1), 1_000)
            .with_erc20_balance(addr(TOKEN_Y), addr(2), 1_000);
        let orders = hashed(vec![
            order(1, TOKEN_X, TOKEN_Y, 1_000, 1_000),
            order(2, TOKEN_Y, TOKEN_X, 1_000, 1_000),
        ]);
        let mut ring = Ring::new(orders.clone(), &hasher);
        ring.check_orders_valid();
        ring.calculate_fill_amount_and_fee(&validator, &snapshot)
            .await
            .unwrap();

        ring.adjust_order_states();
        assert_eq!(orders[0].read().filled_amount_s, BigInt::from(1_000));
        {
            let spendable = orders[0].read().token_spendable_s.clone();
            assert_eq!(spendable.read().amount, BigInt::zero());
        }

        ring.revert_order_stats();
        assert_eq!(orders[0].read().filled_amount_s, BigInt::zero());
        {
            let spendable = orders[0].read().token_spendable_s.clone();
            assert_eq!(spendable.read().amount, BigInt::from(1_000));
        }
    }

    #[tokio::test]
    async fn wallet_split_and_burn_are_applied_to_fee_credits() {
        let config = EngineConfig::default();
        let hasher = Keccak256Hasher;
        let verifier = StaticSignatureVerifier::new();
        let validator = fixture(&config, &hasher, &verifier);
        let mining = mining();
        let wallet = addr(77);

        // 10% burn on the fee token (non-P2P half of the packed rate).
        let snapshot = InMemorySnapshot::new()
            .with_erc20_balance(addr(TOKEN_X), addr(1), 1_000)
            .with_erc20_balance(addr(TOKEN_Y), addr(2), 1_000)
            .with_erc20_balance(addr(FEE_TOKEN), addr(1), 1_000)
            .with_burn_rate(addr(FEE_TOKEN), 100);
        let orders = hashed(vec![
            order(1, TOKEN_X, TOKEN_Y, 1_000, 1_000),
            order(2, TOKEN_Y, TOKEN_X, 1_000, 1_000),
        ]);
        {
            let mut o = orders[0].write();
            o.params.fee_amount = BigInt::from(100);
            o.params.wallet_addr = Some(wallet);
            o.params.wallet_split_percentage = 20;
        }
        let orders = hashed(orders);

        let mut ring = Ring::new(orders, &hasher);
        ring.check_orders_valid();
        ring.calculate_fill_amount_and_fee(&validator, &snapshot)
            .await
            .unwrap();
        assert!(ring.valid);
        ring.do_payments(&mining, &config, &snapshot).await.unwrap();

        // Fee 100: wallet 20, miner 80; 10% burn on both.
        let zero = zero_address();
        assert_eq!(
            ring.fee_balances.get(wallet, addr(FEE_TOKEN), zero),
            BigInt::from(18)
        );
        assert_eq!(
            ring.fee_balances.get(addr(900), addr(FEE_TOKEN), zero),
            BigInt::from(72)
        );
        assert_eq!(
            ring.fee_balances.get(zero, addr(FEE_TOKEN), zero),
            BigInt::from(10)
        );
        assert_eq!(ring.participations[0].rebate_fee, BigInt::zero());
    }

    #[tokio::test]
    async fn settlement_validation_passes_for_a_clean_ring() {
        let config = EngineConfig::default();
        let hasher = Keccak256Hasher;
        let verifier = StaticSignatureVerifier::new();
        let validator = fixture(&config, &hasher, &verifier);
        let mining = mining();

        let snapshot = InMemorySnapshot::new()
            .with_erc20_balance(addr(TOKEN_X), addr(1), 1_100)
            .with_erc20_balance(addr(TOKEN_Y), addr(2), 1_000);
        let orders = hashed(vec![
            order(1, TOKEN_X, TOKEN_Y, 1_100, 1_000),
            order(2, TOKEN_Y, TOKEN_X, 1_000, 1_000),
        ]);
        let mut ring = Ring::new(orders, &hasher);
        ring.check_orders_valid();
        ring.calculate_fill_amount_and_fee(&validator, &snapshot)
            .await
            .unwrap();
        ring.adjust_order_states();
        ring.do_payments(&mining, &config, &snapshot).await.unwrap();

        ring.validate_settlement(&config).unwrap();
    }
}

//! RingMatch Engine - Ring Settlement Simulation Core
//!
//! This crate implements the off-chain settlement simulator for the
//! ring-matching order exchange: given a batch of orders bundled into rings
//! by a miner, it determines how much of each order fills, computes fees,
//! burns, wallet splits, rebates, and margin, emits the exact token
//! transfers the settlement would perform on chain, and verifies the
//! end-to-end invariants of the result.
//!
//! # Components
//!
//! - [`OrderValidator`]: per-order validity, hashing, and spendable queries
//! - [`Ring`]: the cyclic fill fixed point, fee distribution, and payments
//! - [`resolve_all_or_none`]: the cross-ring all-or-none fixed point
//! - [`SettlementEngine`]: the batch driver producing a `SimulatorReport`
//!
//! # Example
//!
//! ```ignore
//! use ringmatch_engine::{EngineConfig, SettlementEngine};
//!
//! let engine = SettlementEngine::new(EngineConfig {
//!     block_timestamp: 1_700_000_000,
//!     ..EngineConfig::default()
//! });
//!
//! let report = engine.simulate(&input, &snapshot).await?;
//! for event in &report.ring_mined_events {
//!     println!("ring {} settled with {} fills", event.ring_index, event.fills.len());
//! }
//! ```
//!
//! A simulation is a pure function of `(RingsInput, ChainView snapshot)`:
//! it runs single-threaded, suspends only on chain reads, and mutates no
//! external state. Simulating twice with identical inputs produces
//! identical reports.

use primitive_types::H160;

pub mod aon;
pub mod engine;
pub mod ring;
pub mod validator;

pub use aon::resolve_all_or_none;
pub use engine::SettlementEngine;
pub use ring::{Participation, Ring};
pub use validator::OrderValidator;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Denominator for fee-percentage arithmetic (tenths of a percent).
    pub fee_percentage_base: u32,
    /// The timestamp orders are validated against, unix seconds.
    pub block_timestamp: u64,
    /// Address of the fee holder contract that fee transfers target.
    pub fee_holder: H160,
    /// Owner key under which burned fees accumulate; the zero address.
    pub burn_address: H160,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fee_percentage_base: ringmatch_types::FEE_PERCENTAGE_BASE,
            block_timestamp: 0,
            // Placeholder; pre-flight callers configure the deployed address.
            fee_holder: H160::repeat_byte(0xfe),
            burn_address: ringmatch_types::zero_address(),
        }
    }
}

//! RingMatch Types - Canonical domain types for ring settlement simulation
//!
//! This crate contains all foundational types for the RingMatch simulator
//! with no dependencies on the other ringmatch crates. It defines:
//!
//! - Token classification and protocol constants
//! - Arbitrary-precision amount helpers with consensus truncation rules
//! - Spendable budgets with live reservation counters
//! - Orders, rings input, and mining parameters
//! - The sparse `(owner, token, tranche)` balance book
//! - Transfer items, settlement events, and the simulator report
//! - The fatal-error enum
//!
//! # Architectural Invariants
//!
//! 1. All financial arithmetic is arbitrary-precision with truncation
//!    toward zero, applied after multiplication
//! 2. Order- and ring-invalidation are state (`valid = false`), never errors
//! 3. Balance books iterate in sorted key order so reports are reproducible
//! 4. A simulation is a pure function of its input and a chain snapshot

pub mod amount;
pub mod balance_book;
pub mod error;
pub mod input;
pub mod order;
pub mod report;
pub mod spendable;
pub mod token;

pub use amount::{cancelled_sentinel, mul_div, to_word};
pub use balance_book::{BalanceBook, BalanceEntry};
pub use error::{Result, RingMatchError};
pub use input::{Mining, RingsInput};
pub use order::{Order, OrderParams, SharedOrder};
pub use report::{
    merge_transfers, Fill, InvalidRingEvent, RingMinedEvent, SimulatorReport, TransferItem,
};
pub use spendable::{shared_spendable, SharedSpendable, Spendable};
pub use token::{
    zero_address, TokenType, FEE_PERCENTAGE_BASE, MAX_RING_SIZE, MIN_RING_SIZE, WALLET_SPLIT_BASE,
};

/// Convenience re-exports of the scalar types the whole workspace keys on.
pub use num_bigint::BigInt;
pub use primitive_types::{H160, H256};

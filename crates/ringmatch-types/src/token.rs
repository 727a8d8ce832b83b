//! Token classification and protocol constants.

use primitive_types::H160;
use serde::{Deserialize, Serialize};

/// Denominator for all fee-percentage arithmetic. Percentage fields are
/// expressed in tenths of a percent.
pub const FEE_PERCENTAGE_BASE: u32 = 1000;

/// Denominator for wallet split percentages (whole percent).
pub const WALLET_SPLIT_BASE: u32 = 100;

/// Minimum number of orders in a ring.
pub const MIN_RING_SIZE: usize = 2;

/// Maximum number of orders in a ring.
pub const MAX_RING_SIZE: usize = 8;

/// The all-zero address: the canonical "no tranche / default" marker and the
/// owner key under which burned fees accumulate.
pub fn zero_address() -> H160 {
    H160::zero()
}

/// Transfer standard of a token leg.
///
/// `Erc20` is fungible and ignores tranches (the zero address is used on
/// both sides of a transfer). `Erc1400` is partitioned: every balance lives
/// in a named tranche, and a transfer may be redirected to a different
/// destination tranche by the token's `canSend` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenType {
    Erc20,
    Erc1400,
}

impl TokenType {
    /// Whether balances of this token are partitioned into tranches.
    pub fn is_tranched(&self) -> bool {
        matches!(self, TokenType::Erc1400)
    }
}

//! Fatal error types for the simulator.
//!
//! Order- and ring-invalidation are state (`valid = false`) and never
//! surface here; only conditions that abort a whole simulation do.

use thiserror::Error;

/// Result type for RingMatch operations.
pub type Result<T> = std::result::Result<T, RingMatchError>;

/// Conditions that abort a simulation.
#[derive(Debug, Clone, Error)]
pub enum RingMatchError {
    /// The mandatory miner signature did not verify.
    #[error("Miner signature rejected for miner {miner}")]
    InvalidMinerSignature { miner: String },

    /// The rings input cannot be interpreted as orders and rings.
    #[error("Malformed rings input: {reason}")]
    MalformedInput { reason: String },

    /// A ring references an order index outside the batch.
    #[error("Order index {index} out of bounds for {order_count} orders")]
    OrderIndexOutOfBounds { index: usize, order_count: usize },

    /// A chain snapshot read failed. There is no retry policy.
    #[error("Chain read failed: {reason}")]
    ChainRead { reason: String },

    /// An ERC1400 token refused a transfer at payment time.
    #[error("Transfer refused by token {token}: status {status:#04x}")]
    TransferRefused { token: String, status: u8 },

    /// A post-simulation invariant check failed.
    #[error("Settlement invariant violated: {reason}")]
    SettlementInvariant { reason: String },
}

impl RingMatchError {
    /// Whether the on-chain transaction this simulation models would revert,
    /// as opposed to an infrastructure failure of the simulator itself.
    pub fn is_revert(&self) -> bool {
        !matches!(self, RingMatchError::ChainRead { .. })
    }
}

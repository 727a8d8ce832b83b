//! RingMatch Chain - Read-only chain state for the settlement simulator
//!
//! A simulation is a pure function of its input and a chain snapshot. This
//! crate defines the snapshot's surface:
//!
//! - [`ChainView`]: the read-only façade over on-chain state (fills,
//!   cancellations, balances, allowances, burn rates, broker registry,
//!   ERC1400 `canSend` probes)
//! - [`Hasher`] / [`SignatureVerifier`]: the cryptographic seams
//! - [`InMemorySnapshot`]: an owned snapshot for tests and miner pre-flight
//!
//! For any given snapshot, identical queries must return identical results;
//! the engine relies on this for determinism. Failures are fatal — there is
//! no retry policy inside the core.

use async_trait::async_trait;
use num_bigint::BigInt;
use primitive_types::{H160, H256};
use sha3::{Digest, Keccak256};

use ringmatch_types::{Result, TokenType};

pub mod snapshot;

pub use snapshot::{CanSendRule, InMemorySnapshot, StaticSignatureVerifier};

/// ERC1400 `canSend` status codes that permit a transfer.
pub const CAN_SEND_SUCCESS_CODES: [u8; 3] = [0xa0, 0xa1, 0xa2];

/// Outcome of an ERC1400 `canSend` probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanSendOutcome {
    pub status: u8,
    /// Tranche the tokens would land in; may differ from the source tranche.
    pub dest_tranche: H160,
}

impl CanSendOutcome {
    pub fn is_success(&self) -> bool {
        CAN_SEND_SUCCESS_CODES.contains(&self.status)
    }
}

/// Read-only façade over a chain snapshot.
///
/// These reads are the only suspension points in a simulation.
#[async_trait]
pub trait ChainView: Send + Sync {
    /// Batched fill/cancellation query against the trade delegate.
    ///
    /// The input packs five words per order: `(broker, owner, hash,
    /// validSince, tokenS xor tokenB + 12 pad bytes)`. The output is
    /// parallel to the orders; the `2^256 - 1` sentinel means cancelled.
    async fn batch_get_filled_and_check_cancelled(&self, words: Vec<H256>) -> Result<Vec<BigInt>>;

    /// Filled amount (in tokenS) recorded for one order hash.
    async fn filled(&self, order_hash: H256) -> Result<BigInt>;

    /// Fee holder balance for `(token, owner)`.
    async fn fee_balances(&self, token: H160, owner: H160) -> Result<BigInt>;

    /// Packed burn rate for a token: low 16 bits apply to non-P2P fees,
    /// high 16 bits to P2P fees.
    async fn burn_rate(&self, token: H160) -> Result<u32>;

    /// Broker registry lookup: `(interceptor, registered)`.
    async fn broker_registry(&self, broker: H160, owner: H160) -> Result<(Option<H160>, bool)>;

    /// Token balance of `owner`, within `tranche` for ERC1400.
    async fn balance_of(
        &self,
        token_type: TokenType,
        token: H160,
        tranche: H160,
        owner: H160,
    ) -> Result<BigInt>;

    /// Amount `owner` has approved the trade delegate to move.
    async fn allowance_of(
        &self,
        token_type: TokenType,
        token: H160,
        tranche: H160,
        owner: H160,
    ) -> Result<BigInt>;

    /// Amount the broker interceptor allows `broker` to move on behalf of
    /// `owner`.
    async fn broker_allowance(
        &self,
        interceptor: H160,
        owner: H160,
        broker: H160,
        token: H160,
    ) -> Result<BigInt>;

    /// ERC1400 transfer probe.
    async fn can_send(
        &self,
        token: H160,
        from: H160,
        to: H160,
        from_tranche: H160,
        amount: &BigInt,
        data: &[u8],
    ) -> Result<CanSendOutcome>;
}

/// Hashing seam for order and mining hashes.
pub trait Hasher: Send + Sync {
    fn hash(&self, data: &[u8]) -> H256;
}

/// Keccak-256, the hash the protocol's consensus implementation uses.
#[derive(Debug, Clone, Copy, Default)]
pub struct Keccak256Hasher;

impl Hasher for Keccak256Hasher {
    fn hash(&self, data: &[u8]) -> H256 {
        let digest = Keccak256::digest(data);
        H256::from_slice(&digest)
    }
}

/// Signature verification seam.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, signer: H160, hash: H256, sig: &[u8]) -> bool;
}

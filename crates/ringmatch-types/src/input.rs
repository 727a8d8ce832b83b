//! Ingress types: one miner-submitted batch.

use primitive_types::{H160, H256};
use serde::{Deserialize, Serialize};

use crate::order::OrderParams;

/// Mining parameters resolved from a [`RingsInput`].
///
/// The fee recipient defaults to the transaction origin and the miner
/// defaults to the fee recipient; `hash` is filled in once the rings are
/// constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mining {
    pub fee_recipient: H160,
    pub miner: H160,
    pub sig: Option<Vec<u8>>,
    pub hash: H256,
}

impl Mining {
    pub fn from_input(input: &RingsInput) -> Self {
        let fee_recipient = input.fee_recipient.unwrap_or(input.transaction_origin);
        let miner = input.miner.unwrap_or(fee_recipient);
        Self {
            fee_recipient,
            miner,
            sig: input.sig.clone(),
            hash: H256::zero(),
        }
    }
}

/// A batch of orders bundled into rings by a miner.
///
/// `rings` holds index lists into `orders`; the deserialization of the raw
/// miner-submitted byte blob into this shape is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingsInput {
    pub orders: Vec<OrderParams>,
    pub rings: Vec<Vec<usize>>,
    pub fee_recipient: Option<H160>,
    pub miner: Option<H160>,
    pub sig: Option<Vec<u8>>,
    pub transaction_origin: H160,
}

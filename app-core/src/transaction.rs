// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_primitives::{Address, B256};
use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};

use crate::application::Method;

/// A client request as it travels through the relay and onto the DA layer.
///
/// `id` is client-assigned and unique for the lifetime of the relay. `payload` is the SSZ
/// encoding of a [`Method`]; its first byte is the union selector and acts as the opcode.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Transaction {
    pub id: B256,
    pub sender: Address,
    pub payload: Vec<u8>,
    pub submitted_at: u64,
}

impl Transaction {
    pub const ID_BYTES: usize = 32;
    pub const SENDER_BYTES: usize = 20;
    pub const SUBMITTED_AT_BYTES: usize = 8;
    // Offset of the variable-size payload inside the SSZ container.
    pub const OFFSET_BYTES: usize = 4;
    pub const FIXED_BYTES: usize =
        Self::ID_BYTES + Self::SENDER_BYTES + Self::OFFSET_BYTES + Self::SUBMITTED_AT_BYTES;

    pub fn new(id: B256, sender: Address, method: &Method, submitted_at: u64) -> Self {
        Self {
            id,
            sender,
            payload: method.as_ssz_bytes(),
            submitted_at,
        }
    }

    pub fn method(&self) -> Result<Method, ssz::DecodeError> {
        Method::from_ssz_bytes(self.payload.as_slice())
    }

    pub const fn encoded_len_for_payload_len(payload_len: usize) -> usize {
        Self::FIXED_BYTES + payload_len
    }
}

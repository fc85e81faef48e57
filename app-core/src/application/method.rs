// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use ssz_derive::{Decode, Encode};

/// Operations a transaction can carry. The SSZ union selector doubles as the opcode.
#[derive(PartialEq, Debug, Encode, Decode, Clone, Serialize, Deserialize)]
#[ssz(enum_behaviour = "union")]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Withdrawal(Withdrawal),
    Transfer(Transfer),
    TransferMany(TransferMany),
}

#[derive(PartialEq, Debug, Encode, Decode, Clone, Serialize, Deserialize)]
pub struct Withdrawal {
    pub amount: U256,
}

#[derive(PartialEq, Debug, Encode, Decode, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub amount: U256,
    pub to: Address,
}

// Applied in order and all-or-nothing.
#[derive(PartialEq, Debug, Encode, Decode, Clone, Serialize, Deserialize)]
pub struct TransferMany {
    pub transfers: Vec<Transfer>,
}

impl Method {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Withdrawal(_) => 0,
            Self::Transfer(_) => 1,
            Self::TransferMany(_) => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Method, Transfer, Withdrawal};
    use alloy_primitives::{Address, U256};
    use ssz::Encode;

    #[test]
    fn union_selector_matches_opcode() {
        let methods = [
            Method::Withdrawal(Withdrawal {
                amount: U256::from(1),
            }),
            Method::Transfer(Transfer {
                amount: U256::from(1),
                to: Address::ZERO,
            }),
        ];
        for method in methods {
            assert_eq!(method.as_ssz_bytes()[0], method.opcode());
        }
    }

    #[test]
    fn json_form_is_externally_tagged() {
        let method = Method::Withdrawal(Withdrawal {
            amount: U256::from(3),
        });
        let json = serde_json::to_value(&method).expect("serialize method");
        assert!(json.get("withdrawal").is_some());
        let back: Method = serde_json::from_value(json).expect("deserialize method");
        assert_eq!(back, method);
    }
}

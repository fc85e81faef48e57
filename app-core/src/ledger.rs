// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeMap;

use alloy_primitives::{Address, B256, U256, keccak256};
use serde::{Deserialize, Serialize};

/// Account balances plus the number of batches that produced them.
///
/// Only accounts present at genesis exist; executors may change balances but never add or
/// remove accounts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    height: u64,
    balances: BTreeMap<Address, U256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub account: Address,
    pub balance: U256,
}

/// Serializable form of a [`Ledger`], used for persistence and API responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub height: u64,
    pub state_root: B256,
    pub balances: Vec<AccountBalance>,
}

impl Ledger {
    pub fn genesis(balances: impl IntoIterator<Item = (Address, U256)>) -> Self {
        Self {
            height: 0,
            balances: balances.into_iter().collect(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn contains(&self, account: &Address) -> bool {
        self.balances.contains_key(account)
    }

    pub fn balance_of(&self, account: &Address) -> Option<U256> {
        self.balances.get(account).copied()
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&Address, &U256)> {
        self.balances.iter()
    }

    /// Overwrites the balance of an existing account. Unknown accounts are ignored.
    pub fn set_balance(&mut self, account: Address, balance: U256) {
        if let Some(slot) = self.balances.get_mut(&account) {
            *slot = balance;
        }
    }

    pub fn advance_height(&mut self) {
        self.height = self.height.saturating_add(1);
    }

    /// Commitment over balances in address order. Height is deliberately left out so that a
    /// projected ledger and the committed one it turns into share the same root.
    pub fn state_root(&self) -> B256 {
        let mut preimage = Vec::with_capacity(self.balances.len() * (20 + 32));
        for (account, balance) in &self.balances {
            preimage.extend_from_slice(account.as_slice());
            preimage.extend_from_slice(&balance.to_be_bytes::<32>());
        }
        keccak256(preimage)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            height: self.height,
            state_root: self.state_root(),
            balances: self
                .balances
                .iter()
                .map(|(account, balance)| AccountBalance {
                    account: *account,
                    balance: *balance,
                })
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: &LedgerSnapshot) -> Self {
        Self {
            height: snapshot.height,
            balances: snapshot
                .balances
                .iter()
                .map(|entry| (entry.account, entry.balance))
                .collect(),
        }
    }
}

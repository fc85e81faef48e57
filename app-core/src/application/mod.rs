// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

mod method;
mod transfer;

use alloy_primitives::{Address, U256};
use std::fmt;
use thiserror::Error;

use crate::ledger::Ledger;
use crate::transaction::Transaction;

pub use method::{Method, Transfer, TransferMany, Withdrawal};
pub use transfer::TransferExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    MalformedPayload,
    UnknownSender { account: Address },
    UnknownRecipient { account: Address },
    InsufficientBalance { required: U256, available: U256 },
    BalanceOverflow { account: Address },
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedPayload => write!(f, "malformed payload"),
            Self::UnknownSender { account } => write!(f, "unknown sender {account}"),
            Self::UnknownRecipient { account } => write!(f, "unknown recipient {account}"),
            Self::InsufficientBalance {
                required,
                available,
            } => {
                write!(
                    f,
                    "insufficient balance: required {required}, available {available}"
                )
            }
            Self::BalanceOverflow { account } => write!(f, "balance overflow for {account}"),
        }
    }
}

impl std::error::Error for InvalidReason {}

/// Error from replaying an ordered list of transactions: which one failed and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transaction at position {position} rejected: {reason}")]
pub struct ReplayError {
    pub position: usize,
    pub reason: InvalidReason,
}

/// Settlement executor. Implementations must be deterministic and leave the ledger untouched
/// when a transaction is rejected.
pub trait Executor: Send + Sync {
    fn execute(&self, ledger: &mut Ledger, tx: &Transaction) -> Result<(), InvalidReason>;

    fn simulate(&self, ledger: &Ledger, tx: &Transaction) -> Result<Ledger, InvalidReason> {
        let mut next = ledger.clone();
        self.execute(&mut next, tx)?;
        Ok(next)
    }

    fn execute_all(&self, ledger: &mut Ledger, txs: &[Transaction]) -> Result<(), ReplayError> {
        for (position, tx) in txs.iter().enumerate() {
            self.execute(ledger, tx)
                .map_err(|reason| ReplayError { position, reason })?;
        }
        Ok(())
    }
}

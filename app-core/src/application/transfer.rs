// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeMap;

use alloy_primitives::{Address, U256};

use crate::application::{Executor, InvalidReason, Method, Transfer};
use crate::ledger::Ledger;
use crate::transaction::Transaction;

/// Balance-transfer semantics over a fixed set of genesis accounts.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferExecutor;

impl TransferExecutor {
    pub fn new() -> Self {
        Self
    }
}

// Balances touched by one transaction, written back only if the whole transaction succeeds.
struct Scratch<'a> {
    ledger: &'a Ledger,
    touched: BTreeMap<Address, U256>,
}

impl<'a> Scratch<'a> {
    fn new(ledger: &'a Ledger) -> Self {
        Self {
            ledger,
            touched: BTreeMap::new(),
        }
    }

    fn balance_of(&self, account: &Address) -> Option<U256> {
        self.touched
            .get(account)
            .copied()
            .or_else(|| self.ledger.balance_of(account))
    }

    fn debit(&mut self, account: Address, amount: U256) -> Result<(), InvalidReason> {
        let available = self
            .balance_of(&account)
            .ok_or(InvalidReason::UnknownSender { account })?;
        if available < amount {
            return Err(InvalidReason::InsufficientBalance {
                required: amount,
                available,
            });
        }
        self.touched.insert(account, available - amount);
        Ok(())
    }

    fn credit(&mut self, account: Address, amount: U256) -> Result<(), InvalidReason> {
        let current = self
            .balance_of(&account)
            .ok_or(InvalidReason::UnknownRecipient { account })?;
        let next = current
            .checked_add(amount)
            .ok_or(InvalidReason::BalanceOverflow { account })?;
        self.touched.insert(account, next);
        Ok(())
    }

    fn transfer(&mut self, sender: Address, transfer: &Transfer) -> Result<(), InvalidReason> {
        if !self.ledger.contains(&transfer.to) {
            return Err(InvalidReason::UnknownRecipient {
                account: transfer.to,
            });
        }
        self.debit(sender, transfer.amount)?;
        self.credit(transfer.to, transfer.amount)
    }

    fn into_touched(self) -> BTreeMap<Address, U256> {
        self.touched
    }
}

impl Executor for TransferExecutor {
    fn execute(&self, ledger: &mut Ledger, tx: &Transaction) -> Result<(), InvalidReason> {
        let method = tx.method().map_err(|_| InvalidReason::MalformedPayload)?;
        if !ledger.contains(&tx.sender) {
            return Err(InvalidReason::UnknownSender { account: tx.sender });
        }

        let mut scratch = Scratch::new(ledger);
        match &method {
            Method::Transfer(transfer) => scratch.transfer(tx.sender, transfer)?,
            Method::TransferMany(many) => {
                for transfer in &many.transfers {
                    scratch.transfer(tx.sender, transfer)?;
                }
            }
            Method::Withdrawal(withdrawal) => scratch.debit(tx.sender, withdrawal.amount)?,
        }
        for (account, balance) in scratch.into_touched() {
            ledger.set_balance(account, balance);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::TransferExecutor;
    use crate::application::{Executor, InvalidReason, Method, Transfer, TransferMany, Withdrawal};
    use crate::ledger::Ledger;
    use crate::transaction::Transaction;
    use alloy_primitives::{Address, B256, U256};

    fn account(seed: u8) -> Address {
        Address::from_slice(&[seed; 20])
    }

    fn genesis() -> Ledger {
        Ledger::genesis([(account(0xa), U256::from(9)), (account(0xb), U256::from(1))])
    }

    fn tx(seed: u8, sender: Address, method: Method) -> Transaction {
        Transaction::new(B256::from([seed; 32]), sender, &method, 0)
    }

    fn transfer(to: Address, amount: u64) -> Transfer {
        Transfer {
            amount: U256::from(amount),
            to,
        }
    }

    #[test]
    fn transfer_moves_balance() {
        let executor = TransferExecutor::new();
        let mut ledger = genesis();

        executor
            .execute(
                &mut ledger,
                &tx(1, account(0xa), Method::Transfer(transfer(account(0xb), 4))),
            )
            .expect("execute transfer");

        assert_eq!(ledger.balance_of(&account(0xa)), Some(U256::from(5)));
        assert_eq!(ledger.balance_of(&account(0xb)), Some(U256::from(5)));
    }

    #[test]
    fn second_transfer_fails_once_balance_is_spent() {
        let executor = TransferExecutor::new();
        let ledger = Ledger::genesis([(account(0xa), U256::from(1)), (account(0xb), U256::ZERO)]);
        let first = tx(1, account(0xa), Method::Transfer(transfer(account(0xb), 1)));
        let second = tx(2, account(0xa), Method::Transfer(transfer(account(0xb), 1)));

        let after_first = executor.simulate(&ledger, &first).expect("first transfer");
        let err = executor
            .simulate(&after_first, &second)
            .expect_err("second transfer must not be covered");

        assert_eq!(
            err,
            InvalidReason::InsufficientBalance {
                required: U256::from(1),
                available: U256::ZERO,
            }
        );
        assert_eq!(ledger.balance_of(&account(0xa)), Some(U256::from(1)));
    }

    #[test]
    fn unknown_recipient_is_rejected() {
        let executor = TransferExecutor::new();
        let err = executor
            .simulate(
                &genesis(),
                &tx(1, account(0xa), Method::Transfer(transfer(account(0xc), 1))),
            )
            .expect_err("recipient does not exist");
        assert_eq!(
            err,
            InvalidReason::UnknownRecipient {
                account: account(0xc)
            }
        );
    }

    #[test]
    fn unknown_sender_is_rejected() {
        let executor = TransferExecutor::new();
        let err = executor
            .simulate(
                &genesis(),
                &tx(1, account(0xc), Method::Withdrawal(Withdrawal { amount: U256::ZERO })),
            )
            .expect_err("sender does not exist");
        assert_eq!(
            err,
            InvalidReason::UnknownSender {
                account: account(0xc)
            }
        );
    }

    #[test]
    fn transfer_many_is_all_or_nothing() {
        let executor = TransferExecutor::new();
        let mut ledger = genesis();
        let method = Method::TransferMany(TransferMany {
            transfers: vec![transfer(account(0xb), 5), transfer(account(0xb), 5)],
        });

        let err = executor
            .execute(&mut ledger, &tx(1, account(0xa), method))
            .expect_err("second leg overdraws");

        assert!(matches!(err, InvalidReason::InsufficientBalance { .. }));
        assert_eq!(ledger, genesis());
    }

    #[test]
    fn transfer_many_writes_every_leg_back_in_place() {
        let executor = TransferExecutor::new();
        let mut ledger = Ledger::genesis([
            (account(0xa), U256::from(9)),
            (account(0xb), U256::from(1)),
            (account(0xc), U256::ZERO),
        ]);
        let method = Method::TransferMany(TransferMany {
            transfers: vec![transfer(account(0xb), 3), transfer(account(0xc), 4)],
        });

        executor
            .execute(&mut ledger, &tx(1, account(0xa), method))
            .expect("both legs are covered");

        assert_eq!(ledger.balance_of(&account(0xa)), Some(U256::from(2)));
        assert_eq!(ledger.balance_of(&account(0xb)), Some(U256::from(4)));
        assert_eq!(ledger.balance_of(&account(0xc)), Some(U256::from(4)));
        assert_eq!(ledger.height(), 0);
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let executor = TransferExecutor::new();
        let bad = Transaction {
            id: B256::ZERO,
            sender: account(0xa),
            payload: vec![0x09],
            submitted_at: 0,
        };
        assert_eq!(
            executor.simulate(&genesis(), &bad),
            Err(InvalidReason::MalformedPayload)
        );
    }

    #[test]
    fn execute_all_matches_sequential_simulation() {
        let executor = TransferExecutor::new();
        let txs = vec![
            tx(1, account(0xa), Method::Transfer(transfer(account(0xb), 2))),
            tx(2, account(0xb), Method::Transfer(transfer(account(0xa), 3))),
            tx(3, account(0xa), Method::Withdrawal(Withdrawal {
                amount: U256::from(1),
            })),
        ];

        let mut sequential = genesis();
        for item in &txs {
            sequential = executor.simulate(&sequential, item).expect("simulate");
        }
        let mut batched = genesis();
        executor
            .execute_all(&mut batched, txs.as_slice())
            .expect("execute batch");

        assert_eq!(batched, sequential);
        assert_eq!(batched.balance_of(&account(0xa)), Some(U256::from(9)));
    }
}

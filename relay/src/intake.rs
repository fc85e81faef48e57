// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;

use alloy_primitives::B256;
use app_core::application::InvalidReason;
use app_core::transaction::Transaction;
use thiserror::Error;

use crate::pending_queue::{PendingQueue, QueueError};
use crate::projector::{AcceptError, SimulatedResult, StateProjector};
use crate::storage::{self, SharedStorage, now_unix_ms};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("duplicate transaction id {id}")]
    Duplicate { id: B256 },
    #[error("invalid transaction: {0}")]
    Invalid(InvalidReason),
    #[error("cannot persist accepted transaction")]
    Storage {
        #[source]
        source: rusqlite::Error,
    },
}

impl From<QueueError> for IntakeError {
    fn from(value: QueueError) -> Self {
        match value {
            QueueError::Duplicate { id } => Self::Duplicate { id },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Accepted {
    pub position: u64,
    pub simulated: SimulatedResult,
}

/// Client entry point: duplicate check, simulation against the overlay, persistence and
/// enqueue, in that order and as one step relative to other submissions.
pub struct Intake {
    projector: Arc<StateProjector>,
    queue: Arc<PendingQueue>,
    storage: SharedStorage,
}

impl Intake {
    pub fn new(
        projector: Arc<StateProjector>,
        queue: Arc<PendingQueue>,
        storage: SharedStorage,
    ) -> Self {
        Self {
            projector,
            queue,
            storage,
        }
    }

    /// Blocks on SQLite; async callers run it on the blocking pool.
    pub fn submit(&self, tx: Transaction) -> Result<Accepted, IntakeError> {
        if self.queue.contains(&tx.id) {
            return Err(IntakeError::Duplicate { id: tx.id });
        }

        let accepted = self.projector.accept(&tx, || {
            // Re-checked under the overlay lock: concurrent twins both pass the fast path.
            if self.queue.contains(&tx.id) {
                return Err(IntakeError::Duplicate { id: tx.id });
            }
            storage::lock(&self.storage)
                .append_pending_tx(&tx, now_unix_ms())
                .map_err(|source| IntakeError::Storage { source })?;
            Ok(self.queue.enqueue(tx.clone())?)
        });

        match accepted {
            Ok((position, simulated)) => Ok(Accepted {
                position,
                simulated,
            }),
            Err(AcceptError::Invalid(reason)) => Err(IntakeError::Invalid(reason)),
            Err(AcceptError::Admission(err)) => Err(err),
        }
    }

    /// Dry run: no duplicate check, nothing persisted or enqueued.
    pub fn simulate(&self, tx: &Transaction) -> Result<SimulatedResult, IntakeError> {
        self.projector.simulate(tx).map_err(IntakeError::Invalid)
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn projector(&self) -> &Arc<StateProjector> {
        &self.projector
    }
}

#[cfg(test)]
mod tests {
    use super::{Intake, IntakeError};
    use crate::pending_queue::PendingQueue;
    use crate::projector::StateProjector;
    use crate::storage::{self, Storage};
    use alloy_primitives::{Address, B256, U256};
    use app_core::application::{InvalidReason, Method, Transfer, TransferExecutor, Withdrawal};
    use app_core::ledger::Ledger;
    use app_core::transaction::Transaction;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn account(seed: u8) -> Address {
        Address::from_slice(&[seed; 20])
    }

    fn intake() -> (TempDir, Intake) {
        let dir = tempfile::Builder::new()
            .prefix("relay-intake-")
            .tempdir()
            .expect("create temporary test directory");
        let path = dir.path().join("relay.sqlite");
        let mut storage = Storage::open(&path.to_string_lossy(), "NORMAL").expect("open storage");
        let ledger = storage
            .load_or_init_ledger(&Ledger::genesis([
                (account(1), U256::from(10)),
                (account(2), U256::ZERO),
            ]))
            .expect("init ledger");
        let projector = Arc::new(StateProjector::new(
            Arc::new(TransferExecutor::new()),
            ledger,
        ));
        let intake = Intake::new(
            projector,
            Arc::new(PendingQueue::new()),
            storage::shared(storage),
        );
        (dir, intake)
    }

    fn transfer(id: u8, amount: u64) -> Transaction {
        Transaction::new(
            B256::from([id; 32]),
            account(1),
            &Method::Transfer(Transfer {
                amount: U256::from(amount),
                to: account(2),
            }),
            0,
        )
    }

    #[test]
    fn overdraft_after_accepted_transfer_is_invalid() {
        let (_dir, intake) = intake();
        let a = intake.submit(transfer(1, 6)).expect("accept A");
        assert_eq!(a.position, 0);
        assert_eq!(a.simulated.settled_height, 0);

        let err = intake.submit(transfer(2, 6)).expect_err("B overdraws");
        assert!(matches!(
            err,
            IntakeError::Invalid(InvalidReason::InsufficientBalance { .. })
        ));
        assert_eq!(intake.pending_count(), 1);
    }

    #[test]
    fn duplicate_is_rejected_without_touching_state() {
        let (_dir, intake) = intake();
        intake.submit(transfer(1, 1)).expect("accept");
        let before = intake.projector().projected();

        let err = intake.submit(transfer(1, 1)).expect_err("duplicate");
        assert!(matches!(err, IntakeError::Duplicate { .. }));
        assert_eq!(intake.projector().projected(), before);
        assert_eq!(intake.pending_count(), 1);
    }

    #[test]
    fn simulate_only_previews() {
        let (_dir, intake) = intake();
        let withdrawal = Transaction::new(
            B256::from([9; 32]),
            account(1),
            &Method::Withdrawal(Withdrawal {
                amount: U256::from(4),
            }),
            0,
        );
        let preview = intake.simulate(&withdrawal).expect("simulate");
        assert_eq!(
            preview
                .resulting_state
                .balances
                .iter()
                .find(|entry| entry.account == account(1))
                .map(|entry| entry.balance),
            Some(U256::from(6))
        );
        assert_eq!(intake.pending_count(), 0);
        intake.submit(withdrawal).expect("still acceptable after preview");
    }

    #[test]
    fn concurrent_identical_ids_accept_exactly_one() {
        let (_dir, intake) = intake();
        let intake = Arc::new(intake);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let intake = Arc::clone(&intake);
                std::thread::spawn(move || intake.submit(transfer(5, 1)).is_ok())
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(intake.pending_count(), 1);
    }
}

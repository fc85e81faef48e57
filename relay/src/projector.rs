// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use alloy_primitives::B256;
use app_core::application::{Executor, InvalidReason, ReplayError};
use app_core::ledger::{Ledger, LedgerSnapshot};
use app_core::transaction::Transaction;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulatedResult {
    pub transaction_id: B256,
    pub resulting_state: LedgerSnapshot,
    pub settled_height: u64,
}

#[derive(Debug, Error)]
pub enum ProjectorError {
    #[error("batch {sequence_number} does not replay on the projected state: {source}")]
    Replay {
        sequence_number: u64,
        #[source]
        source: ReplayError,
    },
    #[error("pending transactions do not replay on the projected state: {source}")]
    PendingReplay {
        #[source]
        source: ReplayError,
    },
}

#[derive(Debug, Error)]
pub enum AcceptError<E> {
    #[error("invalid transaction: {0}")]
    Invalid(InvalidReason),
    #[error(transparent)]
    Admission(E),
}

/// Projection of a batch about to be sealed, computed on top of the sealed tip.
#[derive(Debug, Clone)]
pub struct SealedProjection {
    pub prev_state_root: B256,
    pub post_state_root: B256,
    post: Ledger,
}

/// Authoritative ledger plus the speculative overlay of everything not yet committed.
///
/// The overlay has two layers: `sealed_tip` (authoritative + sealed in-flight batches) and
/// `tip` (sealed tip + the pending queue, in queue order). Only the committer replaces the
/// authoritative ledger; readers get an `Arc` snapshot.
pub struct StateProjector {
    executor: Arc<dyn Executor>,
    authoritative: RwLock<Arc<Ledger>>,
    overlay: Mutex<Overlay>,
}

struct Overlay {
    sealed_tip: Ledger,
    tip: Ledger,
}

impl StateProjector {
    pub fn new(executor: Arc<dyn Executor>, ledger: Ledger) -> Self {
        Self {
            executor,
            authoritative: RwLock::new(Arc::new(ledger.clone())),
            overlay: Mutex::new(Overlay {
                sealed_tip: ledger.clone(),
                tip: ledger,
            }),
        }
    }

    /// Recomputes the overlay from the authoritative ledger, in-flight batches (in sequence
    /// order) and the pending queue.
    pub fn rebuild<'a>(
        executor: Arc<dyn Executor>,
        ledger: Ledger,
        in_flight: impl IntoIterator<Item = (u64, &'a [Transaction])>,
        pending: &[Transaction],
    ) -> Result<Self, ProjectorError> {
        let mut sealed_tip = ledger.clone();
        for (sequence_number, txs) in in_flight {
            executor
                .execute_all(&mut sealed_tip, txs)
                .map_err(|source| ProjectorError::Replay {
                    sequence_number,
                    source,
                })?;
            sealed_tip.advance_height();
        }

        let mut tip = sealed_tip.clone();
        executor
            .execute_all(&mut tip, pending)
            .map_err(|source| ProjectorError::PendingReplay { source })?;

        Ok(Self {
            executor,
            authoritative: RwLock::new(Arc::new(ledger)),
            overlay: Mutex::new(Overlay { sealed_tip, tip }),
        })
    }

    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.executor)
    }

    pub fn authoritative(&self) -> Arc<Ledger> {
        let guard = self
            .authoritative
            .read()
            .expect("authoritative ledger lock poisoned");
        Arc::clone(&guard)
    }

    pub fn settled_height(&self) -> u64 {
        self.authoritative().height()
    }

    /// Current overlay tip: what the state will be once everything accepted so far settles.
    pub fn projected(&self) -> LedgerSnapshot {
        self.lock_overlay().tip.snapshot()
    }

    /// Dry-run of `tx` against the overlay tip. Changes nothing.
    pub fn simulate(&self, tx: &Transaction) -> Result<SimulatedResult, InvalidReason> {
        let resulting = {
            let overlay = self.lock_overlay();
            self.executor.simulate(&overlay.tip, tx)?
        };
        Ok(self.result_for(tx, &resulting))
    }

    /// Simulates `tx` on the overlay tip and, if valid, runs `admit` and folds the effect into
    /// the tip. `admit` runs under the overlay lock so acceptance order equals queue order.
    pub fn accept<T, E>(
        &self,
        tx: &Transaction,
        admit: impl FnOnce() -> Result<T, E>,
    ) -> Result<(T, SimulatedResult), AcceptError<E>> {
        let mut overlay = self.lock_overlay();
        let resulting = self
            .executor
            .simulate(&overlay.tip, tx)
            .map_err(AcceptError::Invalid)?;
        let admitted = admit().map_err(AcceptError::Admission)?;
        let result = self.result_for(tx, &resulting);
        overlay.tip = resulting;
        Ok((admitted, result))
    }

    /// Replays `txs` on the sealed tip. Does not change the overlay; see [`Self::finish_seal`].
    pub fn prepare_seal(
        &self,
        sequence_number: u64,
        txs: &[Transaction],
    ) -> Result<SealedProjection, ProjectorError> {
        let overlay = self.lock_overlay();
        let mut post = overlay.sealed_tip.clone();
        self.executor
            .execute_all(&mut post, txs)
            .map_err(|source| ProjectorError::Replay {
                sequence_number,
                source,
            })?;
        post.advance_height();
        Ok(SealedProjection {
            prev_state_root: overlay.sealed_tip.state_root(),
            post_state_root: post.state_root(),
            post,
        })
    }

    pub fn finish_seal(&self, sealed: SealedProjection) {
        let mut overlay = self.lock_overlay();
        assert_eq!(
            overlay.sealed_tip.state_root(),
            sealed.prev_state_root,
            "sealed tip moved between prepare_seal and finish_seal"
        );
        overlay.sealed_tip = sealed.post;
    }

    pub fn install_authoritative(&self, ledger: Ledger) {
        let mut guard = self
            .authoritative
            .write()
            .expect("authoritative ledger lock poisoned");
        assert!(
            ledger.height() > guard.height(),
            "authoritative height must advance: {} -> {}",
            guard.height(),
            ledger.height()
        );
        *guard = Arc::new(ledger);
    }

    fn result_for(&self, tx: &Transaction, resulting: &Ledger) -> SimulatedResult {
        SimulatedResult {
            transaction_id: tx.id,
            resulting_state: resulting.snapshot(),
            settled_height: self.settled_height(),
        }
    }

    fn lock_overlay(&self) -> MutexGuard<'_, Overlay> {
        self.overlay.lock().expect("overlay lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::{AcceptError, StateProjector};
    use alloy_primitives::{Address, B256, U256};
    use app_core::application::{InvalidReason, Method, Transfer, TransferExecutor};
    use app_core::ledger::Ledger;
    use app_core::transaction::Transaction;
    use std::convert::Infallible;
    use std::sync::Arc;

    fn account(seed: u8) -> Address {
        Address::from_slice(&[seed; 20])
    }

    fn transfer(id: u8, from: u8, to: u8, amount: u64) -> Transaction {
        Transaction::new(
            B256::from([id; 32]),
            account(from),
            &Method::Transfer(Transfer {
                amount: U256::from(amount),
                to: account(to),
            }),
            0,
        )
    }

    fn projector() -> StateProjector {
        let ledger = Ledger::genesis([(account(1), U256::from(10)), (account(2), U256::ZERO)]);
        StateProjector::new(Arc::new(TransferExecutor::new()), ledger)
    }

    fn accept(projector: &StateProjector, tx: &Transaction) -> Result<(), InvalidReason> {
        match projector.accept(tx, || Ok::<_, Infallible>(())) {
            Ok(_) => Ok(()),
            Err(AcceptError::Invalid(reason)) => Err(reason),
            Err(AcceptError::Admission(never)) => match never {},
        }
    }

    #[test]
    fn second_transfer_fails_once_first_is_in_overlay() {
        let projector = projector();
        let a = transfer(1, 1, 2, 7);
        let b = transfer(2, 1, 2, 7);

        let simulated = projector.simulate(&a).expect("simulate A");
        assert_eq!(simulated.settled_height, 0);
        accept(&projector, &a).expect("accept A");

        let err = projector.simulate(&b).expect_err("B overdraws after A");
        assert_eq!(
            err,
            InvalidReason::InsufficientBalance {
                required: U256::from(7),
                available: U256::from(3),
            }
        );
        assert!(accept(&projector, &b).is_err());
        // Authoritative state is untouched by simulation and acceptance.
        assert_eq!(
            projector.authoritative().balance_of(&account(1)),
            Some(U256::from(10))
        );
    }

    #[test]
    fn simulate_does_not_change_overlay() {
        let projector = projector();
        let before = projector.projected();
        projector
            .simulate(&transfer(1, 1, 2, 5))
            .expect("simulate");
        assert_eq!(projector.projected(), before);
    }

    #[test]
    fn failed_admission_leaves_overlay_unchanged() {
        let projector = projector();
        let before = projector.projected();
        let result = projector.accept(&transfer(1, 1, 2, 5), || Err::<(), _>("storage down"));
        assert!(matches!(result, Err(AcceptError::Admission("storage down"))));
        assert_eq!(projector.projected(), before);
    }

    #[test]
    fn seal_chains_roots_and_matches_tip() {
        let projector = projector();
        let txs = vec![transfer(1, 1, 2, 4), transfer(2, 1, 2, 1)];
        for tx in &txs {
            accept(&projector, tx).expect("accept");
        }

        let genesis_root = projector.authoritative().state_root();
        let sealed = projector.prepare_seal(1, &txs).expect("prepare seal");
        assert_eq!(sealed.prev_state_root, genesis_root);
        assert_eq!(sealed.post_state_root, projector.projected().state_root);
        projector.finish_seal(sealed.clone());

        let next = projector.prepare_seal(2, &[]).expect("empty replay");
        assert_eq!(next.prev_state_root, sealed.post_state_root);
    }

    #[test]
    fn rebuild_reapplies_in_flight_and_pending() {
        let ledger = Ledger::genesis([(account(1), U256::from(10)), (account(2), U256::ZERO)]);
        let in_flight = vec![transfer(1, 1, 2, 3)];
        let pending = vec![transfer(2, 1, 2, 2)];

        let projector = StateProjector::rebuild(
            Arc::new(TransferExecutor::new()),
            ledger,
            [(1_u64, in_flight.as_slice())],
            &pending,
        )
        .expect("rebuild");

        let projected = projector.projected();
        assert_eq!(projected.height, 1);
        assert_eq!(
            projected
                .balances
                .iter()
                .find(|entry| entry.account == account(1))
                .map(|entry| entry.balance),
            Some(U256::from(5))
        );
        assert_eq!(projector.settled_height(), 0);
    }
}

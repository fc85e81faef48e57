// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::HashSet;
use std::sync::Mutex;

use alloy_primitives::B256;
use app_core::transaction::Transaction;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("duplicate transaction id {id}")]
    Duplicate { id: B256 },
}

/// Ordered buffer of accepted transactions waiting to be sealed into a batch.
///
/// Every id ever enqueued stays in `seen`, so duplicates are rejected for the lifetime of the
/// process (and across restarts, once `restore` is fed the persisted ids). Enqueue and drain
/// share one lock, so a drain never splits or repeats a concurrent enqueue.
#[derive(Debug, Default)]
pub struct PendingQueue {
    inner: Mutex<QueueInner>,
}

#[derive(Debug, Default)]
struct QueueInner {
    txs: Vec<Transaction>,
    seen: HashSet<B256>,
    next_position: u64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the queue after a restart. `seen` must already include the pending ids.
    pub fn restore(seen: impl IntoIterator<Item = B256>, pending: Vec<Transaction>) -> Self {
        let mut seen: HashSet<B256> = seen.into_iter().collect();
        seen.extend(pending.iter().map(|tx| tx.id));
        let next_position = pending.len() as u64;
        Self {
            inner: Mutex::new(QueueInner {
                txs: pending,
                seen,
                next_position,
            }),
        }
    }

    pub fn contains(&self, id: &B256) -> bool {
        self.lock().seen.contains(id)
    }

    /// Appends `tx` and returns its position since process start.
    pub fn enqueue(&self, tx: Transaction) -> Result<u64, QueueError> {
        let mut inner = self.lock();
        if !inner.seen.insert(tx.id) {
            return Err(QueueError::Duplicate { id: tx.id });
        }
        let position = inner.next_position;
        inner.next_position = inner.next_position.saturating_add(1);
        inner.txs.push(tx);
        Ok(position)
    }

    pub fn drain(&self) -> Vec<Transaction> {
        std::mem::take(&mut self.lock().txs)
    }

    /// Drains at most `max` transactions from the front, keeping the rest queued in order.
    pub fn drain_up_to(&self, max: usize) -> Vec<Transaction> {
        let mut inner = self.lock();
        if inner.txs.len() <= max {
            return std::mem::take(&mut inner.txs);
        }
        let rest = inner.txs.split_off(max);
        std::mem::replace(&mut inner.txs, rest)
    }

    /// Snapshot of the queued transactions in order.
    pub fn pending(&self) -> Vec<Transaction> {
        self.lock().txs.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("pending queue lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::{PendingQueue, QueueError};
    use alloy_primitives::{Address, B256};
    use app_core::transaction::Transaction;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn tx_with_id(id: u64) -> Transaction {
        let mut bytes = [0_u8; 32];
        bytes[24..].copy_from_slice(&id.to_be_bytes());
        Transaction {
            id: B256::from(bytes),
            sender: Address::ZERO,
            payload: vec![0x01],
            submitted_at: id,
        }
    }

    #[test]
    fn duplicate_is_rejected_and_queue_unchanged() {
        let queue = PendingQueue::new();
        assert_eq!(queue.enqueue(tx_with_id(1)).expect("first"), 0);
        assert_eq!(queue.enqueue(tx_with_id(2)).expect("second"), 1);

        let err = queue.enqueue(tx_with_id(1)).expect_err("duplicate");
        assert_eq!(
            err,
            QueueError::Duplicate {
                id: tx_with_id(1).id
            }
        );
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn ids_stay_seen_after_drain() {
        let queue = PendingQueue::new();
        queue.enqueue(tx_with_id(7)).expect("enqueue");
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());

        assert!(queue.contains(&tx_with_id(7).id));
        assert!(queue.enqueue(tx_with_id(7)).is_err());
    }

    #[test]
    fn drain_up_to_keeps_remaining_order() {
        let queue = PendingQueue::new();
        for id in 0..5 {
            queue.enqueue(tx_with_id(id)).expect("enqueue");
        }

        let first = queue.drain_up_to(2);
        assert_eq!(first, vec![tx_with_id(0), tx_with_id(1)]);
        let rest = queue.drain_up_to(10);
        assert_eq!(rest, vec![tx_with_id(2), tx_with_id(3), tx_with_id(4)]);
        assert!(queue.drain_up_to(10).is_empty());
    }

    #[test]
    fn restore_rejects_previously_batched_ids() {
        let queue = PendingQueue::restore([tx_with_id(1).id], vec![tx_with_id(2)]);
        assert_eq!(queue.len(), 1);
        assert!(queue.enqueue(tx_with_id(1)).is_err());
        assert!(queue.enqueue(tx_with_id(2)).is_err());
        assert_eq!(queue.enqueue(tx_with_id(3)).expect("fresh id"), 1);
    }

    #[test]
    fn concurrent_enqueue_and_drain_lose_and_duplicate_nothing() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 500;

        let queue = Arc::new(PendingQueue::new());
        let mut producers = Vec::new();
        for producer in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            producers.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue
                        .enqueue(tx_with_id(producer * PER_PRODUCER + i))
                        .expect("unique id");
                }
            }));
        }

        let mut drained = Vec::new();
        while producers.iter().any(|handle| !handle.is_finished()) {
            drained.extend(queue.drain());
        }
        for handle in producers {
            handle.join().expect("join producer");
        }
        drained.extend(queue.drain());

        let total = (PRODUCERS * PER_PRODUCER) as usize;
        assert_eq!(drained.len(), total);
        let unique: HashSet<B256> = drained.iter().map(|tx| tx.id).collect();
        assert_eq!(unique.len(), total);
    }

    #[test]
    fn concurrent_identical_ids_accept_exactly_one() {
        let queue = Arc::new(PendingQueue::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || queue.enqueue(tx_with_id(42)).is_ok())
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(queue.len(), 1);
    }
}

// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;

use crate::batch::{Batch, BatchFailure, BatchStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchView {
    pub sequence_number: u64,
    pub status: BatchStatus,
    pub finalized: bool,
    pub tx_count: usize,
    pub attempts: u32,
    pub inclusion_height: Option<u64>,
    pub da_finalized_height: Option<u64>,
    pub failure: Option<BatchFailure>,
}

impl BatchView {
    pub fn of(batch: &Batch) -> Self {
        Self {
            sequence_number: batch.sequence_number,
            status: batch.status,
            finalized: batch.status.is_finalized(),
            tx_count: batch.transaction_count(),
            attempts: batch.attempts,
            inclusion_height: batch.inclusion_height,
            da_finalized_height: batch.da_finalized_height,
            failure: batch.failure.clone(),
        }
    }
}

/// Pipeline halted by an integrity fault; nothing at or after `sequence_number` commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Halt {
    pub sequence_number: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub settled_height: u64,
    pub da_finalized_height: Option<u64>,
    pub in_flight: Vec<BatchView>,
    pub halted: Option<Halt>,
}

/// In-memory view of every uncommitted batch plus the settled and DA finalized heights.
#[derive(Debug)]
pub struct PipelineStatus {
    inner: Mutex<StatusInner>,
    settled: watch::Sender<u64>,
}

#[derive(Debug, Default)]
struct StatusInner {
    batches: BTreeMap<u64, BatchView>,
    da_finalized_height: Option<u64>,
    halted: Option<Halt>,
}

impl PipelineStatus {
    pub fn new(settled_height: u64) -> Self {
        let (settled, _) = watch::channel(settled_height);
        Self {
            inner: Mutex::new(StatusInner::default()),
            settled,
        }
    }

    pub fn record(&self, batch: &Batch) {
        let mut inner = self.lock();
        if batch.status == BatchStatus::Committed {
            inner.batches.remove(&batch.sequence_number);
        } else {
            inner
                .batches
                .insert(batch.sequence_number, BatchView::of(batch));
        }
        if let Some(height) = batch.da_finalized_height {
            inner.da_finalized_height = Some(inner.da_finalized_height.map_or(height, |h| h.max(height)));
        }
    }

    pub fn observe_da_finalized(&self, height: u64) {
        let mut inner = self.lock();
        inner.da_finalized_height = Some(inner.da_finalized_height.map_or(height, |h| h.max(height)));
    }

    pub fn da_finalized_height(&self) -> Option<u64> {
        self.lock().da_finalized_height
    }

    pub fn batch(&self, sequence_number: u64) -> Option<BatchView> {
        self.lock().batches.get(&sequence_number).cloned()
    }

    pub fn settled_height(&self) -> u64 {
        *self.settled.borrow()
    }

    pub fn set_settled_height(&self, height: u64) {
        self.settled.send_if_modified(|current| {
            assert!(height >= *current, "settled height must not go backwards");
            let changed = height != *current;
            *current = height;
            changed
        });
    }

    pub fn subscribe_settled(&self) -> watch::Receiver<u64> {
        self.settled.subscribe()
    }

    pub fn halt(&self, sequence_number: u64, reason: String) {
        let mut inner = self.lock();
        if inner.halted.is_none() {
            inner.halted = Some(Halt {
                sequence_number,
                reason,
            });
        }
    }

    pub fn halted(&self) -> Option<Halt> {
        self.lock().halted.clone()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.lock();
        StatusSnapshot {
            settled_height: self.settled_height(),
            da_finalized_height: inner.da_finalized_height,
            in_flight: inner.batches.values().cloned().collect(),
            halted: inner.halted.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.inner.lock().expect("pipeline status lock poisoned")
    }
}

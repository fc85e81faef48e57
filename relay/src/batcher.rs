// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;

use crate::batch::Batch;
use crate::pending_queue::PendingQueue;
use crate::projector::{ProjectorError, StateProjector};
use crate::shutdown::StopSignal;
use crate::status::PipelineStatus;
use crate::storage::{self, SharedStorage, now_unix_ms};
use crate::submitter::SubmitterCommand;

#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    pub interval: Duration,
    pub max_batch_txs: usize,
}

#[derive(Debug, Error)]
pub enum BatcherError {
    #[error("batcher shutdown requested")]
    ShutdownRequested,
    #[error("submitter input channel closed")]
    SubmitterClosed,
    #[error("drained transactions do not replay on the sealed tip")]
    Projection {
        #[source]
        source: ProjectorError,
    },
    #[error("cannot persist sealed batch {sequence_number}")]
    Persist {
        sequence_number: u64,
        #[source]
        source: rusqlite::Error,
    },
}

/// Seals the pending queue into numbered batches on a fixed interval.
pub struct Batcher {
    queue: Arc<PendingQueue>,
    projector: Arc<StateProjector>,
    storage: SharedStorage,
    status: Arc<PipelineStatus>,
    submitter: mpsc::Sender<SubmitterCommand>,
    config: BatcherConfig,
    next_sequence_number: u64,
}

impl Batcher {
    pub fn new(
        queue: Arc<PendingQueue>,
        projector: Arc<StateProjector>,
        storage: SharedStorage,
        status: Arc<PipelineStatus>,
        submitter: mpsc::Sender<SubmitterCommand>,
        config: BatcherConfig,
        next_sequence_number: u64,
    ) -> Self {
        assert!(next_sequence_number > 0, "sequence numbers start at 1");
        Self {
            queue,
            projector,
            storage,
            status,
            submitter,
            config,
            next_sequence_number,
        }
    }

    pub fn spawn(self, stop: StopSignal) -> JoinHandle<BatcherError> {
        tokio::spawn(self.run(stop))
    }

    async fn run(mut self, mut stop: StopSignal) -> BatcherError {
        let period = self.config.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.requested() => return BatcherError::ShutdownRequested,
                _ = ticker.tick() => {
                    if let Err(err) = self.seal_next().await {
                        return err;
                    }
                }
            }
        }
    }

    /// Drains up to `max_batch_txs` transactions into the next batch and hands it to the
    /// submitter. An empty queue produces no batch.
    pub async fn seal_next(&mut self) -> Result<Option<u64>, BatcherError> {
        let txs = self.queue.drain_up_to(self.config.max_batch_txs.max(1));
        if txs.is_empty() {
            return Ok(None);
        }

        let sequence_number = self.next_sequence_number;
        let projection = self
            .projector
            .prepare_seal(sequence_number, &txs)
            .map_err(|source| BatcherError::Projection { source })?;
        let batch = Batch::seal(
            sequence_number,
            txs,
            projection.prev_state_root,
            projection.post_state_root,
            now_unix_ms(),
        );

        let sealed = batch.clone();
        storage::blocking(&self.storage, move |storage| storage.seal_batch(&sealed))
            .await
            .map_err(|source| BatcherError::Persist {
                sequence_number,
                source,
            })?;
        self.projector.finish_seal(projection);
        self.status.record(&batch);
        self.next_sequence_number = sequence_number.saturating_add(1);
        info!(
            sequence_number,
            tx_count = batch.transaction_count(),
            blob_bytes = batch.blob.len(),
            "batch sealed"
        );

        self.submitter
            .send(SubmitterCommand::Track(batch))
            .await
            .map_err(|_| BatcherError::SubmitterClosed)?;
        Ok(Some(sequence_number))
    }
}

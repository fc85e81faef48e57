// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{BroadcastBatchMessage, CommitError, Committer};
use crate::batch::{Batch, BatchFailure};
use crate::da::DaClient;
use crate::shutdown::StopSignal;
use crate::status::PipelineStatus;
use crate::storage::{self, SharedStorage};
use crate::verifier::{MismatchError, Verifier, VerifyError};

#[derive(Debug, Clone, Copy)]
pub struct CommitLaneConfig {
    // How long to wait before re-reading a batch the DA layer failed to serve.
    pub da_retry_interval: Duration,
}

#[derive(Debug, Error)]
pub enum CommitLaneError {
    #[error("commit lane shutdown requested")]
    ShutdownRequested,
    #[error("finalized batch channel closed")]
    InputClosed,
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error("cannot persist mismatch of batch {sequence_number}")]
    PersistMismatch {
        sequence_number: u64,
        #[source]
        source: rusqlite::Error,
    },
}

/// Receives batches that reached DA finality, in any order, and verifies and commits them
/// strictly by sequence number. A batch waits in `ready` until every predecessor committed.
///
/// A verification mismatch halts the lane for good: the offending batch is marked failed,
/// the halt is published, and nothing at or after it commits in this process.
pub struct CommitLane<D: DaClient> {
    finalized: mpsc::Receiver<Batch>,
    verifier: Verifier<D>,
    committer: Committer,
    storage: SharedStorage,
    status: Arc<PipelineStatus>,
    config: CommitLaneConfig,
    ready: BTreeMap<u64, Batch>,
    halted: bool,
}

impl<D: DaClient> CommitLane<D> {
    pub fn new(
        finalized: mpsc::Receiver<Batch>,
        verifier: Verifier<D>,
        committer: Committer,
        storage: SharedStorage,
        status: Arc<PipelineStatus>,
        config: CommitLaneConfig,
    ) -> Self {
        let halted = status.halted().is_some();
        Self {
            finalized,
            verifier,
            committer,
            storage,
            status,
            config,
            ready: BTreeMap::new(),
            halted,
        }
    }

    pub fn spawn(self, stop: StopSignal) -> JoinHandle<CommitLaneError> {
        tokio::spawn(self.run(stop))
    }

    async fn run(mut self, mut stop: StopSignal) -> CommitLaneError {
        let mut da_backlog = false;
        loop {
            // Batches already handed over are drained before a stop request is honored.
            tokio::select! {
                biased;
                received = self.finalized.recv() => {
                    let Some(batch) = received else {
                        return CommitLaneError::InputClosed;
                    };
                    self.buffer(batch);
                }
                _ = stop.requested() => return CommitLaneError::ShutdownRequested,
                _ = tokio::time::sleep(self.config.da_retry_interval), if da_backlog => {}
            }

            match self.advance().await {
                Ok(backlog) => da_backlog = backlog,
                Err(err) => return err,
            }
        }
    }

    fn buffer(&mut self, batch: Batch) {
        let sequence_number = batch.sequence_number;
        if sequence_number < self.committer.next_sequence_number() {
            debug!(sequence_number, "ignoring already committed batch");
            return;
        }
        if self.halted {
            debug!(sequence_number, "commit lane halted, batch stays uncommitted");
        }
        self.status.record(&batch);
        self.ready.insert(sequence_number, batch);
    }

    /// Commits every buffered batch that is next in line. Returns true when the next batch is
    /// buffered but the DA layer could not serve it.
    pub async fn advance(&mut self) -> Result<bool, CommitLaneError> {
        while !self.halted {
            let next = self.committer.next_sequence_number();
            let Some(batch) = self.ready.remove(&next) else {
                return Ok(false);
            };

            let base = self.committer.base();
            match self.verifier.verify(&batch, &base).await {
                Ok(verified) => {
                    info!(sequence_number = next, "batch verified against da");
                    self.status.record(&verified.batch);
                    self.committer.commit(verified).await?;
                }
                Err(VerifyError::Da { source }) => {
                    warn!(
                        sequence_number = next,
                        error = %source,
                        "cannot read finalized batch from da, will retry"
                    );
                    self.ready.insert(next, batch);
                    return Ok(true);
                }
                Err(VerifyError::Mismatch(mismatch)) => self.halt(batch, mismatch).await?,
            }
        }
        Ok(false)
    }

    async fn halt(
        &mut self,
        mut batch: Batch,
        mismatch: MismatchError,
    ) -> Result<(), CommitLaneError> {
        let sequence_number = batch.sequence_number;
        let reason = mismatch.to_string();
        error!(
            sequence_number,
            error = %mismatch,
            "da copy of batch does not match local replay, halting commits"
        );

        batch.record_failure(BatchFailure::Mismatch {
            message: reason.clone(),
        });
        let failed = batch.clone();
        storage::blocking(&self.storage, move |storage| {
            storage.update_batch_progress(&failed)
        })
        .await
        .map_err(|source| CommitLaneError::PersistMismatch {
            sequence_number,
            source,
        })?;
        self.status.record(&batch);
        self.status.halt(sequence_number, reason.clone());
        self.committer
            .broadcaster()
            .publish(BroadcastBatchMessage::Halted {
                sequence_number,
                reason,
            });
        self.halted = true;
        Ok(())
    }
}

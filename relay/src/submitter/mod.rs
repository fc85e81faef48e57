// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

mod backoff;
mod error;
mod tracker;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info};

use crate::batch::{Batch, BatchStatus};
use crate::da::DaClient;
use crate::shutdown::StopSignal;
use crate::status::PipelineStatus;
use crate::storage::{self, SharedStorage};

pub use backoff::Backoff;
pub use error::{RetryCause, RetryError, SubmitterError, TrackerError};
pub use tracker::{FinalityTracker, TrackerOutcome};

#[derive(Debug, Clone, Copy)]
pub struct SubmitterConfig {
    pub app_id: u32,
    pub poll_interval: Duration,
    // Window to see the blob at its receipt height before resubmitting.
    pub inclusion_timeout: Duration,
    // Window to see finality before a retry is charged and polling restarts.
    pub finality_timeout: Duration,
    pub retry_budget: u32,
    pub backoff: Backoff,
    pub shutdown_grace: Duration,
}

#[derive(Debug)]
pub enum SubmitterCommand {
    /// A freshly sealed batch.
    Track(Batch),
    /// Operator request to resubmit a batch that exhausted its retry budget.
    Retry {
        sequence_number: u64,
        respond_to: oneshot::Sender<Result<(), RetryError>>,
    },
}

type TrackerResult = Result<Result<TrackerOutcome, TrackerError>, JoinError>;

/// Supervises one [`FinalityTracker`] task per in-flight batch and forwards final batches,
/// in completion order, to the commit lane. Failed batches are parked until an operator
/// retries them.
pub struct Submitter<D: DaClient> {
    commands: mpsc::Receiver<SubmitterCommand>,
    tracker: Arc<FinalityTracker<D>>,
    storage: SharedStorage,
    status: Arc<PipelineStatus>,
    finalized: mpsc::Sender<Batch>,
    failed: BTreeMap<u64, Batch>,
}

impl<D: DaClient> Submitter<D> {
    pub fn new(
        commands: mpsc::Receiver<SubmitterCommand>,
        da: Arc<D>,
        storage: SharedStorage,
        status: Arc<PipelineStatus>,
        finalized: mpsc::Sender<Batch>,
        config: SubmitterConfig,
    ) -> Self {
        let tracker = FinalityTracker::new(da, storage.clone(), Arc::clone(&status), config);
        Self {
            commands,
            tracker: Arc::new(tracker),
            storage,
            status,
            finalized,
            failed: BTreeMap::new(),
        }
    }

    /// Runs until shutdown. `resume` are the uncommitted batches found in storage at start.
    pub fn spawn(self, resume: Vec<Batch>, stop: StopSignal) -> JoinHandle<SubmitterError> {
        tokio::spawn(self.run(resume, stop))
    }

    async fn run(mut self, resume: Vec<Batch>, mut stop: StopSignal) -> SubmitterError {
        let mut trackers: JoinSet<Result<TrackerOutcome, TrackerError>> = JoinSet::new();
        for batch in resume {
            if let Err(err) = self.dispatch(batch, &mut trackers, &stop).await {
                return err;
            }
        }

        loop {
            tokio::select! {
                _ = stop.requested() => break,
                command = self.commands.recv() => match command {
                    Some(SubmitterCommand::Track(batch)) => {
                        if let Err(err) = self.dispatch(batch, &mut trackers, &stop).await {
                            return err;
                        }
                    }
                    Some(SubmitterCommand::Retry { sequence_number, respond_to }) => {
                        let result = self.retry(sequence_number, &mut trackers, &stop).await;
                        let _ = respond_to.send(result);
                    }
                    None => break,
                },
                Some(joined) = trackers.join_next(), if !trackers.is_empty() => {
                    if let Err(err) = self.on_tracker_done(joined).await {
                        return err;
                    }
                }
            }
        }

        // Trackers observe the same stop signal; included batches may still finish here.
        while let Some(joined) = trackers.join_next().await {
            if let Err(err) = self.on_tracker_done(joined).await {
                return err;
            }
        }
        SubmitterError::ShutdownRequested
    }

    async fn dispatch(
        &mut self,
        batch: Batch,
        trackers: &mut JoinSet<Result<TrackerOutcome, TrackerError>>,
        stop: &StopSignal,
    ) -> Result<(), SubmitterError> {
        match batch.status {
            BatchStatus::Final | BatchStatus::Verified => self.forward(batch).await,
            BatchStatus::Failed => {
                self.status.record(&batch);
                self.failed.insert(batch.sequence_number, batch);
                Ok(())
            }
            BatchStatus::Committed => Ok(()),
            BatchStatus::Pending | BatchStatus::Submitted | BatchStatus::Included => {
                let tracker = Arc::clone(&self.tracker);
                let stop = stop.clone();
                trackers.spawn(async move { tracker.drive(batch, stop).await });
                Ok(())
            }
        }
    }

    async fn on_tracker_done(&mut self, joined: TrackerResult) -> Result<(), SubmitterError> {
        let outcome = joined
            .map_err(|source| SubmitterError::Join { source })?
            .map_err(SubmitterError::Tracker)?;
        match outcome {
            TrackerOutcome::Final(batch) => self.forward(batch).await,
            TrackerOutcome::Failed(batch) => {
                self.failed.insert(batch.sequence_number, batch);
                Ok(())
            }
            TrackerOutcome::Cancelled(batch) => {
                debug!(
                    sequence_number = batch.sequence_number,
                    status = batch.status.as_str(),
                    "batch tracking cancelled"
                );
                Ok(())
            }
        }
    }

    async fn forward(&self, batch: Batch) -> Result<(), SubmitterError> {
        self.finalized
            .send(batch)
            .await
            .map_err(|_| SubmitterError::CommitLaneClosed)
    }

    async fn retry(
        &mut self,
        sequence_number: u64,
        trackers: &mut JoinSet<Result<TrackerOutcome, TrackerError>>,
        stop: &StopSignal,
    ) -> Result<(), RetryError> {
        let Some(parked) = self.failed.get(&sequence_number) else {
            return Err(self.explain_not_parked(sequence_number).await);
        };
        if let Some(failure) = &parked.failure
            && !failure.is_retryable()
        {
            return Err(RetryError::NotRetryable { sequence_number });
        }

        let mut batch = parked.clone();
        batch.reset_for_retry();
        let progress = batch.clone();
        storage::blocking(&self.storage, move |storage| {
            storage.update_batch_progress(&progress)
        })
        .await
        .map_err(|source| RetryError::Storage {
            sequence_number,
            source,
        })?;
        self.failed.remove(&sequence_number);
        self.status.record(&batch);
        info!(sequence_number, "operator retry: batch resubmitted with a fresh budget");

        let tracker = Arc::clone(&self.tracker);
        let stop = stop.clone();
        trackers.spawn(async move { tracker.drive(batch, stop).await });
        Ok(())
    }

    async fn explain_not_parked(&self, sequence_number: u64) -> RetryError {
        let stored = storage::blocking(&self.storage, move |storage| {
            storage.load_batch(sequence_number)
        })
        .await;
        match stored {
            Ok(None) => RetryError::NotFound { sequence_number },
            // Retryable failures are parked once their tracker task returns.
            Ok(Some(batch)) if batch.status == BatchStatus::Failed => match &batch.failure {
                Some(failure) if failure.is_retryable() => RetryError::Busy { sequence_number },
                _ => RetryError::NotRetryable { sequence_number },
            },
            Ok(Some(batch)) => RetryError::NotFailed {
                sequence_number,
                status: batch.status,
            },
            Err(source) => RetryError::Storage {
                sequence_number,
                source,
            },
        }
    }
}

// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::SubmitterConfig;
use super::error::{RetryCause, TrackerError};
use crate::batch::{Batch, BatchFailure, BatchStatus};
use crate::da::DaClient;
use crate::shutdown::StopSignal;
use crate::status::PipelineStatus;
use crate::storage::{self, SharedStorage};

#[derive(Debug)]
pub enum TrackerOutcome {
    /// DA finalized height reached the inclusion height.
    Final(Batch),
    /// Retry budget exhausted; waits for an operator.
    Failed(Batch),
    /// Shutdown interrupted tracking. Persisted status is where a restart resumes.
    Cancelled(Batch),
}

enum Step {
    Continue,
    Done(TrackerOutcome),
}

/// Drives one batch through PENDING -> SUBMITTED -> INCLUDED -> FINAL against the DA layer.
///
/// Every transition is persisted before it is reported, so a restart resumes from the last
/// persisted status. Shutdown cancels PENDING and SUBMITTED batches right away; an INCLUDED
/// batch keeps being polled until it is final or the shutdown grace period runs out.
pub struct FinalityTracker<D> {
    da: Arc<D>,
    storage: SharedStorage,
    status: Arc<PipelineStatus>,
    config: SubmitterConfig,
}

impl<D: DaClient> FinalityTracker<D> {
    pub fn new(
        da: Arc<D>,
        storage: SharedStorage,
        status: Arc<PipelineStatus>,
        config: SubmitterConfig,
    ) -> Self {
        Self {
            da,
            storage,
            status,
            config,
        }
    }

    pub async fn drive(
        &self,
        mut batch: Batch,
        mut stop: StopSignal,
    ) -> Result<TrackerOutcome, TrackerError> {
        self.status.record(&batch);
        loop {
            let step = match batch.status {
                BatchStatus::Pending => self.submit(&mut batch, &mut stop).await?,
                BatchStatus::Submitted => self.await_inclusion(&mut batch, &mut stop).await?,
                BatchStatus::Included => self.await_finality(&mut batch, &stop).await?,
                BatchStatus::Final | BatchStatus::Verified | BatchStatus::Committed => {
                    Step::Done(TrackerOutcome::Final(batch.clone()))
                }
                BatchStatus::Failed => Step::Done(TrackerOutcome::Failed(batch.clone())),
            };
            if let Step::Done(outcome) = step {
                return Ok(outcome);
            }
        }
    }

    async fn submit(&self, batch: &mut Batch, stop: &mut StopSignal) -> Result<Step, TrackerError> {
        if stop.is_requested() {
            return Ok(cancelled(batch));
        }
        let result = tokio::select! {
            result = self.da.submit(self.config.app_id, batch.blob.as_slice()) => result,
            _ = stop.requested() => return Ok(cancelled(batch)),
        };

        match result {
            Ok(receipt) => {
                batch.status = BatchStatus::Submitted;
                batch.inclusion_height = Some(receipt.block_number);
                self.persist(batch).await?;
                info!(
                    sequence_number = batch.sequence_number,
                    da_height = receipt.block_number,
                    "batch submitted"
                );
                Ok(Step::Continue)
            }
            Err(source) => self.retry(batch, stop, RetryCause::Submission { source }).await,
        }
    }

    async fn await_inclusion(
        &self,
        batch: &mut Batch,
        stop: &mut StopSignal,
    ) -> Result<Step, TrackerError> {
        let Some(da_height) = batch.inclusion_height else {
            // Submitted without a receipt height cannot be polled; submit again.
            batch.status = BatchStatus::Pending;
            self.persist(batch).await?;
            return Ok(Step::Continue);
        };
        let started = Instant::now();

        loop {
            if stop.is_requested() {
                return Ok(cancelled(batch));
            }
            match self.da.query_inclusion(self.config.app_id, da_height).await {
                Ok(blobs) if blobs.iter().any(|blob| batch.is_claimed_by(blob)) => {
                    batch.status = BatchStatus::Included;
                    self.persist(batch).await?;
                    info!(
                        sequence_number = batch.sequence_number,
                        da_height, "batch included"
                    );
                    return Ok(Step::Continue);
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(sequence_number = batch.sequence_number, error = %err, "inclusion query failed");
                }
            }

            let waited = started.elapsed();
            if waited >= self.config.inclusion_timeout {
                batch.inclusion_height = None;
                batch.status = BatchStatus::Pending;
                let cause = RetryCause::InclusionTimeout { da_height, waited };
                return self.retry(batch, stop, cause).await;
            }
            if !pause(stop, self.config.poll_interval).await {
                return Ok(cancelled(batch));
            }
        }
    }

    async fn await_finality(
        &self,
        batch: &mut Batch,
        stop: &StopSignal,
    ) -> Result<Step, TrackerError> {
        let Some(inclusion_height) = batch.inclusion_height else {
            batch.status = BatchStatus::Pending;
            self.persist(batch).await?;
            return Ok(Step::Continue);
        };
        let mut started = Instant::now();
        let mut grace_deadline: Option<Instant> = None;

        loop {
            if stop.is_requested() {
                let deadline =
                    *grace_deadline.get_or_insert_with(|| Instant::now() + self.config.shutdown_grace);
                if Instant::now() >= deadline {
                    warn!(
                        sequence_number = batch.sequence_number,
                        inclusion_height, "shutdown grace elapsed; batch stays included for restart"
                    );
                    return Ok(cancelled(batch));
                }
            }

            match self.da.query_finality().await {
                Ok(finalized) => {
                    self.status.observe_da_finalized(finalized);
                    batch.da_finalized_height = Some(finalized);
                    if finalized >= inclusion_height {
                        batch.status = BatchStatus::Final;
                        self.persist(batch).await?;
                        info!(
                            sequence_number = batch.sequence_number,
                            inclusion_height,
                            da_finalized_height = finalized,
                            "batch final"
                        );
                        return Ok(Step::Done(TrackerOutcome::Final(batch.clone())));
                    }
                    self.status.record(batch);
                }
                Err(err) => {
                    debug!(sequence_number = batch.sequence_number, error = %err, "finality query failed");
                }
            }

            let waited = started.elapsed();
            if waited >= self.config.finality_timeout {
                let cause = RetryCause::FinalityTimeout {
                    inclusion_height,
                    finalized_height: batch.da_finalized_height,
                    waited,
                };
                if self.charge(batch, cause).await? {
                    return Ok(Step::Done(TrackerOutcome::Failed(batch.clone())));
                }
                // The blob may have been dropped from the chain; resubmit if it is gone.
                if let Ok(blobs) = self
                    .da
                    .query_inclusion(self.config.app_id, inclusion_height)
                    .await
                    && !blobs.iter().any(|blob| batch.is_claimed_by(blob))
                {
                    warn!(
                        sequence_number = batch.sequence_number,
                        inclusion_height, "included blob disappeared; resubmitting"
                    );
                    batch.status = BatchStatus::Pending;
                    batch.inclusion_height = None;
                    self.persist(batch).await?;
                    return Ok(Step::Continue);
                }
                started = Instant::now();
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Charges `cause` and, unless the budget is spent, waits out the backoff.
    async fn retry(
        &self,
        batch: &mut Batch,
        stop: &mut StopSignal,
        cause: RetryCause,
    ) -> Result<Step, TrackerError> {
        if self.charge(batch, cause).await? {
            return Ok(Step::Done(TrackerOutcome::Failed(batch.clone())));
        }
        let delay = self.config.backoff.delay(batch.attempts);
        if !pause(stop, delay).await {
            return Ok(cancelled(batch));
        }
        Ok(Step::Continue)
    }

    /// Returns true when the batch just moved to FAILED.
    async fn charge(&self, batch: &mut Batch, cause: RetryCause) -> Result<bool, TrackerError> {
        batch.attempts = batch.attempts.saturating_add(1);
        if batch.attempts > self.config.retry_budget {
            batch.record_failure(BatchFailure::RetryBudgetExhausted {
                message: cause.to_string(),
            });
            self.persist(batch).await?;
            error!(
                sequence_number = batch.sequence_number,
                attempts = batch.attempts,
                error = %cause,
                "retry budget exhausted; batch failed"
            );
            return Ok(true);
        }

        self.persist(batch).await?;
        warn!(
            sequence_number = batch.sequence_number,
            attempts = batch.attempts,
            error = %cause,
            "batch retry"
        );
        Ok(false)
    }

    async fn persist(&self, batch: &Batch) -> Result<(), TrackerError> {
        let progress = batch.clone();
        storage::blocking(&self.storage, move |storage| {
            storage.update_batch_progress(&progress)
        })
        .await
        .map_err(|source| TrackerError::Persist {
            sequence_number: batch.sequence_number,
            source,
        })?;
        self.status.record(batch);
        Ok(())
    }
}

fn cancelled(batch: &Batch) -> Step {
    Step::Done(TrackerOutcome::Cancelled(batch.clone()))
}

/// Sleeps for `delay`; false if shutdown was requested first.
async fn pause(stop: &mut StopSignal, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = stop.requested() => false,
    }
}

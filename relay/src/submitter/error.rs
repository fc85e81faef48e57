// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::time::Duration;

use thiserror::Error;

use crate::batch::BatchStatus;
use crate::da::DaError;

/// Transient failure charged against a batch's retry budget.
#[derive(Debug, Error)]
pub enum RetryCause {
    #[error("submission to da failed")]
    Submission {
        #[source]
        source: DaError,
    },
    #[error("blob not observed at da height {da_height} within {waited:?}")]
    InclusionTimeout { da_height: u64, waited: Duration },
    #[error(
        "da finalized height {finalized_height:?} did not reach inclusion height {inclusion_height} within {waited:?}"
    )]
    FinalityTimeout {
        inclusion_height: u64,
        finalized_height: Option<u64>,
        waited: Duration,
    },
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("cannot persist progress of batch {sequence_number}")]
    Persist {
        sequence_number: u64,
        #[source]
        source: rusqlite::Error,
    },
}

#[derive(Debug, Error)]
pub enum SubmitterError {
    #[error("submitter shutdown requested")]
    ShutdownRequested,
    #[error("commit lane input channel closed")]
    CommitLaneClosed,
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("finality tracker task failed")]
    Join {
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Why an operator retry was refused.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("batch {sequence_number} does not exist")]
    NotFound { sequence_number: u64 },
    #[error("batch {sequence_number} is {status:?}, only failed batches can be retried")]
    NotFailed {
        sequence_number: u64,
        status: BatchStatus,
    },
    #[error("batch {sequence_number} is still settling its failure, try again")]
    Busy { sequence_number: u64 },
    #[error("batch {sequence_number} failed verification and cannot be resubmitted")]
    NotRetryable { sequence_number: u64 },
    #[error("submitter is not running")]
    SubmitterClosed,
    #[error("storage error while retrying batch {sequence_number}")]
    Storage {
        sequence_number: u64,
        #[source]
        source: rusqlite::Error,
    },
}

// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

mod broadcaster;
mod lane;

use std::sync::Arc;

use alloy_primitives::B256;
use app_core::ledger::Ledger;
use thiserror::Error;
use tracing::info;

use crate::batch::{Batch, BatchStatus};
use crate::projector::StateProjector;
use crate::status::PipelineStatus;
use crate::storage::{self, SharedStorage};
use crate::verifier::VerifiedBatch;

pub use broadcaster::{
    BroadcastBatchMessage, BroadcastError, LiveSubscription, PeerBroadcaster,
    PeerBroadcasterConfig,
};
pub use lane::{CommitLane, CommitLaneConfig, CommitLaneError};

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("batch {sequence_number} is {status:?}, only verified batches commit")]
    NotVerified {
        sequence_number: u64,
        status: BatchStatus,
    },
    #[error("commit out of order: expected batch {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("batch {sequence_number} was verified against {found}, authoritative root is {expected}")]
    BaseRootMismatch {
        sequence_number: u64,
        expected: B256,
        found: B256,
    },
    #[error("cannot persist commit of batch {sequence_number}")]
    Persist {
        sequence_number: u64,
        #[source]
        source: rusqlite::Error,
    },
}

/// Single writer of the authoritative ledger.
///
/// Owned by the commit lane task, so commits are serialized by construction. A commit is
/// local first: the ledger and batch row are written, the projector baseline and settled
/// height move, and only then is the batch broadcast.
pub struct Committer {
    storage: SharedStorage,
    projector: Arc<StateProjector>,
    status: Arc<PipelineStatus>,
    broadcaster: PeerBroadcaster,
}

impl Committer {
    pub fn new(
        storage: SharedStorage,
        projector: Arc<StateProjector>,
        status: Arc<PipelineStatus>,
        broadcaster: PeerBroadcaster,
    ) -> Self {
        Self {
            storage,
            projector,
            status,
            broadcaster,
        }
    }

    /// Authoritative ledger the next batch must be verified against.
    pub fn base(&self) -> Arc<Ledger> {
        self.projector.authoritative()
    }

    pub fn next_sequence_number(&self) -> u64 {
        self.projector.settled_height().saturating_add(1)
    }

    pub fn broadcaster(&self) -> &PeerBroadcaster {
        &self.broadcaster
    }

    pub async fn commit(&mut self, verified: VerifiedBatch) -> Result<Batch, CommitError> {
        let VerifiedBatch {
            mut batch,
            post_state,
            base_root,
        } = verified;
        let sequence_number = batch.sequence_number;
        if batch.status != BatchStatus::Verified {
            return Err(CommitError::NotVerified {
                sequence_number,
                status: batch.status,
            });
        }

        let base = self.base();
        let expected = base.height().saturating_add(1);
        if sequence_number != expected {
            return Err(CommitError::OutOfOrder {
                expected,
                got: sequence_number,
            });
        }
        let authoritative_root = base.state_root();
        if base_root != authoritative_root {
            return Err(CommitError::BaseRootMismatch {
                sequence_number,
                expected: authoritative_root,
                found: base_root,
            });
        }

        let (persisted, committed_state) = (batch.clone(), post_state.clone());
        storage::blocking(&self.storage, move |storage| {
            storage
                .update_batch_progress(&persisted)
                .and_then(|()| storage.commit_batch(&persisted, &committed_state))
        })
        .await
        .map_err(|source| CommitError::Persist {
            sequence_number,
            source,
        })?;

        batch.status = BatchStatus::Committed;
        let settled_height = post_state.height();
        self.projector.install_authoritative(post_state);
        self.status.set_settled_height(settled_height);
        self.status.record(&batch);
        info!(
            sequence_number,
            settled_height,
            tx_count = batch.transaction_count(),
            "batch committed"
        );

        self.broadcaster
            .publish(BroadcastBatchMessage::committed(&batch));
        Ok(batch)
    }
}

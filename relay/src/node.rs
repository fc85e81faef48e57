// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;
use std::time::Duration;

use app_core::application::{Executor, TransferExecutor};
use app_core::ledger::Ledger;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{info, warn};

use crate::api::AppState;
use crate::batch::{BatchFailure, BatchStatus};
use crate::batcher::{Batcher, BatcherConfig, BatcherError};
use crate::committer::{
    BroadcastError, CommitLane, CommitLaneConfig, CommitLaneError, Committer, PeerBroadcaster,
    PeerBroadcasterConfig,
};
use crate::da::DaClient;
use crate::intake::Intake;
use crate::pending_queue::PendingQueue;
use crate::projector::{ProjectorError, StateProjector};
use crate::shutdown::StopHandle;
use crate::status::PipelineStatus;
use crate::storage::{self, Storage};
use crate::submitter::{Submitter, SubmitterConfig, SubmitterError};
use crate::verifier::Verifier;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub batcher: BatcherConfig,
    pub submitter: SubmitterConfig,
    pub broadcaster: PeerBroadcasterConfig,
    pub channel_capacity: usize,
    pub ws_page_size: usize,
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("cannot load relay state from storage")]
    Storage {
        #[source]
        source: rusqlite::Error,
    },
    #[error("persisted batches do not replay on the persisted ledger")]
    Projection {
        #[source]
        source: ProjectorError,
    },
    #[error(transparent)]
    Broadcaster(#[from] BroadcastError),
    #[error("batcher stopped: {0}")]
    Batcher(BatcherError),
    #[error("submitter stopped: {0}")]
    Submitter(SubmitterError),
    #[error("commit lane stopped: {0}")]
    CommitLane(CommitLaneError),
    #[error("{task} task panicked or was cancelled")]
    Join {
        task: &'static str,
        #[source]
        source: JoinError,
    },
}

/// A running relay: the background pipeline plus the state the HTTP API serves from.
pub struct RelayNode {
    state: Arc<AppState>,
    stop: StopHandle,
    // Stopped only after the submitter exits, so final batches it forwarded still commit.
    lane_stop: StopHandle,
    batcher: JoinHandle<BatcherError>,
    submitter: JoinHandle<SubmitterError>,
    lane: JoinHandle<CommitLaneError>,
}

impl RelayNode {
    /// Restores persisted state and starts the batcher, submitter and commit lane.
    ///
    /// `genesis` is only written when the database has no ledger yet.
    pub fn start<D: DaClient>(
        config: RelayConfig,
        mut storage: Storage,
        da: Arc<D>,
        genesis: Ledger,
    ) -> Result<Self, NodeError> {
        let executor: Arc<dyn Executor> = Arc::new(TransferExecutor::new());
        let ledger = storage
            .load_or_init_ledger(&genesis)
            .map_err(|source| NodeError::Storage { source })?;
        let seen = storage
            .load_seen_tx_ids()
            .map_err(|source| NodeError::Storage { source })?;
        let pending = storage
            .load_pending_txs()
            .map_err(|source| NodeError::Storage { source })?;
        let in_flight = storage
            .load_in_flight_batches()
            .map_err(|source| NodeError::Storage { source })?;
        let latest_sequence_number = storage
            .latest_sequence_number()
            .map_err(|source| NodeError::Storage { source })?;

        let settled_height = ledger.height();
        let projector = StateProjector::rebuild(
            Arc::clone(&executor),
            ledger,
            in_flight
                .iter()
                .map(|batch| (batch.sequence_number, batch.transactions.as_slice())),
            pending.as_slice(),
        )
        .map_err(|source| NodeError::Projection { source })?;
        let projector = Arc::new(projector);

        let status = Arc::new(PipelineStatus::new(settled_height));
        for batch in &in_flight {
            status.record(batch);
            if batch.status == BatchStatus::Failed
                && let Some(failure @ BatchFailure::Mismatch { .. }) = &batch.failure
            {
                warn!(
                    sequence_number = batch.sequence_number,
                    reason = failure.message(),
                    "relay starts halted on a mismatched batch"
                );
                status.halt(batch.sequence_number, failure.message().to_string());
            }
        }

        info!(
            settled_height,
            pending = pending.len(),
            in_flight = in_flight.len(),
            next_sequence_number = latest_sequence_number + 1,
            "relay state restored"
        );

        let queue = Arc::new(PendingQueue::restore(seen, pending));
        let storage = storage::shared(storage);
        let broadcaster = PeerBroadcaster::start(config.broadcaster.clone(), settled_height)?;
        let stop = StopHandle::new();
        let lane_stop = StopHandle::new();
        let channel_capacity = config.channel_capacity.max(1);
        let (submitter_tx, submitter_rx) = mpsc::channel(channel_capacity);
        let (finalized_tx, finalized_rx) = mpsc::channel(channel_capacity);

        let lane = CommitLane::new(
            finalized_rx,
            Verifier::new(Arc::clone(&da), Arc::clone(&executor), config.submitter.app_id),
            Committer::new(
                storage.clone(),
                Arc::clone(&projector),
                Arc::clone(&status),
                broadcaster.clone(),
            ),
            storage.clone(),
            Arc::clone(&status),
            CommitLaneConfig {
                da_retry_interval: config.submitter.poll_interval,
            },
        )
        .spawn(lane_stop.signal());

        let submitter = Submitter::new(
            submitter_rx,
            da,
            storage.clone(),
            Arc::clone(&status),
            finalized_tx,
            config.submitter,
        )
        .spawn(in_flight, stop.signal());

        let batcher = Batcher::new(
            Arc::clone(&queue),
            Arc::clone(&projector),
            storage.clone(),
            Arc::clone(&status),
            submitter_tx.clone(),
            config.batcher,
            latest_sequence_number + 1,
        )
        .spawn(stop.signal());

        let state = Arc::new(AppState {
            intake: Arc::new(Intake::new(projector, queue, storage.clone())),
            status,
            storage,
            broadcaster,
            submitter: submitter_tx,
            stop: stop.signal(),
            admin_timeout: Duration::from_secs(5),
            ws_page_size: config.ws_page_size.max(1),
        });

        Ok(Self {
            state,
            stop,
            lane_stop,
            batcher,
            submitter,
            lane,
        })
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Handle that starts a graceful shutdown; [`Self::shutdown`] waits for it to finish.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Resolves only if a pipeline task exits on its own, which is always an error.
    pub async fn failed(&mut self) -> NodeError {
        tokio::select! {
            joined = &mut self.batcher => match joined {
                Ok(err) => NodeError::Batcher(err),
                Err(source) => NodeError::Join { task: "batcher", source },
            },
            joined = &mut self.submitter => match joined {
                Ok(err) => NodeError::Submitter(err),
                Err(source) => NodeError::Join { task: "submitter", source },
            },
            joined = &mut self.lane => match joined {
                Ok(err) => NodeError::CommitLane(err),
                Err(source) => NodeError::Join { task: "commit lane", source },
            },
        }
    }

    /// Stops the batcher, lets the submitter drive included batches for its grace window,
    /// then lets the commit lane drain what was forwarded to it.
    pub async fn shutdown(self) -> Result<(), NodeError> {
        self.stop.request_shutdown();

        match self.batcher.await {
            Ok(BatcherError::ShutdownRequested) => {}
            Ok(err) => return Err(NodeError::Batcher(err)),
            Err(source) => {
                return Err(NodeError::Join {
                    task: "batcher",
                    source,
                });
            }
        }
        match self.submitter.await {
            Ok(SubmitterError::ShutdownRequested) => {}
            Ok(err) => return Err(NodeError::Submitter(err)),
            Err(source) => {
                return Err(NodeError::Join {
                    task: "submitter",
                    source,
                });
            }
        }

        self.lane_stop.request_shutdown();
        match self.lane.await {
            Ok(CommitLaneError::ShutdownRequested | CommitLaneError::InputClosed) => {}
            Ok(err) => return Err(NodeError::CommitLane(err)),
            Err(source) => {
                return Err(NodeError::Join {
                    task: "commit lane",
                    source,
                });
            }
        }
        info!(
            settled_height = self.state.status.settled_height(),
            "relay stopped"
        );
        Ok(())
    }
}

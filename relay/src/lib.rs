// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Relay that turns client transactions into ordered, DA-finalized batches.
//!
//! Flow: API -> projector (simulate) -> pending queue -> batcher -> finality tracker ->
//! verifier -> committer -> peers.
//! The committer is the single writer of authoritative state; everything else reads snapshots.
pub mod api;
pub mod batch;
pub mod batcher;
pub mod committer;
pub mod da;
pub mod intake;
pub mod node;
pub mod pending_queue;
pub mod projector;
pub mod shutdown;
pub mod status;
pub mod storage;
pub mod submitter;
pub mod verifier;

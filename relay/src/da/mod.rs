// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Data-availability layer access.
//!
//! The relay only needs three calls: post a blob, read the finalized height and read the
//! blobs stored for its application at a given height. [`HttpDaClient`] talks to a light
//! client over HTTP; [`MemoryDa`] keeps everything in process for dev mode and tests.

mod http;
mod memory;

use std::future::Future;

use thiserror::Error;

pub use http::HttpDaClient;
pub use memory::MemoryDa;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionReceipt {
    /// DA block the blob was included in.
    pub block_number: u64,
}

#[derive(Debug, Error)]
pub enum DaError {
    #[error("da transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("da rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("da response could not be decoded: {0}")]
    Decode(String),
    #[error("da unavailable: {0}")]
    Unavailable(String),
}

pub trait DaClient: Send + Sync + 'static {
    fn submit(
        &self,
        app_id: u32,
        blob: &[u8],
    ) -> impl Future<Output = Result<SubmissionReceipt, DaError>> + Send;

    fn query_finality(&self) -> impl Future<Output = Result<u64, DaError>> + Send;

    /// Blobs stored for `app_id` at `height`. Empty when the block holds none; a block the
    /// DA node cannot serve yet is an error, never an empty answer.
    fn query_inclusion(
        &self,
        app_id: u32,
        height: u64,
    ) -> impl Future<Output = Result<Vec<Vec<u8>>, DaError>> + Send;
}

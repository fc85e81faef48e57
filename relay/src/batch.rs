// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_primitives::B256;
use app_core::transaction::Transaction;
use serde::Serialize;
use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};

/// Canonical encoding of a batch as posted to the DA layer.
///
/// `prev_state_root` is the projected root the batch was sealed on top of and
/// `post_state_root` the root after applying `transactions` in order. Both are re-derived by
/// the verifier from authoritative state before the batch may be committed.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct BatchBlob {
    pub sequence_number: u64,
    pub prev_state_root: B256,
    pub post_state_root: B256,
    pub transactions: Vec<Transaction>,
}

impl BatchBlob {
    pub fn encode(&self) -> Vec<u8> {
        self.as_ssz_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ssz::DecodeError> {
        Self::from_ssz_bytes(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Submitted,
    Included,
    Final,
    Verified,
    Committed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Included => "included",
            Self::Final => "final",
            Self::Verified => "verified",
            Self::Committed => "committed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "submitted" => Some(Self::Submitted),
            "included" => Some(Self::Included),
            "final" => Some(Self::Final),
            "verified" => Some(Self::Verified),
            "committed" => Some(Self::Committed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Failed)
    }

    /// True once the DA layer has reported the batch as irreversible.
    pub fn is_finalized(&self) -> bool {
        matches!(self, Self::Final | Self::Verified | Self::Committed)
    }
}

/// Why a batch stopped progressing. Surfaced to operators; never resolved automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchFailure {
    RetryBudgetExhausted { message: String },
    Mismatch { message: String },
}

impl BatchFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RetryBudgetExhausted { .. } => "retry_budget_exhausted",
            Self::Mismatch { .. } => "mismatch",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::RetryBudgetExhausted { message } | Self::Mismatch { message } => message,
        }
    }

    pub fn from_parts(kind: &str, message: String) -> Option<Self> {
        match kind {
            "retry_budget_exhausted" => Some(Self::RetryBudgetExhausted { message }),
            "mismatch" => Some(Self::Mismatch { message }),
            _ => None,
        }
    }

    // A mismatch means the DA copy disagrees with local replay; resubmitting cannot fix that.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryBudgetExhausted { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub sequence_number: u64,
    pub transactions: Vec<Transaction>,
    pub prev_state_root: B256,
    pub post_state_root: B256,
    pub blob: Vec<u8>,
    pub status: BatchStatus,
    // Retries charged against the budget so far.
    pub attempts: u32,
    pub inclusion_height: Option<u64>,
    // Last DA finalized height observed while tracking this batch.
    pub da_finalized_height: Option<u64>,
    pub failure: Option<BatchFailure>,
    pub created_at_ms: i64,
}

impl Batch {
    pub fn seal(
        sequence_number: u64,
        transactions: Vec<Transaction>,
        prev_state_root: B256,
        post_state_root: B256,
        created_at_ms: i64,
    ) -> Self {
        let blob = BatchBlob {
            sequence_number,
            prev_state_root,
            post_state_root,
            transactions,
        };
        let encoded = blob.encode();
        Self {
            sequence_number,
            transactions: blob.transactions,
            prev_state_root,
            post_state_root,
            blob: encoded,
            status: BatchStatus::Pending,
            attempts: 0,
            inclusion_height: None,
            da_finalized_height: None,
            failure: None,
            created_at_ms,
        }
    }

    /// Rebuilds a freshly sealed batch from its persisted blob.
    pub fn from_blob(blob: Vec<u8>, created_at_ms: i64) -> Result<Self, ssz::DecodeError> {
        let decoded = BatchBlob::decode(blob.as_slice())?;
        Ok(Self {
            sequence_number: decoded.sequence_number,
            transactions: decoded.transactions,
            prev_state_root: decoded.prev_state_root,
            post_state_root: decoded.post_state_root,
            blob,
            status: BatchStatus::Pending,
            attempts: 0,
            inclusion_height: None,
            da_finalized_height: None,
            failure: None,
            created_at_ms,
        })
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// True when `bytes` is a DA blob that claims to be this batch.
    pub fn is_claimed_by(&self, bytes: &[u8]) -> bool {
        BatchBlob::decode(bytes)
            .map(|decoded| decoded.sequence_number == self.sequence_number)
            .unwrap_or(false)
    }

    pub fn record_failure(&mut self, failure: BatchFailure) {
        self.status = BatchStatus::Failed;
        self.failure = Some(failure);
    }

    /// Operator-triggered retry of a failed batch: same blob, fresh budget.
    pub fn reset_for_retry(&mut self) {
        self.status = BatchStatus::Pending;
        self.attempts = 0;
        self.inclusion_height = None;
        self.failure = None;
    }
}

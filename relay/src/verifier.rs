// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;

use alloy_primitives::B256;
use app_core::application::{Executor, ReplayError};
use app_core::ledger::Ledger;
use thiserror::Error;

use crate::batch::{Batch, BatchBlob, BatchStatus};
use crate::da::{DaClient, DaError};

/// Integrity fault: what the DA layer holds for a batch disagrees with local replay.
#[derive(Debug, Error)]
pub enum MismatchError {
    #[error("batch {sequence_number} cannot be checked against ledger height {base_height}")]
    BaseHeight {
        sequence_number: u64,
        base_height: u64,
    },
    #[error("no blob for batch {sequence_number} at da height {da_height:?}")]
    Missing {
        sequence_number: u64,
        da_height: Option<u64>,
    },
    #[error("batch {sequence_number} no longer replays on the authoritative ledger")]
    Replay {
        sequence_number: u64,
        #[source]
        source: ReplayError,
    },
    #[error("batch {sequence_number} prev state root: expected {expected}, da has {found}")]
    PrevStateRoot {
        sequence_number: u64,
        expected: B256,
        found: B256,
    },
    #[error("batch {sequence_number} post state root: expected {expected}, da has {found}")]
    PostStateRoot {
        sequence_number: u64,
        expected: B256,
        found: B256,
    },
    #[error("batch {sequence_number} transactions on da differ from the sealed batch")]
    Transactions { sequence_number: u64 },
    #[error("batch {sequence_number} da blob is not the canonical encoding")]
    Encoding { sequence_number: u64 },
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Mismatch(#[from] MismatchError),
    #[error("cannot read batch from da")]
    Da {
        #[source]
        source: DaError,
    },
}

/// Batch whose DA copy matched local replay, plus the ledger that committing it produces.
#[derive(Debug, Clone)]
pub struct VerifiedBatch {
    pub batch: Batch,
    pub post_state: Ledger,
    pub base_root: B256,
}

pub struct Verifier<D> {
    da: Arc<D>,
    executor: Arc<dyn Executor>,
    app_id: u32,
}

impl<D: DaClient> Verifier<D> {
    pub fn new(da: Arc<D>, executor: Arc<dyn Executor>, app_id: u32) -> Self {
        Self {
            da,
            executor,
            app_id,
        }
    }

    /// Replays `batch` on `base` (the authoritative ledger at height `sequence_number - 1`)
    /// and requires the DA layer to hold exactly the blob that replay produces.
    pub async fn verify(&self, batch: &Batch, base: &Ledger) -> Result<VerifiedBatch, VerifyError> {
        let sequence_number = batch.sequence_number;
        if base.height().saturating_add(1) != sequence_number {
            return Err(MismatchError::BaseHeight {
                sequence_number,
                base_height: base.height(),
            }
            .into());
        }
        let Some(da_height) = batch.inclusion_height else {
            return Err(MismatchError::Missing {
                sequence_number,
                da_height: None,
            }
            .into());
        };

        let blobs = self
            .da
            .query_inclusion(self.app_id, da_height)
            .await
            .map_err(|source| VerifyError::Da { source })?;
        let candidates: Vec<&Vec<u8>> = blobs
            .iter()
            .filter(|blob| batch.is_claimed_by(blob))
            .collect();
        if candidates.is_empty() {
            return Err(MismatchError::Missing {
                sequence_number,
                da_height: Some(da_height),
            }
            .into());
        }

        let mut post_state = base.clone();
        self.executor
            .execute_all(&mut post_state, &batch.transactions)
            .map_err(|source| MismatchError::Replay {
                sequence_number,
                source,
            })?;
        post_state.advance_height();

        let base_root = base.state_root();
        let expected = BatchBlob {
            sequence_number,
            prev_state_root: base_root,
            post_state_root: post_state.state_root(),
            transactions: batch.transactions.clone(),
        };
        let expected_bytes = expected.encode();
        if !candidates
            .iter()
            .any(|blob| blob.as_slice() == expected_bytes.as_slice())
        {
            return Err(describe_mismatch(&expected, candidates[0]).into());
        }

        let mut verified = batch.clone();
        verified.status = BatchStatus::Verified;
        Ok(VerifiedBatch {
            batch: verified,
            post_state,
            base_root,
        })
    }
}

fn describe_mismatch(expected: &BatchBlob, found: &[u8]) -> MismatchError {
    let sequence_number = expected.sequence_number;
    let Ok(found) = BatchBlob::decode(found) else {
        return MismatchError::Encoding { sequence_number };
    };
    if found.prev_state_root != expected.prev_state_root {
        return MismatchError::PrevStateRoot {
            sequence_number,
            expected: expected.prev_state_root,
            found: found.prev_state_root,
        };
    }
    if found.post_state_root != expected.post_state_root {
        return MismatchError::PostStateRoot {
            sequence_number,
            expected: expected.post_state_root,
            found: found.post_state_root,
        };
    }
    if found.transactions != expected.transactions {
        return MismatchError::Transactions { sequence_number };
    }
    MismatchError::Encoding { sequence_number }
}

#[cfg(test)]
mod tests {
    use super::{MismatchError, VerifyError, Verifier};
    use crate::batch::{Batch, BatchBlob, BatchStatus};
    use crate::da::{DaClient, MemoryDa};
    use alloy_primitives::{Address, B256, U256};
    use app_core::application::{Executor, Method, Transfer, TransferExecutor};
    use app_core::ledger::Ledger;
    use app_core::transaction::Transaction;
    use std::sync::Arc;

    fn account(seed: u8) -> Address {
        Address::from_slice(&[seed; 20])
    }

    fn genesis() -> Ledger {
        Ledger::genesis([(account(1), U256::from(50)), (account(2), U256::ZERO)])
    }

    fn transfer(id: u8, amount: u64) -> Transaction {
        Transaction::new(
            B256::from([id; 32]),
            account(1),
            &Method::Transfer(Transfer {
                amount: U256::from(amount),
                to: account(2),
            }),
            0,
        )
    }

    fn sealed_on(base: &Ledger, txs: Vec<Transaction>) -> Batch {
        let mut post = base.clone();
        TransferExecutor::new()
            .execute_all(&mut post, &txs)
            .expect("replay");
        Batch::seal(
            base.height() + 1,
            txs,
            base.state_root(),
            post.state_root(),
            0,
        )
    }

    async fn include(da: &MemoryDa, mut batch: Batch) -> Batch {
        let receipt = da.submit(0, batch.blob.as_slice()).await.expect("submit");
        batch.inclusion_height = Some(receipt.block_number);
        batch.status = BatchStatus::Final;
        batch
    }

    fn verifier(da: &MemoryDa) -> Verifier<MemoryDa> {
        Verifier::new(Arc::new(da.clone()), Arc::new(TransferExecutor::new()), 0)
    }

    #[tokio::test]
    async fn matching_blob_verifies_and_yields_post_state() {
        let da = MemoryDa::new();
        let base = genesis();
        let batch = include(&da, sealed_on(&base, vec![transfer(1, 20)])).await;

        let verified = verifier(&da)
            .verify(&batch, &base)
            .await
            .expect("verify");
        assert_eq!(verified.batch.status, BatchStatus::Verified);
        assert_eq!(verified.base_root, base.state_root());
        assert_eq!(verified.post_state.height(), 1);
        assert_eq!(verified.post_state.state_root(), batch.post_state_root);
        assert_eq!(
            verified.post_state.balance_of(&account(2)),
            Some(U256::from(20))
        );
    }

    #[tokio::test]
    async fn tampered_post_root_is_a_mismatch() {
        let da = MemoryDa::new();
        da.set_submit_hook(|blob| {
            let mut decoded = BatchBlob::decode(blob.as_slice()).expect("decode");
            decoded.post_state_root = B256::from([0xee; 32]);
            decoded.encode()
        });
        let base = genesis();
        let batch = include(&da, sealed_on(&base, vec![transfer(1, 20)])).await;

        let err = verifier(&da)
            .verify(&batch, &base)
            .await
            .expect_err("tampered");
        assert!(matches!(
            err,
            VerifyError::Mismatch(MismatchError::PostStateRoot { sequence_number: 1, .. })
        ));
    }

    #[tokio::test]
    async fn swapped_transactions_are_a_mismatch() {
        let da = MemoryDa::new();
        da.set_submit_hook(|blob| {
            let mut decoded = BatchBlob::decode(blob.as_slice()).expect("decode");
            decoded.transactions.reverse();
            decoded.encode()
        });
        let base = genesis();
        let batch = include(
            &da,
            sealed_on(&base, vec![transfer(1, 20), transfer(2, 5)]),
        )
        .await;

        let err = verifier(&da)
            .verify(&batch, &base)
            .await
            .expect_err("reordered");
        assert!(matches!(
            err,
            VerifyError::Mismatch(MismatchError::Transactions { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn light_client_still_processing_is_a_da_error_not_a_mismatch() {
        use crate::da::{DaError, HttpDaClient};
        use axum::Router;
        use axum::http::StatusCode;
        use axum::routing::get;
        use std::time::Duration;

        let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
            Ok(value) => value,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => return,
            Err(err) => panic!("bind test listener: {err}"),
        };
        let addr = listener.local_addr().expect("read listener addr");
        let app = Router::new().route(
            "/v1/appdata/{block}",
            get(|| async { (StatusCode::UNAUTHORIZED, "\"Processing block\"") }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve light client");
        });
        let da = HttpDaClient::new(format!("http://{addr}"), Duration::from_secs(2))
            .expect("build client");
        let verifier = Verifier::new(Arc::new(da), Arc::new(TransferExecutor::new()), 0);

        let base = genesis();
        let mut batch = sealed_on(&base, vec![transfer(1, 20)]);
        batch.inclusion_height = Some(7);
        batch.status = BatchStatus::Final;

        let err = verifier
            .verify(&batch, &base)
            .await
            .expect_err("block not readable yet");
        assert!(
            matches!(
                err,
                VerifyError::Da {
                    source: DaError::Unavailable(_)
                }
            ),
            "unexpected verify error: {err:?}"
        );
    }

    #[tokio::test]
    async fn absent_blob_and_wrong_base_are_mismatches() {
        let da = MemoryDa::new();
        da.drop_next_inclusions(1);
        let base = genesis();
        let batch = include(&da, sealed_on(&base, vec![transfer(1, 20)])).await;

        let err = verifier(&da)
            .verify(&batch, &base)
            .await
            .expect_err("missing");
        assert!(matches!(
            err,
            VerifyError::Mismatch(MismatchError::Missing {
                da_height: Some(1),
                ..
            })
        ));

        let mut ahead = base.clone();
        ahead.advance_height();
        let err = verifier(&da)
            .verify(&batch, &ahead)
            .await
            .expect_err("wrong base");
        assert!(matches!(
            err,
            VerifyError::Mismatch(MismatchError::BaseHeight { .. })
        ));
    }
}

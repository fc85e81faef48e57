// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::{Arc, Mutex, MutexGuard};

use super::{DaClient, DaError, SubmissionReceipt};

type SubmitHook = Arc<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;

/// In-process DA chain: one block per submission, finality advanced by hand or on every
/// finality query.
#[derive(Clone, Default)]
pub struct MemoryDa {
    inner: Arc<Mutex<MemoryDaInner>>,
}

#[derive(Default)]
struct MemoryDaInner {
    // blocks[h - 1] holds the (app_id, blob) pairs of DA height h.
    blocks: Vec<Vec<(u32, Vec<u8>)>>,
    finalized: u64,
    auto_finalize: bool,
    finality_stalled: bool,
    failing_submissions: u32,
    dropped_inclusions: u32,
    failing_reads: u32,
    submit_hook: Option<SubmitHook>,
}

impl MemoryDa {
    /// Finality only moves through [`Self::finalize_up_to`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Every finality query first finalizes the whole chain.
    pub fn auto_finalizing() -> Self {
        let da = Self::default();
        da.lock().auto_finalize = true;
        da
    }

    pub fn finalize_up_to(&self, height: u64) {
        let mut inner = self.lock();
        let latest = inner.blocks.len() as u64;
        inner.finalized = inner.finalized.max(height.min(latest));
    }

    pub fn finalize_all(&self) {
        self.finalize_up_to(u64::MAX);
    }

    /// While stalled, finality never advances, automatically or by hand.
    pub fn stall_finality(&self, stalled: bool) {
        self.lock().finality_stalled = stalled;
    }

    pub fn fail_next_submissions(&self, count: u32) {
        self.lock().failing_submissions = count;
    }

    /// The next `count` submissions get a receipt but their blob never lands in a block.
    pub fn drop_next_inclusions(&self, count: u32) {
        self.lock().dropped_inclusions = count;
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.lock().failing_reads = count;
    }

    /// Rewrites every submitted blob before it is stored.
    pub fn set_submit_hook(&self, hook: impl Fn(Vec<u8>) -> Vec<u8> + Send + Sync + 'static) {
        self.lock().submit_hook = Some(Arc::new(hook));
    }

    pub fn latest_height(&self) -> u64 {
        self.lock().blocks.len() as u64
    }

    pub fn finalized_height(&self) -> u64 {
        self.lock().finalized
    }

    /// Number of blobs stored for `app_id` across all blocks.
    pub fn stored_blob_count(&self, app_id: u32) -> usize {
        self.lock()
            .blocks
            .iter()
            .flatten()
            .filter(|(id, _)| *id == app_id)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryDaInner> {
        self.inner.lock().expect("memory da lock poisoned")
    }
}

impl DaClient for MemoryDa {
    async fn submit(&self, app_id: u32, blob: &[u8]) -> Result<SubmissionReceipt, DaError> {
        let mut inner = self.lock();
        if inner.failing_submissions > 0 {
            inner.failing_submissions -= 1;
            return Err(DaError::Unavailable("injected submission failure".to_string()));
        }

        let stored = match &inner.submit_hook {
            Some(hook) => hook(blob.to_vec()),
            None => blob.to_vec(),
        };
        let block = if inner.dropped_inclusions > 0 {
            inner.dropped_inclusions -= 1;
            Vec::new()
        } else {
            vec![(app_id, stored)]
        };
        inner.blocks.push(block);
        Ok(SubmissionReceipt {
            block_number: inner.blocks.len() as u64,
        })
    }

    async fn query_finality(&self) -> Result<u64, DaError> {
        let mut inner = self.lock();
        if inner.auto_finalize && !inner.finality_stalled {
            inner.finalized = inner.blocks.len() as u64;
        }
        Ok(inner.finalized)
    }

    async fn query_inclusion(&self, app_id: u32, height: u64) -> Result<Vec<Vec<u8>>, DaError> {
        let mut inner = self.lock();
        if inner.failing_reads > 0 {
            inner.failing_reads -= 1;
            return Err(DaError::Unavailable("injected read failure".to_string()));
        }
        let Some(index) = height.checked_sub(1) else {
            return Ok(Vec::new());
        };
        let Some(block) = usize::try_from(index)
            .ok()
            .and_then(|index| inner.blocks.get(index))
        else {
            return Ok(Vec::new());
        };
        Ok(block
            .iter()
            .filter(|(id, _)| *id == app_id)
            .map(|(_, blob)| blob.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryDa;
    use crate::da::DaClient;

    #[tokio::test]
    async fn finality_is_manual_unless_auto_finalizing() {
        let da = MemoryDa::new();
        let receipt = da.submit(7, &[0x01]).await.expect("submit");
        assert_eq!(receipt.block_number, 1);
        assert_eq!(da.query_finality().await.expect("finality"), 0);

        da.finalize_up_to(10);
        assert_eq!(da.query_finality().await.expect("finality"), 1);

        let auto = MemoryDa::auto_finalizing();
        auto.submit(7, &[0x01]).await.expect("submit");
        assert_eq!(auto.query_finality().await.expect("finality"), 1);
    }

    #[tokio::test]
    async fn stalled_finality_never_advances() {
        let da = MemoryDa::auto_finalizing();
        da.stall_finality(true);
        da.submit(0, &[0x01]).await.expect("submit");
        assert_eq!(da.query_finality().await.expect("finality"), 0);
        da.stall_finality(false);
        assert_eq!(da.query_finality().await.expect("finality"), 1);
    }

    #[tokio::test]
    async fn injected_faults_apply_once_each() {
        let da = MemoryDa::new();
        da.fail_next_submissions(1);
        da.drop_next_inclusions(1);
        da.set_submit_hook(|mut blob| {
            blob.push(0xff);
            blob
        });

        assert!(da.submit(3, &[0x01]).await.is_err());
        let dropped = da.submit(3, &[0x01]).await.expect("submit");
        assert!(
            da.query_inclusion(3, dropped.block_number)
                .await
                .expect("query")
                .is_empty()
        );
        let stored = da.submit(3, &[0x01]).await.expect("submit");
        assert_eq!(
            da.query_inclusion(3, stored.block_number)
                .await
                .expect("query"),
            vec![vec![0x01, 0xff]]
        );
        assert!(
            da.query_inclusion(4, stored.block_number)
                .await
                .expect("query")
                .is_empty()
        );
        assert_eq!(da.stored_blob_count(3), 1);
    }
}

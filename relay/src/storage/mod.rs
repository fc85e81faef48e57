// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

mod db;
mod sql;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use thiserror::Error;

use crate::batch::BatchStatus;

pub use db::Storage;

/// Storage handle shared by the intake path, the batcher, trackers and the committer.
pub type SharedStorage = Arc<Mutex<Storage>>;

pub fn shared(storage: Storage) -> SharedStorage {
    Arc::new(Mutex::new(storage))
}

pub fn lock(storage: &SharedStorage) -> MutexGuard<'_, Storage> {
    storage.lock().expect("storage lock poisoned")
}

/// Runs `f` with the storage lock held on tokio's blocking pool.
///
/// Every async caller goes through here; the lock is never taken on a runtime worker.
pub async fn blocking<T, F>(storage: &SharedStorage, f: F) -> T
where
    F: FnOnce(&mut Storage) -> T + Send + 'static,
    T: Send + 'static,
{
    let storage = Arc::clone(storage);
    match tokio::task::spawn_blocking(move || f(&mut lock(&storage))).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => unreachable!("storage task is never aborted: {err}"),
    }
}

#[derive(Debug, Error)]
pub enum StorageOpenError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Migration(#[from] rusqlite_migration::Error),
}

/// Where a previously accepted transaction currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "location", rename_all = "snake_case")]
pub enum TxLocation {
    Pending,
    Batched {
        sequence_number: u64,
        status: BatchStatus,
    },
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_primitives::B256;
use app_core::ledger::{Ledger, LedgerSnapshot};
use app_core::transaction::Transaction as RelayTransaction;
use rusqlite::{Connection, Result, TransactionBehavior};
use rusqlite_migration::{M, Migrations};
use ssz::{Decode, Encode};

use super::sql::{
    BatchProgressRow, BatchRow, sql_insert_batch, sql_insert_ledger, sql_insert_pending_tx,
    sql_mark_batch_committed, sql_move_pending_into_batch, sql_select_batch,
    sql_select_committed_batches_from, sql_select_ledger, sql_select_max_sequence_number,
    sql_select_pending_tx_exists, sql_select_pending_txs, sql_select_seen_tx_ids,
    sql_select_tx_batch, sql_select_uncommitted_batches, sql_update_batch_progress,
    sql_update_ledger,
};
use super::{StorageOpenError, TxLocation, now_unix_ms};
use crate::batch::{Batch, BatchFailure, BatchStatus};

const MIGRATION_0001_SCHEMA: &str = include_str!("migrations/0001_schema.sql");

pub struct Storage {
    conn: Connection,
}

impl Storage {
    pub fn open(path: &str, synchronous: &str) -> std::result::Result<Self, StorageOpenError> {
        let conn = Self::open_connection_with_migrations(path, synchronous)?;
        Ok(Self { conn })
    }

    pub fn open_connection(
        path: &str,
        synchronous: &str,
    ) -> std::result::Result<Connection, StorageOpenError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", synchronous)?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Ok(conn)
    }

    pub fn open_connection_with_migrations(
        path: &str,
        synchronous: &str,
    ) -> std::result::Result<Connection, StorageOpenError> {
        let mut conn = Self::open_connection(path, synchronous)?;
        Self::run_migrations(&mut conn)?;
        Ok(conn)
    }

    pub fn run_migrations(conn: &mut Connection) -> std::result::Result<(), StorageOpenError> {
        Migrations::from_slice(&[M::up(MIGRATION_0001_SCHEMA)]).to_latest(conn)?;
        Ok(())
    }

    /// Returns the persisted authoritative ledger, writing `genesis` on first start.
    pub fn load_or_init_ledger(&mut self, genesis: &Ledger) -> Result<Ledger> {
        if let Some((height, snapshot)) = sql_select_ledger(&self.conn)? {
            let snapshot: LedgerSnapshot =
                serde_json::from_str(snapshot.as_str()).expect("ledger row: invalid snapshot");
            assert_eq!(
                snapshot.height,
                i64_to_u64(height),
                "ledger row: height column disagrees with snapshot"
            );
            return Ok(Ledger::from_snapshot(&snapshot));
        }

        assert_eq!(genesis.height(), 0, "genesis ledger must start at height 0");
        sql_insert_ledger(&self.conn, 0, encode_snapshot(genesis).as_str(), now_unix_ms())?;
        Ok(genesis.clone())
    }

    /// Ids of every transaction ever accepted: still pending or already sealed.
    pub fn load_seen_tx_ids(&mut self) -> Result<Vec<B256>> {
        let rows = sql_select_seen_tx_ids(&self.conn)?;
        Ok(rows.iter().map(|bytes| decode_tx_id(bytes)).collect())
    }

    pub fn load_pending_txs(&mut self) -> Result<Vec<RelayTransaction>> {
        let rows = sql_select_pending_txs(&self.conn)?;
        Ok(rows
            .iter()
            .map(|encoded| {
                RelayTransaction::from_ssz_bytes(encoded.as_slice())
                    .expect("pending tx row: invalid encoding")
            })
            .collect())
    }

    pub fn append_pending_tx(&mut self, tx: &RelayTransaction, received_at_ms: i64) -> Result<()> {
        sql_insert_pending_tx(
            &self.conn,
            tx.id.as_slice(),
            tx.as_ssz_bytes().as_slice(),
            received_at_ms,
        )?;
        Ok(())
    }

    pub fn latest_sequence_number(&mut self) -> Result<u64> {
        let value = sql_select_max_sequence_number(&self.conn)?;
        Ok(value.map(i64_to_u64).unwrap_or(0))
    }

    /// Persists a freshly sealed batch and moves its transactions out of `pending_txs`, in one
    /// write transaction.
    pub fn seal_batch(&mut self, batch: &Batch) -> Result<()> {
        assert_eq!(
            batch.status,
            BatchStatus::Pending,
            "only freshly sealed batches can be persisted"
        );
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        // Check the head inside the write transaction so the gap check and the insert observe
        // the same snapshot.
        let expected = sql_select_max_sequence_number(&tx)?
            .map(i64_to_u64)
            .unwrap_or(0)
            .saturating_add(1);
        assert_eq!(
            batch.sequence_number, expected,
            "batch sequence number must be contiguous from storage head"
        );

        sql_insert_batch(
            &tx,
            u64_to_i64(batch.sequence_number),
            BatchStatus::Pending.as_str(),
            batch.blob.as_slice(),
            u64_to_i64(batch.transactions.len() as u64),
            batch.created_at_ms,
        )?;
        let tx_ids: Vec<&[u8]> = batch
            .transactions
            .iter()
            .map(|item| item.id.as_slice())
            .collect();
        sql_move_pending_into_batch(&tx, u64_to_i64(batch.sequence_number), tx_ids.as_slice())?;

        tx.commit()?;
        Ok(())
    }

    /// Persists status, retry count and DA heights. Committed batches are never rewritten.
    pub fn update_batch_progress(&mut self, batch: &Batch) -> Result<()> {
        assert_ne!(
            batch.status,
            BatchStatus::Committed,
            "commit goes through commit_batch"
        );
        let row = BatchProgressRow {
            sequence_number: u64_to_i64(batch.sequence_number),
            status: batch.status.as_str(),
            attempts: i64::from(batch.attempts),
            inclusion_height: batch.inclusion_height.map(u64_to_i64),
            da_finalized_height: batch.da_finalized_height.map(u64_to_i64),
            failure_kind: batch.failure.as_ref().map(BatchFailure::kind),
            failure_message: batch.failure.as_ref().map(BatchFailure::message),
        };
        let changed_rows = sql_update_batch_progress(&self.conn, &row, now_unix_ms())?;
        if changed_rows != 1 {
            return Err(rusqlite::Error::StatementChangedRows(changed_rows));
        }
        Ok(())
    }

    /// Writes the new authoritative ledger and marks `batch` committed atomically.
    pub fn commit_batch(&mut self, batch: &Batch, ledger: &Ledger) -> Result<()> {
        assert_eq!(
            ledger.height(),
            batch.sequence_number,
            "committed ledger height must equal the batch sequence number"
        );
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (stored_height, _) = sql_select_ledger(&tx)?.expect("ledger row must exist");
        assert_eq!(
            i64_to_u64(stored_height).saturating_add(1),
            batch.sequence_number,
            "stale ledger: batches must commit in sequence order"
        );

        let changed_rows = sql_update_ledger(
            &tx,
            u64_to_i64(ledger.height()),
            encode_snapshot(ledger).as_str(),
            now_unix_ms(),
        )?;
        if changed_rows != 1 {
            return Err(rusqlite::Error::StatementChangedRows(changed_rows));
        }
        let changed_rows = sql_mark_batch_committed(
            &tx,
            u64_to_i64(batch.sequence_number),
            batch.da_finalized_height.map(u64_to_i64),
            now_unix_ms(),
        )?;
        if changed_rows != 1 {
            return Err(rusqlite::Error::StatementChangedRows(changed_rows));
        }

        tx.commit()?;
        Ok(())
    }

    /// Every batch not yet committed (including failed ones), in sequence order.
    pub fn load_in_flight_batches(&mut self) -> Result<Vec<Batch>> {
        let rows = sql_select_uncommitted_batches(&self.conn)?;
        Ok(rows.into_iter().map(batch_from_row).collect())
    }

    pub fn load_batch(&mut self, sequence_number: u64) -> Result<Option<Batch>> {
        let row = sql_select_batch(&self.conn, u64_to_i64(sequence_number))?;
        Ok(row.map(batch_from_row))
    }

    pub fn load_committed_batches_from(
        &mut self,
        from_inclusive: u64,
        limit: usize,
    ) -> Result<Vec<Batch>> {
        let rows = sql_select_committed_batches_from(
            &self.conn,
            u64_to_i64(from_inclusive),
            u64_to_i64(limit as u64),
        )?;
        Ok(rows.into_iter().map(batch_from_row).collect())
    }

    pub fn locate_tx(&mut self, id: &B256) -> Result<Option<TxLocation>> {
        if let Some((sequence_number, status)) = sql_select_tx_batch(&self.conn, id.as_slice())? {
            return Ok(Some(TxLocation::Batched {
                sequence_number: i64_to_u64(sequence_number),
                status: BatchStatus::parse(status.as_str()).expect("batch row: unknown status"),
            }));
        }
        if sql_select_pending_tx_exists(&self.conn, id.as_slice())? {
            return Ok(Some(TxLocation::Pending));
        }
        Ok(None)
    }
}

fn batch_from_row(row: BatchRow) -> Batch {
    let mut batch =
        Batch::from_blob(row.blob, row.created_at_ms).expect("batch row: invalid blob encoding");
    assert_eq!(
        batch.sequence_number,
        i64_to_u64(row.sequence_number),
        "batch row: blob sequence number disagrees with row"
    );
    batch.status = BatchStatus::parse(row.status.as_str()).expect("batch row: unknown status");
    batch.attempts = i64_to_u32(row.attempts);
    batch.inclusion_height = row.inclusion_height.map(i64_to_u64);
    batch.da_finalized_height = row.da_finalized_height.map(i64_to_u64);
    batch.failure = match (row.failure_kind, row.failure_message) {
        (Some(kind), message) => Some(
            BatchFailure::from_parts(kind.as_str(), message.unwrap_or_default())
                .expect("batch row: unknown failure kind"),
        ),
        (None, _) => None,
    };
    batch
}

fn encode_snapshot(ledger: &Ledger) -> String {
    serde_json::to_string(&ledger.snapshot()).expect("serialize ledger snapshot")
}

fn decode_tx_id(bytes: &[u8]) -> B256 {
    assert_eq!(bytes.len(), 32, "tx id row: id must be 32 bytes");
    B256::from_slice(bytes)
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

fn i64_to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::Storage;
    use crate::batch::{Batch, BatchFailure, BatchStatus};
    use crate::storage::TxLocation;
    use alloy_primitives::{Address, B256, U256};
    use app_core::application::{Executor, Method, Transfer, TransferExecutor};
    use app_core::ledger::Ledger;
    use app_core::transaction::Transaction;
    use tempfile::TempDir;

    fn temp_db(name: &str) -> (TempDir, String) {
        let dir = tempfile::Builder::new()
            .prefix(format!("relay-{name}-").as_str())
            .tempdir()
            .expect("create temporary test directory");
        let path = dir.path().join("relay.sqlite");
        let path = path.to_string_lossy().into_owned();
        (dir, path)
    }

    fn account(seed: u8) -> Address {
        Address::from_slice(&[seed; 20])
    }

    fn genesis() -> Ledger {
        Ledger::genesis([(account(1), U256::from(100)), (account(2), U256::ZERO)])
    }

    fn transfer(id: u8, amount: u64) -> Transaction {
        Transaction::new(
            B256::from([id; 32]),
            account(1),
            &Method::Transfer(Transfer {
                amount: U256::from(amount),
                to: account(2),
            }),
            u64::from(id),
        )
    }

    fn sealed(sequence_number: u64, txs: Vec<Transaction>) -> Batch {
        Batch::seal(sequence_number, txs, B256::ZERO, B256::ZERO, 0)
    }

    #[test]
    fn ledger_is_initialised_once() {
        let (_dir, path) = temp_db("ledger-init");
        let mut storage = Storage::open(&path, "NORMAL").expect("open storage");
        let first = storage.load_or_init_ledger(&genesis()).expect("init ledger");
        assert_eq!(first, genesis());

        let other = Ledger::genesis([(account(9), U256::from(1))]);
        let second = storage.load_or_init_ledger(&other).expect("reload ledger");
        assert_eq!(second, genesis());
    }

    #[test]
    fn sealing_moves_pending_rows_into_batch() {
        let (_dir, path) = temp_db("seal");
        let mut storage = Storage::open(&path, "NORMAL").expect("open storage");
        storage.load_or_init_ledger(&genesis()).expect("init ledger");

        for id in 1..=3 {
            storage
                .append_pending_tx(&transfer(id, 1), 0)
                .expect("append pending");
        }
        assert_eq!(storage.load_pending_txs().expect("pending").len(), 3);

        let batch = sealed(1, vec![transfer(1, 1), transfer(2, 1)]);
        storage.seal_batch(&batch).expect("seal batch");

        assert_eq!(
            storage.load_pending_txs().expect("pending"),
            vec![transfer(3, 1)]
        );
        assert_eq!(storage.load_seen_tx_ids().expect("seen").len(), 3);
        assert_eq!(storage.latest_sequence_number().expect("latest"), 1);
        assert_eq!(
            storage.locate_tx(&transfer(1, 1).id).expect("locate"),
            Some(TxLocation::Batched {
                sequence_number: 1,
                status: BatchStatus::Pending,
            })
        );
        assert_eq!(
            storage.locate_tx(&transfer(3, 1).id).expect("locate"),
            Some(TxLocation::Pending)
        );
        assert_eq!(storage.locate_tx(&B256::ZERO).expect("locate"), None);
    }

    #[test]
    #[should_panic(expected = "contiguous")]
    fn sealing_with_a_gap_panics() {
        let (_dir, path) = temp_db("seal-gap");
        let mut storage = Storage::open(&path, "NORMAL").expect("open storage");
        storage
            .seal_batch(&sealed(2, Vec::new()))
            .expect("seal batch");
    }

    #[test]
    fn progress_and_failure_survive_reopen() {
        let (_dir, path) = temp_db("progress");
        {
            let mut storage = Storage::open(&path, "NORMAL").expect("open storage");
            let mut batch = sealed(1, vec![transfer(1, 1)]);
            storage.seal_batch(&batch).expect("seal batch");

            batch.status = BatchStatus::Included;
            batch.attempts = 2;
            batch.inclusion_height = Some(40);
            batch.da_finalized_height = Some(38);
            storage.update_batch_progress(&batch).expect("update progress");

            batch.record_failure(BatchFailure::RetryBudgetExhausted {
                message: "finality timeout".to_string(),
            });
            storage.update_batch_progress(&batch).expect("record failure");
        }

        let mut storage = Storage::open(&path, "NORMAL").expect("reopen storage");
        let in_flight = storage.load_in_flight_batches().expect("in flight");
        assert_eq!(in_flight.len(), 1);
        let batch = &in_flight[0];
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.attempts, 2);
        assert_eq!(batch.inclusion_height, Some(40));
        assert_eq!(batch.da_finalized_height, Some(38));
        assert_eq!(
            batch.failure,
            Some(BatchFailure::RetryBudgetExhausted {
                message: "finality timeout".to_string(),
            })
        );
        assert_eq!(batch.transactions, vec![transfer(1, 1)]);
    }

    #[test]
    fn commit_advances_ledger_and_archives_batch() {
        let (_dir, path) = temp_db("commit");
        let mut storage = Storage::open(&path, "NORMAL").expect("open storage");
        let mut ledger = storage.load_or_init_ledger(&genesis()).expect("init ledger");

        let mut batch = sealed(1, vec![transfer(1, 30)]);
        storage.seal_batch(&batch).expect("seal batch");
        batch.status = BatchStatus::Verified;
        batch.da_finalized_height = Some(12);
        storage.update_batch_progress(&batch).expect("mark verified");

        TransferExecutor::new()
            .execute_all(&mut ledger, &batch.transactions)
            .expect("apply batch");
        ledger.advance_height();
        storage.commit_batch(&batch, &ledger).expect("commit batch");

        let reloaded = storage.load_or_init_ledger(&genesis()).expect("reload");
        assert_eq!(reloaded.height(), 1);
        assert_eq!(reloaded.balance_of(&account(2)), Some(U256::from(30)));
        assert!(storage.load_in_flight_batches().expect("in flight").is_empty());

        let committed = storage
            .load_committed_batches_from(1, 10)
            .expect("committed");
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].status, BatchStatus::Committed);
        assert_eq!(committed[0].da_finalized_height, Some(12));
    }

    #[test]
    fn commit_requires_verified_status() {
        let (_dir, path) = temp_db("commit-unverified");
        let mut storage = Storage::open(&path, "NORMAL").expect("open storage");
        let mut ledger = storage.load_or_init_ledger(&genesis()).expect("init ledger");
        let batch = sealed(1, Vec::new());
        storage.seal_batch(&batch).expect("seal batch");

        ledger.advance_height();
        let err = storage
            .commit_batch(&batch, &ledger)
            .expect_err("pending batch cannot commit");
        assert!(matches!(err, rusqlite::Error::StatementChangedRows(0)));
        assert_eq!(
            storage
                .load_or_init_ledger(&genesis())
                .expect("reload")
                .height(),
            0
        );
    }
}

// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use rusqlite::{Connection, OptionalExtension, Result, Row, Transaction, params};

const SQL_SELECT_LEDGER: &str =
    "SELECT height, snapshot FROM ledger WHERE singleton_id = 0 LIMIT 1";
const SQL_INSERT_LEDGER: &str = "INSERT INTO ledger (singleton_id, height, snapshot, updated_at_ms) \
     VALUES (0, ?1, ?2, ?3)";
const SQL_UPDATE_LEDGER: &str =
    "UPDATE ledger SET height = ?1, snapshot = ?2, updated_at_ms = ?3 WHERE singleton_id = 0";
const SQL_INSERT_PENDING_TX: &str =
    "INSERT INTO pending_txs (tx_id, encoded, received_at_ms) VALUES (?1, ?2, ?3)";
const SQL_SELECT_PENDING_TXS: &str = "SELECT encoded FROM pending_txs ORDER BY position ASC";
const SQL_DELETE_PENDING_TX: &str = "DELETE FROM pending_txs WHERE tx_id = ?1";
const SQL_SELECT_SEEN_TX_IDS: &str =
    "SELECT tx_id FROM pending_txs UNION ALL SELECT tx_id FROM batch_txs";
const SQL_SELECT_MAX_SEQUENCE_NUMBER: &str = "SELECT MAX(sequence_number) FROM batches";
const SQL_INSERT_BATCH: &str = "INSERT INTO batches \
     (sequence_number, status, blob, tx_count, attempts, created_at_ms, updated_at_ms) \
     VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)";
const SQL_INSERT_BATCH_TX: &str =
    "INSERT INTO batch_txs (tx_id, sequence_number, position) VALUES (?1, ?2, ?3)";
const SQL_UPDATE_BATCH_PROGRESS: &str = "UPDATE batches SET status = ?2, attempts = ?3, \
     inclusion_height = ?4, da_finalized_height = ?5, failure_kind = ?6, failure_message = ?7, \
     updated_at_ms = ?8 WHERE sequence_number = ?1 AND status <> 'committed'";
const SQL_MARK_BATCH_COMMITTED: &str = "UPDATE batches SET status = 'committed', \
     da_finalized_height = ?2, updated_at_ms = ?3, committed_at_ms = ?3 \
     WHERE sequence_number = ?1 AND status = 'verified'";
const SQL_SELECT_BATCH_COLUMNS: &str = "SELECT sequence_number, status, blob, attempts, \
     inclusion_height, da_finalized_height, failure_kind, failure_message, created_at_ms \
     FROM batches";
const SQL_SELECT_TX_BATCH: &str = "SELECT b.sequence_number, b.status FROM batch_txs t \
     JOIN batches b ON b.sequence_number = t.sequence_number WHERE t.tx_id = ?1";
const SQL_SELECT_PENDING_TX_EXISTS: &str = "SELECT 1 FROM pending_txs WHERE tx_id = ?1";

#[derive(Debug, Clone)]
pub(super) struct BatchRow {
    pub sequence_number: i64,
    pub status: String,
    pub blob: Vec<u8>,
    pub attempts: i64,
    pub inclusion_height: Option<i64>,
    pub da_finalized_height: Option<i64>,
    pub failure_kind: Option<String>,
    pub failure_message: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub(super) struct BatchProgressRow<'a> {
    pub sequence_number: i64,
    pub status: &'a str,
    pub attempts: i64,
    pub inclusion_height: Option<i64>,
    pub da_finalized_height: Option<i64>,
    pub failure_kind: Option<&'a str>,
    pub failure_message: Option<&'a str>,
}

pub(super) fn sql_select_ledger(conn: &Connection) -> Result<Option<(i64, String)>> {
    conn.query_row(SQL_SELECT_LEDGER, [], |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()
}

pub(super) fn sql_insert_ledger(
    conn: &Connection,
    height: i64,
    snapshot: &str,
    now_ms: i64,
) -> Result<usize> {
    conn.execute(SQL_INSERT_LEDGER, params![height, snapshot, now_ms])
}

pub(super) fn sql_update_ledger(
    tx: &Transaction<'_>,
    height: i64,
    snapshot: &str,
    now_ms: i64,
) -> Result<usize> {
    tx.execute(SQL_UPDATE_LEDGER, params![height, snapshot, now_ms])
}

pub(super) fn sql_insert_pending_tx(
    conn: &Connection,
    tx_id: &[u8],
    encoded: &[u8],
    received_at_ms: i64,
) -> Result<usize> {
    let mut stmt = conn.prepare_cached(SQL_INSERT_PENDING_TX)?;
    stmt.execute(params![tx_id, encoded, received_at_ms])
}

pub(super) fn sql_select_pending_txs(conn: &Connection) -> Result<Vec<Vec<u8>>> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_PENDING_TXS)?;
    let mapped = stmt.query_map([], |row| row.get(0))?;
    mapped.collect()
}

pub(super) fn sql_select_seen_tx_ids(conn: &Connection) -> Result<Vec<Vec<u8>>> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_SEEN_TX_IDS)?;
    let mapped = stmt.query_map([], |row| row.get(0))?;
    mapped.collect()
}

pub(super) fn sql_select_pending_tx_exists(conn: &Connection, tx_id: &[u8]) -> Result<bool> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_PENDING_TX_EXISTS)?;
    stmt.exists(params![tx_id])
}

pub(super) fn sql_select_max_sequence_number(conn: &Connection) -> Result<Option<i64>> {
    conn.query_row(SQL_SELECT_MAX_SEQUENCE_NUMBER, [], |row| row.get(0))
}

pub(super) fn sql_insert_batch(
    tx: &Transaction<'_>,
    sequence_number: i64,
    status: &str,
    blob: &[u8],
    tx_count: i64,
    created_at_ms: i64,
) -> Result<usize> {
    tx.execute(
        SQL_INSERT_BATCH,
        params![sequence_number, status, blob, tx_count, created_at_ms],
    )
}

pub(super) fn sql_move_pending_into_batch(
    tx: &Transaction<'_>,
    sequence_number: i64,
    tx_ids: &[&[u8]],
) -> Result<()> {
    let mut insert = tx.prepare_cached(SQL_INSERT_BATCH_TX)?;
    let mut delete = tx.prepare_cached(SQL_DELETE_PENDING_TX)?;
    for (position, tx_id) in tx_ids.iter().enumerate() {
        insert.execute(params![tx_id, sequence_number, position as i64])?;
        delete.execute(params![tx_id])?;
    }
    Ok(())
}

pub(super) fn sql_update_batch_progress(
    conn: &Connection,
    row: &BatchProgressRow<'_>,
    now_ms: i64,
) -> Result<usize> {
    let mut stmt = conn.prepare_cached(SQL_UPDATE_BATCH_PROGRESS)?;
    stmt.execute(params![
        row.sequence_number,
        row.status,
        row.attempts,
        row.inclusion_height,
        row.da_finalized_height,
        row.failure_kind,
        row.failure_message,
        now_ms,
    ])
}

pub(super) fn sql_mark_batch_committed(
    tx: &Transaction<'_>,
    sequence_number: i64,
    da_finalized_height: Option<i64>,
    now_ms: i64,
) -> Result<usize> {
    tx.execute(
        SQL_MARK_BATCH_COMMITTED,
        params![sequence_number, da_finalized_height, now_ms],
    )
}

pub(super) fn sql_select_batch(conn: &Connection, sequence_number: i64) -> Result<Option<BatchRow>> {
    let sql = format!("{SQL_SELECT_BATCH_COLUMNS} WHERE sequence_number = ?1");
    let mut stmt = conn.prepare_cached(sql.as_str())?;
    stmt.query_row(params![sequence_number], convert_row_to_batch_row)
        .optional()
}

pub(super) fn sql_select_uncommitted_batches(conn: &Connection) -> Result<Vec<BatchRow>> {
    let sql = format!(
        "{SQL_SELECT_BATCH_COLUMNS} WHERE status <> 'committed' ORDER BY sequence_number ASC"
    );
    let mut stmt = conn.prepare_cached(sql.as_str())?;
    let mapped = stmt.query_map([], convert_row_to_batch_row)?;
    mapped.collect()
}

pub(super) fn sql_select_committed_batches_from(
    conn: &Connection,
    from_inclusive: i64,
    limit: i64,
) -> Result<Vec<BatchRow>> {
    let sql = format!(
        "{SQL_SELECT_BATCH_COLUMNS} WHERE status = 'committed' AND sequence_number >= ?1 \
         ORDER BY sequence_number ASC LIMIT ?2"
    );
    let mut stmt = conn.prepare_cached(sql.as_str())?;
    let mapped = stmt.query_map(params![from_inclusive, limit], convert_row_to_batch_row)?;
    mapped.collect()
}

pub(super) fn sql_select_tx_batch(
    conn: &Connection,
    tx_id: &[u8],
) -> Result<Option<(i64, String)>> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_TX_BATCH)?;
    stmt.query_row(params![tx_id], |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()
}

fn convert_row_to_batch_row(row: &Row<'_>) -> Result<BatchRow> {
    Ok(BatchRow {
        sequence_number: row.get(0)?,
        status: row.get(1)?,
        blob: row.get(2)?,
        attempts: row.get(3)?,
        inclusion_height: row.get(4)?,
        da_finalized_height: row.get(5)?,
        failure_kind: row.get(6)?,
        failure_message: row.get(7)?,
        created_at_ms: row.get(8)?,
    })
}

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use parkflow_core::{Batch, Record, StateEntry, StateStore};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::{Checkpoint, CheckpointStore, DeadLetter, SourceMarker, StoreSummary};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS facility_state (
    facility_key TEXT PRIMARY KEY,
    available_spaces INTEGER NOT NULL,
    closed INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS batch_log (
    seq INTEGER PRIMARY KEY,
    ingested_at TEXT NOT NULL,
    source TEXT,
    rows_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS pipeline_meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS checkpoints (
    sink_name TEXT PRIMARY KEY,
    seq INTEGER NOT NULL,
    rows_committed INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sink_name TEXT NOT NULL,
    seq INTEGER NOT NULL,
    rows_json TEXT NOT NULL,
    error_message TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS ingested_sources (
    source TEXT PRIMARY KEY,
    digest TEXT NOT NULL,
    seq INTEGER,
    ingested_at TEXT NOT NULL
);
";

const LAST_BATCH_SEQ: &str = "last_batch_seq";

/// SQLite-backed store for facility state, the batch log, checkpoints and
/// dead letters.
///
/// Everything lives in one database file so that a snapshot's state
/// updates and its batch log entry commit in the same transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StateResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening state store");

        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::init(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> StateResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StateResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StateResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::Poisoned)
    }

    // -------------------------------------------------------------------------
    // Ingestion and batch log
    // -------------------------------------------------------------------------

    /// Commit one snapshot: apply the state updates, assign the next batch
    /// sequence number, append the changed rows to the batch log and record
    /// the source. Either all of it lands or none of it does.
    pub fn ingest(
        &self,
        updates: &BTreeMap<String, StateEntry>,
        rows: &[Record],
        source: Option<&SourceMarker>,
        ingested_at: DateTime<Utc>,
    ) -> StateResult<Batch> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = ingested_at.to_rfc3339();

        upsert_state(&tx, updates, &now)?;

        let last: Option<i64> = tx
            .query_row(
                "SELECT value FROM pipeline_meta WHERE key = ?1",
                [LAST_BATCH_SEQ],
                |row| row.get(0),
            )
            .optional()?;
        let seq = last.unwrap_or(0) as u64 + 1;

        tx.execute(
            "INSERT INTO batch_log (seq, ingested_at, source, rows_json) VALUES (?1, ?2, ?3, ?4)",
            params![
                seq as i64,
                now,
                source.map(|s| s.id.as_str()),
                serde_json::to_string(rows)?
            ],
        )?;

        tx.execute(
            "INSERT INTO pipeline_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![LAST_BATCH_SEQ, seq as i64],
        )?;

        if let Some(marker) = source {
            let inserted = tx.execute(
                "INSERT INTO ingested_sources (source, digest, seq, ingested_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(source) DO NOTHING",
                params![marker.id, marker.digest, seq as i64, now],
            )?;
            if inserted == 0 {
                return Err(StateError::AlreadyIngested(marker.id.clone()));
            }
        }

        tx.commit()?;
        debug!(seq, rows = rows.len(), facilities = updates.len(), "Ingested batch");

        Ok(Batch {
            seq,
            ingested_at,
            source: source.map(|s| s.id.clone()),
            rows: rows.to_vec(),
        })
    }

    /// Whether a snapshot with this source id was already ingested.
    pub fn has_ingested(&self, source_id: &str) -> StateResult<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM ingested_sources WHERE source = ?1",
                [source_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// The highest sequence number ever assigned (0 before the first batch).
    pub fn last_batch_seq(&self) -> StateResult<u64> {
        let conn = self.conn()?;
        let last: Option<i64> = conn
            .query_row(
                "SELECT value FROM pipeline_meta WHERE key = ?1",
                [LAST_BATCH_SEQ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(last.unwrap_or(0) as u64)
    }

    /// Get a logged batch by sequence number.
    pub fn get_batch(&self, seq: u64) -> StateResult<Option<Batch>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT seq, ingested_at, source, rows_json FROM batch_log WHERE seq = ?1",
                [seq as i64],
                read_batch_columns,
            )
            .optional()?;

        row.map(decode_batch).transpose()
    }

    /// Logged batches with a sequence number greater than `after`, oldest
    /// first.
    pub fn pending_batches(&self, after: u64, limit: usize) -> StateResult<Vec<Batch>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT seq, ingested_at, source, rows_json FROM batch_log
             WHERE seq > ?1 ORDER BY seq LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![after as i64, limit as i64], read_batch_columns)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(decode_batch(row?)?);
        }
        Ok(result)
    }

    /// Drop logged batches up to and including `seq`.
    pub fn prune_batches_through(&self, seq: u64) -> StateResult<usize> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM batch_log WHERE seq <= ?1", [seq as i64])?;
        if removed > 0 {
            debug!(through = seq, removed, "Pruned batch log");
        }
        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Dead letters
    // -------------------------------------------------------------------------

    /// Record a batch a sink gave up on and move that sink's checkpoint past
    /// it, in one transaction.
    pub fn dead_letter(
        &self,
        sink_name: &str,
        batch: &Batch,
        error_message: &str,
        attempts: u32,
    ) -> StateResult<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT INTO dead_letters (sink_name, seq, rows_json, error_message, attempts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sink_name,
                batch.seq as i64,
                serde_json::to_string(&batch.rows)?,
                error_message,
                attempts,
                now
            ],
        )?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO checkpoints (sink_name, seq, rows_committed, updated_at)
             VALUES (?1, ?2, 0, ?3)
             ON CONFLICT(sink_name) DO UPDATE SET seq = ?2, updated_at = ?3
             WHERE ?2 > checkpoints.seq",
            params![sink_name, batch.seq as i64, now],
        )?;

        tx.commit()?;
        Ok(id)
    }

    /// Get dead letters, newest first.
    pub fn get_dead_letters(
        &self,
        sink_name: Option<&str>,
        limit: i64,
    ) -> StateResult<Vec<DeadLetter>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, sink_name, seq, rows_json, error_message, attempts, created_at
             FROM dead_letters
             WHERE (?1 IS NULL OR sink_name = ?1)
             ORDER BY id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![sink_name, limit], read_dead_letter_columns)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(decode_dead_letter(row?)?);
        }
        Ok(result)
    }

    /// Get a single dead letter by ID.
    pub fn get_dead_letter(&self, id: i64) -> StateResult<Option<DeadLetter>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, sink_name, seq, rows_json, error_message, attempts, created_at
                 FROM dead_letters WHERE id = ?1",
                [id],
                read_dead_letter_columns,
            )
            .optional()?;

        row.map(decode_dead_letter).transpose()
    }

    /// Delete a dead letter. Returns false if it did not exist.
    pub fn delete_dead_letter(&self, id: i64) -> StateResult<bool> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM dead_letters WHERE id = ?1", [id])? > 0)
    }

    /// Clear dead letters for a sink (or all if None).
    pub fn clear_dead_letters(&self, sink_name: Option<&str>) -> StateResult<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM dead_letters WHERE (?1 IS NULL OR sink_name = ?1)",
            params![sink_name],
        )?;
        Ok(removed)
    }

    pub fn summary(&self) -> StateResult<StoreSummary> {
        let conn = self.conn()?;
        let count = |sql: &str| -> StateResult<u64> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };

        let last: Option<i64> = conn
            .query_row(
                "SELECT value FROM pipeline_meta WHERE key = ?1",
                [LAST_BATCH_SEQ],
                |row| row.get(0),
            )
            .optional()?;

        Ok(StoreSummary {
            facilities: count("SELECT COUNT(*) FROM facility_state")?,
            last_batch_seq: last.unwrap_or(0) as u64,
            logged_batches: count("SELECT COUNT(*) FROM batch_log")?,
            dead_letters: count("SELECT COUNT(*) FROM dead_letters")?,
        })
    }
}

fn upsert_state(
    conn: &Connection,
    updates: &BTreeMap<String, StateEntry>,
    now: &str,
) -> StateResult<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO facility_state (facility_key, available_spaces, closed, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(facility_key) DO UPDATE SET
            available_spaces = ?2,
            closed = ?3,
            updated_at = ?4",
    )?;

    for (key, entry) in updates {
        stmt.execute(params![key, entry.available_spaces, entry.closed, now])?;
    }
    Ok(())
}

type BatchColumns = (i64, String, Option<String>, String);

fn read_batch_columns(row: &Row<'_>) -> rusqlite::Result<BatchColumns> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_batch((seq, ingested_at, source, rows_json): BatchColumns) -> StateResult<Batch> {
    Ok(Batch {
        seq: seq as u64,
        ingested_at: parse_timestamp(&ingested_at)?,
        source,
        rows: serde_json::from_str(&rows_json)?,
    })
}

type DeadLetterColumns = (i64, String, i64, String, String, u32, String);

fn read_dead_letter_columns(row: &Row<'_>) -> rusqlite::Result<DeadLetterColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_dead_letter(
    (id, sink_name, seq, rows_json, error_message, attempts, created_at): DeadLetterColumns,
) -> StateResult<DeadLetter> {
    Ok(DeadLetter {
        id,
        sink_name,
        seq: seq as u64,
        rows: serde_json::from_str(&rows_json)?,
        error_message,
        attempts,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn parse_timestamp(s: &str) -> StateResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StateError::Serialization(format!("bad timestamp '{}': {}", s, e)))
}

impl StateStore for SqliteStore {
    fn get(&self, facility_key: &str) -> parkflow_core::Result<Option<StateEntry>> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                "SELECT available_spaces, closed FROM facility_state WHERE facility_key = ?1",
                [facility_key],
                |row| {
                    Ok(StateEntry {
                        available_spaces: row.get(0)?,
                        closed: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(StateError::from)?;
        Ok(entry)
    }

    fn put(&self, facility_key: &str, entry: StateEntry) -> parkflow_core::Result<()> {
        let updates = BTreeMap::from([(facility_key.to_string(), entry)]);
        self.put_all(&updates)
    }

    fn put_all(&self, updates: &BTreeMap<String, StateEntry>) -> parkflow_core::Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(StateError::from)?;
        upsert_state(&tx, updates, &Utc::now().to_rfc3339())?;
        tx.commit().map_err(StateError::from)?;
        Ok(())
    }
}

impl CheckpointStore for SqliteStore {
    fn get_checkpoint(&self, sink_name: &str) -> StateResult<Option<Checkpoint>> {
        let conn = self.conn()?;

        let row = conn
            .query_row(
                "SELECT seq, rows_committed, updated_at FROM checkpoints WHERE sink_name = ?1",
                [sink_name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(seq, rows_committed, updated_at)| {
            Ok(Checkpoint {
                seq: seq as u64,
                rows_committed: rows_committed as u64,
                updated_at: Some(parse_timestamp(&updated_at)?),
            })
        })
        .transpose()
    }

    fn save_checkpoint(&self, sink_name: &str, checkpoint: &Checkpoint) -> StateResult<()> {
        let conn = self.conn()?;

        conn.execute(
            "INSERT INTO checkpoints (sink_name, seq, rows_committed, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(sink_name) DO UPDATE SET
                seq = ?2,
                rows_committed = ?3,
                updated_at = ?4
             WHERE ?2 >= checkpoints.seq",
            params![
                sink_name,
                checkpoint.seq as i64,
                checkpoint.rows_committed as i64,
                Utc::now().to_rfc3339()
            ],
        )?;

        Ok(())
    }

    fn get_all_checkpoints(&self) -> StateResult<Vec<(String, Checkpoint)>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT sink_name, seq, rows_committed, updated_at FROM checkpoints ORDER BY sink_name",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (name, seq, rows_committed, updated_at) = row?;
            result.push((
                name,
                Checkpoint {
                    seq: seq as u64,
                    rows_committed: rows_committed as u64,
                    updated_at: Some(parse_timestamp(&updated_at)?),
                },
            ));
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(spaces: i64) -> StateEntry {
        StateEntry {
            available_spaces: spaces,
            closed: false,
        }
    }

    fn marker(id: &str) -> SourceMarker {
        SourceMarker {
            id: id.into(),
            digest: "00".into(),
        }
    }

    fn ingest_one(store: &SqliteStore, key: &str, spaces: i64) -> Batch {
        let updates = BTreeMap::from([(key.to_string(), entry(spaces))]);
        let rows = vec![Record::new(key, spaces, false)];
        store.ingest(&updates, &rows, None, Utc::now()).unwrap()
    }

    #[test]
    fn test_state_get_put() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.get("P1").unwrap().is_none());

        store.put("P1", entry(10)).unwrap();
        store.put("P1", StateEntry { available_spaces: 8, closed: true }).unwrap();

        let got = store.get("P1").unwrap().unwrap();
        assert_eq!(got.available_spaces, 8);
        assert!(got.closed);
    }

    #[test]
    fn test_ingest_assigns_monotonic_seq() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.last_batch_seq().unwrap(), 0);

        let first = ingest_one(&store, "P1", 10);
        let second = ingest_one(&store, "P1", 7);

        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(store.last_batch_seq().unwrap(), 2);
        assert_eq!(store.get("P1").unwrap().unwrap().available_spaces, 7);

        let logged = store.get_batch(1).unwrap().unwrap();
        assert_eq!(logged.rows, vec![Record::new("P1", 10, false)]);
    }

    #[test]
    fn test_seq_survives_pruning() {
        let store = SqliteStore::in_memory().unwrap();
        ingest_one(&store, "P1", 1);
        ingest_one(&store, "P1", 2);

        assert_eq!(store.prune_batches_through(2).unwrap(), 2);
        assert!(store.pending_batches(0, 10).unwrap().is_empty());
        assert_eq!(ingest_one(&store, "P1", 3).seq, 3);
    }

    #[test]
    fn test_pending_batches_in_order() {
        let store = SqliteStore::in_memory().unwrap();
        for i in 0..4 {
            ingest_one(&store, "P1", i);
        }

        let pending = store.pending_batches(1, 2).unwrap();
        let seqs: Vec<_> = pending.iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn test_source_is_ingested_once() {
        let store = SqliteStore::in_memory().unwrap();
        let updates = BTreeMap::from([("P1".to_string(), entry(1))]);
        let rows = vec![Record::new("P1", 1, false)];

        store
            .ingest(&updates, &rows, Some(&marker("data_1.json")), Utc::now())
            .unwrap();
        assert!(store.has_ingested("data_1.json").unwrap());

        let again = store.ingest(
            &BTreeMap::from([("P1".to_string(), entry(99))]),
            &rows,
            Some(&marker("data_1.json")),
            Utc::now(),
        );
        assert!(matches!(again, Err(StateError::AlreadyIngested(_))));

        // The rejected ingest rolled back entirely.
        assert_eq!(store.get("P1").unwrap().unwrap().available_spaces, 1);
        assert_eq!(store.last_batch_seq().unwrap(), 1);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();

        assert!(store.get_checkpoint("postgres").unwrap().is_none());

        let checkpoint = Checkpoint {
            seq: 12,
            rows_committed: 100,
            updated_at: None,
        };
        store.save_checkpoint("postgres", &checkpoint).unwrap();

        let loaded = store.get_checkpoint("postgres").unwrap().unwrap();
        assert_eq!(loaded.seq, 12);
        assert_eq!(loaded.rows_committed, 100);
        assert!(loaded.updated_at.is_some());
    }

    #[test]
    fn test_checkpoint_never_moves_backwards() {
        let store = SqliteStore::in_memory().unwrap();

        store
            .save_checkpoint("file", &Checkpoint { seq: 5, rows_committed: 50, updated_at: None })
            .unwrap();
        store
            .save_checkpoint("file", &Checkpoint { seq: 3, rows_committed: 30, updated_at: None })
            .unwrap();

        assert_eq!(store.get_checkpoint("file").unwrap().unwrap().seq, 5);
    }

    #[test]
    fn test_get_min_seq() {
        let store = SqliteStore::in_memory().unwrap();

        assert!(store.get_min_seq().unwrap().is_none());

        for (name, seq) in [("a", 30), ("b", 10), ("c", 20)] {
            store
                .save_checkpoint(name, &Checkpoint { seq, rows_committed: 0, updated_at: None })
                .unwrap();
        }

        assert_eq!(store.get_min_seq().unwrap(), Some(10));
        assert_eq!(store.get_all_checkpoints().unwrap().len(), 3);
    }

    #[test]
    fn test_dead_letter_advances_checkpoint() {
        let store = SqliteStore::in_memory().unwrap();
        let batch = ingest_one(&store, "P1", 4);

        let id = store.dead_letter("postgres", &batch, "connection refused", 5).unwrap();

        assert_eq!(store.get_checkpoint("postgres").unwrap().unwrap().seq, batch.seq);

        let letter = store.get_dead_letter(id).unwrap().unwrap();
        assert_eq!(letter.sink_name, "postgres");
        assert_eq!(letter.attempts, 5);
        assert_eq!(letter.rows, batch.rows);

        assert_eq!(store.get_dead_letters(Some("postgres"), 10).unwrap().len(), 1);
        assert!(store.get_dead_letters(Some("file"), 10).unwrap().is_empty());
        assert_eq!(store.get_dead_letters(None, 10).unwrap().len(), 1);

        assert!(store.delete_dead_letter(id).unwrap());
        assert!(!store.delete_dead_letter(id).unwrap());
    }

    #[test]
    fn test_clear_dead_letters_by_sink() {
        let store = SqliteStore::in_memory().unwrap();
        let batch = ingest_one(&store, "P1", 4);
        store.dead_letter("a", &batch, "boom", 1).unwrap();
        store.dead_letter("b", &batch, "boom", 1).unwrap();

        assert_eq!(store.clear_dead_letters(Some("a")).unwrap(), 1);
        assert_eq!(store.summary().unwrap().dead_letters, 1);
        assert_eq!(store.clear_dead_letters(None).unwrap(), 1);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("parkflow.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            ingest_one(&store, "P1", 10);
            store
                .save_checkpoint("file", &Checkpoint { seq: 1, rows_committed: 1, updated_at: None })
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("P1").unwrap().unwrap().available_spaces, 10);
        assert_eq!(store.last_batch_seq().unwrap(), 1);
        assert_eq!(store.get_checkpoint("file").unwrap().unwrap().seq, 1);

        let summary = store.summary().unwrap();
        assert_eq!(summary.facilities, 1);
        assert_eq!(summary.logged_batches, 1);
    }
}

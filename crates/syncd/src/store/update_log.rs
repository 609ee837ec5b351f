// Durable per-document update log with clock-based compaction.
//
// One row per update: (doc_name, version, action, clock, value). Clocks
// increase by exactly one per append. A single state-vector row per document
// (version "v1_sv") records the applied-through position and the clock at
// which it was last written.
//
// Every multi-step operation runs inside one IMMEDIATE transaction, so the
// read-max-clock-then-append sequence cannot interleave with another writer.
// That transaction is the per-document write serialization the log requires;
// callers need no external locking.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::engine::WorkspaceDoc;

const UPDATE_VERSION: &str = "v1";
const STATE_VECTOR_VERSION: &str = "v1_sv";
const ACTION_UPDATE: &str = "update";
const ACTION_STATE_VECTOR: &str = "sv";

/// Stored state-vector record for a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateVectorRecord {
    pub clock: i64,
    pub value: Vec<u8>,
}

pub struct UpdateLogStore {
    conn: Mutex<Connection>,
}

impl UpdateLogStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).with_context(|| {
            format!("failed to open update log database `{}`", path.as_ref().display())
        })?;
        Self::with_connection(conn)
    }

    /// In-memory store for tests and local development.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory update log")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS update_log (
                 doc_name TEXT NOT NULL,
                 version  TEXT NOT NULL,
                 action   TEXT NOT NULL,
                 clock    INTEGER NOT NULL,
                 value    BLOB NOT NULL,
                 PRIMARY KEY (doc_name, version, clock)
             );",
        )
        .context("failed to initialize update_log schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Append `update` for `doc_name` and return the clock it was stored at.
    ///
    /// A brand-new document also gets a state-vector record at clock 0,
    /// derived from the update itself.
    pub fn store_update(&self, doc_name: &str, update: &[u8]) -> Result<i64> {
        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin update append transaction")?;

        let current = max_clock(&tx, doc_name)?;
        if current < 0 {
            let scratch = WorkspaceDoc::from_update(update)
                .context("failed to initialize scratch document from first update")?;
            write_state_vector(&tx, doc_name, 0, &scratch.encode_state_vector())?;
        }

        let clock = current + 1;
        tx.execute(
            "INSERT INTO update_log (doc_name, version, action, clock, value) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![doc_name, UPDATE_VERSION, ACTION_UPDATE, clock, update],
        )
        .context("failed to insert update record")?;

        tx.commit().context("failed to commit update append")?;
        Ok(clock)
    }

    /// Collapse the document's raw update records into one consolidated
    /// full-state record, tagging the state vector with the new clock.
    ///
    /// Idempotent: when the log is already fully compacted (one update record
    /// whose clock matches the state vector's), the call returns the existing
    /// clock without touching the log.
    pub fn flush_document(
        &self,
        doc_name: &str,
        full_state: &[u8],
        state_vector: &[u8],
    ) -> Result<i64> {
        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin flush transaction")?;

        let current = max_clock(&tx, doc_name)?;
        let update_count: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM update_log WHERE doc_name = ?1 AND version = ?2",
                params![doc_name, UPDATE_VERSION],
                |row| row.get(0),
            )
            .context("failed to count update records")?;
        let sv_clock = read_state_vector(&tx, doc_name)?.map(|record| record.clock);

        if update_count == 1 && sv_clock == Some(current) {
            // Already consolidated; a repeat flush must not advance the clock.
            tx.commit().context("failed to commit no-op flush")?;
            return Ok(current);
        }

        let clock = current + 1;
        tx.execute(
            "INSERT INTO update_log (doc_name, version, action, clock, value) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![doc_name, UPDATE_VERSION, ACTION_UPDATE, clock, full_state],
        )
        .context("failed to insert consolidated record")?;
        write_state_vector(&tx, doc_name, clock, state_vector)?;
        tx.execute(
            "DELETE FROM update_log \
             WHERE doc_name = ?1 AND version = ?2 AND clock >= 0 AND clock < ?3",
            params![doc_name, UPDATE_VERSION, clock],
        )
        .context("failed to delete compacted update records")?;

        tx.commit().context("failed to commit flush")?;
        Ok(clock)
    }

    /// Merge `updates` into a disposable scratch document and return the
    /// consolidated full-state update plus the resulting state vector.
    /// Pure function of its inputs; result is order-independent.
    pub fn merge_updates(updates: &[Vec<u8>]) -> Result<(Vec<u8>, Vec<u8>)> {
        let scratch = WorkspaceDoc::new();
        for update in updates {
            scratch.apply_update(update).context("failed to merge update into scratch doc")?;
        }
        Ok((scratch.encode_state(), scratch.encode_state_vector()))
    }

    /// Highest stored clock for `doc_name`, or −1 when no records exist.
    pub fn current_update_clock(&self, doc_name: &str) -> Result<i64> {
        let conn = self.lock_conn()?;
        max_clock(&conn, doc_name)
    }

    /// All update payloads for `doc_name` in clock order.
    pub fn updates_in_clock_order(&self, doc_name: &str) -> Result<Vec<Vec<u8>>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT value FROM update_log \
                 WHERE doc_name = ?1 AND version = ?2 \
                 ORDER BY clock ASC",
            )
            .context("failed to prepare update scan")?;
        let rows = stmt
            .query_map(params![doc_name, UPDATE_VERSION], |row| row.get::<_, Vec<u8>>(0))
            .context("failed to query update records")?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to collect update records")
    }

    /// The document's state-vector record, if one has been written.
    pub fn state_vector(&self, doc_name: &str) -> Result<Option<StateVectorRecord>> {
        let conn = self.lock_conn()?;
        read_state_vector(&conn, doc_name)
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("update log connection mutex poisoned"))
    }
}

fn max_clock(conn: &Connection, doc_name: &str) -> Result<i64> {
    let clock: Option<i64> = conn
        .query_row(
            "SELECT clock FROM update_log \
             WHERE doc_name = ?1 AND version = ?2 \
             ORDER BY clock DESC LIMIT 1",
            params![doc_name, UPDATE_VERSION],
            |row| row.get(0),
        )
        .optional()
        .context("failed to query current update clock")?;
    Ok(clock.unwrap_or(-1))
}

fn read_state_vector(conn: &Connection, doc_name: &str) -> Result<Option<StateVectorRecord>> {
    conn.query_row(
        "SELECT clock, value FROM update_log \
         WHERE doc_name = ?1 AND version = ?2",
        params![doc_name, STATE_VECTOR_VERSION],
        |row| Ok(StateVectorRecord { clock: row.get(0)?, value: row.get(1)? }),
    )
    .optional()
    .context("failed to query state vector record")
}

fn write_state_vector(
    conn: &Connection,
    doc_name: &str,
    clock: i64,
    state_vector: &[u8],
) -> Result<()> {
    conn.execute(
        "DELETE FROM update_log WHERE doc_name = ?1 AND version = ?2",
        params![doc_name, STATE_VECTOR_VERSION],
    )
    .context("failed to clear previous state vector record")?;
    conn.execute(
        "INSERT INTO update_log (doc_name, version, action, clock, value) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![doc_name, STATE_VECTOR_VERSION, ACTION_STATE_VECTOR, clock, state_vector],
    )
    .context("failed to insert state vector record")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use yrs::{Map, Transact};

    use super::UpdateLogStore;
    use crate::engine::doc::ROOT_MAP;
    use crate::engine::WorkspaceDoc;

    fn seeded_update(client_id: u64, key: &str, value: &str) -> Vec<u8> {
        let doc = WorkspaceDoc::with_client_id(client_id);
        let root = doc.inner().get_or_insert_map(ROOT_MAP);
        let mut txn = doc.inner().transact_mut();
        root.insert(&mut txn, key, value);
        txn.encode_update_v1()
    }

    #[test]
    fn clocks_start_at_zero_and_increase_by_one() {
        let store = UpdateLogStore::open_in_memory().expect("store should open");

        assert_eq!(store.current_update_clock("team:t1").expect("clock query"), -1);

        let first = seeded_update(1, "p1", "a");
        assert_eq!(store.store_update("team:t1", &first).expect("first append"), 0);
        assert_eq!(store.store_update("team:t1", &seeded_update(1, "p2", "b")).expect("second"), 1);
        assert_eq!(store.current_update_clock("team:t1").expect("clock query"), 1);

        // Other documents are independent.
        assert_eq!(store.current_update_clock("user:u1").expect("clock query"), -1);
    }

    #[test]
    fn first_append_writes_state_vector_at_clock_zero() {
        let store = UpdateLogStore::open_in_memory().expect("store should open");
        store.store_update("team:t1", &seeded_update(7, "p1", "a")).expect("append");

        let record = store
            .state_vector("team:t1")
            .expect("state vector query")
            .expect("state vector should exist");
        assert_eq!(record.clock, 0);
        assert!(!record.value.is_empty());
    }

    #[test]
    fn merge_is_order_independent() {
        let base = WorkspaceDoc::with_client_id(1);
        {
            let root = base.inner().get_or_insert_map(ROOT_MAP);
            let mut txn = base.inner().transact_mut();
            root.insert(&mut txn, "seed", "state");
        }
        let seed = base.encode_state();
        let update_a = seeded_update(2, "a", "1");
        let update_b = seeded_update(3, "b", "2");
        let update_c = seeded_update(4, "c", "3");

        let forward = vec![seed.clone(), update_a.clone(), update_b.clone(), update_c.clone()];
        let reversed = vec![update_c, update_b, update_a, seed];

        let (state_fwd, _) = UpdateLogStore::merge_updates(&forward).expect("forward merge");
        let (state_rev, _) = UpdateLogStore::merge_updates(&reversed).expect("reversed merge");

        let doc_fwd = WorkspaceDoc::from_update(&state_fwd).expect("forward state loads");
        let doc_rev = WorkspaceDoc::from_update(&state_rev).expect("reversed state loads");
        for key in ["seed", "a", "b", "c"] {
            assert_eq!(
                doc_fwd.value_at_path(&[key.to_string()]),
                doc_rev.value_at_path(&[key.to_string()]),
                "merged docs should agree on `{key}`"
            );
        }
        assert_ne!(doc_fwd.value_at_path(&["a".to_string()]), None);
    }

    #[test]
    fn flush_collapses_log_and_reconstructs_state() {
        let store = UpdateLogStore::open_in_memory().expect("store should open");
        let doc = WorkspaceDoc::with_client_id(1);

        for (key, value) in [("p1", "a"), ("p2", "b"), ("p3", "c")] {
            let update = {
                let root = doc.inner().get_or_insert_map(ROOT_MAP);
                let mut txn = doc.inner().transact_mut();
                root.insert(&mut txn, key, value);
                txn.encode_update_v1()
            };
            store.store_update("team:t1", &update).expect("append");
        }
        assert_eq!(store.updates_in_clock_order("team:t1").expect("scan").len(), 3);

        let clock = store
            .flush_document("team:t1", &doc.encode_state(), &doc.encode_state_vector())
            .expect("flush");
        assert_eq!(clock, 3);

        let remaining = store.updates_in_clock_order("team:t1").expect("scan");
        assert_eq!(remaining.len(), 1);
        let restored = WorkspaceDoc::from_update(&remaining[0]).expect("consolidated state loads");
        assert_eq!(restored.value_at_path(&["p2".to_string()]), Some(json!("b")));

        let record = store
            .state_vector("team:t1")
            .expect("state vector query")
            .expect("state vector should exist");
        assert_eq!(record.clock, 3);
    }

    #[test]
    fn flush_is_idempotent_without_intervening_updates() {
        let store = UpdateLogStore::open_in_memory().expect("store should open");
        let doc = WorkspaceDoc::with_client_id(1);
        let update = {
            let root = doc.inner().get_or_insert_map(ROOT_MAP);
            let mut txn = doc.inner().transact_mut();
            root.insert(&mut txn, "p1", "a");
            txn.encode_update_v1()
        };
        store.store_update("team:t1", &update).expect("append");

        let full_state = doc.encode_state();
        let state_vector = doc.encode_state_vector();

        let first = store.flush_document("team:t1", &full_state, &state_vector).expect("flush");
        let second =
            store.flush_document("team:t1", &full_state, &state_vector).expect("repeat flush");

        assert_eq!(first, second);
        assert_eq!(store.updates_in_clock_order("team:t1").expect("scan").len(), 1);
        assert_eq!(
            store
                .state_vector("team:t1")
                .expect("state vector query")
                .expect("state vector should exist")
                .clock,
            first
        );
    }

    #[test]
    fn appends_after_flush_continue_from_consolidated_clock() {
        let store = UpdateLogStore::open_in_memory().expect("store should open");
        let doc = WorkspaceDoc::with_client_id(1);
        let update = {
            let root = doc.inner().get_or_insert_map(ROOT_MAP);
            let mut txn = doc.inner().transact_mut();
            root.insert(&mut txn, "p1", "a");
            txn.encode_update_v1()
        };
        store.store_update("team:t1", &update).expect("append");
        let flushed_at = store
            .flush_document("team:t1", &doc.encode_state(), &doc.encode_state_vector())
            .expect("flush");

        let next = store.store_update("team:t1", &seeded_update(2, "p2", "b")).expect("append");
        assert_eq!(next, flushed_at + 1);
    }
}

// Binds a live session's document to the durable update log.
//
// The binding owns the compaction cadence: it counts raw appends and tells
// the session when the log should be consolidated. The store itself never
// decides when to compact.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::store::UpdateLogStore;

pub struct PersistenceBinding {
    store: Arc<UpdateLogStore>,
    doc_name: String,
    compaction_threshold: u64,
    appended_since_flush: u64,
}

impl PersistenceBinding {
    pub fn bind(store: Arc<UpdateLogStore>, doc_name: &str, compaction_threshold: u64) -> Self {
        Self {
            store,
            doc_name: doc_name.to_string(),
            compaction_threshold,
            appended_since_flush: 0,
        }
    }

    pub fn doc_name(&self) -> &str {
        &self.doc_name
    }

    /// Replay every stored update in clock order through `on_update`.
    /// Returns the number of updates applied.
    pub fn load<F>(&self, mut on_update: F) -> Result<usize>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let updates = self
            .store
            .updates_in_clock_order(&self.doc_name)
            .context("failed to read stored updates for session load")?;
        for update in &updates {
            on_update(update).context("failed to apply stored update during session load")?;
        }
        Ok(updates.len())
    }

    /// Append one raw update; returns the clock it was stored at.
    pub fn append(&mut self, update: &[u8]) -> Result<i64> {
        let clock = self.store.store_update(&self.doc_name, update)?;
        self.appended_since_flush += 1;
        Ok(clock)
    }

    /// True once enough raw updates accumulated to warrant consolidation.
    pub fn should_flush(&self) -> bool {
        self.appended_since_flush >= self.compaction_threshold
    }

    /// Consolidate the log down to one full-state record.
    pub fn flush(&mut self, full_state: &[u8], state_vector: &[u8]) -> Result<i64> {
        let clock = self.store.flush_document(&self.doc_name, full_state, state_vector)?;
        self.appended_since_flush = 0;
        Ok(clock)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use yrs::{Map, Transact};

    use super::PersistenceBinding;
    use crate::engine::doc::ROOT_MAP;
    use crate::engine::WorkspaceDoc;
    use crate::store::UpdateLogStore;

    fn update_for(doc: &WorkspaceDoc, key: &str, value: &str) -> Vec<u8> {
        let root = doc.inner().get_or_insert_map(ROOT_MAP);
        let mut txn = doc.inner().transact_mut();
        root.insert(&mut txn, key, value);
        txn.encode_update_v1()
    }

    #[test]
    fn load_replays_appended_updates_in_order() {
        let store = Arc::new(UpdateLogStore::open_in_memory().expect("store should open"));
        let mut binding = PersistenceBinding::bind(Arc::clone(&store), "team:t1", 400);

        let writer = WorkspaceDoc::with_client_id(1);
        binding.append(&update_for(&writer, "p1", "a")).expect("append");
        binding.append(&update_for(&writer, "p2", "b")).expect("append");

        let replica = WorkspaceDoc::with_client_id(2);
        let reload = PersistenceBinding::bind(store, "team:t1", 400);
        let applied = reload.load(|update| replica.apply_update(update)).expect("load");

        assert_eq!(applied, 2);
        assert_eq!(
            replica.value_at_path(&["p2".to_string()]),
            Some(serde_json::json!("b"))
        );
    }

    #[test]
    fn flush_trigger_follows_the_configured_threshold() {
        let store = Arc::new(UpdateLogStore::open_in_memory().expect("store should open"));
        let mut binding = PersistenceBinding::bind(store, "team:t1", 3);
        let writer = WorkspaceDoc::with_client_id(1);

        binding.append(&update_for(&writer, "p1", "a")).expect("append");
        binding.append(&update_for(&writer, "p2", "b")).expect("append");
        assert!(!binding.should_flush());

        binding.append(&update_for(&writer, "p3", "c")).expect("append");
        assert!(binding.should_flush());

        binding
            .flush(&writer.encode_state(), &writer.encode_state_vector())
            .expect("flush should succeed");
        assert!(!binding.should_flush());
    }
}

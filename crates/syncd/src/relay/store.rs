// Durable side of the relay: job ownership records and the append-only
// event history per job key.
//
// Payloads are stored as raw JSON and validated on receipt by the
// subscription loop, matching the producer-side contract (the execution
// engine writes whatever it has; the relay never forwards unvalidated
// data).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use apiforge_common::types::ExecutionAgent;

use crate::error::SyncError;

/// Ownership record for one test job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub job_id: Uuid,
    /// Doc key of the scope that started the job.
    pub scope_key: String,
    pub agent: ExecutionAgent,
}

#[async_trait::async_trait]
pub trait JobEventStore: Send + Sync {
    /// Resolve a job's ownership record. Absence is terminal, never retried.
    async fn lookup_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, SyncError>;

    /// All durable events for `job_key` in append order. A job's history is
    /// bounded, so reading it in full is safe.
    async fn history(&self, job_key: &str) -> Result<Vec<serde_json::Value>, SyncError>;

    async fn append(&self, job_key: &str, payload: serde_json::Value) -> Result<(), SyncError>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryJobEventStore {
    jobs: Arc<RwLock<HashMap<Uuid, JobRecord>>>,
    events: Arc<RwLock<HashMap<String, Vec<serde_json::Value>>>>,
}

impl MemoryJobEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_job(&self, record: JobRecord) {
        self.jobs.write().await.insert(record.job_id, record);
    }
}

#[async_trait::async_trait]
impl JobEventStore for MemoryJobEventStore {
    async fn lookup_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, SyncError> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn history(&self, job_key: &str) -> Result<Vec<serde_json::Value>, SyncError> {
        Ok(self.events.read().await.get(job_key).cloned().unwrap_or_default())
    }

    async fn append(&self, job_key: &str, payload: serde_json::Value) -> Result<(), SyncError> {
        self.events.write().await.entry(job_key.to_string()).or_default().push(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use apiforge_common::types::ExecutionAgent;

    use super::{JobEventStore, JobRecord, MemoryJobEventStore};

    #[tokio::test]
    async fn history_preserves_append_order_per_key() {
        let store = MemoryJobEventStore::new();
        store.append("job:team:t1:j1", json!({"seq": 1})).await.expect("append");
        store.append("job:team:t1:j1", json!({"seq": 2})).await.expect("append");
        store.append("job:cloud:j2", json!({"seq": 9})).await.expect("append");

        let history = store.history("job:team:t1:j1").await.expect("history");
        assert_eq!(history, vec![json!({"seq": 1}), json!({"seq": 2})]);
        assert_eq!(store.history("job:none").await.expect("history").len(), 0);
    }

    #[tokio::test]
    async fn job_lookup_round_trips() {
        let store = MemoryJobEventStore::new();
        let record = JobRecord {
            job_id: Uuid::new_v4(),
            scope_key: "team:t1".to_string(),
            agent: ExecutionAgent::Local,
        };
        store.register_job(record.clone()).await;

        assert_eq!(store.lookup_job(record.job_id).await.expect("lookup"), Some(record));
        assert_eq!(store.lookup_job(Uuid::new_v4()).await.expect("lookup"), None);
    }
}

// Scope-keyed registry of live collaborative sessions.
//
// The registry lock is the outer lock; session locks are only taken while
// it is held (join, eviction) or independently afterwards. Join and evict
// both run under the registry lock, so a connection can never attach to a
// session that eviction is about to orphan.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::SyncError;
use crate::session::{CollabSession, PersistenceBinding};
use crate::store::UpdateLogStore;

pub struct SessionRegistry {
    store: Arc<UpdateLogStore>,
    compaction_threshold: u64,
    sessions: Mutex<HashMap<String, Arc<CollabSession>>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<UpdateLogStore>, compaction_threshold: u64) -> Self {
        Self { store, compaction_threshold, sessions: Mutex::new(HashMap::new()) }
    }

    /// Attach a connection to the scope's session, creating and loading the
    /// session on first use.
    pub async fn join(
        &self,
        scope_key: &str,
        conn_id: Uuid,
        outbound: mpsc::Sender<Vec<u8>>,
    ) -> Result<Arc<CollabSession>, SyncError> {
        let mut sessions = self.sessions.lock().await;
        let session = self.get_or_create_locked(&mut sessions, scope_key)?;
        session.join(conn_id, outbound).await;
        Ok(session)
    }

    /// Detach a connection; evicts the session if it became idle.
    pub async fn leave(&self, scope_key: &str, session: &CollabSession, conn_id: Uuid) {
        if session.leave(conn_id).await {
            self.evict_if_idle(scope_key).await;
        }
    }

    /// Run a document write against the scope's session. The writer is
    /// registered under the registry lock so eviction cannot race it, and
    /// the session is evicted afterwards if the write was its only occupant.
    pub async fn write<F>(&self, scope_key: &str, op: F) -> Result<(), SyncError>
    where
        F: Fn(&yrs::Doc) -> Result<Vec<u8>, SyncError> + Send + Sync,
    {
        let session = {
            let mut sessions = self.sessions.lock().await;
            let session = self.get_or_create_locked(&mut sessions, scope_key)?;
            session.begin_write().await;
            session
        };

        let result = session.perform_write(op).await;

        if session.end_write().await {
            self.evict_if_idle(scope_key).await;
        }
        result
    }

    /// Drop the session if it is still idle. Re-checks under both locks so
    /// a connection that joined in the meantime keeps its session.
    pub async fn evict_if_idle(&self, scope_key: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(scope_key) else {
            return false;
        };
        if !session.flush_if_idle().await {
            return false;
        }
        sessions.remove(scope_key);
        tracing::info!(scope_key, "evicted idle collaborative session");
        true
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn get_or_create_locked(
        &self,
        sessions: &mut HashMap<String, Arc<CollabSession>>,
        scope_key: &str,
    ) -> Result<Arc<CollabSession>, SyncError> {
        if let Some(session) = sessions.get(scope_key) {
            return Ok(Arc::clone(session));
        }

        let binding =
            PersistenceBinding::bind(Arc::clone(&self.store), scope_key, self.compaction_threshold);
        let session = Arc::new(CollabSession::open(scope_key, binding)?);
        sessions.insert(scope_key.to_string(), Arc::clone(&session));
        tracing::info!(scope_key, "created collaborative session");
        Ok(session)
    }
}

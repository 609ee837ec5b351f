// Scope lookup capability.
//
// Scopes are owned by the external workspace service; the sync server only
// resolves them by id. The in-memory implementation backs tests and local
// development.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use apiforge_common::types::Scope;

use crate::error::SyncError;

#[async_trait::async_trait]
pub trait ScopeDirectory: Send + Sync {
    /// Resolve a scope by id. Absence is terminal, never retried.
    async fn lookup(&self, scope_id: Uuid) -> Result<Scope, SyncError>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryScopeDirectory {
    scopes: Arc<RwLock<HashMap<Uuid, Scope>>>,
}

impl MemoryScopeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, scope: Scope) {
        self.scopes.write().await.insert(scope.id, scope);
    }
}

#[async_trait::async_trait]
impl ScopeDirectory for MemoryScopeDirectory {
    async fn lookup(&self, scope_id: Uuid) -> Result<Scope, SyncError> {
        self.scopes
            .read()
            .await
            .get(&scope_id)
            .cloned()
            .ok_or_else(|| SyncError::ScopeNotFound(scope_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use apiforge_common::types::{Scope, ScopeVariant};

    use super::{MemoryScopeDirectory, ScopeDirectory};
    use crate::error::SyncError;

    #[tokio::test]
    async fn lookup_returns_inserted_scope() {
        let directory = MemoryScopeDirectory::new();
        let scope = Scope {
            id: Uuid::new_v4(),
            variant: ScopeVariant::Team,
            variant_target_id: "team-42".to_string(),
            user_id: None,
        };
        directory.insert(scope.clone()).await;

        let resolved = directory.lookup(scope.id).await.expect("scope should resolve");
        assert_eq!(resolved, scope);
    }

    #[tokio::test]
    async fn unknown_scope_is_not_found() {
        let directory = MemoryScopeDirectory::new();
        let result = directory.lookup(Uuid::new_v4()).await;
        assert!(matches!(result, Err(SyncError::ScopeNotFound(_))));
    }
}

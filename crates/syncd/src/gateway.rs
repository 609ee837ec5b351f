// External write gateway: authenticated server-side writes into a scope's
// workspace document, used by backend services that are not sync peers.
//
// A write lands at a path inside the nested map tree. Clients create the
// containers, so a write can arrive before its parent container exists;
// the gateway retries on a fixed cadence while that race settles.

use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use crate::auth::JwtIdentityService;
use crate::engine::doc as workspace;
use crate::error::SyncError;
use crate::scope::ScopeDirectory;
use crate::session::SessionRegistry;

#[derive(Debug, Clone, Deserialize)]
pub struct SetValueRequest {
    pub scope_id: Uuid,
    pub path: Vec<String>,
    pub value: serde_json::Value,
}

pub struct ExternalWriteGateway {
    identity: Arc<JwtIdentityService>,
    scopes: Arc<dyn ScopeDirectory>,
    registry: Arc<SessionRegistry>,
}

impl ExternalWriteGateway {
    pub fn new(
        identity: Arc<JwtIdentityService>,
        scopes: Arc<dyn ScopeDirectory>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self { identity, scopes, registry }
    }

    /// Write `value` at `path` in the scope's document.
    ///
    /// The token must have been issued for the scope's doc key. The write
    /// retries while the parent container is missing; exhaustion surfaces
    /// as `WriteTargetNotReady`.
    pub async fn set_value(&self, token: &str, request: SetValueRequest) -> Result<(), SyncError> {
        let identity = self.identity.verify(token).map_err(|error| {
            tracing::warn!(?error, "gateway write rejected, token did not verify");
            SyncError::Unauthorized
        })?;
        let scope = self.scopes.lookup(request.scope_id).await?;

        let doc_key = scope.doc_key();
        if identity.scope_key != doc_key {
            tracing::warn!(
                scope_id = %request.scope_id,
                user_id = %identity.user_id,
                "gateway write rejected, token issued for a different scope"
            );
            return Err(SyncError::ScopeForbidden);
        }

        tracing::info!(
            scope_key = %doc_key,
            user_id = %identity.user_id,
            path = ?request.path,
            "gateway write"
        );
        self.registry
            .write(&doc_key, |doc| {
                workspace::set_value_at_path(doc, &request.path, request.value.clone())
            })
            .await
    }
}

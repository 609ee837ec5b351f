// HTTP surface of the sync server.
//
// `GET /sync/{scope_id}` upgrades to the binary y-sync protocol and binds
// the connection to the scope's collaborative session. `GET /jobs/{job_id}`
// upgrades to the JSON relay transport. `POST /gateway/value` is the
// external write gateway. WebSocket clients cannot always set headers, so
// both upgrade routes accept the bearer token as a `token` query parameter
// as well.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use apiforge_common::protocol::ws::RelayWsMessage;
use apiforge_common::types::ExecutionAgent;

use crate::auth::{JwtIdentityService, VerifiedIdentity};
use crate::error::SyncError;
use crate::gateway::{ExternalWriteGateway, SetValueRequest};
use crate::relay::RelayService;
use crate::scope::ScopeDirectory;
use crate::session::{CollabSession, SessionRegistry, OUTBOUND_QUEUE_FRAMES};

#[derive(Clone)]
pub struct AppState {
    pub identity: Arc<JwtIdentityService>,
    pub scopes: Arc<dyn ScopeDirectory>,
    pub registry: Arc<SessionRegistry>,
    pub gateway: Arc<ExternalWriteGateway>,
    pub relay: Arc<RelayService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sync/{scope_id}", get(sync_ws_upgrade))
        .route("/jobs/{job_id}", get(relay_ws_upgrade))
        .route("/gateway/value", post(gateway_set_value))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct SyncQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RelayQuery {
    token: Option<String>,
    agent: ExecutionAgent,
}

fn bearer_token(headers: &HeaderMap, query_token: Option<String>) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION) {
        if let Some(token) = value.to_str().ok().and_then(|raw| raw.strip_prefix("Bearer ")) {
            return Some(token.to_string());
        }
    }
    query_token
}

fn error_response(error: &SyncError) -> Response {
    let status = match error {
        SyncError::Unauthorized => StatusCode::UNAUTHORIZED,
        SyncError::ScopeForbidden => StatusCode::FORBIDDEN,
        SyncError::ScopeNotFound(_) | SyncError::JobNotFound(_) => StatusCode::NOT_FOUND,
        SyncError::WriteTargetNotReady => StatusCode::CONFLICT,
        SyncError::MalformedFrame(_) => StatusCode::BAD_REQUEST,
        SyncError::Persistence(_) | SyncError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({
            "code": error.code(),
            "message": error.to_string(),
            "retryable": error.retryable(),
        })),
    )
        .into_response()
}

fn verify_token(
    identity: &JwtIdentityService,
    headers: &HeaderMap,
    query_token: Option<String>,
) -> Result<VerifiedIdentity, SyncError> {
    let token = bearer_token(headers, query_token).ok_or(SyncError::Unauthorized)?;
    identity.verify(&token).map_err(|error| {
        tracing::warn!(?error, "rejected bearer token");
        SyncError::Unauthorized
    })
}

async fn sync_ws_upgrade(
    Path(scope_id): Path<Uuid>,
    Query(query): Query<SyncQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match verify_token(&state.identity, &headers, query.token) {
        Ok(identity) => identity,
        Err(error) => return error_response(&error),
    };

    let scope = match state.scopes.lookup(scope_id).await {
        Ok(scope) => scope,
        Err(error) => return error_response(&error),
    };

    let doc_key = scope.doc_key();
    if identity.scope_key != doc_key {
        return error_response(&SyncError::ScopeForbidden);
    }

    ws.on_upgrade(move |socket| handle_sync_socket(state, doc_key, socket))
}

async fn handle_sync_socket(state: AppState, doc_key: String, mut socket: WebSocket) {
    let conn_id = Uuid::new_v4();
    let (outbound, mut frames) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE_FRAMES);

    let session: Arc<CollabSession> = match state.registry.join(&doc_key, conn_id, outbound).await {
        Ok(session) => session,
        Err(error) => {
            tracing::error!(scope_key = %doc_key, ?error, "failed to open collaborative session");
            let _ = socket.send(WsMessage::Close(None)).await;
            return;
        }
    };
    let mut session_errors = session.subscribe_errors();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else {
                    break;
                };
                match message {
                    WsMessage::Binary(payload) => {
                        // A bad frame is the sender's problem; the connection
                        // and its peers keep going.
                        if let Err(error) = session.receive(conn_id, payload.as_ref()).await {
                            tracing::warn!(scope_key = %doc_key, %conn_id, ?error, "dropped sync frame");
                        }
                    }
                    WsMessage::Close(_) => break,
                    WsMessage::Ping(payload) => {
                        if socket.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Pong(_) | WsMessage::Text(_) => {}
                }
            }
            frame = frames.recv() => {
                match frame {
                    Some(payload) => {
                        if socket.send(WsMessage::Binary(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    // The session dropped this connection as a slow consumer.
                    None => break,
                }
            }
            // The y-sync wire has no error frame, so session faults
            // (persistence failures, rejected frames) surface here with the
            // connection's context; the document itself stays consistent.
            event = session_errors.recv() => {
                if let Ok(event) = event {
                    tracing::warn!(
                        scope_key = %doc_key,
                        %conn_id,
                        code = event.code,
                        retryable = event.retryable,
                        message = %event.message,
                        "session fault"
                    );
                }
            }
        }
    }

    state.registry.leave(&doc_key, &session, conn_id).await;
}

async fn relay_ws_upgrade(
    Path(job_id): Path<Uuid>,
    Query(query): Query<RelayQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match verify_token(&state.identity, &headers, query.token) {
        Ok(identity) => identity,
        Err(error) => return error_response(&error),
    };

    let agent = query.agent;
    ws.on_upgrade(move |socket| handle_relay_socket(state, identity, job_id, agent, socket))
}

async fn handle_relay_socket(
    state: AppState,
    identity: VerifiedIdentity,
    job_id: Uuid,
    agent: ExecutionAgent,
    mut socket: WebSocket,
) {
    let (outbound, mut frames) = mpsc::channel::<RelayWsMessage>(OUTBOUND_QUEUE_FRAMES);
    let subscription = {
        let relay = Arc::clone(&state.relay);
        tokio::spawn(
            async move { relay.run_subscription(&identity, job_id, agent, outbound).await },
        )
    };

    loop {
        tokio::select! {
            frame = frames.recv() => {
                match frame {
                    Some(message) => {
                        if send_relay_frame(&mut socket, &message).await.is_err() {
                            subscription.abort();
                            return;
                        }
                    }
                    // Sender dropped: the subscription ran to completion or
                    // failed; its result decides the closing frame.
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if socket.send(WsMessage::Pong(payload)).await.is_err() {
                            subscription.abort();
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                        subscription.abort();
                        return;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    match subscription.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            let frame = RelayWsMessage::Error {
                code: error.code().to_string(),
                message: error.to_string(),
                retryable: error.retryable(),
            };
            let _ = send_relay_frame(&mut socket, &frame).await;
        }
        Err(join_error) => {
            tracing::error!(%job_id, ?join_error, "relay subscription task panicked");
        }
    }
    let _ = socket.send(WsMessage::Close(None)).await;
}

async fn send_relay_frame(
    socket: &mut WebSocket,
    message: &RelayWsMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(encoded) => socket.send(WsMessage::Text(encoded.into())).await,
        Err(error) => {
            tracing::error!(?error, "failed to encode relay frame");
            Ok(())
        }
    }
}

async fn gateway_set_value(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SetValueRequest>,
) -> Response {
    let Some(token) = bearer_token(&headers, None) else {
        return error_response(&SyncError::Unauthorized);
    };

    match state.gateway.set_value(&token, request).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(&error),
    }
}

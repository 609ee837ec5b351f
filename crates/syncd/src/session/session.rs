// One live collaborative session per scope document.
//
// All session mutation (y-sync frames, presence changes, gateway writes,
// connection churn) is serialized behind a single async mutex. Outbound
// frames go through bounded per-connection queues; a connection that cannot
// keep up is disconnected rather than allowed to stall the session.

use std::collections::{HashMap, HashSet};

use anyhow::Context;
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;
use yrs::encoding::read::Cursor;
use yrs::sync::awareness::AwarenessUpdateEntry;
use yrs::sync::{
    Awareness, AwarenessUpdate, DefaultProtocol, Message, MessageReader, Protocol, SyncMessage,
};
use yrs::updates::decoder::{Decode, DecoderV1};
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::engine::doc as workspace;
use crate::error::SyncError;
use crate::retry::{retry_fixed, RetryOutcome, WRITE_RETRY_ATTEMPTS, WRITE_RETRY_DELAY};
use crate::session::PersistenceBinding;

/// Capacity of each connection's outbound frame queue.
pub const OUTBOUND_QUEUE_FRAMES: usize = 256;

const ERROR_CHANNEL_SIZE: usize = 16;

/// Non-fatal session fault surfaced to connected handlers (for example a
/// persistence failure while the in-memory document stayed consistent).
#[derive(Debug, Clone)]
pub struct SessionErrorEvent {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

struct ConnectionState {
    outbound: mpsc::Sender<Vec<u8>>,
    /// Awareness client IDs whose presence entries this connection owns.
    presence_clients: HashSet<u64>,
}

struct SessionInner {
    awareness: Awareness,
    connections: HashMap<Uuid, ConnectionState>,
    pending_writers: usize,
    persistence: PersistenceBinding,
}

pub struct CollabSession {
    scope_key: String,
    inner: Mutex<SessionInner>,
    errors: broadcast::Sender<SessionErrorEvent>,
}

impl CollabSession {
    /// Materialize the session by replaying the scope's update log into a
    /// fresh document.
    pub(crate) fn open(scope_key: &str, persistence: PersistenceBinding) -> Result<Self, SyncError> {
        let doc = Doc::new();
        let loaded = persistence
            .load(|update| {
                let decoded =
                    Update::decode_v1(update).context("failed to decode stored update")?;
                doc.transact_mut()
                    .apply_update(decoded)
                    .context("failed to apply stored update")?;
                Ok(())
            })
            .map_err(SyncError::Persistence)?;

        tracing::debug!(scope_key, updates = loaded, "collaborative session loaded");

        let (errors, _) = broadcast::channel(ERROR_CHANNEL_SIZE);
        Ok(Self {
            scope_key: scope_key.to_string(),
            inner: Mutex::new(SessionInner {
                awareness: Awareness::new(doc),
                connections: HashMap::new(),
                pending_writers: 0,
                persistence,
            }),
            errors,
        })
    }

    pub fn scope_key(&self) -> &str {
        &self.scope_key
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<SessionErrorEvent> {
        self.errors.subscribe()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    pub async fn join(&self, conn_id: Uuid, outbound: mpsc::Sender<Vec<u8>>) {
        let mut guard = self.inner.lock().await;
        guard.connections.insert(
            conn_id,
            ConnectionState { outbound, presence_clients: HashSet::new() },
        );
        tracing::debug!(scope_key = %self.scope_key, %conn_id, "connection joined session");
    }

    /// Process one inbound binary frame from `conn_id`.
    ///
    /// Document updates fan out to every connection, the sender included;
    /// clients reconcile their own echo. A malformed message stops further
    /// decoding, but whatever the same frame already applied and persisted
    /// is still delivered so peers cannot diverge from the session doc.
    pub async fn receive(&self, conn_id: Uuid, payload: &[u8]) -> Result<(), SyncError> {
        let protocol = DefaultProtocol;
        let mut direct = Vec::new();
        let mut broadcasts = Vec::new();

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let mut decoder = DecoderV1::new(Cursor::new(payload));
        let mut reader = MessageReader::new(&mut decoder);

        let mut outcome = Ok(());
        while let Some(next_message) = reader.next() {
            let message = match next_message {
                Ok(message) => message,
                Err(error) => {
                    outcome = Err(SyncError::MalformedFrame(format!(
                        "failed to decode y-sync message: {error}"
                    )));
                    break;
                }
            };
            if let Err(error) =
                self.handle_message(inner, conn_id, message, &protocol, &mut direct, &mut broadcasts)
            {
                outcome = Err(error);
                break;
            }
        }

        let mut dropped = Vec::new();
        if let Some(conn) = inner.connections.get(&conn_id) {
            for frame in direct {
                if conn.outbound.try_send(frame).is_err() {
                    dropped.push(conn_id);
                    break;
                }
            }
        }
        for frame in &broadcasts {
            for (id, conn) in inner.connections.iter() {
                if conn.outbound.try_send(frame.clone()).is_err() && !dropped.contains(id) {
                    dropped.push(*id);
                }
            }
        }
        self.drop_connections_locked(inner, &dropped);

        if let Err(error) = &outcome {
            self.notify_error(error);
        }
        outcome
    }

    fn handle_message(
        &self,
        inner: &mut SessionInner,
        conn_id: Uuid,
        message: Message,
        protocol: &DefaultProtocol,
        direct: &mut Vec<Vec<u8>>,
        broadcasts: &mut Vec<Vec<u8>>,
    ) -> Result<(), SyncError> {
        match message {
            Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                if let Some(response) = protocol
                    .handle_sync_step1(&inner.awareness, state_vector)
                    .map_err(sync_protocol_error)?
                {
                    direct.push(response.encode_v1());
                }

                // The server initiates its own step 1 so the client sends
                // back whatever the server is missing.
                let server_sv = inner.awareness.doc().transact().state_vector();
                direct.push(Message::Sync(SyncMessage::SyncStep1(server_sv)).encode_v1());
            }
            Message::Sync(SyncMessage::SyncStep2(update)) => {
                let decoded = Update::decode_v1(&update).map_err(|error| {
                    SyncError::MalformedFrame(format!(
                        "failed to decode sync step 2 update: {error}"
                    ))
                })?;
                protocol
                    .handle_sync_step2(&inner.awareness, decoded)
                    .map_err(sync_protocol_error)?;

                // Step-2 carries client updates during handshake; fan it
                // out as a regular update.
                self.persist_update(inner, &update);
                broadcasts.push(Message::Sync(SyncMessage::Update(update)).encode_v1());
            }
            Message::Sync(SyncMessage::Update(update)) => {
                let decoded = Update::decode_v1(&update).map_err(|error| {
                    SyncError::MalformedFrame(format!(
                        "failed to decode incremental update: {error}"
                    ))
                })?;
                protocol
                    .handle_update(&inner.awareness, decoded)
                    .map_err(sync_protocol_error)?;

                self.persist_update(inner, &update);
                broadcasts.push(Message::Sync(SyncMessage::Update(update)).encode_v1());
            }
            Message::Awareness(update) => {
                if let Some(frame) = apply_awareness_update(inner, conn_id, update)? {
                    broadcasts.push(frame);
                }
            }
            other => {
                if let Some(response) = protocol
                    .handle_message(&inner.awareness, other)
                    .map_err(sync_protocol_error)?
                {
                    direct.push(response.encode_v1());
                }
            }
        }
        Ok(())
    }

    /// Remove `conn_id` from the session, broadcasting the departure of any
    /// presence entries it owned. Returns true when the session is now idle
    /// (no connections, no in-flight writers) and has been flushed.
    pub async fn leave(&self, conn_id: Uuid) -> bool {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if let Some(frame) = remove_connection(inner, conn_id) {
            let missed = broadcast_frame(inner, &frame);
            self.drop_connections_locked(inner, &missed);
        }
        tracing::debug!(scope_key = %self.scope_key, %conn_id, "connection left session");

        let idle = inner.connections.is_empty() && inner.pending_writers == 0;
        if idle {
            self.flush_locked(inner);
        }
        idle
    }

    /// Register an in-flight external writer so the session is not evicted
    /// from under it. Must be paired with [`end_write`](Self::end_write).
    pub async fn begin_write(&self) {
        self.inner.lock().await.pending_writers += 1;
    }

    /// Returns true when the session became idle and was flushed.
    pub async fn end_write(&self) -> bool {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.pending_writers = inner.pending_writers.saturating_sub(1);

        let idle = inner.connections.is_empty() && inner.pending_writers == 0;
        if idle {
            self.flush_locked(inner);
        }
        idle
    }

    /// Apply a document write produced by `op`, retrying on
    /// `WriteTargetNotReady` while client-side container initialization
    /// settles. The resulting update is persisted and broadcast like any
    /// client-originated update.
    pub async fn perform_write<F>(&self, op: F) -> Result<(), SyncError>
    where
        F: Fn(&Doc) -> Result<Vec<u8>, SyncError> + Send + Sync,
    {
        let op = &op;
        retry_fixed(WRITE_RETRY_ATTEMPTS, WRITE_RETRY_DELAY, move |attempt| async move {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            match op(inner.awareness.doc()) {
                Ok(update) => {
                    self.persist_update(inner, &update);
                    let frame = Message::Sync(SyncMessage::Update(update)).encode_v1();
                    let dropped = broadcast_frame(inner, &frame);
                    self.drop_connections_locked(inner, &dropped);
                    RetryOutcome::Done(())
                }
                Err(SyncError::WriteTargetNotReady) => {
                    tracing::debug!(
                        scope_key = %self.scope_key,
                        attempt,
                        "write target not ready, will retry"
                    );
                    RetryOutcome::Transient(SyncError::WriteTargetNotReady)
                }
                Err(other) => RetryOutcome::Fatal(other),
            }
        })
        .await
    }

    /// Flush when idle; used by the registry before eviction. Returns
    /// whether the session was idle.
    pub async fn flush_if_idle(&self) -> bool {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if !inner.connections.is_empty() || inner.pending_writers > 0 {
            return false;
        }
        self.flush_locked(inner);
        true
    }

    pub async fn value_at_path(&self, path: &[String]) -> Option<serde_json::Value> {
        let guard = self.inner.lock().await;
        workspace::value_at_path(guard.awareness.doc(), path)
    }

    fn persist_update(&self, inner: &mut SessionInner, update: &[u8]) {
        match inner.persistence.append(update) {
            Ok(_) => {
                if inner.persistence.should_flush() {
                    self.flush_locked(inner);
                }
            }
            Err(error) => {
                // The in-memory document already applied the update; clients
                // stay consistent and durability converges at the next
                // successful flush.
                tracing::error!(
                    scope_key = %self.scope_key,
                    ?error,
                    "failed to persist document update"
                );
                self.notify_error(&SyncError::Persistence(error));
            }
        }
    }

    fn flush_locked(&self, inner: &mut SessionInner) {
        let (full_state, state_vector) = {
            let txn = inner.awareness.doc().transact();
            (
                txn.encode_state_as_update_v1(&StateVector::default()),
                txn.state_vector().encode_v1(),
            )
        };
        if let Err(error) = inner.persistence.flush(&full_state, &state_vector) {
            tracing::error!(scope_key = %self.scope_key, ?error, "failed to flush update log");
            self.notify_error(&SyncError::Persistence(error));
        }
    }

    /// Publish a session fault to error subscribers. Best effort: a session
    /// with no subscriber only gets the log line.
    fn notify_error(&self, error: &SyncError) {
        let _ = self.errors.send(SessionErrorEvent {
            code: error.code(),
            message: error.to_string(),
            retryable: error.retryable(),
        });
    }

    /// Disconnect every listed connection, retracting its presence. A peer
    /// whose queue is too full for the retraction is dropped as well, so the
    /// worklist can grow while it drains.
    fn drop_connections_locked(&self, inner: &mut SessionInner, conn_ids: &[Uuid]) {
        let mut pending = conn_ids.to_vec();
        while let Some(conn_id) = pending.pop() {
            tracing::warn!(
                scope_key = %self.scope_key,
                %conn_id,
                "disconnecting slow consumer, outbound queue full"
            );
            if let Some(frame) = remove_connection(inner, conn_id) {
                pending.extend(broadcast_frame(inner, &frame));
            }
        }
    }
}

fn sync_protocol_error(error: yrs::sync::Error) -> SyncError {
    SyncError::MalformedFrame(format!("y-sync protocol error: {error}"))
}

/// Apply a presence update and record which awareness clients the origin
/// connection now owns. Returns the rebroadcast frame, if any state changed.
fn apply_awareness_update(
    inner: &mut SessionInner,
    conn_id: Uuid,
    update: AwarenessUpdate,
) -> Result<Option<Vec<u8>>, SyncError> {
    let Some(summary) = inner.awareness.apply_update_summary(update).map_err(|error| {
        SyncError::MalformedFrame(format!("failed to apply awareness update: {error}"))
    })?
    else {
        return Ok(None);
    };

    if let Some(conn) = inner.connections.get_mut(&conn_id) {
        for client in &summary.added {
            conn.presence_clients.insert(*client);
        }
        // A reconnecting client keeps its awareness client ID; ownership
        // follows whichever connection last spoke for it.
        for client in &summary.updated {
            conn.presence_clients.insert(*client);
        }
        for client in &summary.removed {
            conn.presence_clients.remove(client);
        }
    }

    let changed_clients = summary.all_changes();
    if changed_clients.is_empty() {
        return Ok(None);
    }

    let rebroadcast = inner.awareness.update_with_clients(changed_clients).map_err(|error| {
        SyncError::Internal(anyhow::anyhow!("failed to encode awareness rebroadcast: {error}"))
    })?;
    Ok(Some(Message::Awareness(rebroadcast).encode_v1()))
}

/// Drop the connection and retract the presence entries it owned. Returns
/// the retraction frame to broadcast, if there was any owned presence.
fn remove_connection(inner: &mut SessionInner, conn_id: Uuid) -> Option<Vec<u8>> {
    let conn = inner.connections.remove(&conn_id)?;
    if conn.presence_clients.is_empty() {
        return None;
    }

    let entries: Vec<(u64, u32)> = inner
        .awareness
        .iter()
        .filter_map(|(client_id, state)| {
            conn.presence_clients.contains(&client_id).then_some((client_id, state.clock))
        })
        .collect();
    if entries.is_empty() {
        return None;
    }

    // A null state at a bumped clock is the protocol's departure marker.
    let retraction = AwarenessUpdate {
        clients: entries
            .into_iter()
            .map(|(client_id, clock)| {
                (client_id, AwarenessUpdateEntry { clock: clock + 1, json: "null".into() })
            })
            .collect(),
    };

    let summary = match inner.awareness.apply_update_summary(retraction) {
        Ok(summary) => summary?,
        Err(error) => {
            tracing::warn!(%conn_id, ?error, "failed to retract presence for departed connection");
            return None;
        }
    };
    let changed_clients = summary.all_changes();
    if changed_clients.is_empty() {
        return None;
    }

    match inner.awareness.update_with_clients(changed_clients) {
        Ok(rebroadcast) => Some(Message::Awareness(rebroadcast).encode_v1()),
        Err(error) => {
            tracing::warn!(%conn_id, ?error, "failed to encode presence retraction");
            None
        }
    }
}

fn broadcast_frame(inner: &SessionInner, frame: &[u8]) -> Vec<Uuid> {
    let mut dropped = Vec::new();
    for (conn_id, conn) in inner.connections.iter() {
        if conn.outbound.try_send(frame.to_vec()).is_err() {
            dropped.push(*conn_id);
        }
    }
    dropped
}

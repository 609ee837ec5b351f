// Per-subscription reconciliation of a job's durable history with its live
// stream.
//
// The live channel is joined before the history read, so an event published
// during the handoff arrives twice rather than not at all; duplicates are
// filtered by exact (time, message) equality against the captured history.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Sleep};
use uuid::Uuid;

use apiforge_common::protocol::ws::RelayWsMessage;
use apiforge_common::types::{job_event_key, ExecutionAgent, RelayMessage};

use crate::auth::VerifiedIdentity;
use crate::error::SyncError;
use crate::relay::{EventBroker, JobEventStore};

/// How long a subscription stays open after a terminal message, so trailing
/// in-flight events still land.
pub const TERMINAL_GRACE: Duration = Duration::from_secs(10);

pub struct RelayService {
    store: Arc<dyn JobEventStore>,
    broker: Arc<EventBroker>,
}

impl RelayService {
    pub fn new(store: Arc<dyn JobEventStore>, broker: Arc<EventBroker>) -> Self {
        Self { store, broker }
    }

    /// Durable-then-live publish pipeline used by the event producer.
    pub async fn publish(&self, job_key: &str, payload: serde_json::Value) -> Result<(), SyncError> {
        self.store.append(job_key, payload.clone()).await?;
        self.broker.publish(job_key, payload).await;
        Ok(())
    }

    /// Drive one job subscription until the stream ends.
    ///
    /// Frames go out through `outbound`; the caller owns the socket. Returns
    /// `Ok(())` on a clean close (subscriber gone, channel closed, or the
    /// post-terminal grace window elapsed) and an error for authorization
    /// and lookup failures, before any job data has been emitted.
    pub async fn run_subscription(
        &self,
        identity: &VerifiedIdentity,
        job_id: Uuid,
        agent: ExecutionAgent,
        outbound: mpsc::Sender<RelayWsMessage>,
    ) -> Result<(), SyncError> {
        let record = self
            .store
            .lookup_job(job_id)
            .await?
            .ok_or_else(|| SyncError::JobNotFound(job_id.to_string()))?;

        if record.scope_key != identity.scope_key {
            tracing::warn!(
                %job_id,
                job_scope = %record.scope_key,
                caller_scope = %identity.scope_key,
                "relay subscription rejected, job owned by another scope"
            );
            return Err(SyncError::ScopeForbidden);
        }

        // The ownership record decides the keying; a request cannot select a
        // different stream by naming the wrong agent.
        if agent != record.agent {
            tracing::warn!(
                %job_id,
                requested_agent = ?agent,
                record_agent = ?record.agent,
                "subscription agent differs from the job record"
            );
        }
        let job_key = job_event_key(record.agent, &record.scope_key, &job_id.to_string());
        tracing::debug!(%job_id, job_key, "relay subscription started");

        // Join live before reading history; see module comment.
        let mut live = self.broker.subscribe(&job_key).await;

        let mut history = Vec::new();
        for payload in self.store.history(&job_key).await? {
            let Some(message) = validate_payload(&job_key, payload) else {
                continue;
            };
            history.push(message);
        }

        let latest_ts = history.iter().map(|message| message.time).max().unwrap_or(0);

        let mut close_at: Option<Pin<Box<Sleep>>> = None;
        for message in &history {
            if message.kind.is_terminal() && close_at.is_none() {
                close_at = Some(Box::pin(sleep(TERMINAL_GRACE)));
            }
            if emit(&outbound, message.clone()).await.is_err() {
                return Ok(());
            }
        }

        loop {
            tokio::select! {
                () = async { close_at.as_mut().unwrap().await }, if close_at.is_some() => {
                    tracing::debug!(job_key, "relay subscription closed after terminal grace");
                    return Ok(());
                }
                received = live.recv() => {
                    let payload = match received {
                        Ok(payload) => payload,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(job_key, skipped, "relay subscriber lagged live channel");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    };

                    let Some(message) = validate_payload(&job_key, payload) else {
                        continue;
                    };

                    // An older timestamp can only be a replay of something
                    // the history fetch already captured.
                    let duplicate = message.time <= latest_ts
                        && history.iter().any(|past| past.dedupe_matches(&message));
                    if duplicate {
                        continue;
                    }

                    if message.kind.is_terminal() && close_at.is_none() {
                        close_at = Some(Box::pin(sleep(TERMINAL_GRACE)));
                    }
                    if emit(&outbound, message).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Step-6 validation: a payload that does not parse as a relay message is
/// logged and dropped without breaking the stream.
fn validate_payload(job_key: &str, payload: serde_json::Value) -> Option<RelayMessage> {
    match serde_json::from_value::<RelayMessage>(payload) {
        Ok(message) => Some(message),
        Err(error) => {
            tracing::warn!(job_key, %error, "dropping malformed relay payload");
            None
        }
    }
}

async fn emit(
    outbound: &mpsc::Sender<RelayWsMessage>,
    message: RelayMessage,
) -> Result<(), mpsc::error::SendError<RelayWsMessage>> {
    outbound.send(RelayWsMessage::Updates { payload: message }).await
}

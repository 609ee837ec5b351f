// Core identity types shared between the sync server and its callers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which kind of workspace a scope addresses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopeVariant {
    User,
    Team,
}

impl ScopeVariant {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Team => "team",
        }
    }
}

/// A workspace identity. Immutable once created; owned by the scope service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scope {
    pub id: Uuid,
    pub variant: ScopeVariant,
    pub variant_target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

impl Scope {
    /// The collaborative document this scope maps to.
    ///
    /// Every connection and backend writer for the same scope must resolve
    /// the same key, so the format is part of the storage contract.
    pub fn doc_key(&self) -> String {
        format!("{}:{}", self.variant.as_str(), self.variant_target_id)
    }
}

/// Where a test job executes. `Local` jobs are additionally scoped by the
/// requesting workspace; `Cloud` jobs are global by job id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionAgent {
    Local,
    Cloud,
}

/// Deterministic key for a job's durable history set and its live channel.
pub fn job_event_key(agent: ExecutionAgent, scope_doc_key: &str, job_id: &str) -> String {
    match agent {
        ExecutionAgent::Local => format!("job:{scope_doc_key}:{job_id}"),
        ExecutionAgent::Cloud => format!("job:cloud:{job_id}"),
    }
}

/// Classification of a relay message. Terminal kinds end the subscription
/// after a grace window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelayMessageKind {
    Progress,
    Metrics,
    Log,
    Success,
    Failure,
    CompletedSuccess,
    CompletedFailure,
}

impl RelayMessageKind {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::CompletedSuccess | Self::CompletedFailure
        )
    }
}

/// One event from a test job's stream. Durable and live copies of the same
/// logical event are deduplicated by exact `(time, message)` equality.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayMessage {
    /// Producer timestamp in unix milliseconds.
    pub time: i64,
    pub kind: RelayMessageKind,
    pub message: serde_json::Value,
}

impl RelayMessage {
    /// Build an event stamped with the current wall-clock time.
    pub fn now(kind: RelayMessageKind, message: serde_json::Value) -> Self {
        Self { time: chrono::Utc::now().timestamp_millis(), kind, message }
    }

    pub fn dedupe_matches(&self, other: &RelayMessage) -> bool {
        self.time == other.time && self.message == other.message
    }
}

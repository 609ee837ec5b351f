// Workspace document wrapper using yrs (y-crdt Rust bindings).
//
// The root `projects` map holds the shared workspace tree:
// projects -> branches -> collections -> (folders, requests, responses).
// Clients create the containers; the server only merges updates and, for
// gateway writes, sets values at paths whose containers already exist.

use anyhow::{Context, Result};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, ReadTxn, StateVector, Transact, Update, Value};

use crate::error::SyncError;

pub const ROOT_MAP: &str = "projects";

/// Wrapper around a Yjs document holding one scope's workspace tree.
pub struct WorkspaceDoc {
    doc: Doc,
}

impl WorkspaceDoc {
    /// Create a new empty document.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Create a document with a specific client ID (for deterministic testing).
    pub fn with_client_id(client_id: u64) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self { doc: Doc::with_options(options) }
    }

    /// Load a document from a binary update (full snapshot or incremental).
    pub fn from_update(data: &[u8]) -> Result<Self> {
        let doc = Self::new();
        doc.apply_update(data)?;
        Ok(doc)
    }

    /// Apply a binary update to the document.
    pub fn apply_update(&self, data: &[u8]) -> Result<()> {
        let update = Update::decode_v1(data).context("failed to decode workspace update")?;
        self.doc
            .transact_mut()
            .apply_update(update)
            .context("failed to apply workspace update")?;
        Ok(())
    }

    /// Encode the full document state as a binary update blob.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the state vector (applied-through summary) for the sync protocol.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Compute a diff containing all changes since the given state vector.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_sv).context("failed to decode state vector")?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Set `value` at `path` under the root `projects` map.
    ///
    /// Every intermediate segment must already resolve to a map; a missing
    /// container is reported as `WriteTargetNotReady` so the caller can
    /// retry while the client-side initialization race settles.
    pub fn set_value_at_path(
        &self,
        path: &[String],
        value: serde_json::Value,
    ) -> Result<Vec<u8>, SyncError> {
        set_value_at_path(&self.doc, path, value)
    }

    /// Read the value at `path`, if present. Used by tests and the gateway's
    /// read-back verification.
    pub fn value_at_path(&self, path: &[String]) -> Option<serde_json::Value> {
        value_at_path(&self.doc, path)
    }

    /// Get the underlying Doc reference (for advanced operations).
    pub fn inner(&self) -> &Doc {
        &self.doc
    }
}

impl Default for WorkspaceDoc {
    fn default() -> Self {
        Self::new()
    }
}

/// Path write against a raw `Doc` (the session holds its doc inside an
/// `Awareness`, not a `WorkspaceDoc`). Returns the encoded update produced
/// by the write so callers can persist and broadcast it.
pub fn set_value_at_path(
    doc: &Doc,
    path: &[String],
    value: serde_json::Value,
) -> Result<Vec<u8>, SyncError> {
    let (last, parents) = path
        .split_last()
        .ok_or_else(|| SyncError::MalformedFrame("empty write path".to_string()))?;

    let root = doc.get_or_insert_map(ROOT_MAP);
    let mut txn = doc.transact_mut();

    let mut current: MapRef = root;
    for segment in parents {
        current = match current.get(&txn, segment) {
            Some(Value::YMap(map)) => map,
            _ => return Err(SyncError::WriteTargetNotReady),
        };
    }

    current.insert(&mut txn, last.as_str(), json_to_any(&value));
    Ok(txn.encode_update_v1())
}

/// Path read against a raw `Doc`.
pub fn value_at_path(doc: &Doc, path: &[String]) -> Option<serde_json::Value> {
    let txn = doc.transact();
    let mut current = txn.get_map(ROOT_MAP)?;

    let (last, parents) = path.split_last()?;
    for segment in parents {
        current = match current.get(&txn, segment) {
            Some(Value::YMap(map)) => map,
            _ => return None,
        };
    }

    current.get(&txn, last).map(|found| match found {
        Value::Any(any) => any_to_json(&any),
        other => serde_json::Value::String(other.to_string(&txn)),
    })
}

fn json_to_any(value: &serde_json::Value) -> Any {
    match value {
        serde_json::Value::Null => Any::Null,
        serde_json::Value::Bool(flag) => Any::Bool(*flag),
        serde_json::Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                Any::BigInt(int)
            } else {
                Any::Number(number.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(text) => Any::from(text.as_str()),
        serde_json::Value::Array(items) => {
            Any::from(items.iter().map(json_to_any).collect::<Vec<_>>())
        }
        serde_json::Value::Object(fields) => Any::from(
            fields
                .iter()
                .map(|(key, field)| (key.clone(), json_to_any(field)))
                .collect::<std::collections::HashMap<String, Any>>(),
        ),
    }
}

fn any_to_json(any: &Any) -> serde_json::Value {
    match any {
        Any::Null | Any::Undefined => serde_json::Value::Null,
        Any::Bool(flag) => serde_json::Value::Bool(*flag),
        Any::Number(number) => serde_json::Number::from_f64(*number)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Any::BigInt(int) => serde_json::Value::Number((*int).into()),
        Any::String(text) => serde_json::Value::String(text.to_string()),
        Any::Buffer(bytes) => serde_json::Value::Array(
            bytes.iter().map(|byte| serde_json::Value::Number((*byte).into())).collect(),
        ),
        Any::Array(items) => serde_json::Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(fields) => serde_json::Value::Object(
            fields.iter().map(|(key, field)| (key.clone(), any_to_json(field))).collect(),
        ),
    }
}

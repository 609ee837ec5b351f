// WebSocket message types for the apiforge relay transport.
//
// The collaborative-document endpoint speaks the binary y-sync protocol and
// does not use this envelope; relay subscriptions are JSON text frames.

use serde::{Deserialize, Serialize};

use crate::types::RelayMessage;

/// Server -> client events on a job subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayWsMessage {
    /// One relay message, durable or live.
    Updates { payload: RelayMessage },

    /// Terminal error; the connection closes after this frame.
    Error { code: String, message: String, retryable: bool },
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::RelayWsMessage;
    use crate::types::{RelayMessage, RelayMessageKind};

    #[test]
    fn updates_event_round_trips_as_tagged_json() {
        let message = RelayWsMessage::Updates {
            payload: RelayMessage {
                time: 1700000000000,
                kind: RelayMessageKind::Progress,
                message: json!({"pct": 12}),
            },
        };

        let encoded = serde_json::to_value(&message).expect("updates event should serialize");
        assert_eq!(encoded["event"], "updates");
        assert_eq!(encoded["payload"]["kind"], "progress");

        let decoded: RelayWsMessage =
            serde_json::from_value(encoded).expect("updates event should deserialize");
        assert_eq!(decoded, message);
    }

    #[test]
    fn error_event_carries_code_and_retryable_flag() {
        let encoded = serde_json::to_value(RelayWsMessage::Error {
            code: "AUTH_FORBIDDEN".to_string(),
            message: "scope mismatch".to_string(),
            retryable: false,
        })
        .expect("error event should serialize");

        assert_eq!(encoded["event"], "error");
        assert_eq!(encoded["code"], "AUTH_FORBIDDEN");
        assert_eq!(encoded["retryable"], false);
    }
}

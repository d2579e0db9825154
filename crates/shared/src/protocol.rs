use serde::{Deserialize, Serialize};

use crate::domain::{EventId, LocalEcho, RoomId};

/// One event submission. `event_id` doubles as the transaction id, so a
/// repeated submission of the same echo is deduplicated by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitEvent {
    pub event_id: EventId,
    pub room_id: RoomId,
    pub event_type: String,
    pub content: serde_json::Value,
}

impl SubmitEvent {
    pub fn from_echo(echo: &LocalEcho) -> Self {
        Self {
            event_id: echo.event.event_id.clone(),
            room_id: echo.event.room_id.clone(),
            event_type: echo.event.event_type.clone(),
            content: echo.event.content.clone(),
        }
    }
}

/// Server acknowledgment of a submitted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAck {
    pub event_id: EventId,
}

/// Error body returned by the homeserver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerErrorBody {
    pub errcode: String,
    #[serde(default)]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

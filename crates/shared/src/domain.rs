use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(RoomId);
id_newtype!(EventId);
id_newtype!(UserId);

/// Prefix carried by client-allocated event identifiers until the server
/// assigns the permanent one.
pub const LOCAL_ECHO_PREFIX: &str = "$local.";

impl EventId {
    pub fn new_local() -> Self {
        Self(format!("{LOCAL_ECHO_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ECHO_PREFIX)
    }
}

/// Delivery status of a local echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendState {
    Unsent,
    Encrypting,
    Sending,
    Sent,
    FailedUnknownDevices,
    Undelivered,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown send state '{0}'")]
pub struct UnknownSendState(pub String);

impl SendState {
    pub const ALL: [SendState; 6] = [
        SendState::Unsent,
        SendState::Encrypting,
        SendState::Sending,
        SendState::Sent,
        SendState::FailedUnknownDevices,
        SendState::Undelivered,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SendState::Unsent => "unsent",
            SendState::Encrypting => "encrypting",
            SendState::Sending => "sending",
            SendState::Sent => "sent",
            SendState::FailedUnknownDevices => "failed_unknown_devices",
            SendState::Undelivered => "undelivered",
        }
    }

    /// True once the pipeline will not touch the echo again on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SendState::Sent | SendState::FailedUnknownDevices | SendState::Undelivered
        )
    }

    /// Failed states the user may resend.
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            SendState::FailedUnknownDevices | SendState::Undelivered
        )
    }

    pub fn is_in_progress(self) -> bool {
        matches!(self, SendState::Encrypting | SendState::Sending)
    }

    /// Edges of the delivery state machine.
    ///
    /// `Sending -> Unsent` is the transient-retry edge, `Encrypting -> Unsent`
    /// is only taken by restart recovery, and `failed -> Unsent` is a manual
    /// resend. Nothing leaves `Sent`.
    pub fn can_transition_to(self, next: SendState) -> bool {
        use SendState::*;

        match (self, next) {
            (Unsent, Encrypting) | (Unsent, Sending) => true,
            (Encrypting, Sending) | (Encrypting, Undelivered) => true,
            (Encrypting, FailedUnknownDevices) | (Encrypting, Unsent) => true,
            (Sending, Sent) | (Sending, Unsent) => true,
            (Sending, Undelivered) | (Sending, FailedUnknownDevices) => true,
            (Undelivered, Unsent) | (FailedUnknownDevices, Unsent) => true,
            _ => false,
        }
    }

    /// States from which `next` may be entered.
    pub fn predecessors(next: SendState) -> Vec<SendState> {
        Self::ALL
            .into_iter()
            .filter(|state| state.can_transition_to(next))
            .collect()
    }
}

impl fmt::Display for SendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SendState {
    type Err = UnknownSendState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownSendState(s.to_string()))
    }
}

/// Room event as authored. Only its send state changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub room_id: RoomId,
    pub event_type: String,
    pub content: serde_json::Value,
    pub sender: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEcho {
    pub event: Event,
    pub send_state: SendState,
    /// Creation order across all rooms; echoes of one room sort by it.
    pub position: i64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl LocalEcho {
    pub fn event_id(&self) -> &EventId {
        &self.event.event_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.event.room_id
    }
}

/// Event acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedEvent {
    pub event_id: EventId,
    pub room_id: RoomId,
    pub event_type: String,
    pub content: serde_json::Value,
    pub sender: UserId,
    pub origin_ts: DateTime<Utc>,
    /// Local identifier the event was sent under, when it originated here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_event_id: Option<EventId>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoomTimeline {
    pub confirmed: Vec<ConfirmedEvent>,
    pub local: Vec<LocalEcho>,
}

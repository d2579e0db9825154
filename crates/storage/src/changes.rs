use shared::domain::{EventId, RoomId, SendState};
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};

/// Mutation published after it has been committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineChange {
    EchoAdded {
        room_id: RoomId,
        event_id: EventId,
    },
    SendStateChanged {
        room_id: RoomId,
        event_id: EventId,
        state: SendState,
    },
    EchoPromoted {
        room_id: RoomId,
        local_event_id: EventId,
        server_event_id: EventId,
    },
    EchoRemoved {
        room_id: RoomId,
        event_id: EventId,
    },
    RemoteEventAdded {
        room_id: RoomId,
        event_id: EventId,
    },
}

impl TimelineChange {
    pub fn room_id(&self) -> &RoomId {
        match self {
            TimelineChange::EchoAdded { room_id, .. }
            | TimelineChange::SendStateChanged { room_id, .. }
            | TimelineChange::EchoPromoted { room_id, .. }
            | TimelineChange::EchoRemoved { room_id, .. }
            | TimelineChange::RemoteEventAdded { room_id, .. } => room_id,
        }
    }
}

/// Lagging receivers skip what they missed; observers are expected to
/// re-read the store rather than rely on the feed for completeness.
pub(crate) fn change_stream(
    rx: broadcast::Receiver<TimelineChange>,
) -> impl Stream<Item = TimelineChange> {
    BroadcastStream::new(rx).filter_map(|change| change.ok())
}

//! JSON events carried over the websocket, tagged by `type`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{ContentType, Message, RoomDetails};

/// A message as submitted by its author. The sender is taken from the
/// connection, never from the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub key: String,
    pub room_id: Uuid,
    pub content: String,
    pub content_type: ContentType,
    /// Client clock, for the sender's optimistic placement only. The stored
    /// timestamp is always the server's and comes back in `messageDelivered`.
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    Message {
        message: NewMessage,
    },
    EditMessage {
        key: String,
        content: String,
        room_id: Uuid,
    },
    DeleteMessage {
        key: String,
        room_id: Uuid,
    },
    RoomSelected {
        room_id: Uuid,
    },
    TypingChanged {
        is_typing: bool,
        room_id: Uuid,
        // ignored, the connection identity wins
        #[serde(default)]
        username: Option<String>,
    },
    CreatePrivateRoom {
        request_id: Option<u64>,
        other_username: String,
    },
    CreateGroup {
        request_id: Option<u64>,
        usernames: Vec<String>,
        display_name: String,
    },
    AddParticipants {
        request_id: Option<u64>,
        room_id: Uuid,
        usernames: Vec<String>,
    },
    LeaveRoom {
        request_id: Option<u64>,
        room_id: Uuid,
    },
    DeleteRoom {
        request_id: Option<u64>,
        room_id: Uuid,
    },
}

impl ClientEvent {
    pub fn request_id(&self) -> Option<u64> {
        use ClientEvent::*;
        match self {
            CreatePrivateRoom { request_id, .. }
            | CreateGroup { request_id, .. }
            | AddParticipants { request_id, .. }
            | LeaveRoom { request_id, .. }
            | DeleteRoom { request_id, .. } => *request_id,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Message {
        message: Message,
    },
    MessageEdited {
        key: String,
        content: String,
        room_id: Uuid,
        edited_at: i64,
    },
    MessageDeleted {
        key: String,
        room_id: Uuid,
    },
    /// Sent to the originating connection once its message is persisted.
    MessageDelivered {
        key: String,
        room_id: Uuid,
        created_at: i64,
    },
    MessageFailed {
        key: String,
        room_id: Uuid,
    },
    TypingChanged {
        is_typing: bool,
        room_id: Uuid,
        username: String,
    },
    RoomsUpdated {
        rooms: Vec<RoomDetails>,
    },
    ParticipantsChanged {
        room_id: Uuid,
        usernames: Vec<String>,
    },
    RoomCreated {
        room_id: Uuid,
    },
    RoomDeleted {
        room_id: Uuid,
    },
    Reply {
        request_id: Option<u64>,
        room_id: Option<Uuid>,
    },
    Error {
        request_id: Option<u64>,
        kind: String,
        message: String,
        room_id: Option<Uuid>,
    },
}

impl ServerEvent {
    pub fn error(request_id: Option<u64>, err: &crate::appresult::SyncError) -> ServerEvent {
        ServerEvent::Error {
            request_id,
            kind: err.kind().to_owned(),
            message: err.to_string(),
            room_id: err.room_id(),
        }
    }
}

//! WebSocket protocol shared by [`RemoteStore`](crate::store::RemoteStore)
//! and the server.
//!
//! Messages are JSON objects tagged by `type`:
//! ```json
//! { "type": "list_strokes", "room": "r1" }
//! { "type": "append_stroke", "request_id": 7, "room": "r1", "draft": { ... } }
//! { "type": "strokes", "room": "r1", "strokes": [ ... ] }
//! { "type": "reply", "request_id": 7, "body": { "type": "ok" } }
//! ```
//! Stream messages (`strokes`, `room`) always carry a full snapshot.

use crate::store::{ErrorKind, StoreError, StoreResult};
use crate::stroke::{RoomId, RoomInfo, RoomSnapshot, Stroke, StrokeDraft, UserId, UserProfile};
use serde::{Deserialize, Serialize};

/// Correlates a request with its reply. Chosen by the client.
pub type RequestId = u64;

/// A message from a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving `room` snapshots.
    WatchRoom { room: RoomId },
    UnwatchRoom { room: RoomId },
    /// Start receiving `strokes` snapshots.
    ListStrokes { room: RoomId },
    UnlistStrokes { room: RoomId },
    AppendStroke {
        request_id: RequestId,
        room: RoomId,
        draft: StrokeDraft,
    },
    GetUsers {
        request_id: RequestId,
        ids: Vec<UserId>,
    },
    RegisterUser {
        request_id: RequestId,
        profile: UserProfile,
    },
    CreateRoom {
        request_id: RequestId,
        name: String,
        creator: UserId,
    },
    JoinRoom {
        request_id: RequestId,
        room: RoomId,
        user: UserId,
    },
    UserRooms {
        request_id: RequestId,
        user: UserId,
    },
    DeleteRoom {
        request_id: RequestId,
        room: RoomId,
    },
}

impl ClientMessage {
    /// The id a reply will carry, for request messages.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ClientMessage::AppendStroke { request_id, .. }
            | ClientMessage::GetUsers { request_id, .. }
            | ClientMessage::RegisterUser { request_id, .. }
            | ClientMessage::CreateRoom { request_id, .. }
            | ClientMessage::JoinRoom { request_id, .. }
            | ClientMessage::UserRooms { request_id, .. }
            | ClientMessage::DeleteRoom { request_id, .. } => Some(*request_id),
            ClientMessage::WatchRoom { .. }
            | ClientMessage::UnwatchRoom { .. }
            | ClientMessage::ListStrokes { .. }
            | ClientMessage::UnlistStrokes { .. } => None,
        }
    }
}

/// A message from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The room's complete stroke log, ascending by sequence.
    Strokes { room: RoomId, strokes: Vec<Stroke> },
    /// The room's metadata. `exists` is false once the room is deleted.
    Room { room: RoomId, snapshot: RoomSnapshot },
    Reply {
        request_id: RequestId,
        body: ReplyBody,
    },
}

/// Outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyBody {
    Ok,
    RoomCreated { room: RoomId },
    Users { users: Vec<UserProfile> },
    Rooms { rooms: Vec<RoomInfo> },
    Error { kind: ErrorKind, message: String },
}

impl ReplyBody {
    pub fn error(error: &StoreError) -> Self {
        let (kind, message) = error.to_wire();
        ReplyBody::Error { kind, message }
    }

    /// Turn an `error` body into `Err`, pass anything else through.
    pub fn into_result(self) -> StoreResult<ReplyBody> {
        match self {
            ReplyBody::Error { kind, message } => Err(StoreError::from_wire(kind, message)),
            body => Ok(body),
        }
    }
}

impl From<StoreResult<ReplyBody>> for ReplyBody {
    fn from(result: StoreResult<ReplyBody>) -> Self {
        result.unwrap_or_else(|e| ReplyBody::error(&e))
    }
}

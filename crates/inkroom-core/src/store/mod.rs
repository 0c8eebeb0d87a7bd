//! Contract with the document store that hosts rooms and stroke logs.
//!
//! The core only needs the four operations of [`StrokeStore`]. Room and user
//! management lives behind [`RoomDirectory`]; it is used by tools and tests
//! to set up the world the core runs in.
//!
//! All listeners run on the caller's thread. Stores deliver full snapshots,
//! never deltas.

mod memory;

#[cfg(not(target_arch = "wasm32"))]
mod remote;

pub use memory::MemoryStore;

#[cfg(not(target_arch = "wasm32"))]
pub use remote::RemoteStore;

use crate::stroke::{RoomId, RoomInfo, RoomSnapshot, Stroke, StrokeDraft, UserId, UserProfile};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Disconnected from store")]
    Disconnected,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Boxed future for store requests. Not `Send`: everything runs on one thread.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Receives every full, ordered stroke snapshot of a room. An `Err` ends the
/// stream.
pub type StrokeListener = Box<dyn FnMut(StoreResult<Vec<Stroke>>)>;

/// Receives every room snapshot. An `Err` ends the stream.
pub type RoomListener = Box<dyn FnMut(StoreResult<RoomSnapshot>)>;

/// Detaches a store listener.
///
/// Detaching is idempotent. Dropping the handle leaves the listener attached;
/// its owner decides when to let go.
#[must_use = "a listener stays attached until its handle is detached"]
pub struct ListenerHandle {
    detach: Option<Box<dyn FnOnce()>>,
}

impl ListenerHandle {
    pub fn new(detach: impl FnOnce() + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// A handle with nothing to detach.
    pub fn noop() -> Self {
        Self { detach: None }
    }

    pub fn detach(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }

    pub fn is_attached(&self) -> bool {
        self.detach.is_some()
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// What the synchronization core needs from the store.
pub trait StrokeStore {
    /// Listen to the room's strokes ordered by ascending sequence. The
    /// listener gets the whole list on first load and after every change.
    fn list_strokes(&self, room_id: &RoomId, listener: StrokeListener) -> ListenerHandle;

    /// Atomically append a stroke. The store assigns `id` and `sequence`.
    fn append_stroke(&self, room_id: &RoomId, draft: StrokeDraft) -> BoxFuture<'_, StoreResult<()>>;

    /// Listen to the room's metadata. `exists` turns false when the room is
    /// deleted.
    fn watch_room(&self, room_id: &RoomId, listener: RoomListener) -> ListenerHandle;

    /// Batch profile lookup, for labels only.
    fn get_users(&self, ids: &[UserId]) -> BoxFuture<'_, StoreResult<Vec<UserProfile>>>;
}

/// Room and user management, outside the synchronization core.
pub trait RoomDirectory {
    /// Create or replace a user profile.
    fn register_user(&self, profile: UserProfile) -> BoxFuture<'_, StoreResult<()>>;

    /// Create a room owned by `creator`, who becomes its first member.
    fn create_room(&self, name: &str, creator: &UserId) -> BoxFuture<'_, StoreResult<RoomId>>;

    /// Add `user` to the room. Joining twice is a no-op.
    fn join_room(&self, room_id: &RoomId, user: &UserId) -> BoxFuture<'_, StoreResult<()>>;

    /// Rooms the user belongs to.
    fn user_rooms(&self, user: &UserId) -> BoxFuture<'_, StoreResult<Vec<RoomInfo>>>;

    /// Delete a room and its stroke log.
    fn delete_room(&self, room_id: &RoomId) -> BoxFuture<'_, StoreResult<()>>;
}

/// Error category carried over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RoomNotFound,
    Unavailable,
    Rejected,
    Protocol,
}

impl StoreError {
    /// Wire category and message for this error.
    pub fn to_wire(&self) -> (ErrorKind, String) {
        match self {
            StoreError::RoomNotFound(room) => (ErrorKind::RoomNotFound, room.to_string()),
            StoreError::Unavailable(msg) => (ErrorKind::Unavailable, msg.clone()),
            StoreError::Disconnected => (ErrorKind::Unavailable, "disconnected".to_string()),
            StoreError::Protocol(msg) => (ErrorKind::Protocol, msg.clone()),
            StoreError::Rejected(msg) => (ErrorKind::Rejected, msg.clone()),
        }
    }

    /// Rebuild an error received over the wire.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::RoomNotFound => StoreError::RoomNotFound(RoomId(message)),
            ErrorKind::Unavailable => StoreError::Unavailable(message),
            ErrorKind::Rejected => StoreError::Rejected(message),
            ErrorKind::Protocol => StoreError::Protocol(message),
        }
    }
}

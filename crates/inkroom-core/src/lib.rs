//! InkRoom Core Library
//!
//! Stroke model, incremental canvas composition and real-time stroke
//! synchronization for a collaborative whiteboard. Rendering backends live in
//! `inkroom-render`; the store server lives in `inkroom-server`.

pub mod canvas;
pub mod color;
pub mod path;
pub mod protocol;
pub mod session;
pub mod store;
pub mod stroke;
pub mod sync;
pub mod tools;

pub use canvas::{DrawOp, Frame, Layer, begin_stroke, extend_stroke, render};
pub use color::{ColorParseError, StrokeColor};
pub use path::{InProgressPath, PathParseError, PathResult};
pub use session::{RoomSession, SessionStatus};
pub use store::{
    ListenerHandle, MemoryStore, RoomDirectory, StoreError, StoreResult, StrokeStore,
};
#[cfg(not(target_arch = "wasm32"))]
pub use store::RemoteStore;
pub use stroke::{
    CommittedStrokes, RoomId, RoomInfo, RoomSnapshot, Sequence, Stroke, StrokeDraft, StrokeId,
    UserId, UserProfile,
};
pub use sync::{StrokeSubscription, StrokeSynchronizer, SyncError, SyncResult};
pub use tools::{BACKGROUND_COLOR, PALETTE, THICKNESSES, ToolError, ToolSettings};

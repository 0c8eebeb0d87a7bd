//! Room, user and stroke-log state shared by every connection.

use dashmap::DashMap;
use inkroom_core::protocol::{ClientMessage, ReplyBody, ServerMessage};
use inkroom_core::store::{StoreError, StoreResult};
use inkroom_core::stroke::{
    RoomId, RoomInfo, RoomSnapshot, Sequence, Stroke, StrokeDraft, StrokeId, UserId, UserProfile,
};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// Snapshots buffered per room before a slow watcher starts lagging.
pub const CHANNEL_CAPACITY: usize = 64;

/// Full stroke log as broadcast to watchers.
pub type StrokeLog = Arc<Vec<Stroke>>;

/// Room state
struct Room {
    name: String,
    created_by: UserId,
    members: Vec<UserId>,
    /// Append-only, ascending by sequence.
    strokes: StrokeLog,
    last_sequence: u64,
    strokes_tx: broadcast::Sender<StrokeLog>,
    room_tx: broadcast::Sender<RoomSnapshot>,
}

impl Room {
    fn new(name: String, created_by: UserId, capacity: usize) -> Self {
        let (strokes_tx, _) = broadcast::channel(capacity);
        let (room_tx, _) = broadcast::channel(capacity);
        Self {
            name,
            members: vec![created_by.clone()],
            created_by,
            strokes: Arc::new(Vec::new()),
            last_sequence: 0,
            strokes_tx,
            room_tx,
        }
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            exists: true,
            members: self.members.clone(),
            name: self.name.clone(),
            created_by: Some(self.created_by.clone()),
        }
    }

    /// Next key: wall-clock milliseconds, bumped past the previous key.
    fn next_sequence(&mut self) -> Sequence {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.last_sequence = now.max(self.last_sequence + 1);
        Sequence(self.last_sequence)
    }
}

/// Shared application state
pub struct AppState {
    rooms: DashMap<RoomId, Room>,
    users: DashMap<UserId, UserProfile>,
    channel_capacity: usize,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    pub fn new() -> Self {
        Self::with_channel_capacity(CHANNEL_CAPACITY)
    }

    /// State whose rooms buffer `capacity` snapshots per channel.
    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            users: DashMap::new(),
            channel_capacity: capacity.max(1),
        }
    }

    pub fn register_user(&self, mut profile: UserProfile) {
        profile.rooms = self
            .rooms
            .iter()
            .filter(|room| room.members.contains(&profile.uid))
            .map(|room| room.key().clone())
            .collect();
        info!("Registered user {}", profile.uid);
        self.users.insert(profile.uid.clone(), profile);
    }

    /// Profiles of the known users among `ids`, in request order.
    pub fn get_users(&self, ids: &[UserId]) -> Vec<UserProfile> {
        ids.iter()
            .filter_map(|id| self.users.get(id).map(|p| p.value().clone()))
            .collect()
    }

    pub fn create_room(&self, name: &str, creator: &UserId) -> RoomId {
        let room_id = RoomId(Uuid::new_v4().to_string());
        let room = Room::new(name.to_string(), creator.clone(), self.channel_capacity);
        self.rooms.insert(room_id.clone(), room);
        if let Some(mut profile) = self.users.get_mut(creator) {
            profile.rooms.push(room_id.clone());
        }
        info!("Room {} ({}) created by {}", room_id, name, creator);
        room_id
    }

    /// Add a member. Joining twice changes nothing.
    pub fn join_room(&self, room_id: &RoomId, user: &UserId) -> StoreResult<()> {
        {
            let mut room = self
                .rooms
                .get_mut(room_id)
                .ok_or_else(|| StoreError::RoomNotFound(room_id.clone()))?;
            if room.members.contains(user) {
                return Ok(());
            }
            room.members.push(user.clone());
            let _ = room.room_tx.send(room.snapshot());
        }
        if let Some(mut profile) = self.users.get_mut(user) {
            profile.rooms.push(room_id.clone());
        }
        info!("User {} joined room {}", user, room_id);
        Ok(())
    }

    /// Rooms the user is a member of, by name.
    pub fn user_rooms(&self, user: &UserId) -> Vec<RoomInfo> {
        let mut rooms: Vec<RoomInfo> = self
            .rooms
            .iter()
            .filter(|room| room.members.contains(user))
            .map(|room| RoomInfo {
                id: room.key().clone(),
                name: room.name.clone(),
            })
            .collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        rooms
    }

    /// Drop a room and its log. Watchers get a final `exists: false`.
    pub fn delete_room(&self, room_id: &RoomId) -> StoreResult<()> {
        let (_, room) = self
            .rooms
            .remove(room_id)
            .ok_or_else(|| StoreError::RoomNotFound(room_id.clone()))?;
        let _ = room.room_tx.send(RoomSnapshot::missing());
        for mut profile in self.users.iter_mut() {
            profile.rooms.retain(|r| r != room_id);
        }
        info!("Room {} deleted", room_id);
        Ok(())
    }

    /// Validate, sequence and append a stroke, then push the new log.
    pub fn append_stroke(&self, room_id: &RoomId, draft: StrokeDraft) -> StoreResult<Stroke> {
        draft
            .validate()
            .map_err(|e| StoreError::Rejected(e.to_string()))?;
        let mut room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| StoreError::RoomNotFound(room_id.clone()))?;

        let sequence = room.next_sequence();
        let stroke = Stroke::commit(draft, StrokeId(Uuid::new_v4().to_string()), sequence);
        let mut strokes = Vec::with_capacity(room.strokes.len() + 1);
        strokes.extend_from_slice(&room.strokes);
        strokes.push(stroke.clone());
        room.strokes = Arc::new(strokes);
        let _ = room.strokes_tx.send(room.strokes.clone());

        debug!("Stroke {} appended to room {} at {}", stroke.id, room_id, sequence);
        Ok(stroke)
    }

    /// Current log, or `None` for an unknown room.
    pub fn strokes(&self, room_id: &RoomId) -> Option<StrokeLog> {
        self.rooms.get(room_id).map(|room| room.strokes.clone())
    }

    pub fn room_snapshot(&self, room_id: &RoomId) -> RoomSnapshot {
        self.rooms
            .get(room_id)
            .map(|room| room.snapshot())
            .unwrap_or_else(RoomSnapshot::missing)
    }

    /// Current log plus a receiver for every later one. Both are taken under
    /// the same lock so no append falls in between. An unknown room yields an
    /// empty log and no receiver.
    pub fn subscribe_strokes(
        &self,
        room_id: &RoomId,
    ) -> (StrokeLog, Option<broadcast::Receiver<StrokeLog>>) {
        match self.rooms.get(room_id) {
            Some(room) => (room.strokes.clone(), Some(room.strokes_tx.subscribe())),
            None => (Arc::new(Vec::new()), None),
        }
    }

    /// Current snapshot plus a receiver for every later one.
    pub fn subscribe_room(
        &self,
        room_id: &RoomId,
    ) -> (RoomSnapshot, Option<broadcast::Receiver<RoomSnapshot>>) {
        match self.rooms.get(room_id) {
            Some(room) => (room.snapshot(), Some(room.room_tx.subscribe())),
            None => (RoomSnapshot::missing(), None),
        }
    }

    /// Answer a request message. Stream messages get no reply.
    pub fn respond(&self, message: ClientMessage) -> Option<ServerMessage> {
        let (request_id, result) = match message {
            ClientMessage::AppendStroke { request_id, room, draft } => (
                request_id,
                self.append_stroke(&room, draft).map(|_| ReplyBody::Ok),
            ),
            ClientMessage::GetUsers { request_id, ids } => (
                request_id,
                Ok(ReplyBody::Users {
                    users: self.get_users(&ids),
                }),
            ),
            ClientMessage::RegisterUser { request_id, profile } => {
                self.register_user(profile);
                (request_id, Ok(ReplyBody::Ok))
            }
            ClientMessage::CreateRoom { request_id, name, creator } => (
                request_id,
                Ok(ReplyBody::RoomCreated {
                    room: self.create_room(&name, &creator),
                }),
            ),
            ClientMessage::JoinRoom { request_id, room, user } => (
                request_id,
                self.join_room(&room, &user).map(|_| ReplyBody::Ok),
            ),
            ClientMessage::UserRooms { request_id, user } => (
                request_id,
                Ok(ReplyBody::Rooms {
                    rooms: self.user_rooms(&user),
                }),
            ),
            ClientMessage::DeleteRoom { request_id, room } => (
                request_id,
                self.delete_room(&room).map(|_| ReplyBody::Ok),
            ),
            ClientMessage::WatchRoom { .. }
            | ClientMessage::UnwatchRoom { .. }
            | ClientMessage::ListStrokes { .. }
            | ClientMessage::UnlistStrokes { .. } => return None,
        };
        if let Err(e) = &result {
            debug!("Request {} failed: {}", request_id, e);
        }
        Some(ServerMessage::Reply {
            request_id,
            body: result.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkroom_core::color::StrokeColor;
    use tokio::sync::broadcast::error::RecvError;

    fn draft(path: &str, thickness: f64) -> StrokeDraft {
        StrokeDraft {
            path: path.to_string(),
            color: StrokeColor::WHITE,
            thickness,
            author_id: UserId::from("alice"),
        }
    }

    #[tokio::test]
    async fn test_sequence_strictly_increases() {
        let state = AppState::new();
        let room = state.create_room("board", &UserId::from("alice"));

        for _ in 0..20 {
            state.append_stroke(&room, draft("M0,0 L1,1", 3.0)).unwrap();
        }
        let log = state.strokes(&room).unwrap();
        assert_eq!(log.len(), 20);
        assert!(log.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[tokio::test]
    async fn test_invalid_drafts_rejected() {
        let state = AppState::new();
        let room = state.create_room("board", &UserId::from("alice"));

        assert!(matches!(state.append_stroke(&room, draft("", 3.0)), Err(StoreError::Rejected(_))));
        assert!(matches!(
            state.append_stroke(&room, draft("M0,0 L1,1", f64::NAN)),
            Err(StoreError::Rejected(_))
        ));
        assert!(matches!(
            state.append_stroke(&room, draft("M0,0 L1,1", 0.0)),
            Err(StoreError::Rejected(_))
        ));
        assert_eq!(
            state.append_stroke(&RoomId::from("nope"), draft("M0,0 L1,1", 3.0)).map(|_| ()),
            Err(StoreError::RoomNotFound(RoomId::from("nope")))
        );
        assert!(state.strokes(&room).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watchers_get_full_snapshots() {
        let state = AppState::new();
        let room = state.create_room("board", &UserId::from("alice"));
        let (initial, rx) = state.subscribe_strokes(&room);
        let mut rx = rx.unwrap();
        assert!(initial.is_empty());

        let first = state.append_stroke(&room, draft("M0,0 L1,1", 3.0)).unwrap();
        let second = state.append_stroke(&room, draft("M2,2 L3,3", 6.0)).unwrap();

        assert_eq!(rx.recv().await.unwrap().len(), 1);
        let log = rx.recv().await.unwrap();
        let ids: Vec<_> = log.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_delete_notifies_watchers() {
        let state = AppState::new();
        let room = state.create_room("board", &UserId::from("alice"));
        let (snapshot, rx) = state.subscribe_room(&room);
        let mut rx = rx.unwrap();
        assert!(snapshot.exists);

        state.delete_room(&room).unwrap();
        assert!(!rx.recv().await.unwrap().exists);
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
        assert!(!state.room_snapshot(&room).exists);
        assert!(state.delete_room(&room).is_err());
    }

    #[tokio::test]
    async fn test_membership() {
        let state = AppState::new();
        state.register_user(UserProfile {
            uid: UserId::from("bob"),
            name: "Bob".to_string(),
            email: "bob@example.com".to_string(),
            reg_no: "7".to_string(),
            rooms: Vec::new(),
        });
        state.create_room("Beta", &UserId::from("alice"));
        let a = state.create_room("Alpha", &UserId::from("alice"));
        let (_, rx) = state.subscribe_room(&a);
        let mut rx = rx.unwrap();

        state.join_room(&a, &UserId::from("bob")).unwrap();
        state.join_room(&a, &UserId::from("bob")).unwrap();
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.members, vec![UserId::from("alice"), UserId::from("bob")]);
        assert!(rx.try_recv().is_err());

        let names: Vec<_> = state
            .user_rooms(&UserId::from("alice"))
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["Alpha", "Beta"]);
        assert_eq!(state.get_users(&[UserId::from("bob")])[0].rooms, vec![a]);
    }

    #[tokio::test]
    async fn test_respond_wraps_errors() {
        let state = AppState::new();
        let reply = state.respond(ClientMessage::JoinRoom {
            request_id: 9,
            room: RoomId::from("ghost"),
            user: UserId::from("bob"),
        });
        assert_eq!(
            reply,
            Some(ServerMessage::Reply {
                request_id: 9,
                body: ReplyBody::error(&StoreError::RoomNotFound(RoomId::from("ghost"))),
            })
        );
        assert_eq!(state.respond(ClientMessage::ListStrokes { room: RoomId::from("x") }), None);
    }
}

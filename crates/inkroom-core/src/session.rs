//! One user's drawing session in one room.
//!
//! The session wires touch input to the canvas and the synchronizer. It owns
//! the live [`InProgressPath`] and the room's stroke subscription; everything
//! else belongs to the store.

use crate::canvas::{self, Frame, begin_stroke, extend_stroke};
use crate::path::InProgressPath;
use crate::store::{BoxFuture, StoreResult, StrokeStore};
use crate::stroke::{CommittedStrokes, RoomId, UserId, UserProfile};
use crate::sync::{StrokeSubscription, StrokeSynchronizer, SyncError, SyncResult};
use crate::tools::ToolSettings;
use kurbo::Point;
use std::cell::Cell;
use std::rc::Rc;

/// Where a session stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    /// The room went away or its streams failed. Input is ignored.
    Ended(SyncError),
    /// The user left.
    Left,
}

/// A user drawing in a room.
pub struct RoomSession<S: StrokeStore + 'static> {
    room_id: RoomId,
    user_id: UserId,
    synchronizer: StrokeSynchronizer<S>,
    subscription: StrokeSubscription,
    tool: ToolSettings,
    in_progress: InProgressPath,
    members: Vec<UserProfile>,
    redraw: Rc<Cell<bool>>,
    left: bool,
}

impl<S: StrokeStore + 'static> RoomSession<S> {
    /// Enter a room and start following its strokes.
    pub fn join(store: Rc<S>, room_id: RoomId, user_id: UserId) -> Self {
        let synchronizer = StrokeSynchronizer::new(store);
        let redraw = Rc::new(Cell::new(true));
        let flag = redraw.clone();
        let subscription = synchronizer.subscribe(&room_id, move |_| flag.set(true));

        let flag = redraw.clone();
        subscription.on_terminated(move |_| flag.set(true));

        log::info!("User {} joined room {}", user_id, room_id);
        let tool = ToolSettings::default();
        Self {
            room_id,
            user_id,
            synchronizer,
            subscription,
            tool,
            in_progress: InProgressPath::empty(tool),
            members: Vec::new(),
            redraw,
            left: false,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn status(&self) -> SessionStatus {
        if self.left {
            return SessionStatus::Left;
        }
        match self.subscription.termination() {
            Some(error) => SessionStatus::Ended(error),
            None => SessionStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.left && self.subscription.is_active()
    }

    pub fn tool(&self) -> ToolSettings {
        self.tool
    }

    /// Change the tool for the next stroke. A stroke being drawn keeps the
    /// color and thickness it started with.
    pub fn set_tool(&mut self, tool: ToolSettings) {
        self.tool = tool;
    }

    pub fn touch_start(&mut self, point: Point) {
        if !self.is_active() {
            return;
        }
        self.in_progress = begin_stroke(point, self.tool);
        self.redraw.set(true);
    }

    pub fn touch_move(&mut self, point: Point) {
        if !self.is_active() {
            return;
        }
        self.in_progress = extend_stroke(&self.in_progress, point);
        self.redraw.set(true);
    }

    /// Finish the stroke and commit it.
    ///
    /// The live path is cleared right away; the stroke reappears once the
    /// store pushes it back. Returns `None` when there is nothing to commit.
    pub fn touch_end(&mut self) -> Option<BoxFuture<'static, SyncResult<()>>> {
        let path = std::mem::replace(&mut self.in_progress, InProgressPath::empty(self.tool));
        if path.is_empty() {
            return None;
        }
        self.redraw.set(true);
        if !self.is_active() {
            log::debug!("Dropping stroke drawn after the session ended");
            return None;
        }
        Some(
            self.synchronizer
                .commit_stroke(&self.room_id, &self.user_id, &path),
        )
    }

    pub fn in_progress(&self) -> &InProgressPath {
        &self.in_progress
    }

    pub fn committed(&self) -> CommittedStrokes {
        self.subscription.strokes()
    }

    /// Compose the current frame.
    pub fn frame(&self) -> Frame {
        canvas::render(&self.subscription.strokes(), &self.in_progress)
    }

    /// Whether anything changed since the last call.
    pub fn take_redraw(&self) -> bool {
        self.redraw.replace(false)
    }

    /// The room's creator, once the room snapshot has arrived.
    pub fn host(&self) -> Option<UserId> {
        self.subscription.room().and_then(|room| room.created_by)
    }

    pub fn members(&self) -> &[UserProfile] {
        &self.members
    }

    /// Look up the profiles of the room's current members.
    pub async fn refresh_members(&mut self) -> StoreResult<&[UserProfile]> {
        let ids = self
            .subscription
            .room()
            .map(|room| room.members)
            .unwrap_or_default();
        self.members = self.synchronizer.store().get_users(&ids).await?;
        Ok(&self.members)
    }

    /// Stop following the room. Safe to call more than once.
    pub fn leave(&mut self) {
        if self.left {
            return;
        }
        self.left = true;
        self.subscription.cancel();
        self.in_progress = InProgressPath::empty(self.tool);
        log::info!("User {} left room {}", self.user_id, self.room_id);
    }
}

impl<S: StrokeStore + 'static> Drop for RoomSession<S> {
    fn drop(&mut self) {
        self.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::Layer;
    use crate::color::StrokeColor;
    use crate::store::{MemoryStore, RoomDirectory};
    use crate::tools::PALETTE;
    use futures::executor::block_on;

    fn profile(uid: &str, name: &str) -> UserProfile {
        UserProfile {
            uid: UserId::from(uid),
            name: name.to_string(),
            email: format!("{uid}@example.com"),
            reg_no: String::new(),
            rooms: Vec::new(),
        }
    }

    fn setup() -> (Rc<MemoryStore>, RoomId) {
        let store = Rc::new(MemoryStore::new());
        block_on(store.register_user(profile("alice", "Alice"))).unwrap();
        block_on(store.register_user(profile("bob", "Bob"))).unwrap();
        let room = block_on(store.create_room("Maths", &UserId::from("alice"))).unwrap();
        block_on(store.join_room(&room, &UserId::from("bob"))).unwrap();
        (store, room)
    }

    fn draw(
        session: &mut RoomSession<MemoryStore>,
        points: &[Point],
    ) -> Option<BoxFuture<'static, SyncResult<()>>> {
        session.touch_start(points[0]);
        for p in &points[1..] {
            session.touch_move(*p);
        }
        session.touch_end()
    }

    #[test]
    fn test_stroke_round_trip_between_sessions() {
        let (store, room) = setup();
        let mut alice = RoomSession::join(store.clone(), room.clone(), UserId::from("alice"));
        let bob = RoomSession::join(store.clone(), room.clone(), UserId::from("bob"));
        store.deliver_pending();

        let pending = draw(&mut alice, &[Point::new(0.0, 0.0), Point::new(10.0, 10.0)]).unwrap();
        assert!(alice.in_progress().is_empty());
        block_on(pending).unwrap();
        store.deliver_pending();

        assert_eq!(alice.committed().len(), 1);
        assert_eq!(bob.committed().len(), 1);
        assert_eq!(bob.committed()[0].author_id, UserId::from("alice"));
        assert!(bob.take_redraw());
        assert!(!bob.take_redraw());
    }

    #[test]
    fn test_live_stroke_keeps_its_tool() {
        let (store, room) = setup();
        let mut session = RoomSession::join(store.clone(), room, UserId::from("alice"));
        store.deliver_pending();

        session.touch_start(Point::new(1.0, 1.0));
        session.set_tool(ToolSettings::new(PALETTE[1], 15.0).unwrap());
        session.touch_move(Point::new(2.0, 2.0));

        let frame = session.frame();
        let live = frame.in_progress().unwrap();
        assert_eq!(live.color, StrokeColor::WHITE);
        assert_eq!(live.width, ToolSettings::default().thickness);

        let _ = session.touch_end();
        session.touch_start(Point::new(5.0, 5.0));
        assert_eq!(session.in_progress().color, PALETTE[1]);
        assert_eq!(session.in_progress().thickness, 15.0);
    }

    #[test]
    fn test_tap_commits_a_dot() {
        let (store, room) = setup();
        let mut session = RoomSession::join(store.clone(), room.clone(), UserId::from("alice"));
        store.deliver_pending();

        let pending = draw(&mut session, &[Point::new(4.0, 4.0)]).unwrap();
        block_on(pending).unwrap();
        store.deliver_pending();

        let frame = session.frame();
        assert_eq!(frame.len(), 1);
        assert!(matches!(frame.ops()[0].layer, Layer::Committed { .. }));
    }

    #[test]
    fn test_touch_end_without_stroke() {
        let (store, room) = setup();
        let mut session = RoomSession::join(store, room, UserId::from("alice"));
        assert!(session.touch_end().is_none());
    }

    #[test]
    fn test_room_deletion_ends_session() {
        let (store, room) = setup();
        let mut session = RoomSession::join(store.clone(), room.clone(), UserId::from("bob"));
        store.deliver_pending();

        block_on(store.delete_room(&room)).unwrap();
        store.deliver_pending();

        assert_eq!(session.status(), SessionStatus::Ended(SyncError::RoomMissing(room)));
        session.touch_start(Point::new(1.0, 1.0));
        session.touch_move(Point::new(2.0, 2.0));
        assert!(session.in_progress().is_empty());
        assert!(session.touch_end().is_none());
    }

    #[test]
    fn test_leave_detaches_and_is_idempotent() {
        let (store, room) = setup();
        let mut session = RoomSession::join(store.clone(), room.clone(), UserId::from("alice"));
        assert_eq!(store.listener_count(&room), 2);

        session.leave();
        session.leave();
        assert_eq!(session.status(), SessionStatus::Left);
        assert_eq!(store.listener_count(&room), 0);

        drop(session);
        let session = RoomSession::join(store.clone(), room.clone(), UserId::from("alice"));
        drop(session);
        assert_eq!(store.listener_count(&room), 0);
    }

    #[test]
    fn test_members_and_host() {
        let (store, room) = setup();
        let mut session = RoomSession::join(store.clone(), room, UserId::from("bob"));
        assert_eq!(session.host(), None);
        store.deliver_pending();

        assert_eq!(session.host(), Some(UserId::from("alice")));
        let names: Vec<_> = block_on(session.refresh_members())
            .unwrap()
            .iter()
            .map(|p| p.name.clone())
            .collect();
        assert_eq!(names, vec!["Alice".to_string(), "Bob".to_string()]);
    }

    #[test]
    fn test_failed_append_is_reported() {
        let (store, room) = setup();
        let mut session = RoomSession::join(store.clone(), room.clone(), UserId::from("alice"));
        store.deliver_pending();
        store.set_offline(true);

        let pending = draw(&mut session, &[Point::new(0.0, 0.0), Point::new(3.0, 0.0)]).unwrap();
        assert!(matches!(block_on(pending), Err(SyncError::AppendFailed(_))));
        assert_eq!(session.status(), SessionStatus::Active);
        assert!(store.strokes(&room).is_empty());
    }
}

//! In-memory store for tests and ephemeral use.
//!
//! Notifications are queued rather than delivered inline, the way a hosted
//! store pushes them asynchronously. Call [`MemoryStore::deliver_pending`] to
//! run the queued listener callbacks.

use super::{
    BoxFuture, ListenerHandle, RoomDirectory, RoomListener, StoreError, StoreResult, StrokeListener,
    StrokeStore,
};
use crate::stroke::{
    RoomId, RoomInfo, RoomSnapshot, Sequence, Stroke, StrokeDraft, StrokeId, UserId, UserProfile,
};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use uuid::Uuid;

type ListenerId = u64;

struct RoomRecord {
    name: String,
    created_by: UserId,
    members: Vec<UserId>,
    strokes: Vec<Stroke>,
}

impl RoomRecord {
    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            exists: true,
            members: self.members.clone(),
            name: self.name.clone(),
            created_by: Some(self.created_by.clone()),
        }
    }
}

enum Notification {
    Strokes {
        room: RoomId,
        listener: ListenerId,
        result: StoreResult<Vec<Stroke>>,
    },
    Room {
        room: RoomId,
        listener: ListenerId,
        result: StoreResult<RoomSnapshot>,
    },
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<RoomId, RoomRecord>,
    users: HashMap<UserId, UserProfile>,
    stroke_listeners: HashMap<RoomId, Vec<(ListenerId, Rc<RefCell<StrokeListener>>)>>,
    room_listeners: HashMap<RoomId, Vec<(ListenerId, Rc<RefCell<RoomListener>>)>>,
    pending: VecDeque<Notification>,
    next_listener: ListenerId,
    last_sequence: u64,
    offline: bool,
}

impl Inner {
    fn next_listener_id(&mut self) -> ListenerId {
        self.next_listener += 1;
        self.next_listener
    }

    fn room_snapshot(&self, room_id: &RoomId) -> RoomSnapshot {
        self.rooms
            .get(room_id)
            .map(RoomRecord::snapshot)
            .unwrap_or_else(RoomSnapshot::missing)
    }

    fn queue_strokes(&mut self, room_id: &RoomId) {
        let strokes = self
            .rooms
            .get(room_id)
            .map(|room| room.strokes.clone())
            .unwrap_or_default();
        let ids: Vec<_> = self
            .stroke_listeners
            .get(room_id)
            .map(|ls| ls.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default();
        for listener in ids {
            self.pending.push_back(Notification::Strokes {
                room: room_id.clone(),
                listener,
                result: Ok(strokes.clone()),
            });
        }
    }

    fn queue_room(&mut self, room_id: &RoomId) {
        let snapshot = self.room_snapshot(room_id);
        let ids: Vec<_> = self
            .room_listeners
            .get(room_id)
            .map(|ls| ls.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default();
        for listener in ids {
            self.pending.push_back(Notification::Room {
                room: room_id.clone(),
                listener,
                result: Ok(snapshot.clone()),
            });
        }
    }

    fn stroke_listener(
        &self,
        room_id: &RoomId,
        id: ListenerId,
    ) -> Option<Rc<RefCell<StrokeListener>>> {
        self.stroke_listeners
            .get(room_id)?
            .iter()
            .find(|(lid, _)| *lid == id)
            .map(|(_, l)| l.clone())
    }

    fn room_listener(&self, room_id: &RoomId, id: ListenerId) -> Option<Rc<RefCell<RoomListener>>> {
        self.room_listeners
            .get(room_id)?
            .iter()
            .find(|(lid, _)| *lid == id)
            .map(|(_, l)| l.clone())
    }

    fn remove_stroke_listener(&mut self, room_id: &RoomId, id: ListenerId) {
        if let Some(listeners) = self.stroke_listeners.get_mut(room_id) {
            listeners.retain(|(lid, _)| *lid != id);
            if listeners.is_empty() {
                self.stroke_listeners.remove(room_id);
            }
        }
    }

    fn remove_room_listener(&mut self, room_id: &RoomId, id: ListenerId) {
        if let Some(listeners) = self.room_listeners.get_mut(room_id) {
            listeners.retain(|(lid, _)| *lid != id);
            if listeners.is_empty() {
                self.room_listeners.remove(room_id);
            }
        }
    }

    /// Next sequence key. One counter for the whole store keeps every
    /// room's keys strictly increasing.
    fn next_sequence(&mut self) -> Sequence {
        self.last_sequence += 1;
        Sequence(self.last_sequence)
    }
}

/// In-memory rooms, users and stroke logs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Rc<RefCell<Inner>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run queued listener callbacks, including any queued by the callbacks
    /// themselves. Returns how many callbacks ran.
    pub fn deliver_pending(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.inner.borrow_mut().pending.pop_front();
            let Some(notification) = next else {
                break;
            };
            match notification {
                Notification::Strokes { room, listener, result } => {
                    let found = self.inner.borrow().stroke_listener(&room, listener);
                    let Some(callback) = found else {
                        continue;
                    };
                    let ended = result.is_err();
                    {
                        let mut callback = callback.borrow_mut();
                        (*callback)(result);
                    }
                    if ended {
                        self.inner.borrow_mut().remove_stroke_listener(&room, listener);
                    }
                }
                Notification::Room { room, listener, result } => {
                    let found = self.inner.borrow().room_listener(&room, listener);
                    let Some(callback) = found else {
                        continue;
                    };
                    let ended = result.is_err();
                    {
                        let mut callback = callback.borrow_mut();
                        (*callback)(result);
                    }
                    if ended {
                        self.inner.borrow_mut().remove_room_listener(&room, listener);
                    }
                }
            }
            delivered += 1;
        }
        delivered
    }

    /// Number of queued notifications.
    pub fn pending_count(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    /// Attached stroke and room listeners for a room.
    pub fn listener_count(&self, room_id: &RoomId) -> usize {
        let inner = self.inner.borrow();
        inner.stroke_listeners.get(room_id).map_or(0, Vec::len)
            + inner.room_listeners.get(room_id).map_or(0, Vec::len)
    }

    /// While offline every append fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.inner.borrow_mut().offline = offline;
    }

    /// End every stream open on the room with `error`.
    pub fn fail_streams(&self, room_id: &RoomId, error: StoreError) {
        let mut inner = self.inner.borrow_mut();
        let stroke_ids: Vec<_> = inner
            .stroke_listeners
            .get(room_id)
            .map(|ls| ls.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default();
        let room_ids: Vec<_> = inner
            .room_listeners
            .get(room_id)
            .map(|ls| ls.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default();
        for listener in stroke_ids {
            inner.pending.push_back(Notification::Strokes {
                room: room_id.clone(),
                listener,
                result: Err(error.clone()),
            });
        }
        for listener in room_ids {
            inner.pending.push_back(Notification::Room {
                room: room_id.clone(),
                listener,
                result: Err(error.clone()),
            });
        }
    }

    /// Committed strokes of a room, in order.
    pub fn strokes(&self, room_id: &RoomId) -> Vec<Stroke> {
        self.inner
            .borrow()
            .rooms
            .get(room_id)
            .map(|room| room.strokes.clone())
            .unwrap_or_default()
    }

    fn append(&self, room_id: &RoomId, draft: StrokeDraft) -> StoreResult<Stroke> {
        let mut inner = self.inner.borrow_mut();
        if inner.offline {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        draft
            .validate()
            .map_err(|e| StoreError::Rejected(e.to_string()))?;
        if !inner.rooms.contains_key(room_id) {
            return Err(StoreError::RoomNotFound(room_id.clone()));
        }

        let sequence = inner.next_sequence();
        let stroke = Stroke::commit(draft, StrokeId(Uuid::new_v4().to_string()), sequence);
        if let Some(room) = inner.rooms.get_mut(room_id) {
            room.strokes.push(stroke.clone());
        }
        inner.queue_strokes(room_id);
        Ok(stroke)
    }

    fn add_member(&self, room_id: &RoomId, user: &UserId) -> StoreResult<()> {
        let mut inner = self.inner.borrow_mut();
        let room = inner
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| StoreError::RoomNotFound(room_id.clone()))?;
        if room.members.contains(user) {
            return Ok(());
        }
        room.members.push(user.clone());
        if let Some(profile) = inner.users.get_mut(user) {
            profile.rooms.push(room_id.clone());
        }
        inner.queue_room(room_id);
        Ok(())
    }
}

impl StrokeStore for MemoryStore {
    fn list_strokes(&self, room_id: &RoomId, listener: StrokeListener) -> ListenerHandle {
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_listener_id();
            inner
                .stroke_listeners
                .entry(room_id.clone())
                .or_default()
                .push((id, Rc::new(RefCell::new(listener))));
            let strokes = inner
                .rooms
                .get(room_id)
                .map(|room| room.strokes.clone())
                .unwrap_or_default();
            inner.pending.push_back(Notification::Strokes {
                room: room_id.clone(),
                listener: id,
                result: Ok(strokes),
            });
            id
        };

        let weak: Weak<RefCell<Inner>> = Rc::downgrade(&self.inner);
        let room_id = room_id.clone();
        ListenerHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().remove_stroke_listener(&room_id, id);
            }
        })
    }

    fn append_stroke(
        &self,
        room_id: &RoomId,
        draft: StrokeDraft,
    ) -> BoxFuture<'_, StoreResult<()>> {
        let room_id = room_id.clone();
        Box::pin(async move {
            let stroke = self.append(&room_id, draft)?;
            log::debug!("Appended stroke {} to room {} at {}", stroke.id, room_id, stroke.sequence);
            Ok(())
        })
    }

    fn watch_room(&self, room_id: &RoomId, listener: RoomListener) -> ListenerHandle {
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_listener_id();
            inner
                .room_listeners
                .entry(room_id.clone())
                .or_default()
                .push((id, Rc::new(RefCell::new(listener))));
            let snapshot = inner.room_snapshot(room_id);
            inner.pending.push_back(Notification::Room {
                room: room_id.clone(),
                listener: id,
                result: Ok(snapshot),
            });
            id
        };

        let weak = Rc::downgrade(&self.inner);
        let room_id = room_id.clone();
        ListenerHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().remove_room_listener(&room_id, id);
            }
        })
    }

    fn get_users(&self, ids: &[UserId]) -> BoxFuture<'_, StoreResult<Vec<UserProfile>>> {
        let ids = ids.to_vec();
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let inner = self.inner.borrow();
            Ok(ids.iter().filter_map(|id| inner.users.get(id).cloned()).collect())
        })
    }
}

impl RoomDirectory for MemoryStore {
    fn register_user(&self, profile: UserProfile) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            self.inner.borrow_mut().users.insert(profile.uid.clone(), profile);
            Ok(())
        })
    }

    fn create_room(&self, name: &str, creator: &UserId) -> BoxFuture<'_, StoreResult<RoomId>> {
        let name = name.to_string();
        let creator = creator.clone();
        Box::pin(async move {
            let room_id = RoomId(Uuid::new_v4().to_string());
            let mut inner = self.inner.borrow_mut();
            inner.rooms.insert(
                room_id.clone(),
                RoomRecord {
                    name,
                    created_by: creator.clone(),
                    members: vec![creator.clone()],
                    strokes: Vec::new(),
                },
            );
            if let Some(profile) = inner.users.get_mut(&creator) {
                profile.rooms.push(room_id.clone());
            }
            Ok(room_id)
        })
    }

    fn join_room(&self, room_id: &RoomId, user: &UserId) -> BoxFuture<'_, StoreResult<()>> {
        let room_id = room_id.clone();
        let user = user.clone();
        Box::pin(async move { self.add_member(&room_id, &user) })
    }

    fn user_rooms(&self, user: &UserId) -> BoxFuture<'_, StoreResult<Vec<RoomInfo>>> {
        let user = user.clone();
        Box::pin(async move {
            let inner = self.inner.borrow();
            let mut rooms: Vec<RoomInfo> = inner
                .rooms
                .iter()
                .filter(|(_, room)| room.members.contains(&user))
                .map(|(id, room)| RoomInfo {
                    id: id.clone(),
                    name: room.name.clone(),
                })
                .collect();
            rooms.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
            Ok(rooms)
        })
    }

    fn delete_room(&self, room_id: &RoomId) -> BoxFuture<'_, StoreResult<()>> {
        let room_id = room_id.clone();
        Box::pin(async move {
            let mut inner = self.inner.borrow_mut();
            if inner.rooms.remove(&room_id).is_none() {
                return Err(StoreError::RoomNotFound(room_id));
            }
            for profile in inner.users.values_mut() {
                profile.rooms.retain(|r| r != &room_id);
            }
            inner.queue_room(&room_id);
            Ok(())
        })
    }
}

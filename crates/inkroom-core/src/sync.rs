//! Stroke synchronization between local drawing and a room's stroke log.
//!
//! The synchronizer never merges: the store pushes the room's complete,
//! ordered stroke list on every change and the local copy is replaced
//! wholesale. Committing a stroke is a single append; the author sees the
//! stroke when the store's push comes back, exactly like every other member
//! of the room (local echo), never through an optimistic insert.

use crate::path::InProgressPath;
use crate::store::{BoxFuture, ListenerHandle, StoreError, StrokeStore};
use crate::stroke::{CommittedStrokes, RoomId, RoomSnapshot, StrokeDraft, UserId};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use thiserror::Error;

/// Synchronization errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The append did not reach the store. The draft is gone; nothing retries.
    #[error("stroke append failed: {0}")]
    AppendFailed(#[source] StoreError),
    /// A stroke or room stream ended abnormally.
    #[error("subscription to room {room_id} failed: {source}")]
    SubscriptionError {
        room_id: RoomId,
        #[source]
        source: StoreError,
    },
    /// The room was deleted or never existed.
    #[error("room {0} no longer exists")]
    RoomMissing(RoomId),
    #[error("cannot commit an empty stroke")]
    EmptyStroke,
}

/// Result type for synchronization.
pub type SyncResult<T> = Result<T, SyncError>;

type TerminationCallback = Box<dyn FnOnce(&SyncError)>;

struct SubscriptionState {
    room_id: RoomId,
    cancelled: Cell<bool>,
    termination: RefCell<Option<SyncError>>,
    handles: RefCell<Vec<ListenerHandle>>,
    on_terminated: RefCell<Option<TerminationCallback>>,
    strokes: RefCell<CommittedStrokes>,
    room: RefCell<Option<RoomSnapshot>>,
    updates: Cell<u64>,
}

impl SubscriptionState {
    fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            cancelled: Cell::new(false),
            termination: RefCell::new(None),
            handles: RefCell::new(Vec::new()),
            on_terminated: RefCell::new(None),
            strokes: RefCell::new(CommittedStrokes::default()),
            room: RefCell::new(None),
            updates: Cell::new(0),
        }
    }

    /// Keep a store handle, or detach it at once if already canceled.
    fn attach(&self, mut handle: ListenerHandle) {
        if self.cancelled.get() {
            handle.detach();
        } else {
            self.handles.borrow_mut().push(handle);
        }
    }

    /// Returns false if the subscription was already canceled.
    fn cancel(&self) -> bool {
        if self.cancelled.replace(true) {
            return false;
        }
        let handles = self.handles.take();
        for mut handle in handles {
            handle.detach();
        }
        true
    }

    fn terminate(&self, error: SyncError) {
        if !self.cancel() {
            return;
        }
        log::warn!("Stroke subscription for room {} ended: {}", self.room_id, error);
        *self.termination.borrow_mut() = Some(error.clone());
        let callback = self.on_terminated.borrow_mut().take();
        if let Some(callback) = callback {
            callback(&error);
        }
    }

    /// Log snapshots that break the store's ordering promise. They are
    /// applied anyway: the store's order is authoritative.
    fn check_contract(&self, next: &CommittedStrokes) {
        if !next.is_ordered() {
            log::warn!(
                "Room {} snapshot is not in ascending sequence order",
                self.room_id
            );
        }
        let previous = self.strokes.borrow();
        if !next.extends(&previous) {
            log::warn!(
                "Room {} snapshot does not extend the previous one ({} -> {} strokes)",
                self.room_id,
                previous.len(),
                next.len()
            );
        }
    }
}

/// A live subscription to one room's strokes.
///
/// Dropping the subscription cancels it.
pub struct StrokeSubscription {
    state: Rc<SubscriptionState>,
}

impl StrokeSubscription {
    pub fn room_id(&self) -> &RoomId {
        &self.state.room_id
    }

    /// Stop all further updates. Safe to call any number of times.
    pub fn cancel(&self) {
        if self.state.cancel() {
            log::debug!("Canceled stroke subscription for room {}", self.state.room_id);
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.cancelled.get()
    }

    /// Why the subscription ended, if it ended abnormally.
    pub fn termination(&self) -> Option<SyncError> {
        self.state.termination.borrow().clone()
    }

    /// Run `callback` once when the subscription ends abnormally. If it
    /// already has, `callback` runs immediately.
    pub fn on_terminated(&self, callback: impl FnOnce(&SyncError) + 'static) {
        let existing = self.termination();
        match existing {
            Some(error) => callback(&error),
            None => *self.state.on_terminated.borrow_mut() = Some(Box::new(callback)),
        }
    }

    /// The last list delivered to the update callback.
    pub fn strokes(&self) -> CommittedStrokes {
        self.state.strokes.borrow().clone()
    }

    /// The last room snapshot seen.
    pub fn room(&self) -> Option<RoomSnapshot> {
        self.state.room.borrow().clone()
    }

    /// How many updates were delivered.
    pub fn update_count(&self) -> u64 {
        self.state.updates.get()
    }
}

impl Drop for StrokeSubscription {
    fn drop(&mut self) {
        self.state.cancel();
    }
}

impl fmt::Debug for StrokeSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrokeSubscription")
            .field("room_id", &self.state.room_id)
            .field("active", &self.is_active())
            .field("strokes", &self.state.strokes.borrow().len())
            .finish()
    }
}

/// Bridges local stroke commits and store pushes for any number of rooms.
pub struct StrokeSynchronizer<S: StrokeStore> {
    store: Rc<S>,
    live: RefCell<HashMap<RoomId, Vec<Weak<SubscriptionState>>>>,
}

impl<S: StrokeStore + 'static> StrokeSynchronizer<S> {
    pub fn new(store: Rc<S>) -> Self {
        Self {
            store,
            live: RefCell::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Rc<S> {
        &self.store
    }

    /// Follow a room's strokes.
    ///
    /// `on_update` receives the full ordered list on the initial load and
    /// after every change. The room's existence is watched too: once the room
    /// is gone the subscription cancels itself and records
    /// [`SyncError::RoomMissing`].
    pub fn subscribe(
        &self,
        room_id: &RoomId,
        mut on_update: impl FnMut(&CommittedStrokes) + 'static,
    ) -> StrokeSubscription {
        let state = Rc::new(SubscriptionState::new(room_id.clone()));

        let weak = Rc::downgrade(&state);
        let strokes_handle = self.store.list_strokes(
            room_id,
            Box::new(move |result| {
                let Some(state) = weak.upgrade() else {
                    return;
                };
                if state.cancelled.get() {
                    log::debug!("Dropping late stroke update for room {}", state.room_id);
                    return;
                }
                match result {
                    Ok(strokes) => {
                        let strokes = CommittedStrokes::new(strokes);
                        state.check_contract(&strokes);
                        *state.strokes.borrow_mut() = strokes.clone();
                        state.updates.set(state.updates.get() + 1);
                        on_update(&strokes);
                    }
                    Err(source) => state.terminate(SyncError::SubscriptionError {
                        room_id: state.room_id.clone(),
                        source,
                    }),
                }
            }),
        );
        state.attach(strokes_handle);

        let weak = Rc::downgrade(&state);
        let room_handle = self.store.watch_room(
            room_id,
            Box::new(move |result| {
                let Some(state) = weak.upgrade() else {
                    return;
                };
                if state.cancelled.get() {
                    return;
                }
                match result {
                    Ok(snapshot) if !snapshot.exists => {
                        state.terminate(SyncError::RoomMissing(state.room_id.clone()));
                    }
                    Ok(snapshot) => *state.room.borrow_mut() = Some(snapshot),
                    Err(source) => state.terminate(SyncError::SubscriptionError {
                        room_id: state.room_id.clone(),
                        source,
                    }),
                }
            }),
        );
        state.attach(room_handle);

        let mut live = self.live.borrow_mut();
        // Forget subscriptions that ended, in every room.
        live.retain(|_, states| {
            states.retain(|w| w.upgrade().is_some_and(|s| !s.cancelled.get()));
            !states.is_empty()
        });
        live.entry(room_id.clone()).or_default().push(Rc::downgrade(&state));

        log::debug!("Subscribed to strokes of room {}", room_id);
        StrokeSubscription { state }
    }

    /// Append the path to the room's log.
    ///
    /// The path is serialized before this returns, so the caller may reset
    /// or drop it while the append is in flight.
    pub fn commit_stroke(
        &self,
        room_id: &RoomId,
        author_id: &UserId,
        path: &InProgressPath,
    ) -> BoxFuture<'static, SyncResult<()>> {
        let store = Rc::clone(&self.store);
        let room_id = room_id.clone();
        let draft = StrokeDraft::from_path(path, author_id.clone());
        Box::pin(async move {
            let draft = draft.ok_or(SyncError::EmptyStroke)?;
            store.append_stroke(&room_id, draft).await.map_err(|e| {
                log::warn!("Failed to append stroke to room {}: {}", room_id, e);
                SyncError::AppendFailed(e)
            })
        })
    }

    /// End every live subscription to a room that no longer exists.
    pub fn on_room_missing(&self, room_id: &RoomId) {
        let states = self.live.borrow_mut().remove(room_id).unwrap_or_default();
        for state in states.iter().filter_map(Weak::upgrade) {
            state.terminate(SyncError::RoomMissing(room_id.clone()));
        }
    }

    /// Number of active subscriptions to a room.
    pub fn active_subscriptions(&self, room_id: &RoomId) -> usize {
        self.live.borrow().get(room_id).map_or(0, |states| {
            states
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|s| !s.cancelled.get())
                .count()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{begin_stroke, extend_stroke};
    use crate::color::StrokeColor;
    use crate::store::{MemoryStore, RoomDirectory, RoomListener, StoreResult, StrokeListener};
    use crate::stroke::{Sequence, Stroke, StrokeId, UserProfile};
    use crate::tools::ToolSettings;
    use futures::executor::block_on;
    use kurbo::Point;

    /// Store whose listeners can never be detached, so notifications keep
    /// arriving after cancellation.
    struct LeakyStore(MemoryStore);

    impl StrokeStore for LeakyStore {
        fn list_strokes(&self, room_id: &RoomId, listener: StrokeListener) -> ListenerHandle {
            // Deliberately leaked.
            let _ = self.0.list_strokes(room_id, listener);
            ListenerHandle::noop()
        }

        fn append_stroke(
            &self,
            room_id: &RoomId,
            draft: StrokeDraft,
        ) -> BoxFuture<'_, StoreResult<()>> {
            self.0.append_stroke(room_id, draft)
        }

        fn watch_room(&self, room_id: &RoomId, listener: RoomListener) -> ListenerHandle {
            let _ = self.0.watch_room(room_id, listener);
            ListenerHandle::noop()
        }

        fn get_users(&self, ids: &[UserId]) -> BoxFuture<'_, StoreResult<Vec<UserProfile>>> {
            self.0.get_users(ids)
        }
    }

    /// Store that pushes whatever snapshot the test hands it.
    #[derive(Default)]
    struct ScriptedStore {
        listeners: RefCell<Vec<StrokeListener>>,
    }

    impl ScriptedStore {
        fn push(&self, strokes: Vec<Stroke>) {
            for listener in self.listeners.borrow_mut().iter_mut() {
                listener(Ok(strokes.clone()));
            }
        }
    }

    impl StrokeStore for ScriptedStore {
        fn list_strokes(&self, _room_id: &RoomId, listener: StrokeListener) -> ListenerHandle {
            self.listeners.borrow_mut().push(listener);
            ListenerHandle::noop()
        }

        fn append_stroke(
            &self,
            _room_id: &RoomId,
            _draft: StrokeDraft,
        ) -> BoxFuture<'_, StoreResult<()>> {
            Box::pin(async { Ok(()) })
        }

        fn watch_room(&self, _room_id: &RoomId, _listener: RoomListener) -> ListenerHandle {
            ListenerHandle::noop()
        }

        fn get_users(&self, _ids: &[UserId]) -> BoxFuture<'_, StoreResult<Vec<UserProfile>>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    fn committed(id: &str, sequence: u64) -> Stroke {
        Stroke {
            id: StrokeId::from(id),
            path: "M0,0 L1,1".to_string(),
            color: StrokeColor::WHITE,
            thickness: 2.0,
            author_id: UserId::from("alice"),
            sequence: Sequence(sequence),
        }
    }

    fn recorder() -> (Rc<RefCell<Vec<CommittedStrokes>>>, impl FnMut(&CommittedStrokes) + 'static) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |strokes: &CommittedStrokes| sink.borrow_mut().push(strokes.clone()))
    }

    fn white_stroke(start: Point) -> InProgressPath {
        let tool = ToolSettings::new(StrokeColor::WHITE, 5.0).unwrap();
        extend_stroke(&begin_stroke(start, tool), Point::new(start.x + 10.0, start.y))
    }

    fn commit<S: StrokeStore + 'static>(
        sync: &StrokeSynchronizer<S>,
        room: &RoomId,
        start: Point,
    ) -> SyncResult<()> {
        block_on(sync.commit_stroke(room, &UserId::from("alice"), &white_stroke(start)))
    }

    fn setup() -> (Rc<MemoryStore>, RoomId) {
        let store = Rc::new(MemoryStore::new());
        let room = block_on(store.create_room("board", &UserId::from("alice"))).unwrap();
        (store, room)
    }

    #[test]
    fn test_remote_commit_reaches_subscriber_once() {
        let (store, room) = setup();
        let alice = StrokeSynchronizer::new(store.clone());
        let bob = StrokeSynchronizer::new(store.clone());

        commit(&alice, &room, Point::ZERO).unwrap();

        let (seen, on_update) = recorder();
        let sub = bob.subscribe(&room, on_update);
        store.deliver_pending();
        assert_eq!(seen.borrow().len(), 1);
        let before = seen.borrow()[0].max_sequence().unwrap();

        commit(&alice, &room, Point::new(0.0, 20.0)).unwrap();
        store.deliver_pending();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        let last: &Stroke = seen[1].last().unwrap();
        assert_eq!(last.color, StrokeColor::WHITE);
        assert_eq!(last.thickness, 5.0);
        assert_eq!(last.author_id, UserId::from("alice"));
        assert!(last.sequence > before);
        assert_eq!(sub.update_count(), 2);
    }

    #[test]
    fn test_author_sees_stroke_only_after_push() {
        let (store, room) = setup();
        let sync = StrokeSynchronizer::new(store.clone());
        let (seen, on_update) = recorder();
        let sub = sync.subscribe(&room, on_update);
        store.deliver_pending();

        commit(&sync, &room, Point::ZERO).unwrap();
        assert!(sub.strokes().is_empty());

        store.deliver_pending();
        assert_eq!(sub.strokes().len(), 1);
        assert_eq!(seen.borrow().len(), 2);
    }

    #[test]
    fn test_cancel_before_delivery_blocks_late_notifications() {
        let store = Rc::new(LeakyStore(MemoryStore::new()));
        let room = block_on(store.0.create_room("board", &UserId::from("alice"))).unwrap();
        let sync = StrokeSynchronizer::new(store.clone());

        let (seen, on_update) = recorder();
        let sub = sync.subscribe(&room, on_update);
        sub.cancel();

        commit(&sync, &room, Point::ZERO).unwrap();
        assert!(store.0.deliver_pending() > 0);

        assert!(seen.borrow().is_empty());
        assert_eq!(sub.update_count(), 0);
        assert!(!sub.is_active());
    }

    #[test]
    fn test_cancel_is_idempotent_and_detaches() {
        let (store, room) = setup();
        let sync = StrokeSynchronizer::new(store.clone());
        let sub = sync.subscribe(&room, |_| {});
        assert_eq!(store.listener_count(&room), 2);

        sub.cancel();
        sub.cancel();
        assert_eq!(store.listener_count(&room), 0);
        assert_eq!(sub.termination(), None);
        assert_eq!(sync.active_subscriptions(&room), 0);
    }

    #[test]
    fn test_drop_cancels() {
        let (store, room) = setup();
        let sync = StrokeSynchronizer::new(store.clone());
        drop(sync.subscribe(&room, |_| {}));
        assert_eq!(store.listener_count(&room), 0);
    }

    #[test]
    fn test_room_deletion_ends_subscription() {
        let (store, room) = setup();
        let sync = StrokeSynchronizer::new(store.clone());
        let (seen, on_update) = recorder();
        let sub = sync.subscribe(&room, on_update);
        let fired = Rc::new(Cell::new(0));
        let counter = fired.clone();
        sub.on_terminated(move |e| {
            assert!(matches!(e, SyncError::RoomMissing(_)));
            counter.set(counter.get() + 1);
        });
        store.deliver_pending();
        assert_eq!(sub.room().unwrap().name, "board");

        block_on(store.delete_room(&room)).unwrap();
        store.deliver_pending();

        assert!(!sub.is_active());
        assert_eq!(sub.termination(), Some(SyncError::RoomMissing(room.clone())));
        assert_eq!(fired.get(), 1);
        assert_eq!(store.listener_count(&room), 0);
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_on_room_missing_stops_updates() {
        let (store, room) = setup();
        let sync = StrokeSynchronizer::new(store.clone());
        let (seen, on_update) = recorder();
        let sub = sync.subscribe(&room, on_update);
        store.deliver_pending();

        sync.on_room_missing(&room);
        commit(&sync, &room, Point::ZERO).unwrap();
        store.deliver_pending();

        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(sub.termination(), Some(SyncError::RoomMissing(room.clone())));
    }

    #[test]
    fn test_missing_room_at_subscribe() {
        let store = Rc::new(MemoryStore::new());
        let sync = StrokeSynchronizer::new(store.clone());
        let sub = sync.subscribe(&RoomId::from("ghost"), |_| {});
        store.deliver_pending();
        assert_eq!(sub.termination(), Some(SyncError::RoomMissing(RoomId::from("ghost"))));
    }

    #[test]
    fn test_stream_error_terminates() {
        let (store, room) = setup();
        let sync = StrokeSynchronizer::new(store.clone());
        let sub = sync.subscribe(&room, |_| {});
        store.deliver_pending();

        store.fail_streams(&room, StoreError::Disconnected);
        store.deliver_pending();

        assert_eq!(
            sub.termination(),
            Some(SyncError::SubscriptionError {
                room_id: room.clone(),
                source: StoreError::Disconnected,
            })
        );
        assert_eq!(store.listener_count(&room), 0);
    }

    #[test]
    fn test_on_terminated_after_the_fact_runs_immediately() {
        let (store, room) = setup();
        let sync = StrokeSynchronizer::new(store.clone());
        let sub = sync.subscribe(&room, |_| {});
        sync.on_room_missing(&room);

        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        sub.on_terminated(move |_| flag.set(true));
        assert!(fired.get());
    }

    #[test]
    fn test_append_failure_is_surfaced_without_retry() {
        let (store, room) = setup();
        let sync = StrokeSynchronizer::new(store.clone());
        let (seen, on_update) = recorder();
        let _sub = sync.subscribe(&room, on_update);
        store.deliver_pending();

        store.set_offline(true);
        let result = commit(&sync, &room, Point::ZERO);
        store.set_offline(false);
        store.deliver_pending();

        assert!(matches!(result, Err(SyncError::AppendFailed(StoreError::Unavailable(_)))));
        assert!(store.strokes(&room).is_empty());
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_empty_path_is_not_committed() {
        let (store, room) = setup();
        let sync = StrokeSynchronizer::new(store.clone());
        let empty = InProgressPath::empty(ToolSettings::default());
        let result = block_on(sync.commit_stroke(&room, &UserId::from("alice"), &empty));
        assert_eq!(result, Err(SyncError::EmptyStroke));
        assert!(store.strokes(&room).is_empty());
    }

    #[test]
    fn test_commit_outlives_the_path() {
        let (store, room) = setup();
        let sync = StrokeSynchronizer::new(store.clone());
        let path = white_stroke(Point::new(3.0, 3.0));
        let pending = sync.commit_stroke(&room, &UserId::from("alice"), &path);
        drop(path);

        block_on(pending).unwrap();
        assert_eq!(store.strokes(&room).len(), 1);
    }

    #[test]
    fn test_update_callback_may_cancel() {
        let (store, room) = setup();
        let sync = StrokeSynchronizer::new(store.clone());
        let holder: Rc<RefCell<Option<StrokeSubscription>>> = Rc::new(RefCell::new(None));
        let slot = holder.clone();
        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        let sub = sync.subscribe(&room, move |_| {
            counter.set(counter.get() + 1);
            if let Some(sub) = slot.borrow().as_ref() {
                sub.cancel();
            }
        });
        *holder.borrow_mut() = Some(sub);

        store.deliver_pending();
        commit(&sync, &room, Point::ZERO).unwrap();
        store.deliver_pending();

        assert_eq!(count.get(), 1);
        assert!(!holder.borrow().as_ref().unwrap().is_active());
    }

    #[test]
    fn test_irregular_snapshots_are_applied_as_delivered() {
        let store = Rc::new(ScriptedStore::default());
        let sync = StrokeSynchronizer::new(store.clone());
        let room = RoomId::from("r1");
        let (seen, on_update) = recorder();
        let sub = sync.subscribe(&room, on_update);

        store.push(vec![committed("a", 1), committed("b", 2), committed("c", 3)]);
        // Shorter than the previous list.
        store.push(vec![committed("a", 1)]);
        // Out of sequence order.
        store.push(vec![committed("b", 5), committed("a", 4)]);

        let seen = seen.borrow();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1].len(), 1);
        let ids: Vec<&str> = seen[2].iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["b", "a"]);
        assert!(!seen[2].is_ordered());
        assert!(sub.strokes().ptr_eq(&seen[2]));
        assert!(sub.is_active());
        assert_eq!(sub.update_count(), 3);
    }

    #[test]
    fn test_ended_subscriptions_are_forgotten() {
        let store = Rc::new(ScriptedStore::default());
        let sync = StrokeSynchronizer::new(store);

        for i in 0..5 {
            let sub = sync.subscribe(&RoomId::new(format!("room-{i}")), |_| {});
            drop(sub);
        }
        let kept = sync.subscribe(&RoomId::from("last"), |_| {});
        let canceled = sync.subscribe(&RoomId::from("other"), |_| {});
        canceled.cancel();
        let _next = sync.subscribe(&RoomId::from("next"), |_| {});

        let live = sync.live.borrow();
        let mut rooms: Vec<&str> = live.keys().map(RoomId::as_str).collect();
        rooms.sort();
        assert_eq!(rooms, ["last", "next"]);
        assert_eq!(sync.active_subscriptions(kept.room_id()), 1);
    }
}

//! Store client speaking the InkRoom WebSocket protocol.
//!
//! The socket lives on a background thread. Received messages are queued and
//! dispatched on the caller's thread by [`RemoteStore::poll`], so listeners
//! and request futures never run concurrently with the rest of the core.
//! Request futures only resolve after the reply has been polled in; use
//! [`RemoteStore::wait`] to drive one to completion.

use super::{
    BoxFuture, ListenerHandle, RoomDirectory, RoomListener, StoreError, StoreResult, StrokeListener,
    StrokeStore,
};
use crate::protocol::{ClientMessage, ReplyBody, RequestId, ServerMessage};
use crate::stroke::{RoomId, RoomInfo, RoomSnapshot, Stroke, StrokeDraft, UserId, UserProfile};
use futures::FutureExt;
use futures::channel::oneshot;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::pin;
use std::rc::{Rc, Weak};
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tungstenite::{Message, connect};
use url::Url;

/// Connection state of a [`RemoteStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Commands sent to the socket thread.
enum SocketCommand {
    Send(String),
    Close,
}

/// Events sent back by the socket thread.
enum SocketEvent {
    Connected,
    Message(ServerMessage),
    Disconnected(String),
}

/// Deliveries produced locally rather than by the server.
enum LocalDelivery {
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

type ListenerId = u64;

/// Listeners sharing one server-side stream, plus its latest snapshot.
struct Watch<L, T> {
    listeners: Vec<(ListenerId, Rc<RefCell<L>>)>,
    latest: Option<T>,
}

impl<L, T> Default for Watch<L, T> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
            latest: None,
        }
    }
}

struct Inner {
    state: ConnectionState,
    commands: Option<Sender<SocketCommand>>,
    events: Receiver<SocketEvent>,
    local: VecDeque<LocalDelivery>,
    pending: HashMap<RequestId, oneshot::Sender<StoreResult<ReplyBody>>>,
    stroke_watches: HashMap<RoomId, Watch<StrokeListener, Vec<Stroke>>>,
    room_watches: HashMap<RoomId, Watch<RoomListener, RoomSnapshot>>,
    next_request: RequestId,
    next_listener: ListenerId,
}

impl Inner {
    fn send(&self, message: &ClientMessage) -> StoreResult<()> {
        let Some(commands) = &self.commands else {
            return Err(StoreError::Disconnected);
        };
        let text = serde_json::to_string(message).map_err(|e| StoreError::Protocol(e.to_string()))?;
        commands
            .send(SocketCommand::Send(text))
            .map_err(|_| StoreError::Disconnected)
    }

    fn next_listener_id(&mut self) -> ListenerId {
        self.next_listener += 1;
        self.next_listener
    }

    fn release_strokes(&mut self, room_id: &RoomId, id: ListenerId) {
        let Some(watch) = self.stroke_watches.get_mut(room_id) else {
            return;
        };
        watch.listeners.retain(|(lid, _)| *lid != id);
        if watch.listeners.is_empty() {
            self.stroke_watches.remove(room_id);
            if self.state != ConnectionState::Disconnected {
                let _ = self.send(&ClientMessage::UnlistStrokes { room: room_id.clone() });
            }
        }
    }

    fn release_room(&mut self, room_id: &RoomId, id: ListenerId) {
        let Some(watch) = self.room_watches.get_mut(room_id) else {
            return;
        };
        watch.listeners.retain(|(lid, _)| *lid != id);
        if watch.listeners.is_empty() {
            self.room_watches.remove(room_id);
            if self.state != ConnectionState::Disconnected {
                let _ = self.send(&ClientMessage::UnwatchRoom { room: room_id.clone() });
            }
        }
    }
}

/// A [`StrokeStore`] and [`RoomDirectory`] backed by an InkRoom server.
pub struct RemoteStore {
    inner: Rc<RefCell<Inner>>,
    _thread: Option<JoinHandle<()>>,
}

impl RemoteStore {
    /// Start connecting to a `ws://` or `wss://` server.
    ///
    /// Returns once the socket thread is running; the connection completes
    /// in the background and shows up in [`state`](Self::state) after a
    /// [`poll`](Self::poll).
    pub fn connect(url: &str) -> StoreResult<Self> {
        let parsed =
            Url::parse(url).map_err(|e| StoreError::Unavailable(format!("Invalid URL: {}", e)))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(StoreError::Unavailable(format!(
                "Invalid WebSocket URL scheme: {}",
                parsed.scheme()
            )));
        }

        let (cmd_tx, cmd_rx) = channel::<SocketCommand>();
        let (event_tx, event_rx) = channel::<SocketEvent>();
        let url = url.to_string();
        let handle = thread::spawn(move || run_socket(&url, cmd_rx, event_tx));

        Ok(Self {
            inner: Rc::new(RefCell::new(Inner {
                state: ConnectionState::Connecting,
                commands: Some(cmd_tx),
                events: event_rx,
                local: VecDeque::new(),
                pending: HashMap::new(),
                stroke_watches: HashMap::new(),
                room_watches: HashMap::new(),
                next_request: 0,
                next_listener: 0,
            })),
            _thread: Some(handle),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Close the connection. Every listener and pending request fails with
    /// [`StoreError::Disconnected`] on the next [`poll`](Self::poll).
    pub fn disconnect(&self) {
        let commands = self.inner.borrow_mut().commands.take();
        if let Some(tx) = commands {
            let _ = tx.send(SocketCommand::Close);
        }
    }

    /// Dispatch everything received so far. Returns the number of events
    /// handled.
    pub fn poll(&self) -> usize {
        let mut handled = 0;
        loop {
            let local = self.inner.borrow_mut().local.pop_front();
            if let Some(delivery) = local {
                self.deliver_local(delivery);
                handled += 1;
                continue;
            }

            let next = self.inner.borrow().events.try_recv();
            match next {
                Ok(event) => {
                    self.handle_event(event);
                    handled += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.state() != ConnectionState::Disconnected {
                        let reason = "socket thread exited".to_string();
                        self.handle_event(SocketEvent::Disconnected(reason));
                        handled += 1;
                    }
                    break;
                }
            }
        }
        handled
    }

    /// Poll until `future` resolves or `timeout` elapses.
    pub fn wait<F: Future>(&self, future: F, timeout: Duration) -> Option<F::Output> {
        let mut future = pin!(future);
        let deadline = Instant::now() + timeout;
        loop {
            self.poll();
            if let Some(output) = future.as_mut().now_or_never() {
                return Some(output);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn handle_event(&self, event: SocketEvent) {
        match event {
            SocketEvent::Connected => {
                log::info!("Connected to store server");
                self.inner.borrow_mut().state = ConnectionState::Connected;
            }
            SocketEvent::Message(ServerMessage::Strokes { room, strokes }) => {
                let listeners: Vec<_> = {
                    let mut inner = self.inner.borrow_mut();
                    match inner.stroke_watches.get_mut(&room) {
                        Some(watch) => {
                            watch.latest = Some(strokes.clone());
                            watch.listeners.iter().map(|(_, l)| l.clone()).collect()
                        }
                        None => Vec::new(),
                    }
                };
                for listener in listeners {
                    (*listener.borrow_mut())(Ok(strokes.clone()));
                }
            }
            SocketEvent::Message(ServerMessage::Room { room, snapshot }) => {
                let listeners: Vec<_> = {
                    let mut inner = self.inner.borrow_mut();
                    match inner.room_watches.get_mut(&room) {
                        Some(watch) => {
                            watch.latest = Some(snapshot.clone());
                            watch.listeners.iter().map(|(_, l)| l.clone()).collect()
                        }
                        None => Vec::new(),
                    }
                };
                for listener in listeners {
                    (*listener.borrow_mut())(Ok(snapshot.clone()));
                }
            }
            SocketEvent::Message(ServerMessage::Reply { request_id, body }) => {
                let waiter = self.inner.borrow_mut().pending.remove(&request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(body.into_result());
                    }
                    None => log::warn!("Reply to unknown request {}", request_id),
                }
            }
            SocketEvent::Disconnected(reason) => self.fail_all(&reason),
        }
    }

    /// Fail every listener and request after the connection dropped.
    fn fail_all(&self, reason: &str) {
        log::warn!("Store connection lost: {}", reason);
        let (strokes, rooms, pending) = {
            let mut inner = self.inner.borrow_mut();
            inner.state = ConnectionState::Disconnected;
            inner.commands = None;
            inner.local.clear();
            (
                std::mem::take(&mut inner.stroke_watches),
                std::mem::take(&mut inner.room_watches),
                std::mem::take(&mut inner.pending),
            )
        };
        for tx in pending.into_values() {
            let _ = tx.send(Err(StoreError::Disconnected));
        }
        for (_, listener) in strokes.into_values().flat_map(|w| w.listeners) {
            (*listener.borrow_mut())(Err(StoreError::Disconnected));
        }
        for (_, listener) in rooms.into_values().flat_map(|w| w.listeners) {
            (*listener.borrow_mut())(Err(StoreError::Disconnected));
        }
    }

    fn deliver_local(&self, delivery: LocalDelivery) {
        match delivery {
            LocalDelivery::Strokes { room, listener, result } => {
                let found = self.inner.borrow().stroke_watches.get(&room).and_then(|w| {
                    w.listeners
                        .iter()
                        .find(|(id, _)| *id == listener)
                        .map(|(_, l)| l.clone())
                });
                if let Some(callback) = found {
                    (*callback.borrow_mut())(result);
                }
            }
            LocalDelivery::Room { room, listener, result } => {
                let found = self.inner.borrow().room_watches.get(&room).and_then(|w| {
                    w.listeners
                        .iter()
                        .find(|(id, _)| *id == listener)
                        .map(|(_, l)| l.clone())
                });
                if let Some(callback) = found {
                    (*callback.borrow_mut())(result);
                }
            }
        }
    }

    fn request(
        &self,
        build: impl FnOnce(RequestId) -> ClientMessage,
    ) -> BoxFuture<'_, StoreResult<ReplyBody>> {
        let (tx, rx) = oneshot::channel();
        let sent = {
            let mut inner = self.inner.borrow_mut();
            inner.next_request += 1;
            let request_id = inner.next_request;
            let sent = inner.send(&build(request_id));
            if sent.is_ok() {
                inner.pending.insert(request_id, tx);
            }
            sent
        };
        Box::pin(async move {
            sent?;
            rx.await.map_err(|_| StoreError::Disconnected)?
        })
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn unexpected(body: ReplyBody) -> StoreError {
    StoreError::Protocol(format!("unexpected reply {:?}", body))
}

impl StrokeStore for RemoteStore {
    fn list_strokes(&self, room_id: &RoomId, listener: StrokeListener) -> ListenerHandle {
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_listener_id();
            if inner.state == ConnectionState::Disconnected {
                inner.local.push_back(LocalDelivery::Strokes {
                    room: room_id.clone(),
                    listener: id,
                    result: Err(StoreError::Disconnected),
                });
            }
            let opened = !inner.stroke_watches.contains_key(room_id);
            let watch = inner.stroke_watches.entry(room_id.clone()).or_default();
            watch.listeners.push((id, Rc::new(RefCell::new(listener))));
            let latest = watch.latest.clone();
            if opened {
                if let Err(e) = inner.send(&ClientMessage::ListStrokes { room: room_id.clone() }) {
                    log::warn!("Failed to list strokes of room {}: {}", room_id, e);
                }
            } else if let Some(strokes) = latest {
                inner.local.push_back(LocalDelivery::Strokes {
                    room: room_id.clone(),
                    listener: id,
                    result: Ok(strokes),
                });
            }
            id
        };

        let weak: Weak<RefCell<Inner>> = Rc::downgrade(&self.inner);
        let room_id = room_id.clone();
        ListenerHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().release_strokes(&room_id, id);
            }
        })
    }

    fn append_stroke(
        &self,
        room_id: &RoomId,
        draft: StrokeDraft,
    ) -> BoxFuture<'_, StoreResult<()>> {
        let room = room_id.clone();
        let reply = self.request(|request_id| ClientMessage::AppendStroke {
            request_id,
            room,
            draft,
        });
        Box::pin(async move {
            match reply.await? {
                ReplyBody::Ok => Ok(()),
                body => Err(unexpected(body)),
            }
        })
    }

    fn watch_room(&self, room_id: &RoomId, listener: RoomListener) -> ListenerHandle {
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_listener_id();
            if inner.state == ConnectionState::Disconnected {
                inner.local.push_back(LocalDelivery::Room {
                    room: room_id.clone(),
                    listener: id,
                    result: Err(StoreError::Disconnected),
                });
            }
            let opened = !inner.room_watches.contains_key(room_id);
            let watch = inner.room_watches.entry(room_id.clone()).or_default();
            watch.listeners.push((id, Rc::new(RefCell::new(listener))));
            let latest = watch.latest.clone();
            if opened {
                if let Err(e) = inner.send(&ClientMessage::WatchRoom { room: room_id.clone() }) {
                    log::warn!("Failed to watch room {}: {}", room_id, e);
                }
            } else if let Some(snapshot) = latest {
                inner.local.push_back(LocalDelivery::Room {
                    room: room_id.clone(),
                    listener: id,
                    result: Ok(snapshot),
                });
            }
            id
        };

        let weak = Rc::downgrade(&self.inner);
        let room_id = room_id.clone();
        ListenerHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().release_room(&room_id, id);
            }
        })
    }

    fn get_users(&self, ids: &[UserId]) -> BoxFuture<'_, StoreResult<Vec<UserProfile>>> {
        if ids.is_empty() {
            return Box::pin(async { Ok(Vec::new()) });
        }
        let ids = ids.to_vec();
        let reply = self.request(|request_id| ClientMessage::GetUsers { request_id, ids });
        Box::pin(async move {
            match reply.await? {
                ReplyBody::Users { users } => Ok(users),
                body => Err(unexpected(body)),
            }
        })
    }
}

impl RoomDirectory for RemoteStore {
    fn register_user(&self, profile: UserProfile) -> BoxFuture<'_, StoreResult<()>> {
        let reply = self.request(|request_id| ClientMessage::RegisterUser { request_id, profile });
        Box::pin(async move {
            match reply.await? {
                ReplyBody::Ok => Ok(()),
                body => Err(unexpected(body)),
            }
        })
    }

    fn create_room(&self, name: &str, creator: &UserId) -> BoxFuture<'_, StoreResult<RoomId>> {
        let name = name.to_string();
        let creator = creator.clone();
        let reply = self.request(|request_id| ClientMessage::CreateRoom {
            request_id,
            name,
            creator,
        });
        Box::pin(async move {
            match reply.await? {
                ReplyBody::RoomCreated { room } => Ok(room),
                body => Err(unexpected(body)),
            }
        })
    }

    fn join_room(&self, room_id: &RoomId, user: &UserId) -> BoxFuture<'_, StoreResult<()>> {
        let room = room_id.clone();
        let user = user.clone();
        let reply = self.request(|request_id| ClientMessage::JoinRoom { request_id, room, user });
        Box::pin(async move {
            match reply.await? {
                ReplyBody::Ok => Ok(()),
                body => Err(unexpected(body)),
            }
        })
    }

    fn user_rooms(&self, user: &UserId) -> BoxFuture<'_, StoreResult<Vec<RoomInfo>>> {
        let user = user.clone();
        let reply = self.request(|request_id| ClientMessage::UserRooms { request_id, user });
        Box::pin(async move {
            match reply.await? {
                ReplyBody::Rooms { rooms } => Ok(rooms),
                body => Err(unexpected(body)),
            }
        })
    }

    fn delete_room(&self, room_id: &RoomId) -> BoxFuture<'_, StoreResult<()>> {
        let room = room_id.clone();
        let reply = self.request(|request_id| ClientMessage::DeleteRoom { request_id, room });
        Box::pin(async move {
            match reply.await? {
                ReplyBody::Ok => Ok(()),
                body => Err(unexpected(body)),
            }
        })
    }
}

const LOG_PREVIEW_CHARS: usize = 100;

/// The first `max_chars` characters of `text`.
fn preview(text: &str, max_chars: usize) -> &str {
    text.char_indices().nth(max_chars).map_or(text, |(end, _)| &text[..end])
}

/// Socket thread body: pump commands out and server messages in until
/// either side closes.
fn run_socket(url: &str, commands: Receiver<SocketCommand>, events: Sender<SocketEvent>) {
    log::info!("Store socket: connecting to {}", url);
    let (mut socket, response) = match connect(url) {
        Ok(connected) => connected,
        Err(e) => {
            log::error!("Store connection failed: {}", e);
            let _ = events.send(SocketEvent::Disconnected(format!("connection failed: {}", e)));
            return;
        }
    };
    log::info!("Store socket connected, status: {}", response.status());
    let _ = events.send(SocketEvent::Connected);

    match socket.get_mut() {
        tungstenite::stream::MaybeTlsStream::Plain(tcp) => {
            let _ = tcp.set_read_timeout(Some(Duration::from_millis(50)));
            let _ = tcp.set_write_timeout(Some(Duration::from_secs(5)));
        }
        #[allow(unreachable_patterns)]
        _ => log::debug!("TLS or other stream, using default timeout handling"),
    }

    let reason = loop {
        match commands.try_recv() {
            Ok(SocketCommand::Send(text)) => {
                log::debug!("Store socket sending: {}", preview(&text, LOG_PREVIEW_CHARS));
                if let Err(e) = socket.send(Message::Text(text)) {
                    break format!("send error: {}", e);
                }
            }
            Ok(SocketCommand::Close) => {
                let _ = socket.close(None);
                break "closed by client".to_string();
            }
            Err(TryRecvError::Disconnected) => {
                let _ = socket.close(None);
                break "client dropped".to_string();
            }
            Err(TryRecvError::Empty) => {}
        }

        match socket.read() {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(message) => {
                    if events.send(SocketEvent::Message(message)).is_err() {
                        break "client dropped".to_string();
                    }
                }
                Err(e) => log::warn!("Failed to parse server message: {} ({})", e, text),
            },
            Ok(Message::Ping(data)) => {
                let _ = socket.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => break "closed by server".to_string(),
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => break format!("read error: {}", e),
        }
    };

    log::info!("Store socket exiting: {}", reason);
    let _ = events.send(SocketEvent::Disconnected(reason));
}

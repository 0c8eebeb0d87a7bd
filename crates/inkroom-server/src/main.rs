//! InkRoom Store Server
//!
//! Hosts rooms, user profiles and each room's append-only stroke log, and
//! pushes full snapshots to every watcher over WebSocket.
//!
//! ## Protocol
//!
//! Messages are JSON tagged by `type` (see `inkroom_core::protocol`):
//! ```json
//! { "type": "list_strokes", "room": "room-id" }
//! { "type": "append_stroke", "request_id": 1, "room": "room-id", "draft": { ... } }
//! { "type": "strokes", "room": "room-id", "strokes": [ ... ] }
//! ```
//!
//! ## Configuration
//!
//! - `INKROOM_ADDR`: bind address, default `0.0.0.0:3030`
//! - `RUST_LOG`: log filter, default `inkroom_server=info,tower_http=info`

mod state;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use inkroom_core::protocol::{ClientMessage, ReplyBody, ServerMessage};
use inkroom_core::store::StoreError;
use inkroom_core::stroke::RoomId;
use state::AppState;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio::task::JoinHandle;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

// Server configuration
const DEFAULT_ADDR: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 3030);
const OUTBOUND_CAPACITY: usize = 256;

/// Bind address from `INKROOM_ADDR`, falling back to the default.
fn bind_addr() -> SocketAddr {
    match std::env::var("INKROOM_ADDR") {
        Ok(value) => value.parse().unwrap_or_else(|e| {
            warn!("Ignoring INKROOM_ADDR={:?}: {}", value, e);
            DEFAULT_ADDR
        }),
        Err(_) => DEFAULT_ADDR,
    }
}

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inkroom_server=info,tower_http=info".into()),
        )
        .init();

    let addr = bind_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("InkRoom store server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, app(Arc::new(AppState::new()))).await
}

/// Index page
async fn index() -> &'static str {
    "InkRoom Store Server - Connect via WebSocket at /ws"
}

/// Health check
async fn health() -> &'static str {
    "ok"
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let peer_id = Uuid::new_v4();
    info!("New connection: {}", peer_id);

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);

    // Single writer: replies and every watch forwarder funnel through out_tx.
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut stroke_watches: HashMap<RoomId, JoinHandle<()>> = HashMap::new();
    let mut room_watches: HashMap<RoomId, JoinHandle<()>> = HashMap::new();

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue, // Ignore binary, ping/pong
            Err(e) => {
                warn!("WebSocket error for {}: {}", peer_id, e);
                break;
            }
        };

        let message = match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(message) => message,
            Err(e) => {
                warn!("Invalid message from {}: {}", peer_id, e);
                if let Some(reply) = invalid_request_reply(text.as_str(), &e) {
                    if out_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                continue;
            }
        };

        match message {
            ClientMessage::ListStrokes { room } => {
                debug!("Peer {} lists strokes of room {}", peer_id, room);
                let forwarder = forward_strokes(state.clone(), room.clone(), out_tx.clone());
                if let Some(previous) = stroke_watches.insert(room, forwarder) {
                    previous.abort();
                }
            }
            ClientMessage::UnlistStrokes { room } => {
                if let Some(forwarder) = stroke_watches.remove(&room) {
                    forwarder.abort();
                }
            }
            ClientMessage::WatchRoom { room } => {
                debug!("Peer {} watches room {}", peer_id, room);
                let forwarder = forward_room(state.clone(), room.clone(), out_tx.clone());
                if let Some(previous) = room_watches.insert(room, forwarder) {
                    previous.abort();
                }
            }
            ClientMessage::UnwatchRoom { room } => {
                if let Some(forwarder) = room_watches.remove(&room) {
                    forwarder.abort();
                }
            }
            request => {
                let Some(reply) = state.respond(request) else {
                    continue;
                };
                if out_tx.send(reply).await.is_err() {
                    break;
                }
            }
        }
    }

    // Cleanup on disconnect
    for forwarder in stroke_watches.into_values().chain(room_watches.into_values()) {
        forwarder.abort();
    }
    drop(out_tx);
    let _ = writer.await;
    info!("Connection closed: {}", peer_id);
}

/// Error reply for a malformed message that still names its request.
fn invalid_request_reply(text: &str, error: &serde_json::Error) -> Option<ServerMessage> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let request_id = value.get("request_id")?.as_u64()?;
    Some(ServerMessage::Reply {
        request_id,
        body: ReplyBody::error(&StoreError::Protocol(format!("Invalid message: {}", error))),
    })
}

/// Push the room's stroke log now and after every append.
fn forward_strokes(
    state: Arc<AppState>,
    room: RoomId,
    out: mpsc::Sender<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (current, rx) = state.subscribe_strokes(&room);
        let initial = ServerMessage::Strokes {
            room: room.clone(),
            strokes: current.to_vec(),
        };
        if out.send(initial).await.is_err() {
            return;
        }
        let Some(mut rx) = rx else {
            return;
        };

        loop {
            let log = match rx.recv().await {
                Ok(log) => log,
                Err(RecvError::Lagged(skipped)) => {
                    // Older snapshots are obsolete: restart at the tail and
                    // send the newest log.
                    debug!("Stroke watcher of room {} skipped {} snapshots", room, skipped);
                    rx = rx.resubscribe();
                    match state.strokes(&room) {
                        Some(log) => log,
                        None => break,
                    }
                }
                Err(RecvError::Closed) => break,
            };
            let message = ServerMessage::Strokes {
                room: room.clone(),
                strokes: log.to_vec(),
            };
            if out.send(message).await.is_err() {
                break;
            }
        }
    })
}

/// Push the room's metadata now and after every change, ending with
/// `exists: false` when the room is deleted.
fn forward_room(
    state: Arc<AppState>,
    room: RoomId,
    out: mpsc::Sender<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (current, rx) = state.subscribe_room(&room);
        let initial = ServerMessage::Room {
            room: room.clone(),
            snapshot: current,
        };
        if out.send(initial).await.is_err() {
            return;
        }
        let Some(mut rx) = rx else {
            return;
        };

        loop {
            let snapshot = match rx.recv().await {
                Ok(snapshot) => snapshot,
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Room watcher of {} skipped {} snapshots", room, skipped);
                    rx = rx.resubscribe();
                    state.room_snapshot(&room)
                }
                Err(RecvError::Closed) => break,
            };
            let exists = snapshot.exists;
            let message = ServerMessage::Room {
                room: room.clone(),
                snapshot,
            };
            if out.send(message).await.is_err() || !exists {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkroom_core::color::StrokeColor;
    use inkroom_core::stroke::{StrokeDraft, UserId};
    use tokio::net::TcpStream;
    use tokio::time::{Duration, timeout};
    use tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as WsMessage,
    };

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app(Arc::new(AppState::new()))).await.unwrap();
        });
        format!("ws://{}/ws", addr)
    }

    async fn connect(url: &str) -> Client {
        connect_async(url).await.unwrap().0
    }

    async fn send(ws: &mut Client, message: ClientMessage) {
        let json = serde_json::to_string(&message).unwrap();
        ws.send(WsMessage::Text(json.into())).await.unwrap();
    }

    async fn send_raw(ws: &mut Client, text: &str) {
        ws.send(WsMessage::Text(text.to_string().into())).await.unwrap();
    }

    async fn recv(ws: &mut Client) -> ServerMessage {
        loop {
            let message = timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("receive timed out")
                .expect("socket closed")
                .unwrap();
            if let WsMessage::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn create_room(ws: &mut Client, name: &str) -> RoomId {
        send(
            ws,
            ClientMessage::CreateRoom {
                request_id: 1,
                name: name.to_string(),
                creator: UserId::from("alice"),
            },
        )
        .await;
        match recv(ws).await {
            ServerMessage::Reply {
                body: ReplyBody::RoomCreated { room },
                ..
            } => room,
            other => panic!("expected room_created, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_append_reaches_other_watchers() {
        let url = start().await;
        let mut alice = connect(&url).await;
        let mut bob = connect(&url).await;
        let room = create_room(&mut alice, "board").await;

        send(&mut bob, ClientMessage::ListStrokes { room: room.clone() }).await;
        match recv(&mut bob).await {
            ServerMessage::Strokes { strokes, .. } => assert!(strokes.is_empty()),
            other => panic!("expected strokes, got {other:?}"),
        }

        let draft = draft("alice");
        send(
            &mut alice,
            ClientMessage::AppendStroke {
                request_id: 2,
                room: room.clone(),
                draft,
            },
        )
        .await;
        assert_eq!(
            recv(&mut alice).await,
            ServerMessage::Reply {
                request_id: 2,
                body: ReplyBody::Ok,
            }
        );

        match recv(&mut bob).await {
            ServerMessage::Strokes { room: pushed, strokes } => {
                assert_eq!(pushed, room);
                assert_eq!(strokes.len(), 1);
                assert_eq!(strokes[0].author_id, UserId::from("alice"));
            }
            other => panic!("expected strokes, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delete_room_pushes_missing() {
        let url = start().await;
        let mut alice = connect(&url).await;
        let mut bob = connect(&url).await;
        let room = create_room(&mut alice, "board").await;

        send(&mut bob, ClientMessage::WatchRoom { room: room.clone() }).await;
        match recv(&mut bob).await {
            ServerMessage::Room { snapshot, .. } => assert!(snapshot.exists),
            other => panic!("expected room, got {other:?}"),
        }

        send(
            &mut alice,
            ClientMessage::DeleteRoom {
                request_id: 5,
                room: room.clone(),
            },
        )
        .await;
        match recv(&mut bob).await {
            ServerMessage::Room { snapshot, .. } => assert!(!snapshot.exists),
            other => panic!("expected room, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_request_gets_error_reply() {
        let url = start().await;
        let mut client = connect(&url).await;

        send_raw(&mut client, r#"{"type":"append_stroke","request_id":8,"room":"r"}"#).await;
        match recv(&mut client).await {
            ServerMessage::Reply {
                request_id: 8,
                body: ReplyBody::Error { .. },
            } => {}
            other => panic!("expected error reply, got {other:?}"),
        }
    }

    #[test]
    fn test_default_bind_addr() {
        assert_eq!(DEFAULT_ADDR.to_string(), "0.0.0.0:3030");
    }

    fn draft(author: &str) -> StrokeDraft {
        StrokeDraft {
            path: "M0,0 L10,10".to_string(),
            color: StrokeColor::WHITE,
            thickness: 5.0,
            author_id: UserId::from(author),
        }
    }

    fn stroke_count(message: ServerMessage) -> usize {
        match message {
            ServerMessage::Strokes { strokes, .. } => strokes.len(),
            other => panic!("expected strokes, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lagging_watcher_skips_to_newest_log() {
        let state = Arc::new(AppState::with_channel_capacity(2));
        let room = state.create_room("board", &UserId::from("alice"));
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let forwarder = forward_strokes(state.clone(), room.clone(), out_tx);

        assert_eq!(stroke_count(out_rx.recv().await.unwrap()), 0);

        // Five appends overflow the two-slot channel before the forwarder runs.
        for _ in 0..5 {
            state.append_stroke(&room, draft("alice")).unwrap();
        }
        assert_eq!(stroke_count(out_rx.recv().await.unwrap()), 5);
        tokio::task::yield_now().await;
        assert!(out_rx.try_recv().is_err());

        state.append_stroke(&room, draft("alice")).unwrap();
        assert_eq!(stroke_count(out_rx.recv().await.unwrap()), 6);
        forwarder.abort();
    }

    #[tokio::test]
    async fn test_malformed_message_without_request_is_ignored() {
        let url = start().await;
        let mut client = connect(&url).await;

        send_raw(&mut client, "not json").await;
        send_raw(&mut client, r#"{"type":"watch_room"}"#).await;

        // The connection still serves requests, and the next message is
        // the reply to this one.
        send(
            &mut client,
            ClientMessage::GetUsers {
                request_id: 3,
                ids: Vec::new(),
            },
        )
        .await;
        assert_eq!(
            recv(&mut client).await,
            ServerMessage::Reply {
                request_id: 3,
                body: ReplyBody::Users { users: Vec::new() },
            }
        );
    }
}

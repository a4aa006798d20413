use super::*;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message as ServerWsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{net::TcpListener, time::timeout};

use crate::{ChatClient, ClientEvent, SessionStore};

fn test_token(sub: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"{sub}","exp":4102444800}}"#));
    format!("{header}.{payload}.sig")
}

/// What the scripted room server does once a stream is attached.
#[derive(Clone, Copy, PartialEq)]
enum Script {
    EmitThree,
    SameMillisecond,
    CloseUnauthorized,
    CloseNormal,
    StayOpen,
}

#[derive(Clone)]
struct RoomServer {
    expected_token: String,
    script: Script,
    accept_delay: Option<Duration>,
    received: Arc<Mutex<Vec<String>>>,
    socket_done: Arc<Mutex<bool>>,
    history: Arc<Vec<Value>>,
}

impl RoomServer {
    fn new(script: Script, token: &str) -> Self {
        Self {
            expected_token: token.to_string(),
            script,
            accept_delay: None,
            received: Arc::new(Mutex::new(Vec::new())),
            socket_done: Arc::new(Mutex::new(false)),
            history: Arc::new(Vec::new()),
        }
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

async fn history_route(State(server): State<RoomServer>) -> Json<Vec<Value>> {
    Json(server.history.as_ref().clone())
}

async fn ws_route(
    State(server): State<RoomServer>,
    Path(_room_id): Path<i64>,
    Query(query): Query<TokenQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    if let Some(delay) = server.accept_delay {
        tokio::time::sleep(delay).await;
    }
    upgrade.on_upgrade(move |socket| drive_socket(server, query.token, socket))
}

async fn drive_socket(server: RoomServer, token: String, mut socket: WebSocket) {
    if token != server.expected_token {
        let _ = socket
            .send(ServerWsMessage::Close(Some(CloseFrame {
                code: CLOSE_UNAUTHORIZED,
                reason: "not a member".into(),
            })))
            .await;
        return;
    }
    match server.script {
        Script::CloseUnauthorized => {
            let _ = socket
                .send(ServerWsMessage::Close(Some(CloseFrame {
                    code: CLOSE_UNAUTHORIZED,
                    reason: "not a member".into(),
                })))
                .await;
        }
        Script::CloseNormal => {
            let _ = socket
                .send(ServerWsMessage::Close(Some(CloseFrame {
                    code: 1000,
                    reason: "going away".into(),
                })))
                .await;
        }
        Script::EmitThree => {
            for index in 0..3 {
                let frame = json!({
                    "id": index + 100,
                    "username": "alice",
                    "content": format!("live-{index}"),
                    "created_at": "2024-05-01 10:00:05.000000",
                })
                .to_string();
                let _ = socket.send(ServerWsMessage::Text(frame)).await;
            }
            collect_incoming(&server, socket).await;
        }
        Script::SameMillisecond => {
            for content in ["first", "second"] {
                let frame = json!({
                    "username": "bob",
                    "content": content,
                    "created_at": "2024-05-01 10:00:00.123456",
                })
                .to_string();
                let _ = socket.send(ServerWsMessage::Text(frame)).await;
            }
            collect_incoming(&server, socket).await;
        }
        Script::StayOpen => collect_incoming(&server, socket).await,
    }
    *server.socket_done.lock().await = true;
}

async fn collect_incoming(server: &RoomServer, mut socket: WebSocket) {
    while let Some(Ok(frame)) = socket.recv().await {
        if let ServerWsMessage::Text(text) = frame {
            server.received.lock().await.push(text);
        }
    }
}

async fn spawn_room_server(server: RoomServer) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/rooms/:id/messages", get(history_route))
        .route("/ws/:id", get(ws_route))
        .with_state(server);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn client_with_token(server_url: String, token: String) -> Arc<ChatClient> {
    let session = SessionStore::new();
    session.install(token).expect("install token");
    ChatClient::new(server_url, session)
}

async fn wait_for_appends(
    events: &mut broadcast::Receiver<ClientEvent>,
    count: usize,
) -> Vec<Message> {
    timeout(Duration::from_secs(3), async {
        let mut appended = Vec::new();
        while appended.len() < count {
            if let ClientEvent::MessageAppended { message, .. } =
                events.recv().await.expect("event stream closed")
            {
                appended.push(message);
            }
        }
        appended
    })
    .await
    .expect("timed out waiting for live messages")
}

#[tokio::test]
async fn live_frames_append_in_exact_arrival_order() {
    let token = test_token("alice");
    let server = RoomServer::new(Script::EmitThree, &token);
    let server_url = spawn_room_server(server).await;
    let client = client_with_token(server_url, token);

    let mut events = client.subscribe_events();
    let room = client.enter_room(RoomId(1)).await.expect("enter");

    let appended = wait_for_appends(&mut events, 3).await;
    let contents: Vec<_> = appended
        .iter()
        .map(|message| message.content.as_str())
        .collect();
    assert_eq!(contents, vec!["live-0", "live-1", "live-2"]);

    let snapshot = room.snapshot().await;
    let live: Vec<_> = snapshot
        .iter()
        .filter(|message| message.content.starts_with("live-"))
        .map(|message| message.content.as_str())
        .collect();
    assert_eq!(live, vec!["live-0", "live-1", "live-2"]);
}

#[tokio::test]
async fn history_and_live_merge_into_one_timeline() {
    let token = test_token("alice");
    let mut server = RoomServer::new(Script::EmitThree, &token);
    // Newest-first page, as the server hands it out.
    server.history = Arc::new(vec![
        json!({"id": 2, "username": "alice", "content": "newer", "created_at": "2024-05-01T09:30:00"}),
        json!({"id": 1, "username": "alice", "content": "older", "created_at": "2024-05-01T09:00:00"}),
    ]);
    let server_url = spawn_room_server(server).await;
    let client = client_with_token(server_url, token);

    let mut events = client.subscribe_events();
    let room = client.enter_room(RoomId(1)).await.expect("enter");

    // History and live land in either order; wait until both are in.
    let history_count = timeout(Duration::from_secs(3), async {
        let mut history_count = None;
        let mut appended = 0;
        loop {
            match events.recv().await.expect("event stream closed") {
                ClientEvent::HistoryLoaded { count, .. } => history_count = Some(count),
                ClientEvent::MessageAppended { .. } => appended += 1,
                _ => {}
            }
            if let Some(count) = history_count {
                if appended >= 3 {
                    break count;
                }
            }
        }
    })
    .await
    .expect("timed out waiting for history and live frames");
    assert_eq!(history_count, 2);

    let contents: Vec<_> = room
        .snapshot()
        .await
        .iter()
        .map(|message| message.content.clone())
        .collect();
    assert_eq!(contents, vec!["older", "newer", "live-0", "live-1", "live-2"]);
}

#[tokio::test]
async fn same_timestamp_frames_keep_arrival_order() {
    let token = test_token("bob");
    let server = RoomServer::new(Script::SameMillisecond, &token);
    let server_url = spawn_room_server(server).await;
    let client = client_with_token(server_url, token);

    let mut events = client.subscribe_events();
    let room = client.enter_room(RoomId(1)).await.expect("enter");

    let appended = wait_for_appends(&mut events, 2).await;
    assert_eq!(appended[0].content, "first");
    assert_eq!(appended[1].content, "second");
    assert_eq!(appended[0].created_at, appended[1].created_at);
    assert!(appended[0].created_at.is_some());

    let snapshot = room.snapshot().await;
    let contents: Vec<_> = snapshot
        .iter()
        .map(|message| message.content.as_str())
        .collect();
    assert_eq!(contents, vec!["first", "second"]);
}

#[tokio::test]
async fn send_before_open_is_a_silent_no_op() {
    let token = test_token("alice");
    let mut server = RoomServer::new(Script::StayOpen, &token);
    server.accept_delay = Some(Duration::from_millis(400));
    let received = Arc::clone(&server.received);
    let server_url = spawn_room_server(server).await;
    let client = client_with_token(server_url, token);

    let room = client.enter_room(RoomId(1)).await.expect("enter");
    let mut state_rx = room.subscribe_state();
    timeout(
        Duration::from_secs(2),
        state_rx.wait_for(|state| *state == ConnectionState::Connecting),
    )
    .await
    .expect("timed out waiting for connecting")
    .expect("state channel closed");

    // Still connecting: this frame must vanish without error or queue.
    room.send("dropped").await;

    timeout(
        Duration::from_secs(3),
        state_rx.wait_for(|state| state.is_open()),
    )
    .await
    .expect("timed out waiting for open")
    .expect("state channel closed");
    room.send("delivered").await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let frames = received.lock().await.clone();
    assert_eq!(frames, vec!["delivered".to_string()]);
}

#[tokio::test]
async fn unauthorized_close_revokes_room_access() {
    let token = test_token("alice");
    let server = RoomServer::new(Script::CloseUnauthorized, &token);
    let server_url = spawn_room_server(server).await;
    let client = client_with_token(server_url, token);

    let mut events = client.subscribe_events();
    let room = client.enter_room(RoomId(1)).await.expect("enter");

    let reason = timeout(Duration::from_secs(3), async {
        loop {
            if let ClientEvent::RoomAccessRevoked { reason, .. } =
                events.recv().await.expect("event stream closed")
            {
                break reason;
            }
        }
    })
    .await
    .expect("timed out waiting for revocation");
    assert_eq!(reason, "not a member");

    let mut state_rx = room.subscribe_state();
    let closed = timeout(
        Duration::from_secs(3),
        state_rx.wait_for(|state| matches!(state, ConnectionState::Closed { .. })),
    )
    .await
    .expect("timed out waiting for close")
    .expect("state channel closed")
    .clone();
    assert_eq!(
        closed,
        ConnectionState::Closed {
            code: Some(CLOSE_UNAUTHORIZED),
            reason: "not a member".to_string(),
        }
    );
    assert!(!room.state().is_open());
}

#[tokio::test]
async fn ordinary_close_is_not_a_revocation() {
    let token = test_token("alice");
    let server = RoomServer::new(Script::CloseNormal, &token);
    let received = Arc::clone(&server.received);
    let server_url = spawn_room_server(server).await;
    let client = client_with_token(server_url, token);

    let mut events = client.subscribe_events();
    let room = client.enter_room(RoomId(1)).await.expect("enter");

    let mut state_rx = room.subscribe_state();
    let closed = timeout(
        Duration::from_secs(3),
        state_rx.wait_for(|state| matches!(state, ConnectionState::Closed { .. })),
    )
    .await
    .expect("timed out waiting for close")
    .expect("state channel closed")
    .clone();
    assert_eq!(
        closed,
        ConnectionState::Closed {
            code: Some(1000),
            reason: "going away".to_string(),
        }
    );

    // Drain whatever was published; a revocation must not be among it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, ClientEvent::RoomAccessRevoked { .. }));
    }

    // Closed stream: sends become no-ops rather than errors.
    room.send("late").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(received.lock().await.is_empty());
}

#[tokio::test]
async fn close_tears_down_the_transport() {
    let token = test_token("alice");
    let server = RoomServer::new(Script::StayOpen, &token);
    let socket_done = Arc::clone(&server.socket_done);
    let server_url = spawn_room_server(server).await;
    let client = client_with_token(server_url, token);

    let mut room = client.enter_room(RoomId(1)).await.expect("enter");
    let mut state_rx = room.subscribe_state();
    timeout(
        Duration::from_secs(3),
        state_rx.wait_for(|state| state.is_open()),
    )
    .await
    .expect("timed out waiting for open")
    .expect("state channel closed");

    room.close().await;

    timeout(Duration::from_secs(2), async {
        loop {
            if *socket_done.lock().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("server socket never observed the close");
}

#[tokio::test]
async fn dropping_the_session_cancels_its_tasks() {
    let token = test_token("alice");
    let server = RoomServer::new(Script::StayOpen, &token);
    let socket_done = Arc::clone(&server.socket_done);
    let server_url = spawn_room_server(server).await;
    let client = client_with_token(server_url, token);

    let room = client.enter_room(RoomId(1)).await.expect("enter");
    let mut state_rx = room.subscribe_state();
    timeout(
        Duration::from_secs(3),
        state_rx.wait_for(|state| state.is_open()),
    )
    .await
    .expect("timed out waiting for open")
    .expect("state channel closed");

    drop(room);

    // Aborting the reader drops its half of the transport; the server
    // side sees the connection end.
    timeout(Duration::from_secs(2), async {
        loop {
            if *socket_done.lock().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("server socket never observed the teardown");
}

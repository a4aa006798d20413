use std::sync::Arc;

use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};
use url::Url;

use shared::{domain::RoomId, protocol::Message};

use crate::{timeline::Timeline, ClientEvent};

/// Close code reserved by the server to mean "not authorized for this
/// room", discovered after connect. Fatal for the room view; never
/// retried in place.
pub const CLOSE_UNAUTHORIZED: u16 = 4003;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed {
        code: Option<u16>,
        reason: String,
    },
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type SinkSlot = Arc<Mutex<Option<WsSink>>>;

/// Handle to one room's live view: the reconciled timeline, the stream
/// state machine, and the outbound send half. Dropping it tears the
/// stream and the history fetch down on every exit path.
pub struct RoomSession {
    room_id: RoomId,
    timeline: Arc<Mutex<Timeline>>,
    state_rx: watch::Receiver<ConnectionState>,
    sink: SinkSlot,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("room_id", &self.room_id)
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl RoomSession {
    pub(crate) fn new(
        room_id: RoomId,
        timeline: Arc<Mutex<Timeline>>,
        state_rx: watch::Receiver<ConnectionState>,
        sink: SinkSlot,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            room_id,
            timeline,
            state_rx,
            sink,
            tasks,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub async fn snapshot(&self) -> Vec<Message> {
        self.timeline.lock().await.snapshot()
    }

    /// Send one raw text frame. Preconditioned on the stream being open;
    /// anything else is a silent no-op, not an error and not a queue.
    /// The server attaches sender identity, timestamp, and id before
    /// rebroadcasting, so no message is fabricated locally.
    pub async fn send(&self, content: &str) {
        if !self.state().is_open() {
            return;
        }
        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return;
        };
        if let Err(err) = sink.send(WsMessage::Text(content.to_string())).await {
            warn!(room_id = self.room_id.0, "stream send failed: {err}");
        }
    }

    /// Deterministic teardown: close the transport and cancel both
    /// source tasks. Drop performs the same cancellation for exit paths
    /// that never call this.
    pub async fn close(&mut self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(WsMessage::Close(None)).await;
        }
        self.abort_tasks();
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Spawn the supervisor task for one room stream and hand back the state
/// subscription, the shared send half, and the task handle.
pub(crate) fn spawn(
    room_id: RoomId,
    ws_url: Url,
    timeline: Arc<Mutex<Timeline>>,
    events: broadcast::Sender<ClientEvent>,
) -> (watch::Receiver<ConnectionState>, SinkSlot, JoinHandle<()>) {
    let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
    let sink_slot: SinkSlot = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&sink_slot);
    let task = tokio::spawn(async move {
        run_stream(room_id, ws_url, timeline, events, state_tx, slot).await;
    });
    (state_rx, sink_slot, task)
}

async fn run_stream(
    room_id: RoomId,
    ws_url: Url,
    timeline: Arc<Mutex<Timeline>>,
    events: broadcast::Sender<ClientEvent>,
    state_tx: watch::Sender<ConnectionState>,
    sink_slot: SinkSlot,
) {
    set_state(&state_tx, &events, room_id, ConnectionState::Connecting);
    let (ws_stream, _) = match connect_async(ws_url.as_str()).await {
        Ok(connected) => connected,
        Err(err) => {
            warn!(room_id = room_id.0, "stream connect failed: {err}");
            set_state(
                &state_tx,
                &events,
                room_id,
                ConnectionState::Closed {
                    code: None,
                    reason: format!("connect failed: {err}"),
                },
            );
            return;
        }
    };
    let (sink, mut reader) = ws_stream.split();
    *sink_slot.lock().await = Some(sink);
    set_state(&state_tx, &events, room_id, ConnectionState::Open);
    info!(room_id = room_id.0, "stream open");

    let mut closed = ConnectionState::Closed {
        code: None,
        reason: String::new(),
    };
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<Message>(&text) {
                Ok(message) => {
                    timeline.lock().await.append_live(message.clone());
                    let _ = events.send(ClientEvent::MessageAppended { room_id, message });
                }
                Err(err) => {
                    let _ = events.send(ClientEvent::Error(format!(
                        "invalid message frame: {err}"
                    )));
                }
            },
            Ok(WsMessage::Close(frame)) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                    None => (None, String::new()),
                };
                closed = ConnectionState::Closed { code, reason };
                break;
            }
            Ok(_) => {}
            Err(err) => {
                closed = ConnectionState::Closed {
                    code: None,
                    reason: format!("stream error: {err}"),
                };
                break;
            }
        }
    }
    sink_slot.lock().await.take();

    if let ConnectionState::Closed { code, reason } = &closed {
        if *code == Some(CLOSE_UNAUTHORIZED) {
            // Authorization revoked mid-room: the caller must leave the
            // room; a fresh connection attempt cannot fix this.
            warn!(
                room_id = room_id.0,
                reason = reason.as_str(),
                "stream closed: not authorized"
            );
            let _ = events.send(ClientEvent::RoomAccessRevoked {
                room_id,
                reason: reason.clone(),
            });
        } else {
            // Ordinary disconnect. No auto-reconnect: re-entry is left
            // to the user to avoid silent reconnect storms.
            info!(room_id = room_id.0, "stream disconnected");
        }
    }
    set_state(&state_tx, &events, room_id, closed);
}

fn set_state(
    state_tx: &watch::Sender<ConnectionState>,
    events: &broadcast::Sender<ClientEvent>,
    room_id: RoomId,
    state: ConnectionState,
) {
    let _ = state_tx.send(state.clone());
    let _ = events.send(ClientEvent::ConnectionChanged { room_id, state });
}

#[cfg(test)]
#[path = "tests/stream_tests.rs"]
mod stream_tests;

use std::sync::Arc;

use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::warn;
use url::Url;

use shared::{
    domain::RoomId,
    protocol::{Message, NewRoom, Room},
};

pub mod api;
pub mod session;
pub mod stream;
pub mod timeline;

pub use api::{ApiClient, ApiError, JoinOutcome, DEFAULT_HISTORY_LIMIT};
pub use session::{CredentialError, SessionStore, SessionUser};
pub use stream::{ConnectionState, RoomSession, CLOSE_UNAUTHORIZED};

use crate::timeline::Timeline;

/// Events fanned out to subscribers: timeline appends, connection state
/// transitions, auth changes, and normalized failures. Remote failures
/// never propagate as panics; they degrade the local view instead.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    AuthChanged(Option<SessionUser>),
    HistoryLoaded { room_id: RoomId, count: usize },
    MessageAppended { room_id: RoomId, message: Message },
    ConnectionChanged { room_id: RoomId, state: ConnectionState },
    RoomAccessRevoked { room_id: RoomId, reason: String },
    Error(String),
}

#[derive(Debug, Error)]
pub enum EnterRoomError {
    /// No credential: the supervisor stays idle and performs no
    /// connection attempt.
    #[error("not logged in")]
    NotAuthenticated,
    #[error("cannot derive stream url from {base}: {reason}")]
    BadStreamUrl { base: String, reason: String },
}

/// The realtime synchronization engine: one authenticated request
/// client, one session context, and per-room live views created by
/// [`ChatClient::enter_room`].
pub struct ChatClient {
    api: ApiClient,
    session: Arc<SessionStore>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(server_url: impl Into<String>, session: Arc<SessionStore>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let client = Arc::new(Self {
            api: ApiClient::new(server_url, Arc::clone(&session)),
            session,
            events,
        });
        client.spawn_auth_forwarder();
        client
    }

    fn spawn_auth_forwarder(self: &Arc<Self>) {
        let mut changes = self.session.subscribe();
        let events = self.events.clone();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let user = changes.borrow_and_update().clone();
                let _ = events.send(ClientEvent::AuthChanged(user));
            }
        });
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<SessionUser, ApiError> {
        self.api.login(username, password).await
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<(), ApiError> {
        self.api.register(username, password).await
    }

    pub fn logout(&self) {
        self.session.clear();
    }

    pub async fn list_rooms(&self) -> Result<Vec<Room>, ApiError> {
        self.api.list_rooms().await
    }

    pub async fn create_room(&self, room: NewRoom) -> Result<Room, ApiError> {
        self.api.create_room(room).await
    }

    pub async fn join_room(&self, room: &Room, secret: Option<&str>) -> JoinOutcome {
        self.api.join_room(room, secret).await
    }

    /// Enter a room the caller has already negotiated access to: start
    /// the history fetch and the stream attach concurrently and return
    /// the live view. The reconciler tolerates either order of arrival.
    pub async fn enter_room(&self, room_id: RoomId) -> Result<RoomSession, EnterRoomError> {
        let Some(token) = self.session.current_token() else {
            return Err(EnterRoomError::NotAuthenticated);
        };
        let ws_url = self.ws_url(room_id, &token)?;
        let timeline = Arc::new(Mutex::new(Timeline::new()));

        let history_task = self.spawn_history_fetch(room_id, Arc::clone(&timeline));
        let (state_rx, sink, stream_task) = stream::spawn(
            room_id,
            ws_url,
            Arc::clone(&timeline),
            self.events.clone(),
        );

        Ok(RoomSession::new(
            room_id,
            timeline,
            state_rx,
            sink,
            vec![stream_task, history_task],
        ))
    }

    /// The stream transport carries no custom headers, so the credential
    /// travels as a query parameter on the connection URI.
    fn ws_url(&self, room_id: RoomId, token: &str) -> Result<Url, EnterRoomError> {
        let base = self.api.base_url();
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(EnterRoomError::BadStreamUrl {
                base: base.to_string(),
                reason: "server url must start with http:// or https://".to_string(),
            });
        };
        let mut url = Url::parse(&format!("{ws_base}/ws/{}", room_id.0)).map_err(|err| {
            EnterRoomError::BadStreamUrl {
                base: base.to_string(),
                reason: err.to_string(),
            }
        })?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }

    fn spawn_history_fetch(
        &self,
        room_id: RoomId,
        timeline: Arc<Mutex<Timeline>>,
    ) -> JoinHandle<()> {
        let api = self.api.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let history = match api.fetch_history(room_id, DEFAULT_HISTORY_LIMIT).await {
                Ok(history) => history,
                Err(err) => {
                    // A failed history load degrades to an empty page;
                    // it never blocks the live stream.
                    warn!(room_id = room_id.0, "history fetch failed: {err}");
                    let _ = events.send(ClientEvent::Error(format!(
                        "failed to load history: {err}"
                    )));
                    Vec::new()
                }
            };
            let count = history.len();
            timeline.lock().await.install_history(history);
            let _ = events.send(ClientEvent::HistoryLoaded { room_id, count });
        })
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod lib_tests;

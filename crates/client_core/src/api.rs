use std::sync::Arc;

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::info;

use shared::{
    domain::RoomId,
    error::ApiFailure,
    protocol::{JoinRequest, Message, NewRoom, RegisterRequest, Room, TokenResponse},
};

use crate::session::{CredentialError, SessionStore, SessionUser};

/// History page size used on room entry, matching the server default.
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Remote failure already normalized to one displayable line.
    #[error("{0}")]
    Remote(String),
    #[error("server unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid server response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Outcome of the one-shot join negotiation performed before any stream
/// is attached. Rejection surfaces a reason and mutates nothing locally,
/// so the caller can retry with corrected input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
    Rejected(String),
}

impl JoinOutcome {
    pub fn allows_entry(&self) -> bool {
        matches!(self, JoinOutcome::Joined | JoinOutcome::AlreadyMember)
    }
}

/// Request client that attaches the current bearer credential to every
/// call. The credential is re-read from the session store per request,
/// never cached across a login/logout boundary.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    session: Arc<SessionStore>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, session: Arc<SessionStore>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: Client::new(),
            base_url,
            session,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.session.current_token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Form-encoded login. On success the issued token is installed into
    /// the session store, replacing any prior credential.
    pub async fn login(&self, username: &str, password: &str) -> Result<SessionUser, ApiError> {
        let response = self
            .http
            .post(format!("{}/auth/login", self.base_url))
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;
        let token: TokenResponse = read_json_or_detail(response, "Login failed").await?;
        let user = self.session.install(token.access_token)?;
        info!(username = user.username.as_str(), "logged in");
        Ok(user)
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<(), ApiError> {
        let response = self
            .http
            .post(format!("{}/auth/register", self.base_url))
            .json(&RegisterRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::Remote(
                ApiFailure::from_body(&body).display_message("Registration failed"),
            ));
        }
        Ok(())
    }

    pub async fn list_rooms(&self) -> Result<Vec<Room>, ApiError> {
        let response = self
            .authorized(self.http.get(format!("{}/rooms/", self.base_url)))
            .send()
            .await?;
        read_json_or_detail(response, "failed to list rooms").await
    }

    pub async fn create_room(&self, room: NewRoom) -> Result<Room, ApiError> {
        let response = self
            .authorized(self.http.post(format!("{}/rooms/", self.base_url)))
            .json(&room)
            .send()
            .await?;
        read_json_or_detail(response, "failed to create room").await
    }

    /// One-shot join negotiation. A private room with no secret is
    /// rejected locally without touching the network; a public room's
    /// secret, if any was offered, is never sent nor inspected.
    pub async fn join_room(&self, room: &Room, secret: Option<&str>) -> JoinOutcome {
        let secret = secret.map(str::trim).filter(|secret| !secret.is_empty());
        if room.is_private && secret.is_none() {
            return JoinOutcome::Rejected("this room requires a password".to_string());
        }
        let password = if room.is_private {
            secret.map(str::to_string)
        } else {
            None
        };
        match self.post_join(room.id, password).await {
            Ok(outcome) => outcome,
            Err(ApiError::Remote(reason)) => JoinOutcome::Rejected(reason),
            Err(err) => JoinOutcome::Rejected(err.to_string()),
        }
    }

    async fn post_join(
        &self,
        room_id: RoomId,
        password: Option<String>,
    ) -> Result<JoinOutcome, ApiError> {
        let response = self
            .authorized(
                self.http
                    .post(format!("{}/rooms/{}/join", self.base_url, room_id.0)),
            )
            .json(&JoinRequest { password })
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::Remote(
                ApiFailure::from_body(&body).display_message("join rejected"),
            ));
        }
        let reply = ApiFailure::from_body(&body);
        if reply.message.as_deref() == Some("Already joined") {
            info!(room_id = room_id.0, "join: already a member");
            Ok(JoinOutcome::AlreadyMember)
        } else {
            info!(room_id = room_id.0, "join: accepted");
            Ok(JoinOutcome::Joined)
        }
    }

    /// Fetch the most recent page of messages. The server returns them
    /// newest-first; the page is reversed to chronological order before
    /// it reaches the reconciler.
    pub async fn fetch_history(
        &self,
        room_id: RoomId,
        limit: u32,
    ) -> Result<Vec<Message>, ApiError> {
        let response = self
            .authorized(
                self.http
                    .get(format!("{}/rooms/{}/messages", self.base_url, room_id.0)),
            )
            .query(&[("limit", limit)])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::Remote(
                ApiFailure::from_body(&body).display_message("failed to load history"),
            ));
        }
        let mut messages: Vec<Message> = serde_json::from_str(&body)?;
        messages.reverse();
        Ok(messages)
    }
}

async fn read_json_or_detail<T: DeserializeOwned>(
    response: reqwest::Response,
    fallback: &str,
) -> Result<T, ApiError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ApiError::Remote(
            ApiFailure::from_body(&body).display_message(fallback),
        ));
    }
    Ok(serde_json::from_str(&body)?)
}

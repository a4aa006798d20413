use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use zeroize::Zeroize;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("malformed bearer token: {0}")]
    Malformed(&'static str),
}

/// Claims embedded in the bearer token, readable without a network call.
/// The client never verifies the signature; it only needs the subject.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub exp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub username: String,
}

struct ActiveSession {
    token: String,
    user: SessionUser,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.token.zeroize();
    }
}

/// Decode the payload segment of a compact JWT. A token that does not
/// decode invalidates the whole session at the call sites.
pub fn decode_claims(token: &str) -> Result<Claims, CredentialError> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(CredentialError::Malformed(
            "expected three dot-separated segments",
        ));
    };
    let decoded = URL_SAFE_NO_PAD
        .decode(payload.as_bytes())
        .map_err(|_| CredentialError::Malformed("payload segment is not base64url"))?;
    serde_json::from_slice(&decoded)
        .map_err(|_| CredentialError::Malformed("payload segment is not a claims object"))
}

/// Session context owning the bearer credential exclusively. Callers
/// re-read the credential per request instead of caching it across a
/// login/logout boundary; auth changes are published over a watch
/// channel. An optional slot file makes the token durable across
/// process restarts.
pub struct SessionStore {
    slot: Option<PathBuf>,
    inner: RwLock<Option<ActiveSession>>,
    changes: watch::Sender<Option<SessionUser>>,
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        let (changes, _) = watch::channel(None);
        Arc::new(Self {
            slot: None,
            inner: RwLock::new(None),
            changes,
        })
    }

    /// Build a store backed by a durable token slot, restoring any
    /// session persisted there. A slot holding an undecodable token is
    /// discarded and the store starts logged out.
    pub fn with_slot(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        let restored = read_slot(&path);
        let user = restored.as_deref().and_then(|token| match decode_claims(token) {
            Ok(claims) => Some(SessionUser {
                username: claims.sub,
            }),
            Err(err) => {
                warn!("discarding persisted token: {err}");
                let _ = fs::remove_file(&path);
                None
            }
        });
        let session = user.and_then(|user| {
            restored.map(|token| {
                info!(username = user.username.as_str(), "session restored from slot");
                ActiveSession { token, user }
            })
        });
        let (changes, _) = watch::channel(session.as_ref().map(|active| active.user.clone()));
        Arc::new(Self {
            slot: Some(path),
            inner: RwLock::new(session),
            changes,
        })
    }

    /// Install a freshly issued credential, replacing any prior value.
    /// A decode failure forces logout and surfaces the error.
    pub fn install(&self, token: String) -> Result<SessionUser, CredentialError> {
        let claims = match decode_claims(&token) {
            Ok(claims) => claims,
            Err(err) => {
                self.clear();
                return Err(err);
            }
        };
        let user = SessionUser {
            username: claims.sub,
        };
        if let Some(path) = &self.slot {
            if let Err(err) = fs::write(path, &token) {
                warn!("failed to persist token slot at {}: {err}", path.display());
            }
        }
        *self.inner.write().expect("session lock poisoned") = Some(ActiveSession {
            token,
            user: user.clone(),
        });
        let _ = self.changes.send(Some(user.clone()));
        Ok(user)
    }

    /// Logout: destroy the credential, remove the durable slot, notify.
    pub fn clear(&self) {
        self.inner.write().expect("session lock poisoned").take();
        if let Some(path) = &self.slot {
            let _ = fs::remove_file(path);
        }
        let _ = self.changes.send(None);
    }

    pub fn current_token(&self) -> Option<String> {
        self.inner
            .read()
            .expect("session lock poisoned")
            .as_ref()
            .map(|active| active.token.clone())
    }

    pub fn current_user(&self) -> Option<SessionUser> {
        self.inner
            .read()
            .expect("session lock poisoned")
            .as_ref()
            .map(|active| active.user.clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SessionUser>> {
        self.changes.subscribe()
    }
}

fn read_slot(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(token) => {
            let token = token.trim().to_string();
            (!token.is_empty()).then_some(token)
        }
        Err(_) => None,
    }
}

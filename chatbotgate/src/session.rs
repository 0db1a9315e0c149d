//!
//! Typed session records and their store.
//!
//! A session binds a browser to one authenticated end-user. Records are
//! JSON-encoded into the KV substrate; unknown fields are ignored on decode
//! so records written by newer builds stay readable.
//!

use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::kv::{KvError, KvStore};

/// Generates a URL-safe random identifier with `bytes` bytes of entropy.
pub(crate) fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

/// One authenticated end-user binding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    /// Opaque, URL-safe identifier; doubles as the cookie value.
    pub id: String,
    /// Canonical lowercase email address.
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    /// `google`, `github`, `microsoft`, `custom:<id>`, `email` or `password`.
    pub provider: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub authenticated: bool,
    /// Provider-supplied claims, preserved verbatim.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Session {
    /// Create a fresh authenticated session with a random 128-bit id.
    pub fn new(email: &str, display_name: &str, provider: &str, ttl: std::time::Duration) -> Self {
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::hours(24));
        Self {
            id: random_token(16),
            email: email.to_lowercase(),
            display_name: display_name.to_string(),
            provider: provider.to_string(),
            created_at: now,
            expires_at: now + ttl,
            authenticated: true,
            extra: serde_json::Map::new(),
        }
    }

    /// A session is valid iff it is authenticated and not yet expired.
    pub fn is_valid(&self) -> bool {
        self.authenticated && Utc::now() < self.expires_at
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("session is already expired")]
    AlreadyExpired,
    #[error(transparent)]
    Store(KvError),
}

impl From<KvError> for SessionError {
    fn from(e: KvError) -> Self {
        match e {
            KvError::NotFound => SessionError::NotFound,
            other => SessionError::Store(other),
        }
    }
}

/// Thin typed façade over the KV store. Sessions are only ever replaced
/// wholesale, never edited in place.
#[derive(Debug, Clone)]
pub struct SessionStore {
    kv: KvStore,
}

impl SessionStore {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// Persist `session` under its id with a TTL matching its expiry.
    pub async fn set(&self, session: &Session) -> Result<(), SessionError> {
        let remaining = session.expires_at - Utc::now();
        let ttl = remaining.to_std().map_err(|_| SessionError::AlreadyExpired)?;
        if ttl.is_zero() {
            return Err(SessionError::AlreadyExpired);
        }
        let bytes = serde_json::to_vec(session)
            .map_err(|e| SessionError::Store(KvError::Backend(e.to_string())))?;
        self.kv.set(&session.id, &bytes, ttl).await?;
        Ok(())
    }

    /// Fetch a session. Records the store still holds but whose decoded
    /// expiry has passed count as absent.
    pub async fn get(&self, id: &str) -> Result<Session, SessionError> {
        let bytes = self.kv.get(id).await?;
        let session: Session =
            serde_json::from_slice(&bytes).map_err(|_| SessionError::NotFound)?;
        if Utc::now() >= session.expires_at {
            return Err(SessionError::NotFound);
        }
        Ok(session)
    }

    pub async fn delete(&self, id: &str) -> Result<(), SessionError> {
        self.kv.delete(id).await?;
        Ok(())
    }

    /// All live sessions; expired and malformed entries are skipped.
    pub async fn list(&self) -> Result<Vec<Session>, SessionError> {
        let mut sessions = Vec::new();
        for id in self.kv.list("").await? {
            match self.get(&id).await {
                Ok(session) => sessions.push(session),
                Err(SessionError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(sessions)
    }

    pub async fn count(&self) -> Result<usize, SessionError> {
        Ok(self.list().await?.len())
    }
}

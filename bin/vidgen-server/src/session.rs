//! Token-based implementation of [`SessionProvider`].
//!
//! A client exchanges the configured API token for a session
//! (`POST /v1/session`). Generation requests admitted while no unexpired
//! session exists fail with `AUTH_REQUIRED`.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::info;
use vidgen_core::{Session, SessionProvider};

use crate::error::ServerError;

const ANONYMOUS: &str = "anonymous";

#[derive(Debug)]
pub struct TokenSessionProvider {
    /// `None` disables authentication.
    token: Option<String>,
    ttl: Duration,
    current: RwLock<Option<Session>>,
}

impl TokenSessionProvider {
    pub fn new(token: Option<String>, ttl_secs: u64) -> Self {
        Self {
            token,
            ttl: Duration::seconds(ttl_secs.min(i64::MAX as u64) as i64),
            current: RwLock::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.token.is_none()
    }

    /// Start a session if `token` matches the configured one.
    pub fn login(&self, token: &str) -> Result<Session, ServerError> {
        let Some(expected) = &self.token else {
            return Ok(Session::new(ANONYMOUS, None));
        };
        if token != expected {
            return Err(ServerError::Unauthorized("invalid token".into()));
        }
        let session = Session::new("api-user", Some(Utc::now() + self.ttl));
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = Some(session.clone());
        info!(expires_at = ?session.expires_at, "session started");
        Ok(session)
    }

    pub fn logout(&self) {
        if self.current.write().unwrap_or_else(|p| p.into_inner()).take().is_some() {
            info!("session ended");
        }
    }
}

#[async_trait]
impl SessionProvider for TokenSessionProvider {
    async fn current_session(&self) -> Option<Session> {
        if self.is_open() {
            return Some(Session::new(ANONYMOUS, None));
        }
        self.current
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

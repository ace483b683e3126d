//! Identity/session collaborator consulted before work is admitted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub user_id: String,
    /// `None` means the session never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            user_id: user_id.into(),
            expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

/// Source of the current session.
///
/// The orchestrator calls [`Self::is_session_valid`] before and after waiting
/// for admission; a `false` answer fails the request with `AUTH_REQUIRED`.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn current_session(&self) -> Option<Session>;

    async fn is_session_valid(&self) -> bool {
        self.current_session()
            .await
            .is_some_and(|session| !session.is_expired())
    }
}

/// A provider that always answers with the same session (or none).
#[derive(Debug, Clone)]
pub struct StaticSession(Option<Session>);

impl StaticSession {
    pub fn new(session: Option<Session>) -> Self {
        Self(session)
    }

    /// A never-expiring session for single-user deployments.
    pub fn anonymous() -> Self {
        Self(Some(Session::new("anonymous", None)))
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn current_session(&self) -> Option<Session> {
        self.0.clone()
    }
}

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use vidgen_core::Session;

#[derive(Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    /// The server's API token.
    #[serde(default)]
    pub token: String,
}

#[derive(Serialize, ToSchema)]
pub struct SessionResponse {
    pub user_id: String,
    /// RFC 3339; absent for sessions that never expire.
    pub expires_at: Option<String>,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            user_id: session.user_id,
            expires_at: session.expires_at.map(|at| at.to_rfc3339()),
        }
    }
}

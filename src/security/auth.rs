//! Request identity extraction.
//!
//! Authentication happens upstream; the gateway forwards the resolved
//! identity in `X-Actor-ID`, `X-Actor-Type` and `X-Actor-Role`.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::debug;
use uuid::Uuid;

use crate::security::identity::{Actor, IdentityError};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_TYPE_HEADER: &str = "x-actor-type";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("malformed actor id")]
    InvalidActorId,
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": self.to_string(), "kind": "unauthenticated" })),
        )
            .into_response()
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, AuthError> {
    let id = header(headers, ACTOR_ID_HEADER).ok_or(AuthError::MissingHeader(ACTOR_ID_HEADER))?;
    let id = Uuid::parse_str(id).map_err(|_| AuthError::InvalidActorId)?;
    let user_type = header(headers, ACTOR_TYPE_HEADER).ok_or(AuthError::MissingHeader(ACTOR_TYPE_HEADER))?;
    Ok(Actor::from_parts(id, user_type, header(headers, ACTOR_ROLE_HEADER))?)
}

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct AuthenticatedActor(pub Actor);

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedActor
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let actor = actor_from_headers(&parts.headers).map_err(|e| {
            debug!("Rejecting {} {}: {}", parts.method, parts.uri.path(), e);
            e
        })?;
        Ok(AuthenticatedActor(actor))
    }
}

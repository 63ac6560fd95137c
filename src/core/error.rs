use axum::http::StatusCode;
use axum::{response::IntoResponse, Json};

use crate::core::shared::store::StoreError;
use crate::sessions::SessionStatus;

/// Caller-visible failure of any exposed operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid transition from {current}: {reason}")]
    InvalidTransition {
        current: SessionStatus,
        allowed: Vec<SessionStatus>,
        reason: String,
    },
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Conflict during write: {0}")]
    ConflictDuringWrite(String),
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl ServiceError {
    pub fn invalid_transition(current: SessionStatus, reason: impl Into<String>) -> Self {
        Self::InvalidTransition {
            current,
            allowed: current.next_states().to_vec(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Validation(_) => "validation_error",
            Self::ConflictDuringWrite(_) => "conflict_during_write",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::MissingParent(what) => Self::NotFound(what),
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidTransition { .. } | Self::ConflictDuringWrite(_) => StatusCode::CONFLICT,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let mut body = serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });
        if let Self::InvalidTransition { current, allowed, .. } = &self {
            body["current"] = serde_json::json!(current);
            body["allowed"] = serde_json::json!(allowed);
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_lists_next_states() {
        let err = ServiceError::invalid_transition(SessionStatus::Scheduled, "nothing pending");
        match err {
            ServiceError::InvalidTransition { current, allowed, .. } => {
                assert_eq!(current, SessionStatus::Scheduled);
                assert_eq!(allowed, vec![SessionStatus::Completed, SessionStatus::Cancelled]);
            }
            other => panic!("unexpected {other:?}"),
        }

        let terminal = ServiceError::invalid_transition(SessionStatus::Completed, "final");
        assert!(matches!(
            terminal,
            ServiceError::InvalidTransition { ref allowed, .. } if allowed.is_empty()
        ));
    }

    #[test]
    fn test_status_codes() {
        let cases = [
            (ServiceError::Unauthorized("x".into()), StatusCode::FORBIDDEN),
            (ServiceError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                ServiceError::invalid_transition(SessionStatus::Cancelled, "x"),
                StatusCode::CONFLICT,
            ),
            (ServiceError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (ServiceError::ConflictDuringWrite("x".into()), StatusCode::CONFLICT),
            (ServiceError::StoreUnavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        assert!(matches!(
            ServiceError::from(StoreError::MissingParent("session 1".into())),
            ServiceError::NotFound(_)
        ));
        assert!(matches!(
            ServiceError::from(StoreError::Timeout(std::time::Duration::from_secs(1))),
            ServiceError::StoreUnavailable(_)
        ));
    }
}

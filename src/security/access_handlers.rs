use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::error::ServiceError;
use crate::core::shared::state::AppState;
use crate::security::access::AccessGrant;
use crate::security::auth::AuthenticatedActor;

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub operator_id: Uuid,
    #[serde(default)]
    pub can_view: bool,
    #[serde(default)]
    pub can_edit: bool,
}

pub async fn handle_grant_list(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<Vec<AccessGrant>>, ServiceError> {
    Ok(Json(state.grants.list_grants(&actor, patient_id).await?))
}

pub async fn handle_grant_upsert(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path(patient_id): Path<Uuid>,
    Json(request): Json<GrantRequest>,
) -> Result<Json<AccessGrant>, ServiceError> {
    let grant = state
        .grants
        .grant_access(&actor, patient_id, request.operator_id, request.can_view, request.can_edit)
        .await?;
    Ok(Json(grant))
}

pub async fn handle_grant_revoke(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path((patient_id, operator_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ServiceError> {
    state.grants.revoke_access(&actor, patient_id, operator_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn configure_access_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/patients/:id/access",
            get(handle_grant_list).put(handle_grant_upsert),
        )
        .route("/api/patients/:id/access/:operator_id", delete(handle_grant_revoke))
}

//! HTTP surface of the session lifecycle.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    CreateSessionRequest, Session, SessionDetail, SessionFeedback, SessionFile, SessionInstruction, SessionQuestion,
    SessionUpdate, TransitionOptions,
};
use crate::core::error::ServiceError;
use crate::core::shared::state::AppState;
use crate::security::auth::AuthenticatedActor;

#[derive(Debug, Deserialize)]
pub struct NewQuestion {
    pub question: String,
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub answer: String,
}

#[derive(Debug, Deserialize)]
pub struct NewInstruction {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct NewFeedback {
    pub rating: i32,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NewFile {
    pub file_name: String,
    pub storage_key: String,
}

#[derive(Debug, Deserialize)]
pub struct ReassignRequest {
    pub operator_id: Uuid,
}

pub async fn handle_session_create(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Json(request): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let created = state.lifecycle.create_session(&actor, request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn handle_session_get(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionDetail>, ServiceError> {
    Ok(Json(state.lifecycle.get_session(&actor, id).await?))
}

pub async fn handle_session_update(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path(id): Path<Uuid>,
    Json(update): Json<SessionUpdate>,
) -> Result<Json<Session>, ServiceError> {
    Ok(Json(state.lifecycle.update_session(&actor, id, update).await?))
}

pub async fn handle_session_delete(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path(id): Path<Uuid>,
) -> Result<Json<Session>, ServiceError> {
    Ok(Json(state.lifecycle.delete_session(&actor, id).await?))
}

pub async fn handle_request_complete(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path(id): Path<Uuid>,
) -> Result<Json<Session>, ServiceError> {
    Ok(Json(state.lifecycle.request_complete(&actor, id).await?))
}

pub async fn handle_accept_complete(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path(id): Path<Uuid>,
) -> Result<Json<Session>, ServiceError> {
    Ok(Json(state.lifecycle.accept_complete(&actor, id).await?))
}

pub async fn handle_request_delete(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path(id): Path<Uuid>,
) -> Result<Json<Session>, ServiceError> {
    Ok(Json(state.lifecycle.request_delete(&actor, id).await?))
}

pub async fn handle_accept_delete(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path(id): Path<Uuid>,
) -> Result<Json<Session>, ServiceError> {
    Ok(Json(state.lifecycle.accept_delete(&actor, id).await?))
}

pub async fn handle_reassign(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path(id): Path<Uuid>,
    Json(request): Json<ReassignRequest>,
) -> Result<Json<Session>, ServiceError> {
    Ok(Json(state.lifecycle.reassign_operator(&actor, id, request.operator_id).await?))
}

pub async fn handle_transitions(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path(id): Path<Uuid>,
) -> Result<Json<TransitionOptions>, ServiceError> {
    Ok(Json(state.lifecycle.allowed_transitions(&actor, id).await?))
}

pub async fn handle_question_create(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path(id): Path<Uuid>,
    Json(request): Json<NewQuestion>,
) -> Result<impl IntoResponse, ServiceError> {
    let question: SessionQuestion = state.lifecycle.add_question(&actor, id, &request.question).await?;
    Ok((StatusCode::CREATED, Json(question)))
}

pub async fn handle_question_answer(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path(id): Path<Uuid>,
    Json(request): Json<AnswerRequest>,
) -> Result<Json<SessionQuestion>, ServiceError> {
    Ok(Json(state.lifecycle.answer_question(&actor, id, &request.answer).await?))
}

pub async fn handle_instruction_create(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path(id): Path<Uuid>,
    Json(request): Json<NewInstruction>,
) -> Result<impl IntoResponse, ServiceError> {
    let instruction: SessionInstruction = state.lifecycle.add_instruction(&actor, id, &request.content).await?;
    Ok((StatusCode::CREATED, Json(instruction)))
}

pub async fn handle_feedback_create(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path(id): Path<Uuid>,
    Json(request): Json<NewFeedback>,
) -> Result<impl IntoResponse, ServiceError> {
    let feedback: SessionFeedback = state
        .lifecycle
        .add_feedback(&actor, id, request.rating, request.comment)
        .await?;
    Ok((StatusCode::CREATED, Json(feedback)))
}

pub async fn handle_file_attach(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path(id): Path<Uuid>,
    Json(request): Json<NewFile>,
) -> Result<impl IntoResponse, ServiceError> {
    let file: SessionFile = state
        .lifecycle
        .attach_file(&actor, id, &request.file_name, &request.storage_key)
        .await?;
    Ok((StatusCode::CREATED, Json(file)))
}

pub async fn handle_patient_sessions(
    State(state): State<Arc<AppState>>,
    AuthenticatedActor(actor): AuthenticatedActor,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<Vec<Session>>, ServiceError> {
    Ok(Json(state.lifecycle.list_patient_sessions(&actor, patient_id).await?))
}

pub fn configure_session_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/sessions", post(handle_session_create))
        .route(
            "/api/sessions/:id",
            get(handle_session_get)
                .patch(handle_session_update)
                .delete(handle_session_delete),
        )
        .route("/api/sessions/:id/request-complete", post(handle_request_complete))
        .route("/api/sessions/:id/accept-complete", post(handle_accept_complete))
        .route("/api/sessions/:id/request-delete", post(handle_request_delete))
        .route("/api/sessions/:id/accept-delete", post(handle_accept_delete))
        .route("/api/sessions/:id/reassign", post(handle_reassign))
        .route("/api/sessions/:id/transitions", get(handle_transitions))
        .route("/api/sessions/:id/questions", post(handle_question_create))
        .route("/api/sessions/:id/instructions", post(handle_instruction_create))
        .route("/api/sessions/:id/feedback", post(handle_feedback_create))
        .route("/api/sessions/:id/files", post(handle_file_attach))
        .route("/api/questions/:id/answer", post(handle_question_answer))
        .route("/api/patients/:id/sessions", get(handle_patient_sessions))
}

//! Session state machine and the two-party consent protocol.
//!
//! Every operation follows the same shape: load, authorize, pre-check the
//! transition, perform one conditional store call, then hand the side
//! effects to the [`HookRunner`] once the write has committed. A conditional
//! call that returns nothing after a passing pre-check lost a race and is
//! reported as [`ServiceError::ConflictDuringWrite`].

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::store::SessionStore;
use super::{
    ConsentKind, CreateSessionRequest, DeletedSession, Session, SessionDetail, SessionFeedback, SessionFile,
    SessionInstruction, SessionPatch, SessionQuestion, SessionStatus, SessionUpdate, TransitionOptions,
};
use crate::core::error::ServiceError;
use crate::core::hooks::{HookRunner, PostCommit};
use crate::core::shared::store::{with_timeout, StoreError};
use crate::notifications::{Notification, NotificationType};
use crate::security::audit::{AuditAction, AuditEntry};
use crate::security::guard::{AuthorizationGuard, Operation};
use crate::security::identity::{Actor, ActorDirectory, OperatorRole};

const MAX_TEXT_LEN: usize = 4000;
const MAX_INTERVAL_DAYS: u32 = 365;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub max_batch_size: usize,
    pub store_timeout: Duration,
    pub package_interval_days: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            store_timeout: Duration::from_millis(5000),
            package_interval_days: 7,
        }
    }
}

pub struct SessionLifecycle {
    sessions: Arc<dyn SessionStore>,
    directory: Arc<dyn ActorDirectory>,
    guard: Arc<AuthorizationGuard>,
    hooks: Arc<HookRunner>,
    config: LifecycleConfig,
}

impl SessionLifecycle {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        directory: Arc<dyn ActorDirectory>,
        guard: Arc<AuthorizationGuard>,
        hooks: Arc<HookRunner>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            sessions,
            directory,
            guard,
            hooks,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    async fn store<T, F>(&self, fut: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        Ok(with_timeout(self.config.store_timeout, fut).await?)
    }

    async fn load(&self, id: Uuid) -> Result<Session, ServiceError> {
        self.store(self.sessions.get(id))
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("session {id}")))
    }

    /// Explains why a conditional write on `id` matched nothing.
    async fn lost_write(&self, id: Uuid, operation: &str) -> ServiceError {
        match self.store(self.sessions.get(id)).await {
            Ok(None) => ServiceError::NotFound(format!("session {id}")),
            Ok(Some(current)) => {
                debug!("{} on session {} lost a concurrent write (now {})", operation, id, current.status);
                ServiceError::ConflictDuringWrite(format!(
                    "session {id} changed while {operation} was in progress (now {})",
                    current.status
                ))
            }
            Err(e) => e,
        }
    }

    async fn permits(&self, actor: &Actor, patient_id: Uuid, operation: Operation) -> Result<bool, ServiceError> {
        match self.guard.authorize(actor, patient_id, operation).await {
            Ok(()) => Ok(true),
            Err(ServiceError::Unauthorized(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn require_patient(&self, patient_id: Uuid) -> Result<(), ServiceError> {
        if self.store(self.directory.patient_exists(patient_id)).await? {
            Ok(())
        } else {
            Err(ServiceError::NotFound(format!("patient {patient_id}")))
        }
    }

    /// The operator must exist, must not be an administrator and must hold
    /// edit access on the patient.
    async fn require_clinical_operator(&self, operator_id: Uuid, patient_id: Uuid) -> Result<(), ServiceError> {
        match self.store(self.directory.operator_role(operator_id)).await? {
            None => return Err(ServiceError::NotFound(format!("operator {operator_id}"))),
            Some(OperatorRole::Admin) => {
                return Err(ServiceError::Validation(
                    "administrators cannot be assigned to clinical sessions".into(),
                ))
            }
            Some(_) => {}
        }
        if self.guard.operator_can_edit(operator_id, patient_id).await? {
            Ok(())
        } else {
            Err(ServiceError::Unauthorized(format!(
                "operator {operator_id} has no edit access to patient {patient_id}"
            )))
        }
    }

    pub async fn create_session(&self, actor: &Actor, request: CreateSessionRequest) -> Result<Vec<Session>, ServiceError> {
        self.guard
            .authorize(actor, request.patient_id, Operation::CreateSession)
            .await?;
        self.require_patient(request.patient_id).await?;
        if let Some(ref notes) = request.notes {
            check_text("notes", notes)?;
        }

        let operator_id = request.operator_id.unwrap_or(actor.id);
        if operator_id != actor.id {
            self.require_clinical_operator(operator_id, request.patient_id).await?;
        }

        let dates = self.expand_dates(&request, Utc::now())?;
        let total = dates.len();
        let package_id = (total > 1).then(Uuid::new_v4);

        let batch: Vec<Session> = dates
            .into_iter()
            .enumerate()
            .map(|(index, date)| {
                let mut session = Session::scheduled(request.patient_id, operator_id, date);
                session.notes = request.notes.clone();
                if package_id.is_some() {
                    session.package_id = package_id;
                    session.session_number = Some(index as i32 + 1);
                    session.total_sessions = Some(total as i32);
                }
                session
            })
            .collect();

        let created = self.store(self.sessions.insert_batch(batch)).await?;
        let Some(first) = created.first() else {
            return Err(ServiceError::Validation("no sessions to create".into()));
        };

        info!(
            "Created {} session(s) for patient {} assigned to {}",
            created.len(),
            first.patient_id,
            operator_id
        );

        let resource_id = package_id.unwrap_or(first.id);
        let audit = AuditEntry::new(actor, AuditAction::SessionCreate, "session", resource_id).with_details(
            serde_json::json!({
                "patient_id": first.patient_id,
                "operator_id": operator_id,
                "package_id": package_id,
                "session_ids": created.iter().map(|s| s.id).collect::<Vec<_>>(),
            }),
        );
        let body = if created.len() > 1 {
            format!("A package of {} sessions starting {} was scheduled", created.len(), first.date.format("%Y-%m-%d"))
        } else {
            format!("A session on {} was scheduled", first.date.format("%Y-%m-%d"))
        };
        let notice = session_notice(first, NotificationType::SessionCreated, "New session scheduled", &body)
            .with_payload(serde_json::json!({
                "session_id": first.id,
                "patient_id": first.patient_id,
                "package_id": package_id,
                "count": created.len(),
            }));
        let hooks = PostCommit::new()
            .audit(audit)
            .notify_all(first.counterparties(actor.id), &notice);
        self.hooks.run(hooks).await;

        Ok(created)
    }

    /// Resolves the request into concrete dates and validates them.
    fn expand_dates(&self, request: &CreateSessionRequest, now: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>, ServiceError> {
        let max = self.config.max_batch_size;

        let dates = match (&request.dates, request.date) {
            (Some(_), Some(_)) => {
                return Err(ServiceError::Validation("provide either dates or date, not both".into()));
            }
            (Some(dates), None) => {
                if dates.is_empty() {
                    return Err(ServiceError::Validation("dates must not be empty".into()));
                }
                if let Some(count) = request.count {
                    if count as usize != dates.len() {
                        return Err(ServiceError::Validation(format!(
                            "count {} does not match {} dates",
                            count,
                            dates.len()
                        )));
                    }
                }
                if dates.len() > max {
                    return Err(ServiceError::Validation(format!("at most {max} sessions per package")));
                }
                dates.clone()
            }
            (None, Some(start)) => {
                let count = request.count.unwrap_or(1) as usize;
                if count == 0 {
                    return Err(ServiceError::Validation("count must be at least 1".into()));
                }
                if count > max {
                    return Err(ServiceError::Validation(format!("at most {max} sessions per package")));
                }
                let interval = request.interval_days.unwrap_or(self.config.package_interval_days);
                if count > 1 && !(1..=MAX_INTERVAL_DAYS).contains(&interval) {
                    return Err(ServiceError::Validation(format!(
                        "interval_days must be between 1 and {MAX_INTERVAL_DAYS}"
                    )));
                }
                (0..count)
                    .map(|i| {
                        ChronoDuration::try_days(i as i64 * interval as i64)
                            .and_then(|offset| start.checked_add_signed(offset))
                            .ok_or_else(|| ServiceError::Validation("session date out of range".into()))
                    })
                    .collect::<Result<Vec<_>, _>>()?
            }
            (None, None) => return Err(ServiceError::Validation("a date or a list of dates is required".into())),
        };

        if let Some(past) = dates.iter().find(|d| **d < now) {
            return Err(ServiceError::Validation(format!("session date {past} is in the past")));
        }
        Ok(dates)
    }

    pub async fn get_session(&self, actor: &Actor, id: Uuid) -> Result<SessionDetail, ServiceError> {
        let session = self.load(id).await?;
        self.guard
            .authorize(actor, session.patient_id, Operation::ViewSession)
            .await?;
        let children = self.store(self.sessions.children(id)).await?;
        Ok(SessionDetail { session, children })
    }

    pub async fn list_patient_sessions(&self, actor: &Actor, patient_id: Uuid) -> Result<Vec<Session>, ServiceError> {
        self.guard
            .authorize(actor, patient_id, Operation::ViewSession)
            .await?;
        self.require_patient(patient_id).await?;
        self.store(self.sessions.list_for_patient(patient_id)).await
    }

    /// Edits date/notes or cancels. Completion is reachable only through
    /// [`Self::accept_complete`].
    pub async fn update_session(&self, actor: &Actor, id: Uuid, update: SessionUpdate) -> Result<Session, ServiceError> {
        let session = self.load(id).await?;
        self.guard
            .authorize(actor, session.patient_id, Operation::UpdateSession)
            .await?;

        if update.date.is_none() && update.notes.is_none() && update.status.is_none() {
            return Err(ServiceError::Validation("nothing to update".into()));
        }
        if let Some(ref notes) = update.notes {
            check_text("notes", notes)?;
        }

        let status = update.status.filter(|s| *s != session.status);
        if let Some(next) = status {
            if !session.status.can_transition_to(next) {
                return Err(ServiceError::invalid_transition(
                    session.status,
                    format!("cannot move from {} to {}", session.status, next),
                ));
            }
            if next == SessionStatus::Completed {
                return Err(ServiceError::invalid_transition(
                    session.status,
                    "completion requires a request accepted by the other party",
                ));
            }
        }
        if let Some(date) = update.date {
            if session.status != SessionStatus::Scheduled {
                return Err(ServiceError::invalid_transition(
                    session.status,
                    "only scheduled sessions can be rescheduled",
                ));
            }
            if date < Utc::now() {
                return Err(ServiceError::Validation(format!("session date {date} is in the past")));
            }
        }

        let patch = SessionPatch {
            date: update.date,
            notes: update.notes,
            status,
            operator_id: None,
        };
        let changed = serde_json::json!({
            "date": patch.date,
            "notes_changed": patch.notes.is_some(),
            "status": patch.status,
        });
        let Some(updated) = self
            .store(self.sessions.update_if_status(id, session.status, patch))
            .await?
        else {
            return Err(self.lost_write(id, "update").await);
        };

        let (kind, title) = if status == Some(SessionStatus::Cancelled) {
            info!("Session {} cancelled by {}", id, actor.id);
            (NotificationType::SessionCancelled, "Session cancelled")
        } else {
            info!("Session {} updated by {}", id, actor.id);
            (NotificationType::SessionUpdated, "Session updated")
        };
        let body = format!("Your session on {} was changed", updated.date.format("%Y-%m-%d"));
        let hooks = PostCommit::new()
            .audit(AuditEntry::new(actor, AuditAction::SessionUpdate, "session", id).with_details(changed))
            .notify_all(updated.counterparties(actor.id), &session_notice(&updated, kind, title, &body));
        self.hooks.run(hooks).await;

        Ok(updated)
    }

    /// Direct removal by an editor. Completed records can only go through
    /// the delete consent protocol.
    pub async fn delete_session(&self, actor: &Actor, id: Uuid) -> Result<Session, ServiceError> {
        let session = self.load(id).await?;
        self.guard
            .authorize(actor, session.patient_id, Operation::DeleteSession)
            .await?;

        if session.status == SessionStatus::Completed {
            return Err(ServiceError::invalid_transition(
                session.status,
                "completed sessions are removed only by mutual delete consent",
            ));
        }

        let Some(deleted) = self.store(self.sessions.delete_unless_completed(id)).await? else {
            return Err(self.lost_write(id, "delete").await);
        };
        info!("Session {} deleted by {}", id, actor.id);

        let hooks = self.deletion_hooks(actor, AuditAction::SessionDelete, &deleted, deleted.session.counterparties(actor.id));
        self.hooks.run(hooks).await;

        Ok(deleted.session)
    }

    fn deletion_hooks(&self, actor: &Actor, action: AuditAction, deleted: &DeletedSession, recipients: Vec<Uuid>) -> PostCommit {
        let session = &deleted.session;
        let body = format!("The session on {} was removed", session.date.format("%Y-%m-%d"));
        PostCommit::new()
            .audit(
                AuditEntry::new(actor, action, "session", session.id).with_details(serde_json::json!({
                    "patient_id": session.patient_id,
                    "operator_id": session.operator_id,
                    "status": session.status,
                    "files_removed": deleted.files.len(),
                })),
            )
            .remove_files(deleted.files.iter().map(|f| f.storage_key.clone()).collect())
            .notify_all(
                recipients,
                &session_notice(session, NotificationType::SessionDeleted, "Session deleted", &body),
            )
    }

    pub async fn request_complete(&self, actor: &Actor, id: Uuid) -> Result<Session, ServiceError> {
        self.request(actor, id, ConsentKind::Complete).await
    }

    pub async fn request_delete(&self, actor: &Actor, id: Uuid) -> Result<Session, ServiceError> {
        self.request(actor, id, ConsentKind::Delete).await
    }

    /// Stamps a consent request. A newer request replaces any pending one.
    async fn request(&self, actor: &Actor, id: Uuid, kind: ConsentKind) -> Result<Session, ServiceError> {
        let session = self.load(id).await?;
        let (operation, action, notification, title) = match kind {
            ConsentKind::Complete => (
                Operation::RequestComplete,
                AuditAction::CompleteRequested,
                NotificationType::CompleteRequested,
                "Completion requested",
            ),
            ConsentKind::Delete => (
                Operation::RequestDelete,
                AuditAction::DeleteRequested,
                NotificationType::DeleteRequested,
                "Deletion requested",
            ),
        };
        self.guard.authorize(actor, session.patient_id, operation).await?;

        if kind == ConsentKind::Complete && session.status != SessionStatus::Scheduled {
            return Err(ServiceError::invalid_transition(
                session.status,
                "only scheduled sessions can be completed",
            ));
        }
        if let Some(previous) = session.requested_by(kind).filter(|p| *p != actor.id) {
            debug!(
                "{} request on session {} from {} replaces pending one from {}",
                kind.as_str(),
                id,
                actor.id,
                previous
            );
        }

        let Some(updated) = self
            .store(self.sessions.record_request(id, kind, actor.id, Utc::now()))
            .await?
        else {
            return Err(self.lost_write(id, operation.as_str()).await);
        };
        info!("{} requested on session {} by {}", kind.as_str(), id, actor.id);

        let body = format!(
            "Please confirm the {} request for the session on {}",
            kind.as_str(),
            updated.date.format("%Y-%m-%d")
        );
        let hooks = PostCommit::new()
            .audit(AuditEntry::new(actor, action, "session", id))
            .notify_all(
                updated.counterparties(actor.id),
                &session_notice(&updated, notification, title, &body),
            );
        self.hooks.run(hooks).await;

        Ok(updated)
    }

    /// Ratifies a pending completion request. The only path to COMPLETED.
    pub async fn accept_complete(&self, actor: &Actor, id: Uuid) -> Result<Session, ServiceError> {
        let session = self.load(id).await?;
        self.guard
            .authorize(actor, session.patient_id, Operation::AcceptComplete)
            .await?;

        if let Some(reason) = session.accept_blocker(ConsentKind::Complete, actor.id) {
            return Err(ServiceError::invalid_transition(session.status, reason));
        }

        let Some(completed) = self
            .store(self.sessions.accept_complete(id, actor.id, Utc::now()))
            .await?
        else {
            return Err(self.lost_write(id, "accept_complete").await);
        };
        info!("Session {} completed, accepted by {}", id, actor.id);

        let body = format!("The session on {} is now completed", completed.date.format("%Y-%m-%d"));
        let hooks = PostCommit::new()
            .audit(
                AuditEntry::new(actor, AuditAction::CompleteAccepted, "session", id).with_details(serde_json::json!({
                    "requested_by": completed.complete_requested_by,
                })),
            )
            .notify_all(
                completed.counterparties(actor.id),
                &session_notice(&completed, NotificationType::CompleteAccepted, "Session completed", &body),
            );
        self.hooks.run(hooks).await;

        Ok(completed)
    }

    /// Ratifies a pending delete request and removes the session with its
    /// owned rows. Stored files are cleaned up afterwards on a best-effort basis.
    pub async fn accept_delete(&self, actor: &Actor, id: Uuid) -> Result<Session, ServiceError> {
        let session = self.load(id).await?;
        self.guard
            .authorize(actor, session.patient_id, Operation::AcceptDelete)
            .await?;

        if let Some(reason) = session.accept_blocker(ConsentKind::Delete, actor.id) {
            return Err(ServiceError::invalid_transition(session.status, reason));
        }

        let Some(deleted) = self
            .store(self.sessions.accept_delete(id, actor.id, Utc::now()))
            .await?
        else {
            return Err(self.lost_write(id, "accept_delete").await);
        };
        info!(
            "Session {} deleted by mutual consent, accepted by {} ({} file(s))",
            id,
            actor.id,
            deleted.files.len()
        );

        let requester: Vec<Uuid> = deleted.session.delete_requested_by.into_iter().collect();
        let hooks = self.deletion_hooks(actor, AuditAction::DeleteAccepted, &deleted, requester);
        self.hooks.run(hooks).await;

        Ok(deleted.session)
    }

    pub async fn reassign_operator(&self, actor: &Actor, id: Uuid, new_operator_id: Uuid) -> Result<Session, ServiceError> {
        let session = self.load(id).await?;
        self.guard
            .authorize(actor, session.patient_id, Operation::ReassignOperator)
            .await?;

        if session.status.is_terminal() {
            return Err(ServiceError::invalid_transition(
                session.status,
                "finished sessions cannot be reassigned",
            ));
        }
        self.require_clinical_operator(new_operator_id, session.patient_id).await?;
        if session.operator_id == new_operator_id {
            return Ok(session);
        }

        let patch = SessionPatch {
            operator_id: Some(new_operator_id),
            ..Default::default()
        };
        let Some(updated) = self
            .store(self.sessions.update_if_status(id, SessionStatus::Scheduled, patch))
            .await?
        else {
            return Err(self.lost_write(id, "reassign").await);
        };
        info!(
            "Session {} reassigned from {} to {} by {}",
            id, session.operator_id, new_operator_id, actor.id
        );

        let mut recipients = vec![session.patient_id, session.operator_id, new_operator_id];
        recipients.retain(|r| *r != actor.id);
        recipients.dedup();
        let body = format!("The session on {} has a new operator", updated.date.format("%Y-%m-%d"));
        let hooks = PostCommit::new()
            .audit(
                AuditEntry::new(actor, AuditAction::SessionReassign, "session", id).with_details(serde_json::json!({
                    "from": session.operator_id,
                    "to": new_operator_id,
                })),
            )
            .notify_all(
                recipients,
                &session_notice(&updated, NotificationType::SessionReassigned, "Session reassigned", &body),
            );
        self.hooks.run(hooks).await;

        Ok(updated)
    }

    pub async fn add_question(&self, actor: &Actor, session_id: Uuid, question: &str) -> Result<SessionQuestion, ServiceError> {
        let session = self.load(session_id).await?;
        self.guard
            .authorize(actor, session.patient_id, Operation::AddQuestion)
            .await?;
        check_text("question", question)?;

        let record = SessionQuestion {
            id: Uuid::new_v4(),
            session_id,
            patient_id: session.patient_id,
            question: question.trim().to_string(),
            answer: None,
            answered_by: None,
            answered_at: None,
            created_at: Utc::now(),
        };
        let created = self.store(self.sessions.insert_question(record)).await?;

        let hooks = PostCommit::new()
            .audit(AuditEntry::new(actor, AuditAction::QuestionCreate, "session_question", created.id))
            .notify(
                session_notice(&session, NotificationType::QuestionAsked, "New question", &created.question)
                    .readdressed(session.operator_id),
            );
        self.hooks.run(hooks).await;

        Ok(created)
    }

    pub async fn answer_question(&self, actor: &Actor, question_id: Uuid, answer: &str) -> Result<SessionQuestion, ServiceError> {
        let question = self
            .store(self.sessions.get_question(question_id))
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("question {question_id}")))?;
        let session = self.load(question.session_id).await?;
        self.guard
            .authorize(actor, session.patient_id, Operation::AnswerQuestion)
            .await?;
        check_text("answer", answer)?;

        if question.is_answered() {
            return Err(ServiceError::Validation(format!("question {question_id} is already answered")));
        }

        let Some(answered) = self
            .store(
                self.sessions
                    .answer_question(question_id, answer.trim().to_string(), actor.id, Utc::now()),
            )
            .await?
        else {
            return Err(match self.store(self.sessions.get_question(question_id)).await? {
                None => ServiceError::NotFound(format!("question {question_id}")),
                Some(_) => ServiceError::ConflictDuringWrite(format!("question {question_id} was answered concurrently")),
            });
        };

        let hooks = PostCommit::new()
            .audit(AuditEntry::new(actor, AuditAction::QuestionAnswer, "session_question", question_id))
            .notify(
                session_notice(&session, NotificationType::QuestionAnswered, "Your question was answered", &answered.question)
                    .readdressed(answered.patient_id),
            );
        self.hooks.run(hooks).await;

        Ok(answered)
    }

    pub async fn add_instruction(&self, actor: &Actor, session_id: Uuid, content: &str) -> Result<SessionInstruction, ServiceError> {
        let session = self.load(session_id).await?;
        self.guard
            .authorize(actor, session.patient_id, Operation::AddInstruction)
            .await?;
        check_text("instruction", content)?;

        let instruction = SessionInstruction {
            id: Uuid::new_v4(),
            session_id,
            operator_id: actor.id,
            content: content.trim().to_string(),
            created_at: Utc::now(),
        };
        let created = self.store(self.sessions.insert_instruction(instruction)).await?;

        let hooks = PostCommit::new()
            .audit(AuditEntry::new(actor, AuditAction::InstructionCreate, "session_instruction", created.id))
            .notify(
                session_notice(&session, NotificationType::InstructionAdded, "New care instruction", &created.content)
                    .readdressed(session.patient_id),
            );
        self.hooks.run(hooks).await;

        Ok(created)
    }

    pub async fn add_feedback(
        &self,
        actor: &Actor,
        session_id: Uuid,
        rating: i32,
        comment: Option<String>,
    ) -> Result<SessionFeedback, ServiceError> {
        let session = self.load(session_id).await?;
        self.guard
            .authorize(actor, session.patient_id, Operation::AddFeedback)
            .await?;

        if !(1..=5).contains(&rating) {
            return Err(ServiceError::Validation(format!("rating must be between 1 and 5, got {rating}")));
        }
        if let Some(ref comment) = comment {
            if comment.len() > MAX_TEXT_LEN {
                return Err(ServiceError::Validation("comment is too long".into()));
            }
        }

        let feedback = SessionFeedback {
            id: Uuid::new_v4(),
            session_id,
            patient_id: session.patient_id,
            rating,
            comment: comment.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()),
            created_at: Utc::now(),
        };
        let created = self.store(self.sessions.insert_feedback(feedback)).await?;

        let body = format!("A patient rated their session {rating}/5");
        let hooks = PostCommit::new()
            .audit(
                AuditEntry::new(actor, AuditAction::FeedbackCreate, "session_feedback", created.id)
                    .with_details(serde_json::json!({ "rating": rating })),
            )
            .notify(
                session_notice(&session, NotificationType::FeedbackReceived, "New feedback", &body)
                    .readdressed(session.operator_id),
            );
        self.hooks.run(hooks).await;

        Ok(created)
    }

    /// Records metadata for an already stored upload.
    pub async fn attach_file(
        &self,
        actor: &Actor,
        session_id: Uuid,
        file_name: &str,
        storage_key: &str,
    ) -> Result<SessionFile, ServiceError> {
        let session = self.load(session_id).await?;
        self.guard
            .authorize(actor, session.patient_id, Operation::AttachFile)
            .await?;

        if file_name.trim().is_empty() {
            return Err(ServiceError::Validation("file_name must not be empty".into()));
        }
        if storage_key.is_empty() || storage_key.starts_with('/') || storage_key.split('/').any(|s| s == "..") {
            return Err(ServiceError::Validation(format!("invalid storage key {storage_key:?}")));
        }

        let file = SessionFile {
            id: Uuid::new_v4(),
            session_id,
            uploaded_by: actor.id,
            file_name: file_name.trim().to_string(),
            storage_key: storage_key.to_string(),
            created_at: Utc::now(),
        };
        let created = self.store(self.sessions.insert_file(file)).await?;

        let body = format!("{} was added to your session", created.file_name);
        let hooks = PostCommit::new()
            .audit(AuditEntry::new(actor, AuditAction::FileAttach, "session_file", created.id))
            .notify_all(
                session.counterparties(actor.id),
                &session_notice(&session, NotificationType::FileAttached, "New file", &body),
            );
        self.hooks.run(hooks).await;

        Ok(created)
    }

    /// What `actor` may do with the session from its current state.
    pub async fn allowed_transitions(&self, actor: &Actor, id: Uuid) -> Result<TransitionOptions, ServiceError> {
        let session = self.load(id).await?;
        self.guard
            .authorize(actor, session.patient_id, Operation::ViewSession)
            .await?;

        let patient_id = session.patient_id;
        let can_request_complete = session.status == SessionStatus::Scheduled
            && self.permits(actor, patient_id, Operation::RequestComplete).await?;
        let can_accept_complete = session.accept_blocker(ConsentKind::Complete, actor.id).is_none()
            && self.permits(actor, patient_id, Operation::AcceptComplete).await?;
        let can_request_delete = self.permits(actor, patient_id, Operation::RequestDelete).await?;
        let can_accept_delete = session.accept_blocker(ConsentKind::Delete, actor.id).is_none()
            && self.permits(actor, patient_id, Operation::AcceptDelete).await?;

        Ok(TransitionOptions {
            current: session.status,
            allowed: session.status.next_states().to_vec(),
            can_request_complete,
            can_accept_complete,
            can_request_delete,
            can_accept_delete,
        })
    }
}

impl std::fmt::Debug for SessionLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLifecycle")
            .field("guard", &self.guard)
            .field("hooks", &self.hooks)
            .field("config", &self.config)
            .finish()
    }
}

fn check_text(field: &str, value: &str) -> Result<(), ServiceError> {
    if value.trim().is_empty() {
        return Err(ServiceError::Validation(format!("{field} must not be empty")));
    }
    if value.len() > MAX_TEXT_LEN {
        return Err(ServiceError::Validation(format!("{field} is too long")));
    }
    Ok(())
}

/// Notification template about `session`, addressed to its patient.
fn session_notice(session: &Session, kind: NotificationType, title: &str, body: &str) -> Notification {
    Notification::new(session.patient_id, kind, title, body).with_payload(serde_json::json!({
        "session_id": session.id,
        "patient_id": session.patient_id,
        "status": session.status,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::LocalFileStorage;
    use crate::notifications::NotificationFanout;
    use crate::security::access::InMemoryAccessGrantStore;
    use crate::security::audit::{AuditTrail, InMemoryAuditStore};
    use crate::security::identity::InMemoryActorDirectory;
    use crate::sessions::InMemorySessionStore;

    fn lifecycle(max_batch_size: usize) -> SessionLifecycle {
        let timeout = Duration::from_secs(1);
        let hooks = HookRunner::new(
            Arc::new(AuditTrail::new(Arc::new(InMemoryAuditStore::new()), timeout)),
            Arc::new(NotificationFanout::new(timeout)),
            Arc::new(LocalFileStorage::new("/nonexistent")),
            timeout,
        );
        SessionLifecycle::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryActorDirectory::new()),
            Arc::new(AuthorizationGuard::new(Arc::new(InMemoryAccessGrantStore::new()), timeout)),
            Arc::new(hooks),
            LifecycleConfig {
                max_batch_size,
                ..Default::default()
            },
        )
    }

    fn request() -> CreateSessionRequest {
        CreateSessionRequest {
            patient_id: Uuid::new_v4(),
            ..Default::default()
        }
    }

    #[test]
    fn test_expand_date_and_count() {
        let lifecycle = lifecycle(50);
        let now = Utc::now();
        let start = now + ChronoDuration::days(1);
        let req = CreateSessionRequest {
            date: Some(start),
            count: Some(3),
            ..request()
        };

        let dates = lifecycle.expand_dates(&req, now).expect("dates");
        assert_eq!(dates, vec![start, start + ChronoDuration::days(7), start + ChronoDuration::days(14)]);

        let custom = CreateSessionRequest {
            interval_days: Some(2),
            ..req
        };
        let dates = lifecycle.expand_dates(&custom, now).expect("dates");
        assert_eq!(dates[2], start + ChronoDuration::days(4));
    }

    #[test]
    fn test_expand_rejects_bad_requests() {
        let lifecycle = lifecycle(3);
        let now = Utc::now();
        let tomorrow = now + ChronoDuration::days(1);

        let cases = [
            CreateSessionRequest { ..request() },
            CreateSessionRequest {
                dates: Some(Vec::new()),
                ..request()
            },
            CreateSessionRequest {
                dates: Some(vec![tomorrow, tomorrow]),
                count: Some(3),
                ..request()
            },
            CreateSessionRequest {
                date: Some(tomorrow),
                count: Some(4),
                ..request()
            },
            CreateSessionRequest {
                date: Some(now - ChronoDuration::hours(1)),
                ..request()
            },
            CreateSessionRequest {
                date: Some(tomorrow),
                dates: Some(vec![tomorrow]),
                ..request()
            },
            CreateSessionRequest {
                date: Some(tomorrow),
                count: Some(0),
                ..request()
            },
            CreateSessionRequest {
                date: Some(tomorrow),
                count: Some(2),
                interval_days: Some(u32::MAX),
                ..request()
            },
            CreateSessionRequest {
                date: Some(DateTime::<Utc>::MAX_UTC - ChronoDuration::days(1)),
                count: Some(2),
                interval_days: Some(7),
                ..request()
            },
        ];

        for case in cases {
            assert!(
                matches!(lifecycle.expand_dates(&case, now), Err(ServiceError::Validation(_))),
                "expected validation error for {case:?}"
            );
        }
    }

    #[test]
    fn test_dates_with_matching_count() {
        let lifecycle = lifecycle(50);
        let now = Utc::now();
        let dates = vec![now + ChronoDuration::days(2), now + ChronoDuration::days(3)];
        let req = CreateSessionRequest {
            dates: Some(dates.clone()),
            count: Some(2),
            ..request()
        };
        assert_eq!(lifecycle.expand_dates(&req, now).expect("dates"), dates);
    }

    #[test]
    fn test_check_text() {
        assert!(check_text("question", "  ").is_err());
        assert!(check_text("question", &"x".repeat(MAX_TEXT_LEN + 1)).is_err());
        assert!(check_text("question", "Is swelling normal?").is_ok());
    }
}

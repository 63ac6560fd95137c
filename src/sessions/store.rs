use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    ConsentKind, DeletedSession, Session, SessionChildren, SessionFeedback, SessionFile, SessionInstruction,
    SessionPatch, SessionQuestion, SessionStatus,
};
use crate::core::shared::store::StoreError;

/// Persistence contract for sessions and their owned rows.
///
/// Holds no authorization or consent policy. Every mutating call is a single
/// atomic step; the conditional ones return `Ok(None)` when their condition
/// no longer holds (or the row is gone) so the caller can classify the loss.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Session>, StoreError>;

    async fn list_for_patient(&self, patient_id: Uuid) -> Result<Vec<Session>, StoreError>;

    /// Inserts all rows or none.
    async fn insert_batch(&self, sessions: Vec<Session>) -> Result<Vec<Session>, StoreError>;

    /// Applies `patch` iff the row is still in `expected` status.
    async fn update_if_status(
        &self,
        id: Uuid,
        expected: SessionStatus,
        patch: SessionPatch,
    ) -> Result<Option<Session>, StoreError>;

    /// Stamps a consent request. Completion requests only land on scheduled rows.
    async fn record_request(
        &self,
        id: Uuid,
        kind: ConsentKind,
        actor_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError>;

    /// Moves the row to COMPLETED iff a completion request is pending, the
    /// requester is not `actor_id`, and the row is still scheduled.
    async fn accept_complete(&self, id: Uuid, actor_id: Uuid, at: DateTime<Utc>) -> Result<Option<Session>, StoreError>;

    /// Stamps the delete acceptance and removes the row with its owned rows,
    /// iff a delete request is pending and the requester is not `actor_id`.
    async fn accept_delete(
        &self,
        id: Uuid,
        actor_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<DeletedSession>, StoreError>;

    /// Cascade removal iff the row is not COMPLETED.
    async fn delete_unless_completed(&self, id: Uuid) -> Result<Option<DeletedSession>, StoreError>;

    async fn children(&self, session_id: Uuid) -> Result<SessionChildren, StoreError>;

    async fn insert_question(&self, question: SessionQuestion) -> Result<SessionQuestion, StoreError>;

    async fn get_question(&self, id: Uuid) -> Result<Option<SessionQuestion>, StoreError>;

    /// Stores the answer iff the question is still open.
    async fn answer_question(
        &self,
        id: Uuid,
        answer: String,
        operator_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<SessionQuestion>, StoreError>;

    async fn insert_file(&self, file: SessionFile) -> Result<SessionFile, StoreError>;

    async fn insert_instruction(&self, instruction: SessionInstruction) -> Result<SessionInstruction, StoreError>;

    async fn insert_feedback(&self, feedback: SessionFeedback) -> Result<SessionFeedback, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    sessions: HashMap<Uuid, Session>,
    questions: HashMap<Uuid, SessionQuestion>,
    files: HashMap<Uuid, SessionFile>,
    instructions: HashMap<Uuid, SessionInstruction>,
    feedback: HashMap<Uuid, SessionFeedback>,
}

impl Tables {
    fn require_session(&self, session_id: Uuid) -> Result<(), StoreError> {
        if self.sessions.contains_key(&session_id) {
            Ok(())
        } else {
            Err(StoreError::MissingParent(format!("session {session_id}")))
        }
    }

    fn cascade(&mut self, id: Uuid) -> Option<DeletedSession> {
        let session = self.sessions.remove(&id)?;
        let mut files: Vec<SessionFile> = Vec::new();
        self.files.retain(|_, f| {
            if f.session_id == id {
                files.push(f.clone());
                false
            } else {
                true
            }
        });
        self.questions.retain(|_, q| q.session_id != id);
        self.instructions.retain(|_, i| i.session_id != id);
        self.feedback.retain(|_, f| f.session_id != id);
        files.sort_by_key(|f| f.created_at);
        Some(DeletedSession { session, files })
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_insert_at: Option<usize>,
    latency: Option<Duration>,
}

/// Single-lock store: every call holds the table lock for its whole
/// read-modify-write, giving the same atomicity as a row-level transaction.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionStore {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Mutex<Faults>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next batch insert fail when it reaches row `index` (0-based).
    pub async fn fail_next_insert_at(&self, index: usize) {
        self.faults.lock().await.fail_insert_at = Some(index);
    }

    /// Delays every call, for exercising caller-side timeouts.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().await.latency = latency;
    }

    pub async fn session_count(&self) -> usize {
        self.tables.lock().await.sessions.len()
    }

    async fn simulate_latency(&self) {
        let latency = self.faults.lock().await.latency;
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        self.simulate_latency().await;
        Ok(self.tables.lock().await.sessions.get(&id).cloned())
    }

    async fn list_for_patient(&self, patient_id: Uuid) -> Result<Vec<Session>, StoreError> {
        self.simulate_latency().await;
        let tables = self.tables.lock().await;
        let mut sessions: Vec<Session> = tables
            .sessions
            .values()
            .filter(|s| s.patient_id == patient_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.date.cmp(&b.date).then(a.session_number.cmp(&b.session_number)));
        Ok(sessions)
    }

    async fn insert_batch(&self, sessions: Vec<Session>) -> Result<Vec<Session>, StoreError> {
        self.simulate_latency().await;
        let fail_at = self.faults.lock().await.fail_insert_at.take();
        let mut tables = self.tables.lock().await;

        let mut staged = Vec::with_capacity(sessions.len());
        for (index, session) in sessions.into_iter().enumerate() {
            if fail_at == Some(index) {
                return Err(StoreError::Backend(format!("insert failed at row {index}")));
            }
            if tables.sessions.contains_key(&session.id) {
                return Err(StoreError::Backend(format!("duplicate session id {}", session.id)));
            }
            staged.push(session);
        }

        for session in &staged {
            tables.sessions.insert(session.id, session.clone());
        }
        Ok(staged)
    }

    async fn update_if_status(
        &self,
        id: Uuid,
        expected: SessionStatus,
        patch: SessionPatch,
    ) -> Result<Option<Session>, StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.lock().await;
        let Some(session) = tables.sessions.get_mut(&id) else {
            return Ok(None);
        };
        if session.status != expected {
            return Ok(None);
        }
        patch.apply(session, Utc::now());
        Ok(Some(session.clone()))
    }

    async fn record_request(
        &self,
        id: Uuid,
        kind: ConsentKind,
        actor_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.lock().await;
        let Some(session) = tables.sessions.get_mut(&id) else {
            return Ok(None);
        };
        if kind == ConsentKind::Complete && session.status != SessionStatus::Scheduled {
            return Ok(None);
        }
        session.stamp_request(kind, actor_id, at);
        Ok(Some(session.clone()))
    }

    async fn accept_complete(&self, id: Uuid, actor_id: Uuid, at: DateTime<Utc>) -> Result<Option<Session>, StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.lock().await;
        let Some(session) = tables.sessions.get_mut(&id) else {
            return Ok(None);
        };
        if session.accept_blocker(ConsentKind::Complete, actor_id).is_some() {
            return Ok(None);
        }
        session.status = SessionStatus::Completed;
        session.complete_accepted_by = Some(actor_id);
        session.complete_accepted_at = Some(at);
        session.updated_at = at;
        Ok(Some(session.clone()))
    }

    async fn accept_delete(
        &self,
        id: Uuid,
        actor_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<DeletedSession>, StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.lock().await;
        let Some(session) = tables.sessions.get_mut(&id) else {
            return Ok(None);
        };
        if session.accept_blocker(ConsentKind::Delete, actor_id).is_some() {
            return Ok(None);
        }
        session.delete_accepted_by = Some(actor_id);
        session.delete_accepted_at = Some(at);
        session.updated_at = at;
        Ok(tables.cascade(id))
    }

    async fn delete_unless_completed(&self, id: Uuid) -> Result<Option<DeletedSession>, StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.lock().await;
        match tables.sessions.get(&id) {
            Some(session) if session.status != SessionStatus::Completed => Ok(tables.cascade(id)),
            _ => Ok(None),
        }
    }

    async fn children(&self, session_id: Uuid) -> Result<SessionChildren, StoreError> {
        self.simulate_latency().await;
        let tables = self.tables.lock().await;

        let mut children = SessionChildren {
            files: tables.files.values().filter(|f| f.session_id == session_id).cloned().collect(),
            instructions: tables
                .instructions
                .values()
                .filter(|i| i.session_id == session_id)
                .cloned()
                .collect(),
            questions: tables
                .questions
                .values()
                .filter(|q| q.session_id == session_id)
                .cloned()
                .collect(),
            feedback: tables
                .feedback
                .values()
                .filter(|f| f.session_id == session_id)
                .cloned()
                .collect(),
        };
        children.files.sort_by_key(|f| f.created_at);
        children.instructions.sort_by_key(|i| i.created_at);
        children.questions.sort_by_key(|q| q.created_at);
        children.feedback.sort_by_key(|f| f.created_at);
        Ok(children)
    }

    async fn insert_question(&self, question: SessionQuestion) -> Result<SessionQuestion, StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.lock().await;
        tables.require_session(question.session_id)?;
        tables.questions.insert(question.id, question.clone());
        Ok(question)
    }

    async fn get_question(&self, id: Uuid) -> Result<Option<SessionQuestion>, StoreError> {
        self.simulate_latency().await;
        Ok(self.tables.lock().await.questions.get(&id).cloned())
    }

    async fn answer_question(
        &self,
        id: Uuid,
        answer: String,
        operator_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<SessionQuestion>, StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.lock().await;
        let Some(question) = tables.questions.get_mut(&id) else {
            return Ok(None);
        };
        if question.is_answered() {
            return Ok(None);
        }
        question.answer = Some(answer);
        question.answered_by = Some(operator_id);
        question.answered_at = Some(at);
        Ok(Some(question.clone()))
    }

    async fn insert_file(&self, file: SessionFile) -> Result<SessionFile, StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.lock().await;
        tables.require_session(file.session_id)?;
        tables.files.insert(file.id, file.clone());
        Ok(file)
    }

    async fn insert_instruction(&self, instruction: SessionInstruction) -> Result<SessionInstruction, StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.lock().await;
        tables.require_session(instruction.session_id)?;
        tables.instructions.insert(instruction.id, instruction.clone());
        Ok(instruction)
    }

    async fn insert_feedback(&self, feedback: SessionFeedback) -> Result<SessionFeedback, StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.lock().await;
        tables.require_session(feedback.session_id)?;
        tables.feedback.insert(feedback.id, feedback.clone());
        Ok(feedback)
    }
}

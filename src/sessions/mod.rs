pub mod handlers;
pub mod lifecycle;
pub mod pg_store;
pub mod store;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::shared::schema::{session_feedback, session_files, session_instructions, session_questions};

pub use lifecycle::{LifecycleConfig, SessionLifecycle};
pub use pg_store::PgSessionStore;
pub use store::{InMemorySessionStore, SessionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SCHEDULED" => Some(Self::Scheduled),
            "COMPLETED" => Some(Self::Completed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Forward edges of the state machine. Terminal states have none.
    pub fn next_states(&self) -> &'static [SessionStatus] {
        match self {
            Self::Scheduled => &[Self::Completed, Self::Cancelled],
            Self::Completed | Self::Cancelled => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.next_states().is_empty()
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        self.next_states().contains(&next)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentKind {
    Complete,
    Delete,
}

impl ConsentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Delete => "delete",
        }
    }
}

/// One scheduled or completed treatment encounter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub operator_id: Uuid,
    pub date: DateTime<Utc>,
    pub status: SessionStatus,
    pub package_id: Option<Uuid>,
    pub session_number: Option<i32>,
    pub total_sessions: Option<i32>,
    pub notes: Option<String>,
    pub complete_requested_by: Option<Uuid>,
    pub complete_requested_at: Option<DateTime<Utc>>,
    pub complete_accepted_by: Option<Uuid>,
    pub complete_accepted_at: Option<DateTime<Utc>>,
    pub delete_requested_by: Option<Uuid>,
    pub delete_requested_at: Option<DateTime<Utc>>,
    pub delete_accepted_by: Option<Uuid>,
    pub delete_accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn scheduled(patient_id: Uuid, operator_id: Uuid, date: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            patient_id,
            operator_id,
            date,
            status: SessionStatus::Scheduled,
            package_id: None,
            session_number: None,
            total_sessions: None,
            notes: None,
            complete_requested_by: None,
            complete_requested_at: None,
            complete_accepted_by: None,
            complete_accepted_at: None,
            delete_requested_by: None,
            delete_requested_at: None,
            delete_accepted_by: None,
            delete_accepted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn requested_by(&self, kind: ConsentKind) -> Option<Uuid> {
        match kind {
            ConsentKind::Complete => self.complete_requested_by,
            ConsentKind::Delete => self.delete_requested_by,
        }
    }

    /// Applies a consent request stamp. A newer request replaces a pending one.
    pub fn stamp_request(&mut self, kind: ConsentKind, actor_id: Uuid, at: DateTime<Utc>) {
        match kind {
            ConsentKind::Complete => {
                self.complete_requested_by = Some(actor_id);
                self.complete_requested_at = Some(at);
            }
            ConsentKind::Delete => {
                self.delete_requested_by = Some(actor_id);
                self.delete_requested_at = Some(at);
            }
        }
        self.updated_at = at;
    }

    /// Whether `actor_id` could ratify the pending `kind` request right now.
    pub fn accept_blocker(&self, kind: ConsentKind, actor_id: Uuid) -> Option<&'static str> {
        match self.requested_by(kind) {
            None => Some("no pending request"),
            Some(requester) if requester == actor_id => Some("requester cannot accept their own request"),
            Some(_) if kind == ConsentKind::Complete && self.status != SessionStatus::Scheduled => {
                Some("session is no longer scheduled")
            }
            Some(_) => None,
        }
    }

    /// Parties to the session other than `actor_id`.
    pub fn counterparties(&self, actor_id: Uuid) -> Vec<Uuid> {
        [self.patient_id, self.operator_id]
            .into_iter()
            .filter(|id| *id != actor_id)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPatch {
    pub date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub status: Option<SessionStatus>,
    pub operator_id: Option<Uuid>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        self.date.is_none() && self.notes.is_none() && self.status.is_none() && self.operator_id.is_none()
    }

    pub fn apply(&self, session: &mut Session, at: DateTime<Utc>) {
        if let Some(date) = self.date {
            session.date = date;
        }
        if let Some(ref notes) = self.notes {
            session.notes = Some(notes.clone());
        }
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(operator_id) = self.operator_id {
            session.operator_id = operator_id;
        }
        session.updated_at = at;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = session_questions)]
pub struct SessionQuestion {
    pub id: Uuid,
    pub session_id: Uuid,
    pub patient_id: Uuid,
    pub question: String,
    pub answer: Option<String>,
    pub answered_by: Option<Uuid>,
    pub answered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SessionQuestion {
    pub fn is_answered(&self) -> bool {
        self.answer.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = session_files)]
pub struct SessionFile {
    pub id: Uuid,
    pub session_id: Uuid,
    pub uploaded_by: Uuid,
    pub file_name: String,
    pub storage_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = session_instructions)]
pub struct SessionInstruction {
    pub id: Uuid,
    pub session_id: Uuid,
    pub operator_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = session_feedback)]
pub struct SessionFeedback {
    pub id: Uuid,
    pub session_id: Uuid,
    pub patient_id: Uuid,
    pub rating: i32,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Rows owned by a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionChildren {
    pub files: Vec<SessionFile>,
    pub instructions: Vec<SessionInstruction>,
    pub questions: Vec<SessionQuestion>,
    pub feedback: Vec<SessionFeedback>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub session: Session,
    #[serde(flatten)]
    pub children: SessionChildren,
}

/// What a committed cascade delete removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedSession {
    pub session: Session,
    pub files: Vec<SessionFile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub patient_id: Uuid,
    pub operator_id: Option<Uuid>,
    pub dates: Option<Vec<DateTime<Utc>>>,
    pub date: Option<DateTime<Utc>>,
    pub count: Option<u32>,
    pub interval_days: Option<u32>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub status: Option<SessionStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOptions {
    pub current: SessionStatus,
    pub allowed: Vec<SessionStatus>,
    pub can_request_complete: bool,
    pub can_accept_complete: bool,
    pub can_request_delete: bool,
    pub can_accept_delete: bool,
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use uuid::Uuid;

use super::store::SessionStore;
use super::{
    ConsentKind, DeletedSession, Session, SessionChildren, SessionFeedback, SessionFile, SessionInstruction,
    SessionPatch, SessionQuestion, SessionStatus,
};
use crate::core::shared::schema::{session_feedback, session_files, session_instructions, session_questions, sessions};
use crate::core::shared::store::StoreError;
use crate::core::shared::utils::{with_conn, DbPool};

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = sessions)]
struct SessionRow {
    id: Uuid,
    patient_id: Uuid,
    operator_id: Uuid,
    date: DateTime<Utc>,
    status: String,
    package_id: Option<Uuid>,
    session_number: Option<i32>,
    total_sessions: Option<i32>,
    notes: Option<String>,
    complete_requested_by: Option<Uuid>,
    complete_requested_at: Option<DateTime<Utc>>,
    complete_accepted_by: Option<Uuid>,
    complete_accepted_at: Option<DateTime<Utc>>,
    delete_requested_by: Option<Uuid>,
    delete_requested_at: Option<DateTime<Utc>>,
    delete_accepted_by: Option<Uuid>,
    delete_accepted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<&Session> for SessionRow {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id,
            patient_id: s.patient_id,
            operator_id: s.operator_id,
            date: s.date,
            status: s.status.as_str().to_string(),
            package_id: s.package_id,
            session_number: s.session_number,
            total_sessions: s.total_sessions,
            notes: s.notes.clone(),
            complete_requested_by: s.complete_requested_by,
            complete_requested_at: s.complete_requested_at,
            complete_accepted_by: s.complete_accepted_by,
            complete_accepted_at: s.complete_accepted_at,
            delete_requested_by: s.delete_requested_by,
            delete_requested_at: s.delete_requested_at,
            delete_accepted_by: s.delete_accepted_by,
            delete_accepted_at: s.delete_accepted_at,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

impl TryFrom<SessionRow> for Session {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let status = SessionStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Backend(format!("unknown session status {:?} on {}", row.status, row.id)))?;
        Ok(Session {
            id: row.id,
            patient_id: row.patient_id,
            operator_id: row.operator_id,
            date: row.date,
            status,
            package_id: row.package_id,
            session_number: row.session_number,
            total_sessions: row.total_sessions,
            notes: row.notes,
            complete_requested_by: row.complete_requested_by,
            complete_requested_at: row.complete_requested_at,
            complete_accepted_by: row.complete_accepted_by,
            complete_accepted_at: row.complete_accepted_at,
            delete_requested_by: row.delete_requested_by,
            delete_requested_at: row.delete_requested_at,
            delete_accepted_by: row.delete_accepted_by,
            delete_accepted_at: row.delete_accepted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, AsChangeset)]
#[diesel(table_name = sessions)]
struct SessionChanges {
    date: Option<DateTime<Utc>>,
    notes: Option<String>,
    status: Option<String>,
    operator_id: Option<Uuid>,
    updated_at: DateTime<Utc>,
}

fn to_session(row: Option<SessionRow>) -> Result<Option<Session>, StoreError> {
    row.map(Session::try_from).transpose()
}

/// Maps a foreign-key violation on a child insert to a missing parent.
fn child_insert_error(e: DieselError, session_id: Uuid) -> StoreError {
    match e {
        DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _) => {
            StoreError::MissingParent(format!("session {session_id}"))
        }
        other => other.into(),
    }
}

/// Removes a session with its owned rows; must run inside a transaction.
fn cascade_delete(conn: &mut PgConnection, session: Session) -> Result<DeletedSession, DieselError> {
    let files = session_files::table
        .filter(session_files::session_id.eq(session.id))
        .order(session_files::created_at.asc())
        .select(SessionFile::as_select())
        .load(conn)?;

    diesel::delete(session_files::table.filter(session_files::session_id.eq(session.id))).execute(conn)?;
    diesel::delete(session_questions::table.filter(session_questions::session_id.eq(session.id))).execute(conn)?;
    diesel::delete(session_instructions::table.filter(session_instructions::session_id.eq(session.id)))
        .execute(conn)?;
    diesel::delete(session_feedback::table.filter(session_feedback::session_id.eq(session.id))).execute(conn)?;
    diesel::delete(sessions::table.find(session.id)).execute(conn)?;

    Ok(DeletedSession { session, files })
}

/// Postgres-backed store. Conditional mutations are single `UPDATE ... WHERE`
/// statements; batch insert and cascade delete run in one transaction.
#[derive(Debug, Clone)]
pub struct PgSessionStore {
    pool: DbPool,
}

impl PgSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn get(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        with_conn(&self.pool, move |conn| {
            let row = sessions::table
                .find(id)
                .select(SessionRow::as_select())
                .first(conn)
                .optional()?;
            to_session(row)
        })
        .await
    }

    async fn list_for_patient(&self, patient_id: Uuid) -> Result<Vec<Session>, StoreError> {
        with_conn(&self.pool, move |conn| {
            sessions::table
                .filter(sessions::patient_id.eq(patient_id))
                .order((sessions::date.asc(), sessions::session_number.asc()))
                .select(SessionRow::as_select())
                .load::<SessionRow>(conn)?
                .into_iter()
                .map(Session::try_from)
                .collect()
        })
        .await
    }

    async fn insert_batch(&self, batch: Vec<Session>) -> Result<Vec<Session>, StoreError> {
        with_conn(&self.pool, move |conn| {
            let rows: Vec<SessionRow> = batch.iter().map(SessionRow::from).collect();
            let inserted = conn.transaction::<_, DieselError, _>(|conn| {
                diesel::insert_into(sessions::table)
                    .values(&rows)
                    .returning(SessionRow::as_returning())
                    .get_results::<SessionRow>(conn)
            })?;
            inserted.into_iter().map(Session::try_from).collect()
        })
        .await
    }

    async fn update_if_status(
        &self,
        id: Uuid,
        expected: SessionStatus,
        patch: SessionPatch,
    ) -> Result<Option<Session>, StoreError> {
        with_conn(&self.pool, move |conn| {
            let changes = SessionChanges {
                date: patch.date,
                notes: patch.notes,
                status: patch.status.map(|s| s.as_str().to_string()),
                operator_id: patch.operator_id,
                updated_at: Utc::now(),
            };
            let row = diesel::update(
                sessions::table
                    .filter(sessions::id.eq(id))
                    .filter(sessions::status.eq(expected.as_str())),
            )
            .set(&changes)
            .returning(SessionRow::as_returning())
            .get_result(conn)
            .optional()?;
            to_session(row)
        })
        .await
    }

    async fn record_request(
        &self,
        id: Uuid,
        kind: ConsentKind,
        actor_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        with_conn(&self.pool, move |conn| {
            let row = match kind {
                ConsentKind::Complete => diesel::update(
                    sessions::table
                        .filter(sessions::id.eq(id))
                        .filter(sessions::status.eq(SessionStatus::Scheduled.as_str())),
                )
                .set((
                    sessions::complete_requested_by.eq(Some(actor_id)),
                    sessions::complete_requested_at.eq(Some(at)),
                    sessions::updated_at.eq(at),
                ))
                .returning(SessionRow::as_returning())
                .get_result(conn)
                .optional()?,
                ConsentKind::Delete => diesel::update(sessions::table.filter(sessions::id.eq(id)))
                    .set((
                        sessions::delete_requested_by.eq(Some(actor_id)),
                        sessions::delete_requested_at.eq(Some(at)),
                        sessions::updated_at.eq(at),
                    ))
                    .returning(SessionRow::as_returning())
                    .get_result(conn)
                    .optional()?,
            };
            to_session(row)
        })
        .await
    }

    async fn accept_complete(&self, id: Uuid, actor_id: Uuid, at: DateTime<Utc>) -> Result<Option<Session>, StoreError> {
        with_conn(&self.pool, move |conn| {
            let row = diesel::update(
                sessions::table
                    .filter(sessions::id.eq(id))
                    .filter(sessions::status.eq(SessionStatus::Scheduled.as_str()))
                    .filter(sessions::complete_requested_by.is_not_null())
                    .filter(sessions::complete_requested_by.ne(actor_id)),
            )
            .set((
                sessions::status.eq(SessionStatus::Completed.as_str()),
                sessions::complete_accepted_by.eq(Some(actor_id)),
                sessions::complete_accepted_at.eq(Some(at)),
                sessions::updated_at.eq(at),
            ))
            .returning(SessionRow::as_returning())
            .get_result(conn)
            .optional()?;
            to_session(row)
        })
        .await
    }

    async fn accept_delete(
        &self,
        id: Uuid,
        actor_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<DeletedSession>, StoreError> {
        with_conn(&self.pool, move |conn| {
            let stamped = conn.transaction::<_, DieselError, _>(|conn| {
                let row = diesel::update(
                    sessions::table
                        .filter(sessions::id.eq(id))
                        .filter(sessions::delete_requested_by.is_not_null())
                        .filter(sessions::delete_requested_by.ne(actor_id)),
                )
                .set((
                    sessions::delete_accepted_by.eq(Some(actor_id)),
                    sessions::delete_accepted_at.eq(Some(at)),
                    sessions::updated_at.eq(at),
                ))
                .returning(SessionRow::as_returning())
                .get_result(conn)
                .optional()?;

                let Some(row) = row else {
                    return Ok(None);
                };
                let session = Session::try_from(row).map_err(|e| DieselError::QueryBuilderError(e.to_string().into()))?;
                cascade_delete(conn, session).map(Some)
            })?;
            Ok(stamped)
        })
        .await
    }

    async fn delete_unless_completed(&self, id: Uuid) -> Result<Option<DeletedSession>, StoreError> {
        with_conn(&self.pool, move |conn| {
            let deleted = conn.transaction::<_, DieselError, _>(|conn| {
                let row = sessions::table
                    .find(id)
                    .filter(sessions::status.ne(SessionStatus::Completed.as_str()))
                    .select(SessionRow::as_select())
                    .for_update()
                    .first(conn)
                    .optional()?;

                let Some(row) = row else {
                    return Ok(None);
                };
                let session = Session::try_from(row).map_err(|e| DieselError::QueryBuilderError(e.to_string().into()))?;
                cascade_delete(conn, session).map(Some)
            })?;
            Ok(deleted)
        })
        .await
    }

    async fn children(&self, session_id: Uuid) -> Result<SessionChildren, StoreError> {
        with_conn(&self.pool, move |conn| {
            Ok(SessionChildren {
                files: session_files::table
                    .filter(session_files::session_id.eq(session_id))
                    .order(session_files::created_at.asc())
                    .select(SessionFile::as_select())
                    .load(conn)?,
                instructions: session_instructions::table
                    .filter(session_instructions::session_id.eq(session_id))
                    .order(session_instructions::created_at.asc())
                    .select(SessionInstruction::as_select())
                    .load(conn)?,
                questions: session_questions::table
                    .filter(session_questions::session_id.eq(session_id))
                    .order(session_questions::created_at.asc())
                    .select(SessionQuestion::as_select())
                    .load(conn)?,
                feedback: session_feedback::table
                    .filter(session_feedback::session_id.eq(session_id))
                    .order(session_feedback::created_at.asc())
                    .select(SessionFeedback::as_select())
                    .load(conn)?,
            })
        })
        .await
    }

    async fn insert_question(&self, question: SessionQuestion) -> Result<SessionQuestion, StoreError> {
        with_conn(&self.pool, move |conn| {
            diesel::insert_into(session_questions::table)
                .values(&question)
                .returning(SessionQuestion::as_returning())
                .get_result(conn)
                .map_err(|e| child_insert_error(e, question.session_id))
        })
        .await
    }

    async fn get_question(&self, id: Uuid) -> Result<Option<SessionQuestion>, StoreError> {
        with_conn(&self.pool, move |conn| {
            Ok(session_questions::table
                .find(id)
                .select(SessionQuestion::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn answer_question(
        &self,
        id: Uuid,
        answer: String,
        operator_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<SessionQuestion>, StoreError> {
        with_conn(&self.pool, move |conn| {
            Ok(diesel::update(
                session_questions::table
                    .filter(session_questions::id.eq(id))
                    .filter(session_questions::answer.is_null()),
            )
            .set((
                session_questions::answer.eq(Some(answer)),
                session_questions::answered_by.eq(Some(operator_id)),
                session_questions::answered_at.eq(Some(at)),
            ))
            .returning(SessionQuestion::as_returning())
            .get_result(conn)
            .optional()?)
        })
        .await
    }

    async fn insert_file(&self, file: SessionFile) -> Result<SessionFile, StoreError> {
        with_conn(&self.pool, move |conn| {
            diesel::insert_into(session_files::table)
                .values(&file)
                .returning(SessionFile::as_returning())
                .get_result(conn)
                .map_err(|e| child_insert_error(e, file.session_id))
        })
        .await
    }

    async fn insert_instruction(&self, instruction: SessionInstruction) -> Result<SessionInstruction, StoreError> {
        with_conn(&self.pool, move |conn| {
            diesel::insert_into(session_instructions::table)
                .values(&instruction)
                .returning(SessionInstruction::as_returning())
                .get_result(conn)
                .map_err(|e| child_insert_error(e, instruction.session_id))
        })
        .await
    }

    async fn insert_feedback(&self, feedback: SessionFeedback) -> Result<SessionFeedback, StoreError> {
        with_conn(&self.pool, move |conn| {
            diesel::insert_into(session_feedback::table)
                .values(&feedback)
                .returning(SessionFeedback::as_returning())
                .get_result(conn)
                .map_err(|e| child_insert_error(e, feedback.session_id))
        })
        .await
    }
}

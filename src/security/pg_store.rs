//! Postgres implementations of the grant, directory and audit stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::core::shared::schema::{audit_log, operators, patient_access, patients};
use crate::core::shared::store::StoreError;
use crate::core::shared::utils::{with_conn, DbPool};
use crate::security::access::{AccessGrant, AccessGrantStore};
use crate::security::audit::{AuditAction, AuditEntry, AuditQuery, AuditStore};
use crate::security::identity::{ActorDirectory, OperatorRole};

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = patient_access, primary_key(patient_id, operator_id))]
struct GrantRow {
    patient_id: Uuid,
    operator_id: Uuid,
    can_view: bool,
    can_edit: bool,
    granted_by: Uuid,
    updated_at: DateTime<Utc>,
}

impl From<GrantRow> for AccessGrant {
    fn from(row: GrantRow) -> Self {
        AccessGrant {
            patient_id: row.patient_id,
            operator_id: row.operator_id,
            can_view: row.can_view,
            can_edit: row.can_edit,
            granted_by: row.granted_by,
            updated_at: row.updated_at,
        }
    }
}

impl From<&AccessGrant> for GrantRow {
    fn from(grant: &AccessGrant) -> Self {
        GrantRow {
            patient_id: grant.patient_id,
            operator_id: grant.operator_id,
            can_view: grant.can_view || grant.can_edit,
            can_edit: grant.can_edit,
            granted_by: grant.granted_by,
            updated_at: grant.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgAccessGrantStore {
    pool: DbPool,
}

impl PgAccessGrantStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccessGrantStore for PgAccessGrantStore {
    async fn get(&self, patient_id: Uuid, operator_id: Uuid) -> Result<Option<AccessGrant>, StoreError> {
        with_conn(&self.pool, move |conn| {
            let row = patient_access::table
                .find((patient_id, operator_id))
                .select(GrantRow::as_select())
                .first::<GrantRow>(conn)
                .optional()?;
            Ok(row.map(AccessGrant::from))
        })
        .await
    }

    async fn upsert(&self, grant: AccessGrant) -> Result<AccessGrant, StoreError> {
        with_conn(&self.pool, move |conn| {
            let row = GrantRow::from(&grant);
            let saved = diesel::insert_into(patient_access::table)
                .values(&row)
                .on_conflict((patient_access::patient_id, patient_access::operator_id))
                .do_update()
                .set(&row)
                .returning(GrantRow::as_returning())
                .get_result::<GrantRow>(conn)?;
            Ok(AccessGrant::from(saved))
        })
        .await
    }

    async fn remove(&self, patient_id: Uuid, operator_id: Uuid) -> Result<bool, StoreError> {
        with_conn(&self.pool, move |conn| {
            let removed = diesel::delete(patient_access::table.find((patient_id, operator_id))).execute(conn)?;
            Ok(removed > 0)
        })
        .await
    }

    async fn list_for_patient(&self, patient_id: Uuid) -> Result<Vec<AccessGrant>, StoreError> {
        with_conn(&self.pool, move |conn| {
            let rows = patient_access::table
                .filter(patient_access::patient_id.eq(patient_id))
                .order(patient_access::operator_id.asc())
                .select(GrantRow::as_select())
                .load::<GrantRow>(conn)?;
            Ok(rows.into_iter().map(AccessGrant::from).collect())
        })
        .await
    }
}

#[derive(Debug, Clone)]
pub struct PgActorDirectory {
    pool: DbPool,
}

impl PgActorDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActorDirectory for PgActorDirectory {
    async fn patient_exists(&self, patient_id: Uuid) -> Result<bool, StoreError> {
        with_conn(&self.pool, move |conn| {
            Ok(diesel::select(diesel::dsl::exists(patients::table.find(patient_id))).get_result::<bool>(conn)?)
        })
        .await
    }

    async fn operator_role(&self, operator_id: Uuid) -> Result<Option<OperatorRole>, StoreError> {
        with_conn(&self.pool, move |conn| {
            let role: Option<String> = operators::table
                .find(operator_id)
                .select(operators::role)
                .first(conn)
                .optional()?;
            role.map(|r| OperatorRole::parse(&r).map_err(|e| StoreError::Backend(e.to_string())))
                .transpose()
        })
        .await
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = audit_log)]
struct AuditRow {
    id: Uuid,
    actor_id: Uuid,
    actor_type: String,
    action: String,
    resource_type: String,
    resource_id: String,
    details: serde_json::Value,
    timestamp: DateTime<Utc>,
    previous_hash: Option<String>,
    hash: String,
}

impl From<&AuditEntry> for AuditRow {
    fn from(entry: &AuditEntry) -> Self {
        AuditRow {
            id: entry.id,
            actor_id: entry.actor_id,
            actor_type: entry.actor_type.clone(),
            action: entry.action.as_str().to_string(),
            resource_type: entry.resource_type.clone(),
            resource_id: entry.resource_id.clone(),
            details: entry.details.clone(),
            timestamp: entry.timestamp,
            previous_hash: entry.previous_hash.clone(),
            hash: entry.hash.clone(),
        }
    }
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = StoreError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let action = AuditAction::parse(&row.action)
            .ok_or_else(|| StoreError::Backend(format!("unknown audit action {:?}", row.action)))?;
        Ok(AuditEntry {
            id: row.id,
            actor_id: row.actor_id,
            actor_type: row.actor_type,
            action,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            details: row.details,
            timestamp: row.timestamp,
            previous_hash: row.previous_hash,
            hash: row.hash,
        })
    }
}

/// Insert-only audit table; `seq` preserves append order for chain checks.
#[derive(Debug, Clone)]
pub struct PgAuditStore {
    pool: DbPool,
}

impl PgAuditStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError> {
        with_conn(&self.pool, move |conn| {
            diesel::insert_into(audit_log::table)
                .values(&AuditRow::from(&entry))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn query(&self, query: AuditQuery) -> Result<Vec<AuditEntry>, StoreError> {
        with_conn(&self.pool, move |conn| {
            let mut statement = audit_log::table.select(AuditRow::as_select()).into_boxed();
            if let Some(actor_id) = query.actor_id {
                statement = statement.filter(audit_log::actor_id.eq(actor_id));
            }
            if let Some(resource_type) = query.resource_type {
                statement = statement.filter(audit_log::resource_type.eq(resource_type));
            }
            if let Some(resource_id) = query.resource_id {
                statement = statement.filter(audit_log::resource_id.eq(resource_id));
            }
            if let Some(actions) = query.actions {
                let names: Vec<String> = actions.iter().map(|a| a.as_str().to_string()).collect();
                statement = statement.filter(audit_log::action.eq_any(names));
            }
            let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
            statement
                .order(audit_log::seq.desc())
                .limit(limit)
                .load::<AuditRow>(conn)?
                .into_iter()
                .map(AuditEntry::try_from)
                .collect()
        })
        .await
    }

    async fn last_hash(&self) -> Result<Option<String>, StoreError> {
        with_conn(&self.pool, move |conn| {
            Ok(audit_log::table
                .order(audit_log::seq.desc())
                .select(audit_log::hash)
                .first::<String>(conn)
                .optional()?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::identity::Actor;

    #[test]
    fn test_grant_row_enforces_edit_implies_view() {
        let mut grant = AccessGrant::full(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        grant.can_view = false;
        let row = GrantRow::from(&grant);
        assert!(row.can_view && row.can_edit);
    }

    #[test]
    fn test_audit_row_keeps_hash_valid() {
        let actor = Actor::patient(Uuid::new_v4());
        let entry = AuditEntry::new(&actor, AuditAction::CompleteRequested, "session", Uuid::new_v4())
            .with_details(serde_json::json!({ "note": "x" }))
            .with_previous_hash("abc".into());

        let restored = AuditEntry::try_from(AuditRow::from(&entry)).expect("entry");
        assert_eq!(restored, entry);
        assert!(restored.verify_hash());
    }
}

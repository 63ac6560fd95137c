//! Administrator-only management of patient access grants.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::core::error::ServiceError;
use crate::core::hooks::{HookRunner, PostCommit};
use crate::core::shared::store::{with_timeout, StoreError};
use crate::notifications::{Notification, NotificationType};
use crate::security::access::{AccessGrant, AccessGrantStore};
use crate::security::audit::{AuditAction, AuditEntry};
use crate::security::identity::{Actor, ActorDirectory, OperatorRole};

pub struct GrantManager {
    grants: Arc<dyn AccessGrantStore>,
    directory: Arc<dyn ActorDirectory>,
    hooks: Arc<HookRunner>,
    timeout: Duration,
}

impl GrantManager {
    pub fn new(
        grants: Arc<dyn AccessGrantStore>,
        directory: Arc<dyn ActorDirectory>,
        hooks: Arc<HookRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            grants,
            directory,
            hooks,
            timeout,
        }
    }

    async fn store<T, F>(&self, fut: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        Ok(with_timeout(self.timeout, fut).await?)
    }

    fn require_admin(actor: &Actor, action: &str) -> Result<(), ServiceError> {
        if actor.is_admin() {
            Ok(())
        } else {
            Err(ServiceError::Unauthorized(format!("only administrators can {action}")))
        }
    }

    async fn require_patient(&self, patient_id: Uuid) -> Result<(), ServiceError> {
        if self.store(self.directory.patient_exists(patient_id)).await? {
            Ok(())
        } else {
            Err(ServiceError::NotFound(format!("patient {patient_id}")))
        }
    }

    /// Creates or replaces the (patient, operator) grant. Edit implies view.
    pub async fn grant_access(
        &self,
        actor: &Actor,
        patient_id: Uuid,
        operator_id: Uuid,
        can_view: bool,
        can_edit: bool,
    ) -> Result<AccessGrant, ServiceError> {
        Self::require_admin(actor, "grant patient access")?;
        self.require_patient(patient_id).await?;
        match self.store(self.directory.operator_role(operator_id)).await? {
            None => return Err(ServiceError::NotFound(format!("operator {operator_id}"))),
            Some(OperatorRole::Admin) => {
                return Err(ServiceError::Validation(
                    "administrators already see every patient and cannot hold grants".into(),
                ))
            }
            Some(_) => {}
        }
        if !can_view && !can_edit {
            return Err(ServiceError::Validation(
                "a grant needs view or edit; revoke the grant to remove access".into(),
            ));
        }

        let grant = AccessGrant::new(patient_id, operator_id, can_view, can_edit, actor.id);
        let saved = self.store(self.grants.upsert(grant)).await?;
        info!(
            "Access for operator {} on patient {} set to view={} edit={} by {}",
            operator_id, patient_id, saved.can_view, saved.can_edit, actor.id
        );

        let hooks = PostCommit::new()
            .audit(
                AuditEntry::new(actor, AuditAction::AccessGranted, "patient_access", patient_id).with_details(
                    serde_json::json!({
                        "operator_id": operator_id,
                        "can_view": saved.can_view,
                        "can_edit": saved.can_edit,
                    }),
                ),
            )
            .notify(access_notice(operator_id, patient_id, "Your access to a patient was updated"));
        self.hooks.run(hooks).await;

        Ok(saved)
    }

    pub async fn revoke_access(&self, actor: &Actor, patient_id: Uuid, operator_id: Uuid) -> Result<(), ServiceError> {
        Self::require_admin(actor, "revoke patient access")?;

        if !self.store(self.grants.remove(patient_id, operator_id)).await? {
            return Err(ServiceError::NotFound(format!(
                "grant for operator {operator_id} on patient {patient_id}"
            )));
        }
        info!(
            "Access for operator {} on patient {} revoked by {}",
            operator_id, patient_id, actor.id
        );

        let hooks = PostCommit::new()
            .audit(
                AuditEntry::new(actor, AuditAction::AccessRevoked, "patient_access", patient_id)
                    .with_details(serde_json::json!({ "operator_id": operator_id })),
            )
            .notify(access_notice(operator_id, patient_id, "Your access to a patient was revoked"));
        self.hooks.run(hooks).await;

        Ok(())
    }

    /// Administrators see every patient's grants; a patient sees their own.
    pub async fn list_grants(&self, actor: &Actor, patient_id: Uuid) -> Result<Vec<AccessGrant>, ServiceError> {
        let allowed = actor.is_admin() || (actor.is_patient() && actor.id == patient_id);
        if !allowed {
            return Err(ServiceError::Unauthorized("cannot list grants for this patient".into()));
        }
        self.require_patient(patient_id).await?;
        self.store(self.grants.list_for_patient(patient_id)).await
    }
}

impl std::fmt::Debug for GrantManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrantManager")
            .field("grants", &"Arc<dyn AccessGrantStore>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn access_notice(operator_id: Uuid, patient_id: Uuid, body: &str) -> Notification {
    Notification::new(operator_id, NotificationType::AccessChanged, "Patient access changed", body)
        .with_payload(serde_json::json!({ "patient_id": patient_id }))
}

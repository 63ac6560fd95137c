//! Patient-access authorization.
//!
//! [`can_access`] is the pure policy; [`AuthorizationGuard`] feeds it a grant
//! read fresh from the store on every call and applies the per-operation
//! table in [`Operation::policy`], including the rule that administrators
//! never act on clinical records.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::core::error::ServiceError;
use crate::core::shared::store::{with_timeout, StoreError};
use crate::security::access::{AccessGrant, AccessGrantStore};
use crate::security::identity::{Actor, ActorKind, OperatorRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    View,
    Edit,
}

/// Decides whether `actor` holds `required` on `patient_id`.
///
/// `grant` is the stored (patient, operator) record, if any. A grant for a
/// different pair is ignored.
pub fn can_access(actor: &Actor, patient_id: Uuid, required: Capability, grant: Option<&AccessGrant>) -> bool {
    match actor.kind {
        ActorKind::Patient => actor.id == patient_id,
        ActorKind::Operator(OperatorRole::Admin) => true,
        ActorKind::Operator(_) => {
            let Some(grant) = grant.filter(|g| g.patient_id == patient_id && g.operator_id == actor.id) else {
                return false;
            };
            match required {
                Capability::View => grant.can_view || grant.can_edit,
                Capability::Edit => grant.can_edit,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ViewSession,
    CreateSession,
    UpdateSession,
    DeleteSession,
    RequestComplete,
    AcceptComplete,
    RequestDelete,
    AcceptDelete,
    ReassignOperator,
    AddQuestion,
    AnswerQuestion,
    AddInstruction,
    AddFeedback,
    AttachFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationPolicy {
    pub capability: Capability,
    /// Clinical operations are closed to administrators regardless of grants.
    pub clinical: bool,
    pub patient_allowed: bool,
    pub operator_allowed: bool,
}

impl Operation {
    pub fn policy(self) -> OperationPolicy {
        use Capability::{Edit, View};

        let (capability, clinical, patient_allowed, operator_allowed) = match self {
            Self::ViewSession => (View, false, true, true),
            Self::CreateSession => (Edit, true, false, true),
            Self::UpdateSession => (Edit, true, false, true),
            Self::DeleteSession => (Edit, true, false, true),
            Self::RequestComplete => (View, true, true, true),
            Self::AcceptComplete => (View, true, true, true),
            Self::RequestDelete => (View, true, true, true),
            Self::AcceptDelete => (View, true, true, true),
            Self::ReassignOperator => (Edit, false, false, true),
            Self::AddQuestion => (View, true, true, false),
            Self::AnswerQuestion => (Edit, true, false, true),
            Self::AddInstruction => (Edit, true, false, true),
            Self::AddFeedback => (View, true, true, false),
            Self::AttachFile => (View, true, true, true),
        };

        OperationPolicy {
            capability,
            clinical,
            patient_allowed,
            operator_allowed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ViewSession => "view_session",
            Self::CreateSession => "create_session",
            Self::UpdateSession => "update_session",
            Self::DeleteSession => "delete_session",
            Self::RequestComplete => "request_complete",
            Self::AcceptComplete => "accept_complete",
            Self::RequestDelete => "request_delete",
            Self::AcceptDelete => "accept_delete",
            Self::ReassignOperator => "reassign_operator",
            Self::AddQuestion => "add_question",
            Self::AnswerQuestion => "answer_question",
            Self::AddInstruction => "add_instruction",
            Self::AddFeedback => "add_feedback",
            Self::AttachFile => "attach_file",
        }
    }
}

pub struct AuthorizationGuard {
    grants: Arc<dyn AccessGrantStore>,
    timeout: Duration,
}

impl AuthorizationGuard {
    pub fn new(grants: Arc<dyn AccessGrantStore>, timeout: Duration) -> Self {
        Self { grants, timeout }
    }

    /// Capability check with a fresh grant read. Patients and administrators
    /// never touch the grant table.
    pub async fn check(&self, actor: &Actor, patient_id: Uuid, required: Capability) -> Result<bool, StoreError> {
        let grant = match actor.kind {
            ActorKind::Operator(OperatorRole::Support) | ActorKind::Operator(OperatorRole::Basic) => {
                with_timeout(self.timeout, self.grants.get(patient_id, actor.id)).await?
            }
            _ => None,
        };
        Ok(can_access(actor, patient_id, required, grant.as_ref()))
    }

    /// Whether `operator_id` may own clinical records of `patient_id`.
    pub async fn operator_can_edit(&self, operator_id: Uuid, patient_id: Uuid) -> Result<bool, StoreError> {
        let grant = with_timeout(self.timeout, self.grants.get(patient_id, operator_id)).await?;
        Ok(grant.map(|g| g.can_edit).unwrap_or(false))
    }

    pub async fn authorize(&self, actor: &Actor, patient_id: Uuid, operation: Operation) -> Result<(), ServiceError> {
        let policy = operation.policy();

        if actor.is_patient() && !policy.patient_allowed {
            return Err(ServiceError::Unauthorized(format!(
                "patients cannot {}",
                operation.as_str()
            )));
        }
        if !actor.is_patient() && !policy.operator_allowed {
            return Err(ServiceError::Unauthorized(format!(
                "operators cannot {}",
                operation.as_str()
            )));
        }
        if actor.is_admin() && policy.clinical {
            return Err(ServiceError::Unauthorized(format!(
                "administrators cannot {} on clinical records",
                operation.as_str()
            )));
        }

        if self.check(actor, patient_id, policy.capability).await? {
            Ok(())
        } else {
            debug!(
                "Denied {} for actor {} on patient {}",
                operation.as_str(),
                actor.id,
                patient_id
            );
            Err(ServiceError::Unauthorized(format!(
                "missing {:?} access for {}",
                policy.capability,
                operation.as_str()
            )))
        }
    }
}

impl std::fmt::Debug for AuthorizationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationGuard")
            .field("grants", &"Arc<dyn AccessGrantStore>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::shared::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatorRole {
    Admin,
    Support,
    Basic,
}

impl OperatorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "ADMIN",
            Self::Support => "SUPPORT",
            Self::Basic => "BASIC",
        }
    }

    pub fn parse(value: &str) -> Result<Self, IdentityError> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ADMIN" => Ok(Self::Admin),
            "SUPPORT" => Ok(Self::Support),
            "BASIC" => Ok(Self::Basic),
            other => Err(IdentityError::UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "user_type", content = "role", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorKind {
    Patient,
    Operator(OperatorRole),
}

/// Authenticated caller as supplied by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: Uuid,
    pub kind: ActorKind,
}

impl Actor {
    pub fn patient(id: Uuid) -> Self {
        Self {
            id,
            kind: ActorKind::Patient,
        }
    }

    pub fn operator(id: Uuid, role: OperatorRole) -> Self {
        Self {
            id,
            kind: ActorKind::Operator(role),
        }
    }

    /// Builds an actor from the loosely typed fields the identity layer hands over.
    pub fn from_parts(id: Uuid, user_type: &str, role: Option<&str>) -> Result<Self, IdentityError> {
        match user_type.trim().to_ascii_uppercase().as_str() {
            "PATIENT" => Ok(Self::patient(id)),
            "OPERATOR" => {
                let role = role.ok_or(IdentityError::MissingRole)?;
                Ok(Self::operator(id, OperatorRole::parse(role)?))
            }
            other => Err(IdentityError::UnknownUserType(other.to_string())),
        }
    }

    pub fn is_patient(&self) -> bool {
        matches!(self.kind, ActorKind::Patient)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.kind, ActorKind::Operator(OperatorRole::Admin))
    }

    pub fn role(&self) -> Option<OperatorRole> {
        match self.kind {
            ActorKind::Operator(role) => Some(role),
            ActorKind::Patient => None,
        }
    }

    pub fn type_str(&self) -> &'static str {
        match self.kind {
            ActorKind::Patient => "PATIENT",
            ActorKind::Operator(_) => "OPERATOR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("unknown user type: {0}")]
    UnknownUserType(String),
    #[error("unknown operator role: {0}")]
    UnknownRole(String),
    #[error("operator identity is missing a role")]
    MissingRole,
}

/// Lookup of known patients and operators.
#[async_trait]
pub trait ActorDirectory: Send + Sync {
    async fn patient_exists(&self, patient_id: Uuid) -> Result<bool, StoreError>;
    async fn operator_role(&self, operator_id: Uuid) -> Result<Option<OperatorRole>, StoreError>;
}

/// Patients and operators known to a deployment without a database.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Roster {
    #[serde(default)]
    pub patients: Vec<RosterPatient>,
    #[serde(default)]
    pub operators: Vec<RosterOperator>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RosterPatient {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RosterOperator {
    pub id: Uuid,
    pub role: OperatorRole,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryActorDirectory {
    patients: Arc<RwLock<HashMap<Uuid, String>>>,
    operators: Arc<RwLock<HashMap<Uuid, OperatorRole>>>,
}

impl InMemoryActorDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_patient(&self, id: Uuid, name: &str) {
        self.patients.write().await.insert(id, name.to_string());
    }

    pub async fn add_operator(&self, id: Uuid, role: OperatorRole) {
        self.operators.write().await.insert(id, role);
    }

    pub fn from_roster(roster: Roster) -> Self {
        Self {
            patients: Arc::new(RwLock::new(roster.patients.into_iter().map(|p| (p.id, p.name)).collect())),
            operators: Arc::new(RwLock::new(roster.operators.into_iter().map(|o| (o.id, o.role)).collect())),
        }
    }
}

#[async_trait]
impl ActorDirectory for InMemoryActorDirectory {
    async fn patient_exists(&self, patient_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.patients.read().await.contains_key(&patient_id))
    }

    async fn operator_role(&self, operator_id: Uuid) -> Result<Option<OperatorRole>, StoreError> {
        Ok(self.operators.read().await.get(&operator_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_from_parts() {
        let id = Uuid::new_v4();
        let patient = Actor::from_parts(id, "patient", None).expect("patient");
        assert!(patient.is_patient());

        let admin = Actor::from_parts(id, "OPERATOR", Some("admin")).expect("admin");
        assert!(admin.is_admin());
        assert_eq!(admin.role(), Some(OperatorRole::Admin));

        let support = Actor::from_parts(id, "operator", Some("Support")).expect("support");
        assert_eq!(support.role(), Some(OperatorRole::Support));
        assert!(!support.is_admin());
    }

    #[test]
    fn test_actor_from_parts_rejects_malformed_input() {
        let id = Uuid::new_v4();
        assert_eq!(
            Actor::from_parts(id, "robot", None),
            Err(IdentityError::UnknownUserType("ROBOT".into()))
        );
        assert_eq!(
            Actor::from_parts(id, "operator", None),
            Err(IdentityError::MissingRole)
        );
        assert!(matches!(
            Actor::from_parts(id, "operator", Some("owner")),
            Err(IdentityError::UnknownRole(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_directory() {
        let directory = InMemoryActorDirectory::new();
        let patient = Uuid::new_v4();
        let operator = Uuid::new_v4();
        directory.add_patient(patient, "Ana").await;
        directory.add_operator(operator, OperatorRole::Basic).await;

        assert!(directory.patient_exists(patient).await.expect("lookup"));
        assert!(!directory.patient_exists(operator).await.expect("lookup"));
        assert_eq!(
            directory.operator_role(operator).await.expect("lookup"),
            Some(OperatorRole::Basic)
        );
        assert_eq!(directory.operator_role(patient).await.expect("lookup"), None);
    }

    #[tokio::test]
    async fn test_directory_from_roster() {
        let patient = Uuid::new_v4();
        let operator = Uuid::new_v4();
        let roster: Roster = serde_json::from_value(serde_json::json!({
            "patients": [{ "id": patient, "name": "Ana" }],
            "operators": [{ "id": operator, "role": "SUPPORT" }],
        }))
        .expect("roster");
        let directory = InMemoryActorDirectory::from_roster(roster);

        assert!(directory.patient_exists(patient).await.expect("lookup"));
        assert_eq!(
            directory.operator_role(operator).await.expect("lookup"),
            Some(OperatorRole::Support)
        );

        let bad = serde_json::from_value::<Roster>(serde_json::json!({
            "operators": [{ "id": operator, "role": "OWNER" }],
        }));
        assert!(bad.is_err());
    }
}

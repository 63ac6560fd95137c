use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::shared::store::StoreError;

/// Per-patient, per-operator capability record (`PatientAccess`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub patient_id: Uuid,
    pub operator_id: Uuid,
    pub can_view: bool,
    pub can_edit: bool,
    pub granted_by: Uuid,
    pub updated_at: DateTime<Utc>,
}

impl AccessGrant {
    /// Edit always implies view.
    pub fn new(patient_id: Uuid, operator_id: Uuid, can_view: bool, can_edit: bool, granted_by: Uuid) -> Self {
        Self {
            patient_id,
            operator_id,
            can_view: can_view || can_edit,
            can_edit,
            granted_by,
            updated_at: Utc::now(),
        }
    }

    pub fn view_only(patient_id: Uuid, operator_id: Uuid, granted_by: Uuid) -> Self {
        Self::new(patient_id, operator_id, true, false, granted_by)
    }

    pub fn full(patient_id: Uuid, operator_id: Uuid, granted_by: Uuid) -> Self {
        Self::new(patient_id, operator_id, true, true, granted_by)
    }
}

/// Storage of access grants keyed by (patient, operator).
#[async_trait]
pub trait AccessGrantStore: Send + Sync {
    async fn get(&self, patient_id: Uuid, operator_id: Uuid) -> Result<Option<AccessGrant>, StoreError>;
    async fn upsert(&self, grant: AccessGrant) -> Result<AccessGrant, StoreError>;
    async fn remove(&self, patient_id: Uuid, operator_id: Uuid) -> Result<bool, StoreError>;
    async fn list_for_patient(&self, patient_id: Uuid) -> Result<Vec<AccessGrant>, StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryAccessGrantStore {
    grants: Arc<RwLock<HashMap<(Uuid, Uuid), AccessGrant>>>,
}

impl InMemoryAccessGrantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccessGrantStore for InMemoryAccessGrantStore {
    async fn get(&self, patient_id: Uuid, operator_id: Uuid) -> Result<Option<AccessGrant>, StoreError> {
        Ok(self.grants.read().await.get(&(patient_id, operator_id)).cloned())
    }

    async fn upsert(&self, grant: AccessGrant) -> Result<AccessGrant, StoreError> {
        let mut grants = self.grants.write().await;
        grants.insert((grant.patient_id, grant.operator_id), grant.clone());
        Ok(grant)
    }

    async fn remove(&self, patient_id: Uuid, operator_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.grants.write().await.remove(&(patient_id, operator_id)).is_some())
    }

    async fn list_for_patient(&self, patient_id: Uuid) -> Result<Vec<AccessGrant>, StoreError> {
        let grants = self.grants.read().await;
        let mut found: Vec<AccessGrant> = grants
            .values()
            .filter(|g| g.patient_id == patient_id)
            .cloned()
            .collect();
        found.sort_by_key(|g| g.operator_id);
        Ok(found)
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::shared::store::{with_timeout, StoreError};
use crate::security::identity::Actor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    SessionCreate,
    SessionUpdate,
    SessionDelete,
    SessionReassign,
    CompleteRequested,
    CompleteAccepted,
    DeleteRequested,
    DeleteAccepted,
    QuestionCreate,
    QuestionAnswer,
    InstructionCreate,
    FeedbackCreate,
    FileAttach,
    AccessGranted,
    AccessRevoked,
    DeviceRegistered,
    DeviceUnregistered,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionCreate => "SESSION_CREATE",
            Self::SessionUpdate => "SESSION_UPDATE",
            Self::SessionDelete => "SESSION_DELETE",
            Self::SessionReassign => "SESSION_REASSIGN",
            Self::CompleteRequested => "COMPLETE_REQUESTED",
            Self::CompleteAccepted => "COMPLETE_ACCEPTED",
            Self::DeleteRequested => "DELETE_REQUESTED",
            Self::DeleteAccepted => "DELETE_ACCEPTED",
            Self::QuestionCreate => "QUESTION_CREATE",
            Self::QuestionAnswer => "QUESTION_ANSWER",
            Self::InstructionCreate => "INSTRUCTION_CREATE",
            Self::FeedbackCreate => "FEEDBACK_CREATE",
            Self::FileAttach => "FILE_ATTACH",
            Self::AccessGranted => "ACCESS_GRANTED",
            Self::AccessRevoked => "ACCESS_REVOKED",
            Self::DeviceRegistered => "DEVICE_REGISTERED",
            Self::DeviceUnregistered => "DEVICE_UNREGISTERED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let action = match value {
            "SESSION_CREATE" => Self::SessionCreate,
            "SESSION_UPDATE" => Self::SessionUpdate,
            "SESSION_DELETE" => Self::SessionDelete,
            "SESSION_REASSIGN" => Self::SessionReassign,
            "COMPLETE_REQUESTED" => Self::CompleteRequested,
            "COMPLETE_ACCEPTED" => Self::CompleteAccepted,
            "DELETE_REQUESTED" => Self::DeleteRequested,
            "DELETE_ACCEPTED" => Self::DeleteAccepted,
            "QUESTION_CREATE" => Self::QuestionCreate,
            "QUESTION_ANSWER" => Self::QuestionAnswer,
            "INSTRUCTION_CREATE" => Self::InstructionCreate,
            "FEEDBACK_CREATE" => Self::FeedbackCreate,
            "FILE_ATTACH" => Self::FileAttach,
            "ACCESS_GRANTED" => Self::AccessGranted,
            "ACCESS_REVOKED" => Self::AccessRevoked,
            "DEVICE_REGISTERED" => Self::DeviceRegistered,
            "DEVICE_UNREGISTERED" => Self::DeviceUnregistered,
            _ => return None,
        };
        Some(action)
    }
}

/// Immutable record of one state-changing action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor_id: Uuid,
    pub actor_type: String,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub hash: String,
}

impl AuditEntry {
    pub fn new(actor: &Actor, action: AuditAction, resource_type: &str, resource_id: impl ToString) -> Self {
        let mut entry = Self {
            id: Uuid::new_v4(),
            actor_id: actor.id,
            actor_type: actor.type_str().to_string(),
            action,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            details: serde_json::Value::Null,
            timestamp: Utc::now(),
            previous_hash: None,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();
        entry
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self.hash = self.compute_hash();
        self
    }

    pub fn with_previous_hash(mut self, hash: String) -> Self {
        self.previous_hash = Some(hash);
        self.hash = self.compute_hash();
        self
    }

    fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();

        hasher.update(self.id.as_bytes());
        hasher.update(self.actor_id.as_bytes());
        hasher.update(self.actor_type.as_bytes());
        hasher.update(self.action.as_str().as_bytes());
        hasher.update(self.resource_type.as_bytes());
        hasher.update(self.resource_id.as_bytes());
        hasher.update(self.details.to_string().as_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());

        if let Some(ref prev) = self.previous_hash {
            hasher.update(prev.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }
}

/// Checks both per-entry hashes and the links between consecutive entries.
pub fn verify_chain(entries: &[AuditEntry]) -> bool {
    for (i, entry) in entries.iter().enumerate() {
        if !entry.verify_hash() {
            return false;
        }
        if i > 0 && entry.previous_hash.as_ref() != Some(&entries[i - 1].hash) {
            return false;
        }
    }
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    pub actor_id: Option<Uuid>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub actions: Option<Vec<AuditAction>>,
    pub limit: usize,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    pub fn with_actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn with_resource(mut self, resource_type: &str, resource_id: &str) -> Self {
        self.resource_type = Some(resource_type.to_string());
        self.resource_id = Some(resource_id.to_string());
        self
    }

    pub fn with_actions(mut self, actions: Vec<AuditAction>) -> Self {
        self.actions = Some(actions);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(actor_id) = self.actor_id {
            if entry.actor_id != actor_id {
                return false;
            }
        }
        if let Some(ref resource_type) = self.resource_type {
            if &entry.resource_type != resource_type {
                return false;
            }
        }
        if let Some(ref resource_id) = self.resource_id {
            if &entry.resource_id != resource_id {
                return false;
            }
        }
        if let Some(ref actions) = self.actions {
            if !actions.contains(&entry.action) {
                return false;
            }
        }
        true
    }
}

/// Append-only persistence for audit entries.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError>;
    async fn query(&self, query: AuditQuery) -> Result<Vec<AuditEntry>, StoreError>;
    async fn last_hash(&self) -> Result<Option<String>, StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryAuditStore {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn query(&self, query: AuditQuery) -> Result<Vec<AuditEntry>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn last_hash(&self) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().await.last().map(|e| e.hash.clone()))
    }
}

/// Write-only facade over an [`AuditStore`].
///
/// `record` never fails from the caller's point of view: a store outage is
/// logged and the entry dropped, so clinical record-keeping is never blocked
/// by auditing.
pub struct AuditTrail {
    store: Arc<dyn AuditStore>,
    last_hash: Mutex<Option<String>>,
    timeout: std::time::Duration,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn AuditStore>, timeout: std::time::Duration) -> Self {
        Self {
            store,
            last_hash: Mutex::new(None),
            timeout,
        }
    }

    pub async fn record(&self, entry: AuditEntry) {
        // Held across the append so chain links follow append order.
        let mut last_hash = self.last_hash.lock().await;

        if last_hash.is_none() {
            match with_timeout(self.timeout, self.store.last_hash()).await {
                Ok(hash) => *last_hash = hash,
                Err(e) => debug!("Could not load audit chain head: {}", e),
            }
        }

        let entry = match last_hash.as_ref() {
            Some(prev) => entry.with_previous_hash(prev.clone()),
            None => entry,
        };
        let hash = entry.hash.clone();
        let action = entry.action;
        let resource_id = entry.resource_id.clone();

        match with_timeout(self.timeout, self.store.append(entry)).await {
            Ok(()) => *last_hash = Some(hash),
            Err(e) => warn!(
                "Audit write failed for {} on {}: {}",
                action.as_str(),
                resource_id,
                e
            ),
        }
    }

    pub async fn query(&self, query: AuditQuery) -> Result<Vec<AuditEntry>, StoreError> {
        with_timeout(self.timeout, self.store.query(query)).await
    }
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail")
            .field("store", &"Arc<dyn AuditStore>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::identity::OperatorRole;
    use std::time::Duration;

    struct FailingAuditStore;

    #[async_trait]
    impl AuditStore for FailingAuditStore {
        async fn append(&self, _entry: AuditEntry) -> Result<(), StoreError> {
            Err(StoreError::Backend("audit db down".into()))
        }

        async fn query(&self, _query: AuditQuery) -> Result<Vec<AuditEntry>, StoreError> {
            Err(StoreError::Backend("audit db down".into()))
        }

        async fn last_hash(&self) -> Result<Option<String>, StoreError> {
            Err(StoreError::Backend("audit db down".into()))
        }
    }

    fn operator() -> Actor {
        Actor::operator(Uuid::new_v4(), OperatorRole::Support)
    }

    #[test]
    fn test_audit_entry_hash_verification() {
        let entry = AuditEntry::new(&operator(), AuditAction::SessionCreate, "session", Uuid::new_v4())
            .with_details(serde_json::json!({ "count": 3 }));
        assert!(entry.verify_hash());

        let mut tampered = entry.clone();
        tampered.details = serde_json::json!({ "count": 4 });
        assert!(!tampered.verify_hash());
    }

    #[test]
    fn test_action_round_trips_through_str() {
        for action in [
            AuditAction::SessionCreate,
            AuditAction::CompleteAccepted,
            AuditAction::DeleteAccepted,
            AuditAction::AccessRevoked,
        ] {
            assert_eq!(AuditAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(AuditAction::parse("NOPE"), None);
    }

    #[tokio::test]
    async fn test_trail_chains_entries() {
        let store = Arc::new(InMemoryAuditStore::new());
        let trail = AuditTrail::new(store.clone(), Duration::from_secs(1));
        let actor = operator();

        for action in [
            AuditAction::SessionCreate,
            AuditAction::CompleteRequested,
            AuditAction::CompleteAccepted,
        ] {
            trail
                .record(AuditEntry::new(&actor, action, "session", "s-1"))
                .await;
        }

        let entries = store.all().await;
        assert_eq!(entries.len(), 3);
        assert!(entries[0].previous_hash.is_none());
        assert!(verify_chain(&entries));

        let mut broken = entries.clone();
        broken.swap(1, 2);
        assert!(!verify_chain(&broken));
    }

    #[tokio::test]
    async fn test_trail_swallows_store_failures() {
        let trail = AuditTrail::new(Arc::new(FailingAuditStore), Duration::from_secs(1));
        trail
            .record(AuditEntry::new(&operator(), AuditAction::SessionDelete, "session", "s-2"))
            .await;
        assert!(trail.query(AuditQuery::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_query_filters_by_resource_and_action() {
        let store = Arc::new(InMemoryAuditStore::new());
        let trail = AuditTrail::new(store.clone(), Duration::from_secs(1));
        let actor = operator();

        trail.record(AuditEntry::new(&actor, AuditAction::SessionCreate, "session", "a")).await;
        trail.record(AuditEntry::new(&actor, AuditAction::SessionUpdate, "session", "a")).await;
        trail.record(AuditEntry::new(&actor, AuditAction::SessionCreate, "session", "b")).await;

        let for_a = trail
            .query(AuditQuery::new().with_resource("session", "a"))
            .await
            .expect("query");
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[0].action, AuditAction::SessionUpdate);

        let creates = trail
            .query(AuditQuery::new().with_actions(vec![AuditAction::SessionCreate]).with_actor(actor.id))
            .await
            .expect("query");
        assert_eq!(creates.len(), 2);
    }
}

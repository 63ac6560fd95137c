use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Notification, NotificationChannel, NotificationError};
use crate::core::shared::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceToken {
    pub token: String,
    pub user_id: Uuid,
    pub platform: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeviceTokenStore: Send + Sync {
    /// Registering an existing token moves it to `user_id`.
    async fn register(&self, token: DeviceToken) -> Result<DeviceToken, StoreError>;
    async fn tokens_for(&self, user_id: Uuid) -> Result<Vec<DeviceToken>, StoreError>;
    async fn remove(&self, token: &str) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDeviceTokenStore {
    tokens: Arc<RwLock<HashMap<String, DeviceToken>>>,
}

impl InMemoryDeviceTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceTokenStore for InMemoryDeviceTokenStore {
    async fn register(&self, token: DeviceToken) -> Result<DeviceToken, StoreError> {
        self.tokens.write().await.insert(token.token.clone(), token.clone());
        Ok(token)
    }

    async fn tokens_for(&self, user_id: Uuid) -> Result<Vec<DeviceToken>, StoreError> {
        let tokens = self.tokens.read().await;
        let mut found: Vec<DeviceToken> = tokens.values().filter(|t| t.user_id == user_id).cloned().collect();
        found.sort_by_key(|t| t.created_at);
        Ok(found)
    }

    async fn remove(&self, token: &str) -> Result<bool, StoreError> {
        Ok(self.tokens.write().await.remove(token).is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    /// The provider no longer accepts this token; it should be pruned.
    #[error("invalid device token")]
    InvalidToken,
    #[error("transient push failure: {0}")]
    Transient(String),
}

/// Transport to the push provider for a single device.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, token: &str, notification: &Notification) -> Result<(), PushError>;
}

const INVALID_TOKEN_ERRORS: &[&str] = &["NotRegistered", "InvalidRegistration", "MismatchSenderId", "UNREGISTERED"];

/// JSON-over-HTTP push provider client.
#[derive(Debug, Clone)]
pub struct HttpPushTransport {
    client: reqwest::Client,
    endpoint: String,
    server_key: String,
}

impl HttpPushTransport {
    pub fn new(endpoint: &str, server_key: &str, timeout: Duration) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("careline-push/1.0")
            .build()
            .map_err(|e| NotificationError::ConfigurationError(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            server_key: server_key.to_string(),
        })
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn send(&self, token: &str, notification: &Notification) -> Result<(), PushError> {
        let payload = serde_json::json!({
            "to": token,
            "notification": {
                "title": notification.title,
                "body": notification.body,
            },
            "data": {
                "id": notification.id,
                "type": notification.notification_type.as_str(),
                "payload": notification.payload,
            },
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("key={}", self.server_key))
            .json(&payload)
            .send()
            .await
            .map_err(|e| PushError::Transient(format!("push request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(PushError::InvalidToken);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::Transient(format!("push provider returned {status}: {body}")));
        }

        let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
        let provider_error = body["results"]
            .as_array()
            .and_then(|results| results.iter().find_map(|r| r["error"].as_str()))
            .or_else(|| body["error"]["status"].as_str());

        match provider_error {
            Some(code) if INVALID_TOKEN_ERRORS.contains(&code) => Err(PushError::InvalidToken),
            Some(code) => Err(PushError::Transient(code.to_string())),
            None => Ok(()),
        }
    }
}

/// Durable channel: every registered device of the recipient.
pub struct PushChannel {
    tokens: Arc<dyn DeviceTokenStore>,
    transport: Arc<dyn PushTransport>,
}

impl PushChannel {
    pub fn new(tokens: Arc<dyn DeviceTokenStore>, transport: Arc<dyn PushTransport>) -> Self {
        Self { tokens, transport }
    }
}

#[async_trait]
impl NotificationChannel for PushChannel {
    fn name(&self) -> &'static str {
        "push"
    }

    async fn deliver(&self, notification: &Notification) -> Result<usize, NotificationError> {
        let devices = self
            .tokens
            .tokens_for(notification.recipient_id)
            .await
            .map_err(|e| NotificationError::Store(e.to_string()))?;

        let mut delivered = 0;
        for device in devices {
            match self.transport.send(&device.token, notification).await {
                Ok(()) => delivered += 1,
                Err(PushError::InvalidToken) => {
                    info!(
                        "Pruning invalid {} device token for user {}",
                        device.platform, device.user_id
                    );
                    if let Err(e) = self.tokens.remove(&device.token).await {
                        warn!("Failed to prune device token for {}: {}", device.user_id, e);
                    }
                }
                Err(PushError::Transient(reason)) => {
                    warn!(
                        "Push to {} device of {} failed: {}",
                        device.platform, device.user_id, reason
                    );
                }
            }
        }
        Ok(delivered)
    }
}

impl std::fmt::Debug for PushChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushChannel")
            .field("tokens", &"Arc<dyn DeviceTokenStore>")
            .field("transport", &"Arc<dyn PushTransport>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::NotificationType;
    use mockito::Matcher;

    fn device(user_id: Uuid, token: &str) -> DeviceToken {
        DeviceToken {
            token: token.to_string(),
            user_id,
            platform: "android".into(),
            created_at: Utc::now(),
        }
    }

    fn notification(recipient: Uuid) -> Notification {
        Notification::new(recipient, NotificationType::CompleteRequested, "Session", "Please confirm")
    }

    #[tokio::test]
    async fn test_http_transport_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/send")
            .match_header("authorization", "key=secret")
            .match_body(Matcher::PartialJson(serde_json::json!({ "to": "tok-1" })))
            .with_status(200)
            .with_body(r#"{"success":1,"failure":0,"results":[{"message_id":"m1"}]}"#)
            .create_async()
            .await;

        let transport =
            HttpPushTransport::new(&format!("{}/send", server.url()), "secret", Duration::from_secs(5)).expect("client");
        let result = transport.send("tok-1", &notification(Uuid::new_v4())).await;

        assert_eq!(result, Ok(()));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_transport_detects_unregistered_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/send")
            .with_status(200)
            .with_body(r#"{"success":0,"failure":1,"results":[{"error":"NotRegistered"}]}"#)
            .create_async()
            .await;

        let transport =
            HttpPushTransport::new(&format!("{}/send", server.url()), "secret", Duration::from_secs(5)).expect("client");
        let result = transport.send("stale", &notification(Uuid::new_v4())).await;
        assert_eq!(result, Err(PushError::InvalidToken));
    }

    #[tokio::test]
    async fn test_http_transport_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/send").with_status(503).create_async().await;

        let transport =
            HttpPushTransport::new(&format!("{}/send", server.url()), "secret", Duration::from_secs(5)).expect("client");
        let result = transport.send("tok", &notification(Uuid::new_v4())).await;
        assert!(matches!(result, Err(PushError::Transient(_))));
    }

    #[tokio::test]
    async fn test_channel_prunes_invalid_tokens() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/send")
            .match_body(Matcher::PartialJson(serde_json::json!({ "to": "good" })))
            .with_status(200)
            .with_body(r#"{"results":[{"message_id":"m1"}]}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/send")
            .match_body(Matcher::PartialJson(serde_json::json!({ "to": "expired" })))
            .with_status(410)
            .create_async()
            .await;

        let user = Uuid::new_v4();
        let store = Arc::new(InMemoryDeviceTokenStore::new());
        store.register(device(user, "good")).await.expect("register");
        store.register(device(user, "expired")).await.expect("register");

        let transport = Arc::new(
            HttpPushTransport::new(&format!("{}/send", server.url()), "secret", Duration::from_secs(5)).expect("client"),
        );
        let channel = PushChannel::new(store.clone(), transport);

        let delivered = channel.deliver(&notification(user)).await.expect("deliver");
        assert_eq!(delivered, 1);

        let remaining = store.tokens_for(user).await.expect("tokens");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].token, "good");
    }
}

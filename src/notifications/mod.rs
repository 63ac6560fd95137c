pub mod devices;
pub mod handlers;
pub mod live;
pub mod pg_store;
pub mod push;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub use devices::DeviceRegistry;
pub use live::{LiveChannel, LiveHub};
pub use pg_store::PgDeviceTokenStore;
pub use push::{DeviceToken, DeviceTokenStore, HttpPushTransport, InMemoryDeviceTokenStore, PushChannel, PushTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    SessionCreated,
    SessionUpdated,
    SessionReassigned,
    SessionCancelled,
    CompleteRequested,
    CompleteAccepted,
    DeleteRequested,
    SessionDeleted,
    QuestionAsked,
    QuestionAnswered,
    InstructionAdded,
    FeedbackReceived,
    FileAttached,
    AccessChanged,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionCreated => "session_created",
            Self::SessionUpdated => "session_updated",
            Self::SessionReassigned => "session_reassigned",
            Self::SessionCancelled => "session_cancelled",
            Self::CompleteRequested => "complete_requested",
            Self::CompleteAccepted => "complete_accepted",
            Self::DeleteRequested => "delete_requested",
            Self::SessionDeleted => "session_deleted",
            Self::QuestionAsked => "question_asked",
            Self::QuestionAnswered => "question_answered",
            Self::InstructionAdded => "instruction_added",
            Self::FeedbackReceived => "feedback_received",
            Self::FileAttached => "file_attached",
            Self::AccessChanged => "access_changed",
        }
    }
}

/// Logical message for one recipient. Not persisted by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub title: String,
    pub body: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(recipient_id: Uuid, notification_type: NotificationType, title: &str, body: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient_id,
            title: title.to_string(),
            body: body.to_string(),
            notification_type,
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Same message addressed to someone else.
    pub fn readdressed(&self, recipient_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient_id,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotificationError {
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),
    #[error("Store error: {0}")]
    Store(String),
}

/// One delivery path of the fan-out.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;
    /// Returns how many endpoints received the message (0 is not an error).
    async fn deliver(&self, notification: &Notification) -> Result<usize, NotificationError>;
}

/// Dispatches every notification to all channels independently.
pub struct NotificationFanout {
    channels: Vec<Arc<dyn NotificationChannel>>,
    timeout: Duration,
}

impl NotificationFanout {
    pub fn new(timeout: Duration) -> Self {
        Self {
            channels: Vec::new(),
            timeout,
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Fire-and-forget: channels are delivered to concurrently, each under
    /// its own timeout. Failures are logged per channel and never returned.
    pub async fn notify(&self, notification: &Notification) {
        let deliveries = self.channels.iter().map(|channel| async move {
            match tokio::time::timeout(self.timeout, channel.deliver(notification)).await {
                Ok(Ok(delivered)) => debug!(
                    "{} notification {} to {} via {}: {} endpoint(s)",
                    notification.notification_type.as_str(),
                    notification.id,
                    notification.recipient_id,
                    channel.name(),
                    delivered
                ),
                Ok(Err(e)) => warn!(
                    "Failed to send {} notification to {}: {}",
                    channel.name(),
                    notification.recipient_id,
                    e
                ),
                Err(_) => warn!(
                    "{} channel timed out delivering notification {} to {}",
                    channel.name(),
                    notification.id,
                    notification.recipient_id
                ),
            }
        });
        join_all(deliveries).await;
    }
}

impl std::fmt::Debug for NotificationFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationFanout")
            .field("channels", &self.channel_names())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingChannel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NotificationChannel for FailingChannel {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn deliver(&self, _notification: &Notification) -> Result<usize, NotificationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(NotificationError::NetworkError("unreachable".into()))
        }
    }

    struct StuckChannel;

    #[async_trait]
    impl NotificationChannel for StuckChannel {
        fn name(&self) -> &'static str {
            "stuck"
        }

        async fn deliver(&self, _notification: &Notification) -> Result<usize, NotificationError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_failing_channel_does_not_block_others() {
        let hub = Arc::new(LiveHub::new(8));
        let recipient = Uuid::new_v4();
        let mut rx = hub.subscribe(recipient).await;

        let failing = Arc::new(FailingChannel {
            calls: AtomicUsize::new(0),
        });
        let fanout = NotificationFanout::new(Duration::from_millis(50))
            .with_channel(failing.clone())
            .with_channel(Arc::new(StuckChannel))
            .with_channel(Arc::new(LiveChannel::new(hub.clone())));

        let notification = Notification::new(recipient, NotificationType::CompleteRequested, "Title", "Body");
        fanout.notify(&notification).await;

        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        let received = rx.recv().await.expect("live message");
        assert_eq!(received.id, notification.id);
    }

    #[test]
    fn test_readdressed_gets_new_id() {
        let notice = Notification::new(Uuid::new_v4(), NotificationType::SessionCreated, "t", "b")
            .with_payload(serde_json::json!({ "session_id": "x" }));
        let other = Uuid::new_v4();
        let copy = notice.readdressed(other);
        assert_eq!(copy.recipient_id, other);
        assert_ne!(copy.id, notice.id);
        assert_eq!(copy.payload, notice.payload);
    }
}

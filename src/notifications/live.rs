use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use super::{Notification, NotificationChannel, NotificationError};

/// Registry of recipients currently connected over a live socket.
#[derive(Debug)]
pub struct LiveHub {
    senders: RwLock<HashMap<Uuid, broadcast::Sender<Notification>>>,
    capacity: usize,
}

impl LiveHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Registers interest for `recipient_id`; several sockets may share one sender.
    pub async fn subscribe(&self, recipient_id: Uuid) -> broadcast::Receiver<Notification> {
        let mut senders = self.senders.write().await;
        senders
            .entry(recipient_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drops the sender once the last socket for `recipient_id` is gone.
    pub async fn release(&self, recipient_id: Uuid) {
        let mut senders = self.senders.write().await;
        if let Some(sender) = senders.get(&recipient_id) {
            if sender.receiver_count() == 0 {
                senders.remove(&recipient_id);
            }
        }
    }

    pub async fn is_connected(&self, recipient_id: Uuid) -> bool {
        self.senders
            .read()
            .await
            .get(&recipient_id)
            .map(|s| s.receiver_count() > 0)
            .unwrap_or(false)
    }

    /// Returns the number of sockets reached; unconnected recipients get 0.
    pub async fn send(&self, notification: &Notification) -> usize {
        let senders = self.senders.read().await;
        match senders.get(&notification.recipient_id) {
            Some(sender) => sender.send(notification.clone()).unwrap_or(0),
            None => 0,
        }
    }
}

/// Live socket delivery; offline recipients are silently skipped.
#[derive(Debug, Clone)]
pub struct LiveChannel {
    hub: Arc<LiveHub>,
}

impl LiveChannel {
    pub fn new(hub: Arc<LiveHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl NotificationChannel for LiveChannel {
    fn name(&self) -> &'static str {
        "live"
    }

    async fn deliver(&self, notification: &Notification) -> Result<usize, NotificationError> {
        let reached = self.hub.send(notification).await;
        if reached == 0 {
            debug!(
                "Recipient {} not connected, dropping live notification {}",
                notification.recipient_id, notification.id
            );
        }
        Ok(reached)
    }
}

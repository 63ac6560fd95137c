//! Side effects that run only after the authoritative write has committed.
//!
//! Effects execute in insertion order. Each one is bounded by a timeout and
//! isolated: a failure is logged and the next effect still runs. Notification
//! channels are bounded individually by the fan-out.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::files::FileStorage;
use crate::notifications::{Notification, NotificationFanout};
use crate::security::audit::{AuditEntry, AuditTrail};

#[derive(Debug, Clone)]
pub enum SideEffect {
    Audit(AuditEntry),
    Notify(Notification),
    RemoveFiles(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct PostCommit {
    effects: Vec<SideEffect>,
}

impl PostCommit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audit(mut self, entry: AuditEntry) -> Self {
        self.effects.push(SideEffect::Audit(entry));
        self
    }

    pub fn notify(mut self, notification: Notification) -> Self {
        self.effects.push(SideEffect::Notify(notification));
        self
    }

    /// Sends `template` to each recipient.
    pub fn notify_all(mut self, recipients: impl IntoIterator<Item = uuid::Uuid>, template: &Notification) -> Self {
        for recipient in recipients {
            self.effects.push(SideEffect::Notify(template.readdressed(recipient)));
        }
        self
    }

    pub fn remove_files(mut self, keys: Vec<String>) -> Self {
        if !keys.is_empty() {
            self.effects.push(SideEffect::RemoveFiles(keys));
        }
        self
    }

    pub fn effects(&self) -> &[SideEffect] {
        &self.effects
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }
}

pub struct HookRunner {
    audit: Arc<AuditTrail>,
    notifications: Arc<NotificationFanout>,
    files: Arc<dyn FileStorage>,
    timeout: Duration,
}

impl HookRunner {
    pub fn new(
        audit: Arc<AuditTrail>,
        notifications: Arc<NotificationFanout>,
        files: Arc<dyn FileStorage>,
        timeout: Duration,
    ) -> Self {
        Self {
            audit,
            notifications,
            files,
            timeout,
        }
    }

    pub fn audit_trail(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    pub async fn run(&self, hooks: PostCommit) {
        for effect in hooks.effects {
            match effect {
                SideEffect::Audit(entry) => {
                    let action = entry.action;
                    if tokio::time::timeout(self.timeout, self.audit.record(entry)).await.is_err() {
                        warn!("Audit write for {} timed out", action.as_str());
                    }
                }
                // The fan-out bounds each channel itself.
                SideEffect::Notify(notification) => self.notifications.notify(&notification).await,
                SideEffect::RemoveFiles(keys) => {
                    for key in keys {
                        match tokio::time::timeout(self.timeout, self.files.remove(&key)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!("File cleanup failed for {}: {}", key, e),
                            Err(_) => warn!("File cleanup timed out for {}", key),
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for HookRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRunner")
            .field("audit", &self.audit)
            .field("notifications", &self.notifications)
            .field("files", &"Arc<dyn FileStorage>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

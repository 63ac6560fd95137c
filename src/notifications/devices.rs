use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::core::error::ServiceError;
use crate::core::hooks::{HookRunner, PostCommit};
use crate::core::shared::store::with_timeout;
use crate::notifications::push::{DeviceToken, DeviceTokenStore};
use crate::security::audit::{AuditAction, AuditEntry};
use crate::security::identity::Actor;

const PLATFORMS: &[&str] = &["android", "ios", "web"];

/// Registration of push device tokens for the calling actor.
pub struct DeviceRegistry {
    tokens: Arc<dyn DeviceTokenStore>,
    hooks: Arc<HookRunner>,
    timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(tokens: Arc<dyn DeviceTokenStore>, hooks: Arc<HookRunner>, timeout: Duration) -> Self {
        Self { tokens, hooks, timeout }
    }

    pub async fn register_device(&self, actor: &Actor, token: &str, platform: &str) -> Result<DeviceToken, ServiceError> {
        let token = token.trim();
        if token.is_empty() || token.len() > 4096 {
            return Err(ServiceError::Validation("device token is empty or too long".into()));
        }
        let platform = platform.trim().to_ascii_lowercase();
        if !PLATFORMS.contains(&platform.as_str()) {
            return Err(ServiceError::Validation(format!("unsupported platform {platform:?}")));
        }

        let device = DeviceToken {
            token: token.to_string(),
            user_id: actor.id,
            platform,
            created_at: Utc::now(),
        };
        let saved = with_timeout(self.timeout, self.tokens.register(device)).await?;
        info!("Registered {} device for {}", saved.platform, actor.id);

        let hooks = PostCommit::new().audit(
            AuditEntry::new(actor, AuditAction::DeviceRegistered, "device_token", actor.id)
                .with_details(serde_json::json!({ "platform": saved.platform })),
        );
        self.hooks.run(hooks).await;

        Ok(saved)
    }

    pub async fn unregister_device(&self, actor: &Actor, token: &str) -> Result<(), ServiceError> {
        let Some(owned) = with_timeout(self.timeout, self.tokens.tokens_for(actor.id))
            .await?
            .into_iter()
            .find(|t| t.token == token)
        else {
            return Err(ServiceError::NotFound("device token".into()));
        };
        with_timeout(self.timeout, self.tokens.remove(token)).await?;
        info!("Unregistered {} device for {}", owned.platform, actor.id);

        let hooks = PostCommit::new().audit(
            AuditEntry::new(actor, AuditAction::DeviceUnregistered, "device_token", actor.id)
                .with_details(serde_json::json!({ "platform": owned.platform })),
        );
        self.hooks.run(hooks).await;

        Ok(())
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("tokens", &"Arc<dyn DeviceTokenStore>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::config::AppConfig;
use crate::core::hooks::HookRunner;
use crate::core::shared::utils::DbPool;
use crate::files::{FileStorage, LocalFileStorage};
use crate::notifications::push::{
    DeviceTokenStore, HttpPushTransport, InMemoryDeviceTokenStore, PushChannel,
};
use crate::notifications::{
    DeviceRegistry, LiveChannel, LiveHub, NotificationError, NotificationFanout, PgDeviceTokenStore,
};
use crate::security::access::{AccessGrantStore, InMemoryAccessGrantStore};
use crate::security::audit::{AuditStore, AuditTrail, InMemoryAuditStore};
use crate::security::grants::GrantManager;
use crate::security::guard::AuthorizationGuard;
use crate::security::identity::{ActorDirectory, InMemoryActorDirectory, Roster};
use crate::security::pg_store::{PgAccessGrantStore, PgActorDirectory, PgAuditStore};
use crate::sessions::{InMemorySessionStore, PgSessionStore, SessionLifecycle, SessionStore};

/// The persistence seams the services are built on.
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub grants: Arc<dyn AccessGrantStore>,
    pub directory: Arc<dyn ActorDirectory>,
    pub audit: Arc<dyn AuditStore>,
    pub devices: Arc<dyn DeviceTokenStore>,
}

impl Stores {
    pub fn postgres(pool: &DbPool) -> Self {
        Self {
            sessions: Arc::new(PgSessionStore::new(pool.clone())),
            grants: Arc::new(PgAccessGrantStore::new(pool.clone())),
            directory: Arc::new(PgActorDirectory::new(pool.clone())),
            audit: Arc::new(PgAuditStore::new(pool.clone())),
            devices: Arc::new(PgDeviceTokenStore::new(pool.clone())),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            sessions: Arc::new(InMemorySessionStore::new()),
            grants: Arc::new(InMemoryAccessGrantStore::new()),
            directory: Arc::new(InMemoryActorDirectory::new()),
            audit: Arc::new(InMemoryAuditStore::new()),
            devices: Arc::new(InMemoryDeviceTokenStore::new()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<SessionLifecycle>,
    pub grants: Arc<GrantManager>,
    pub devices: Arc<DeviceRegistry>,
    pub live: Arc<LiveHub>,
    pub audit: Arc<AuditTrail>,
    pub conn: Option<DbPool>,
}

impl AppState {
    /// Wires every service over `stores`. The push channel is only attached
    /// when both push credentials are configured.
    pub fn new(config: &AppConfig, stores: Stores, files: Arc<dyn FileStorage>) -> Result<Self, NotificationError> {
        let store_timeout = config.sessions.store_timeout;
        let live = Arc::new(LiveHub::new(config.notifications.live_channel_capacity));

        let mut fanout =
            NotificationFanout::new(config.side_effect_timeout).with_channel(Arc::new(LiveChannel::new(live.clone())));
        if let Some((endpoint, key)) = config.notifications.push_credentials() {
            let transport = HttpPushTransport::new(endpoint, key, config.side_effect_timeout)?;
            fanout = fanout.with_channel(Arc::new(PushChannel::new(stores.devices.clone(), Arc::new(transport))));
            info!("Push delivery enabled via {}", endpoint);
        }

        let audit = Arc::new(AuditTrail::new(stores.audit.clone(), store_timeout));
        let hooks = Arc::new(HookRunner::new(
            audit.clone(),
            Arc::new(fanout),
            files,
            config.side_effect_timeout,
        ));
        let guard = Arc::new(AuthorizationGuard::new(stores.grants.clone(), store_timeout));

        let lifecycle = Arc::new(SessionLifecycle::new(
            stores.sessions,
            stores.directory.clone(),
            guard,
            hooks.clone(),
            config.lifecycle(),
        ));
        let grants = Arc::new(GrantManager::new(stores.grants, stores.directory, hooks.clone(), store_timeout));
        let devices = Arc::new(DeviceRegistry::new(stores.devices, hooks, store_timeout));

        Ok(Self {
            lifecycle,
            grants,
            devices,
            live,
            audit,
            conn: None,
        })
    }

    /// Postgres-backed state when a pool is given, in-memory otherwise. The
    /// in-memory directory is seeded from `ROSTER_FILE` when set.
    pub fn from_config(config: &AppConfig, pool: Option<DbPool>) -> anyhow::Result<Self> {
        let files: Arc<dyn FileStorage> = Arc::new(LocalFileStorage::new(&config.file_storage_root));
        let stores = match &pool {
            Some(pool) => Stores::postgres(pool),
            None => {
                let mut stores = Stores::in_memory();
                match config.roster_file.as_deref() {
                    Some(path) => {
                        let roster = load_roster(path)?;
                        info!(
                            "Loaded {} patient(s) and {} operator(s) from {}",
                            roster.patients.len(),
                            roster.operators.len(),
                            path
                        );
                        stores.directory = Arc::new(InMemoryActorDirectory::from_roster(roster));
                    }
                    None => warn!("ROSTER_FILE not set, the in-memory directory starts empty"),
                }
                stores
            }
        };
        let mut state = Self::new(config, stores, files)?;
        state.conn = pool;
        Ok(state)
    }
}

fn load_roster(path: &str) -> anyhow::Result<Roster> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading roster {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing roster {path}"))
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("lifecycle", &self.lifecycle)
            .field("grants", &self.grants)
            .field("devices", &self.devices)
            .field("postgres", &self.conn.is_some())
            .finish()
    }
}

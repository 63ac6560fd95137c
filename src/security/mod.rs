pub mod access;
pub mod access_handlers;
pub mod audit;
pub mod auth;
pub mod grants;
pub mod guard;
pub mod identity;
pub mod pg_store;

pub use access::{AccessGrant, AccessGrantStore, InMemoryAccessGrantStore};
pub use audit::{AuditAction, AuditEntry, AuditQuery, AuditStore, AuditTrail, InMemoryAuditStore};
pub use auth::AuthenticatedActor;
pub use grants::GrantManager;
pub use guard::{AuthorizationGuard, Capability, Operation};
pub use identity::{Actor, ActorDirectory, InMemoryActorDirectory, OperatorRole};

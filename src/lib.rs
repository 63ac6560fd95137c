pub mod api_router;
pub mod core;
pub mod files;
pub mod notifications;
pub mod security;
pub mod sessions;

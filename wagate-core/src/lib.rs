pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod models;
pub mod store;

pub use config::WagateConfig;
pub use connection::{ConnectionClient, ConnectionError, ConnectionStatus, HttpBridgeClient};
pub use error::WagateError;
pub use models::tenant::{NewTenant, Tenant, TenantId, SUPPORTED_EVENTS};
pub use store::{MemoryTenantStore, PgTenantStore, StoreError, TenantStore};

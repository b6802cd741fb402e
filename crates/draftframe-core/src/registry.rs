//! Read-only collaborator lookups consumed by the session resolver.
//!
//! Connection storage and the local dev-server process manager live outside this
//! workspace. The gateway only needs to read from them, through [`ConnectionLookup`]
//! and [`CliPortRegistry`]. The in-memory implementations back the standalone binary
//! and the tests.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::session::Connection;

/// Lookup of stored storefront connections by tenant.
#[async_trait]
pub trait ConnectionLookup: Send + Sync {
    /// The tenant's primary storefront connection.
    async fn primary(&self, tenant_id: &str) -> Result<Option<Connection>>;

    /// The tenant's secondary development-store connection.
    async fn dev_store(&self, tenant_id: &str) -> Result<Option<Connection>>;

    /// Per-tenant variant override. Takes precedence over the connection's variant.
    async fn tenant_variant(&self, tenant_id: &str) -> Result<Option<String>>;
}

/// Registry of locally running dev-servers, keyed by tenant.
#[async_trait]
pub trait CliPortRegistry: Send + Sync {
    async fn port(&self, tenant_id: &str) -> Option<u16>;
}

#[derive(Debug, Default)]
pub struct MemoryConnectionLookup {
    primary: DashMap<String, Connection>,
    dev_store: DashMap<String, Connection>,
    variants: DashMap<String, String>,
}

impl MemoryConnectionLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_primary(&self, tenant_id: impl Into<String>, connection: Connection) {
        self.primary.insert(tenant_id.into(), connection);
    }

    pub fn set_dev_store(&self, tenant_id: impl Into<String>, connection: Connection) {
        self.dev_store.insert(tenant_id.into(), connection);
    }

    pub fn set_tenant_variant(&self, tenant_id: impl Into<String>, variant_id: impl Into<String>) {
        self.variants.insert(tenant_id.into(), variant_id.into());
    }

    pub fn remove(&self, tenant_id: &str) {
        self.primary.remove(tenant_id);
        self.dev_store.remove(tenant_id);
        self.variants.remove(tenant_id);
    }
}

#[async_trait]
impl ConnectionLookup for MemoryConnectionLookup {
    async fn primary(&self, tenant_id: &str) -> Result<Option<Connection>> {
        Ok(self.primary.get(tenant_id).map(|c| c.clone()))
    }

    async fn dev_store(&self, tenant_id: &str) -> Result<Option<Connection>> {
        Ok(self.dev_store.get(tenant_id).map(|c| c.clone()))
    }

    async fn tenant_variant(&self, tenant_id: &str) -> Result<Option<String>> {
        Ok(self.variants.get(tenant_id).map(|v| v.clone()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryCliPortRegistry {
    ports: DashMap<String, u16>,
}

impl MemoryCliPortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tenant_id: impl Into<String>, port: u16) {
        let tenant_id = tenant_id.into();
        tracing::debug!(tenant_id = %tenant_id, port, "dev-server port registered");
        self.ports.insert(tenant_id, port);
    }

    pub fn unregister(&self, tenant_id: &str) {
        if self.ports.remove(tenant_id).is_some() {
            tracing::debug!(tenant_id = %tenant_id, "dev-server port unregistered");
        }
    }
}

#[async_trait]
impl CliPortRegistry for MemoryCliPortRegistry {
    async fn port(&self, tenant_id: &str) -> Option<u16> {
        self.ports.get(tenant_id).map(|p| *p)
    }
}

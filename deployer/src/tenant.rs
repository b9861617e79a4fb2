//! Per-request tenant context. Replaces the global-credentials pattern:
//! the optional per-tenant storage settings are looked up once per
//! request (by the caller, via the catalog store) and threaded down to
//! the `ObjectStore` explicitly, the way an axum `Extension` would be
//! threaded through a request in the teacher, minus the HTTP layer this
//! core doesn't own.

use serde::{Deserialize, Serialize};

pub type TenantId = String;

/// Tenant-scoped S3-shaped storage settings (spec §6 "Per-tenant storage
/// settings"). Absent settings fall back to the service's default
/// credentials.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TenantStorageSettings {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub force_path_style: bool,
    pub use_accelerate: bool,
}

#[derive(Clone, Debug, Default)]
pub struct TenantContext {
    pub tenant: TenantId,
    pub storage_settings: Option<TenantStorageSettings>,
}

impl TenantContext {
    pub fn new(tenant: impl Into<TenantId>) -> Self {
        Self {
            tenant: tenant.into(),
            storage_settings: None,
        }
    }

    pub fn with_storage_settings(mut self, settings: TenantStorageSettings) -> Self {
        self.storage_settings = Some(settings);
        self
    }

    /// Object keys are scoped `<tenant>/<rest>` to prevent cross-tenant
    /// overlap (spec §5 "Shared resources"). The prefix is elided for the
    /// default/empty tenant, matching single-tenant deployments.
    pub fn scoped_key(&self, rest: &str) -> String {
        if self.tenant.is_empty() {
            rest.to_string()
        } else {
            format!("{}/{}", self.tenant, rest)
        }
    }
}

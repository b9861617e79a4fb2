//! Inventory/reporting adapter (spec §4.4): device-by-group search and
//! group lookup. The reporting client, when configured, supersedes
//! inventory for `search` only — both speak the same trait so the core
//! never has to know which one answered.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use self::http::HttpInventoryClient;

#[derive(thiserror::Error, Debug)]
pub enum InventoryError {
    #[error("inventory request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("inventory returned an unexpected response: {0}")]
    UnexpectedResponse(String),
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SearchParams {
    pub group: Option<String>,
    pub page: i64,
    pub per_page: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SearchResult {
    pub devices: Vec<DeviceSummary>,
    pub total_count: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceSummary {
    pub id: String,
}

#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn search(&self, tenant: &str, params: SearchParams) -> Result<SearchResult, InventoryError>;
    async fn get_device_groups(&self, tenant: &str, device_id: &str) -> Result<Vec<String>, InventoryError>;
}

/// Prefers the reporting client for `search` when one is configured
/// (spec §4.4 "Reporting, if configured, supersedes inventory for
/// Search only"); group lookups always go to inventory.
pub struct SearchPreferringReporting<I, R> {
    pub inventory: I,
    pub reporting: Option<R>,
}

#[async_trait]
impl<I, R> InventoryClient for SearchPreferringReporting<I, R>
where
    I: InventoryClient,
    R: InventoryClient,
{
    async fn search(&self, tenant: &str, params: SearchParams) -> Result<SearchResult, InventoryError> {
        match &self.reporting {
            Some(reporting) => reporting.search(tenant, params).await,
            None => self.inventory.search(tenant, params).await,
        }
    }

    async fn get_device_groups(&self, tenant: &str, device_id: &str) -> Result<Vec<String>, InventoryError> {
        self.inventory.get_device_groups(tenant, device_id).await
    }
}

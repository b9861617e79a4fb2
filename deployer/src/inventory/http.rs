//! `reqwest`-backed `InventoryClient`, grounded on
//! `deployer/src/deployment/gateway_client.rs`'s `BuildQueueClient`: a
//! thin struct wrapping a base URL and a shared `reqwest::Client`, one
//! HTTP call per trait method, JSON in and out.

use async_trait::async_trait;

use super::{InventoryClient, InventoryError, SearchParams, SearchResult};

#[derive(Clone)]
pub struct HttpInventoryClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpInventoryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl InventoryClient for HttpInventoryClient {
    async fn search(&self, tenant: &str, params: SearchParams) -> Result<SearchResult, InventoryError> {
        let response = self
            .client
            .post(format!("{}/api/management/v1/inventory/devices/search", self.base_url))
            .header("X-Tenant-ID", tenant)
            .json(&params)
            .send()
            .await?
            .error_for_status()?;

        response.json().await.map_err(InventoryError::from)
    }

    async fn get_device_groups(&self, tenant: &str, device_id: &str) -> Result<Vec<String>, InventoryError> {
        #[derive(serde::Deserialize)]
        struct Groups {
            groups: Vec<String>,
        }

        let response = self
            .client
            .get(format!(
                "{}/api/management/v1/inventory/devices/{device_id}/groups",
                self.base_url
            ))
            .header("X-Tenant-ID", tenant)
            .send()
            .await?
            .error_for_status()?;

        let groups: Groups = response.json().await?;
        Ok(groups.groups)
    }
}

//! `CreateDeployment` (spec §3, §4.2 "Ordering & tie-breaks", §6
//! targeting-mode validation): resolves a `DeploymentTarget` into an
//! explicit device list, computes `max_devices` and
//! `artifact_id_candidates`, and inserts the deployment row.

use std::sync::Arc;

use uuid::Uuid;

use fleet_common::{DeploymentTarget, DeploymentType};

use crate::catalog::{CatalogStore, NewDeployment};
use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::inventory::{InventoryClient, SearchParams};
use crate::tenant::TenantContext;

pub struct DeploymentCreation {
    pub catalog: Arc<dyn CatalogStore>,
    pub inventory: Arc<dyn InventoryClient>,
    pub config: CoreConfig,
}

pub struct NewDeploymentRequest {
    pub id: Option<Uuid>,
    pub name: String,
    pub artifact_name: String,
    pub configuration: Option<serde_json::Value>,
    pub target: DeploymentTarget,
    pub deployment_type: DeploymentType,
    pub force_installation: bool,
}

impl DeploymentCreation {
    pub async fn create_deployment(&self, ctx: &TenantContext, req: NewDeploymentRequest) -> Result<Uuid> {
        let (device_list, groups) = self.resolve_target(ctx, req.target).await?;
        if device_list.is_empty() {
            return Err(Error::NoDevices);
        }

        let artifact_id_candidates: Vec<Uuid> = self
            .catalog
            .images_by_name(&ctx.tenant, &req.artifact_name)
            .await?
            .into_iter()
            .map(|artifact| artifact.id)
            .collect();

        let id = self
            .catalog
            .insert_deployment(NewDeployment {
                id: req.id.unwrap_or_else(Uuid::new_v4),
                tenant: ctx.tenant.clone(),
                name: req.name,
                artifact_name: req.artifact_name,
                configuration: req.configuration,
                max_devices: device_list.len() as u64,
                device_list,
                artifact_id_candidates,
                groups,
                deployment_type: req.deployment_type,
                force_installation: req.force_installation,
            })
            .await?;

        Ok(id)
    }

    /// Expands `Group`/`AllDevices` to explicit device IDs by paginating
    /// the inventory/reporting adapter until every matching device has
    /// been collected (spec §4.2). `Devices` is already explicit.
    async fn resolve_target(
        &self,
        ctx: &TenantContext,
        target: DeploymentTarget,
    ) -> Result<(Vec<String>, Vec<String>)> {
        match target {
            DeploymentTarget::Devices(devices) => Ok((devices, Vec::new())),
            DeploymentTarget::Group(group) => {
                let devices = self.paginate_search(ctx, Some(group.clone())).await?;
                Ok((devices, vec![group]))
            }
            DeploymentTarget::AllDevices => {
                let devices = self.paginate_search(ctx, None).await?;
                Ok((devices, Vec::new()))
            }
        }
    }

    async fn paginate_search(&self, ctx: &TenantContext, group: Option<String>) -> Result<Vec<String>> {
        let mut devices = Vec::new();
        let mut page = 0i64;
        loop {
            let result = self
                .inventory
                .search(
                    &ctx.tenant,
                    SearchParams {
                        group: group.clone(),
                        page,
                        per_page: self.config.device_search_page_size,
                    },
                )
                .await?;

            let returned = result.devices.len() as i64;
            devices.extend(result.devices.into_iter().map(|d| d.id));

            if returned < self.config.device_search_page_size || devices.len() as u64 >= result.total_count {
                return Ok(devices);
            }
            page += 1;
        }
    }
}

//! Integration-style tests of `CreateDeployment` (spec §3, §4.2 "Ordering
//! & tie-breaks"), covering group/all-devices expansion through a fake
//! inventory client the way `dispatch.rs` fakes `WorkflowsClient`.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use fleet_common::{DeploymentTarget, DeploymentType};
use fleet_deployer::catalog::{CatalogStore, SqliteCatalogStore};
use fleet_deployer::config::CoreConfig;
use fleet_deployer::deployment::{DeploymentCreation, NewDeploymentRequest};
use fleet_deployer::error::Error;
use fleet_deployer::inventory::{DeviceSummary, InventoryClient, InventoryError, SearchParams, SearchResult};
use fleet_deployer::tenant::TenantContext;

/// Returns devices two at a time regardless of group, so pagination
/// has to run more than once to collect them all.
struct PagedInventory {
    all_devices: Vec<&'static str>,
}

#[async_trait]
impl InventoryClient for PagedInventory {
    async fn search(&self, _tenant: &str, params: SearchParams) -> Result<SearchResult, InventoryError> {
        let per_page = params.per_page.max(1) as usize;
        let start = (params.page as usize) * per_page;
        let devices = self
            .all_devices
            .iter()
            .skip(start)
            .take(per_page)
            .map(|id| DeviceSummary { id: id.to_string() })
            .collect();
        Ok(SearchResult {
            devices,
            total_count: self.all_devices.len() as u64,
        })
    }

    async fn get_device_groups(&self, _tenant: &str, _device_id: &str) -> Result<Vec<String>, InventoryError> {
        Ok(vec![])
    }
}

async fn setup(all_devices: Vec<&'static str>) -> (DeploymentCreation, TenantContext) {
    let catalog = Arc::new(SqliteCatalogStore::new_in_memory().await.unwrap());
    let mut config = CoreConfig::default();
    config.device_search_page_size = 2;
    let creation = DeploymentCreation {
        catalog,
        inventory: Arc::new(PagedInventory { all_devices }),
        config,
    };
    (creation, TenantContext::new("acme"))
}

#[tokio::test]
async fn all_devices_target_expands_through_pagination() {
    let (creation, ctx) = setup(vec!["dev-1", "dev-2", "dev-3", "dev-4", "dev-5"]).await;

    let id = creation
        .create_deployment(
            &ctx,
            NewDeploymentRequest {
                id: None,
                name: "fleet-wide".into(),
                artifact_name: "app-1.0".into(),
                configuration: None,
                target: DeploymentTarget::AllDevices,
                deployment_type: DeploymentType::Software,
                force_installation: false,
            },
        )
        .await
        .unwrap();

    let deployment = creation
        .catalog
        .find_deployment_by_id(id)
        .await
        .unwrap()
        .expect("deployment should exist");

    assert_eq!(deployment.max_devices, 5);
    assert_eq!(deployment.device_list.len(), 5);
    assert!(deployment.device_list.contains(&"dev-5".to_string()));
}

#[tokio::test]
async fn group_target_records_the_group_and_its_members() {
    let (creation, ctx) = setup(vec!["dev-1", "dev-2", "dev-3"]).await;

    let id = creation
        .create_deployment(
            &ctx,
            NewDeploymentRequest {
                id: None,
                name: "canary-fleet".into(),
                artifact_name: "app-1.0".into(),
                configuration: None,
                target: DeploymentTarget::Group("canary".into()),
                deployment_type: DeploymentType::Software,
                force_installation: false,
            },
        )
        .await
        .unwrap();

    let deployment = creation
        .catalog
        .find_deployment_by_id(id)
        .await
        .unwrap()
        .expect("deployment should exist");

    assert_eq!(deployment.groups, vec!["canary".to_string()]);
    assert_eq!(deployment.max_devices, 3);
}

#[tokio::test]
async fn devices_target_is_used_verbatim_without_inventory_lookup() {
    let (creation, ctx) = setup(vec![]).await;

    let id = creation
        .create_deployment(
            &ctx,
            NewDeploymentRequest {
                id: None,
                name: "pinned".into(),
                artifact_name: "app-1.0".into(),
                configuration: None,
                target: DeploymentTarget::Devices(vec!["dev-9".into()]),
                deployment_type: DeploymentType::Software,
                force_installation: false,
            },
        )
        .await
        .unwrap();

    let deployment = creation
        .catalog
        .find_deployment_by_id(id)
        .await
        .unwrap()
        .expect("deployment should exist");

    assert_eq!(deployment.device_list, vec!["dev-9".to_string()]);
    assert_eq!(deployment.max_devices, 1);
}

#[tokio::test]
async fn empty_resolution_is_rejected() {
    let (creation, ctx) = setup(vec![]).await;

    let err = creation
        .create_deployment(
            &ctx,
            NewDeploymentRequest {
                id: None,
                name: "empty-group".into(),
                artifact_name: "app-1.0".into(),
                configuration: None,
                target: DeploymentTarget::Group("nobody".into()),
                deployment_type: DeploymentType::Software,
                force_installation: false,
            },
        )
        .await;

    assert!(matches!(err, Err(Error::NoDevices)));
}

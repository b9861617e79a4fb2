//! Integration-style tests of the device-deployment state machine
//! (spec §4.3), covering cross-deployment effects the `#[cfg(test)]`
//! unit tests beside the code don't reach: decommissioning a device
//! pre-empts every newer deployment still targeting it.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use fleet_common::{DeploymentType, DeviceDeploymentStatus};
use fleet_deployer::catalog::{CatalogStore, NewDeployment, SqliteCatalogStore};
use fleet_deployer::state_machine::StateMachine;
use fleet_deployer::tenant::TenantContext;
use fleet_deployer::workflows::{GenerateArtifactMsg, ReindexDeploymentItem, WorkflowsClient, WorkflowsError};

struct NullWorkflows;

#[async_trait]
impl WorkflowsClient for NullWorkflows {
    async fn start_generate_artifact(&self, _msg: GenerateArtifactMsg) -> Result<(), WorkflowsError> {
        Ok(())
    }
    async fn start_reindex_reporting(&self, _device_id: &str) -> Result<(), WorkflowsError> {
        Ok(())
    }
    async fn start_reindex_reporting_deployment(
        &self,
        _device_id: &str,
        _deployment_id: Uuid,
        _device_deployment_id: Uuid,
    ) -> Result<(), WorkflowsError> {
        Ok(())
    }
    async fn start_reindex_reporting_deployment_batch(
        &self,
        _items: Vec<ReindexDeploymentItem>,
    ) -> Result<(), WorkflowsError> {
        Ok(())
    }
}

async fn new_deployment(catalog: &SqliteCatalogStore, tenant: &str, name: &str, device: &str) -> Uuid {
    catalog
        .insert_deployment(NewDeployment {
            id: Uuid::new_v4(),
            tenant: tenant.to_string(),
            name: name.to_string(),
            artifact_name: "app-1.0".into(),
            configuration: None,
            device_list: vec![device.to_string()],
            max_devices: 1,
            artifact_id_candidates: vec![],
            groups: vec![],
            deployment_type: DeploymentType::Software,
            force_installation: false,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn decommissioning_a_device_preempts_newer_pending_deployments() {
    let catalog = Arc::new(SqliteCatalogStore::new_in_memory().await.unwrap());
    let sm = StateMachine { catalog: catalog.clone(), workflows: Arc::new(NullWorkflows) };
    let ctx = TenantContext::new("acme");

    let first = new_deployment(&catalog, &ctx.tenant, "wave-1", "dev-9").await;
    // Give the second deployment a later creation time by inserting after
    // the first completes; SQLite's `datetime('now')` default has
    // sub-second granularity, which the scan step relies on.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let second = new_deployment(&catalog, &ctx.tenant, "wave-2", "dev-9").await;

    let (active, _) = sm
        .create_device_deployment(&ctx, first, "dev-9", DeviceDeploymentStatus::Pending)
        .await
        .unwrap();
    assert_eq!(active.status, DeviceDeploymentStatus::Pending);

    sm.decommission(&ctx, "dev-9").await.unwrap();

    let active_dd = catalog.get_device_deployment(active.id).await.unwrap().unwrap();
    assert_eq!(active_dd.status, DeviceDeploymentStatus::Decommissioned);

    // `second` was never polled, but decommission should have
    // pre-materialized a terminal device-deployment for it so a later
    // poll never picks it up.
    let second_deployment = catalog.find_deployment_by_id(second).await.unwrap().unwrap();
    assert!(second_deployment.materialized_count() > 0);

    let scan = catalog
        .find_newer_active_deployments(&ctx.tenant, active_dd.created_at, 0, 100)
        .await
        .unwrap();
    assert!(
        scan.iter().all(|d| d.id != second),
        "decommissioned device must not be re-offered the second deployment"
    );
}

#[tokio::test]
async fn abort_deployment_finishes_even_with_no_device_deployments() {
    let catalog = Arc::new(SqliteCatalogStore::new_in_memory().await.unwrap());
    let sm = StateMachine { catalog: catalog.clone(), workflows: Arc::new(NullWorkflows) };
    let ctx = TenantContext::new("acme");

    let deployment_id = new_deployment(&catalog, &ctx.tenant, "empty-wave", "dev-absent").await;
    sm.abort_deployment(deployment_id).await.unwrap();

    let deployment = catalog.find_deployment_by_id(deployment_id).await.unwrap().unwrap();
    assert_eq!(deployment.status, fleet_common::DeploymentStatus::Finished);
    assert!(deployment.aborted);
}

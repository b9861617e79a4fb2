//! Integration-style tests of the dispatch engine (spec §4.2), wired
//! against the real SQLite catalog and local object store rather than
//! mocks, the way the teacher's higher-level tests exercise
//! `Persistence` directly instead of stubbing it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use fleet_common::{
    ArtifactMeta, DeviceDeploymentStatus, DeviceProvides, DeploymentType, PollRequest,
};
use fleet_deployer::catalog::{CatalogStore, NewArtifact, NewDeployment, SqliteCatalogStore};
use fleet_deployer::config::CoreConfig;
use fleet_deployer::dispatch::Dispatch;
use fleet_deployer::error::Error;
use fleet_deployer::objectstore::local::LocalObjectStore;
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

fn artifact_meta(name: &str, device_type: &str) -> ArtifactMeta {
    ArtifactMeta {
        name: name.to_string(),
        description: None,
        format: "fleet-artifact".into(),
        format_version: 3,
        device_types_compatible: vec![device_type.to_string()],
        depends: BTreeMap::new(),
        provides: BTreeMap::new(),
        clears_provides: vec![],
        updates: vec![],
        signed: false,
    }
}

fn provides(device_type: &str, installed: Option<&str>) -> DeviceProvides {
    DeviceProvides {
        device_type: device_type.to_string(),
        artifact_name: installed.map(str::to_string),
        custom: BTreeMap::new(),
    }
}

async fn setup() -> (Dispatch, Arc<SqliteCatalogStore>, TenantContext, tempfile::TempDir) {
    let catalog = Arc::new(SqliteCatalogStore::new_in_memory().await.unwrap());
    let tmp = tempfile::tempdir().unwrap();
    let object_store = Arc::new(LocalObjectStore::new(tmp.path(), b"test-signing-key".to_vec()));
    let dispatch = Dispatch {
        catalog: catalog.clone(),
        object_store,
        workflows: Arc::new(NullWorkflows),
        config: CoreConfig::default(),
    };
    (dispatch, catalog, TenantContext::new("acme"), tmp)
}

#[tokio::test]
async fn poll_assigns_artifact_and_issues_signed_url() {
    let (dispatch, catalog, ctx, _tmp) = setup().await;

    let artifact_id = catalog
        .insert_artifact(NewArtifact {
            id: Uuid::new_v4(),
            tenant: ctx.tenant.clone(),
            meta: artifact_meta("app-1.0", "raspberrypi4"),
        })
        .await
        .unwrap();

    catalog
        .insert_deployment(NewDeployment {
            id: Uuid::new_v4(),
            tenant: ctx.tenant.clone(),
            name: "rollout".into(),
            artifact_name: "app-1.0".into(),
            configuration: None,
            device_list: vec!["dev-1".into()],
            max_devices: 1,
            artifact_id_candidates: vec![],
            groups: vec![],
            deployment_type: DeploymentType::Software,
            force_installation: false,
        })
        .await
        .unwrap();

    let request = PollRequest { device_provides: provides("raspberrypi4", None) };
    let response = dispatch
        .get_deployment_for_device_with_current(&ctx, "dev-1", request)
        .await
        .unwrap()
        .expect("a deployment should be dispatched");

    assert_eq!(response.kind, DeploymentType::Software);
    assert_eq!(response.artifact.artifact_name, "app-1.0");
    assert!(!response.artifact.source.uri.is_empty());

    let dd = catalog
        .find_oldest_active_device_deployment(&ctx.tenant, "dev-1")
        .await
        .unwrap()
        .expect("device-deployment should still be active (pending)");
    assert_eq!(dd.assigned_artifact, Some(artifact_id));
}

#[tokio::test]
async fn poll_with_no_matching_artifact_reports_no_artifact() {
    let (dispatch, catalog, ctx, _tmp) = setup().await;

    catalog
        .insert_deployment(NewDeployment {
            id: Uuid::new_v4(),
            tenant: ctx.tenant.clone(),
            name: "rollout".into(),
            artifact_name: "nonexistent".into(),
            configuration: None,
            device_list: vec!["dev-2".into()],
            max_devices: 1,
            artifact_id_candidates: vec![],
            groups: vec![],
            deployment_type: DeploymentType::Software,
            force_installation: false,
        })
        .await
        .unwrap();

    let request = PollRequest { device_provides: provides("raspberrypi4", None) };
    let response = dispatch
        .get_deployment_for_device_with_current(&ctx, "dev-2", request)
        .await
        .unwrap();
    assert!(response.is_none());

    let dd = catalog.get_device_deployment(
        catalog
            .find_latest_inactive_device_deployment(&ctx.tenant, "dev-2")
            .await
            .unwrap()
            .unwrap()
            .id,
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(dd.status, DeviceDeploymentStatus::NoArtifact);
}

#[tokio::test]
async fn poll_already_installed_short_circuits() {
    let (dispatch, catalog, ctx, _tmp) = setup().await;

    catalog
        .insert_artifact(NewArtifact {
            id: Uuid::new_v4(),
            tenant: ctx.tenant.clone(),
            meta: artifact_meta("app-1.0", "raspberrypi4"),
        })
        .await
        .unwrap();

    catalog
        .insert_deployment(NewDeployment {
            id: Uuid::new_v4(),
            tenant: ctx.tenant.clone(),
            name: "rollout".into(),
            artifact_name: "app-1.0".into(),
            configuration: None,
            device_list: vec!["dev-3".into()],
            max_devices: 1,
            artifact_id_candidates: vec![],
            groups: vec![],
            deployment_type: DeploymentType::Software,
            force_installation: false,
        })
        .await
        .unwrap();

    let request = PollRequest { device_provides: provides("raspberrypi4", Some("app-1.0")) };
    let response = dispatch
        .get_deployment_for_device_with_current(&ctx, "dev-3", request)
        .await
        .unwrap();
    assert!(response.is_none(), "already-installed devices get no further instruction");

    let dd = catalog
        .find_latest_inactive_device_deployment(&ctx.tenant, "dev-3")
        .await
        .unwrap()
        .expect("device-deployment should now be terminal");
    assert_eq!(dd.status, DeviceDeploymentStatus::AlreadyInstalled);
}

#[tokio::test]
async fn conflicting_device_provides_fails_the_device_deployment() {
    let (dispatch, catalog, ctx, _tmp) = setup().await;

    catalog
        .insert_artifact(NewArtifact {
            id: Uuid::new_v4(),
            tenant: ctx.tenant.clone(),
            meta: artifact_meta("app-1.0", "raspberrypi4"),
        })
        .await
        .unwrap();

    catalog
        .insert_deployment(NewDeployment {
            id: Uuid::new_v4(),
            tenant: ctx.tenant.clone(),
            name: "rollout".into(),
            artifact_name: "app-1.0".into(),
            configuration: None,
            device_list: vec!["dev-4".into()],
            max_devices: 1,
            artifact_id_candidates: vec![],
            groups: vec![],
            deployment_type: DeploymentType::Software,
            force_installation: false,
        })
        .await
        .unwrap();

    let first = PollRequest { device_provides: provides("raspberrypi4", None) };
    dispatch
        .get_deployment_for_device_with_current(&ctx, "dev-4", first)
        .await
        .unwrap();

    let second = PollRequest { device_provides: provides("raspberrypi3", None) };
    let err = dispatch
        .get_deployment_for_device_with_current(&ctx, "dev-4", second)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConflictingRequestData { .. }));
}

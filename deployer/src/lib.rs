//! The fleet deployer core: artifact ingestion, deployment dispatch, and
//! the device-deployment state machine, composed behind one entry point
//! the way `DeployerService` wires together `DeploymentManager` and
//! `Persistence` for the teacher's build pipeline.

pub mod catalog;
pub mod config;
pub mod deployment;
pub mod dispatch;
pub mod error;
pub mod ingestion;
pub mod inventory;
pub mod objectstore;
pub mod parser;
pub mod state_machine;
pub mod tenant;
pub mod workflows;

use std::sync::Arc;

use uuid::Uuid;

use fleet_common::PollRequest;

pub use error::{Error, Result};

use catalog::CatalogStore;
use config::CoreConfig;
use deployment::{DeploymentCreation, NewDeploymentRequest};
use dispatch::Dispatch;
use ingestion::Ingestion;
use ingestion::pipe::SourceStream;
use inventory::InventoryClient;
use objectstore::ObjectStore;
use parser::ArtifactParser;
use state_machine::StateMachine;
use tenant::TenantContext;
use workflows::WorkflowsClient;

/// The composed core, holding one `Arc` of each adapter plus typed
/// configuration. Each subsystem (`Ingestion`, `Dispatch`,
/// `StateMachine`) only needs a subset of the adapters, so `Core`
/// assembles them once and hands out the already-wired subsystem.
pub struct Core {
    pub catalog: Arc<dyn CatalogStore>,
    pub object_store: Arc<dyn ObjectStore>,
    pub parser: Arc<dyn ArtifactParser>,
    pub inventory: Arc<dyn InventoryClient>,
    pub workflows: Arc<dyn WorkflowsClient>,
    pub config: CoreConfig,
}

impl Core {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        object_store: Arc<dyn ObjectStore>,
        parser: Arc<dyn ArtifactParser>,
        inventory: Arc<dyn InventoryClient>,
        workflows: Arc<dyn WorkflowsClient>,
        config: CoreConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            object_store,
            parser,
            inventory,
            workflows,
            config,
        })
    }

    pub fn ingestion(self: &Arc<Self>) -> Arc<Ingestion> {
        Arc::new(Ingestion {
            catalog: self.catalog.clone(),
            object_store: self.object_store.clone(),
            parser: self.parser.clone(),
            workflows: self.workflows.clone(),
            config: self.config.clone(),
        })
    }

    pub fn dispatch(&self) -> Dispatch {
        Dispatch {
            catalog: self.catalog.clone(),
            object_store: self.object_store.clone(),
            workflows: self.workflows.clone(),
            config: self.config.clone(),
        }
    }

    pub fn state_machine(&self) -> StateMachine {
        StateMachine {
            catalog: self.catalog.clone(),
            workflows: self.workflows.clone(),
        }
    }

    pub fn deployment_creation(&self) -> DeploymentCreation {
        DeploymentCreation {
            catalog: self.catalog.clone(),
            inventory: self.inventory.clone(),
            config: self.config.clone(),
        }
    }

    /// Convenience wrapper a poll handler calls directly: dispatch the
    /// device's next deployment, if any (spec §4.2).
    pub async fn poll(
        &self,
        ctx: &TenantContext,
        device_id: &str,
        request: PollRequest,
    ) -> Result<Option<fleet_common::PollResponse>> {
        self.dispatch()
            .get_deployment_for_device_with_current(ctx, device_id, request)
            .await
    }

    /// Ingests an artifact directly from a multipart upload stream
    /// (spec §4.1 `CreateImage`).
    pub async fn create_image(
        self: &Arc<Self>,
        ctx: &TenantContext,
        artifact_id: Option<Uuid>,
        description: Option<String>,
        stream: SourceStream,
    ) -> Result<Uuid> {
        self.ingestion().create_image(ctx, artifact_id, description, stream).await
    }

    /// Creates a deployment, expanding a group or "all devices" target
    /// into an explicit device list (spec §3 `CreateDeployment`).
    pub async fn create_deployment(&self, ctx: &TenantContext, req: NewDeploymentRequest) -> Result<Uuid> {
        self.deployment_creation().create_deployment(ctx, req).await
    }

    /// Edits an artifact's description (spec §3 `EditImage`).
    pub async fn edit_image(
        self: &Arc<Self>,
        artifact_id: Uuid,
        description: Option<String>,
    ) -> Result<()> {
        self.ingestion().edit_image(artifact_id, description).await
    }

    /// Deletes an artifact, if unreferenced (spec §3 `DeleteImage`).
    pub async fn delete_image(self: &Arc<Self>, ctx: &TenantContext, artifact_id: Uuid) -> Result<()> {
        self.ingestion().delete_image(ctx, artifact_id).await
    }

    /// Advances a device-deployment's status (spec §4.3
    /// `UpdateDeviceDeploymentStatus`).
    pub async fn update_device_deployment_status(
        &self,
        ctx: &TenantContext,
        device_deployment_id: Uuid,
        new_status: fleet_common::DeviceDeploymentStatus,
    ) -> Result<()> {
        self.state_machine()
            .update_device_deployment_status(ctx, device_deployment_id, new_status)
            .await
    }

    /// Aborts a whole deployment (spec §4.3 `AbortDeployment`).
    pub async fn abort_deployment(&self, deployment_id: Uuid) -> Result<()> {
        self.state_machine().abort_deployment(deployment_id).await
    }

    /// Decommissions a device: terminates its active device-deployment
    /// and pre-empts every newer pending one (spec §4.3).
    pub async fn decommission_device(&self, ctx: &TenantContext, device_id: &str) -> Result<()> {
        self.state_machine().decommission(ctx, device_id).await
    }

    /// Resolves a group's member devices at deployment-creation time
    /// (spec §4.4 inventory/reporting adapter).
    pub async fn search_devices(
        &self,
        ctx: &TenantContext,
        params: inventory::SearchParams,
    ) -> Result<inventory::SearchResult> {
        Ok(self.inventory.search(&ctx.tenant, params).await?)
    }
}

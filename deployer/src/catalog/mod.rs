//! The catalog store contract from spec §4.4: typed operations on the
//! persistent document store, kept here as an adapter trait the way
//! `deployer/src/persistence/mod.rs`'s `Persistence` is the one concrete
//! implementation behind a narrower API surface. The concrete store lives
//! in `sqlite` — SQLite is the teacher's own persistence backend
//! (`sqlx` + `SqlitePool`), reused as-is rather than swapped for a
//! document store, since `sqlx`'s JSON column support covers the
//! document-shaped fields (`stats`, `device_list`, `depends`/`provides`)
//! this spec actually needs.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use fleet_common::{
    Artifact, ArtifactMeta, DependsConflict, Deployment, DeviceDeploymentStatus, DeviceProvides,
    StatusCounters,
};

use crate::tenant::TenantStorageSettings;

pub use sqlite::SqliteCatalogStore;

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("artifact with this name and an overlapping device type already exists")]
    ArtifactNotUnique,
    #[error("conflicting depends: {0:?}")]
    ConflictingDepends(DependsConflict),
    #[error("a deployment with this name already exists")]
    DuplicateDeployment,
    #[error("artifact {0} not found")]
    ImageMetaNotFound(Uuid),
    #[error("deployment {0} not found")]
    DeploymentNotFound(Uuid),
    #[error("upload intent {0} not found")]
    UploadNotFound(Uuid),
    #[error("storage record not found")]
    StorageNotFound,
    #[error("backing store error: {0}")]
    Backend(#[from] sqlx::Error),
}

#[derive(Clone, Debug)]
pub struct NewArtifact {
    pub id: Uuid,
    pub tenant: String,
    pub meta: ArtifactMeta,
}

#[derive(Clone, Debug, Default)]
pub struct ArtifactFilter {
    pub tenant: String,
    pub name: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NewDeployment {
    pub id: Uuid,
    pub tenant: String,
    pub name: String,
    pub artifact_name: String,
    pub configuration: Option<serde_json::Value>,
    pub device_list: Vec<String>,
    pub max_devices: u64,
    pub artifact_id_candidates: Vec<Uuid>,
    pub groups: Vec<String>,
    pub deployment_type: fleet_common::DeploymentType,
    pub force_installation: bool,
}

#[derive(Clone, Debug, Default)]
pub struct DeploymentQuery {
    pub tenant: String,
    pub name: Option<String>,
    pub status: Option<fleet_common::DeploymentStatus>,
}

#[derive(Clone, Debug)]
pub struct NewDeviceDeployment {
    pub id: Uuid,
    pub tenant: String,
    pub device_id: String,
    pub deployment_id: Uuid,
    pub status: DeviceDeploymentStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
#[cfg_attr(feature = "persist", derive(sqlx::Type))]
#[strum(serialize_all = "snake_case")]
pub enum UploadIntentStatus {
    Pending,
    Processing,
    Completed,
    Aborted,
}

#[derive(Clone, Debug)]
pub struct UploadIntent {
    pub artifact_id: Uuid,
    pub tenant: String,
    pub status: UploadIntentStatus,
    pub issued_at: DateTime<Utc>,
    pub skip_verify: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeviceDeployment {
    pub id: Uuid,
    pub tenant: String,
    pub device_id: String,
    pub deployment_id: Uuid,
    pub status: DeviceDeploymentStatus,
    pub active: bool,
    pub assigned_artifact: Option<Uuid>,
    pub device_type_at_assignment: Option<String>,
    pub last_provides: Option<DeviceProvides>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tombstoned: bool,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    // --- Artifacts ---
    async fn insert_artifact(&self, artifact: NewArtifact) -> Result<Uuid, CatalogError>;
    async fn find_artifact_by_id(&self, id: Uuid) -> Result<Option<Artifact>, CatalogError>;
    async fn image_by_name_and_device_type(
        &self,
        tenant: &str,
        name: &str,
        device_type: &str,
    ) -> Result<Option<Artifact>, CatalogError>;
    async fn image_by_ids_and_device_type(
        &self,
        ids: &[Uuid],
        device_type: &str,
    ) -> Result<Option<Artifact>, CatalogError>;
    async fn list_images(&self, filter: ArtifactFilter) -> Result<Vec<Artifact>, CatalogError>;
    async fn delete_image(&self, id: Uuid) -> Result<(), CatalogError>;
    /// The only field `EditImage` may change (spec §3: an artifact's
    /// other fields are fixed once ingested).
    async fn update_artifact_description(
        &self,
        id: Uuid,
        description: Option<String>,
    ) -> Result<(), CatalogError>;
    async fn is_artifact_unique(
        &self,
        tenant: &str,
        name: &str,
        device_types: &[String],
    ) -> Result<bool, CatalogError>;
    async fn exist_unfinished_by_artifact_id(&self, id: Uuid) -> Result<bool, CatalogError>;
    async fn exist_unfinished_by_artifact_name(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<bool, CatalogError>;
    async fn exist_assigned_image_with_id_and_statuses(
        &self,
        id: Uuid,
        statuses: &[DeviceDeploymentStatus],
    ) -> Result<bool, CatalogError>;
    async fn images_by_name(&self, tenant: &str, name: &str) -> Result<Vec<Artifact>, CatalogError>;

    // --- Deployments ---
    async fn insert_deployment(&self, deployment: NewDeployment) -> Result<Uuid, CatalogError>;
    async fn find_deployment_by_id(&self, id: Uuid) -> Result<Option<Deployment>, CatalogError>;
    async fn find_unfinished_by_id(&self, id: Uuid) -> Result<Option<Deployment>, CatalogError>;
    async fn find(&self, query: DeploymentQuery) -> Result<Vec<Deployment>, CatalogError>;
    async fn find_newer_active_deployments(
        &self,
        tenant: &str,
        after: DateTime<Utc>,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Deployment>, CatalogError>;
    async fn set_deployment_status(
        &self,
        id: Uuid,
        status: fleet_common::DeploymentStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), CatalogError>;
    async fn device_count_by_deployment(&self, id: Uuid) -> Result<u64, CatalogError>;
    async fn set_deployment_device_count(&self, id: Uuid, count: u64) -> Result<(), CatalogError>;
    async fn increment_deployment_total_size(&self, id: Uuid, delta: u64) -> Result<(), CatalogError>;
    async fn update_stats(&self, id: Uuid, stats: StatusCounters) -> Result<(), CatalogError>;
    /// Atomic: decrements `old` (if any), increments `new`, in one write.
    async fn update_stats_inc(
        &self,
        id: Uuid,
        old: Option<DeviceDeploymentStatus>,
        new: DeviceDeploymentStatus,
    ) -> Result<(), CatalogError>;
    async fn abort_device_deployments(&self, deployment_id: Uuid) -> Result<Vec<DeviceDeployment>, CatalogError>;
    async fn update_deployments_with_artifact_name(
        &self,
        tenant: &str,
        artifact_name: &str,
        artifact_id: Uuid,
    ) -> Result<(), CatalogError>;

    // --- Device-deployments ---
    /// Returns the record and whether this call created it (`false` if a
    /// concurrent insert already won — spec §5 "materialize is idempotent").
    async fn insert_device_deployment(
        &self,
        dd: NewDeviceDeployment,
    ) -> Result<(DeviceDeployment, bool), CatalogError>;
    async fn get_device_deployment(&self, id: Uuid) -> Result<Option<DeviceDeployment>, CatalogError>;
    async fn find_oldest_active_device_deployment(
        &self,
        tenant: &str,
        device_id: &str,
    ) -> Result<Option<DeviceDeployment>, CatalogError>;
    async fn find_latest_inactive_device_deployment(
        &self,
        tenant: &str,
        device_id: &str,
    ) -> Result<Option<DeviceDeployment>, CatalogError>;
    /// Returns the previous status atomically alongside the write.
    async fn update_device_deployment_status(
        &self,
        id: Uuid,
        new_status: DeviceDeploymentStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<DeviceDeploymentStatus, CatalogError>;
    async fn save_device_deployment_request(
        &self,
        id: Uuid,
        provides: DeviceProvides,
    ) -> Result<(), CatalogError>;
    async fn assign_artifact(
        &self,
        id: Uuid,
        artifact_id: Uuid,
        device_type: &str,
    ) -> Result<(), CatalogError>;
    async fn aggregate_device_deployment_by_status(
        &self,
        deployment_id: Uuid,
    ) -> Result<StatusCounters, CatalogError>;
    async fn save_last_device_deployment_status(
        &self,
        tenant: &str,
        device_id: &str,
        deployment_id: Uuid,
        device_deployment_id: Uuid,
        status: DeviceDeploymentStatus,
    ) -> Result<(), CatalogError>;
    /// Tombstones every device-deployment for this device and returns the
    /// affected records, so the caller can fire a batch reindex over them.
    async fn delete_device_deployments_history(
        &self,
        tenant: &str,
        device_id: &str,
    ) -> Result<Vec<DeviceDeployment>, CatalogError>;
    async fn find_newer_pending_deployments_for_device(
        &self,
        tenant: &str,
        device_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<Deployment>, CatalogError>;

    // --- Upload intents ---
    async fn insert_upload_intent(&self, intent: UploadIntent) -> Result<(), CatalogError>;
    async fn get_upload_intent(&self, id: Uuid) -> Result<Option<UploadIntent>, CatalogError>;
    async fn update_upload_intent_status(
        &self,
        id: Uuid,
        expected: UploadIntentStatus,
        new: UploadIntentStatus,
    ) -> Result<(), CatalogError>;
    async fn touch_upload_intent(&self, id: Uuid) -> Result<(), CatalogError>;

    // --- Storage settings ---
    async fn get_storage_settings(
        &self,
        tenant: &str,
    ) -> Result<Option<TenantStorageSettings>, CatalogError>;
    async fn set_storage_settings(
        &self,
        tenant: &str,
        settings: TenantStorageSettings,
    ) -> Result<(), CatalogError>;

    // --- Limits ---
    async fn get_limit(&self, name: &str) -> Result<Option<i64>, CatalogError>;
    async fn set_limit(&self, name: &str, value: i64) -> Result<(), CatalogError>;
}

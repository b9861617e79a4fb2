//! The error taxonomy from spec §7, as a single `thiserror` enum the way
//! `deployer/src/error.rs` wraps its `DalError`. Every adapter gets its
//! own error type and is folded in with `#[from]`.

use fleet_common::DependsConflict;
use uuid::Uuid;

use crate::catalog::CatalogError;
use crate::inventory::InventoryError;
use crate::objectstore::ObjectStoreError;
use crate::parser::ParseError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    // --- Input / validation ---
    #[error("missing required input: {0}")]
    MissingInput(String),
    #[error("artifact metadata is invalid: {0}")]
    MetadataInvalid(String),
    #[error("invalid device id: {0}")]
    InvalidDeviceId(String),
    #[error("invalid deployment id: {0}")]
    InvalidDeploymentId(String),
    #[error("artifact file too large: {size} bytes exceeds the {limit} byte limit")]
    ArtifactFileTooLarge { size: u64, limit: u64 },
    #[error("no devices resolved for this deployment")]
    NoDevices,
    #[error("no artifact supplied")]
    NoArtifact,

    // --- Conflict ---
    #[error("an artifact with this name and an overlapping device type already exists")]
    ArtifactNotUnique,
    #[error("conflicting depends declared by {}: {}", .0.competing_artifact_name, .0.depends_key)]
    ConflictingDepends(DependsConflict),
    #[error("a deployment with this name already exists")]
    DuplicateDeployment,
    #[error("artifact {0} is referenced by an unfinished deployment or an active device-deployment")]
    ArtifactInUse(Uuid),
    #[error("device {device_id} reported conflicting request data for device-deployment {device_deployment_id}")]
    ConflictingRequestData {
        device_id: String,
        device_deployment_id: Uuid,
    },

    // --- Not found ---
    #[error("artifact {0} not found")]
    ImageMetaNotFound(Uuid),
    #[error("deployment {0} not found")]
    DeploymentNotFound(Uuid),
    #[error("upload intent {0} not found")]
    UploadNotFound(Uuid),
    #[error("storage record not found")]
    StorageNotFound,

    // --- Terminal state ---
    #[error("deployment {0} has been aborted")]
    DeploymentAborted(Uuid),
    #[error("device {0} has been decommissioned for this deployment")]
    DeviceDecommissioned(String),

    // --- Parse ---
    #[error("failed to parse artifact: {0}")]
    ParseFailed(#[from] ParseError),

    // --- Internal / adapter failures ---
    #[error("catalog store error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),
    #[error("inventory/reporting error: {0}")]
    Inventory(#[from] InventoryError),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

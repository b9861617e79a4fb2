use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::device_deployment::{DeviceDeploymentStatus, DeviceProvides};

/// What a device reports about itself when it polls (spec §6 "Poll request
/// body"): its claimed type, what it currently has installed, and its
/// opaque provides map.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PollRequest {
    pub device_provides: DeviceProvides,
}

impl PollRequest {
    pub fn claimed_device_type(&self) -> &str {
        &self.device_provides.device_type
    }

    pub fn installed_artifact_name(&self) -> Option<&str> {
        self.device_provides.artifact_name.as_deref()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ArtifactSource {
    pub uri: String,
    pub expire: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PollArtifact {
    pub id: String,
    pub artifact_name: String,
    pub source: ArtifactSource,
    pub device_types_compatible: Vec<String>,
}

/// The instruction handed back on a poll, or `None` for "no deployment"
/// (spec §6 "Poll response", §4.2).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PollResponse {
    pub id: Uuid,
    pub artifact: PollArtifact,
    #[serde(rename = "type")]
    pub kind: super::deployment::DeploymentType,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StatusUpdateRequest {
    pub status: DeviceDeploymentStatus,
    pub substate: Option<String>,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use super::device_deployment::StatusCounters;

#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Deserialize, Serialize)]
#[cfg_attr(feature = "persist", derive(sqlx::Type))]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Finished,
}

#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Deserialize, Serialize)]
#[cfg_attr(feature = "persist", derive(sqlx::Type))]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeploymentType {
    Software,
    Configuration,
}

/// How a deployment's target device-list was specified at creation time
/// (spec §6 "exactly one of the three targeting modes must be set").
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum DeploymentTarget {
    Devices(Vec<String>),
    Group(String),
    AllDevices,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Deployment {
    pub id: Uuid,
    pub tenant: String,
    pub name: String,
    pub artifact_name: String,
    pub configuration: Option<serde_json::Value>,
    pub device_list: Vec<String>,
    pub max_devices: u64,
    pub artifact_id_candidates: Vec<Uuid>,
    pub device_count: Option<u64>,
    pub stats: StatusCounters,
    pub status: DeploymentStatus,
    pub groups: Vec<String>,
    pub deployment_type: DeploymentType,
    pub force_installation: bool,
    pub total_size: u64,
    pub aborted: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Deployment {
    /// Sum over status buckets equals the number of device-deployments
    /// ever materialized for this deployment (spec §3 invariant).
    pub fn materialized_count(&self) -> i64 {
        self.stats.values().sum()
    }
}

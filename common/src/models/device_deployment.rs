use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Status lattice a device-deployment moves through. See spec §3
/// "Device-deployment status set".
#[derive(
    Clone, Copy, Debug, Display, EnumString, EnumIter, PartialEq, Eq, Hash, Deserialize, Serialize,
)]
#[cfg_attr(feature = "persist", derive(sqlx::Type))]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeviceDeploymentStatus {
    Pending,
    Downloading,
    Installing,
    Rebooting,
    PauseBeforeInstalling,
    PauseBeforeCommitting,
    PauseBeforeRebooting,
    Success,
    Failure,
    NoArtifact,
    AlreadyInstalled,
    Aborted,
    Decommissioned,
}

impl DeviceDeploymentStatus {
    /// All statuses, in a fixed order used to lay out per-deployment stat
    /// counters. Keep stable: it is the column order of the stats table.
    pub const ALL: [DeviceDeploymentStatus; 13] = [
        Self::Pending,
        Self::Downloading,
        Self::Installing,
        Self::Rebooting,
        Self::PauseBeforeInstalling,
        Self::PauseBeforeCommitting,
        Self::PauseBeforeRebooting,
        Self::Success,
        Self::Failure,
        Self::NoArtifact,
        Self::AlreadyInstalled,
        Self::Aborted,
        Self::Decommissioned,
    ];

    /// `active` on a device-deployment is true iff its status is one of these.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Pending
                | Self::Downloading
                | Self::Installing
                | Self::Rebooting
                | Self::PauseBeforeInstalling
                | Self::PauseBeforeCommitting
                | Self::PauseBeforeRebooting
        )
    }

    /// The "finished" helper from spec §3: every non-active status except
    /// `Rebooting`, which is only terminal once it yields to success/failure.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::Failure
                | Self::NoArtifact
                | Self::AlreadyInstalled
                | Self::Aborted
                | Self::Decommissioned
        )
    }
}

/// Counters keyed by status, as carried on a `Deployment`. Stored as
/// fixed columns in SQL (see `catalog::sqlite`); this map view is what
/// the rest of the core reasons about.
pub type StatusCounters = BTreeMap<DeviceDeploymentStatus, i64>;

pub fn empty_counters() -> StatusCounters {
    DeviceDeploymentStatus::ALL.into_iter().map(|s| (s, 0)).collect()
}

/// Artifact-format-v3 "provides" fingerprint a device reports on poll,
/// persisted onto the device-deployment on first contact (spec §4.2 step 4).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceProvides {
    pub device_type: String,
    pub artifact_name: Option<String>,
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

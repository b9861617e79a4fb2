use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Artifact-format-v3 dependency metadata: arbitrary key/value pairs a
/// device already provides, a device must provide for this artifact to
/// apply, and provides this artifact clears on install.
pub type ProvidesMap = std::collections::BTreeMap<String, String>;
pub type DependsMap = std::collections::BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct UpdateFile {
    pub name: String,
    pub size: u64,
    pub checksum: String,
    pub date: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct UpdateModule {
    #[serde(rename = "type")]
    pub kind: String,
    pub files: Vec<UpdateFile>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// The parsed shape of an artifact container, independent of persistence.
/// Produced by an `ArtifactParser` and the payload of `Artifact` once
/// stored.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ArtifactMeta {
    pub name: String,
    pub description: Option<String>,
    pub format: String,
    pub format_version: u32,
    pub device_types_compatible: Vec<String>,
    pub depends: DependsMap,
    pub provides: ProvidesMap,
    pub clears_provides: Vec<String>,
    pub updates: Vec<UpdateModule>,
    pub signed: bool,
}

impl ArtifactMeta {
    pub fn total_size(&self) -> u64 {
        self.updates
            .iter()
            .flat_map(|u| u.files.iter())
            .map(|f| f.size)
            .sum()
    }
}

/// A catalogued artifact, as returned by the catalog store.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Artifact {
    pub id: Uuid,
    pub tenant: String,
    pub meta: ArtifactMeta,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// A structured conflict descriptor for `ConflictingDepends`, naming the
/// competing artifact and which dependency index collided.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DependsConflict {
    pub competing_artifact_name: String,
    pub depends_key: String,
}

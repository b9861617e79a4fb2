//! Workflows adapter (spec §4.4): fire-and-forget notifications. Every
//! call here is logged and swallowed on failure by the core (spec §7
//! propagation policy) — the trait itself still returns a `Result` so a
//! caller that *does* want to observe failures (tests, metrics) can.

pub mod http;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

pub use self::http::HttpWorkflowsClient;

#[derive(thiserror::Error, Debug)]
pub enum WorkflowsError {
    #[error("workflows request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Clone, Debug, Serialize)]
pub struct GenerateArtifactMsg {
    pub tenant_id: String,
    pub name: String,
    pub device_types_compatible: Vec<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub args: Option<serde_json::Value>,
    pub staged_object_key: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReindexDeploymentItem {
    pub device_id: String,
    pub deployment_id: Uuid,
    pub device_deployment_id: Uuid,
}

#[async_trait]
pub trait WorkflowsClient: Send + Sync {
    async fn start_generate_artifact(&self, msg: GenerateArtifactMsg) -> Result<(), WorkflowsError>;
    async fn start_reindex_reporting(&self, device_id: &str) -> Result<(), WorkflowsError>;
    async fn start_reindex_reporting_deployment(
        &self,
        device_id: &str,
        deployment_id: Uuid,
        device_deployment_id: Uuid,
    ) -> Result<(), WorkflowsError>;
    async fn start_reindex_reporting_deployment_batch(
        &self,
        items: Vec<ReindexDeploymentItem>,
    ) -> Result<(), WorkflowsError>;
}

/// Calls `f` and logs+swallows any error, matching the teacher's
/// `remove_from_queue`/`build_failed` pattern of never surfacing adapter
/// failures as the caller's error (spec §7).
pub async fn fire_and_forget<F, Fut>(op: &str, f: F)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<(), WorkflowsError>>,
{
    if let Err(error) = f().await {
        tracing::warn!(operation = op, error = %error, "workflow notification failed");
    }
}

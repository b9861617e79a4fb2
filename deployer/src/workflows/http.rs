//! `reqwest`-backed `WorkflowsClient`, same shape as `inventory::http`.

use async_trait::async_trait;

use super::{GenerateArtifactMsg, ReindexDeploymentItem, WorkflowsClient, WorkflowsError};

#[derive(Clone)]
pub struct HttpWorkflowsClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpWorkflowsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, path: &str, body: impl serde::Serialize) -> Result<(), WorkflowsError> {
        self.client
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl WorkflowsClient for HttpWorkflowsClient {
    async fn start_generate_artifact(&self, msg: GenerateArtifactMsg) -> Result<(), WorkflowsError> {
        self.post("/api/v1/workflow/generate_artifact", msg).await
    }

    async fn start_reindex_reporting(&self, device_id: &str) -> Result<(), WorkflowsError> {
        self.post(
            "/api/v1/workflow/reindex_reporting",
            serde_json::json!({ "device_id": device_id }),
        )
        .await
    }

    async fn start_reindex_reporting_deployment(
        &self,
        device_id: &str,
        deployment_id: uuid::Uuid,
        device_deployment_id: uuid::Uuid,
    ) -> Result<(), WorkflowsError> {
        self.post(
            "/api/v1/workflow/reindex_reporting_deployment",
            serde_json::json!({
                "device_id": device_id,
                "deployment_id": deployment_id,
                "device_deployment_id": device_deployment_id,
            }),
        )
        .await
    }

    async fn start_reindex_reporting_deployment_batch(
        &self,
        items: Vec<ReindexDeploymentItem>,
    ) -> Result<(), WorkflowsError> {
        self.post(
            "/api/v1/workflow/reindex_reporting_deployment_batch",
            serde_json::json!({ "items": items }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn reindex_reporting_posts_device_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/workflow/reindex_reporting"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let client = HttpWorkflowsClient::new(server.uri());
        client.start_reindex_reporting("devA").await.unwrap();
    }

    #[tokio::test]
    async fn failure_surfaces_as_error_for_direct_callers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/workflow/reindex_reporting"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = HttpWorkflowsClient::new(server.uri());
        assert!(client.start_reindex_reporting("devA").await.is_err());
    }
}

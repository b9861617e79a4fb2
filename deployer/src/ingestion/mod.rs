//! Artifact ingestion pipeline (spec §4.1): `CreateImage`, `UploadLink`,
//! `CompleteUpload`, `GenerateImage`, all sharing the `pipe::run` core.

pub mod pipe;

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use fleet_common::{ArtifactMeta, DeviceDeploymentStatus};

use crate::catalog::{CatalogStore, NewArtifact, UploadIntent, UploadIntentStatus};
use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::objectstore::{artifact_key, staged_key, ObjectStore, SignedUrl};
use crate::parser::ArtifactParser;
use crate::tenant::TenantContext;
use crate::workflows::{fire_and_forget, GenerateArtifactMsg, WorkflowsClient};

use self::pipe::{PipelineError, SourceStream};

pub struct IngestedArtifact {
    pub id: Uuid,
    pub meta: ArtifactMeta,
}

pub struct Ingestion {
    pub catalog: Arc<dyn CatalogStore>,
    pub object_store: Arc<dyn ObjectStore>,
    pub parser: Arc<dyn ArtifactParser>,
    pub workflows: Arc<dyn WorkflowsClient>,
    pub config: CoreConfig,
}

impl Ingestion {
    #[instrument(skip(self, stream), fields(artifact_id))]
    pub async fn create_image(
        &self,
        ctx: &TenantContext,
        artifact_id: Option<Uuid>,
        description: Option<String>,
        stream: SourceStream,
    ) -> Result<Uuid> {
        let artifact_id = artifact_id.unwrap_or_else(Uuid::new_v4);
        tracing::Span::current().record("artifact_id", tracing::field::display(artifact_id));

        let key = artifact_key(&ctx.tenant, artifact_id);
        let outcome = match pipe::run(
            stream,
            self.parser.clone(),
            false,
            self.object_store.clone(),
            key.clone(),
            self.config.ingestion_pipe_buffer_bytes,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(PipelineError::Parse(e)) => return Err(Error::ParseFailed(e)),
            Err(other) => return Err(Error::Internal(other.to_string())),
        };

        self.validate_metadata(&outcome.meta)?;

        let mut meta = outcome.meta;
        meta.description = description.or(meta.description);

        let insert = self
            .catalog
            .insert_artifact(NewArtifact {
                id: artifact_id,
                tenant: ctx.tenant.clone(),
                meta: meta.clone(),
            })
            .await;

        let artifact_id = match insert {
            Ok(id) => id,
            Err(e) => {
                if let Err(cleanup_err) = self.object_store.delete_object(&key).await {
                    warn!(error = %cleanup_err, "failed to clean up staged object after insert failure");
                }
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .catalog
            .update_deployments_with_artifact_name(&ctx.tenant, &meta.name, artifact_id)
            .await
        {
            warn!(error = %e, "failed to retroactively attach artifact to pending deployments");
        }

        info!(%artifact_id, name = %meta.name, "artifact ingested");
        Ok(artifact_id)
    }

    /// `EditImage`: the only mutable artifact field is `description`,
    /// rejected once the artifact has been referenced by a deployment
    /// that hasn't finished yet (spec §3 Artifact lifecycle).
    #[instrument(skip(self))]
    pub async fn edit_image(&self, artifact_id: Uuid, description: Option<String>) -> Result<()> {
        if self.catalog.exist_unfinished_by_artifact_id(artifact_id).await? {
            return Err(Error::ArtifactInUse(artifact_id));
        }
        self.catalog.update_artifact_description(artifact_id, description).await?;
        info!(%artifact_id, "artifact description edited");
        Ok(())
    }

    /// `DeleteImage`: rejected while any unfinished deployment or any
    /// device-deployment in an active status still references the
    /// artifact (spec §3 invariant), otherwise removes both the catalog
    /// record and its backing blob.
    #[instrument(skip(self))]
    pub async fn delete_image(&self, ctx: &TenantContext, artifact_id: Uuid) -> Result<()> {
        if self.catalog.exist_unfinished_by_artifact_id(artifact_id).await? {
            return Err(Error::ArtifactInUse(artifact_id));
        }

        let active_statuses: Vec<DeviceDeploymentStatus> =
            DeviceDeploymentStatus::ALL.into_iter().filter(|s| s.is_active()).collect();
        if self
            .catalog
            .exist_assigned_image_with_id_and_statuses(artifact_id, &active_statuses)
            .await?
        {
            return Err(Error::ArtifactInUse(artifact_id));
        }

        self.catalog.delete_image(artifact_id).await?;
        self.object_store.delete_object(&artifact_key(&ctx.tenant, artifact_id)).await?;
        info!(%artifact_id, "artifact deleted");
        Ok(())
    }

    fn validate_metadata(&self, meta: &ArtifactMeta) -> Result<()> {
        if meta.name.trim().is_empty() {
            return Err(Error::MetadataInvalid("artifact name is empty".into()));
        }
        if meta.device_types_compatible.is_empty() {
            return Err(Error::MetadataInvalid("device_types_compatible is empty".into()));
        }
        if meta.format_version == 0 {
            return Err(Error::MetadataInvalid("format_version is unset".into()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn upload_link(
        &self,
        ctx: &TenantContext,
        expire: Duration,
        skip_verify: bool,
    ) -> Result<(Uuid, SignedUrl)> {
        let artifact_id = Uuid::new_v4();
        let key = staged_key(&ctx.tenant, artifact_id, skip_verify);
        let signed = self.object_store.put_request(&key, expire).await?;

        self.catalog
            .insert_upload_intent(UploadIntent {
                artifact_id,
                tenant: ctx.tenant.clone(),
                status: UploadIntentStatus::Pending,
                issued_at: Utc::now(),
                skip_verify,
            })
            .await?;

        Ok((artifact_id, signed))
    }

    /// Transitions the intent to `processing` and hands off the actual
    /// ingestion to a detached task whose context outlives the request
    /// that called this (spec §4.1, §5 "CompleteUpload concurrency").
    #[instrument(skip(self))]
    pub async fn complete_upload(
        self: &Arc<Self>,
        ctx: TenantContext,
        intent_id: Uuid,
        skip_verify: bool,
    ) -> Result<()> {
        self.catalog
            .update_upload_intent_status(intent_id, UploadIntentStatus::Pending, UploadIntentStatus::Processing)
            .await
            .map_err(|e| match e {
                crate::catalog::CatalogError::UploadNotFound(id) => Error::UploadNotFound(id),
                other => other.into(),
            })?;

        let key = staged_key(&ctx.tenant, intent_id, skip_verify);
        let this = self.clone();

        tokio::spawn(async move {
            this.run_detached_ingestion(ctx, intent_id, key).await;
        });

        Ok(())
    }

    async fn run_detached_ingestion(&self, ctx: TenantContext, intent_id: Uuid, key: String) {
        let heartbeat_interval = self.config.heartbeat_interval();
        let catalog = self.catalog.clone();
        let heartbeat_intent = intent_id;
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            loop {
                ticker.tick().await;
                if catalog.touch_upload_intent(heartbeat_intent).await.is_err() {
                    break;
                }
            }
        });

        let result = self.ingest_staged_blob(&ctx, intent_id, &key).await;
        heartbeat_handle.abort();

        let new_status = if result.is_ok() {
            UploadIntentStatus::Completed
        } else {
            UploadIntentStatus::Aborted
        };

        if let Err(e) = self
            .catalog
            .update_upload_intent_status(intent_id, UploadIntentStatus::Processing, new_status)
            .await
        {
            warn!(error = %e, "failed to finalize upload intent status");
        }

        if let Err(e) = result {
            warn!(error = %e, %intent_id, "detached ingestion failed");
        }
    }

    async fn ingest_staged_blob(&self, ctx: &TenantContext, intent_id: Uuid, key: &str) -> Result<()> {
        let stream = self.object_store.get_object(key).await.map_err(|e| match e {
            crate::objectstore::ObjectStoreError::ObjectNotFound => Error::UploadNotFound(intent_id),
            other => other.into(),
        })?;

        let outcome = pipe::run(
            stream,
            self.parser.clone(),
            false,
            self.object_store.clone(),
            artifact_key(&ctx.tenant, intent_id),
            self.config.ingestion_pipe_buffer_bytes,
        )
        .await
        .map_err(|e| match e {
            PipelineError::Parse(parse_err) => Error::ParseFailed(parse_err),
            other => Error::Internal(other.to_string()),
        })?;

        self.validate_metadata(&outcome.meta)?;

        self.catalog
            .insert_artifact(NewArtifact {
                id: intent_id,
                tenant: ctx.tenant.clone(),
                meta: outcome.meta.clone(),
            })
            .await?;

        if let Err(e) = self
            .catalog
            .update_deployments_with_artifact_name(&ctx.tenant, &outcome.meta.name, intent_id)
            .await
        {
            warn!(error = %e, "failed to retroactively attach artifact to pending deployments");
        }

        Ok(())
    }

    /// Stages a raw file, issues GET/DELETE URLs over it, and hands off
    /// generation to the workflows adapter (spec §4.1 `GenerateImage`).
    #[instrument(skip(self, stream))]
    pub async fn generate_image(
        &self,
        ctx: &TenantContext,
        name: String,
        device_types_compatible: Vec<String>,
        kind: String,
        args: Option<serde_json::Value>,
        stream: impl Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    ) -> Result<(SignedUrl, SignedUrl)> {
        let staging_id = Uuid::new_v4();
        let key = staged_key(&ctx.tenant, staging_id, false);

        self.object_store
            .put_object(&key, Box::pin(stream))
            .await
            .map_err(Error::from)?;

        let get_url = self
            .object_store
            .get_request(&key, &name, self.config.image_generation_expiry)
            .await?;
        let delete_url = self
            .object_store
            .delete_request(&key, self.config.image_generation_expiry)
            .await?;

        let msg = GenerateArtifactMsg {
            tenant_id: ctx.tenant.clone(),
            name,
            device_types_compatible,
            kind,
            args,
            staged_object_key: key,
        };
        let workflows = self.workflows.clone();
        fire_and_forget("start_generate_artifact", || async move {
            workflows.start_generate_artifact(msg).await
        })
        .await;

        Ok((get_url, delete_url))
    }
}

/// Adapts a synchronous `Read` (e.g. a multipart field) into the
/// `SourceStream` the pipeline expects. A consuming HTTP layer (out of
/// scope here) is the intended caller.
pub fn source_from_reader(mut reader: impl std::io::Read + Send + 'static) -> SourceStream {
    Box::pin(futures::stream::once(async move {
        let mut buf = Vec::new();
        match reader.read_to_end(&mut buf) {
            Ok(_) => Ok(Bytes::from(buf)),
            Err(e) => Err(e),
        }
    }))
}

pub fn cursor_source(bytes: Vec<u8>) -> SourceStream {
    source_from_reader(Cursor::new(bytes))
}

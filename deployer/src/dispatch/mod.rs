//! Deployment dispatch engine (spec §4.2): `GetDeploymentForDeviceWithCurrent`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use fleet_common::{DeploymentType, DeviceDeploymentStatus, PollArtifact, PollRequest, PollResponse};

use crate::catalog::{CatalogStore, DeviceDeployment};
use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::objectstore::{artifact_key, ObjectStore};
use crate::state_machine::StateMachine;
use crate::tenant::TenantContext;
use crate::workflows::WorkflowsClient;

pub struct Dispatch {
    pub catalog: Arc<dyn CatalogStore>,
    pub object_store: Arc<dyn ObjectStore>,
    pub workflows: Arc<dyn WorkflowsClient>,
    pub config: CoreConfig,
}

impl Dispatch {
    #[instrument(skip(self, request), fields(device_id = %device_id))]
    pub async fn get_deployment_for_device_with_current(
        &self,
        ctx: &TenantContext,
        device_id: &str,
        request: PollRequest,
    ) -> Result<Option<PollResponse>> {
        // Step 1: an active device-deployment already in flight wins outright.
        let dd = match self
            .catalog
            .find_oldest_active_device_deployment(&ctx.tenant, device_id)
            .await?
        {
            Some(dd) => dd,
            None => match self.materialize_new(ctx, device_id).await? {
                Some(dd) => dd,
                None => return Ok(None),
            },
        };

        self.serve(ctx, dd, device_id, request).await
    }

    /// Steps 2-3: establish the lower bound from the device's latest
    /// inactive record, then scan for the first applicable pending/
    /// in-progress deployment created after it.
    async fn materialize_new(&self, ctx: &TenantContext, device_id: &str) -> Result<Option<DeviceDeployment>> {
        let last_deployment = self
            .catalog
            .find_latest_inactive_device_deployment(&ctx.tenant, device_id)
            .await?
            .map(|dd| dd.created_at)
            .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap());

        let mut skip = 0i64;
        loop {
            let page = self
                .catalog
                .find_newer_active_deployments(
                    &ctx.tenant,
                    last_deployment,
                    skip,
                    self.config.deployment_scan_page_size,
                )
                .await?;
            if page.is_empty() {
                return Ok(None);
            }

            for deployment in &page {
                if deployment.device_list.iter().any(|d| d == device_id) {
                    let state_machine = StateMachine {
                        catalog: self.catalog.clone(),
                        workflows: self.workflows.clone(),
                    };
                    let (dd, _) = state_machine
                        .create_device_deployment(
                            ctx,
                            deployment.id,
                            device_id,
                            DeviceDeploymentStatus::Pending,
                        )
                        .await?;
                    return Ok(Some(dd));
                }
            }

            if (page.len() as i64) < self.config.deployment_scan_page_size {
                return Ok(None);
            }
            skip += self.config.deployment_scan_page_size;
        }
    }

    async fn serve(
        &self,
        ctx: &TenantContext,
        mut dd: DeviceDeployment,
        device_id: &str,
        request: PollRequest,
    ) -> Result<Option<PollResponse>> {
        let deployment = self
            .catalog
            .find_deployment_by_id(dd.deployment_id)
            .await?
            .ok_or(Error::DeploymentNotFound(dd.deployment_id))?;

        // Step 4: save or validate the device's reported identity.
        match &dd.last_provides {
            None => {
                self.catalog
                    .save_device_deployment_request(dd.id, request.device_provides.clone())
                    .await?;
                dd.last_provides = Some(request.device_provides.clone());
            }
            Some(previous) if *previous != request.device_provides => {
                let state_machine = StateMachine {
                    catalog: self.catalog.clone(),
                    workflows: self.workflows.clone(),
                };
                state_machine
                    .update_device_deployment_status(ctx, dd.id, DeviceDeploymentStatus::Failure)
                    .await?;
                return Err(Error::ConflictingRequestData {
                    device_id: device_id.to_string(),
                    device_deployment_id: dd.id,
                });
            }
            Some(_) => {}
        }

        // Step 5: configuration deployments short-circuit.
        if deployment.deployment_type == DeploymentType::Configuration {
            let synthetic_id = format!("{}{}", deployment.id, device_id);
            return Ok(Some(PollResponse {
                id: deployment.id,
                artifact: PollArtifact {
                    id: synthetic_id,
                    artifact_name: deployment.artifact_name.clone(),
                    source: fleet_common::ArtifactSource {
                        uri: String::new(),
                        expire: Utc::now(),
                    },
                    device_types_compatible: vec![request.claimed_device_type().to_string()],
                },
                kind: DeploymentType::Configuration,
            }));
        }

        let claimed_device_type = request.claimed_device_type().to_string();
        let device_type_changed = dd
            .device_type_at_assignment
            .as_deref()
            .is_some_and(|t| t != claimed_device_type);

        let mut new_assignment = false;
        if dd.assigned_artifact.is_none() || device_type_changed {
            let artifact = if !deployment.artifact_id_candidates.is_empty() {
                self.catalog
                    .image_by_ids_and_device_type(&deployment.artifact_id_candidates, &claimed_device_type)
                    .await?
            } else {
                self.catalog
                    .image_by_name_and_device_type(&ctx.tenant, &deployment.artifact_name, &claimed_device_type)
                    .await?
            };

            let Some(artifact) = artifact else {
                let state_machine = StateMachine {
                    catalog: self.catalog.clone(),
                    workflows: self.workflows.clone(),
                };
                state_machine
                    .update_device_deployment_status(ctx, dd.id, DeviceDeploymentStatus::NoArtifact)
                    .await?;
                return Ok(None);
            };

            self.catalog.assign_artifact(dd.id, artifact.id, &claimed_device_type).await?;
            dd.assigned_artifact = Some(artifact.id);
            dd.device_type_at_assignment = Some(claimed_device_type.clone());
            new_assignment = true;
        }

        let artifact_id = dd.assigned_artifact.expect("assigned above if absent");
        let artifact = self
            .catalog
            .find_artifact_by_id(artifact_id)
            .await?
            .ok_or(Error::ImageMetaNotFound(artifact_id))?;

        // Step 7: already-installed shortcut.
        if request.installed_artifact_name() == Some(deployment.artifact_name.as_str())
            && !deployment.force_installation
            && dd.status == DeviceDeploymentStatus::Pending
        {
            let state_machine = StateMachine {
                catalog: self.catalog.clone(),
                workflows: self.workflows.clone(),
            };
            state_machine
                .update_device_deployment_status(ctx, dd.id, DeviceDeploymentStatus::AlreadyInstalled)
                .await?;
            return Ok(None);
        }

        // Step 8: size accounting only fires on a fresh assignment (spec
        // §9 open question on size accounting — preserved as an
        // approximation, never decremented on reassignment).
        if new_assignment {
            self.catalog
                .increment_deployment_total_size(deployment.id, artifact.meta.total_size())
                .await?;
        }

        let key = artifact_key(&ctx.tenant, artifact_id);
        let signed = self
            .object_store
            .get_request(&key, &artifact.meta.name, self.config.update_download_expiry)
            .await?;

        info!(deployment_id = %deployment.id, %artifact_id, "dispatched update to device");

        Ok(Some(PollResponse {
            id: deployment.id,
            artifact: PollArtifact {
                id: artifact_id.to_string(),
                artifact_name: artifact.meta.name.clone(),
                source: fleet_common::ArtifactSource {
                    uri: signed.url,
                    expire: signed.expire,
                },
                device_types_compatible: artifact.meta.device_types_compatible.clone(),
            },
            kind: DeploymentType::Software,
        }))
    }
}

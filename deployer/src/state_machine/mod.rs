//! Device-deployment state machine & statistics aggregator (spec §4.3).
//! Every transition keeps the owning deployment's status counters
//! transactionally consistent and recomputes its terminal status the way
//! the teacher's `DeploymentManager` advances a build through `State`.

pub mod deploy_layer;

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use fleet_common::{DeploymentStatus, DeviceDeploymentStatus};

use crate::catalog::{CatalogStore, DeviceDeployment, NewDeviceDeployment};
use crate::error::{Error, Result};
use crate::tenant::TenantContext;
use crate::workflows::{ReindexDeploymentItem, WorkflowsClient};

pub struct StateMachine {
    pub catalog: Arc<dyn CatalogStore>,
    pub workflows: Arc<dyn WorkflowsClient>,
}

impl StateMachine {
    /// Materializes a device-deployment with `status` and keeps the
    /// owning deployment's stats, device-count, and overall status in
    /// sync. Returns the record and whether this call created it.
    #[instrument(skip(self, ctx), fields(device_deployment_id, status = %status))]
    pub async fn create_device_deployment(
        &self,
        ctx: &TenantContext,
        deployment_id: Uuid,
        device_id: &str,
        status: DeviceDeploymentStatus,
    ) -> Result<(DeviceDeployment, bool)> {
        let (dd, first_time) = self
            .catalog
            .insert_device_deployment(NewDeviceDeployment {
                id: Uuid::new_v4(),
                tenant: ctx.tenant.clone(),
                device_id: device_id.to_string(),
                deployment_id,
                status,
            })
            .await?;
        tracing::Span::current().record("device_deployment_id", tracing::field::display(dd.id));

        if !first_time {
            return Ok((dd, false));
        }

        self.catalog.update_stats_inc(deployment_id, None, status).await?;

        let count = self.catalog.device_count_by_deployment(deployment_id).await?;
        self.catalog.set_deployment_device_count(deployment_id, count).await?;

        self.recompute_deployment_status(deployment_id).await?;

        if status.is_terminal() {
            self.catalog
                .save_last_device_deployment_status(&ctx.tenant, device_id, deployment_id, dd.id, status)
                .await?;
            self.fire_reindex(device_id, deployment_id, dd.id).await;
        }

        info!(%deployment_id, device_deployment_id = %dd.id, %status, "device-deployment created");
        Ok((dd, true))
    }

    /// `UpdateDeviceDeploymentStatus`: the core per-report transition.
    #[instrument(skip(self, ctx), fields(device_deployment_id = %device_deployment_id, status = %new_status))]
    pub async fn update_device_deployment_status(
        &self,
        ctx: &TenantContext,
        device_deployment_id: Uuid,
        new_status: DeviceDeploymentStatus,
    ) -> Result<()> {
        let current = self
            .catalog
            .get_device_deployment(device_deployment_id)
            .await?
            .ok_or(Error::StorageNotFound)?;

        match current.status {
            DeviceDeploymentStatus::Aborted => return Err(Error::DeploymentAborted(current.deployment_id)),
            DeviceDeploymentStatus::Decommissioned => {
                return Err(Error::DeviceDecommissioned(current.device_id))
            }
            _ => {}
        }

        if current.status == new_status {
            return Ok(());
        }

        let finished_at = new_status.is_terminal().then(Utc::now);
        let previous = self
            .catalog
            .update_device_deployment_status(device_deployment_id, new_status, finished_at)
            .await?;

        self.catalog
            .update_stats_inc(current.deployment_id, Some(previous), new_status)
            .await?;

        self.recompute_deployment_status(current.deployment_id).await?;

        if new_status.is_terminal() {
            self.catalog
                .save_last_device_deployment_status(
                    &ctx.tenant,
                    &current.device_id,
                    current.deployment_id,
                    device_deployment_id,
                    new_status,
                )
                .await?;
            self.fire_reindex(&current.device_id, current.deployment_id, device_deployment_id)
                .await;
        }

        info!(deployment_id = %current.deployment_id, %device_deployment_id, from = %previous, to = %new_status, "status transition");
        Ok(())
    }

    /// Reload the deployment's stats and persist its recomputed overall
    /// status, per the three-way rule in spec §4.3.
    async fn recompute_deployment_status(&self, deployment_id: Uuid) -> Result<()> {
        let deployment = self
            .catalog
            .find_deployment_by_id(deployment_id)
            .await?
            .ok_or(Error::DeploymentNotFound(deployment_id))?;

        let non_pending_sum: i64 = deployment
            .stats
            .iter()
            .filter(|(s, _)| **s != DeviceDeploymentStatus::Pending)
            .map(|(_, c)| *c)
            .sum();
        let active_excluding_pending_sum: i64 = deployment
            .stats
            .iter()
            .filter(|(s, _)| s.is_active() && **s != DeviceDeploymentStatus::Pending)
            .map(|(_, c)| *c)
            .sum();

        // Order matters: pending, then in-progress, else finished (spec §4.3).
        let status = if non_pending_sum == 0 {
            DeploymentStatus::Pending
        } else if active_excluding_pending_sum > 0 && !deployment.aborted {
            DeploymentStatus::InProgress
        } else {
            DeploymentStatus::Finished
        };

        let finished_at = (status == DeploymentStatus::Finished).then(Utc::now);
        self.catalog.set_deployment_status(deployment_id, status, finished_at).await?;
        Ok(())
    }

    async fn fire_reindex(&self, device_id: &str, deployment_id: Uuid, device_deployment_id: Uuid) {
        if let Err(e) = self
            .workflows
            .start_reindex_reporting_deployment(device_id, deployment_id, device_deployment_id)
            .await
        {
            warn!(error = %e, %deployment_id, %device_deployment_id, "reindex notification failed");
        }
    }

    /// `AbortDeployment`: every not-yet-terminal device-deployment is
    /// marked aborted, stats are reaggregated from scratch, and the
    /// deployment is forced to `finished` regardless of what the
    /// recomputed counters would say (so a deployment with zero
    /// device-deployments still finishes).
    #[instrument(skip(self))]
    pub async fn abort_deployment(&self, deployment_id: Uuid) -> Result<()> {
        self.catalog.abort_device_deployments(deployment_id).await?;
        let stats = self.catalog.aggregate_device_deployment_by_status(deployment_id).await?;
        self.catalog.update_stats(deployment_id, stats).await?;
        self.catalog
            .set_deployment_status(deployment_id, DeploymentStatus::Finished, Some(Utc::now()))
            .await?;
        info!(%deployment_id, "deployment aborted");
        Ok(())
    }

    /// Per-device analogue of abort: forces the device's active
    /// device-deployment (if any) to `terminal_status`, then walks every
    /// newer pending/in-progress deployment that still names this device
    /// and pre-materializes a device-deployment already in that terminal
    /// status, so later polls never pick it up again.
    async fn terminate_device(
        &self,
        ctx: &TenantContext,
        device_id: &str,
        terminal_status: DeviceDeploymentStatus,
    ) -> Result<()> {
        debug_assert!(terminal_status.is_terminal());

        let active = self
            .catalog
            .find_oldest_active_device_deployment(&ctx.tenant, device_id)
            .await?;

        let since = if let Some(active) = &active {
            self.update_device_deployment_status(ctx, active.id, terminal_status).await?;
            active.created_at
        } else {
            self.catalog
                .find_latest_inactive_device_deployment(&ctx.tenant, device_id)
                .await?
                .map(|dd| dd.created_at)
                .unwrap_or_else(|| chrono::DateTime::<Utc>::from_timestamp(0, 0).unwrap())
        };

        let pending = self
            .catalog
            .find_newer_pending_deployments_for_device(&ctx.tenant, device_id, since)
            .await?;

        for deployment in pending {
            if deployment.device_list.iter().any(|d| d == device_id) {
                self.create_device_deployment(ctx, deployment.id, device_id, terminal_status)
                    .await?;
            }
        }

        Ok(())
    }

    #[instrument(skip(self, ctx))]
    pub async fn decommission(&self, ctx: &TenantContext, device_id: &str) -> Result<()> {
        self.terminate_device(ctx, device_id, DeviceDeploymentStatus::Decommissioned).await
    }

    #[instrument(skip(self, ctx))]
    pub async fn abort_device(&self, ctx: &TenantContext, device_id: &str) -> Result<()> {
        self.terminate_device(ctx, device_id, DeviceDeploymentStatus::Aborted).await
    }

    /// Soft-deletes every device-deployment for this device and fires a
    /// single batch reindex over the affected records.
    #[instrument(skip(self, ctx))]
    pub async fn delete_device_deployments_history(&self, ctx: &TenantContext, device_id: &str) -> Result<()> {
        let affected = self
            .catalog
            .delete_device_deployments_history(&ctx.tenant, device_id)
            .await?;

        if affected.is_empty() {
            return Ok(());
        }

        let items: Vec<ReindexDeploymentItem> = affected
            .iter()
            .map(|dd| ReindexDeploymentItem {
                device_id: dd.device_id.clone(),
                deployment_id: dd.deployment_id,
                device_deployment_id: dd.id,
            })
            .collect();

        if let Err(e) = self.workflows.start_reindex_reporting_deployment_batch(items).await {
            warn!(error = %e, %device_id, "batch reindex notification failed");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{NewDeployment, SqliteCatalogStore};
    use crate::tenant::TenantContext;
    use crate::workflows::{GenerateArtifactMsg, WorkflowsError};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingWorkflows {
        reindexed: Mutex<Vec<(String, Uuid, Uuid)>>,
    }

    #[async_trait]
    impl WorkflowsClient for RecordingWorkflows {
        async fn start_generate_artifact(&self, _msg: GenerateArtifactMsg) -> Result<(), WorkflowsError> {
            Ok(())
        }
        async fn start_reindex_reporting(&self, _device_id: &str) -> Result<(), WorkflowsError> {
            Ok(())
        }
        async fn start_reindex_reporting_deployment(
            &self,
            device_id: &str,
            deployment_id: Uuid,
            device_deployment_id: Uuid,
        ) -> Result<(), WorkflowsError> {
            self.reindexed
                .lock()
                .unwrap()
                .push((device_id.to_string(), deployment_id, device_deployment_id));
            Ok(())
        }
        async fn start_reindex_reporting_deployment_batch(
            &self,
            _items: Vec<ReindexDeploymentItem>,
        ) -> Result<(), WorkflowsError> {
            Ok(())
        }
    }

    async fn setup() -> (StateMachine, Arc<SqliteCatalogStore>, Arc<RecordingWorkflows>, TenantContext) {
        let catalog = Arc::new(SqliteCatalogStore::new_in_memory().await.unwrap());
        let workflows = Arc::new(RecordingWorkflows { reindexed: Mutex::new(Vec::new()) });
        let sm = StateMachine { catalog: catalog.clone(), workflows: workflows.clone() };
        (sm, catalog, workflows, TenantContext::new("acme"))
    }

    #[tokio::test]
    async fn create_then_success_recomputes_deployment_status() {
        let (sm, catalog, workflows, ctx) = setup().await;
        let deployment_id = catalog
            .insert_deployment(NewDeployment {
                id: Uuid::new_v4(),
                tenant: ctx.tenant.clone(),
                name: "rollout".into(),
                artifact_name: "app-1.0".into(),
                configuration: None,
                device_list: vec!["dev-1".into()],
                max_devices: 1,
                artifact_id_candidates: vec![],
                groups: vec![],
                deployment_type: fleet_common::DeploymentType::Software,
                force_installation: false,
            })
            .await
            .unwrap();

        let (dd, first_time) = sm
            .create_device_deployment(&ctx, deployment_id, "dev-1", DeviceDeploymentStatus::Pending)
            .await
            .unwrap();
        assert!(first_time);

        let deployment = catalog.find_deployment_by_id(deployment_id).await.unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Pending);

        sm.update_device_deployment_status(&ctx, dd.id, DeviceDeploymentStatus::Downloading)
            .await
            .unwrap();
        let deployment = catalog.find_deployment_by_id(deployment_id).await.unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::InProgress);

        sm.update_device_deployment_status(&ctx, dd.id, DeviceDeploymentStatus::Success)
            .await
            .unwrap();
        let deployment = catalog.find_deployment_by_id(deployment_id).await.unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Finished);
        assert!(deployment.finished_at.is_some());
        assert_eq!(workflows.reindexed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn aborted_device_deployment_rejects_further_transitions() {
        let (sm, catalog, _workflows, ctx) = setup().await;
        let deployment_id = catalog
            .insert_deployment(NewDeployment {
                id: Uuid::new_v4(),
                tenant: ctx.tenant.clone(),
                name: "rollout-2".into(),
                artifact_name: "app-1.0".into(),
                configuration: None,
                device_list: vec!["dev-2".into()],
                max_devices: 1,
                artifact_id_candidates: vec![],
                groups: vec![],
                deployment_type: fleet_common::DeploymentType::Software,
                force_installation: false,
            })
            .await
            .unwrap();

        let (dd, _) = sm
            .create_device_deployment(&ctx, deployment_id, "dev-2", DeviceDeploymentStatus::Pending)
            .await
            .unwrap();
        sm.update_device_deployment_status(&ctx, dd.id, DeviceDeploymentStatus::Aborted)
            .await
            .unwrap();

        let err = sm
            .update_device_deployment_status(&ctx, dd.id, DeviceDeploymentStatus::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeploymentAborted(_)));
    }

    #[tokio::test]
    async fn abort_deployment_finishes_even_with_no_device_deployments() {
        let (sm, catalog, _workflows, ctx) = setup().await;
        let deployment_id = catalog
            .insert_deployment(NewDeployment {
                id: Uuid::new_v4(),
                tenant: ctx.tenant.clone(),
                name: "empty-rollout".into(),
                artifact_name: "app-1.0".into(),
                configuration: None,
                device_list: vec![],
                max_devices: 0,
                artifact_id_candidates: vec![],
                groups: vec![],
                deployment_type: fleet_common::DeploymentType::Software,
                force_installation: false,
            })
            .await
            .unwrap();

        sm.abort_deployment(deployment_id).await.unwrap();
        let deployment = catalog.find_deployment_by_id(deployment_id).await.unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Finished);
    }
}

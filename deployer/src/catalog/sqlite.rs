//! `SqliteCatalogStore`: the one concrete `CatalogStore`, using raw SQL
//! through `sqlx::{query, query_as}` and `CREATE TABLE IF NOT EXISTS` run
//! on pool construction, the way `persistence/mod.rs::Persistence::from_pool`
//! does it. Document-shaped fields (`stats`, `device_list`,
//! `artifact_id_candidates`, artifact metadata) are stored as JSON text
//! columns rather than normalized, since `sqlx`'s query builder has no
//! native document type and this keeps the store's shape close to the
//! "document store" spec §2 describes.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{Sqlite, SqlitePool};
use sqlx::{migrate::MigrateDatabase, Row};
use uuid::Uuid;

use fleet_common::{
    Artifact, ArtifactMeta, DependsConflict, Deployment, DeploymentStatus, DeploymentType,
    DeviceDeploymentStatus, DeviceProvides, StatusCounters,
};

use crate::tenant::TenantStorageSettings;

use super::{
    ArtifactFilter, CatalogError, CatalogStore, DeploymentQuery, DeviceDeployment, NewArtifact,
    NewDeployment, NewDeviceDeployment, UploadIntent, UploadIntentStatus,
};

#[derive(Clone)]
pub struct SqliteCatalogStore {
    pool: SqlitePool,
}

impl SqliteCatalogStore {
    pub async fn new(path: &str) -> Result<Self, CatalogError> {
        if !Sqlite::database_exists(path).await.unwrap_or(false) {
            Sqlite::create_database(path).await?;
        }
        let pool = SqlitePool::connect(path).await?;
        Self::from_pool(pool).await
    }

    pub async fn new_in_memory() -> Result<Self, CatalogError> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, CatalogError> {
        sqlx::query(
            "
            CREATE TABLE IF NOT EXISTS artifacts (
                id TEXT PRIMARY KEY,
                tenant TEXT NOT NULL,
                name TEXT NOT NULL,
                meta_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                modified_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                tenant TEXT NOT NULL,
                name TEXT NOT NULL,
                artifact_name TEXT NOT NULL,
                configuration_json TEXT,
                device_list_json TEXT NOT NULL,
                max_devices INTEGER NOT NULL,
                artifact_id_candidates_json TEXT NOT NULL,
                device_count INTEGER,
                stats_json TEXT NOT NULL,
                status TEXT NOT NULL,
                groups_json TEXT NOT NULL,
                deployment_type TEXT NOT NULL,
                force_installation INTEGER NOT NULL,
                total_size INTEGER NOT NULL DEFAULT 0,
                aborted INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                finished_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS device_deployments (
                id TEXT PRIMARY KEY,
                tenant TEXT NOT NULL,
                device_id TEXT NOT NULL,
                deployment_id TEXT NOT NULL,
                status TEXT NOT NULL,
                assigned_artifact TEXT,
                device_type_at_assignment TEXT,
                last_provides_json TEXT,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER,
                tombstoned INTEGER NOT NULL DEFAULT 0,
                UNIQUE(device_id, deployment_id),
                FOREIGN KEY(deployment_id) REFERENCES deployments(id)
            );

            CREATE TABLE IF NOT EXISTS device_deployment_last_status (
                tenant TEXT NOT NULL,
                device_id TEXT NOT NULL,
                deployment_id TEXT NOT NULL,
                device_deployment_id TEXT NOT NULL,
                status TEXT NOT NULL,
                PRIMARY KEY (tenant, device_id)
            );

            CREATE TABLE IF NOT EXISTS upload_intents (
                artifact_id TEXT PRIMARY KEY,
                tenant TEXT NOT NULL,
                status TEXT NOT NULL,
                issued_at INTEGER NOT NULL,
                skip_verify INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS storage_settings (
                tenant TEXT PRIMARY KEY,
                bucket TEXT NOT NULL,
                region TEXT NOT NULL,
                access_key_id TEXT NOT NULL,
                secret_access_key TEXT NOT NULL,
                endpoint TEXT,
                token TEXT,
                force_path_style INTEGER NOT NULL,
                use_accelerate INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS limits (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            ",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

fn from_ts(v: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(v).unwrap_or_default()
}

fn status_enum<T: FromStr>(s: &str) -> Result<T, CatalogError> {
    T::from_str(s).map_err(|_| CatalogError::Backend(sqlx::Error::Decode("invalid enum value".into())))
}

fn artifact_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Artifact, CatalogError> {
    let meta_json: String = row.try_get("meta_json")?;
    let meta: ArtifactMeta =
        serde_json::from_str(&meta_json).map_err(|e| CatalogError::Backend(sqlx::Error::Decode(e.into())))?;
    Ok(Artifact {
        id: Uuid::parse_str(&row.try_get::<String, _>("id")?)
            .map_err(|e| CatalogError::Backend(sqlx::Error::Decode(e.into())))?,
        tenant: row.try_get("tenant")?,
        meta,
        created_at: from_ts(row.try_get("created_at")?),
        modified_at: from_ts(row.try_get("modified_at")?),
    })
}

fn deployment_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Deployment, CatalogError> {
    let device_list_json: String = row.try_get("device_list_json")?;
    let candidates_json: String = row.try_get("artifact_id_candidates_json")?;
    let stats_json: String = row.try_get("stats_json")?;
    let groups_json: String = row.try_get("groups_json")?;
    let configuration_json: Option<String> = row.try_get("configuration_json")?;
    let status: String = row.try_get("status")?;
    let deployment_type: String = row.try_get("deployment_type")?;

    let decode = |e: serde_json::Error| CatalogError::Backend(sqlx::Error::Decode(e.into()));

    Ok(Deployment {
        id: Uuid::parse_str(&row.try_get::<String, _>("id")?)
            .map_err(|e| CatalogError::Backend(sqlx::Error::Decode(e.into())))?,
        tenant: row.try_get("tenant")?,
        name: row.try_get("name")?,
        artifact_name: row.try_get("artifact_name")?,
        configuration: configuration_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(decode)?,
        device_list: serde_json::from_str(&device_list_json).map_err(decode)?,
        max_devices: row.try_get::<i64, _>("max_devices")? as u64,
        artifact_id_candidates: serde_json::from_str(&candidates_json).map_err(decode)?,
        device_count: row.try_get::<Option<i64>, _>("device_count")?.map(|v| v as u64),
        stats: serde_json::from_str::<BTreeMap<String, i64>>(&stats_json)
            .map_err(decode)?
            .into_iter()
            .filter_map(|(k, v)| DeviceDeploymentStatus::from_str(&k).ok().map(|s| (s, v)))
            .collect::<StatusCounters>(),
        status: status_enum(&status)?,
        groups: serde_json::from_str(&groups_json).map_err(decode)?,
        deployment_type: status_enum(&deployment_type)?,
        force_installation: row.try_get::<i64, _>("force_installation")? != 0,
        total_size: row.try_get::<i64, _>("total_size")? as u64,
        aborted: row.try_get::<i64, _>("aborted")? != 0,
        created_at: from_ts(row.try_get("created_at")?),
        finished_at: row.try_get::<Option<i64>, _>("finished_at")?.map(from_ts),
    })
}

fn device_deployment_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DeviceDeployment, CatalogError> {
    let status: DeviceDeploymentStatus = status_enum(&row.try_get::<String, _>("status")?)?;
    let assigned: Option<String> = row.try_get("assigned_artifact")?;
    let last_provides_json: Option<String> = row.try_get("last_provides_json")?;

    Ok(DeviceDeployment {
        id: Uuid::parse_str(&row.try_get::<String, _>("id")?)
            .map_err(|e| CatalogError::Backend(sqlx::Error::Decode(e.into())))?,
        tenant: row.try_get("tenant")?,
        device_id: row.try_get("device_id")?,
        deployment_id: Uuid::parse_str(&row.try_get::<String, _>("deployment_id")?)
            .map_err(|e| CatalogError::Backend(sqlx::Error::Decode(e.into())))?,
        status,
        active: status.is_active(),
        assigned_artifact: assigned
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| CatalogError::Backend(sqlx::Error::Decode(e.into())))?,
        device_type_at_assignment: row.try_get("device_type_at_assignment")?,
        last_provides: last_provides_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| CatalogError::Backend(sqlx::Error::Decode(e.into())))?,
        created_at: from_ts(row.try_get("created_at")?),
        started_at: row.try_get::<Option<i64>, _>("started_at")?.map(from_ts),
        finished_at: row.try_get::<Option<i64>, _>("finished_at")?.map(from_ts),
        tombstoned: row.try_get::<i64, _>("tombstoned")? != 0,
    })
}

#[async_trait::async_trait]
impl CatalogStore for SqliteCatalogStore {
    async fn insert_artifact(&self, artifact: NewArtifact) -> Result<Uuid, CatalogError> {
        if !self
            .is_artifact_unique(
                &artifact.tenant,
                &artifact.meta.name,
                &artifact.meta.device_types_compatible,
            )
            .await?
        {
            return Err(CatalogError::ArtifactNotUnique);
        }

        if artifact.meta.format_version == 3 {
            let siblings = self.images_by_name(&artifact.tenant, &artifact.meta.name).await?;
            for sibling in &siblings {
                for (key, value) in &artifact.meta.depends {
                    if let Some(existing) = sibling.meta.depends.get(key) {
                        if existing != value {
                            return Err(CatalogError::ConflictingDepends(DependsConflict {
                                competing_artifact_name: sibling.meta.name.clone(),
                                depends_key: key.clone(),
                            }));
                        }
                    }
                }
            }
        }

        let now = ts(Utc::now());
        let meta_json = serde_json::to_string(&artifact.meta)
            .map_err(|e| CatalogError::Backend(sqlx::Error::Decode(e.into())))?;

        sqlx::query(
            "INSERT INTO artifacts (id, tenant, name, meta_json, created_at, modified_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(artifact.id.to_string())
        .bind(&artifact.tenant)
        .bind(&artifact.meta.name)
        .bind(meta_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(artifact.id)
    }

    async fn find_artifact_by_id(&self, id: Uuid) -> Result<Option<Artifact>, CatalogError> {
        let row = sqlx::query("SELECT * FROM artifacts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(artifact_from_row).transpose()
    }

    async fn image_by_name_and_device_type(
        &self,
        tenant: &str,
        name: &str,
        device_type: &str,
    ) -> Result<Option<Artifact>, CatalogError> {
        let rows = sqlx::query("SELECT * FROM artifacts WHERE tenant = ? AND name = ?")
            .bind(tenant)
            .bind(name)
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let artifact = artifact_from_row(row)?;
            if artifact
                .meta
                .device_types_compatible
                .iter()
                .any(|t| t == device_type)
            {
                return Ok(Some(artifact));
            }
        }
        Ok(None)
    }

    async fn image_by_ids_and_device_type(
        &self,
        ids: &[Uuid],
        device_type: &str,
    ) -> Result<Option<Artifact>, CatalogError> {
        for id in ids {
            if let Some(artifact) = self.find_artifact_by_id(*id).await? {
                if artifact
                    .meta
                    .device_types_compatible
                    .iter()
                    .any(|t| t == device_type)
                {
                    return Ok(Some(artifact));
                }
            }
        }
        Ok(None)
    }

    async fn list_images(&self, filter: ArtifactFilter) -> Result<Vec<Artifact>, CatalogError> {
        let rows = match &filter.name {
            Some(name) => {
                sqlx::query("SELECT * FROM artifacts WHERE tenant = ? AND name = ?")
                    .bind(&filter.tenant)
                    .bind(name)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM artifacts WHERE tenant = ?")
                    .bind(&filter.tenant)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(artifact_from_row).collect()
    }

    async fn delete_image(&self, id: Uuid) -> Result<(), CatalogError> {
        sqlx::query("DELETE FROM artifacts WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_artifact_description(
        &self,
        id: Uuid,
        description: Option<String>,
    ) -> Result<(), CatalogError> {
        let mut artifact = self
            .find_artifact_by_id(id)
            .await?
            .ok_or(CatalogError::ImageMetaNotFound(id))?;
        artifact.meta.description = description;

        let meta_json = serde_json::to_string(&artifact.meta)
            .map_err(|e| CatalogError::Backend(sqlx::Error::Decode(e.into())))?;

        sqlx::query("UPDATE artifacts SET meta_json = ?, modified_at = ? WHERE id = ?")
            .bind(meta_json)
            .bind(ts(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_artifact_unique(
        &self,
        tenant: &str,
        name: &str,
        device_types: &[String],
    ) -> Result<bool, CatalogError> {
        let siblings = self.images_by_name(tenant, name).await?;
        for sibling in &siblings {
            if sibling
                .meta
                .device_types_compatible
                .iter()
                .any(|t| device_types.contains(t))
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn exist_unfinished_by_artifact_id(&self, id: Uuid) -> Result<bool, CatalogError> {
        let row = sqlx::query(
            "SELECT COUNT(*) as c FROM deployments WHERE status != ? AND artifact_id_candidates_json LIKE ?",
        )
        .bind(DeploymentStatus::Finished.to_string())
        .bind(format!("%{id}%"))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("c")? > 0)
    }

    async fn exist_unfinished_by_artifact_name(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<bool, CatalogError> {
        let row = sqlx::query(
            "SELECT COUNT(*) as c FROM deployments WHERE tenant = ? AND artifact_name = ? AND status != ?",
        )
        .bind(tenant)
        .bind(name)
        .bind(DeploymentStatus::Finished.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("c")? > 0)
    }

    async fn exist_assigned_image_with_id_and_statuses(
        &self,
        id: Uuid,
        statuses: &[DeviceDeploymentStatus],
    ) -> Result<bool, CatalogError> {
        let rows = sqlx::query("SELECT status FROM device_deployments WHERE assigned_artifact = ?")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let status: DeviceDeploymentStatus = status_enum(&row.try_get::<String, _>("status")?)?;
            if statuses.contains(&status) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn images_by_name(&self, tenant: &str, name: &str) -> Result<Vec<Artifact>, CatalogError> {
        let rows = sqlx::query("SELECT * FROM artifacts WHERE tenant = ? AND name = ?")
            .bind(tenant)
            .bind(name)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(artifact_from_row).collect()
    }

    async fn insert_deployment(&self, deployment: NewDeployment) -> Result<Uuid, CatalogError> {
        let existing = sqlx::query("SELECT COUNT(*) as c FROM deployments WHERE tenant = ? AND name = ?")
            .bind(&deployment.tenant)
            .bind(&deployment.name)
            .fetch_one(&self.pool)
            .await?;
        if existing.try_get::<i64, _>("c")? > 0 {
            return Err(CatalogError::DuplicateDeployment);
        }

        let decode = |e: serde_json::Error| CatalogError::Backend(sqlx::Error::Decode(e.into()));
        let device_list_json = serde_json::to_string(&deployment.device_list).map_err(decode)?;
        let candidates_json = serde_json::to_string(&deployment.artifact_id_candidates).map_err(decode)?;
        let groups_json = serde_json::to_string(&deployment.groups).map_err(decode)?;
        let stats_json = serde_json::to_string(&fleet_common::empty_counters()).map_err(decode)?;
        let configuration_json = deployment
            .configuration
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(decode)?;

        sqlx::query(
            "INSERT INTO deployments (
                id, tenant, name, artifact_name, configuration_json, device_list_json, max_devices,
                artifact_id_candidates_json, device_count, stats_json, status, groups_json,
                deployment_type, force_installation, total_size, aborted, created_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?, 0, 0, ?, NULL)",
        )
        .bind(deployment.id.to_string())
        .bind(&deployment.tenant)
        .bind(&deployment.name)
        .bind(&deployment.artifact_name)
        .bind(configuration_json)
        .bind(device_list_json)
        .bind(deployment.max_devices as i64)
        .bind(candidates_json)
        .bind(stats_json)
        .bind(DeploymentStatus::Pending.to_string())
        .bind(groups_json)
        .bind(deployment.deployment_type.to_string())
        .bind(deployment.force_installation as i64)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(deployment.id)
    }

    async fn find_deployment_by_id(&self, id: Uuid) -> Result<Option<Deployment>, CatalogError> {
        let row = sqlx::query("SELECT * FROM deployments WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(deployment_from_row).transpose()
    }

    async fn find_unfinished_by_id(&self, id: Uuid) -> Result<Option<Deployment>, CatalogError> {
        let row = sqlx::query("SELECT * FROM deployments WHERE id = ? AND status != ?")
            .bind(id.to_string())
            .bind(DeploymentStatus::Finished.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(deployment_from_row).transpose()
    }

    async fn find(&self, query: DeploymentQuery) -> Result<Vec<Deployment>, CatalogError> {
        let mut sql = "SELECT * FROM deployments WHERE tenant = ?".to_string();
        if query.name.is_some() {
            sql.push_str(" AND name = ?");
        }
        if query.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        let mut q = sqlx::query(&sql).bind(&query.tenant);
        if let Some(name) = &query.name {
            q = q.bind(name);
        }
        if let Some(status) = &query.status {
            q = q.bind(status.to_string());
        }
        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(deployment_from_row).collect()
    }

    async fn find_newer_active_deployments(
        &self,
        tenant: &str,
        after: DateTime<Utc>,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Deployment>, CatalogError> {
        let rows = sqlx::query(
            "SELECT * FROM deployments
             WHERE tenant = ? AND created_at > ? AND status IN (?, ?)
             ORDER BY created_at ASC
             LIMIT ? OFFSET ?",
        )
        .bind(tenant)
        .bind(ts(after))
        .bind(DeploymentStatus::Pending.to_string())
        .bind(DeploymentStatus::InProgress.to_string())
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(deployment_from_row).collect()
    }

    async fn set_deployment_status(
        &self,
        id: Uuid,
        status: DeploymentStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), CatalogError> {
        sqlx::query("UPDATE deployments SET status = ?, finished_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(finished_at.map(ts))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn device_count_by_deployment(&self, id: Uuid) -> Result<u64, CatalogError> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM device_deployments WHERE deployment_id = ?")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("c")? as u64)
    }

    async fn set_deployment_device_count(&self, id: Uuid, count: u64) -> Result<(), CatalogError> {
        sqlx::query("UPDATE deployments SET device_count = ? WHERE id = ? AND device_count IS NULL")
            .bind(count as i64)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_deployment_total_size(&self, id: Uuid, delta: u64) -> Result<(), CatalogError> {
        sqlx::query("UPDATE deployments SET total_size = total_size + ? WHERE id = ?")
            .bind(delta as i64)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_stats(&self, id: Uuid, stats: StatusCounters) -> Result<(), CatalogError> {
        let stats_json = serde_json::to_string(
            &stats
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<String, i64>>(),
        )
        .map_err(|e| CatalogError::Backend(sqlx::Error::Decode(e.into())))?;
        sqlx::query("UPDATE deployments SET stats_json = ? WHERE id = ?")
            .bind(stats_json)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_stats_inc(
        &self,
        id: Uuid,
        old: Option<DeviceDeploymentStatus>,
        new: DeviceDeploymentStatus,
    ) -> Result<(), CatalogError> {
        // One read-modify-write inside sqlx's pool connection; SQLite's
        // single-writer model (and this pool's shared connection) is what
        // makes this a de-facto atomic increment without a document
        // store's native `$inc` — see spec §9 "Status counters".
        let mut deployment = self
            .find_deployment_by_id(id)
            .await?
            .ok_or(CatalogError::DeploymentNotFound(id))?;
        if let Some(old) = old {
            *deployment.stats.entry(old).or_insert(0) -= 1;
        }
        *deployment.stats.entry(new).or_insert(0) += 1;
        self.update_stats(id, deployment.stats).await
    }

    async fn abort_device_deployments(&self, deployment_id: Uuid) -> Result<Vec<DeviceDeployment>, CatalogError> {
        let rows = sqlx::query(
            "SELECT * FROM device_deployments WHERE deployment_id = ? AND status NOT IN (?, ?, ?, ?, ?, ?)",
        )
        .bind(deployment_id.to_string())
        .bind(DeviceDeploymentStatus::Success.to_string())
        .bind(DeviceDeploymentStatus::Failure.to_string())
        .bind(DeviceDeploymentStatus::NoArtifact.to_string())
        .bind(DeviceDeploymentStatus::AlreadyInstalled.to_string())
        .bind(DeviceDeploymentStatus::Aborted.to_string())
        .bind(DeviceDeploymentStatus::Decommissioned.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut aborted = Vec::with_capacity(rows.len());
        for row in &rows {
            let dd = device_deployment_from_row(row)?;
            sqlx::query("UPDATE device_deployments SET status = ?, finished_at = ? WHERE id = ?")
                .bind(DeviceDeploymentStatus::Aborted.to_string())
                .bind(ts(Utc::now()))
                .bind(dd.id.to_string())
                .execute(&self.pool)
                .await?;
            aborted.push(DeviceDeployment {
                status: DeviceDeploymentStatus::Aborted,
                active: false,
                ..dd
            });
        }

        sqlx::query("UPDATE deployments SET aborted = 1 WHERE id = ?")
            .bind(deployment_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(aborted)
    }

    async fn update_deployments_with_artifact_name(
        &self,
        tenant: &str,
        artifact_name: &str,
        artifact_id: Uuid,
    ) -> Result<(), CatalogError> {
        let rows = sqlx::query(
            "SELECT id, artifact_id_candidates_json FROM deployments
             WHERE tenant = ? AND artifact_name = ? AND status != ?",
        )
        .bind(tenant)
        .bind(artifact_name)
        .bind(DeploymentStatus::Finished.to_string())
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let id: String = row.try_get("id")?;
            let candidates_json: String = row.try_get("artifact_id_candidates_json")?;
            let mut candidates: Vec<Uuid> = serde_json::from_str(&candidates_json)
                .map_err(|e| CatalogError::Backend(sqlx::Error::Decode(e.into())))?;
            if !candidates.contains(&artifact_id) {
                candidates.push(artifact_id);
                let updated = serde_json::to_string(&candidates)
                    .map_err(|e| CatalogError::Backend(sqlx::Error::Decode(e.into())))?;
                sqlx::query("UPDATE deployments SET artifact_id_candidates_json = ? WHERE id = ?")
                    .bind(updated)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn insert_device_deployment(
        &self,
        dd: NewDeviceDeployment,
    ) -> Result<(DeviceDeployment, bool), CatalogError> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO device_deployments
                (id, tenant, device_id, deployment_id, status, created_at, tombstoned)
             VALUES (?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(dd.id.to_string())
        .bind(&dd.tenant)
        .bind(&dd.device_id)
        .bind(dd.deployment_id.to_string())
        .bind(dd.status.to_string())
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;

        let first_time = inserted.rows_affected() > 0;

        let row = sqlx::query("SELECT * FROM device_deployments WHERE device_id = ? AND deployment_id = ?")
            .bind(&dd.device_id)
            .bind(dd.deployment_id.to_string())
            .fetch_one(&self.pool)
            .await?;

        Ok((device_deployment_from_row(&row)?, first_time))
    }

    async fn get_device_deployment(&self, id: Uuid) -> Result<Option<DeviceDeployment>, CatalogError> {
        let row = sqlx::query("SELECT * FROM device_deployments WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(device_deployment_from_row).transpose()
    }

    async fn find_oldest_active_device_deployment(
        &self,
        tenant: &str,
        device_id: &str,
    ) -> Result<Option<DeviceDeployment>, CatalogError> {
        let active_statuses: Vec<String> = DeviceDeploymentStatus::ALL
            .into_iter()
            .filter(|s| s.is_active())
            .map(|s| s.to_string())
            .collect();
        let placeholders = active_statuses.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT * FROM device_deployments
             WHERE tenant = ? AND device_id = ? AND tombstoned = 0 AND status IN ({placeholders})
             ORDER BY created_at ASC LIMIT 1"
        );
        let mut q = sqlx::query(&sql).bind(tenant).bind(device_id);
        for s in &active_statuses {
            q = q.bind(s);
        }
        let row = q.fetch_optional(&self.pool).await?;
        row.as_ref().map(device_deployment_from_row).transpose()
    }

    async fn find_latest_inactive_device_deployment(
        &self,
        tenant: &str,
        device_id: &str,
    ) -> Result<Option<DeviceDeployment>, CatalogError> {
        let terminal_statuses: Vec<String> = DeviceDeploymentStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.to_string())
            .collect();
        let placeholders = terminal_statuses.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT * FROM device_deployments
             WHERE tenant = ? AND device_id = ? AND tombstoned = 0 AND status IN ({placeholders})
             ORDER BY created_at DESC LIMIT 1"
        );
        let mut q = sqlx::query(&sql).bind(tenant).bind(device_id);
        for s in &terminal_statuses {
            q = q.bind(s);
        }
        let row = q.fetch_optional(&self.pool).await?;
        row.as_ref().map(device_deployment_from_row).transpose()
    }

    async fn update_device_deployment_status(
        &self,
        id: Uuid,
        new_status: DeviceDeploymentStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<DeviceDeploymentStatus, CatalogError> {
        let current = self
            .get_device_deployment(id)
            .await?
            .ok_or(CatalogError::StorageNotFound)?;

        sqlx::query("UPDATE device_deployments SET status = ?, finished_at = ? WHERE id = ?")
            .bind(new_status.to_string())
            .bind(finished_at.map(ts))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(current.status)
    }

    async fn save_device_deployment_request(
        &self,
        id: Uuid,
        provides: DeviceProvides,
    ) -> Result<(), CatalogError> {
        let json = serde_json::to_string(&provides)
            .map_err(|e| CatalogError::Backend(sqlx::Error::Decode(e.into())))?;
        sqlx::query("UPDATE device_deployments SET last_provides_json = ? WHERE id = ?")
            .bind(json)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn assign_artifact(
        &self,
        id: Uuid,
        artifact_id: Uuid,
        device_type: &str,
    ) -> Result<(), CatalogError> {
        sqlx::query(
            "UPDATE device_deployments SET assigned_artifact = ?, device_type_at_assignment = ? WHERE id = ?",
        )
        .bind(artifact_id.to_string())
        .bind(device_type)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn aggregate_device_deployment_by_status(
        &self,
        deployment_id: Uuid,
    ) -> Result<StatusCounters, CatalogError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) as c FROM device_deployments
             WHERE deployment_id = ? AND tombstoned = 0 GROUP BY status",
        )
        .bind(deployment_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut counters = fleet_common::empty_counters();
        for row in &rows {
            let status: DeviceDeploymentStatus = status_enum(&row.try_get::<String, _>("status")?)?;
            let count: i64 = row.try_get("c")?;
            counters.insert(status, count);
        }
        Ok(counters)
    }

    async fn save_last_device_deployment_status(
        &self,
        tenant: &str,
        device_id: &str,
        deployment_id: Uuid,
        device_deployment_id: Uuid,
        status: DeviceDeploymentStatus,
    ) -> Result<(), CatalogError> {
        sqlx::query(
            "INSERT INTO device_deployment_last_status (tenant, device_id, deployment_id, device_deployment_id, status)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(tenant, device_id) DO UPDATE SET
                deployment_id = excluded.deployment_id,
                device_deployment_id = excluded.device_deployment_id,
                status = excluded.status",
        )
        .bind(tenant)
        .bind(device_id)
        .bind(deployment_id.to_string())
        .bind(device_deployment_id.to_string())
        .bind(status.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_device_deployments_history(
        &self,
        tenant: &str,
        device_id: &str,
    ) -> Result<Vec<DeviceDeployment>, CatalogError> {
        let rows = sqlx::query("SELECT * FROM device_deployments WHERE tenant = ? AND device_id = ?")
            .bind(tenant)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;
        let affected = rows.iter().map(device_deployment_from_row).collect::<Result<Vec<_>, _>>()?;

        sqlx::query("UPDATE device_deployments SET tombstoned = 1 WHERE tenant = ? AND device_id = ?")
            .bind(tenant)
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(affected)
    }

    async fn find_newer_pending_deployments_for_device(
        &self,
        tenant: &str,
        device_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<Deployment>, CatalogError> {
        let rows = sqlx::query(
            "SELECT * FROM deployments
             WHERE tenant = ? AND created_at > ? AND status IN (?, ?)
             AND device_list_json LIKE ?
             ORDER BY created_at ASC",
        )
        .bind(tenant)
        .bind(ts(after))
        .bind(DeploymentStatus::Pending.to_string())
        .bind(DeploymentStatus::InProgress.to_string())
        .bind(format!("%\"{device_id}\"%"))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(deployment_from_row).collect()
    }

    async fn insert_upload_intent(&self, intent: UploadIntent) -> Result<(), CatalogError> {
        sqlx::query(
            "INSERT INTO upload_intents (artifact_id, tenant, status, issued_at, skip_verify)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(intent.artifact_id.to_string())
        .bind(&intent.tenant)
        .bind(intent.status.to_string())
        .bind(ts(intent.issued_at))
        .bind(intent.skip_verify as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_upload_intent(&self, id: Uuid) -> Result<Option<UploadIntent>, CatalogError> {
        let row = sqlx::query("SELECT * FROM upload_intents WHERE artifact_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(UploadIntent {
                artifact_id: id,
                tenant: row.try_get("tenant")?,
                status: status_enum(&row.try_get::<String, _>("status")?)?,
                issued_at: from_ts(row.try_get("issued_at")?),
                skip_verify: row.try_get::<i64, _>("skip_verify")? != 0,
            })),
        }
    }

    async fn update_upload_intent_status(
        &self,
        id: Uuid,
        expected: UploadIntentStatus,
        new: UploadIntentStatus,
    ) -> Result<(), CatalogError> {
        let result = sqlx::query("UPDATE upload_intents SET status = ? WHERE artifact_id = ? AND status = ?")
            .bind(new.to_string())
            .bind(id.to_string())
            .bind(expected.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::UploadNotFound(id));
        }
        Ok(())
    }

    async fn touch_upload_intent(&self, id: Uuid) -> Result<(), CatalogError> {
        sqlx::query("UPDATE upload_intents SET issued_at = ? WHERE artifact_id = ?")
            .bind(ts(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_storage_settings(
        &self,
        tenant: &str,
    ) -> Result<Option<TenantStorageSettings>, CatalogError> {
        let row = sqlx::query("SELECT * FROM storage_settings WHERE tenant = ?")
            .bind(tenant)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(TenantStorageSettings {
                bucket: row.try_get("bucket")?,
                region: row.try_get("region")?,
                access_key_id: row.try_get("access_key_id")?,
                secret_access_key: row.try_get("secret_access_key")?,
                endpoint: row.try_get("endpoint")?,
                token: row.try_get("token")?,
                force_path_style: row.try_get::<i64, _>("force_path_style")? != 0,
                use_accelerate: row.try_get::<i64, _>("use_accelerate")? != 0,
            })),
        }
    }

    async fn set_storage_settings(
        &self,
        tenant: &str,
        settings: TenantStorageSettings,
    ) -> Result<(), CatalogError> {
        sqlx::query(
            "INSERT INTO storage_settings
                (tenant, bucket, region, access_key_id, secret_access_key, endpoint, token, force_path_style, use_accelerate)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(tenant) DO UPDATE SET
                bucket = excluded.bucket, region = excluded.region,
                access_key_id = excluded.access_key_id, secret_access_key = excluded.secret_access_key,
                endpoint = excluded.endpoint, token = excluded.token,
                force_path_style = excluded.force_path_style, use_accelerate = excluded.use_accelerate",
        )
        .bind(tenant)
        .bind(settings.bucket)
        .bind(settings.region)
        .bind(settings.access_key_id)
        .bind(settings.secret_access_key)
        .bind(settings.endpoint)
        .bind(settings.token)
        .bind(settings.force_path_style as i64)
        .bind(settings.use_accelerate as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_limit(&self, name: &str) -> Result<Option<i64>, CatalogError> {
        let row = sqlx::query("SELECT value FROM limits WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get::<i64, _>("value")).transpose().map_err(Into::into)
    }

    async fn set_limit(&self, name: &str, value: i64) -> Result<(), CatalogError> {
        sqlx::query(
            "INSERT INTO limits (name, value) VALUES (?, ?)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::{ArtifactMeta, DeploymentType};

    fn meta(name: &str, device_types: &[&str]) -> ArtifactMeta {
        ArtifactMeta {
            name: name.to_string(),
            description: None,
            format: "mender".to_string(),
            format_version: 3,
            device_types_compatible: device_types.iter().map(|s| s.to_string()).collect(),
            depends: Default::default(),
            provides: Default::default(),
            clears_provides: Vec::new(),
            updates: Vec::new(),
            signed: true,
        }
    }

    #[tokio::test]
    async fn artifact_roundtrip_and_uniqueness() {
        let store = SqliteCatalogStore::new_in_memory().await.unwrap();
        let id = Uuid::new_v4();
        store
            .insert_artifact(NewArtifact {
                id,
                tenant: String::new(),
                meta: meta("App1 v1.0", &["bar", "baz"]),
            })
            .await
            .unwrap();

        let found = store.find_artifact_by_id(id).await.unwrap().unwrap();
        assert_eq!(found.meta.name, "App1 v1.0");

        let err = store
            .insert_artifact(NewArtifact {
                id: Uuid::new_v4(),
                tenant: String::new(),
                meta: meta("App1 v1.0", &["bar"]),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::ArtifactNotUnique));
    }

    #[tokio::test]
    async fn device_deployment_insert_is_idempotent() {
        let store = SqliteCatalogStore::new_in_memory().await.unwrap();
        let deployment_id = Uuid::new_v4();
        store
            .insert_deployment(NewDeployment {
                id: deployment_id,
                tenant: String::new(),
                name: "dep1".into(),
                artifact_name: "App1 v1.0".into(),
                configuration: None,
                device_list: vec!["devA".into()],
                max_devices: 1,
                artifact_id_candidates: Vec::new(),
                groups: Vec::new(),
                deployment_type: DeploymentType::Software,
                force_installation: false,
            })
            .await
            .unwrap();

        let first_id = Uuid::new_v4();
        let (dd1, created1) = store
            .insert_device_deployment(NewDeviceDeployment {
                id: first_id,
                tenant: String::new(),
                device_id: "devA".into(),
                deployment_id,
                status: DeviceDeploymentStatus::Pending,
            })
            .await
            .unwrap();
        assert!(created1);

        let (dd2, created2) = store
            .insert_device_deployment(NewDeviceDeployment {
                id: Uuid::new_v4(),
                tenant: String::new(),
                device_id: "devA".into(),
                deployment_id,
                status: DeviceDeploymentStatus::Pending,
            })
            .await
            .unwrap();
        assert!(!created2);
        assert_eq!(dd1.id, dd2.id);
    }

    #[tokio::test]
    async fn stats_inc_is_consistent_across_transitions() {
        let store = SqliteCatalogStore::new_in_memory().await.unwrap();
        let deployment_id = Uuid::new_v4();
        store
            .insert_deployment(NewDeployment {
                id: deployment_id,
                tenant: String::new(),
                name: "dep1".into(),
                artifact_name: "App1 v1.0".into(),
                configuration: None,
                device_list: vec!["devA".into()],
                max_devices: 1,
                artifact_id_candidates: Vec::new(),
                groups: Vec::new(),
                deployment_type: DeploymentType::Software,
                force_installation: false,
            })
            .await
            .unwrap();

        store
            .update_stats_inc(deployment_id, None, DeviceDeploymentStatus::Pending)
            .await
            .unwrap();
        store
            .update_stats_inc(
                deployment_id,
                Some(DeviceDeploymentStatus::Pending),
                DeviceDeploymentStatus::Success,
            )
            .await
            .unwrap();

        let deployment = store.find_deployment_by_id(deployment_id).await.unwrap().unwrap();
        assert_eq!(deployment.stats[&DeviceDeploymentStatus::Pending], 0);
        assert_eq!(deployment.stats[&DeviceDeploymentStatus::Success], 1);
        assert_eq!(deployment.materialized_count(), 1);
    }
}

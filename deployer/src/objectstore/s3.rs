//! S3-backed `ObjectStore`, the production swap-in for `local::LocalObjectStore`.
//! Grounded on the teacher's `aws-sdk-rds`/`aws-sdk-iam`/`aws-sdk-sts` usage:
//! same `aws-config` credential-chain bootstrap, same pattern of building a
//! per-call client from explicit settings rather than only from the
//! environment, extended here to `aws-sdk-s3` plus its `presigning` module
//! for signed URLs.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::{ByteStream as AwsByteStream, SdkBody};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};

use crate::tenant::TenantStorageSettings;

use super::{ByteStream, ObjectStore, ObjectStoreError, SignedUrl};

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Builds a client from the ambient credential chain (IAM role, env,
    /// profile) and a bucket/region pair, the way the teacher's RDS/IAM
    /// clients bootstrap from `aws_config::load_defaults`.
    pub async fn from_env(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        let shared_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.into()))
            .load()
            .await;
        Self {
            client: Client::new(&shared_config),
            bucket: bucket.into(),
        }
    }

    /// Builds a client scoped to one tenant's own bucket/credentials
    /// (spec §6 "Per-tenant storage settings"), bypassing the ambient
    /// credential chain entirely.
    pub fn from_tenant_settings(settings: &TenantStorageSettings) -> Self {
        let mut builder = aws_sdk_s3::Config::builder()
            .region(Region::new(settings.region.clone()))
            .credentials_provider(Credentials::new(
                settings.access_key_id.clone(),
                settings.secret_access_key.clone(),
                settings.token.clone(),
                None,
                "fleet-deployer-tenant",
            ))
            .force_path_style(settings.force_path_style);

        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket.clone(),
        }
    }

    fn map_err(e: impl std::error::Error + Send + Sync + 'static) -> ObjectStoreError {
        ObjectStoreError::Backend(anyhow::Error::new(e))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, key: &str, mut stream: ByteStream) -> Result<(), ObjectStoreError> {
        // Buffered rather than true multipart streaming: the AWS SDK's
        // chunked multipart upload needs its own sequencing state that
        // doesn't fit this trait's single-call shape. Acceptable for the
        // artifact sizes this service handles; revisit if that changes.
        let mut buffer = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Self::map_err)?;
            buffer.extend_from_slice(&chunk);
        }
        let body = AwsByteStream::new(SdkBody::from(buffer));
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<ByteStream, ObjectStoreError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(se) if se.is_no_such_key() => ObjectStoreError::ObjectNotFound,
                _ => Self::map_err(e),
            })?;

        let stream = output
            .body
            .map_ok(Bytes::from)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::pin(stream))
    }

    async fn stat_object(&self, key: &str) -> Result<u64, ObjectStoreError> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(se) if se.is_not_found() => ObjectStoreError::ObjectNotFound,
                _ => Self::map_err(e),
            })?;
        Ok(output.content_length().unwrap_or(0) as u64)
    }

    async fn delete_object(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn get_request(
        &self,
        key: &str,
        filename: &str,
        expire: Duration,
    ) -> Result<SignedUrl, ObjectStoreError> {
        let presigning = PresigningConfig::expires_in(expire).map_err(Self::map_err)?;
        let disposition = format!("attachment; filename=\"{filename}\"");
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .response_content_disposition(disposition)
            .presigned(presigning)
            .await
            .map_err(Self::map_err)?;

        Ok(SignedUrl {
            url: presigned.uri().to_string(),
            expire: chrono::Utc::now() + chrono::Duration::from_std(expire).unwrap_or_default(),
        })
    }

    async fn put_request(&self, key: &str, expire: Duration) -> Result<SignedUrl, ObjectStoreError> {
        let presigning = PresigningConfig::expires_in(expire).map_err(Self::map_err)?;
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(Self::map_err)?;

        Ok(SignedUrl {
            url: presigned.uri().to_string(),
            expire: chrono::Utc::now() + chrono::Duration::from_std(expire).unwrap_or_default(),
        })
    }

    async fn delete_request(
        &self,
        key: &str,
        expire: Duration,
    ) -> Result<SignedUrl, ObjectStoreError> {
        let presigning = PresigningConfig::expires_in(expire).map_err(Self::map_err)?;
        let presigned = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(Self::map_err)?;

        Ok(SignedUrl {
            url: presigned.uri().to_string(),
            expire: chrono::Utc::now() + chrono::Duration::from_std(expire).unwrap_or_default(),
        })
    }

    async fn health_check(&self) -> Result<(), ObjectStoreError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }
}

//! The `ObjectStore` adapter from spec §4.4: put/get/stat/delete an
//! opaque blob by key, and issue signed GET/PUT/DELETE URLs for direct
//! client access. `ObjectNotFound` is the only sentinel callers are
//! expected to match on; everything else is an opaque failure.

pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use fleet_common::constants::{ARTIFACT_KEY_PREFIX, STAGED_UPLOAD_SUFFIX};

#[derive(thiserror::Error, Debug)]
pub enum ObjectStoreError {
    #[error("object not found")]
    ObjectNotFound,
    #[error("object store backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

#[derive(Clone, Debug)]
pub struct SignedUrl {
    pub url: String,
    pub expire: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, stream: ByteStream) -> Result<(), ObjectStoreError>;

    async fn get_object(&self, key: &str) -> Result<ByteStream, ObjectStoreError>;

    /// Returns the object's size in bytes.
    async fn stat_object(&self, key: &str) -> Result<u64, ObjectStoreError>;

    async fn delete_object(&self, key: &str) -> Result<(), ObjectStoreError>;

    async fn get_request(
        &self,
        key: &str,
        filename: &str,
        expire: Duration,
    ) -> Result<SignedUrl, ObjectStoreError>;

    async fn put_request(&self, key: &str, expire: Duration) -> Result<SignedUrl, ObjectStoreError>;

    async fn delete_request(
        &self,
        key: &str,
        expire: Duration,
    ) -> Result<SignedUrl, ObjectStoreError>;

    async fn health_check(&self) -> Result<(), ObjectStoreError>;
}

/// Object key an artifact's blob lives at: `images/<tenant>/<artifact_id>`
/// (tenant prefix elided for the default tenant), per spec §6.
pub fn artifact_key(tenant: &str, artifact_id: uuid::Uuid) -> String {
    if tenant.is_empty() {
        format!("{ARTIFACT_KEY_PREFIX}/{artifact_id}")
    } else {
        format!("{ARTIFACT_KEY_PREFIX}/{tenant}/{artifact_id}")
    }
}

/// The staged (not yet verified) object key for an in-flight upload,
/// unless `skip_verify` picks the final key up front (spec §4.1
/// `UploadLink`, §6 "Object layout").
pub fn staged_key(tenant: &str, artifact_id: uuid::Uuid, skip_verify: bool) -> String {
    let key = artifact_key(tenant, artifact_id);
    if skip_verify {
        key
    } else {
        format!("{key}{STAGED_UPLOAD_SUFFIX}")
    }
}

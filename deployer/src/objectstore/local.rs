//! Filesystem-backed `ObjectStore`, keyed the way
//! `shuttle_common::storage_manager::StorageManager` lays out its paths.
//! Used as the default/dev backend and in tests; `s3::S3ObjectStore` is
//! the production swap-in that speaks real presigned URLs.
//!
//! There is no origin HTTP server in front of this store (the REST
//! surface is out of scope), so a "signed URL" here is an HMAC-signed,
//! expiry-stamped token over a `local://` path rather than a real
//! fetchable URL. `verify` lets a test (standing in for that absent HTTP
//! layer) check a token the way a real handler would.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::{ByteStream, ObjectStore, ObjectStoreError, SignedUrl};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    signing_key: Vec<u8>,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, signing_key: impl Into<Vec<u8>>) -> Self {
        Self {
            root: root.into(),
            signing_key: signing_key.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn sign(&self, method: &str, key: &str, expire_unix: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key).expect("any key length is valid for HMAC-SHA256");
        mac.update(format!("{method}:{key}:{expire_unix}").as_bytes());
        hex_encode(&mac.finalize().into_bytes())
    }

    fn signed_url(&self, method: &str, key: &str, filename: Option<&str>, expire: Duration) -> SignedUrl {
        let expire_at = Utc::now() + chrono::Duration::from_std(expire).unwrap_or_default();
        let sig = self.sign(method, key, expire_at.timestamp());
        let filename_part = filename
            .map(|f| format!("&filename={}", urlencode(f)))
            .unwrap_or_default();
        SignedUrl {
            url: format!(
                "local://{key}?method={method}&exp={}&sig={sig}{filename_part}",
                expire_at.timestamp()
            ),
            expire: expire_at,
        }
    }

    /// Verifies a token produced by `signed_url`. Stands in for the
    /// signature check a real HTTP handler in front of this store would do.
    pub fn verify(&self, url: &str, expected_method: &str) -> bool {
        let Some(rest) = url.strip_prefix("local://") else {
            return false;
        };
        let Some((key, query)) = rest.split_once('?') else {
            return false;
        };
        let params: std::collections::HashMap<_, _> = query
            .split('&')
            .filter_map(|kv| kv.split_once('='))
            .collect();
        let (Some(method), Some(exp), Some(sig)) =
            (params.get("method"), params.get("exp"), params.get("sig"))
        else {
            return false;
        };
        if *method != expected_method {
            return false;
        }
        let Ok(exp_ts) = exp.parse::<i64>() else {
            return false;
        };
        if exp_ts < Utc::now().timestamp() {
            return false;
        }
        self.sign(method, key, exp_ts) == **sig
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn urlencode(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c.to_string() } else { format!("%{:02X}", c as u32) })
        .collect()
}

async fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_object(&self, key: &str, mut stream: ByteStream) -> Result<(), ObjectStoreError> {
        let path = self.path_for(key);
        ensure_parent(&path)
            .await
            .map_err(|e| ObjectStoreError::Backend(e.into()))?;

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| ObjectStoreError::Backend(e.into()))?;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ObjectStoreError::Backend(e.into()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ObjectStoreError::Backend(e.into()))?;
        }
        file.flush().await.map_err(|e| ObjectStoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<ByteStream, ObjectStoreError> {
        let path = self.path_for(key);
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ObjectStoreError::ObjectNotFound
            } else {
                ObjectStoreError::Backend(e.into())
            }
        })?;

        let stream = ReaderStream::new(file).map_ok(Bytes::from).map_err(|e| e as std::io::Error);
        Ok(Box::pin(stream))
    }

    async fn stat_object(&self, key: &str) -> Result<u64, ObjectStoreError> {
        let path = self.path_for(key);
        let meta = tokio::fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ObjectStoreError::ObjectNotFound
            } else {
                ObjectStoreError::Backend(e.into())
            }
        })?;
        Ok(meta.len())
    }

    async fn delete_object(&self, key: &str) -> Result<(), ObjectStoreError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ObjectStoreError::Backend(e.into())),
        }
    }

    async fn get_request(
        &self,
        key: &str,
        filename: &str,
        expire: Duration,
    ) -> Result<SignedUrl, ObjectStoreError> {
        Ok(self.signed_url("GET", key, Some(filename), expire))
    }

    async fn put_request(&self, key: &str, expire: Duration) -> Result<SignedUrl, ObjectStoreError> {
        Ok(self.signed_url("PUT", key, None, expire))
    }

    async fn delete_request(
        &self,
        key: &str,
        expire: Duration,
    ) -> Result<SignedUrl, ObjectStoreError> {
        Ok(self.signed_url("DELETE", key, None, expire))
    }

    async fn health_check(&self) -> Result<(), ObjectStoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ObjectStoreError::Backend(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (LocalObjectStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (LocalObjectStore::new(dir.path(), b"test-signing-key".to_vec()), dir)
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let (store, _dir) = store();
        let data = Bytes::from_static(b"hello world");
        let stream: ByteStream = Box::pin(futures::stream::iter(vec![Ok(data.clone())]));
        store.put_object("images/t/a", stream).await.unwrap();

        assert_eq!(store.stat_object("images/t/a").await.unwrap(), data.len() as u64);

        let mut read_stream = store.get_object("images/t/a").await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = read_stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, data.to_vec());
    }

    #[tokio::test]
    async fn missing_object_is_distinguished() {
        let (store, _dir) = store();
        let err = store.stat_object("nope").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::ObjectNotFound));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (store, _dir) = store();
        store.delete_object("nope").await.unwrap();
    }

    #[tokio::test]
    async fn signed_url_verifies_and_expires() {
        let (store, _dir) = store();
        let signed = store
            .get_request("images/t/a", "app.bin", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.verify(&signed.url, "GET"));
        assert!(!store.verify(&signed.url, "PUT"));

        let expired = store.signed_url("GET", "images/t/a", None, Duration::from_secs(0));
        // Sleep isn't needed: exp == now is already not in the future by the
        // time verify() runs.
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(!store.verify(&expired.url, "GET"));
    }
}

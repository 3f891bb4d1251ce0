//! S3-compatible object storage — upload, list and delete artifacts.
//!
//! Built on `object_store`'s Amazon S3 client with path-style requests, so
//! MinIO, R2, OSS and S3 itself all work. Objects live at
//! `<bucket>/<project>/<file>`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use backupx_core::config::Config;
use backupx_core::error::{BackupError, Result};
use backupx_security::SecretCodec;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::ObjectStore as _;
use object_store::path::Path as ObjectPath;
use tokio::io::AsyncWriteExt;

const DEFAULT_REGION: &str = "us-east-1";

/// Remote home for uploaded artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload one artifact as `<project dir>/<file name>`. Returns the key.
    async fn upload(&self, local_path: &Path) -> Result<String>;
    /// All keys under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Bucket-scoped object storage client.
#[derive(Clone)]
pub struct S3Store {
    store: Arc<dyn object_store::ObjectStore>,
    bucket: String,
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl S3Store {
    /// `endpoint` may omit the scheme (https is assumed). An empty region
    /// means `us-east-1`.
    pub fn new(
        endpoint: &str,
        region: &str,
        bucket: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self> {
        let endpoint = normalize_endpoint(endpoint);
        let region = match region.trim() {
            "" => DEFAULT_REGION,
            region => region,
        };
        let bucket = bucket.trim();

        let store = AmazonS3Builder::new()
            .with_endpoint(&endpoint)
            .with_bucket_name(bucket)
            .with_region(region)
            .with_access_key_id(access_key.trim())
            .with_secret_access_key(secret_key)
            .with_allow_http(endpoint.starts_with("http://"))
            .with_virtual_hosted_style_request(false)
            .build()
            .map_err(|e| BackupError::Storage(format!("Invalid object storage settings: {e}")))?;

        tracing::debug!("🪣 Object storage {} bucket {} ({})", endpoint, bucket, region);
        Ok(Self::with_store(Arc::new(store), bucket))
    }

    /// Wrap an already configured store.
    pub fn with_store(store: Arc<dyn object_store::ObjectStore>, bucket: &str) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
        }
    }

    /// Build from configuration, decrypting the stored secret key.
    /// `Ok(None)` when remote storage is not configured.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        let s3 = &config.s3;
        if !s3.is_configured() {
            return Ok(None);
        }
        let codec = SecretCodec::from_encoded(&config.encrypt_key)?;
        let secret_key = codec.decrypt(&s3.secret_key)?;
        Self::new(&s3.endpoint, &s3.region, &s3.bucket_name, &s3.access_key, &secret_key).map(Some)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Confirm the bucket is reachable with the configured credentials.
    /// Buckets are never created here.
    pub async fn check_bucket(&self) -> Result<()> {
        self.store
            .list_with_delimiter(None)
            .await
            .map_err(|e| BackupError::Storage(format!("Bucket {} not reachable: {e}", self.bucket)))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn upload(&self, local_path: &Path) -> Result<String> {
        let key = object_key(local_path)?;
        let location = parse_location(&key)?;
        let mut file = tokio::fs::File::open(local_path).await?;

        // Large artifacts go up as a multipart upload.
        let mut writer = BufWriter::new(self.store.clone(), location);
        if let Err(e) = tokio::io::copy(&mut file, &mut writer).await {
            if let Err(abort) = writer.abort().await {
                tracing::debug!("Abort of upload {} failed: {}", key, abort);
            }
            return Err(BackupError::Storage(format!("Upload {key} failed: {e}")));
        }
        writer
            .shutdown()
            .await
            .map_err(|e| BackupError::Storage(format!("Upload {key} failed: {e}")))?;

        tracing::info!("☁️ Uploaded {} to bucket {}", key, self.bucket);
        Ok(key)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = parse_location(prefix)?;
        let objects: Vec<object_store::ObjectMeta> = self
            .store
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(|e| BackupError::Storage(format!("List {prefix} failed: {e}")))?;
        Ok(objects.into_iter().map(|meta| meta.location.to_string()).collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let location = parse_location(key)?;
        self.store
            .delete(&location)
            .await
            .map_err(|e| BackupError::Storage(format!("Delete {key} failed: {e}")))
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}

fn parse_location(key: &str) -> Result<ObjectPath> {
    ObjectPath::parse(key.trim_matches('/'))
        .map_err(|e| BackupError::Storage(format!("Invalid object key '{key}': {e}")))
}

/// `<parent dir name>/<file name>` of a local artifact.
pub fn object_key(local_path: &Path) -> Result<String> {
    let file = local_path.file_name().map(|n| n.to_string_lossy());
    let project = local_path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy());
    match (project, file) {
        (Some(project), Some(file)) => Ok(format!("{project}/{file}")),
        _ => Err(BackupError::Storage(format!(
            "Cannot derive object key from {}",
            local_path.display()
        ))),
    }
}

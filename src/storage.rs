//! Object Storage
//!
//! Signed download URLs for anomaly snapshots, fetched from the storage
//! facade over HTTP. A cache sits in front keyed by SHA256 of
//! bucket, path and expiry, so repeat alerts for the same snapshot do not
//! re-sign. Cache entries expire well before the signatures they hold.

use async_trait::async_trait;
use moka::future::Cache;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::FlowError;

/// Storage operations the alert flow depends on
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Time-limited download URL for an object
    async fn presigned_get_object(
        &self,
        bucket: &str,
        path: &str,
        expiry_secs: u64,
    ) -> Result<String, FlowError>;

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, FlowError>;

    async fn make_bucket(&self, bucket: &str) -> Result<(), FlowError>;
}

/// Create `bucket` unless it already exists
pub async fn ensure_bucket(storage: &dyn ObjectStorage, bucket: &str) -> Result<(), FlowError> {
    if storage.bucket_exists(bucket).await? {
        return Ok(());
    }

    storage.make_bucket(bucket).await?;
    info!("Created bucket {}", bucket);
    Ok(())
}

#[derive(Debug, Serialize)]
struct PresignRequest<'a> {
    bucket: &'a str,
    object: &'a str,
    expiry_secs: u64,
}

#[derive(Debug, Deserialize)]
struct PresignResponse {
    url: String,
}

/// Storage facade client over plain HTTP
pub struct HttpObjectStorage {
    client: Client,
    base_url: String,
}

impl HttpObjectStorage {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn presigned_get_object(
        &self,
        bucket: &str,
        path: &str,
        expiry_secs: u64,
    ) -> Result<String, FlowError> {
        let response = self
            .client
            .post(format!("{}/presign", self.base_url))
            .json(&PresignRequest {
                bucket,
                object: path,
                expiry_secs,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(FlowError::TransientRemote(format!(
                "presign returned {} for {}/{}",
                status, bucket, path
            )));
        }

        let signed: PresignResponse = response
            .json()
            .await
            .map_err(|e| FlowError::TransientRemote(format!("presign returned invalid body: {}", e)))?;

        Ok(signed.url)
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, FlowError> {
        let response = self
            .client
            .get(format!("{}/buckets/{}", self.base_url, bucket))
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            s => Err(FlowError::TransientRemote(format!(
                "bucket check returned {} for {}",
                s, bucket
            ))),
        }
    }

    async fn make_bucket(&self, bucket: &str) -> Result<(), FlowError> {
        let response = self
            .client
            .put(format!("{}/buckets/{}", self.base_url, bucket))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FlowError::TransientRemote(format!(
                "bucket create returned {} for {}",
                response.status(),
                bucket
            )));
        }

        Ok(())
    }
}

/// Signed-URL cache statistics
#[derive(Debug, Clone)]
pub struct SignedUrlStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Caching layer over any `ObjectStorage`
pub struct SignedUrlCache {
    inner: Arc<dyn ObjectStorage>,
    cache: Cache<String, String>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SignedUrlCache {
    /// Cache entries live for `ttl_secs`, which must stay below the
    /// signing expiry so a cached URL is never handed out dead.
    pub fn new(inner: Arc<dyn ObjectStorage>, max_entries: u64, ttl_secs: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self {
            inner,
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache key over the full signing identity
    fn compute_key(bucket: &str, path: &str, expiry_secs: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bucket.as_bytes());
        hasher.update(b"|");
        hasher.update(path.as_bytes());
        hasher.update(b"|");
        hasher.update(expiry_secs.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn stats(&self) -> SignedUrlStats {
        SignedUrlStats {
            entries: self.cache.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl ObjectStorage for SignedUrlCache {
    async fn presigned_get_object(
        &self,
        bucket: &str,
        path: &str,
        expiry_secs: u64,
    ) -> Result<String, FlowError> {
        let key = Self::compute_key(bucket, path, expiry_secs);

        if let Some(url) = self.cache.get(&key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Signed URL cache HIT: {}", &key[..16]);
            return Ok(url);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Signed URL cache MISS: {}", &key[..16]);

        let url = self.inner.presigned_get_object(bucket, path, expiry_secs).await?;
        self.cache.insert(key, url.clone()).await;

        Ok(url)
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, FlowError> {
        self.inner.bucket_exists(bucket).await
    }

    async fn make_bucket(&self, bucket: &str) -> Result<(), FlowError> {
        self.inner.make_bucket(bucket).await
    }
}

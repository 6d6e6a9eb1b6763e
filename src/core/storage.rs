/// Remote object storage for backup archives
///
/// [`ObjectStore`] is the narrow contract the backup, cleanup and restore
/// flows need. [`S3Store`] talks to AWS S3 (or an S3-compatible endpoint);
/// [`MemoryStore`] keeps objects in memory for tests and dry runs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;

use crate::core::checksum::md5_hex;
use crate::core::config::S3Output;
use crate::core::error::SiteBackupError;

/// DeleteObjects accepts at most this many keys per request
pub const MAX_DELETE_BATCH: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: u64,
    pub etag: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable location, e.g. `s3://bucket`
    fn describe(&self) -> String;

    /// Every key under `prefix`, in the store's listing order
    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>>;

    /// Upload a local file, returning the ETag the store reports
    async fn put_file(&self, key: &str, path: &Path) -> Result<Option<String>>;

    async fn head(&self, key: &str) -> Result<ObjectInfo>;

    async fn download(&self, key: &str, destination: &Path) -> Result<()>;

    /// Delete all `keys`. Implementations split into batches as needed.
    async fn delete_keys(&self, keys: &[String]) -> Result<()>;
}

/// Opens the store an output config points at
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, output: &S3Output) -> Result<Arc<dyn ObjectStore>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct S3Connector;

#[async_trait]
impl StoreConnector for S3Connector {
    async fn connect(&self, output: &S3Output) -> Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(S3Store::connect(output).await?))
    }
}

/// Hands out the same in-memory store for every output
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    pub store: Arc<MemoryStore>,
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self, _output: &S3Output) -> Result<Arc<dyn ObjectStore>> {
        let store: Arc<dyn ObjectStore> = self.store.clone();
        Ok(store)
    }
}

pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub async fn connect(config: &S3Output) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let (Some(key), Some(secret)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                key.clone(),
                secret.clone(),
                None,
                None,
                "site-backup-config",
            ));
        }

        // LocalStack/MinIO
        if let Some(ref endpoint) = config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        })
    }
}

fn transfer_bar(len: u64, message: String) -> ProgressBar {
    let bar = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::with_template(
        "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
    ) {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.set_message(message);
    bar
}

#[async_trait]
impl ObjectStore for S3Store {
    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }

    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_prefix(prefix.map(str::to_string))
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| SiteBackupError::storage("list", DisplayErrorContext(&e)))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        tracing::debug!(bucket = %self.bucket, count = keys.len(), "listed objects");
        Ok(keys)
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<Option<String>> {
        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("Failed to open {} for upload", path.display()))?;

        let spinner = ProgressBar::new_spinner();
        spinner.set_message(format!("Uploading {} to s3://{}", key, self.bucket));
        spinner.enable_steady_tick(std::time::Duration::from_millis(120));

        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await;
        spinner.finish_and_clear();

        let response = result.map_err(|e| SiteBackupError::storage("upload", DisplayErrorContext(&e)))?;
        Ok(response.e_tag().map(str::to_string))
    }

    async fn head(&self, key: &str) -> Result<ObjectInfo> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| SiteBackupError::storage("head", DisplayErrorContext(&e)))?;

        Ok(ObjectInfo {
            size: response.content_length().unwrap_or(0).max(0) as u64,
            etag: response.e_tag().map(str::to_string),
        })
    }

    async fn download(&self, key: &str, destination: &Path) -> Result<()> {
        let mut response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| SiteBackupError::storage("download", DisplayErrorContext(&e)))?;

        let total = response.content_length().unwrap_or(0).max(0) as u64;
        let bar = transfer_bar(total, format!("Downloading {}", key));

        let mut file = tokio::fs::File::create(destination)
            .await
            .with_context(|| format!("Couldn't open {} for writing", destination.display()))?;

        while let Some(chunk) = response
            .body
            .try_next()
            .await
            .map_err(|e| SiteBackupError::storage("download", e))?
        {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write {}", destination.display()))?;
            bar.inc(chunk.len() as u64);
        }
        file.flush().await?;
        bar.finish_and_clear();

        Ok(())
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<()> {
        for batch in keys.chunks(MAX_DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|e| SiteBackupError::storage("delete", e))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| SiteBackupError::storage("delete", e))?;

            let response = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| SiteBackupError::storage("delete", DisplayErrorContext(&e)))?;

            let failures: Vec<String> = response
                .errors()
                .iter()
                .map(|err| {
                    format!(
                        "{}: {}",
                        err.key().unwrap_or("?"),
                        err.message().unwrap_or("unknown error")
                    )
                })
                .collect();
            if !failures.is_empty() {
                return Err(SiteBackupError::storage("delete", failures.join("; ")).into());
            }
        }
        Ok(())
    }
}

/// In-memory store. Listing is lexicographic, as S3's is.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    delete_calls: Mutex<Vec<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_objects<I, K, V>(objects: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let store = Self::new();
        for (key, body) in objects {
            store.insert(key, body);
        }
        store
    }

    pub fn insert(&self, key: impl Into<String>, body: impl Into<Vec<u8>>) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(key.into(), body.into());
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().ok()?.get(key).cloned()
    }

    /// Size of each delete request received, in order
    pub fn delete_calls(&self) -> Vec<usize> {
        self.delete_calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.objects
            .lock()
            .map_err(|_| SiteBackupError::storage("lock", "memory store poisoned").into())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn describe(&self) -> String {
        "memory://".to_string()
    }

    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let objects = self.lock()?;
        Ok(objects
            .keys()
            .filter(|k| prefix.map_or(true, |p| k.starts_with(p)))
            .cloned()
            .collect())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<Option<String>> {
        let body = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let etag = format!("\"{}\"", md5_hex(&body));
        self.lock()?.insert(key.to_string(), body);
        Ok(Some(etag))
    }

    async fn head(&self, key: &str) -> Result<ObjectInfo> {
        let objects = self.lock()?;
        let body = objects
            .get(key)
            .ok_or_else(|| SiteBackupError::storage("head", format!("no such key {}", key)))?;
        Ok(ObjectInfo {
            size: body.len() as u64,
            etag: Some(format!("\"{}\"", md5_hex(body))),
        })
    }

    async fn download(&self, key: &str, destination: &Path) -> Result<()> {
        let body = self
            .get(key)
            .ok_or_else(|| SiteBackupError::storage("download", format!("no such key {}", key)))?;
        tokio::fs::write(destination, body)
            .await
            .with_context(|| format!("Failed to write {}", destination.display()))?;
        Ok(())
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<()> {
        let mut objects = self.lock()?;
        for batch in keys.chunks(MAX_DELETE_BATCH) {
            if let Ok(mut calls) = self.delete_calls.lock() {
                calls.push(batch.len());
            }
            for key in batch {
                objects.remove(key);
            }
        }
        Ok(())
    }
}

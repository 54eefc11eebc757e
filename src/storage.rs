//! Blob storage for proof and reference photos.

use async_trait::async_trait;
use axum::body::Bytes;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::MAX_IMAGE_BYTES;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Upload rejected: {0}")]
    Rejected(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Object storage addressed by bucket + key, exposing public URLs
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, bytes: Bytes, content_type: &str)
        -> StorageResult<()>;

    /// Publicly resolvable URL for an object
    fn public_url(&self, bucket: &str, key: &str) -> String;

    async fn remove(&self, bucket: &str, keys: &[String]) -> StorageResult<()>;

    async fn exists(&self, bucket: &str, key: &str) -> bool;
}

/// Reject anything that is not a non-empty image within the size limit.
/// Returns the file extension to use for the object key.
pub fn check_image_payload(bytes: &[u8], content_type: &str) -> Result<&'static str, String> {
    if bytes.is_empty() {
        return Err("image payload is empty".to_string());
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(format!(
            "image is {} bytes, maximum is {} bytes",
            bytes.len(),
            MAX_IMAGE_BYTES
        ));
    }
    extension_for(content_type).ok_or_else(|| format!("unsupported content type '{}'", content_type))
}

fn extension_for(content_type: &str) -> Option<&'static str> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    match mime.as_str() {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/heic" => Some("heic"),
        "image/gif" => Some("gif"),
        _ => None,
    }
}

/// In-memory store, used by tests and when no storage directory is configured
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<(String, String), (Bytes, String)>>,
    reject_uploads: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following upload fail (quota/network simulation)
    pub fn reject_uploads(&self, reject: bool) {
        self.reject_uploads.store(reject, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> StorageResult<()> {
        if self.reject_uploads.load(Ordering::SeqCst) {
            return Err(StorageError::Rejected("storage quota exceeded".to_string()));
        }
        let mut objects = self.objects.write().await;
        let slot = (bucket.to_string(), key.to_string());
        if objects.contains_key(&slot) {
            return Err(StorageError::Rejected(format!("object {} already exists", key)));
        }
        objects.insert(slot, (bytes, content_type.to_string()));
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("memory://{}/{}", bucket, key)
    }

    async fn remove(&self, bucket: &str, keys: &[String]) -> StorageResult<()> {
        let mut objects = self.objects.write().await;
        for key in keys {
            objects.remove(&(bucket.to_string(), key.clone()));
        }
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .read()
            .await
            .contains_key(&(bucket.to_string(), key.to_string()))
    }
}

/// Filesystem store; objects are served back under `/storage`
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(bucket).join(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || bucket.is_empty() || key.is_empty() {
            return Err(StorageError::InvalidKey(format!("{}/{}", bucket, key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> StorageResult<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &bytes).await?;
        tracing::debug!("Stored {} bytes at {}", bytes.len(), path.display());
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/storage/{}/{}", self.public_base_url, bucket, key)
    }

    async fn remove(&self, bucket: &str, keys: &[String]) -> StorageResult<()> {
        for key in keys {
            let path = self.object_path(bucket, key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!("Blob {} already gone", path.display());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> bool {
        match self.object_path(bucket, key) {
            Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Storage settings
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory for the filesystem store (None = in-memory)
    pub dir: Option<PathBuf>,
    pub public_base_url: String,
}

impl StorageConfig {
    pub fn from_env() -> Self {
        let dir = match std::env::var("STORAGE_DIR") {
            Ok(dir) => {
                let trimmed = dir.trim();
                (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
            }
            Err(_) => Some(PathBuf::from("./storage")),
        };
        let public_base_url = std::env::var("PUBLIC_BASE_URL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "http://localhost:8080".to_string());

        Self {
            dir,
            public_base_url,
        }
    }

    pub fn build_store(&self) -> Arc<dyn BlobStore> {
        match &self.dir {
            Some(dir) => Arc::new(FsBlobStore::new(dir.clone(), self.public_base_url.clone())),
            None => {
                tracing::warn!("STORAGE_DIR is empty, photos are kept in memory only");
                Arc::new(MemoryBlobStore::new())
            }
        }
    }
}

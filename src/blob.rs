//! Blob storage for rendered HTML payloads.
//!
//! Cache rows only carry a handle (`html_ref`); the bytes live here. Writes go
//! to a temporary sibling first and are renamed into place, so a reader never
//! observes a half-written file.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::model::PageType;

#[derive(Debug, Error)]
pub enum BlobError {
    /// The storage root itself is missing or unreadable.
    #[error("blob store unavailable: {0}")]
    Unavailable(String),
    #[error("blob write failed for `{key}`: {source}")]
    Write {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("blob read failed for `{key}`: {source}")]
    Read {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid blob key `{0}`")]
    InvalidKey(String),
}

/// Pluggable backend holding rendered pages.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist `content` under `key`, replacing any previous payload atomically.
    async fn put(&self, key: &str, content: &[u8]) -> Result<(), BlobError>;

    /// Fetch the payload for `key`; `None` when it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), BlobError>;
}

/// Build the storage handle for a freshly rendered page.
///
/// Layout: `<page_type>/<path_slug>-<hash16>-<nonce>.html`. The nonce keeps two
/// renders of identical content for the same path from sharing a file, so a
/// purge racing a regeneration can never delete the payload of the new row.
pub fn key_for(page_type: PageType, path: &str, content_hash: &str) -> String {
    let slug = path.trim_matches('/').replace('/', "_");
    let slug = if slug.is_empty() { "index".to_string() } else { slug };
    let short_hash = &content_hash[..content_hash.len().min(16)];
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{}/{}-{}-{}.html", page_type.as_str(), slug, short_hash, &nonce[..8])
}

/// Storage backend that writes files under a local directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    base_dir: PathBuf,
}

impl FsBlobStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, BlobError> {
        let rel = Path::new(key);
        let safe = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(self.base_dir.join(rel))
    }

    async fn check_root(&self) -> Result<(), BlobError> {
        match tokio::fs::metadata(&self.base_dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(BlobError::Unavailable(format!(
                "{} is not a directory",
                self.base_dir.display()
            ))),
            Err(e) => Err(BlobError::Unavailable(format!(
                "{}: {e}",
                self.base_dir.display()
            ))),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, content: &[u8]) -> Result<(), BlobError> {
        let path = self.resolve(key)?;
        self.check_root().await?;

        let write_err = |source| BlobError::Write {
            key: key.to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::write(&tmp, content).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(write_err(e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(write_err(e));
        }

        debug!(bytes = content.len(), path = %path.display(), "blob written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.check_root().await?;
                Ok(None)
            }
            Err(source) => Err(BlobError::Read {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BlobError::Write {
                key: key.to_string(),
                source,
            }),
        }
    }
}

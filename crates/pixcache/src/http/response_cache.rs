//! # Response cache
//!
//! Raw response bodies of successful GET requests, one file per canonical request
//! key. Replayed through `on_cached` while the live request is still running.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::cache::CacheKey;
use crate::error::Result;

#[derive(Debug)]
pub struct ResponseCache {
    dir: PathBuf,
    /// Writes and deletes are exclusive; reads overlap.
    barrier: RwLock<()>,
}

impl ResponseCache {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "Response cache ready");
        Ok(Self {
            dir,
            barrier: RwLock::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, canonical_key: &str) -> PathBuf {
        self.dir
            .join(CacheKey::from_url(canonical_key).to_filename())
    }

    pub async fn load(&self, canonical_key: &str) -> Option<Bytes> {
        let path = self.path_for(canonical_key);
        let _guard = self.barrier.read().await;
        match fs::read(&path).await {
            Ok(data) => Some(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read cached response");
                None
            }
        }
    }

    pub async fn save(&self, canonical_key: &str, data: &Bytes) -> Result<()> {
        let path = self.path_for(canonical_key);
        let tmp = path.with_extension("tmp");
        let _guard = self.barrier.write().await;
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;
        debug!(key = canonical_key, size = data.len(), "Stored response");
        Ok(())
    }

    pub async fn remove(&self, canonical_key: &str) -> Result<()> {
        let path = self.path_for(canonical_key);
        let _guard = self.barrier.write().await;
        match fs::remove_file(&path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Delete every stored response.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.barrier.write().await;
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}

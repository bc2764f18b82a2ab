//! Filesystem-backed artifact store.

use crate::archive::{ARCHIVE_EXTENSION, create_archive, extract_archive};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::ids::{ArtifactHandle, RunId};
use conveyor_core::ports::{ArtifactStore, ArtifactUpload};
use conveyor_core::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const META_FILE: &str = "meta.json";

/// Metadata stored beside every archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub handle: ArtifactHandle,
    pub run_id: RunId,
    pub job: String,
    pub name: Option<String>,
    pub size_bytes: u64,
    /// Hex SHA-256 of the archive.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ArtifactMeta {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Stores each artifact as `<root>/<handle>/archive.tar.zst` plus `meta.json`.
pub struct FilesystemArtifactStore {
    root: PathBuf,
}

impl FilesystemArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store under the user's cache directory.
    pub fn default_location() -> Self {
        let root = directories::ProjectDirs::from("dev", "conveyor", "conveyor")
            .map(|dirs| dirs.cache_dir().join("artifacts"))
            .unwrap_or_else(|| std::env::temp_dir().join("conveyor-artifacts"));
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, handle: ArtifactHandle) -> PathBuf {
        self.root.join(handle.to_string())
    }

    fn archive_path(&self, handle: ArtifactHandle) -> PathBuf {
        self.entry_dir(handle).join(format!("archive.{ARCHIVE_EXTENSION}"))
    }

    /// Read the metadata of `handle`, or `None` if it was never stored.
    pub async fn meta(&self, handle: ArtifactHandle) -> Result<Option<ArtifactMeta>> {
        read_meta(&self.entry_dir(handle)).await
    }
}

async fn read_meta(dir: &Path) -> Result<Option<ArtifactMeta>> {
    match tokio::fs::read(dir.join(META_FILE)).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Artifact(format!("failed to read metadata: {e}"))),
    }
}

fn checksum(path: &Path) -> Result<(String, u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let size = std::io::copy(&mut file, &mut hasher)?;
    Ok((hex::encode(hasher.finalize()), size))
}

/// Run blocking archive work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("archive task failed: {e}")))?
}

#[async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    async fn put(&self, upload: &ArtifactUpload) -> Result<ArtifactHandle> {
        let handle = ArtifactHandle::new();
        let dir = self.entry_dir(handle);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Artifact(format!("failed to create {}: {e}", dir.display())))?;

        let archive = self.archive_path(handle);
        let paths = upload.paths.clone();
        let workspace = upload.workspace.clone();
        let packed = blocking({
            let archive = archive.clone();
            move || {
                let file = std::fs::File::create(&archive)?;
                let packed = create_archive(std::io::BufWriter::new(file), &paths, &workspace)?;
                let (checksum, size) = checksum(&archive)?;
                Ok((packed, checksum, size))
            }
        })
        .await;
        let (entries, checksum, size_bytes) = match packed {
            Ok(packed) => packed,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return Err(e);
            }
        };

        let created_at = Utc::now();
        let expire_in = chrono::Duration::from_std(upload.expire_in)
            .map_err(|e| Error::Artifact(format!("invalid expiry: {e}")))?;
        let meta = ArtifactMeta {
            handle,
            run_id: upload.run_id,
            job: upload.job.clone(),
            name: upload.name.clone(),
            size_bytes,
            checksum,
            created_at,
            expires_at: created_at + expire_in,
        };
        tokio::fs::write(dir.join(META_FILE), serde_json::to_vec_pretty(&meta)?)
            .await
            .map_err(|e| Error::Artifact(format!("failed to write metadata: {e}")))?;

        info!(
            handle = %handle,
            job = %upload.job,
            entries,
            size_bytes,
            expires_at = %meta.expires_at,
            "Stored artifacts"
        );
        Ok(handle)
    }

    async fn get(&self, handle: ArtifactHandle, dest: &Path) -> Result<Vec<PathBuf>> {
        let meta = self
            .meta(handle)
            .await?
            .ok_or_else(|| Error::ArtifactNotFound(handle.to_string()))?;
        if meta.is_expired(Utc::now()) {
            return Err(Error::ArtifactNotFound(format!("{handle} expired at {}", meta.expires_at)));
        }

        let archive = self.archive_path(handle);
        let dest = dest.to_path_buf();
        let files = blocking(move || {
            let (actual, _) = checksum(&archive)?;
            if actual != meta.checksum {
                return Err(Error::Artifact(format!(
                    "checksum mismatch for {handle}: expected {}, found {actual}",
                    meta.checksum
                )));
            }
            std::fs::create_dir_all(&dest)?;
            let file = std::fs::File::open(&archive)?;
            extract_archive(std::io::BufReader::new(file), &dest)
        })
        .await?;
        debug!(handle = %handle, files = files.len(), "Extracted artifacts");
        Ok(files)
    }

    async fn exists(&self, handle: ArtifactHandle) -> Result<bool> {
        Ok(self
            .meta(handle)
            .await?
            .is_some_and(|meta| !meta.is_expired(Utc::now())))
    }

    async fn purge_expired(&self) -> Result<usize> {
        let mut dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();
        let mut purged = 0;
        while let Some(entry) = dirs.next_entry().await? {
            let dir = entry.path();
            let expired = match read_meta(&dir).await {
                Ok(Some(meta)) => meta.is_expired(now),
                Ok(None) => false,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Unreadable artifact metadata");
                    false
                }
            };
            if expired {
                tokio::fs::remove_dir_all(&dir).await?;
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "Purged expired artifacts");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn upload(workspace: &Path, expire_in: Duration) -> ArtifactUpload {
        ArtifactUpload {
            run_id: RunId::new(),
            job: "build".to_string(),
            name: Some("dist".to_string()),
            paths: vec!["dist/".to_string()],
            workspace: workspace.to_path_buf(),
            expire_in,
        }
    }

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("dist")).unwrap();
        std::fs::write(dir.path().join("dist/app.js"), "console.log(1)").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let root = tempfile::tempdir().unwrap();
        let ws = workspace();
        let store = FilesystemArtifactStore::new(root.path());

        let handle = store.put(&upload(ws.path(), Duration::from_secs(3600))).await.unwrap();
        assert!(store.exists(handle).await.unwrap());
        let meta = store.meta(handle).await.unwrap().unwrap();
        assert_eq!(meta.job, "build");
        assert_eq!(meta.checksum.len(), 64);

        let dest = tempfile::tempdir().unwrap();
        let files = store.get(handle, dest.path()).await.unwrap();
        assert_eq!(files, vec![dest.path().join("dist/app.js")]);
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let root = tempfile::tempdir().unwrap();
        let store = FilesystemArtifactStore::new(root.path());
        let handle = ArtifactHandle::new();
        assert!(!store.exists(handle).await.unwrap());
        let err = store.get(handle, root.path()).await.unwrap_err();
        assert!(matches!(err, Error::ArtifactNotFound(_)));
    }

    #[tokio::test]
    async fn test_expired_artifacts_are_purged() {
        let root = tempfile::tempdir().unwrap();
        let ws = workspace();
        let store = FilesystemArtifactStore::new(root.path());

        let stale = store.put(&upload(ws.path(), Duration::ZERO)).await.unwrap();
        let fresh = store.put(&upload(ws.path(), Duration::from_secs(3600))).await.unwrap();
        assert!(!store.exists(stale).await.unwrap());

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.meta(stale).await.unwrap().is_none());
        assert!(store.exists(fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_tampered_archive_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let ws = workspace();
        let store = FilesystemArtifactStore::new(root.path());
        let handle = store.put(&upload(ws.path(), Duration::from_secs(60))).await.unwrap();

        std::fs::write(store.archive_path(handle), b"garbage").unwrap();
        let dest = tempfile::tempdir().unwrap();
        let err = store.get(handle, dest.path()).await.unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[tokio::test]
    async fn test_failed_put_leaves_nothing() {
        let root = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let store = FilesystemArtifactStore::new(root.path());
        assert!(store.put(&upload(ws.path(), Duration::from_secs(60))).await.is_err());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}

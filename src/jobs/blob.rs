use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Namespace of uploaded OPML files waiting to be imported.
pub const OPML_IMPORTS: &str = "opml_imports";
/// Namespace of generated OPML exports.
pub const OPML_EXPORTS: &str = "opml_exports";

/// Per-user file storage for import uploads and export artifacts.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// File contents, or `None` if there is no such file.
    async fn read(&self, user_id: i64, namespace: &str, filename: &str) -> Result<Option<Vec<u8>>>;

    /// Create or replace a file.
    async fn save(&self, user_id: i64, namespace: &str, filename: &str, data: &[u8]) -> Result<()>;

    /// Returns whether a file was removed.
    async fn delete(&self, user_id: i64, namespace: &str, filename: &str) -> Result<bool>;

    async fn exists(&self, user_id: i64, namespace: &str, filename: &str) -> Result<bool>;
}

/// Blob store on the local filesystem, laid out as
/// `<root>/<user_id>/<namespace>/<filename>`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, user_id: i64, namespace: &str, filename: &str) -> Result<PathBuf> {
        // SEC-004: Names come from uploads and job rows; never let them escape the root
        for part in [namespace, filename] {
            if part.is_empty()
                || part == "."
                || part == ".."
                || part.contains(['/', '\\', '\0'])
            {
                bail!("Invalid blob path component: {part:?}");
            }
        }
        Ok(self
            .root
            .join(user_id.to_string())
            .join(namespace)
            .join(filename))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn read(&self, user_id: i64, namespace: &str, filename: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(user_id, namespace, filename)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read '{}'", path.display())),
        }
    }

    /// Writes to a temporary file next to the target, syncs it, then renames it
    /// into place so readers never see a partial file.
    async fn save(&self, user_id: i64, namespace: &str, filename: &str, data: &[u8]) -> Result<()> {
        let path = self.path(user_id, namespace, filename)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create directory '{}'", dir.display()))?;
        }

        // SEC-009: Randomized temp filename to prevent TOCTOU race conditions
        let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
        if let Err(e) = write_synced(&temp_path, data).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e);
        }

        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e).with_context(|| {
                format!(
                    "Failed to rename '{}' to '{}'",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }

    async fn delete(&self, user_id: i64, namespace: &str, filename: &str) -> Result<bool> {
        let path = self.path(user_id, namespace, filename)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete '{}'", path.display())),
        }
    }

    async fn exists(&self, user_id: i64, namespace: &str, filename: &str) -> Result<bool> {
        let path = self.path(user_id, namespace, filename)?;
        tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("Failed to stat '{}'", path.display()))
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .with_context(|| {
            format!(
                "Failed to create temporary file '{}': check directory permissions",
                path.display()
            )
        })?;
    file.write_all(data)
        .await
        .with_context(|| format!("Failed to write temporary file '{}'", path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("Failed to sync temporary file '{}' to disk", path.display()))?;
    Ok(())
}

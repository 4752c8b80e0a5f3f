//! Audit trail persistence for uploaded artifacts.
//!
//! Every formatted payload is written to audit storage *before* the remote
//! upload is attempted; the audit record is the ground truth for "we
//! attempted this upload". Paths follow
//! `outbound/<hostname>/<YYYY-MM-DD>/<filename>`.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Audit storage configuration for a shard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuditConfig {
    /// Directory the audit tree is rooted at.
    pub directory: PathBuf,
}

/// Persists uploaded artifacts under deterministic paths.
#[async_trait]
pub trait AuditStorage: Send + Sync {
    /// Saves an artifact at a storage-relative path.
    async fn save_file(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Flushes and releases the backend at shutdown.
    async fn close(&self) -> Result<()>;
}

/// Builds audit storage for a shard; without configuration the trail is
/// disabled.
pub fn new_storage(config: Option<&AuditConfig>) -> Result<Arc<dyn AuditStorage>> {
    match config {
        Some(cfg) => Ok(Arc::new(FilesystemStorage::new(cfg.directory.clone()))),
        None => Ok(Arc::new(NoopStorage)),
    }
}

fn reject_traversal(path: &str) -> Result<&Path> {
    let p = Path::new(path);
    let escapes = p
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if escapes {
        return Err(Error::storage(format!("audit path escapes root: {path:?}")));
    }
    Ok(p)
}

/// Audit storage on the local filesystem.
#[derive(Debug)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    /// Creates storage rooted at `root`; directories are created lazily.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl AuditStorage for FilesystemStorage {
    async fn save_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.root.join(reject_traversal(path)?);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                Error::storage_with_source(format!("creating audit directory for {path}"), err)
            })?;
        }
        tokio::fs::write(&full, data)
            .await
            .map_err(|err| Error::storage_with_source(format!("writing audit record {path}"), err))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Disabled audit trail.
#[derive(Debug, Default)]
pub struct NoopStorage;

#[async_trait]
impl AuditStorage for NoopStorage {
    async fn save_file(&self, _path: &str, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory audit storage for tests.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    /// Creates empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything saved so far, keyed by path.
    #[must_use]
    pub fn files(&self) -> HashMap<String, Vec<u8>> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AuditStorage for InMemoryStorage {
    async fn save_file(&self, path: &str, data: &[u8]) -> Result<()> {
        reject_traversal(path)?;
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn filesystem_storage_writes_under_root() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FilesystemStorage::new(dir.path().to_path_buf());

        storage
            .save_file("outbound/sftp.bank.example.com/2025-01-14/f1.ach", b"records")
            .await?;

        let written = std::fs::read(
            dir.path()
                .join("outbound/sftp.bank.example.com/2025-01-14/f1.ach"),
        )
        .expect("read back");
        assert_eq!(written, b"records");

        storage.close().await
    }

    #[tokio::test]
    async fn traversal_paths_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FilesystemStorage::new(dir.path().to_path_buf());

        let err = storage.save_file("../escape.ach", b"x").await.unwrap_err();
        assert!(err.to_string().contains("escapes root"));
    }

    #[tokio::test]
    async fn in_memory_storage_records_saves() -> Result<()> {
        let storage = InMemoryStorage::new();
        storage.save_file("outbound/host/2025-01-14/a.ach", b"one").await?;

        let files = storage.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files["outbound/host/2025-01-14/a.ach"], b"one");
        Ok(())
    }
}

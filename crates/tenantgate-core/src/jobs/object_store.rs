// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filesystem-backed object store for export artifacts.
//!
//! Objects live under `<root>/exports/<workspace_id>/<job_id>/<file_name>`.
//! Keys are relative, forward-slash separated and never escape the root.
//! Artifacts are written to a `.partial` staging file next to their final
//! path and renamed into place, so readers never see a partial object.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Local directory object store.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Key of a job artifact.
    pub fn export_key(workspace_id: Uuid, job_id: Uuid, file_name: &str) -> String {
        format!("exports/{workspace_id}/{job_id}/{file_name}")
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let safe = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(Error::InvalidRequest(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(rel))
    }

    /// Staging file of `key`, with its directory created.
    pub async fn staging_path(&self, key: &str) -> Result<PathBuf> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(staging_of(&path))
    }

    /// Publish the staged file of `key`, replacing any previous content. Returns its size.
    pub async fn commit(&self, key: &str) -> Result<i64> {
        let path = self.resolve(key)?;
        let tmp = staging_of(&path);
        let size = tokio::fs::metadata(&tmp).await?.len();
        tokio::fs::rename(&tmp, &path).await?;
        debug!(key = %key, size, "Object written");
        Ok(size as i64)
    }

    /// Discard the staged file of `key`, if any.
    pub async fn abort(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(staging_of(&self.resolve(key)?)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Write an object from memory.
    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<i64> {
        let tmp = self.staging_path(key).await?;
        tokio::fs::write(&tmp, bytes).await?;
        self.commit(key).await
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found("object", key))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Open an object for streaming. Returns the file and its size.
    pub async fn open(&self, key: &str) -> Result<(tokio::fs::File, u64)> {
        let path = self.resolve(key)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("object", key));
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        Ok((file, size))
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(key)?).await?)
    }

    /// Delete an object and its job directory when empty. Missing objects are ignored.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = path.parent() {
            // Fails harmlessly when siblings (e.g. the manifest) remain.
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }
}

fn staging_of(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsStr::to_os_string).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

//! Per-evaluation scratch directories.
//!
//! A [`Workspace`] is created for exactly one sandbox invocation and is the
//! only host path mounted into its containers. The directory is removed when
//! the workspace is released, and also when it is dropped on an early return
//! or panic.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use uuid::Uuid;

use crate::error::SandboxError;

/// Uniquely named scratch directory owned by one evaluation attempt.
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    dir: TempDir,
}

impl Workspace {
    /// Create a fresh workspace under `root`.
    pub fn create(root: &Path) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(root)?;

        let id = Uuid::new_v4();
        let dir = tempfile::Builder::new()
            .prefix(&format!("ws-{}-", id))
            .tempdir_in(root)?;

        tracing::debug!(workspace_id = %id, dir = %dir.path().display(), "Created workspace");

        Ok(Self { id, dir })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write a file into the workspace.
    pub async fn write(&self, name: &str, contents: &[u8]) -> Result<PathBuf, SandboxError> {
        let path = self.path(name);
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }

    /// Remove the directory. Failures are logged, not returned.
    pub async fn release(self) {
        let id = self.id;
        let result = tokio::task::spawn_blocking(move || self.dir.close()).await;

        match result {
            Ok(Ok(())) => tracing::debug!(workspace_id = %id, "Released workspace"),
            Ok(Err(e)) => tracing::warn!(workspace_id = %id, "Failed to remove workspace: {}", e),
            Err(e) => tracing::warn!(workspace_id = %id, "Workspace cleanup task failed: {}", e),
        }
    }
}

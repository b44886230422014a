/// Workspace Provisioner and Reclaimer
///
/// A workspace is a uniquely named host directory holding the request's files
/// plus one input fixture per test (`tests/test{i}.txt`). It is read once when
/// the container is provisioned and deleted when the execution settles.
///
/// **Reclaim rules:**
/// - Explicit `reclaim()` on every orchestrator exit path
/// - Deletion failures are logged, never returned
/// - If a workspace is dropped without being reclaimed (caller cancelled the
///   future, panic), `Drop` removes it synchronously

use crate::error::{Result, SandboxError};
use bytes::Bytes;
use sandbox_common::config::fixture_relative_path;
use sandbox_common::types::{SourceFile, TestCase};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    root: PathBuf,
    reclaimed: bool,
}

impl Workspace {
    /// Materialize `files` and the test input fixtures under a fresh directory in `runs_root`
    pub async fn provision(
        runs_root: &Path,
        files: &[SourceFile],
        tests: &[TestCase],
    ) -> Result<Self> {
        tokio::fs::create_dir_all(runs_root)
            .await
            .map_err(|source| SandboxError::Provision {
                path: runs_root.to_path_buf(),
                source,
            })?;

        let id = Uuid::new_v4();
        let dir = runs_root.join(id.to_string());

        // create_dir (not create_dir_all): an existing directory is a collision and must fail
        tokio::fs::create_dir(&dir)
            .await
            .map_err(|source| SandboxError::Provision {
                path: dir.clone(),
                source,
            })?;

        let root = match tokio::fs::canonicalize(&dir).await {
            Ok(root) => root,
            Err(source) => {
                remove_quietly(&dir).await;
                return Err(SandboxError::Provision { path: dir, source });
            }
        };

        let mut workspace = Workspace {
            id,
            root,
            reclaimed: false,
        };

        if let Err(e) = workspace.populate(files, tests).await {
            workspace.reclaim().await;
            return Err(e);
        }

        debug!(
            workspace_id = %workspace.id,
            path = %workspace.root.display(),
            files = files.len(),
            fixtures = tests.len(),
            "Workspace provisioned"
        );

        Ok(workspace)
    }

    async fn populate(&self, files: &[SourceFile], tests: &[TestCase]) -> Result<()> {
        for file in files {
            let relative = checked_relative_path(&file.path)?;
            self.write(&relative, file.content.as_bytes()).await?;
        }

        for (index, test) in tests.iter().enumerate() {
            let relative = PathBuf::from(fixture_relative_path(index));
            self.write(&relative, test.input.as_bytes()).await?;
        }

        Ok(())
    }

    async fn write(&self, relative: &Path, content: &[u8]) -> Result<()> {
        let target = self.root.join(relative);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SandboxError::Provision {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        tokio::fs::write(&target, content)
            .await
            .map_err(|source| SandboxError::Provision {
                path: target,
                source,
            })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Absolute host path of the workspace
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Pack the workspace into an uncompressed tar whose entries live under `prefix`
    pub async fn archive(&self, prefix: &str) -> Result<Bytes> {
        let root = self.root.clone();
        let prefix = prefix.trim_matches('/').to_string();

        let packed = tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            builder.follow_symlinks(false);
            builder.append_dir_all(&prefix, &root)?;
            builder.into_inner()
        })
        .await
        .map_err(|e| SandboxError::Provision {
            path: self.root.clone(),
            source: io::Error::new(io::ErrorKind::Other, e),
        })?;

        packed
            .map(Bytes::from)
            .map_err(|source| SandboxError::Provision {
                path: self.root.clone(),
                source,
            })
    }

    /// Delete the workspace tree. Failures are logged only.
    pub async fn reclaim(&mut self) {
        if self.reclaimed {
            return;
        }
        self.reclaimed = true;

        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => debug!(workspace_id = %self.id, "Workspace reclaimed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                workspace_id = %self.id,
                path = %self.root.display(),
                error = %e,
                "Failed to delete workspace"
            ),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.reclaimed {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(
                    workspace_id = %self.id,
                    path = %self.root.display(),
                    error = %e,
                    "Failed to delete abandoned workspace"
                );
            }
        }
    }
}

async fn remove_quietly(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!(path = %dir.display(), error = %e, "Failed to delete partial workspace");
    }
}

/// Validate a request file path: relative, non-empty, no `..`, no root or prefix.
/// Returns the normalized path (`./a//b` becomes `a/b`).
pub fn checked_relative_path(path: &str) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();

    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::InvalidRequest(format!(
                    "file path must stay inside the workspace: {}",
                    path
                )));
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(SandboxError::InvalidRequest(format!(
            "file path must name a file: {:?}",
            path
        )));
    }

    Ok(normalized)
}

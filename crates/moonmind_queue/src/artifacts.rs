//! Artifact Storage (spec §4.2).
//!
//! One root directory, one subdirectory per job named by its UUID. Grounded on
//! `casparian_sinks`'s filesystem-writer idiom (resolve destination, create parent dirs,
//! write, return the path actually used) generalized with the traversal guards this
//! domain needs: rejecting absolute paths, `..` components, and any final path that
//! canonicalizes outside the job directory.

use std::path::{Path, PathBuf};

use moonmind_core::error::{Error, Result};
use moonmind_core::ids::JobId;
use moonmind_db::Repository;

/// Writes job artifacts under a single root, one subdirectory per job UUID.
pub struct ArtifactStore {
    root: PathBuf,
    max_bytes: i64,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, max_bytes: i64) -> Self {
        Self {
            root: root.into(),
            max_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate `name` has no path-traversal components. Rejects absolute paths and any
    /// `..`/empty segment; a bare filename or a short relative subpath is fine.
    fn validate_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::validation("artifact name must not be empty"));
        }
        let path = Path::new(name);
        if path.is_absolute() {
            return Err(Error::validation("artifact name must not be an absolute path"));
        }
        for component in path.components() {
            match component {
                std::path::Component::Normal(_) => {}
                _ => {
                    return Err(Error::validation(
                        "artifact name must not contain '..' or root components",
                    ))
                }
            }
        }
        Ok(())
    }

    /// Resolve `job_id`'s subdirectory under the root, creating it if absent.
    async fn job_dir(&self, job_id: JobId) -> Result<PathBuf> {
        let dir = self.root.join(job_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Check the destination's parent directory, once created, canonicalizes to
    /// somewhere strictly inside the job directory. Catches a symlink planted inside
    /// the job directory by an earlier write; `validate_name` already rejects `..` and
    /// absolute names, so this is defense in depth rather than the primary guard.
    fn assert_contained(job_dir_canon: &Path, parent: &Path) -> Result<()> {
        let parent_canon = parent
            .canonicalize()
            .map_err(|e| Error::validation(format!("invalid artifact path: {e}")))?;
        if parent_canon != job_dir_canon && !parent_canon.starts_with(job_dir_canon) {
            return Err(Error::validation(
                "artifact name resolves outside the job directory",
            ));
        }
        Ok(())
    }

    /// Write `bytes` under `job_id`'s directory at `name`, enforcing the size cap and,
    /// when `worker_id` is supplied, that the job is `RUNNING` and claimed by that
    /// worker. Returns the POSIX-form relative path `{job}/{name}`.
    pub async fn write_artifact(
        &self,
        repo: &Repository,
        job_id: JobId,
        name: &str,
        bytes: &[u8],
        worker_id: Option<&str>,
    ) -> Result<String> {
        if (bytes.len() as i64) > self.max_bytes {
            return Err(Error::too_large(format!(
                "artifact is {} bytes, exceeding the {} byte limit",
                bytes.len(),
                self.max_bytes
            )));
        }
        Self::validate_name(name)?;

        let job = repo.require_job(job_id).await?;
        if let Some(worker_id) = worker_id {
            let owned = job.status == moonmind_core::JobStatus::Running
                && job.claimed_by.as_deref() == Some(worker_id);
            if !owned {
                return Err(Error::ownership(format!(
                    "job {job_id} is not running and claimed by {worker_id}"
                )));
            }
        }

        let dir = self.job_dir(job_id).await?;
        let dir_canon = dir
            .canonicalize()
            .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
        let destination = dir.join(name);
        let parent = destination.parent().unwrap_or(&dir);
        tokio::fs::create_dir_all(parent).await?;
        Self::assert_contained(&dir_canon, parent)?;
        tokio::fs::write(&destination, bytes).await?;

        Ok(format!("{job_id}/{}", name.replace('\\', "/")))
    }

    /// Resolve a stored relative path (as returned by [`Self::write_artifact`]) back to
    /// an absolute filesystem path, re-applying the same containment check downloads
    /// rely on.
    pub fn resolve(&self, relative_path: &str) -> Result<PathBuf> {
        let rel = Path::new(relative_path);
        if rel.is_absolute() {
            return Err(Error::validation("artifact path must not be absolute"));
        }
        for component in rel.components() {
            if matches!(component, std::path::Component::ParentDir) {
                return Err(Error::validation("artifact path must not contain '..'"));
            }
        }
        let destination = self.root.join(rel);
        let root_canon = self
            .root
            .canonicalize()
            .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
        let destination_canon = destination
            .canonicalize()
            .map_err(|e| Error::not_found("artifact_not_found", format!("{e}")))?;
        if !destination_canon.starts_with(&root_canon) {
            return Err(Error::validation(
                "artifact path resolves outside the storage root",
            ));
        }
        Ok(destination_canon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moonmind_db::{create_pool, schema::migrate, DbConfig, Repository};

    async fn test_repo() -> Repository {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        migrate(&pool).await.unwrap();
        Repository::new(pool)
    }

    #[tokio::test]
    async fn rejects_traversal_names() {
        let dir = tempdir();
        let store = ArtifactStore::new(dir.path(), 1024);
        let repo = test_repo().await;
        let job = repo
            .create_job(
                moonmind_core::JobType::Task,
                serde_json::json!({}),
                0,
                None,
                None,
                None,
                3,
            )
            .await
            .unwrap();

        let err = store
            .write_artifact(&repo, job.id, "../escape.txt", b"x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let err = store
            .write_artifact(&repo, job.id, "/etc/passwd", b"x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn writes_and_resolves_roundtrip() {
        let dir = tempdir();
        let store = ArtifactStore::new(dir.path(), 1024);
        let repo = test_repo().await;
        let job = repo
            .create_job(
                moonmind_core::JobType::Task,
                serde_json::json!({}),
                0,
                None,
                None,
                None,
                3,
            )
            .await
            .unwrap();

        let rel = store
            .write_artifact(&repo, job.id, "log.txt", b"hello", None)
            .await
            .unwrap();
        assert_eq!(rel, format!("{}/log.txt", job.id));
        let resolved = store.resolve(&rel).unwrap();
        assert_eq!(std::fs::read(resolved).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn enforces_size_cap() {
        let dir = tempdir();
        let store = ArtifactStore::new(dir.path(), 4);
        let repo = test_repo().await;
        let job = repo
            .create_job(
                moonmind_core::JobType::Task,
                serde_json::json!({}),
                0,
                None,
                None,
                None,
                3,
            )
            .await
            .unwrap();

        let err = store
            .write_artifact(&repo, job.id, "big.bin", b"too big", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { is_too_large: true, .. }));
    }

    #[tokio::test]
    async fn enforces_worker_ownership_when_requested() {
        let dir = tempdir();
        let store = ArtifactStore::new(dir.path(), 1024);
        let repo = test_repo().await;
        let job = repo
            .create_job(
                moonmind_core::JobType::Task,
                serde_json::json!({"requiredCapabilities": ["git"]}),
                0,
                None,
                None,
                None,
                3,
            )
            .await
            .unwrap();

        let err = store
            .write_artifact(&repo, job.id, "log.txt", b"hi", Some("worker-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ownership { .. }));
    }

    /// Minimal drop-on-scope temp directory so this module doesn't need `tempfile`.
    struct TempDir(PathBuf);
    impl TempDir {
        fn path(&self) -> &Path {
            &self.0
        }
    }
    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }
    fn tempdir() -> TempDir {
        let dir = std::env::temp_dir().join(format!("moonmind-artifacts-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        TempDir(dir)
    }
}

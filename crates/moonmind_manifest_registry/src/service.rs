//! Manifest Registry Service (spec §4.8): CRUD over named manifests, idempotent-by-hash
//! versioning, submission of `manifest`-type queue jobs carrying registry-source refs.
//!
//! Grounded on `original_source/api_service/services/manifests_service.py`'s
//! `ManifestsService`: `upsert_manifest` re-normalizes the `inline` source through the
//! manifest contract to recompute the hash, `submit_manifest_run` rebuilds the payload
//! with `source.kind = "registry"` and delegates to the queue service the same way
//! `moonmind_proposals::service::ProposalService::promote_proposal` delegates job
//! creation to `QueueService::create_job`.

use serde_json::{json, Value};

use moonmind_core::error::{Error, Result};
use moonmind_core::job::JobType;
use moonmind_core::manifest_registry::ManifestRegistryRecord;
use moonmind_core::Job;
use moonmind_db::Repository;
use moonmind_queue::QueueService;

pub struct ManifestRegistryService<'a> {
    repo: &'a Repository,
    queue: &'a QueueService<'a>,
}

impl<'a> ManifestRegistryService<'a> {
    pub fn new(repo: &'a Repository, queue: &'a QueueService<'a>) -> Self {
        Self { repo, queue }
    }

    /// Normalize `content` through the manifest contract (requires `metadata.name ==
    /// name`), compute its hash, and create or update the registry row.
    pub async fn upsert_manifest(&self, name: &str, content: &str) -> Result<ManifestRegistryRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("manifest name is required"));
        }
        let payload = json!({
            "manifest": {
                "name": name,
                "action": "plan",
                "source": {"kind": "inline", "content": content},
            }
        });
        let view = moonmind_contracts::manifest::normalize_manifest_payload(&payload, false)?;
        let record = self
            .repo
            .upsert_manifest_registry_entry(name, content, &view.manifest_hash)
            .await?;
        tracing::info!(manifest = %record.name, version = record.version, "upserted manifest registry entry");
        Ok(record)
    }

    pub async fn get_manifest(&self, name: &str) -> Result<Option<ManifestRegistryRecord>> {
        self.repo.get_manifest_registry_entry(name).await
    }

    pub async fn require_manifest(&self, name: &str) -> Result<ManifestRegistryRecord> {
        self.get_manifest(name)
            .await?
            .ok_or_else(|| Error::not_found("manifest_not_found", format!("manifest '{name}' was not found")))
    }

    pub async fn list_manifests(&self, limit: i64) -> Result<Vec<ManifestRegistryRecord>> {
        self.repo.list_manifest_registry_entries(limit).await
    }

    /// Fetch the record, build a `manifest`-typed job payload with `source.kind =
    /// "registry"`, create the job (re-validated and capability-derived by
    /// `QueueService::create_job`), and stamp the registry row's `last_run_*` fields.
    pub async fn submit_manifest_run(
        &self,
        name: &str,
        action: &str,
        options: Option<Value>,
        user_id: Option<String>,
    ) -> Result<Job> {
        let record = self.require_manifest(name).await?;

        let mut manifest = json!({
            "name": record.name,
            "action": action,
            "source": {
                "kind": "registry",
                "name": record.name,
                "content": record.content,
            },
        });
        if let Some(options) = options {
            manifest["options"] = options;
        }
        let payload = json!({ "manifest": manifest });

        let job = self
            .queue
            .create_job(JobType::Manifest, payload, 0, user_id.clone(), user_id, None, 3)
            .await?;

        self.repo
            .record_manifest_run(&record.name, job.id, job.status.as_str(), Some(job.created_at), None)
            .await?;
        tracing::info!(manifest = %record.name, job_id = %job.id, "submitted manifest run");
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moonmind_db::{create_pool, schema::migrate, DbConfig};
    use moonmind_queue::QueueServiceConfig;

    async fn test_repo() -> Repository {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        migrate(&pool).await.unwrap();
        Repository::new(pool)
    }

    fn queue_config() -> QueueServiceConfig {
        QueueServiceConfig {
            default_target_runtime: "codex".to_string(),
            default_publish_mode: "none".to_string(),
            artifact_max_bytes: 1024,
            allow_manifest_path_source: false,
            retry_backoff_base_seconds: 5,
            retry_backoff_max_seconds: 900,
        }
    }

    const SAMPLE_MANIFEST: &str = "version: v0\nmetadata:\n  name: nightly-index\nsteps: []\n";

    #[tokio::test]
    async fn upsert_is_idempotent_by_content_hash() {
        let repo = test_repo().await;
        let qcfg = queue_config();
        let queue = QueueService::new(&repo, &qcfg);
        let service = ManifestRegistryService::new(&repo, &queue);

        let first = service.upsert_manifest("nightly-index", SAMPLE_MANIFEST).await.unwrap();
        assert_eq!(first.version, 1);

        let second = service.upsert_manifest("nightly-index", SAMPLE_MANIFEST).await.unwrap();
        assert_eq!(second.version, 1);
        assert_eq!(second.content_hash, first.content_hash);

        let changed = service
            .upsert_manifest("nightly-index", "version: v0\nmetadata:\n  name: nightly-index\nsteps: [a]\n")
            .await
            .unwrap();
        assert_eq!(changed.version, 2);
    }

    #[tokio::test]
    async fn upsert_requires_metadata_name_match() {
        let repo = test_repo().await;
        let qcfg = queue_config();
        let queue = QueueService::new(&repo, &qcfg);
        let service = ManifestRegistryService::new(&repo, &queue);

        let err = service
            .upsert_manifest("nightly-index", "version: v0\nmetadata:\n  name: other-name\nsteps: []\n")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Contract { .. }));
    }

    #[tokio::test]
    async fn submit_run_requires_existing_manifest() {
        let repo = test_repo().await;
        let qcfg = queue_config();
        let queue = QueueService::new(&repo, &qcfg);
        let service = ManifestRegistryService::new(&repo, &queue);

        let err = service
            .submit_manifest_run("missing", "run", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn submit_run_creates_job_and_stamps_last_run() {
        let repo = test_repo().await;
        let qcfg = queue_config();
        let queue = QueueService::new(&repo, &qcfg);
        let service = ManifestRegistryService::new(&repo, &queue);

        service.upsert_manifest("nightly-index", SAMPLE_MANIFEST).await.unwrap();
        let job = service
            .submit_manifest_run("nightly-index", "run", None, Some("user-1".to_string()))
            .await
            .unwrap();

        let record = service.require_manifest("nightly-index").await.unwrap();
        assert_eq!(record.last_run_job_id, Some(job.id));
        assert_eq!(record.last_run_status.as_deref(), Some(job.status.as_str()));
        assert!(record.last_run_started_at.is_some());
        assert!(record.last_run_finished_at.is_none());
    }
}

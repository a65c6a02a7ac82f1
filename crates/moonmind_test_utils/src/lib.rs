//! Shared test fixtures for every MoonMind crate: an in-memory sqlite pool with the
//! schema already applied, plus builders for a minimal valid task payload, a minimal
//! valid manifest YAML document, and a worker token fixture (spec SPEC_FULL.md §9.4).
//!
//! Grounded on the teacher's `casparian_test_utils` crate — same role (a shared
//! dev-dependency every other crate's test module reaches for) adapted from
//! Docker-backed Postgres/MSSQL fixtures to the sqlite-only embedded-migration model
//! this workspace actually uses.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use moonmind_core::principal::WorkerPolicy;
use moonmind_db::{create_pool, schema::migrate, DbConfig, DbPool, Repository};

/// Build an in-memory sqlite pool with the full schema migrated, ready for a
/// `Repository`. Each call gets an isolated database.
pub async fn test_pool() -> DbPool {
    let pool = create_pool(DbConfig::sqlite_memory())
        .await
        .expect("in-memory sqlite pool should always connect");
    migrate(&pool).await.expect("embedded schema migration should always succeed");
    pool
}

/// Build a `Repository` backed by a fresh in-memory sqlite pool.
pub async fn test_repository() -> Repository {
    Repository::new(test_pool().await)
}

/// A minimal valid `type=task` queue-job payload targeting `repository`, with a plain
/// instruction and no required capabilities.
pub fn sample_task_payload(repository: &str) -> Value {
    json!({
        "repository": repository,
        "task": {
            "instructions": "run the default workflow",
        },
    })
}

/// A `type=task` payload that also declares `requiredCapabilities`, for exercising
/// capability-gated claim tests.
pub fn sample_task_payload_with_capabilities(repository: &str, capabilities: &[&str]) -> Value {
    let mut payload = sample_task_payload(repository);
    payload["requiredCapabilities"] = json!(capabilities);
    payload
}

/// A minimal valid manifest YAML document (`version: v0`, one metadata block, no
/// steps), suitable for `moonmind_contracts::manifest::normalize_manifest_payload`.
pub fn sample_manifest_yaml(name: &str) -> String {
    format!("version: v0\nmetadata:\n  name: {name}\nsteps: []\n")
}

/// Hash `raw_token` the same way `QueueService::resolve_worker_token` does, so callers
/// can hand the raw token to a claim/auth call and store the hash via
/// `Repository::create_worker_token`.
pub fn hash_worker_token(raw_token: &str) -> String {
    hex::encode(Sha256::digest(raw_token.as_bytes()))
}

/// Create an active worker token row for `worker_id` with `capabilities`, returning the
/// raw bearer token a test can present (never persisted in plaintext).
pub async fn create_worker_token_fixture(
    repo: &Repository,
    worker_id: &str,
    capabilities: &[&str],
) -> String {
    let raw_token = format!("mmwt_test_{}", uuid::Uuid::new_v4().simple());
    let token_hash = hash_worker_token(&raw_token);
    repo.create_worker_token(
        worker_id,
        &token_hash,
        Some("test fixture".to_string()),
        None,
        None,
        capabilities.iter().map(|c| c.to_string()).collect(),
    )
    .await
    .expect("worker token fixture insert should always succeed");
    raw_token
}

/// A `WorkerPolicy` fixture for tests that exercise service methods directly without
/// going through token resolution.
pub fn sample_worker_policy(worker_id: &str, capabilities: &[&str]) -> WorkerPolicy {
    WorkerPolicy {
        worker_id: worker_id.to_string(),
        allowed_repositories: None,
        allowed_job_types: None,
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        auth_source: moonmind_core::principal::AuthSource::WorkerToken,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_runs_migrations() {
        let repo = test_repository().await;
        let jobs = repo.list_jobs(None, None, 10).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn worker_token_fixture_round_trips() {
        let repo = test_repository().await;
        let raw = create_worker_token_fixture(&repo, "worker-1", &["codex", "git"]).await;
        let hash = hash_worker_token(&raw);
        let record = repo.get_worker_token_by_hash(&hash).await.unwrap();
        assert!(record.is_some());
        assert_eq!(record.unwrap().worker_id, "worker-1");
    }

    #[test]
    fn sample_manifest_yaml_round_trips_through_yaml() {
        let yaml = sample_manifest_yaml("nightly-index");
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed["metadata"]["name"].as_str(), Some("nightly-index"));
    }
}

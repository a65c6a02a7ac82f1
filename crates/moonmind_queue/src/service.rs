//! Queue Service policy layer (spec §4.5): input validation, worker-token auth,
//! capability intersection, telemetry, and operator messages, layered on top of
//! `Repository`'s transactional primitives and `moonmind_contracts`'s payload
//! normalization.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use moonmind_core::error::{Error, Result};
use moonmind_core::ids::JobId;
use moonmind_core::job::{Job, JobEventLevel, JobStatus, JobType, STAGE_EXECUTE, STAGE_PREPARE, STAGE_PUBLISH};
use moonmind_core::principal::{AuthSource, WorkerPolicy};
use moonmind_db::Repository;

const MIN_LIST_LIMIT: i64 = 1;
const MAX_JOB_LIST_LIMIT: i64 = 200;
const MAX_EVENT_ARTIFACT_LIMIT: i64 = 500;
const MAX_TELEMETRY_LIMIT: i64 = 20_000;
const MAX_OPERATOR_MESSAGE_CHARS: usize = 4000;

fn validate_limit(limit: i64, max: i64, field: &str) -> Result<i64> {
    if limit < MIN_LIST_LIMIT || limit > max {
        return Err(Error::validation(format!(
            "{field} must be between {MIN_LIST_LIMIT} and {max}"
        )));
    }
    Ok(limit)
}

/// `min(max, base * 2^(attempt-1))` (spec §4.1). `attempt` is the job's attempt count
/// at the moment of the failing run, before `fail_job` increments it for the retry.
fn retry_backoff_delay(attempt: i32, base: i64, max: i64) -> i64 {
    let exponent = attempt.saturating_sub(1).max(0) as u32;
    let multiplier = 1i64.checked_shl(exponent.min(62)).unwrap_or(i64::MAX);
    base.saturating_mul(multiplier).clamp(1, max.max(1))
}

/// Runtime configuration the service layer needs beyond what `Repository` already
/// knows — defaults for payload normalization and validation bounds (spec §6).
pub struct QueueServiceConfig {
    pub default_target_runtime: String,
    pub default_publish_mode: String,
    pub artifact_max_bytes: i64,
    pub allow_manifest_path_source: bool,
    /// Base delay for the retry back-off formula `min(max, base * 2^(attempt-1))`
    /// (spec §4.1).
    pub retry_backoff_base_seconds: i64,
    pub retry_backoff_max_seconds: i64,
}

pub struct QueueService<'a> {
    repo: &'a Repository,
    config: &'a QueueServiceConfig,
}

impl<'a> QueueService<'a> {
    pub fn new(repo: &'a Repository, config: &'a QueueServiceConfig) -> Self {
        Self { repo, config }
    }

    /// Normalize the payload through the Canonical Task Payload Contract (for `task`
    /// and the legacy `codex_exec`/`codex_skill` types), through the Manifest Contract
    /// (for `manifest`), or pass it through unchanged for everything else, then persist
    /// the job.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_job(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        priority: i32,
        created_by_user_id: Option<String>,
        requested_by_user_id: Option<String>,
        affinity_key: Option<String>,
        max_attempts: i32,
    ) -> Result<Job> {
        let normalized = if job_type == JobType::Manifest {
            // `ManifestView::to_json` already carries `requiredCapabilities` in the
            // camelCase shape `Job::required_capabilities` reads.
            moonmind_contracts::manifest::normalize_manifest_payload(
                &payload,
                self.config.allow_manifest_path_source,
            )?
            .to_json()
        } else {
            moonmind_contracts::normalize_queue_job_payload(
                job_type.as_str(),
                Some(&payload),
                &self.config.default_target_runtime,
                &self.config.default_publish_mode,
            )?
        };

        let job = self
            .repo
            .create_job(
                job_type,
                normalized,
                priority,
                created_by_user_id,
                requested_by_user_id,
                affinity_key,
                max_attempts,
            )
            .await?;

        self.repo
            .append_event(job.id, JobEventLevel::Info, "Job queued", None)
            .await?;
        if job_type.is_legacy() {
            self.repo
                .append_event(
                    job.id,
                    JobEventLevel::Warn,
                    "Legacy job type submitted",
                    Some(serde_json::json!({"type": job_type.as_str()})),
                )
                .await?;
        }
        Ok(job)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job> {
        self.repo.require_job(job_id).await
    }

    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        job_type: Option<JobType>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let limit = validate_limit(limit, MAX_JOB_LIST_LIMIT, "limit")?;
        self.repo.list_jobs(status, job_type, limit).await
    }

    /// Claim the next eligible job for `policy.worker_id`, intersecting `allowed_types`
    /// from the caller with `policy.allowed_job_types` from the token (spec §4.5).
    pub async fn claim_job(
        &self,
        policy: &WorkerPolicy,
        lease_seconds: i64,
        requested_types: Option<&[String]>,
    ) -> Result<Option<Job>> {
        let allowed_types = intersect_allowed_types(requested_types, policy.allowed_job_types.as_deref())?;
        let job = self
            .repo
            .claim_job(
                &policy.worker_id,
                lease_seconds,
                allowed_types.as_deref(),
                policy.allowed_repositories.as_deref(),
                Some(policy.capabilities.as_slice()),
            )
            .await?;
        if let Some(job) = &job {
            self.repo
                .append_event(
                    job.id,
                    JobEventLevel::Info,
                    "Job claimed",
                    Some(serde_json::json!({"workerId": policy.worker_id})),
                )
                .await?;
        }
        Ok(job)
    }

    pub async fn heartbeat(&self, policy: &WorkerPolicy, job_id: JobId, lease_seconds: i64) -> Result<Job> {
        let job = self
            .repo
            .heartbeat(job_id, &policy.worker_id, lease_seconds)
            .await?;
        self.repo
            .append_event(job_id, JobEventLevel::Info, "Heartbeat received", None)
            .await?;
        Ok(job)
    }

    pub async fn request_cancel(
        &self,
        job_id: JobId,
        requested_by_user_id: Option<String>,
        reason: Option<String>,
    ) -> Result<Job> {
        let (job, outcome) = self
            .repo
            .request_cancel(job_id, requested_by_user_id, reason)
            .await?;
        match outcome {
            "queued_cancelled" => {
                self.repo
                    .append_event(job_id, JobEventLevel::Info, "Job cancelled", None)
                    .await?;
            }
            "running_requested" => {
                self.repo
                    .append_event(job_id, JobEventLevel::Warn, "Cancellation requested", None)
                    .await?;
            }
            _ => {}
        }
        Ok(job)
    }

    pub async fn ack_cancel(&self, policy: &WorkerPolicy, job_id: JobId) -> Result<Job> {
        let (job, outcome) = self.repo.ack_cancel(job_id, &policy.worker_id).await?;
        if outcome == "acknowledged" {
            self.repo
                .append_event(job_id, JobEventLevel::Info, "Job cancelled", None)
                .await?;
        }
        Ok(job)
    }

    pub async fn complete_job(
        &self,
        policy: &WorkerPolicy,
        job_id: JobId,
        result_summary: Option<serde_json::Value>,
    ) -> Result<Job> {
        let job = self
            .repo
            .complete_job(job_id, &policy.worker_id, result_summary)
            .await?;
        self.repo
            .append_event(job_id, JobEventLevel::Info, "Job completed", None)
            .await?;
        Ok(job)
    }

    /// Compute the retry delay from the job's current `attempt` and this service's
    /// back-off config, ignoring any caller-supplied override (spec §4.1: "Retry
    /// back-off (Service layer)"). A client cannot widen or shrink its own back-off by
    /// passing a delay; only the service layer derives `next_attempt_at`.
    pub async fn fail_job(
        &self,
        policy: &WorkerPolicy,
        job_id: JobId,
        error_message: &str,
        retryable: bool,
    ) -> Result<Job> {
        let current = self.repo.require_job(job_id).await?;
        let retry_delay_seconds = retry_backoff_delay(
            current.attempt,
            self.config.retry_backoff_base_seconds,
            self.config.retry_backoff_max_seconds,
        );
        let job = self
            .repo
            .fail_job(
                job_id,
                &policy.worker_id,
                error_message,
                retryable,
                retry_delay_seconds,
            )
            .await?;
        let (message, level) = match job.status {
            JobStatus::Cancelled => ("Job cancelled", JobEventLevel::Info),
            JobStatus::Queued => ("Job failed (retryable)", JobEventLevel::Warn),
            _ => ("Job failed", JobEventLevel::Error),
        };
        self.repo
            .append_event(job_id, level, message, Some(serde_json::json!({"error": error_message})))
            .await?;
        Ok(job)
    }

    pub async fn list_artifacts(&self, job_id: JobId, limit: i64) -> Result<Vec<moonmind_core::JobArtifact>> {
        let limit = validate_limit(limit, MAX_EVENT_ARTIFACT_LIMIT, "limit")?;
        self.repo.list_artifacts(job_id, limit).await
    }

    pub async fn list_events(
        &self,
        job_id: JobId,
        limit: i64,
        after: Option<(DateTime<Utc>, moonmind_core::EventId)>,
        before: Option<(DateTime<Utc>, moonmind_core::EventId)>,
        descending: bool,
    ) -> Result<Vec<moonmind_core::JobEvent>> {
        let limit = validate_limit(limit, MAX_EVENT_ARTIFACT_LIMIT, "limit")?;
        self.repo
            .list_events(job_id, limit, after, before, descending)
            .await
    }

    /// Hash `raw` (sha256) and look up its worker token, rejecting inactive/missing
    /// tokens with `AuthenticationError` (spec §4.5).
    pub async fn resolve_worker_token(&self, raw: &str) -> Result<WorkerPolicy> {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(raw.as_bytes());
        let token_hash = hex::encode(digest);

        let record = self
            .repo
            .get_worker_token_by_hash(&token_hash)
            .await?
            .ok_or_else(|| Error::authentication("unknown worker token"))?;
        if !record.is_active {
            return Err(Error::authentication("worker token has been revoked"));
        }
        self.repo.touch_worker_token_last_used(record.id).await?;

        Ok(WorkerPolicy {
            worker_id: record.worker_id,
            allowed_repositories: record.allowed_repositories,
            allowed_job_types: record.allowed_job_types,
            capabilities: record.capabilities,
            auth_source: AuthSource::WorkerToken,
        })
    }

    /// Require `policy.worker_id == requested_worker_id` on any mutating worker verb
    /// (spec §4.5).
    pub fn require_worker_identity(policy: &WorkerPolicy, requested_worker_id: &str) -> Result<()> {
        if policy.worker_id != requested_worker_id {
            return Err(Error::authorization(format!(
                "token is scoped to worker {}, not {requested_worker_id}",
                policy.worker_id
            )));
        }
        Ok(())
    }

    /// Enumerate recent jobs, group by type, classify failure stages from their event
    /// stream, and compute publish outcome rates (spec §4.5).
    pub async fn get_migration_telemetry(
        &self,
        window_hours: i64,
        limit: i64,
    ) -> Result<MigrationTelemetry> {
        let limit = validate_limit(limit, MAX_TELEMETRY_LIMIT, "limit")?;
        let since = Utc::now() - chrono::Duration::hours(window_hours.max(0));
        let jobs = self.repo.list_jobs_for_telemetry(Some(since), limit).await?;

        let mut by_type: BTreeMap<String, i64> = BTreeMap::new();
        let mut legacy_count: i64 = 0;
        let mut publish_outcomes: BTreeMap<String, i64> = BTreeMap::new();
        for job in &jobs {
            *by_type.entry(job.job_type.as_str().to_string()).or_default() += 1;
            if job.job_type.is_legacy() {
                legacy_count += 1;
            }
        }

        let job_ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        let event_limit = limit + 1;
        let events = self
            .repo
            .list_events_for_jobs(&job_ids, Some(since), event_limit)
            .await?;
        let events_truncated = events.len() as i64 >= event_limit;

        let mut stage_counts: BTreeMap<&'static str, i64> = BTreeMap::new();
        for event in &events {
            if event.level != moonmind_core::JobEventLevel::Error {
                continue;
            }
            let stage = classify_failure_stage(&event.message);
            *stage_counts.entry(stage).or_default() += 1;
        }

        for job in &jobs {
            let outcome = match job.payload.get("task").and_then(|t| t.get("publish")).and_then(|p| p.get("mode")).and_then(|v| v.as_str()) {
                Some("none") | None => "skipped",
                Some(_) if job.status == JobStatus::Succeeded => "published",
                Some(_) if job.status.is_terminal() => "failed",
                Some(_) => "requested",
            };
            *publish_outcomes.entry(outcome.to_string()).or_default() += 1;
        }

        Ok(MigrationTelemetry {
            total_jobs: jobs.len() as i64,
            by_type,
            legacy_count,
            failure_stage_counts: stage_counts
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            publish_outcomes,
            events_truncated,
        })
    }

    /// Record an operator message: trim required, max 4000 chars, stored as a control
    /// event and a job event (spec §4.5).
    pub async fn send_operator_message(
        &self,
        job_id: JobId,
        actor_user_id: Option<String>,
        message: &str,
    ) -> Result<()> {
        let trimmed = message.trim();
        if trimmed.is_empty() {
            return Err(Error::validation("operator message must not be empty"));
        }
        if trimmed.chars().count() > MAX_OPERATOR_MESSAGE_CHARS {
            return Err(Error::validation(format!(
                "operator message must be at most {MAX_OPERATOR_MESSAGE_CHARS} characters"
            )));
        }
        self.repo
            .append_control_event(
                job_id,
                actor_user_id,
                "operator_message",
                Some(serde_json::json!({"message": trimmed})),
            )
            .await?;
        self.repo
            .append_event(
                job_id,
                JobEventLevel::Info,
                "Operator message",
                Some(serde_json::json!({"message": trimmed})),
            )
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MigrationTelemetry {
    pub total_jobs: i64,
    pub by_type: BTreeMap<String, i64>,
    pub legacy_count: i64,
    pub failure_stage_counts: BTreeMap<String, i64>,
    pub publish_outcomes: BTreeMap<String, i64>,
    pub events_truncated: bool,
}

fn classify_failure_stage(message: &str) -> &'static str {
    if message.contains(STAGE_PREPARE) {
        "prepare"
    } else if message.contains(STAGE_EXECUTE) {
        "execute"
    } else if message.contains(STAGE_PUBLISH) {
        "publish"
    } else {
        "unknown"
    }
}

/// Intersect request-scoped `allowed_types` with the token's `allowed_job_types`.
/// `None` on either side means "unrestricted"; an empty intersection is an error
/// (spec §4.5).
fn intersect_allowed_types(
    requested: Option<&[String]>,
    token_scoped: Option<&[String]>,
) -> Result<Option<Vec<String>>> {
    match (requested, token_scoped) {
        (None, None) => Ok(None),
        (Some(r), None) => Ok(Some(r.to_vec())),
        (None, Some(t)) => Ok(Some(t.to_vec())),
        (Some(r), Some(t)) => {
            let intersection: Vec<String> = r.iter().filter(|x| t.contains(x)).cloned().collect();
            if intersection.is_empty() {
                return Err(Error::authorization(
                    "requested job types and token's allowed job types do not overlap",
                ));
            }
            Ok(Some(intersection))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moonmind_db::{create_pool, schema::migrate, DbConfig};

    async fn test_repo() -> Repository {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        migrate(&pool).await.unwrap();
        Repository::new(pool)
    }

    fn config() -> QueueServiceConfig {
        QueueServiceConfig {
            default_target_runtime: "codex".to_string(),
            default_publish_mode: "pr".to_string(),
            artifact_max_bytes: 1024 * 1024,
            allow_manifest_path_source: false,
            retry_backoff_base_seconds: 5,
            retry_backoff_max_seconds: 900,
        }
    }

    #[tokio::test]
    async fn create_job_normalizes_task_payload_and_logs_queued_event() {
        let repo = test_repo().await;
        let cfg = config();
        let svc = QueueService::new(&repo, &cfg);

        let payload = serde_json::json!({
            "repository": "Moon/Mind",
            "task": {"instructions": "do the thing", "publish": {"mode": "pr"}}
        });
        let job = svc
            .create_job(JobType::Task, payload, 0, None, None, None, 3)
            .await
            .unwrap();
        assert_eq!(
            job.payload.get("targetRuntime").and_then(|v| v.as_str()),
            Some("codex")
        );
        assert_eq!(
            job.required_capabilities(),
            vec!["codex".to_string(), "git".to_string(), "gh".to_string()]
        );

        let events = repo
            .list_events(job.id, 10, None, None, false)
            .await
            .unwrap();
        assert!(events.iter().any(|e| e.message == "Job queued"));
    }

    #[tokio::test]
    async fn create_job_logs_legacy_warning_for_codex_exec() {
        let repo = test_repo().await;
        let cfg = config();
        let svc = QueueService::new(&repo, &cfg);
        let payload = serde_json::json!({"repository": "Moon/Mind", "instruction": "go"});
        let job = svc
            .create_job(JobType::CodexExec, payload, 0, None, None, None, 3)
            .await
            .unwrap();
        let events = repo
            .list_events(job.id, 10, None, None, false)
            .await
            .unwrap();
        assert!(events.iter().any(|e| e.message == "Legacy job type submitted"));
    }

    #[tokio::test]
    async fn create_job_normalizes_manifest_payload_and_derives_capabilities() {
        let repo = test_repo().await;
        let cfg = config();
        let svc = QueueService::new(&repo, &cfg);

        let manifest_yaml = r#"
version: v0
metadata:
  name: docs-indexer
embeddings:
  provider: openai
vectorStore:
  type: qdrant
dataSources:
  - type: GitHubRepositoryReader
run:
  schedule: nightly
"#;
        let payload = serde_json::json!({
            "manifest": {
                "name": "docs-indexer",
                "action": "run",
                "source": {"kind": "inline", "content": manifest_yaml},
                "options": {"dryRun": true, "maxDocs": 50}
            }
        });
        let job = svc
            .create_job(JobType::Manifest, payload, 0, None, None, None, 3)
            .await
            .unwrap();
        assert_eq!(
            job.required_capabilities(),
            vec!["manifest", "embeddings", "openai", "qdrant", "github"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
        assert_eq!(
            job.payload.get("manifestHash").and_then(|v| v.as_str()).map(|s| s.starts_with("sha256:")),
            Some(true)
        );
    }

    #[test]
    fn intersect_allowed_types_errors_on_empty_overlap() {
        let requested = vec!["manifest".to_string()];
        let token_scoped = vec!["task".to_string()];
        let err = intersect_allowed_types(Some(&requested), Some(&token_scoped)).unwrap_err();
        assert!(matches!(err, Error::Authorization { .. }));
    }

    #[test]
    fn intersect_allowed_types_unrestricted_when_both_absent() {
        let result = intersect_allowed_types(None, None).unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn resolve_worker_token_rejects_revoked() {
        let repo = test_repo().await;
        let cfg = config();
        let svc = QueueService::new(&repo, &cfg);
        let record = repo
            .create_worker_token("worker-1", &token_hash("secret"), None, None, None, vec!["git".to_string()])
            .await
            .unwrap();
        repo.revoke_worker_token(record.id).await.unwrap();
        let err = svc.resolve_worker_token("secret").await.unwrap_err();
        assert!(matches!(err, Error::Authentication { .. }));
    }

    fn token_hash(raw: &str) -> String {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(raw.as_bytes()))
    }

    #[tokio::test]
    async fn send_operator_message_rejects_oversized() {
        let repo = test_repo().await;
        let cfg = config();
        let svc = QueueService::new(&repo, &cfg);
        let job = svc
            .create_job(JobType::Task, serde_json::json!({"repository": "a/b", "task": {"instructions": "x"}}), 0, None, None, None, 3)
            .await
            .unwrap();
        let huge = "x".repeat(4001);
        let err = svc
            .send_operator_message(job.id, None, &huge)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}

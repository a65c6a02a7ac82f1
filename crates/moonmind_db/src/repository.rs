//! Transactional CRUD and lifecycle operations for the agent job queue.
//!
//! Grounded on `AgentQueueRepository` (`repositories.py`), re-expressed with `sqlx`
//! the way `casparian_sentinel::db::queue::JobQueue` does: raw SQL with `?`
//! placeholders rewritten through [`crate::pool::bindable`], row structs decoded with
//! `#[derive(sqlx::FromRow)]`, and a `TryFrom<Row>` conversion into the `moonmind_core`
//! domain type.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use moonmind_core::error::{Error, Result};
use moonmind_core::ids::{ArtifactId, EventId, JobId, LiveSessionId, ProposalId, WorkerTokenId};
use moonmind_core::job::{Job, JobArtifact, JobEvent, JobEventLevel, JobStatus, JobType};
use moonmind_core::live_session::{
    LiveSessionProvider, LiveSessionStatus, TaskRunControlEvent, TaskRunLiveSession,
};
use moonmind_core::manifest_registry::ManifestRegistryRecord;
use moonmind_core::pause::{PauseMode, SystemControlEvent, SystemWorkerPauseState};
use moonmind_core::proposal::{OriginSource, ProposalStatus, ReviewPriority, TaskProposal};
use uuid::Uuid;

use crate::pool::{bindable, DbPool};

fn now_text() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(anyhow::anyhow!("invalid timestamp '{s}': {e}")))
}

fn parse_ts_opt(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    s.map(parse_ts).transpose()
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Internal(anyhow::anyhow!("invalid uuid '{s}': {e}")))
}

fn parse_json(s: &str) -> Result<serde_json::Value> {
    serde_json::from_str(s).map_err(|e| Error::Internal(anyhow::anyhow!(e)))
}

fn parse_json_opt(s: Option<&str>) -> Result<Option<serde_json::Value>> {
    s.map(parse_json).transpose()
}

fn parse_str_list(s: Option<&str>) -> Result<Option<Vec<String>>> {
    s.map(|s| parse_json(s).map(|v| {
        v.as_array()
            .map(|arr| arr.iter().filter_map(|x| x.as_str().map(String::from)).collect())
            .unwrap_or_default()
    }))
    .transpose()
}

fn map_sqlx_err(e: sqlx::Error) -> Error {
    Error::Internal(anyhow::anyhow!(e))
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    #[sqlx(rename = "type")]
    r#type: String,
    status: String,
    priority: i64,
    payload: String,
    created_by_user_id: Option<String>,
    requested_by_user_id: Option<String>,
    affinity_key: Option<String>,
    claimed_by: Option<String>,
    lease_expires_at: Option<String>,
    next_attempt_at: Option<String>,
    attempt: i64,
    max_attempts: i64,
    result_summary: Option<String>,
    error_message: Option<String>,
    cancel_requested_at: Option<String>,
    cancel_requested_by_user_id: Option<String>,
    cancel_reason: Option<String>,
    artifacts_path: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(parse_uuid(&self.id)?),
            job_type: JobType::from_str(&self.r#type)?,
            status: JobStatus::from_str(&self.status)?,
            priority: self.priority as i32,
            payload: parse_json(&self.payload)?,
            created_by_user_id: self.created_by_user_id,
            requested_by_user_id: self.requested_by_user_id,
            affinity_key: self.affinity_key,
            claimed_by: self.claimed_by,
            lease_expires_at: parse_ts_opt(self.lease_expires_at.as_deref())?,
            next_attempt_at: parse_ts_opt(self.next_attempt_at.as_deref())?,
            attempt: self.attempt as i32,
            max_attempts: self.max_attempts as i32,
            result_summary: parse_json_opt(self.result_summary.as_deref())?,
            error_message: self.error_message,
            cancel_requested_at: parse_ts_opt(self.cancel_requested_at.as_deref())?,
            cancel_requested_by_user_id: self.cancel_requested_by_user_id,
            cancel_reason: self.cancel_reason,
            artifacts_path: self.artifacts_path,
            started_at: parse_ts_opt(self.started_at.as_deref())?,
            finished_at: parse_ts_opt(self.finished_at.as_deref())?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

const JOB_COLUMNS: &str = "id, type, status, priority, payload, created_by_user_id, \
    requested_by_user_id, affinity_key, claimed_by, lease_expires_at, next_attempt_at, \
    attempt, max_attempts, result_summary, error_message, cancel_requested_at, \
    cancel_requested_by_user_id, cancel_reason, artifacts_path, started_at, finished_at, \
    created_at, updated_at";

/// Wraps a [`DbPool`] and exposes every queue/proposal/manifest-registry operation.
///
/// Not `Clone`-derived: the pool itself is cheaply cloneable, callers wrap a
/// `Repository` in `Arc` when sharing across tasks (matches the teacher's
/// `AgentQueueRepository`, constructed per request from a session).
pub struct Repository {
    pool: DbPool,
    lease_retry_delay_seconds: i64,
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            lease_retry_delay_seconds: 30,
        }
    }

    pub fn with_lease_retry_delay_seconds(mut self, seconds: i64) -> Self {
        self.lease_retry_delay_seconds = seconds.max(1);
        self
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    // ---- jobs ----------------------------------------------------------

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
        let id = JobId::new();
        let now = now_text();
        let payload_text =
            serde_json::to_string(&payload).map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
        let sql = format!(
            "INSERT INTO agent_jobs ({JOB_COLUMNS}) VALUES \
             (?, ?, 'queued', ?, ?, ?, ?, ?, NULL, NULL, NULL, 1, ?, NULL, NULL, NULL, NULL, \
             NULL, NULL, NULL, NULL, ?, ?)"
        );
        sqlx::query(&bindable(&sql))
            .bind(id.to_string())
            .bind(job_type.as_str())
            .bind(priority as i64)
            .bind(&payload_text)
            .bind(&created_by_user_id)
            .bind(&requested_by_user_id)
            .bind(&affinity_key)
            .bind(max_attempts as i64)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        self.require_job(id).await
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM agent_jobs WHERE id = ?");
        let row: Option<JobRow> = sqlx::query_as(&bindable(&sql))
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.map(JobRow::into_job).transpose()
    }

    pub async fn require_job(&self, job_id: JobId) -> Result<Job> {
        self.get_job(job_id)
            .await?
            .ok_or_else(|| Error::not_found("job_not_found", format!("job {job_id} was not found")))
    }

    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        job_type: Option<JobType>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        if limit < 1 {
            return Err(Error::validation("limit must be at least 1"));
        }
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM agent_jobs WHERE 1 = 1");
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if job_type.is_some() {
            sql.push_str(" AND type = ?");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
        let mut query = sqlx::query_as(&bindable(&sql));
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }
        if let Some(job_type) = job_type {
            query = query.bind(job_type.as_str());
        }
        let rows: Vec<JobRow> = query
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// Claim the next eligible queued job for a worker.
    ///
    /// Requeues expired leases first, then walks queued jobs in
    /// `(priority DESC, created_at ASC, id ASC)` batches of 200, skipping locked rows,
    /// filtering each candidate for repository/capability eligibility before attempting
    /// a conditionally-guarded `UPDATE` (so a concurrent claimant losing the race just
    /// falls through to the next candidate instead of erroring).
    pub async fn claim_job(
        &self,
        worker_id: &str,
        lease_seconds: i64,
        allowed_types: Option<&[String]>,
        allowed_repositories: Option<&[String]>,
        worker_capabilities: Option<&[String]>,
    ) -> Result<Option<Job>> {
        let now = Utc::now();
        let now_s = now.to_rfc3339();
        self.requeue_expired_jobs(now).await?;

        const BATCH_SIZE: i64 = 200;
        let mut cursor: Option<(i32, String, String)> = None;

        loop {
            let mut sql = format!(
                "SELECT {JOB_COLUMNS} FROM agent_jobs WHERE status = 'queued' \
                 AND (next_attempt_at IS NULL OR next_attempt_at <= ?)"
            );
            if let Some(types) = allowed_types {
                if !types.is_empty() {
                    let placeholders = types.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
                    sql.push_str(&format!(" AND type IN ({placeholders})"));
                }
            }
            if cursor.is_some() {
                sql.push_str(
                    " AND (priority < ? OR (priority = ? AND created_at > ?) OR \
                     (priority = ? AND created_at = ? AND id > ?))",
                );
            }
            sql.push_str(" ORDER BY priority DESC, created_at ASC, id ASC LIMIT ?");

            let mut query = sqlx::query_as(&bindable(&sql)).bind(&now_s);
            if let Some(types) = allowed_types {
                if !types.is_empty() {
                    for t in types {
                        query = query.bind(t.clone());
                    }
                }
            }
            if let Some((priority, created_at, id)) = &cursor {
                query = query
                    .bind(*priority as i64)
                    .bind(*priority as i64)
                    .bind(created_at.clone())
                    .bind(*priority as i64)
                    .bind(created_at.clone())
                    .bind(id.clone());
            }
            let rows: Vec<JobRow> = query
                .bind(BATCH_SIZE)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
            if rows.is_empty() {
                return Ok(None);
            }

            let batch_len = rows.len();
            for row in rows {
                let raw_id = row.id.clone();
                let raw_created_at = row.created_at.clone();
                let raw_priority = row.priority;
                let job = row.into_job()?;
                if !Self::is_job_claim_eligible(&job, allowed_repositories, worker_capabilities) {
                    cursor = Some((raw_priority as i32, raw_created_at, raw_id));
                    continue;
                }

                let lease_expires = (now + chrono::Duration::seconds(lease_seconds)).to_rfc3339();
                let update_sql = "UPDATE agent_jobs SET status = 'running', claimed_by = ?, \
                     lease_expires_at = ?, next_attempt_at = NULL, \
                     started_at = COALESCE(started_at, ?), updated_at = ? \
                     WHERE id = ? AND status = 'queued' \
                     AND (next_attempt_at IS NULL OR next_attempt_at <= ?)";
                let result = sqlx::query(&bindable(update_sql))
                    .bind(worker_id)
                    .bind(&lease_expires)
                    .bind(&now_s)
                    .bind(&now_s)
                    .bind(&job.id.to_string())
                    .bind(&now_s)
                    .execute(&self.pool)
                    .await
                    .map_err(map_sqlx_err)?;
                if result.rows_affected() == 1 {
                    return self.get_job(job.id).await;
                }
                cursor = Some((raw_priority as i32, raw_created_at, raw_id));
            }

            if (batch_len as i64) < BATCH_SIZE {
                return Ok(None);
            }
        }
    }

    fn is_job_claim_eligible(
        job: &Job,
        allowed_repositories: Option<&[String]>,
        worker_capabilities: Option<&[String]>,
    ) -> bool {
        if let Some(allowed) = allowed_repositories {
            if !allowed.is_empty() {
                let repo = job.payload_repository().unwrap_or("").trim();
                if !allowed.iter().any(|r| r == repo) {
                    return false;
                }
            }
        }
        let required = job.required_capabilities();
        if required.is_empty() {
            return false;
        }
        let available = moonmind_core::capability::normalize_capabilities(
            worker_capabilities.unwrap_or(&[]).iter(),
        );
        moonmind_core::capability::subset_of(&required, &available)
    }

    pub async fn heartbeat(&self, job_id: JobId, worker_id: &str, lease_seconds: i64) -> Result<Job> {
        let now = Utc::now();
        let job = self.require_running_owned_job(job_id, worker_id).await?;
        let lease_expires = (now + chrono::Duration::seconds(lease_seconds)).to_rfc3339();
        sqlx::query(&bindable(
            "UPDATE agent_jobs SET lease_expires_at = ?, updated_at = ? WHERE id = ?",
        ))
        .bind(&lease_expires)
        .bind(now.to_rfc3339())
        .bind(job.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        self.require_job(job_id).await
    }

    /// Returns `(job, outcome)` where outcome is one of `queued_cancelled`,
    /// `running_requested`, `noop_running_requested`, or `noop_cancelled`.
    pub async fn request_cancel(
        &self,
        job_id: JobId,
        requested_by_user_id: Option<String>,
        reason: Option<String>,
    ) -> Result<(Job, &'static str)> {
        let now = Utc::now();
        let now_s = now.to_rfc3339();
        let job = self.require_job(job_id).await?;

        match job.status {
            JobStatus::Queued => {
                sqlx::query(&bindable(
                    "UPDATE agent_jobs SET status = 'cancelled', cancel_requested_at = ?, \
                     cancel_requested_by_user_id = ?, cancel_reason = ?, finished_at = ?, \
                     claimed_by = NULL, lease_expires_at = NULL, next_attempt_at = NULL, \
                     updated_at = ? WHERE id = ? AND status = 'queued'",
                ))
                .bind(&now_s)
                .bind(&requested_by_user_id)
                .bind(&reason)
                .bind(&now_s)
                .bind(&now_s)
                .bind(job_id.to_string())
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
                Ok((self.require_job(job_id).await?, "queued_cancelled"))
            }
            JobStatus::Running => {
                if job.cancel_requested_at.is_some() {
                    return Ok((job, "noop_running_requested"));
                }
                sqlx::query(&bindable(
                    "UPDATE agent_jobs SET cancel_requested_at = ?, \
                     cancel_requested_by_user_id = ?, cancel_reason = ?, updated_at = ? \
                     WHERE id = ? AND status = 'running'",
                ))
                .bind(&now_s)
                .bind(&requested_by_user_id)
                .bind(&reason)
                .bind(&now_s)
                .bind(job_id.to_string())
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
                Ok((self.require_job(job_id).await?, "running_requested"))
            }
            JobStatus::Cancelled => Ok((job, "noop_cancelled")),
            other => Err(Error::state(format!(
                "job {job_id} is {other} and cannot be cancelled"
            ))),
        }
    }

    /// Returns `(job, outcome)` where outcome is `acknowledged` or `noop_cancelled`.
    pub async fn ack_cancel(&self, job_id: JobId, worker_id: &str) -> Result<(Job, &'static str)> {
        let now = Utc::now().to_rfc3339();
        let job = self.require_job(job_id).await?;

        if job.status == JobStatus::Cancelled {
            if let Some(owner) = &job.claimed_by {
                if owner != worker_id {
                    return Err(Error::ownership(format!(
                        "job {job_id} is owned by {owner}"
                    )));
                }
            }
            return Ok((job, "noop_cancelled"));
        }
        if job.status != JobStatus::Running {
            return Err(Error::state(format!(
                "job {job_id} is {} and cannot be cancellation-acked",
                job.status
            )));
        }
        match &job.claimed_by {
            Some(owner) if owner == worker_id => {}
            Some(owner) => {
                return Err(Error::ownership(format!("job {job_id} is owned by {owner}")))
            }
            None => return Err(Error::ownership(format!("job {job_id} is owned by none"))),
        }
        if job.cancel_requested_at.is_none() {
            return Err(Error::state(format!(
                "job {job_id} has no cancellation request to acknowledge"
            )));
        }

        sqlx::query(&bindable(
            "UPDATE agent_jobs SET status = 'cancelled', finished_at = ?, claimed_by = NULL, \
             lease_expires_at = NULL, next_attempt_at = NULL, updated_at = ? \
             WHERE id = ? AND status = 'running'",
        ))
        .bind(&now)
        .bind(&now)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok((self.require_job(job_id).await?, "acknowledged"))
    }

    pub async fn complete_job(
        &self,
        job_id: JobId,
        worker_id: &str,
        result_summary: Option<serde_json::Value>,
    ) -> Result<Job> {
        self.require_running_owned_job(job_id, worker_id).await?;
        let now = now_text();
        let summary_text = result_summary
            .map(|v| serde_json::to_string(&v))
            .transpose()
            .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
        sqlx::query(&bindable(
            "UPDATE agent_jobs SET status = 'succeeded', result_summary = ?, finished_at = ?, \
             claimed_by = NULL, lease_expires_at = NULL, next_attempt_at = NULL, updated_at = ? \
             WHERE id = ? AND status = 'running'",
        ))
        .bind(&summary_text)
        .bind(&now)
        .bind(&now)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        self.require_job(job_id).await
    }

    /// Mark a running job failed, or requeue it when `retryable` and attempts remain,
    /// or demote it to `dead_letter` once attempts are exhausted. A pending
    /// cancellation always wins over retry policy. `retry_delay_seconds` is the
    /// service layer's already-computed back-off delay, not a caller-supplied value.
    pub async fn fail_job(
        &self,
        job_id: JobId,
        worker_id: &str,
        error_message: &str,
        retryable: bool,
        retry_delay_seconds: i64,
    ) -> Result<Job> {
        let job = self.require_running_owned_job(job_id, worker_id).await?;
        let now = Utc::now();
        let now_s = now.to_rfc3339();

        if job.cancel_requested_at.is_some() {
            sqlx::query(&bindable(
                "UPDATE agent_jobs SET status = 'cancelled', error_message = ?, finished_at = ?, \
                 claimed_by = NULL, lease_expires_at = NULL, next_attempt_at = NULL, \
                 updated_at = ? WHERE id = ?",
            ))
            .bind(error_message)
            .bind(&now_s)
            .bind(&now_s)
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
            return self.require_job(job_id).await;
        }

        if retryable && job.attempt < job.max_attempts {
            let delay = retry_delay_seconds.max(1);
            let next_attempt_at = (now + chrono::Duration::seconds(delay)).to_rfc3339();
            sqlx::query(&bindable(
                "UPDATE agent_jobs SET status = 'queued', attempt = attempt + 1, \
                 error_message = ?, claimed_by = NULL, lease_expires_at = NULL, \
                 finished_at = NULL, next_attempt_at = ?, updated_at = ? WHERE id = ?",
            ))
            .bind(error_message)
            .bind(&next_attempt_at)
            .bind(&now_s)
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        } else {
            let status = if retryable && job.attempt >= job.max_attempts {
                "dead_letter"
            } else {
                "failed"
            };
            sqlx::query(&bindable(
                "UPDATE agent_jobs SET status = ?, error_message = ?, finished_at = ?, \
                 claimed_by = NULL, lease_expires_at = NULL, next_attempt_at = NULL, \
                 updated_at = ? WHERE id = ?",
            ))
            .bind(status)
            .bind(error_message)
            .bind(&now_s)
            .bind(&now_s)
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        }
        self.require_job(job_id).await
    }

    /// Move expired running jobs back to `queued`, or to `dead_letter`/`cancelled`,
    /// per the same retry policy `fail_job` uses. Called at the top of every
    /// `claim_job` so a stalled worker never holds a lease forever.
    async fn requeue_expired_jobs(&self, now: DateTime<Utc>) -> Result<()> {
        let now_s = now.to_rfc3339();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM agent_jobs WHERE status = 'running' \
             AND lease_expires_at IS NOT NULL AND lease_expires_at < ?"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&bindable(&sql))
            .bind(&now_s)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        for row in rows {
            let job = row.into_job()?;
            if job.cancel_requested_at.is_some() {
                sqlx::query(&bindable(
                    "UPDATE agent_jobs SET status = 'cancelled', finished_at = ?, \
                     next_attempt_at = NULL, claimed_by = NULL, lease_expires_at = NULL, \
                     updated_at = ? WHERE id = ? AND status = 'running'",
                ))
                .bind(&now_s)
                .bind(&now_s)
                .bind(job.id.to_string())
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
            } else if job.attempt >= job.max_attempts {
                let error_message = job
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Lease expired and max attempts reached before reclaim.".to_string());
                sqlx::query(&bindable(
                    "UPDATE agent_jobs SET status = 'dead_letter', finished_at = ?, \
                     next_attempt_at = NULL, claimed_by = NULL, lease_expires_at = NULL, \
                     error_message = ?, updated_at = ? WHERE id = ? AND status = 'running'",
                ))
                .bind(&now_s)
                .bind(&error_message)
                .bind(&now_s)
                .bind(job.id.to_string())
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
            } else {
                let next_attempt_at =
                    (now + chrono::Duration::seconds(self.lease_retry_delay_seconds)).to_rfc3339();
                sqlx::query(&bindable(
                    "UPDATE agent_jobs SET status = 'queued', attempt = attempt + 1, \
                     finished_at = NULL, next_attempt_at = ?, claimed_by = NULL, \
                     lease_expires_at = NULL, updated_at = ? WHERE id = ? AND status = 'running'",
                ))
                .bind(&next_attempt_at)
                .bind(&now_s)
                .bind(job.id.to_string())
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
            }
        }
        Ok(())
    }

    async fn require_running_owned_job(&self, job_id: JobId, worker_id: &str) -> Result<Job> {
        let job = self.require_job(job_id).await?;
        if job.status != JobStatus::Running {
            return Err(Error::state(format!(
                "job {job_id} is {} and cannot be mutated",
                job.status
            )));
        }
        match &job.claimed_by {
            Some(owner) if owner == worker_id => Ok(job),
            Some(owner) => Err(Error::ownership(format!("job {job_id} is owned by {owner}"))),
            None => Err(Error::ownership(format!("job {job_id} is owned by none"))),
        }
    }

    // ---- artifacts -------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_artifact(
        &self,
        job_id: JobId,
        name: &str,
        storage_path: &str,
        size_bytes: i64,
        content_type: Option<String>,
        digest: Option<String>,
    ) -> Result<JobArtifact> {
        self.require_job(job_id).await?;
        let id = ArtifactId::new();
        let now = now_text();
        sqlx::query(&bindable(
            "INSERT INTO agent_job_artifacts (id, job_id, name, content_type, size_bytes, \
             digest, storage_path, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        ))
        .bind(id.to_string())
        .bind(job_id.to_string())
        .bind(name)
        .bind(&content_type)
        .bind(size_bytes)
        .bind(&digest)
        .bind(storage_path)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        self.get_artifact(id).await
    }

    pub async fn list_artifacts(&self, job_id: JobId, limit: i64) -> Result<Vec<JobArtifact>> {
        self.require_job(job_id).await?;
        if limit < 1 {
            return Err(Error::validation("limit must be at least 1"));
        }
        let rows: Vec<ArtifactRow> = sqlx::query_as(&bindable(
            "SELECT id, job_id, name, content_type, size_bytes, digest, storage_path, created_at \
             FROM agent_job_artifacts WHERE job_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        ))
        .bind(job_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(ArtifactRow::into_artifact).collect()
    }

    pub async fn get_artifact(&self, artifact_id: ArtifactId) -> Result<JobArtifact> {
        let row: Option<ArtifactRow> = sqlx::query_as(&bindable(
            "SELECT id, job_id, name, content_type, size_bytes, digest, storage_path, created_at \
             FROM agent_job_artifacts WHERE id = ?",
        ))
        .bind(artifact_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.map(ArtifactRow::into_artifact).transpose()?.ok_or_else(|| {
            Error::not_found("artifact_not_found", format!("artifact {artifact_id} was not found"))
        })
    }

    pub async fn get_artifact_for_job(
        &self,
        job_id: JobId,
        artifact_id: ArtifactId,
    ) -> Result<JobArtifact> {
        self.require_job(job_id).await?;
        let artifact = self.get_artifact(artifact_id).await?;
        if artifact.job_id != job_id {
            return Err(Error::not_found(
                "artifact_job_mismatch",
                format!("artifact {artifact_id} does not belong to job {job_id}"),
            ));
        }
        Ok(artifact)
    }

    // ---- events ------------------------------------------------------

    pub async fn append_event(
        &self,
        job_id: JobId,
        level: JobEventLevel,
        message: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<JobEvent> {
        self.require_job(job_id).await?;
        let id = EventId::new();
        let now = now_text();
        let payload_text = payload
            .map(|v| serde_json::to_string(&v))
            .transpose()
            .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
        sqlx::query(&bindable(
            "INSERT INTO agent_job_events (id, job_id, level, message, payload, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        ))
        .bind(id.to_string())
        .bind(job_id.to_string())
        .bind(level.as_str())
        .bind(message)
        .bind(&payload_text)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(JobEvent {
            id,
            job_id,
            level,
            message: message.to_string(),
            payload: parse_json_opt(payload_text.as_deref())?,
            created_at: parse_ts(&now)?,
        })
    }

    /// List events ordered by the composite `(created_at, id)` cursor, with optional
    /// `after`/`before` bounds on either side.
    #[allow(clippy::too_many_arguments)]
    pub async fn list_events(
        &self,
        job_id: JobId,
        limit: i64,
        after: Option<(DateTime<Utc>, EventId)>,
        before: Option<(DateTime<Utc>, EventId)>,
        descending: bool,
    ) -> Result<Vec<JobEvent>> {
        self.require_job(job_id).await?;
        if limit < 1 {
            return Err(Error::validation("limit must be at least 1"));
        }
        let mut sql = String::from(
            "SELECT id, job_id, level, message, payload, created_at FROM agent_job_events \
             WHERE job_id = ?",
        );
        if after.is_some() {
            sql.push_str(" AND (created_at > ? OR (created_at = ? AND id > ?))");
        }
        if before.is_some() {
            sql.push_str(" AND (created_at < ? OR (created_at = ? AND id < ?))");
        }
        if descending {
            sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
        } else {
            sql.push_str(" ORDER BY created_at ASC, id ASC LIMIT ?");
        }

        let mut query = sqlx::query_as(&bindable(&sql)).bind(job_id.to_string());
        if let Some((ts, id)) = &after {
            let ts_s = ts.to_rfc3339();
            query = query.bind(ts_s.clone()).bind(ts_s).bind(id.to_string());
        }
        if let Some((ts, id)) = &before {
            let ts_s = ts.to_rfc3339();
            query = query.bind(ts_s.clone()).bind(ts_s).bind(id.to_string());
        }
        let rows: Vec<EventRow> = query
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    pub async fn list_events_for_jobs(
        &self,
        job_ids: &[JobId],
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<JobEvent>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        if limit < 1 {
            return Err(Error::validation("limit must be at least 1"));
        }
        let placeholders = job_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let mut sql = format!(
            "SELECT id, job_id, level, message, payload, created_at FROM agent_job_events \
             WHERE job_id IN ({placeholders})"
        );
        if since.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        sql.push_str(" ORDER BY job_id ASC, created_at ASC, id ASC LIMIT ?");

        let mut query = sqlx::query_as(&bindable(&sql));
        for id in job_ids {
            query = query.bind(id.to_string());
        }
        if let Some(since) = since {
            query = query.bind(since.to_rfc3339());
        }
        let rows: Vec<EventRow> = query
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    pub async fn list_jobs_for_telemetry(
        &self,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        if limit < 1 {
            return Err(Error::validation("limit must be at least 1"));
        }
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM agent_jobs WHERE 1 = 1");
        if since.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
        let mut query = sqlx::query_as(&bindable(&sql));
        if let Some(since) = since {
            query = query.bind(since.to_rfc3339());
        }
        let rows: Vec<JobRow> = query
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    // ---- live sessions -------------------------------------------------

    pub async fn get_live_session(&self, task_run_id: JobId) -> Result<Option<TaskRunLiveSession>> {
        let row: Option<LiveSessionRow> = sqlx::query_as(&bindable(LIVE_SESSION_SELECT))
            .bind(task_run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.map(LiveSessionRow::into_session).transpose()
    }

    /// Create or update the single live-session row for a task run. Fields passed as
    /// `None` leave the existing column untouched; `ready_at`/`ended_at` additionally
    /// auto-populate from `status` transitions the way the teacher's upsert does.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_live_session(
        &self,
        task_run_id: JobId,
        provider: Option<LiveSessionProvider>,
        status: Option<LiveSessionStatus>,
        ready_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
        expires_at: Option<DateTime<Utc>>,
        worker_id: Option<String>,
        worker_hostname: Option<String>,
        attach_ro: Option<String>,
        attach_rw: Option<String>,
        web_ro: Option<String>,
        web_rw: Option<String>,
        rw_granted_until: Option<DateTime<Utc>>,
        last_heartbeat_at: Option<DateTime<Utc>>,
        error_message: Option<String>,
    ) -> Result<TaskRunLiveSession> {
        self.require_job(task_run_id).await?;
        let now = Utc::now();
        let now_s = now.to_rfc3339();
        let existing = self.get_live_session(task_run_id).await?;

        let merged = match existing {
            Some(mut live) => {
                if let Some(provider) = provider {
                    live.provider = provider;
                }
                if let Some(status) = status {
                    live.status = status;
                }
                live.ready_at = ready_at.or_else(|| {
                    if live.status == LiveSessionStatus::Ready && live.ready_at.is_none() {
                        Some(now)
                    } else {
                        live.ready_at
                    }
                });
                live.ended_at = ended_at.or_else(|| {
                    if live.status.is_terminal() && live.ended_at.is_none() {
                        Some(now)
                    } else {
                        live.ended_at
                    }
                });
                if expires_at.is_some() {
                    live.expires_at = expires_at;
                }
                if worker_id.is_some() {
                    live.worker_id = worker_id;
                }
                if worker_hostname.is_some() {
                    live.worker_hostname = worker_hostname;
                }
                if attach_ro.is_some() {
                    live.attach_ro = attach_ro;
                }
                if attach_rw.is_some() {
                    live.attach_rw = attach_rw;
                }
                if web_ro.is_some() {
                    live.web_ro = web_ro;
                }
                if web_rw.is_some() {
                    live.web_rw = web_rw;
                }
                if rw_granted_until.is_some() {
                    live.rw_granted_until = rw_granted_until;
                }
                if last_heartbeat_at.is_some() {
                    live.last_heartbeat_at = last_heartbeat_at;
                }
                if error_message.is_some() {
                    live.error_message = error_message;
                }
                live.updated_at = now;
                live
            }
            None => {
                let status = status.unwrap_or(LiveSessionStatus::Disabled);
                TaskRunLiveSession {
                    id: LiveSessionId::new(),
                    task_run_id,
                    provider: provider.unwrap_or(LiveSessionProvider::Tmate),
                    status,
                    ready_at: ready_at.or(if status == LiveSessionStatus::Ready {
                        Some(now)
                    } else {
                        None
                    }),
                    ended_at: ended_at.or(if status.is_terminal() { Some(now) } else { None }),
                    expires_at,
                    rw_granted_until,
                    worker_id,
                    worker_hostname,
                    attach_ro,
                    attach_rw,
                    web_ro,
                    web_rw,
                    last_heartbeat_at,
                    error_message,
                    created_at: now,
                    updated_at: now,
                }
            }
        };

        sqlx::query(&bindable(
            "INSERT INTO task_run_live_sessions (id, task_run_id, provider, status, ready_at, \
             ended_at, expires_at, rw_granted_until, worker_id, worker_hostname, attach_ro, \
             attach_rw, web_ro, web_rw, last_heartbeat_at, error_message, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (task_run_id) DO UPDATE SET provider = excluded.provider, \
             status = excluded.status, ready_at = excluded.ready_at, ended_at = excluded.ended_at, \
             expires_at = excluded.expires_at, rw_granted_until = excluded.rw_granted_until, \
             worker_id = excluded.worker_id, worker_hostname = excluded.worker_hostname, \
             attach_ro = excluded.attach_ro, attach_rw = excluded.attach_rw, \
             web_ro = excluded.web_ro, web_rw = excluded.web_rw, \
             last_heartbeat_at = excluded.last_heartbeat_at, \
             error_message = excluded.error_message, updated_at = excluded.updated_at",
        ))
        .bind(merged.id.to_string())
        .bind(merged.task_run_id.to_string())
        .bind(merged.provider.as_str())
        .bind(merged.status.as_str())
        .bind(merged.ready_at.map(|t| t.to_rfc3339()))
        .bind(merged.ended_at.map(|t| t.to_rfc3339()))
        .bind(merged.expires_at.map(|t| t.to_rfc3339()))
        .bind(merged.rw_granted_until.map(|t| t.to_rfc3339()))
        .bind(&merged.worker_id)
        .bind(&merged.worker_hostname)
        .bind(&merged.attach_ro)
        .bind(&merged.attach_rw)
        .bind(&merged.web_ro)
        .bind(&merged.web_rw)
        .bind(merged.last_heartbeat_at.map(|t| t.to_rfc3339()))
        .bind(&merged.error_message)
        .bind(&now_s)
        .bind(&now_s)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(merged)
    }

    pub async fn append_control_event(
        &self,
        task_run_id: JobId,
        actor_user_id: Option<String>,
        action: &str,
        detail: Option<serde_json::Value>,
    ) -> Result<TaskRunControlEvent> {
        self.require_job(task_run_id).await?;
        let id = Uuid::new_v4();
        let now = now_text();
        let detail_text = detail
            .map(|v| serde_json::to_string(&v))
            .transpose()
            .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
        sqlx::query(&bindable(
            "INSERT INTO task_run_control_events (id, task_run_id, action, actor_user_id, \
             detail, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        ))
        .bind(id.to_string())
        .bind(task_run_id.to_string())
        .bind(action)
        .bind(&actor_user_id)
        .bind(&detail_text)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(TaskRunControlEvent {
            id,
            task_run_id,
            action: action.to_string(),
            actor_user_id,
            detail: parse_json_opt(detail_text.as_deref())?,
            created_at: parse_ts(&now)?,
        })
    }

    /// Merge `liveControl` flags into the job's JSON payload so a worker's next
    /// heartbeat read observes them without a dedicated endpoint.
    pub async fn set_job_live_control(
        &self,
        task_run_id: JobId,
        paused: Option<bool>,
        takeover: Option<bool>,
        last_action: Option<String>,
    ) -> Result<Job> {
        let now = Utc::now();
        let job = self.require_job(task_run_id).await?;
        let mut payload = job.payload.as_object().cloned().unwrap_or_default();
        let mut control = payload
            .get("liveControl")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        if let Some(paused) = paused {
            control.insert("paused".to_string(), serde_json::Value::Bool(paused));
        }
        if let Some(takeover) = takeover {
            control.insert("takeover".to_string(), serde_json::Value::Bool(takeover));
        }
        if let Some(last_action) = last_action {
            if !last_action.is_empty() {
                control.insert("lastAction".to_string(), serde_json::Value::String(last_action));
            }
        }
        control.insert(
            "updatedAt".to_string(),
            serde_json::Value::String(now.to_rfc3339()),
        );
        payload.insert("liveControl".to_string(), serde_json::Value::Object(control));
        let payload_text = serde_json::to_string(&serde_json::Value::Object(payload))
            .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;

        sqlx::query(&bindable(
            "UPDATE agent_jobs SET payload = ?, updated_at = ? WHERE id = ?",
        ))
        .bind(&payload_text)
        .bind(now.to_rfc3339())
        .bind(task_run_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        self.require_job(task_run_id).await
    }

    // ---- worker tokens -------------------------------------------------

    pub async fn create_worker_token(
        &self,
        worker_id: &str,
        token_hash: &str,
        description: Option<String>,
        allowed_repositories: Option<Vec<String>>,
        allowed_job_types: Option<Vec<String>>,
        capabilities: Vec<String>,
    ) -> Result<WorkerTokenRecord> {
        let id = WorkerTokenId::new();
        let now = now_text();
        sqlx::query(&bindable(
            "INSERT INTO agent_worker_tokens (id, worker_id, token_hash, description, \
             allowed_repositories, allowed_job_types, capabilities, is_active, created_at, \
             updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        ))
        .bind(id.to_string())
        .bind(worker_id)
        .bind(token_hash)
        .bind(&description)
        .bind(json_list(&allowed_repositories)?)
        .bind(json_list(&allowed_job_types)?)
        .bind(
            serde_json::to_string(&capabilities).map_err(|e| Error::Internal(anyhow::anyhow!(e)))?,
        )
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        self.get_worker_token(id).await
    }

    pub async fn get_worker_token(&self, token_id: WorkerTokenId) -> Result<WorkerTokenRecord> {
        let row: Option<WorkerTokenRow> = sqlx::query_as(&bindable(WORKER_TOKEN_SELECT))
            .bind(token_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.map(WorkerTokenRow::into_record).transpose()?.ok_or_else(|| {
            Error::not_found(
                "worker_token_not_found",
                format!("worker token {token_id} was not found"),
            )
        })
    }

    pub async fn get_worker_token_by_hash(&self, token_hash: &str) -> Result<Option<WorkerTokenRecord>> {
        let sql = format!("{WORKER_TOKEN_SELECT} WHERE token_hash = ?");
        let row: Option<WorkerTokenRow> = sqlx::query_as(&bindable(&sql))
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.map(WorkerTokenRow::into_record).transpose()
    }

    pub async fn touch_worker_token_last_used(&self, token_id: WorkerTokenId) -> Result<()> {
        sqlx::query(&bindable(
            "UPDATE agent_worker_tokens SET last_used_at = ? WHERE id = ?",
        ))
        .bind(now_text())
        .bind(token_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    pub async fn list_worker_tokens(&self, limit: i64) -> Result<Vec<WorkerTokenRecord>> {
        if limit < 1 {
            return Err(Error::validation("limit must be at least 1"));
        }
        let sql = format!("{WORKER_TOKEN_SELECT} ORDER BY created_at DESC, id DESC LIMIT ?");
        let rows: Vec<WorkerTokenRow> = sqlx::query_as(&bindable(&sql))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.into_iter().map(WorkerTokenRow::into_record).collect()
    }

    pub async fn revoke_worker_token(&self, token_id: WorkerTokenId) -> Result<WorkerTokenRecord> {
        self.get_worker_token(token_id).await?;
        sqlx::query(&bindable(
            "UPDATE agent_worker_tokens SET is_active = 0, updated_at = ? WHERE id = ?",
        ))
        .bind(now_text())
        .bind(token_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        self.get_worker_token(token_id).await
    }

    // ---- worker pause state --------------------------------------------

    pub async fn get_pause_state(&self) -> Result<SystemWorkerPauseState> {
        let row: Option<PauseStateRow> = sqlx::query_as(&bindable(
            "SELECT paused, mode, reason, version, requested_by_user_id, requested_at \
             FROM system_worker_pause_state WHERE id = 1",
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        match row {
            Some(row) => row.into_state(),
            None => Ok(SystemWorkerPauseState::initial()),
        }
    }

    /// Increments `version` atomically in SQL (`version = version + 1`) rather than
    /// reading the current value and writing back `current + 1`, so two concurrent
    /// callers can never compute the same next version from the same stale read —
    /// the row is the single source of truth for the counter, not a value round-tripped
    /// through application code.
    pub async fn update_pause_state(
        &self,
        paused: bool,
        mode: Option<PauseMode>,
        reason: Option<String>,
        requested_by_user_id: Option<String>,
        requested_at: Option<DateTime<Utc>>,
    ) -> Result<SystemWorkerPauseState> {
        let row: PauseStateRow = sqlx::query_as(&bindable(
            "UPDATE system_worker_pause_state SET paused = ?, mode = ?, reason = ?, \
             version = version + 1, requested_by_user_id = ?, requested_at = ? WHERE id = 1 \
             RETURNING paused, mode, reason, version, requested_by_user_id, requested_at",
        ))
        .bind(paused as i64)
        .bind(mode.map(|m| m.as_str()))
        .bind(&reason)
        .bind(&requested_by_user_id)
        .bind(requested_at.map(|t| t.to_rfc3339()))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.into_state()
    }

    pub async fn append_system_control_event(
        &self,
        action: &str,
        actor_user_id: Option<String>,
        detail: Option<serde_json::Value>,
    ) -> Result<SystemControlEvent> {
        let id = Uuid::new_v4();
        let now = now_text();
        let detail_text = detail
            .map(|v| serde_json::to_string(&v))
            .transpose()
            .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
        sqlx::query(&bindable(
            "INSERT INTO system_control_events (id, action, actor_user_id, detail, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        ))
        .bind(id.to_string())
        .bind(action)
        .bind(&actor_user_id)
        .bind(&detail_text)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(SystemControlEvent {
            id,
            action: action.to_string(),
            actor_user_id,
            detail: parse_json_opt(detail_text.as_deref())?,
            created_at: parse_ts(&now)?,
        })
    }

    pub async fn list_system_control_events(&self, limit: i64) -> Result<Vec<SystemControlEvent>> {
        let limit = limit.clamp(1, 50);
        let rows: Vec<SystemControlEventRow> = sqlx::query_as(&bindable(
            "SELECT id, action, actor_user_id, detail, created_at FROM system_control_events \
             ORDER BY created_at DESC, id DESC LIMIT ?",
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(SystemControlEventRow::into_event).collect()
    }

    pub async fn fetch_worker_pause_metrics(&self) -> Result<BTreeMap<String, i64>> {
        let now = now_text();
        let queued: (i64,) = sqlx::query_as(&bindable(
            "SELECT COUNT(*) FROM agent_jobs WHERE status = 'queued' \
             AND (next_attempt_at IS NULL OR next_attempt_at <= ?)",
        ))
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        let running: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM agent_jobs WHERE status = 'running'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        let stale: (i64,) = sqlx::query_as(&bindable(
            "SELECT COUNT(*) FROM agent_jobs WHERE status = 'running' \
             AND (lease_expires_at IS NULL OR lease_expires_at < ?)",
        ))
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut out = BTreeMap::new();
        out.insert("queued".to_string(), queued.0);
        out.insert("running".to_string(), running.0);
        out.insert("stale_running".to_string(), stale.0);
        Ok(out)
    }

    // ---- proposals ---------------------------------------------------

    pub async fn get_open_proposal_by_dedup_hash(
        &self,
        dedup_hash: &str,
    ) -> Result<Option<TaskProposal>> {
        let sql = format!("{PROPOSAL_SELECT} WHERE dedup_hash = ? AND status = 'open'");
        let row: Option<ProposalRow> = sqlx::query_as(&bindable(&sql))
            .bind(dedup_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.map(ProposalRow::into_proposal).transpose()
    }

    pub async fn create_proposal(&self, proposal: TaskProposal) -> Result<TaskProposal> {
        let now = now_text();
        sqlx::query(&bindable(
            "INSERT INTO task_proposals (id, status, title, summary, category, tags, \
             repository, dedup_key, dedup_hash, review_priority, priority_override_reason, \
             task_create_request, origin_source, origin_id, origin_metadata, promoted_job_id, \
             promoted_at, promoted_by_user_id, decided_at, decided_by_user_id, snoozed_until, \
             snooze_history, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        ))
        .bind(proposal.id.to_string())
        .bind(proposal.status.as_str())
        .bind(&proposal.title)
        .bind(&proposal.summary)
        .bind(&proposal.category)
        .bind(serde_json::to_string(&proposal.tags).map_err(|e| Error::Internal(anyhow::anyhow!(e)))?)
        .bind(&proposal.repository)
        .bind(&proposal.dedup_key)
        .bind(&proposal.dedup_hash)
        .bind(proposal.review_priority.as_str())
        .bind(&proposal.priority_override_reason)
        .bind(
            serde_json::to_string(&proposal.task_create_request)
                .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?,
        )
        .bind(proposal.origin_source.as_str())
        .bind(&proposal.origin_id)
        .bind(json_opt(&proposal.origin_metadata)?)
        .bind(proposal.promoted_job_id.map(|id| id.to_string()))
        .bind(proposal.promoted_at.map(|t| t.to_rfc3339()))
        .bind(&proposal.promoted_by_user_id)
        .bind(proposal.decided_at.map(|t| t.to_rfc3339()))
        .bind(&proposal.decided_by_user_id)
        .bind(proposal.snoozed_until.map(|t| t.to_rfc3339()))
        .bind(
            serde_json::to_string(&proposal.snooze_history)
                .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?,
        )
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        self.require_proposal(proposal.id).await
    }

    pub async fn get_proposal(&self, id: ProposalId) -> Result<Option<TaskProposal>> {
        let sql = format!("{PROPOSAL_SELECT} WHERE id = ?");
        let row: Option<ProposalRow> = sqlx::query_as(&bindable(&sql))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.map(ProposalRow::into_proposal).transpose()
    }

    pub async fn require_proposal(&self, id: ProposalId) -> Result<TaskProposal> {
        self.get_proposal(id)
            .await?
            .ok_or_else(|| Error::not_found("proposal_not_found", format!("proposal {id} was not found")))
    }

    /// List proposals newest-first with an optional `(created_at, id)` keyset cursor
    /// (spec §4.7 "cursor is `{created_at_iso}|{uuid}`"). Fetches `limit + 1` rows so
    /// the caller can tell whether another page follows.
    #[allow(clippy::too_many_arguments)]
    pub async fn list_proposals(
        &self,
        status: Option<ProposalStatus>,
        category: Option<&str>,
        repository: Option<&str>,
        origin_source: Option<OriginSource>,
        cursor: Option<(DateTime<Utc>, ProposalId)>,
        limit: i64,
        now: DateTime<Utc>,
        include_snoozed: bool,
        only_snoozed: bool,
    ) -> Result<(Vec<TaskProposal>, bool)> {
        if limit < 1 {
            return Err(Error::validation("limit must be at least 1"));
        }
        let mut sql = format!("{PROPOSAL_SELECT} WHERE 1 = 1");
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if category.is_some() {
            sql.push_str(" AND category = ?");
        }
        if repository.is_some() {
            sql.push_str(" AND repository = ?");
        }
        if origin_source.is_some() {
            sql.push_str(" AND origin_source = ?");
        }
        if only_snoozed {
            sql.push_str(" AND snoozed_until IS NOT NULL AND snoozed_until > ?");
        } else if !include_snoozed {
            sql.push_str(" AND (snoozed_until IS NULL OR snoozed_until <= ?)");
        }
        if cursor.is_some() {
            sql.push_str(" AND (created_at < ? OR (created_at = ? AND id < ?))");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

        let mut query = sqlx::query_as(&bindable(&sql));
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }
        if let Some(category) = category {
            query = query.bind(category);
        }
        if let Some(repository) = repository {
            query = query.bind(repository);
        }
        if let Some(origin_source) = origin_source {
            query = query.bind(origin_source.as_str());
        }
        if only_snoozed || !include_snoozed {
            query = query.bind(now.to_rfc3339());
        }
        if let Some((ts, id)) = &cursor {
            let ts_s = ts.to_rfc3339();
            query = query.bind(ts_s.clone()).bind(ts_s).bind(id.to_string());
        }
        let rows: Vec<ProposalRow> = query
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        let mut proposals: Vec<TaskProposal> = rows
            .into_iter()
            .map(ProposalRow::into_proposal)
            .collect::<Result<Vec<_>>>()?;
        let has_more = proposals.len() as i64 > limit;
        proposals.truncate(limit as usize);
        Ok((proposals, has_more))
    }

    /// Up to `limit` other open proposals sharing `dedup_hash` (spec §4.7 similarity
    /// search).
    pub async fn list_similar_proposals(
        &self,
        dedup_hash: &str,
        exclude_id: ProposalId,
        limit: i64,
    ) -> Result<Vec<TaskProposal>> {
        let sql = format!(
            "{PROPOSAL_SELECT} WHERE dedup_hash = ? AND status = 'open' AND id != ? \
             ORDER BY created_at DESC, id DESC LIMIT ?"
        );
        let rows: Vec<ProposalRow> = sqlx::query_as(&bindable(&sql))
            .bind(dedup_hash)
            .bind(exclude_id.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.into_iter().map(ProposalRow::into_proposal).collect()
    }

    /// Clear `snoozed_until` on every open proposal whose snooze has already elapsed
    /// (spec §4.7 "expired snoozes are cleared opportunistically at list time").
    pub async fn expire_snoozed_proposals(&self, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(&bindable(
            "UPDATE task_proposals SET snoozed_until = NULL, updated_at = ? \
             WHERE status = 'open' AND snoozed_until IS NOT NULL AND snoozed_until <= ?",
        ))
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    /// Whether a notification for `proposal_id`/`target` has already been logged
    /// (spec §4.7 "post ... once per proposal").
    pub async fn has_proposal_notification(&self, proposal_id: ProposalId, target: &str) -> Result<bool> {
        let row: (i64,) = sqlx::query_as(&bindable(
            "SELECT COUNT(*) FROM task_proposal_notifications WHERE proposal_id = ? AND target = ?",
        ))
        .bind(proposal_id.to_string())
        .bind(target)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(row.0 > 0)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn log_proposal_notification(
        &self,
        proposal_id: ProposalId,
        category: &str,
        target: &str,
        status: &str,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(&bindable(
            "INSERT INTO task_proposal_notifications \
             (id, proposal_id, category, target, status, error_message, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(proposal_id.to_string())
        .bind(category)
        .bind(target)
        .bind(status)
        .bind(error_message)
        .bind(now_text())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    /// Persist every mutable field of `proposal`, guarded by `expected_status` so two
    /// concurrent decisions on the same row can't both win (spec §4.7's "require
    /// status=open and a lock" for promote/dismiss/snooze/unsnooze/reprioritize).
    /// Returns a `State` error if the row no longer matches `expected_status`.
    pub async fn update_proposal(
        &self,
        proposal: &TaskProposal,
        expected_status: ProposalStatus,
    ) -> Result<TaskProposal> {
        let now = now_text();
        let result = sqlx::query(&bindable(
            "UPDATE task_proposals SET status = ?, review_priority = ?, \
             priority_override_reason = ?, promoted_job_id = ?, promoted_at = ?, \
             promoted_by_user_id = ?, decided_at = ?, decided_by_user_id = ?, \
             snoozed_until = ?, snooze_history = ?, updated_at = ? \
             WHERE id = ? AND status = ?",
        ))
        .bind(proposal.status.as_str())
        .bind(proposal.review_priority.as_str())
        .bind(&proposal.priority_override_reason)
        .bind(proposal.promoted_job_id.map(|id| id.to_string()))
        .bind(proposal.promoted_at.map(|t| t.to_rfc3339()))
        .bind(&proposal.promoted_by_user_id)
        .bind(proposal.decided_at.map(|t| t.to_rfc3339()))
        .bind(&proposal.decided_by_user_id)
        .bind(proposal.snoozed_until.map(|t| t.to_rfc3339()))
        .bind(
            serde_json::to_string(&proposal.snooze_history)
                .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?,
        )
        .bind(&now)
        .bind(proposal.id.to_string())
        .bind(expected_status.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::state(format!(
                "proposal {} is no longer {}",
                proposal.id,
                expected_status.as_str()
            )));
        }
        self.require_proposal(proposal.id).await
    }

    // ---- manifest registry ---------------------------------------------

    pub async fn get_manifest_registry_entry(&self, name: &str) -> Result<Option<ManifestRegistryRecord>> {
        let row: Option<ManifestRegistryRow> = sqlx::query_as(&bindable(MANIFEST_REGISTRY_SELECT))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.map(ManifestRegistryRow::into_record).transpose()
    }

    pub async fn upsert_manifest_registry_entry(
        &self,
        name: &str,
        content: &str,
        content_hash: &str,
    ) -> Result<ManifestRegistryRecord> {
        let now = now_text();
        let existing = self.get_manifest_registry_entry(name).await?;
        let version: i64 = match &existing {
            Some(e) if e.content_hash == content_hash => e.version as i64,
            Some(e) => e.version as i64 + 1,
            None => 1,
        };
        sqlx::query(&bindable(
            "INSERT INTO manifest_registry (name, content, content_hash, version, created_at, \
             updated_at) VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (name) DO UPDATE SET content = excluded.content, \
             content_hash = excluded.content_hash, version = excluded.version, \
             updated_at = excluded.updated_at",
        ))
        .bind(name)
        .bind(content)
        .bind(content_hash)
        .bind(version)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        self.get_manifest_registry_entry(name)
            .await?
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("manifest registry upsert disappeared")))
    }

    pub async fn record_manifest_run(
        &self,
        name: &str,
        job_id: JobId,
        status: &str,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(&bindable(
            "UPDATE manifest_registry SET last_run_job_id = ?, last_run_status = ?, \
             last_run_started_at = ?, last_run_finished_at = ?, updated_at = ? WHERE name = ?",
        ))
        .bind(job_id.to_string())
        .bind(status)
        .bind(started_at.map(|t| t.to_rfc3339()))
        .bind(finished_at.map(|t| t.to_rfc3339()))
        .bind(now_text())
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    pub async fn list_manifest_registry_entries(&self, limit: i64) -> Result<Vec<ManifestRegistryRecord>> {
        if limit < 1 {
            return Err(Error::validation("limit must be at least 1"));
        }
        let sql = format!("{MANIFEST_REGISTRY_SELECT_ALL} ORDER BY name ASC LIMIT ?");
        let rows: Vec<ManifestRegistryRow> = sqlx::query_as(&bindable(&sql))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.into_iter().map(ManifestRegistryRow::into_record).collect()
    }
}

fn json_list(list: &Option<Vec<String>>) -> Result<Option<String>> {
    list.as_ref()
        .map(|l| serde_json::to_string(l))
        .transpose()
        .map_err(|e| Error::Internal(anyhow::anyhow!(e)))
}

fn json_opt(value: &Option<serde_json::Value>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| Error::Internal(anyhow::anyhow!(e)))
}

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    id: String,
    job_id: String,
    name: String,
    content_type: Option<String>,
    size_bytes: i64,
    digest: Option<String>,
    storage_path: String,
    created_at: String,
}

impl ArtifactRow {
    fn into_artifact(self) -> Result<JobArtifact> {
        Ok(JobArtifact {
            id: ArtifactId(parse_uuid(&self.id)?),
            job_id: JobId(parse_uuid(&self.job_id)?),
            name: self.name,
            content_type: self.content_type,
            size_bytes: self.size_bytes,
            digest: self.digest,
            storage_path: self.storage_path,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    job_id: String,
    level: String,
    message: String,
    payload: Option<String>,
    created_at: String,
}

impl EventRow {
    fn into_event(self) -> Result<JobEvent> {
        Ok(JobEvent {
            id: EventId(parse_uuid(&self.id)?),
            job_id: JobId(parse_uuid(&self.job_id)?),
            level: JobEventLevel::from_str(&self.level)?,
            message: self.message,
            payload: parse_json_opt(self.payload.as_deref())?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

const LIVE_SESSION_SELECT: &str = "SELECT id, task_run_id, provider, status, ready_at, ended_at, \
    expires_at, rw_granted_until, worker_id, worker_hostname, attach_ro, attach_rw, web_ro, \
    web_rw, last_heartbeat_at, error_message, created_at, updated_at FROM task_run_live_sessions \
    WHERE task_run_id = ?";

#[derive(sqlx::FromRow)]
struct LiveSessionRow {
    id: String,
    task_run_id: String,
    provider: String,
    status: String,
    ready_at: Option<String>,
    ended_at: Option<String>,
    expires_at: Option<String>,
    rw_granted_until: Option<String>,
    worker_id: Option<String>,
    worker_hostname: Option<String>,
    attach_ro: Option<String>,
    attach_rw: Option<String>,
    web_ro: Option<String>,
    web_rw: Option<String>,
    last_heartbeat_at: Option<String>,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
}

impl LiveSessionRow {
    fn into_session(self) -> Result<TaskRunLiveSession> {
        Ok(TaskRunLiveSession {
            id: LiveSessionId(parse_uuid(&self.id)?),
            task_run_id: JobId(parse_uuid(&self.task_run_id)?),
            provider: match self.provider.as_str() {
                "tmate" => LiveSessionProvider::Tmate,
                other => {
                    return Err(Error::Internal(anyhow::anyhow!(
                        "unknown live session provider '{other}'"
                    )))
                }
            },
            status: LiveSessionStatus::from_str(&self.status)?,
            ready_at: parse_ts_opt(self.ready_at.as_deref())?,
            ended_at: parse_ts_opt(self.ended_at.as_deref())?,
            expires_at: parse_ts_opt(self.expires_at.as_deref())?,
            rw_granted_until: parse_ts_opt(self.rw_granted_until.as_deref())?,
            worker_id: self.worker_id,
            worker_hostname: self.worker_hostname,
            attach_ro: self.attach_ro,
            attach_rw: self.attach_rw,
            web_ro: self.web_ro,
            web_rw: self.web_rw,
            last_heartbeat_at: parse_ts_opt(self.last_heartbeat_at.as_deref())?,
            error_message: self.error_message,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

const WORKER_TOKEN_SELECT: &str = "SELECT id, worker_id, token_hash, description, \
    allowed_repositories, allowed_job_types, capabilities, is_active, last_used_at, created_at, \
    updated_at FROM agent_worker_tokens";

/// Worker token metadata. Never part of `moonmind_core` — it's a pure persistence
/// concept (hash + policy snapshot), resolved into a [`moonmind_core::principal::WorkerPolicy`]
/// one layer up.
#[derive(Debug, Clone)]
pub struct WorkerTokenRecord {
    pub id: WorkerTokenId,
    pub worker_id: String,
    pub token_hash: String,
    pub description: Option<String>,
    pub allowed_repositories: Option<Vec<String>>,
    pub allowed_job_types: Option<Vec<String>>,
    pub capabilities: Vec<String>,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct WorkerTokenRow {
    id: String,
    worker_id: String,
    token_hash: String,
    description: Option<String>,
    allowed_repositories: Option<String>,
    allowed_job_types: Option<String>,
    capabilities: String,
    is_active: i64,
    last_used_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl WorkerTokenRow {
    fn into_record(self) -> Result<WorkerTokenRecord> {
        Ok(WorkerTokenRecord {
            id: WorkerTokenId(parse_uuid(&self.id)?),
            worker_id: self.worker_id,
            token_hash: self.token_hash,
            description: self.description,
            allowed_repositories: parse_str_list(self.allowed_repositories.as_deref())?,
            allowed_job_types: parse_str_list(self.allowed_job_types.as_deref())?,
            capabilities: parse_json(&self.capabilities)?
                .as_array()
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default(),
            is_active: self.is_active != 0,
            last_used_at: parse_ts_opt(self.last_used_at.as_deref())?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PauseStateRow {
    paused: i64,
    mode: Option<String>,
    reason: Option<String>,
    version: i64,
    requested_by_user_id: Option<String>,
    requested_at: Option<String>,
}

impl PauseStateRow {
    fn into_state(self) -> Result<SystemWorkerPauseState> {
        Ok(SystemWorkerPauseState {
            paused: self.paused != 0,
            mode: self.mode.map(|m| PauseMode::from_str(&m)).transpose()?,
            reason: self.reason,
            version: self.version,
            requested_by_user_id: self.requested_by_user_id,
            requested_at: parse_ts_opt(self.requested_at.as_deref())?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SystemControlEventRow {
    id: String,
    action: String,
    actor_user_id: Option<String>,
    detail: Option<String>,
    created_at: String,
}

impl SystemControlEventRow {
    fn into_event(self) -> Result<SystemControlEvent> {
        Ok(SystemControlEvent {
            id: parse_uuid(&self.id)?,
            action: self.action,
            actor_user_id: self.actor_user_id,
            detail: parse_json_opt(self.detail.as_deref())?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

const PROPOSAL_SELECT: &str = "SELECT id, status, title, summary, category, tags, repository, \
    dedup_key, dedup_hash, review_priority, priority_override_reason, task_create_request, \
    origin_source, origin_id, origin_metadata, promoted_job_id, promoted_at, \
    promoted_by_user_id, decided_at, decided_by_user_id, snoozed_until, snooze_history, \
    created_at, updated_at FROM task_proposals";

#[derive(sqlx::FromRow)]
struct ProposalRow {
    id: String,
    status: String,
    title: String,
    summary: String,
    category: String,
    tags: String,
    repository: String,
    dedup_key: String,
    dedup_hash: String,
    review_priority: String,
    priority_override_reason: Option<String>,
    task_create_request: String,
    origin_source: String,
    origin_id: Option<String>,
    origin_metadata: Option<String>,
    promoted_job_id: Option<String>,
    promoted_at: Option<String>,
    promoted_by_user_id: Option<String>,
    decided_at: Option<String>,
    decided_by_user_id: Option<String>,
    snoozed_until: Option<String>,
    snooze_history: String,
    created_at: String,
    updated_at: String,
}

impl ProposalRow {
    fn into_proposal(self) -> Result<TaskProposal> {
        Ok(TaskProposal {
            id: ProposalId(parse_uuid(&self.id)?),
            status: ProposalStatus::from_str(&self.status)?,
            title: self.title,
            summary: self.summary,
            category: self.category,
            tags: parse_json(&self.tags)?
                .as_array()
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default(),
            repository: self.repository,
            dedup_key: self.dedup_key,
            dedup_hash: self.dedup_hash,
            review_priority: ReviewPriority::from_str(&self.review_priority)?,
            priority_override_reason: self.priority_override_reason,
            task_create_request: parse_json(&self.task_create_request)?,
            origin_source: OriginSource::from_str(&self.origin_source)?,
            origin_id: self.origin_id,
            origin_metadata: parse_json_opt(self.origin_metadata.as_deref())?,
            promoted_job_id: self
                .promoted_job_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?
                .map(JobId),
            promoted_at: parse_ts_opt(self.promoted_at.as_deref())?,
            promoted_by_user_id: self.promoted_by_user_id,
            decided_at: parse_ts_opt(self.decided_at.as_deref())?,
            decided_by_user_id: self.decided_by_user_id,
            snoozed_until: parse_ts_opt(self.snoozed_until.as_deref())?,
            snooze_history: parse_json(&self.snooze_history)?
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| serde_json::from_value(v.clone()).ok())
                        .collect()
                })
                .unwrap_or_default(),
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

const MANIFEST_REGISTRY_SELECT: &str = "SELECT name, content, content_hash, version, \
    last_run_job_id, last_run_status, last_run_started_at, last_run_finished_at, state_json, \
    created_at, updated_at FROM manifest_registry WHERE name = ?";
const MANIFEST_REGISTRY_SELECT_ALL: &str = "SELECT name, content, content_hash, version, \
    last_run_job_id, last_run_status, last_run_started_at, last_run_finished_at, state_json, \
    created_at, updated_at FROM manifest_registry";

#[derive(sqlx::FromRow)]
struct ManifestRegistryRow {
    name: String,
    content: String,
    content_hash: String,
    version: i64,
    last_run_job_id: Option<String>,
    last_run_status: Option<String>,
    last_run_started_at: Option<String>,
    last_run_finished_at: Option<String>,
    state_json: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ManifestRegistryRow {
    fn into_record(self) -> Result<ManifestRegistryRecord> {
        Ok(ManifestRegistryRecord {
            name: self.name,
            content: self.content,
            content_hash: self.content_hash,
            version: self.version as i32,
            last_run_job_id: self
                .last_run_job_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?
                .map(JobId),
            last_run_status: self.last_run_status,
            last_run_started_at: parse_ts_opt(self.last_run_started_at.as_deref())?,
            last_run_finished_at: parse_ts_opt(self.last_run_finished_at.as_deref())?,
            state_json: parse_json_opt(self.state_json.as_deref())?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};
    use crate::schema::migrate;

    async fn test_repo() -> Repository {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        migrate(&pool).await.unwrap();
        Repository::new(pool)
    }

    #[tokio::test]
    async fn create_and_claim_job_round_trip() {
        let repo = test_repo().await;
        let job = repo
            .create_job(
                JobType::Task,
                serde_json::json!({"requiredCapabilities": ["codex"]}),
                0,
                None,
                None,
                None,
                3,
            )
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        let claimed = repo
            .claim_job("worker-1", 60, None, None, Some(&["codex".to_string()]))
            .await
            .unwrap()
            .expect("job should be claimable");
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.claimed_by.as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn claim_skips_jobs_missing_required_capability() {
        let repo = test_repo().await;
        repo.create_job(
            JobType::Task,
            serde_json::json!({"requiredCapabilities": ["docker"]}),
            0,
            None,
            None,
            None,
            3,
        )
        .await
        .unwrap();

        let claimed = repo
            .claim_job("worker-1", 60, None, None, Some(&["codex".to_string()]))
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn fail_job_requeues_when_retryable_and_attempts_remain() {
        let repo = test_repo().await;
        let job = repo
            .create_job(
                JobType::Task,
                serde_json::json!({"requiredCapabilities": ["codex"]}),
                0,
                None,
                None,
                None,
                3,
            )
            .await
            .unwrap();
        repo.claim_job("worker-1", 60, None, None, Some(&["codex".to_string()]))
            .await
            .unwrap()
            .unwrap();

        let failed = repo
            .fail_job(job.id, "worker-1", "boom", true, 1)
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Queued);
        assert_eq!(failed.attempt, 2);
    }

    #[tokio::test]
    async fn fail_job_dead_letters_after_max_attempts() {
        let repo = test_repo().await;
        let job = repo
            .create_job(
                JobType::Task,
                serde_json::json!({"requiredCapabilities": ["codex"]}),
                0,
                None,
                None,
                None,
                1,
            )
            .await
            .unwrap();
        repo.claim_job("worker-1", 60, None, None, Some(&["codex".to_string()]))
            .await
            .unwrap()
            .unwrap();

        let failed = repo
            .fail_job(job.id, "worker-1", "boom", true, 1)
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::DeadLetter);
    }

    #[tokio::test]
    async fn request_cancel_on_queued_job_is_immediate() {
        let repo = test_repo().await;
        let job = repo
            .create_job(
                JobType::Task,
                serde_json::json!({"requiredCapabilities": ["codex"]}),
                0,
                None,
                None,
                None,
                3,
            )
            .await
            .unwrap();
        let (cancelled, outcome) = repo.request_cancel(job.id, None, None).await.unwrap();
        assert_eq!(outcome, "queued_cancelled");
        assert_eq!(cancelled.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn append_and_list_events_cursor_order() {
        let repo = test_repo().await;
        let job = repo
            .create_job(JobType::Task, serde_json::json!({}), 0, None, None, None, 3)
            .await
            .unwrap();
        repo.append_event(job.id, JobEventLevel::Info, "first", None)
            .await
            .unwrap();
        repo.append_event(job.id, JobEventLevel::Info, "second", None)
            .await
            .unwrap();

        let events = repo.list_events(job.id, 10, None, None, false).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "first");
        assert_eq!(events[1].message, "second");
    }

    #[tokio::test]
    async fn worker_token_create_and_lookup_by_hash() {
        let repo = test_repo().await;
        let token = repo
            .create_worker_token(
                "worker-1",
                "hash123",
                None,
                None,
                None,
                vec!["codex".to_string()],
            )
            .await
            .unwrap();
        let found = repo.get_worker_token_by_hash("hash123").await.unwrap().unwrap();
        assert_eq!(found.id, token.id);
        assert!(found.is_active);
    }

    #[tokio::test]
    async fn pause_state_version_increments() {
        let repo = test_repo().await;
        let initial = repo.get_pause_state().await.unwrap();
        assert_eq!(initial.version, 0);
        let updated = repo
            .update_pause_state(true, Some(PauseMode::Drain), Some("maintenance".into()), None, None)
            .await
            .unwrap();
        assert!(updated.paused);
        assert_eq!(updated.version, 1);
    }
}

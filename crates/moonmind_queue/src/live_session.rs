//! Live Session Core (spec §4.6): `disabled → starting → ready → {revoked|ended|error}`.
//!
//! Grounded on `casparian_sentinel::control`'s tagged request/response idiom — each
//! client flow here is a single method that loads the job, checks ownership/state, calls
//! into `Repository::upsert_live_session`/`append_control_event`/`set_job_live_control`,
//! and appends the matching job event.

use chrono::{DateTime, Utc};
use moonmind_core::error::{Error, Result};
use moonmind_core::ids::JobId;
use moonmind_core::job::JobEventLevel;
use moonmind_core::live_session::{LiveSessionProvider, LiveSessionStatus, TaskRunLiveSession};
use moonmind_db::Repository;

pub struct LiveSessionConfig {
    pub ttl_minutes: i64,
    pub rw_grant_ttl_minutes: i64,
    pub allow_web: bool,
}

pub struct LiveSessionService<'a> {
    repo: &'a Repository,
    config: &'a LiveSessionConfig,
}

impl<'a> LiveSessionService<'a> {
    pub fn new(repo: &'a Repository, config: &'a LiveSessionConfig) -> Self {
        Self { repo, config }
    }

    fn is_requester(job: &moonmind_core::Job, actor_user_id: &str) -> bool {
        job.created_by_user_id.as_deref() == Some(actor_user_id)
            || job.requested_by_user_id.as_deref() == Some(actor_user_id)
    }

    /// Idempotent when the current status is already `starting`/`ready`.
    pub async fn create_live_session(
        &self,
        task_run_id: JobId,
        actor_user_id: &str,
    ) -> Result<TaskRunLiveSession> {
        let job = self.repo.require_job(task_run_id).await?;
        if !Self::is_requester(&job, actor_user_id) {
            return Err(Error::job_authorization(
                "only the job's creator or requester may start a live session",
            ));
        }

        if let Some(existing) = self.repo.get_live_session(task_run_id).await? {
            if matches!(
                existing.status,
                LiveSessionStatus::Starting | LiveSessionStatus::Ready
            ) {
                return Ok(existing);
            }
        }

        let now = Utc::now();
        let expires_at = now + chrono::Duration::minutes(self.config.ttl_minutes);
        let session = self
            .repo
            .upsert_live_session(
                task_run_id,
                Some(LiveSessionProvider::Tmate),
                Some(LiveSessionStatus::Starting),
                None,
                None,
                Some(expires_at),
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
            )
            .await?;
        self.repo
            .append_control_event(task_run_id, Some(actor_user_id.to_string()), "create", None)
            .await?;
        self.repo
            .append_event(
                task_run_id,
                JobEventLevel::Info,
                "task.live_session.created",
                None,
            )
            .await?;
        Ok(session)
    }

    /// Worker-authenticated upsert of provider/status/endpoints/hostname. Forces
    /// `web_ro`/`web_rw` to `None` when `allow_web=false`. Ownership is checked against
    /// the job's current claim, except for terminal reports (revoked/ended/error), which
    /// also accept the prior session's `worker_id` so a worker can report its own
    /// teardown after the lease already moved on.
    #[allow(clippy::too_many_arguments)]
    pub async fn report_live_session(
        &self,
        task_run_id: JobId,
        worker_id: &str,
        status: LiveSessionStatus,
        worker_hostname: Option<String>,
        attach_ro: Option<String>,
        attach_rw: Option<String>,
        mut web_ro: Option<String>,
        mut web_rw: Option<String>,
        error_message: Option<String>,
    ) -> Result<TaskRunLiveSession> {
        let job = self.repo.require_job(task_run_id).await?;
        let existing = self.repo.get_live_session(task_run_id).await?;

        let owns_claim = job.claimed_by.as_deref() == Some(worker_id);
        let owns_prior_session = existing
            .as_ref()
            .and_then(|s| s.worker_id.as_deref())
            .map(|w| w == worker_id)
            .unwrap_or(false);
        let permitted = owns_claim || (status.is_terminal() && owns_prior_session);
        if !permitted {
            return Err(Error::ownership(format!(
                "job {task_run_id} is not claimed by worker {worker_id}"
            )));
        }

        if !self.config.allow_web {
            web_ro = None;
            web_rw = None;
        }

        let now = Utc::now();
        let ended_at = if status.is_terminal() { Some(now) } else { None };
        let session = self
            .repo
            .upsert_live_session(
                task_run_id,
                Some(LiveSessionProvider::Tmate),
                Some(status),
                None,
                ended_at,
                None,
                Some(worker_id.to_string()),
                worker_hostname,
                attach_ro,
                attach_rw,
                web_ro,
                web_rw,
                None,
                Some(now),
                error_message,
            )
            .await?;
        self.repo
            .append_event(
                task_run_id,
                JobEventLevel::Info,
                "task.live_session.reported",
                Some(serde_json::json!({"status": status.as_str()})),
            )
            .await?;
        Ok(session)
    }

    /// Requires `status=ready` and a stored RW endpoint. Clamps `ttl_minutes` to
    /// `[1,240]`.
    pub async fn grant_live_session_write(
        &self,
        task_run_id: JobId,
        actor_user_id: &str,
        ttl_minutes: i64,
    ) -> Result<(TaskRunLiveSession, DateTime<Utc>)> {
        let job = self.repo.require_job(task_run_id).await?;
        if !Self::is_requester(&job, actor_user_id) {
            return Err(Error::job_authorization(
                "only the job's creator or requester may grant write access",
            ));
        }
        let session = self
            .repo
            .get_live_session(task_run_id)
            .await?
            .ok_or_else(|| {
                Error::not_found(
                    "live_session_not_found",
                    format!("job {task_run_id} has no live session"),
                )
            })?;
        if session.status != LiveSessionStatus::Ready {
            return Err(Error::state("live session is not ready"));
        }
        if session.attach_rw.is_none() {
            return Err(Error::state("live session has no write endpoint"));
        }

        let ttl = ttl_minutes.clamp(1, 240);
        let granted_until = Utc::now() + chrono::Duration::minutes(ttl);
        let session = self
            .repo
            .upsert_live_session(
                task_run_id,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                Some(granted_until),
                None,
                None,
            )
            .await?;
        self.repo
            .append_control_event(
                task_run_id,
                Some(actor_user_id.to_string()),
                "grant_rw",
                Some(serde_json::json!({"until": granted_until.to_rfc3339()})),
            )
            .await?;
        self.repo
            .append_event(
                task_run_id,
                JobEventLevel::Warn,
                "task.live_session.write_granted",
                Some(serde_json::json!({"until": granted_until.to_rfc3339()})),
            )
            .await?;
        Ok((session, granted_until))
    }

    /// Unconditionally moves to `revoked`, clearing any in-flight write grant.
    pub async fn revoke_live_session(
        &self,
        task_run_id: JobId,
        actor_user_id: &str,
    ) -> Result<TaskRunLiveSession> {
        self.repo.require_job(task_run_id).await?;
        let now = Utc::now();
        let session = self
            .repo
            .upsert_live_session(
                task_run_id,
                None,
                Some(LiveSessionStatus::Revoked),
                None,
                Some(now),
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                Some(now),
                None,
                None,
            )
            .await?;
        self.repo
            .append_control_event(task_run_id, Some(actor_user_id.to_string()), "revoke", None)
            .await?;
        self.repo
            .append_event(
                task_run_id,
                JobEventLevel::Info,
                "task.live_session.revoked",
                None,
            )
            .await?;
        Ok(session)
    }

    pub async fn heartbeat_live_session(
        &self,
        task_run_id: JobId,
        worker_id: &str,
    ) -> Result<TaskRunLiveSession> {
        let job = self.repo.require_job(task_run_id).await?;
        if job.claimed_by.as_deref() != Some(worker_id) {
            return Err(Error::ownership(format!(
                "job {task_run_id} is not claimed by worker {worker_id}"
            )));
        }
        self.repo
            .upsert_live_session(
                task_run_id,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                Some(Utc::now()),
                None,
            )
            .await?;
        self.repo
            .get_live_session(task_run_id)
            .await?
            .ok_or_else(|| {
                Error::not_found(
                    "live_session_not_found",
                    format!("job {task_run_id} has no live session"),
                )
            })
    }

    /// Writes a `liveControl` block into the job payload and logs a control + warn job
    /// event. Workers poll this block on every heartbeat.
    pub async fn apply_control_action(
        &self,
        task_run_id: JobId,
        actor_user_id: &str,
        action: &str,
    ) -> Result<moonmind_core::Job> {
        let (paused, takeover) = match action {
            "pause" => (Some(true), None),
            "resume" => (Some(false), None),
            "takeover" => (None, Some(true)),
            other => {
                return Err(Error::validation(format!(
                    "unknown live session control action '{other}'"
                )))
            }
        };
        let job = self
            .repo
            .set_job_live_control(task_run_id, paused, takeover, Some(action.to_string()))
            .await?;
        self.repo
            .append_control_event(
                task_run_id,
                Some(actor_user_id.to_string()),
                action,
                None,
            )
            .await?;
        self.repo
            .append_event(
                task_run_id,
                JobEventLevel::Warn,
                "task.live_session.control",
                Some(serde_json::json!({"action": action})),
            )
            .await?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moonmind_core::JobType;
    use moonmind_db::{create_pool, schema::migrate, DbConfig};

    async fn test_repo() -> Repository {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        migrate(&pool).await.unwrap();
        Repository::new(pool)
    }

    fn config() -> LiveSessionConfig {
        LiveSessionConfig {
            ttl_minutes: 15,
            rw_grant_ttl_minutes: 30,
            allow_web: false,
        }
    }

    #[tokio::test]
    async fn create_requires_requester_or_creator() {
        let repo = test_repo().await;
        let job = repo
            .create_job(
                JobType::Task,
                serde_json::json!({}),
                0,
                Some("alice".to_string()),
                None,
                None,
                3,
            )
            .await
            .unwrap();
        let cfg = config();
        let svc = LiveSessionService::new(&repo, &cfg);

        let err = svc
            .create_live_session(job.id, "mallory")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JobAuthorization { .. }));

        let session = svc.create_live_session(job.id, "alice").await.unwrap();
        assert_eq!(session.status, LiveSessionStatus::Starting);
    }

    #[tokio::test]
    async fn report_forces_web_endpoints_off_when_disallowed() {
        let repo = test_repo().await;
        let job = repo
            .create_job(
                JobType::Task,
                serde_json::json!({"requiredCapabilities": ["git"]}),
                0,
                Some("alice".to_string()),
                None,
                None,
                3,
            )
            .await
            .unwrap();
        repo.claim_job("worker-1", 300, None, None, Some(&["git".to_string()]))
            .await
            .unwrap()
            .unwrap();
        let cfg = config();
        let svc = LiveSessionService::new(&repo, &cfg);
        svc.create_live_session(job.id, "alice").await.unwrap();

        let session = svc
            .report_live_session(
                job.id,
                "worker-1",
                LiveSessionStatus::Ready,
                None,
                None,
                Some("rw-endpoint".to_string()),
                Some("web-ro".to_string()),
                Some("web-rw".to_string()),
                None,
            )
            .await
            .unwrap();
        assert!(session.web_ro.is_none());
        assert!(session.web_rw.is_none());
    }
}

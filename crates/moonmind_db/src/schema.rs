//! Embedded SQL schema for the agent-job queue (spec §3).
//!
//! Every column that holds a UUID or a timestamp is declared `TEXT`. Both sqlite and
//! postgres accept arbitrary text, so the same DDL and the same query text run
//! unmodified on either backend — round-tripping through `Uuid`/`DateTime<Utc>`
//! string conversions in `repository.rs` instead of native column types.

use moonmind_core::error::{Error, Result};

use crate::pool::DbPool;

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS agent_jobs (
        id TEXT PRIMARY KEY,
        type TEXT NOT NULL,
        status TEXT NOT NULL,
        priority BIGINT NOT NULL DEFAULT 0,
        payload TEXT NOT NULL,
        created_by_user_id TEXT,
        requested_by_user_id TEXT,
        affinity_key TEXT,
        claimed_by TEXT,
        lease_expires_at TEXT,
        next_attempt_at TEXT,
        attempt BIGINT NOT NULL DEFAULT 0,
        max_attempts BIGINT NOT NULL DEFAULT 3,
        result_summary TEXT,
        error_message TEXT,
        cancel_requested_at TEXT,
        cancel_requested_by_user_id TEXT,
        cancel_reason TEXT,
        artifacts_path TEXT,
        started_at TEXT,
        finished_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_agent_jobs_claim ON agent_jobs (status, priority DESC, created_at, id)",
    "CREATE INDEX IF NOT EXISTS ix_agent_jobs_affinity ON agent_jobs (affinity_key, status)",
    "CREATE INDEX IF NOT EXISTS ix_agent_jobs_lease ON agent_jobs (status, lease_expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS agent_job_artifacts (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL REFERENCES agent_jobs(id),
        name TEXT NOT NULL,
        content_type TEXT,
        size_bytes BIGINT NOT NULL,
        digest TEXT,
        storage_path TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_agent_job_artifacts_job ON agent_job_artifacts (job_id, name)",
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_agent_job_artifacts_job_name ON agent_job_artifacts (job_id, name)",
    r#"
    CREATE TABLE IF NOT EXISTS agent_job_events (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL REFERENCES agent_jobs(id),
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        payload TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_agent_job_events_job_cursor ON agent_job_events (job_id, created_at, id)",
    r#"
    CREATE TABLE IF NOT EXISTS agent_worker_tokens (
        id TEXT PRIMARY KEY,
        worker_id TEXT NOT NULL,
        token_hash TEXT NOT NULL,
        description TEXT,
        allowed_repositories TEXT,
        allowed_job_types TEXT,
        capabilities TEXT NOT NULL,
        is_active BIGINT NOT NULL DEFAULT 1,
        last_used_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_agent_worker_tokens_hash ON agent_worker_tokens (token_hash)",
    "CREATE INDEX IF NOT EXISTS ix_agent_worker_tokens_worker ON agent_worker_tokens (worker_id)",
    "CREATE INDEX IF NOT EXISTS ix_agent_worker_tokens_active ON agent_worker_tokens (is_active)",
    r#"
    CREATE TABLE IF NOT EXISTS task_run_live_sessions (
        id TEXT PRIMARY KEY,
        task_run_id TEXT NOT NULL UNIQUE REFERENCES agent_jobs(id),
        provider TEXT NOT NULL,
        status TEXT NOT NULL,
        ready_at TEXT,
        ended_at TEXT,
        expires_at TEXT,
        rw_granted_until TEXT,
        worker_id TEXT,
        worker_hostname TEXT,
        attach_ro TEXT,
        attach_rw TEXT,
        web_ro TEXT,
        web_rw TEXT,
        last_heartbeat_at TEXT,
        error_message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_run_control_events (
        id TEXT PRIMARY KEY,
        task_run_id TEXT NOT NULL REFERENCES agent_jobs(id),
        action TEXT NOT NULL,
        actor_user_id TEXT,
        detail TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_task_run_control_events_run ON task_run_control_events (task_run_id, created_at, id)",
    r#"
    CREATE TABLE IF NOT EXISTS system_worker_pause_state (
        id BIGINT PRIMARY KEY,
        paused BIGINT NOT NULL DEFAULT 0,
        mode TEXT,
        reason TEXT,
        version BIGINT NOT NULL DEFAULT 0,
        requested_by_user_id TEXT,
        requested_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS system_control_events (
        id TEXT PRIMARY KEY,
        action TEXT NOT NULL,
        actor_user_id TEXT,
        detail TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_system_control_events_cursor ON system_control_events (created_at, id)",
    r#"
    CREATE TABLE IF NOT EXISTS task_proposals (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        title TEXT NOT NULL,
        summary TEXT NOT NULL,
        category TEXT NOT NULL,
        tags TEXT NOT NULL,
        repository TEXT NOT NULL,
        dedup_key TEXT NOT NULL,
        dedup_hash TEXT NOT NULL,
        review_priority TEXT NOT NULL,
        priority_override_reason TEXT,
        task_create_request TEXT NOT NULL,
        origin_source TEXT NOT NULL,
        origin_id TEXT,
        origin_metadata TEXT,
        promoted_job_id TEXT REFERENCES agent_jobs(id),
        promoted_at TEXT,
        promoted_by_user_id TEXT,
        decided_at TEXT,
        decided_by_user_id TEXT,
        snoozed_until TEXT,
        snooze_history TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_task_proposals_dedup ON task_proposals (dedup_hash) WHERE status = 'open'",
    "CREATE INDEX IF NOT EXISTS ix_task_proposals_status ON task_proposals (status, review_priority, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS task_proposal_notifications (
        id TEXT PRIMARY KEY,
        proposal_id TEXT NOT NULL REFERENCES task_proposals(id),
        category TEXT NOT NULL,
        target TEXT NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_task_proposal_notifications_proposal ON task_proposal_notifications (proposal_id, target)",
    r#"
    CREATE TABLE IF NOT EXISTS manifest_registry (
        name TEXT PRIMARY KEY,
        content TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        version BIGINT NOT NULL DEFAULT 1,
        last_run_job_id TEXT REFERENCES agent_jobs(id),
        last_run_status TEXT,
        last_run_started_at TEXT,
        last_run_finished_at TEXT,
        state_json TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];

/// Apply the full schema. Every statement is `CREATE ... IF NOT EXISTS`, so this is
/// safe to call on every process start (mirrors the teacher's migration style for
/// the sqlite/dev path; a real postgres deployment would run these through a proper
/// migration tool instead).
pub async fn migrate(pool: &DbPool) -> Result<()> {
    for stmt in SCHEMA_STATEMENTS {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("schema migration failed: {e}")))?;
    }
    ensure_pause_singleton(pool).await?;
    Ok(())
}

async fn ensure_pause_singleton(pool: &DbPool) -> Result<()> {
    sqlx::query(
        "INSERT INTO system_worker_pause_state (id, paused, version) \
         SELECT 1, 0, 0 WHERE NOT EXISTS (SELECT 1 FROM system_worker_pause_state WHERE id = 1)",
    )
    .execute(pool)
    .await
    .map_err(|e| Error::Internal(anyhow::anyhow!("failed to seed pause state: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};

    #[tokio::test]
    #[cfg(feature = "sqlite")]
    async fn migrate_creates_all_tables() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        migrate(&pool).await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM system_worker_pause_state")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, 1);
    }
}

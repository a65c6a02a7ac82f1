//! Job, JobArtifact, and JobEvent records (spec §3, §4.1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{ArtifactId, EventId, JobId};

/// Stage markers a worker emits as events while executing a `task` job (spec glossary).
pub const STAGE_PREPARE: &str = "moonmind.task.prepare";
pub const STAGE_EXECUTE: &str = "moonmind.task.execute";
pub const STAGE_PUBLISH: &str = "moonmind.task.publish";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Task,
    Manifest,
    CodexExec,
    CodexSkill,
}

impl JobType {
    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::CodexExec | Self::CodexSkill)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Manifest => "manifest",
            Self::CodexExec => "codex_exec",
            Self::CodexSkill => "codex_skill",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "manifest" => Ok(Self::Manifest),
            "codex_exec" => Ok(Self::CodexExec),
            "codex_skill" => Ok(Self::CodexSkill),
            other => Err(crate::Error::validation(format!(
                "unknown job type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    DeadLetter,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::DeadLetter
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(crate::Error::validation(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// Full job record (`AgentJob`, spec §3).
///
/// Invariant: `status == Running` implies `claimed_by` and `lease_expires_at` are both
/// `Some`; `status.is_terminal()` implies both are `None` and `finished_at` is `Some`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub created_by_user_id: Option<String>,
    pub requested_by_user_id: Option<String>,
    pub affinity_key: Option<String>,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub attempt: i32,
    pub max_attempts: i32,
    pub result_summary: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub cancel_requested_by_user_id: Option<String>,
    pub cancel_reason: Option<String>,
    pub artifacts_path: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested_at.is_some()
    }

    /// `repository` field of a task/manifest-shaped payload, if present. Used by the
    /// claim path's `allowed_repositories` check (spec §4.1 step 1).
    pub fn payload_repository(&self) -> Option<&str> {
        self.payload.get("repository").and_then(|v| v.as_str())
    }

    /// `requiredCapabilities` of the payload, normalized. Empty ⇒ never claimable
    /// (deny-by-default, spec §4.1 step 2).
    pub fn required_capabilities(&self) -> Vec<String> {
        self.payload
            .get("requiredCapabilities")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventLevel {
    Info,
    Warn,
    Error,
}

impl JobEventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for JobEventLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(crate::Error::validation(format!(
                "unknown event level '{other}'"
            ))),
        }
    }
}

/// An append-only `JobEvent` row. Ordering key is `(created_at, id)` — a composite
/// monotonic cursor (spec §3, §8 scenario 8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: EventId,
    pub job_id: JobId,
    pub level: JobEventLevel,
    pub message: String,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// `JobArtifact` metadata row (spec §3, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobArtifact {
    pub id: ArtifactId,
    pub job_id: JobId,
    pub name: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub digest: Option<String>,
    pub storage_path: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_capabilities_defaults_empty() {
        let job = Job {
            id: JobId::new(),
            job_type: JobType::Task,
            status: JobStatus::Queued,
            priority: 0,
            payload: serde_json::json!({}),
            created_by_user_id: None,
            requested_by_user_id: None,
            affinity_key: None,
            claimed_by: None,
            lease_expires_at: None,
            next_attempt_at: None,
            attempt: 1,
            max_attempts: 3,
            result_summary: None,
            error_message: None,
            cancel_requested_at: None,
            cancel_requested_by_user_id: None,
            cancel_reason: None,
            artifacts_path: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(job.required_capabilities().is_empty());
    }

    #[test]
    fn job_status_display_matches_wire_form() {
        assert_eq!(JobStatus::DeadLetter.to_string(), "dead_letter");
        assert_eq!("dead_letter".parse::<JobStatus>().unwrap(), JobStatus::DeadLetter);
    }
}

//! Task-run live session records (spec §3, §4.6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{JobId, LiveSessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveSessionProvider {
    Tmate,
}

impl LiveSessionProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tmate => "tmate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveSessionStatus {
    Disabled,
    Starting,
    Ready,
    Revoked,
    Ended,
    Error,
}

impl LiveSessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Revoked | Self::Ended | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Revoked => "revoked",
            Self::Ended => "ended",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LiveSessionStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "starting" => Ok(Self::Starting),
            "ready" => Ok(Self::Ready),
            "revoked" => Ok(Self::Revoked),
            "ended" => Ok(Self::Ended),
            "error" => Ok(Self::Error),
            other => Err(crate::Error::validation(format!(
                "unknown live session status '{other}'"
            ))),
        }
    }
}

/// *Invariant*: at most one row per `task_run_id`; `ended_at`, once set, is never
/// overwritten by a later `report_live_session` call (spec §3, §8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunLiveSession {
    pub id: LiveSessionId,
    pub task_run_id: JobId,
    pub provider: LiveSessionProvider,
    pub status: LiveSessionStatus,
    pub ready_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub rw_granted_until: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub worker_hostname: Option<String>,
    pub attach_ro: Option<String>,
    pub attach_rw: Option<String>,
    pub web_ro: Option<String>,
    pub web_rw: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit entries for pause/resume/takeover/grant_rw/revoke_session/
/// send_message actions against a task-run live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunControlEvent {
    pub id: uuid::Uuid,
    pub task_run_id: JobId,
    pub action: String,
    pub actor_user_id: Option<String>,
    pub detail: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

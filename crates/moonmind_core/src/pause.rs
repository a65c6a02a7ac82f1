//! The singleton worker-pause control row (spec §3, §4.5, §9 design notes).
//!
//! This is a concurrency primitive, not a cache: callers must always read it `FOR
//! UPDATE` before mutating (enforced by `moonmind_db::repository`) and never introduce
//! an in-process mirror.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseMode {
    Drain,
    Quiesce,
}

impl PauseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drain => "drain",
            Self::Quiesce => "quiesce",
        }
    }
}

impl std::str::FromStr for PauseMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drain" => Ok(Self::Drain),
            "quiesce" => Ok(Self::Quiesce),
            other => Err(crate::Error::validation(format!(
                "unknown worker pause mode '{other}'"
            ))),
        }
    }
}

/// Singleton row (id=1). *Invariant*: `version` strictly increases with every mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemWorkerPauseState {
    pub paused: bool,
    pub mode: Option<PauseMode>,
    pub reason: Option<String>,
    pub version: i64,
    pub requested_by_user_id: Option<String>,
    pub requested_at: Option<DateTime<Utc>>,
}

impl SystemWorkerPauseState {
    pub fn initial() -> Self {
        Self {
            paused: false,
            mode: None,
            reason: None,
            version: 0,
            requested_by_user_id: None,
            requested_at: None,
        }
    }
}

/// Audit log entry for a worker-pause transition. One is appended per mutation,
/// matching the `version` increment 1:1 (spec §8 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemControlEvent {
    pub id: uuid::Uuid,
    pub action: String,
    pub actor_user_id: Option<String>,
    pub detail: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

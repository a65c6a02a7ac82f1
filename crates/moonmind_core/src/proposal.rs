//! Task proposal records (spec §3, §4.7).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{JobId, ProposalId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Open,
    Promoted,
    Dismissed,
    Accepted,
    Rejected,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Promoted => "promoted",
            Self::Dismissed => "dismissed",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for ProposalStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "promoted" => Ok(Self::Promoted),
            "dismissed" => Ok(Self::Dismissed),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            other => Err(crate::Error::validation(format!(
                "unknown proposal status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl ReviewPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl std::str::FromStr for ReviewPriority {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(crate::Error::validation(format!(
                "unknown review priority '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginSource {
    Queue,
    Orchestrator,
    Workflow,
    Manual,
}

impl OriginSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Orchestrator => "orchestrator",
            Self::Workflow => "workflow",
            Self::Manual => "manual",
        }
    }
}

impl std::str::FromStr for OriginSource {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queue" => Ok(Self::Queue),
            "orchestrator" => Ok(Self::Orchestrator),
            "workflow" => Ok(Self::Workflow),
            "manual" => Ok(Self::Manual),
            other => Err(crate::Error::validation(format!(
                "unknown origin source '{other}'"
            ))),
        }
    }
}

/// One bounded entry in a proposal's `snooze_history` (spec §3, §10 supplement).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnoozeHistoryEntry {
    pub action: String,
    pub until: Option<DateTime<Utc>>,
    pub actor_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub const SNOOZE_HISTORY_MAX: usize = 20;

/// `TaskProposal` record (spec §3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProposal {
    pub id: ProposalId,
    pub status: ProposalStatus,
    pub title: String,
    pub summary: String,
    pub category: String,
    pub tags: Vec<String>,
    pub repository: String,
    pub dedup_key: String,
    pub dedup_hash: String,
    pub review_priority: ReviewPriority,
    pub priority_override_reason: Option<String>,
    pub task_create_request: serde_json::Value,
    pub origin_source: OriginSource,
    pub origin_id: Option<String>,
    pub origin_metadata: Option<serde_json::Value>,
    pub promoted_job_id: Option<JobId>,
    pub promoted_at: Option<DateTime<Utc>>,
    pub promoted_by_user_id: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by_user_id: Option<String>,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub snooze_history: Vec<SnoozeHistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskProposal {
    /// Push a new history entry, dropping the oldest once the bound is exceeded
    /// (spec §3: "bounded to last 20").
    pub fn push_snooze_history(&mut self, entry: SnoozeHistoryEntry) {
        self.snooze_history.push(entry);
        if self.snooze_history.len() > SNOOZE_HISTORY_MAX {
            let overflow = self.snooze_history.len() - SNOOZE_HISTORY_MAX;
            self.snooze_history.drain(0..overflow);
        }
    }
}

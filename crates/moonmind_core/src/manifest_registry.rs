//! Manifest registry record (spec §3, §4.8).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::JobId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRegistryRecord {
    pub name: String,
    pub content: String,
    pub content_hash: String,
    pub version: i32,
    pub last_run_job_id: Option<JobId>,
    pub last_run_status: Option<String>,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_finished_at: Option<DateTime<Utc>>,
    /// Opaque scratch field a worker may use for incremental indexing checkpoints.
    /// The registry never parses it (SPEC_FULL.md §10).
    pub state_json: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

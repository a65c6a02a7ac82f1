//! Task Proposal Service (spec §4.7): create/list/promote/dismiss/snooze/reprioritize.
//!
//! Grounded function-for-function on
//! `original_source/moonmind/workflows/task_proposals/service.py`'s `TaskProposalService`
//! — the dedup-key computation, MoonMind-CI signal policy, cursor shape, and the
//! open-status-plus-lock guard on every decision endpoint all mirror that module, layered
//! here on `Repository`'s conditional-UPDATE guard (`update_proposal`) instead of an ORM
//! session/row-lock, matching how `moonmind_queue::service::QueueService` already does
//! its own state transitions.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use moonmind_core::error::{Error, Result};
use moonmind_core::ids::ProposalId;
use moonmind_core::job::JobType;
use moonmind_core::principal::WorkerPolicy;
use moonmind_core::proposal::{OriginSource, ProposalStatus, ReviewPriority, SnoozeHistoryEntry, TaskProposal};
use moonmind_core::Job;
use moonmind_db::Repository;
use moonmind_queue::QueueService;

use crate::dedup;
use crate::notify::{self, NotifyConfig};
use crate::redact::{self, RedactorConfig};

const PROPOSALS_WRITE_CAPABILITY: &str = "proposals_write";

const MOONMIND_SIGNAL_TAGS: [&str; 7] = [
    "retry",
    "duplicate_output",
    "missing_ref",
    "conflicting_instructions",
    "flaky_test",
    "loop_detected",
    "artifact_gap",
];

/// Runtime configuration beyond what `Repository`/`QueueService` already know (spec §6).
pub struct ProposalServiceConfig {
    pub default_target_runtime: String,
    pub default_publish_mode: String,
    pub moonmind_ci_repository: String,
    pub similar_limit: i64,
    pub redaction_placeholder: String,
    pub notifications_webhook_url: Option<String>,
    pub notifications_authorization: Option<String>,
    pub notifications_timeout_seconds: u64,
    pub notifications_enabled: bool,
}

/// Create-proposal input (spec §4.7 "Create"). Kept as a struct rather than a long
/// parameter list, matching `moonmind_queue::cancel`'s request-envelope style.
pub struct CreateProposalRequest {
    pub title: String,
    pub summary: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub task_create_request: Value,
    pub origin_source: OriginSource,
    pub origin_id: Option<String>,
    pub origin_metadata: Option<Value>,
    pub review_priority: Option<ReviewPriority>,
}

struct PreparedTaskCreateRequest {
    envelope: Value,
    repository: String,
    priority: i64,
    max_attempts: i64,
    affinity_key: Option<String>,
}

pub struct ProposalService<'a> {
    repo: &'a Repository,
    queue: &'a QueueService<'a>,
    config: &'a ProposalServiceConfig,
    redactor: RedactorConfig,
    notify: NotifyConfig,
    http: reqwest::Client,
}

impl<'a> ProposalService<'a> {
    pub fn new(repo: &'a Repository, queue: &'a QueueService<'a>, config: &'a ProposalServiceConfig) -> Self {
        Self {
            repo,
            queue,
            config,
            redactor: RedactorConfig {
                placeholder: config.redaction_placeholder.clone(),
            },
            notify: NotifyConfig {
                webhook_url: config.notifications_webhook_url.clone(),
                authorization: config.notifications_authorization.clone(),
                timeout_seconds: config.notifications_timeout_seconds,
                enabled: config.notifications_enabled,
            },
            http: reqwest::Client::new(),
        }
    }

    fn scrub(&self, text: &str) -> String {
        redact::scrub_text(&self.redactor, text)
    }

    /// Validate a worker bearer token carries `proposals_write` (spec §4.7, worker
    /// submission path; mirrors `QueueService::resolve_worker_token`'s capability gate).
    pub async fn resolve_worker_token(&self, raw_token: Option<&str>) -> Result<WorkerPolicy> {
        let raw = raw_token
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                Error::validation("worker token is required for worker-authenticated proposal submission")
            })?;
        let policy = self.queue.resolve_worker_token(raw).await?;
        if !policy.capabilities.iter().any(|c| c.as_str() == PROPOSALS_WRITE_CAPABILITY) {
            return Err(Error::authorization("worker token is not authorized for proposal submission"));
        }
        Ok(policy)
    }

    fn is_moonmind_repository(&self, repository: &str) -> bool {
        let configured = self.config.moonmind_ci_repository.trim().to_lowercase();
        !configured.is_empty() && repository.trim().to_lowercase() == configured
    }

    fn normalize_moonmind_title(title: &str, tags: &[String]) -> String {
        let mut normalized = title.trim().to_string();
        if !normalized.to_lowercase().starts_with("[run_quality]") {
            let base = if normalized.is_empty() {
                "MoonMind proposal"
            } else {
                normalized.as_str()
            };
            normalized = format!("[run_quality] {base}").trim().to_string();
        }
        let mut slug_items: Vec<&str> = tags.iter().map(String::as_str).filter(|t| !t.is_empty()).collect();
        slug_items.sort_unstable();
        slug_items.dedup();
        if !slug_items.is_empty() {
            let marker = format!("(tags: {})", slug_items.join("+"));
            if !normalized.contains(&marker) {
                normalized = format!("{normalized} {marker}");
            }
        }
        normalized
    }

    /// Force category to `run_quality`, intersect tags with the fixed signal allowlist,
    /// and require `triggerRepo`/`triggerJobId`/`signal` metadata (spec §4.7 "Special-case
    /// MoonMind CI").
    fn enforce_moonmind_policy(
        &self,
        title: &str,
        category: Option<&str>,
        tags: &[String],
        metadata: &mut Map<String, Value>,
    ) -> Result<(String, Vec<String>, String)> {
        let mut normalized_category = category.unwrap_or("run_quality").to_lowercase();
        if normalized_category == "moonmind_ci" {
            normalized_category = "run_quality".to_string();
        }
        if normalized_category != "run_quality" {
            return Err(Error::validation("MoonMind proposals must use category 'run_quality'"));
        }

        let allowed_tags: Vec<String> = tags
            .iter()
            .filter(|tag| MOONMIND_SIGNAL_TAGS.contains(&tag.as_str()))
            .cloned()
            .collect();
        if allowed_tags.is_empty() {
            return Err(Error::validation(
                "MoonMind proposals require at least one approved signal tag",
            ));
        }

        let trigger_repo = metadata
            .get("triggerRepo")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        let trigger_job = metadata
            .get("triggerJobId")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if trigger_repo.is_empty() || trigger_job.is_empty() {
            return Err(Error::validation(
                "MoonMind proposals must include triggerRepo and triggerJobId metadata",
            ));
        }
        if !matches!(metadata.get("signal"), Some(Value::Object(_))) {
            return Err(Error::validation(
                "MoonMind proposals must provide origin_metadata.signal details",
            ));
        }
        metadata.insert("triggerRepo".to_string(), json!(trigger_repo));
        metadata.insert("triggerJobId".to_string(), json!(trigger_job));

        let normalized_title = Self::normalize_moonmind_title(title, &allowed_tags);
        Ok((normalized_category, allowed_tags, normalized_title))
    }

    /// Derive a suggested review priority from the MoonMind-CI signal payload (spec
    /// §4.7). Returns `(priority, reason)` together, or `(None, None)` when no rule
    /// matches.
    fn derive_moonmind_priority(
        tags: &[String],
        metadata: &Map<String, Value>,
    ) -> (Option<ReviewPriority>, Option<&'static str>) {
        let signal = metadata.get("signal").and_then(Value::as_object);
        let severity = signal
            .and_then(|s| s.get("severity"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_lowercase();
        if severity == "high" || severity == "critical" {
            return (Some(ReviewPriority::High), Some("signal:severity"));
        }
        let has = |tag: &str| tags.iter().any(|t| t == tag);
        if has("loop_detected") {
            return (Some(ReviewPriority::High), Some("signal:loop_detected"));
        }
        if has("conflicting_instructions") {
            return (Some(ReviewPriority::High), Some("signal:conflicting_instructions"));
        }
        if has("missing_ref") {
            let missing_refs = signal
                .and_then(|s| s.get("missingRefs").or_else(|| s.get("missing_refs")))
                .and_then(Value::as_array);
            if missing_refs.map(|refs| !refs.is_empty()).unwrap_or(false) {
                return (Some(ReviewPriority::High), Some("signal:missing_ref"));
            }
        }
        if has("retry") {
            let retries = signal.and_then(|s| s.get("retries")).and_then(Value::as_i64).unwrap_or(0);
            if retries >= 2 {
                return (Some(ReviewPriority::High), Some("signal:retry_exhausted"));
            }
            return (Some(ReviewPriority::Normal), Some("signal:retry"));
        }
        if has("duplicate_output") || has("artifact_gap") {
            return (Some(ReviewPriority::Normal), Some("signal:quality_gap"));
        }
        if has("flaky_test") {
            return (Some(ReviewPriority::Low), Some("signal:flaky_test"));
        }
        (None, None)
    }

    /// Normalize the embedded `task_create_request` envelope through the task contract
    /// and extract `repository` (spec §4.7). Shared by `create_proposal` and
    /// `promote_proposal`.
    fn prepare_task_create_request(&self, request: &Value) -> Result<PreparedTaskCreateRequest> {
        let obj = request
            .as_object()
            .ok_or_else(|| Error::validation("taskCreateRequest must be an object"))?;

        let job_type = obj
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("task")
            .to_lowercase();
        if job_type != "task" {
            return Err(Error::validation("taskCreateRequest.type must be 'task'"));
        }

        let priority = match obj.get("priority") {
            None | Some(Value::Null) => 0,
            Some(v) => v
                .as_i64()
                .ok_or_else(|| Error::validation("taskCreateRequest.priority must be an integer"))?,
        };

        let max_attempts = match obj.get("maxAttempts") {
            None | Some(Value::Null) => 3,
            Some(v) => v
                .as_i64()
                .ok_or_else(|| Error::validation("taskCreateRequest.maxAttempts must be an integer"))?,
        };
        if max_attempts < 1 {
            return Err(Error::validation("maxAttempts must be >= 1"));
        }

        let affinity_key = obj
            .get("affinityKey")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let payload = obj.get("payload").cloned().unwrap_or_else(|| Value::Object(Map::new()));
        if !payload.is_object() {
            return Err(Error::validation("taskCreateRequest.payload must be an object"));
        }
        let normalized_payload = moonmind_contracts::normalize_queue_job_payload(
            "task",
            Some(&payload),
            &self.config.default_target_runtime,
            &self.config.default_publish_mode,
        )?;

        let repository = normalized_payload
            .get("repository")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::validation("taskCreateRequest.payload.repository is required"))?;

        let mut envelope = Map::new();
        envelope.insert("type".to_string(), json!("task"));
        envelope.insert("priority".to_string(), json!(priority));
        envelope.insert("maxAttempts".to_string(), json!(max_attempts));
        envelope.insert("payload".to_string(), normalized_payload);
        if let Some(key) = &affinity_key {
            envelope.insert("affinityKey".to_string(), json!(key));
        }

        Ok(PreparedTaskCreateRequest {
            envelope: Value::Object(envelope),
            repository,
            priority,
            max_attempts,
            affinity_key,
        })
    }

    fn encode_cursor(proposal: &TaskProposal) -> String {
        format!("{}|{}", proposal.created_at.to_rfc3339(), proposal.id)
    }

    fn decode_cursor(cursor: &str) -> Result<(DateTime<Utc>, ProposalId)> {
        let (timestamp, id) = cursor
            .split_once('|')
            .ok_or_else(|| Error::validation("cursor is invalid"))?;
        let parsed = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|_| Error::validation("cursor is invalid"))?
            .with_timezone(&Utc);
        let proposal_id: ProposalId = id.parse().map_err(|_| Error::validation("cursor is invalid"))?;
        Ok((parsed, proposal_id))
    }

    /// Create a proposal: validate, scrub, apply the MoonMind-CI policy when the
    /// repository matches, compute dedup fields, persist, and fire a best-effort
    /// notification (spec §4.7 "Create").
    pub async fn create_proposal(&self, req: CreateProposalRequest) -> Result<TaskProposal> {
        if !matches!(req.origin_source, OriginSource::Manual) && req.origin_id.is_none() {
            return Err(Error::validation("origin_id is required for non-manual proposals"));
        }

        let mut title = self.scrub(req.title.trim());
        if title.is_empty() {
            return Err(Error::validation("title is required"));
        }
        if title.chars().count() > 256 {
            return Err(Error::validation("title exceeds max length"));
        }

        let summary = self.scrub(req.summary.trim());
        if summary.is_empty() {
            return Err(Error::validation("summary is required"));
        }
        if summary.chars().count() > 10_000 {
            return Err(Error::validation("summary exceeds max length"));
        }

        let mut category = normalize_category(req.category.as_deref())?;
        let mut tags = normalize_tags(&req.tags)?;
        let mut requested_priority = req.review_priority.unwrap_or(ReviewPriority::Normal);
        let mut priority_override_reason = None;

        let prepared = self.prepare_task_create_request(&req.task_create_request)?;
        let mut metadata = req
            .origin_metadata
            .as_ref()
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        if self.is_moonmind_repository(&prepared.repository) {
            let (enforced_category, enforced_tags, enforced_title) =
                self.enforce_moonmind_policy(&title, category.as_deref(), &tags, &mut metadata)?;
            category = Some(enforced_category);
            tags = enforced_tags;
            title = enforced_title;

            if let (Some(derived), Some(reason)) = Self::derive_moonmind_priority(&tags, &metadata) {
                if derived > requested_priority {
                    requested_priority = derived;
                    priority_override_reason = Some(reason.to_string());
                }
            }
        }

        let (dedup_key, dedup_hash) = dedup::compute_dedup_fields(&prepared.repository, &title);
        let scrubbed_request = redact::scrub_value(&self.redactor, &prepared.envelope);
        let origin_metadata = if metadata.is_empty() {
            None
        } else {
            Some(Value::Object(metadata))
        };

        let now = Utc::now();
        let proposal = TaskProposal {
            id: ProposalId::new(),
            status: ProposalStatus::Open,
            title,
            summary,
            category: category.unwrap_or_default(),
            tags,
            repository: prepared.repository,
            dedup_key,
            dedup_hash,
            review_priority: requested_priority,
            priority_override_reason,
            task_create_request: scrubbed_request,
            origin_source: req.origin_source,
            origin_id: req.origin_id,
            origin_metadata,
            promoted_job_id: None,
            promoted_at: None,
            promoted_by_user_id: None,
            decided_at: None,
            decided_by_user_id: None,
            snoozed_until: None,
            snooze_history: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        let created = self.repo.create_proposal(proposal).await?;
        notify::emit_notification(&self.http, self.repo, &self.notify, &created).await?;
        tracing::info!(
            proposal_id = %created.id,
            repository = %created.repository,
            category = %created.category,
            "created task proposal"
        );
        Ok(created)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn list_proposals(
        &self,
        status: Option<ProposalStatus>,
        category: Option<&str>,
        repository: Option<&str>,
        origin_source: Option<OriginSource>,
        cursor: Option<&str>,
        limit: i64,
        include_snoozed: bool,
        only_snoozed: bool,
    ) -> Result<(Vec<TaskProposal>, Option<String>)> {
        if !(1..=200).contains(&limit) {
            return Err(Error::validation("limit must be between 1 and 200"));
        }
        let normalized_category = normalize_category(category)?;
        let normalized_repository = repository.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        let cursor_tuple = cursor.map(Self::decode_cursor).transpose()?;

        let now = Utc::now();
        self.repo.expire_snoozed_proposals(now).await?;
        let (proposals, has_more) = self
            .repo
            .list_proposals(
                status,
                normalized_category.as_deref(),
                normalized_repository.as_deref(),
                origin_source,
                cursor_tuple,
                limit,
                now,
                include_snoozed,
                only_snoozed,
            )
            .await?;
        let next_cursor = if has_more {
            proposals.last().map(Self::encode_cursor)
        } else {
            None
        };
        Ok((proposals, next_cursor))
    }

    pub async fn get_proposal(&self, id: ProposalId) -> Result<TaskProposal> {
        self.repo.require_proposal(id).await
    }

    pub async fn get_similar_proposals(&self, proposal: &TaskProposal, limit: Option<i64>) -> Result<Vec<TaskProposal>> {
        if proposal.dedup_hash.is_empty() {
            return Ok(Vec::new());
        }
        let limit = limit.unwrap_or(self.config.similar_limit);
        self.repo.list_similar_proposals(&proposal.dedup_hash, proposal.id, limit).await
    }

    /// Promote an open proposal into a real `type=task` job (spec §4.7 "Promote").
    /// Idempotent when already promoted and the referenced job still exists.
    pub async fn promote_proposal(
        &self,
        proposal_id: ProposalId,
        promoted_by_user_id: &str,
        priority_override: Option<i32>,
        max_attempts_override: Option<i32>,
        task_create_request_override: Option<&Value>,
    ) -> Result<(TaskProposal, Job)> {
        let mut proposal = self.repo.require_proposal(proposal_id).await?;

        if proposal.status == ProposalStatus::Promoted {
            let job_id = proposal
                .promoted_job_id
                .ok_or_else(|| Error::state("proposal already promoted without a job id"))?;
            let job = self.queue.get_job(job_id).await?;
            return Ok((proposal, job));
        }
        if proposal.status != ProposalStatus::Open {
            return Err(Error::state(format!(
                "proposal status {} cannot be promoted",
                proposal.status.as_str()
            )));
        }

        let prepared = match task_create_request_override {
            Some(override_request) => {
                let prepared = self.prepare_task_create_request(override_request)?;
                if prepared.repository != proposal.repository {
                    return Err(Error::validation(
                        "taskCreateRequest override repository must match the proposal's repository",
                    ));
                }
                prepared
            }
            None => self.prepare_task_create_request(&proposal.task_create_request)?,
        };

        let priority = priority_override.map(i64::from).unwrap_or(prepared.priority);
        let max_attempts = max_attempts_override.map(i64::from).unwrap_or(prepared.max_attempts);
        if max_attempts < 1 {
            return Err(Error::validation("maxAttempts must be >= 1"));
        }
        let payload = prepared
            .envelope
            .get("payload")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));

        let job = self
            .queue
            .create_job(
                JobType::Task,
                payload,
                priority as i32,
                Some(promoted_by_user_id.to_string()),
                None,
                prepared.affinity_key.clone(),
                max_attempts as i32,
            )
            .await?;

        let now = Utc::now();
        proposal.status = ProposalStatus::Promoted;
        proposal.promoted_job_id = Some(job.id);
        proposal.promoted_at = Some(now);
        proposal.promoted_by_user_id = Some(promoted_by_user_id.to_string());
        proposal.decided_at = Some(now);
        proposal.decided_by_user_id = Some(promoted_by_user_id.to_string());
        let mut envelope = prepared.envelope;
        envelope["priority"] = json!(priority);
        envelope["maxAttempts"] = json!(max_attempts);
        proposal.task_create_request = redact::scrub_value(&self.redactor, &envelope);

        let updated = self.repo.update_proposal(&proposal, ProposalStatus::Open).await?;
        tracing::info!(proposal_id = %updated.id, job_id = %job.id, "promoted task proposal");
        Ok((updated, job))
    }

    pub async fn dismiss_proposal(&self, proposal_id: ProposalId, dismissed_by_user_id: &str) -> Result<TaskProposal> {
        let mut proposal = self.repo.require_proposal(proposal_id).await?;
        if proposal.status != ProposalStatus::Open {
            return Err(Error::state(format!(
                "proposal status {} cannot be dismissed",
                proposal.status.as_str()
            )));
        }
        proposal.status = ProposalStatus::Dismissed;
        proposal.decided_at = Some(Utc::now());
        proposal.decided_by_user_id = Some(dismissed_by_user_id.to_string());
        let updated = self.repo.update_proposal(&proposal, ProposalStatus::Open).await?;
        tracing::info!(proposal_id = %updated.id, "dismissed task proposal");
        Ok(updated)
    }

    pub async fn update_review_priority(
        &self,
        proposal_id: ProposalId,
        priority: ReviewPriority,
        updated_by_user_id: &str,
    ) -> Result<TaskProposal> {
        let mut proposal = self.repo.require_proposal(proposal_id).await?;
        if proposal.status != ProposalStatus::Open {
            return Err(Error::state(format!(
                "proposal status {} cannot be reprioritized",
                proposal.status.as_str()
            )));
        }
        proposal.review_priority = priority;
        let updated = self.repo.update_proposal(&proposal, ProposalStatus::Open).await?;
        tracing::info!(
            proposal_id = %updated.id,
            by = %updated_by_user_id,
            priority = priority.as_str(),
            "updated proposal review priority"
        );
        Ok(updated)
    }

    pub async fn snooze_proposal(
        &self,
        proposal_id: ProposalId,
        until: DateTime<Utc>,
        user_id: &str,
    ) -> Result<TaskProposal> {
        let mut proposal = self.repo.require_proposal(proposal_id).await?;
        if proposal.status != ProposalStatus::Open {
            return Err(Error::state(format!(
                "proposal status {} cannot be snoozed",
                proposal.status.as_str()
            )));
        }
        if until <= Utc::now() {
            return Err(Error::validation("snooze expiration must be in the future"));
        }
        proposal.snoozed_until = Some(until);
        proposal.push_snooze_history(SnoozeHistoryEntry {
            action: "snooze".to_string(),
            until: Some(until),
            actor_user_id: Some(user_id.to_string()),
            created_at: Utc::now(),
        });
        let updated = self.repo.update_proposal(&proposal, ProposalStatus::Open).await?;
        tracing::info!(proposal_id = %updated.id, until = %until, "snoozed task proposal");
        Ok(updated)
    }

    pub async fn unsnooze_proposal(&self, proposal_id: ProposalId, user_id: &str) -> Result<TaskProposal> {
        let mut proposal = self.repo.require_proposal(proposal_id).await?;
        if proposal.status != ProposalStatus::Open {
            return Err(Error::state(format!(
                "proposal status {} cannot be unsnoozed",
                proposal.status.as_str()
            )));
        }
        proposal.snoozed_until = None;
        proposal.push_snooze_history(SnoozeHistoryEntry {
            action: "unsnooze".to_string(),
            until: None,
            actor_user_id: Some(user_id.to_string()),
            created_at: Utc::now(),
        });
        let updated = self.repo.update_proposal(&proposal, ProposalStatus::Open).await?;
        tracing::info!(proposal_id = %updated.id, "unsnoozed task proposal");
        Ok(updated)
    }
}

fn normalize_category(value: Option<&str>) -> Result<Option<String>> {
    let text = value.unwrap_or("").trim().to_lowercase();
    if text.is_empty() {
        return Ok(None);
    }
    if text.chars().count() > 64 {
        return Err(Error::validation("category exceeds max length"));
    }
    Ok(Some(text))
}

fn normalize_tags(values: &[String]) -> Result<Vec<String>> {
    let mut normalized: Vec<String> = Vec::new();
    for raw in values {
        let candidate = raw.trim().to_lowercase();
        if candidate.is_empty() || normalized.contains(&candidate) {
            continue;
        }
        if candidate.chars().count() > 64 {
            return Err(Error::validation("tag exceeds max length"));
        }
        normalized.push(candidate);
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use moonmind_db::{create_pool, schema::migrate, DbConfig};
    use moonmind_queue::QueueServiceConfig;

    async fn test_repo() -> Repository {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        migrate(&pool).await.unwrap();
        Repository::new(pool)
    }

    fn queue_config() -> QueueServiceConfig {
        QueueServiceConfig {
            default_target_runtime: "codex".to_string(),
            default_publish_mode: "none".to_string(),
            artifact_max_bytes: 1024,
            allow_manifest_path_source: false,
            retry_backoff_base_seconds: 5,
            retry_backoff_max_seconds: 900,
        }
    }

    fn proposal_config() -> ProposalServiceConfig {
        ProposalServiceConfig {
            default_target_runtime: "codex".to_string(),
            default_publish_mode: "none".to_string(),
            moonmind_ci_repository: "moonmind/moonmind-ci".to_string(),
            similar_limit: 10,
            redaction_placeholder: "[REDACTED]".to_string(),
            notifications_webhook_url: None,
            notifications_authorization: None,
            notifications_timeout_seconds: 5,
            notifications_enabled: false,
        }
    }

    fn task_request(repository: &str) -> Value {
        json!({
            "type": "task",
            "priority": 1,
            "maxAttempts": 3,
            "payload": {
                "repository": repository,
                "task": {"instructions": "do the thing"}
            }
        })
    }

    #[tokio::test]
    async fn create_proposal_computes_dedup_fields() {
        let repo = test_repo().await;
        let qcfg = queue_config();
        let queue = QueueService::new(&repo, &qcfg);
        let pcfg = proposal_config();
        let service = ProposalService::new(&repo, &queue, &pcfg);

        let proposal = service
            .create_proposal(CreateProposalRequest {
                title: "Fix the flaky test".to_string(),
                summary: "It fails about 10% of the time".to_string(),
                category: Some("tests".to_string()),
                tags: vec!["flaky".to_string(), "FLAKY".to_string()],
                task_create_request: task_request("Moon/Widgets"),
                origin_source: OriginSource::Manual,
                origin_id: None,
                origin_metadata: None,
                review_priority: None,
            })
            .await
            .unwrap();

        assert_eq!(proposal.repository, "Moon/Widgets");
        assert_eq!(proposal.tags, vec!["flaky".to_string()]);
        assert_eq!(proposal.dedup_key, "moon/widgets:fix-the-flaky-test");
        assert_eq!(proposal.dedup_hash.len(), 64);
        assert_eq!(proposal.review_priority, ReviewPriority::Normal);
    }

    #[tokio::test]
    async fn moonmind_ci_policy_forces_category_and_derives_priority() {
        let repo = test_repo().await;
        let qcfg = queue_config();
        let queue = QueueService::new(&repo, &qcfg);
        let pcfg = proposal_config();
        let service = ProposalService::new(&repo, &queue, &pcfg);

        let proposal = service
            .create_proposal(CreateProposalRequest {
                title: "Loop detected in nightly run".to_string(),
                summary: "The worker looped three times before giving up".to_string(),
                category: None,
                tags: vec!["loop_detected".to_string(), "not_a_signal_tag".to_string()],
                task_create_request: task_request("MoonMind/moonmind-ci"),
                origin_source: OriginSource::Workflow,
                origin_id: Some("job-123".to_string()),
                origin_metadata: Some(json!({
                    "triggerRepo": "MoonMind/moonmind-ci",
                    "triggerJobId": "job-123",
                    "signal": {"severity": "low"}
                })),
                review_priority: None,
            })
            .await
            .unwrap();

        assert_eq!(proposal.category, "run_quality");
        assert_eq!(proposal.tags, vec!["loop_detected".to_string()]);
        assert_eq!(proposal.review_priority, ReviewPriority::High);
        assert_eq!(proposal.priority_override_reason.as_deref(), Some("signal:loop_detected"));
        assert!(proposal.title.starts_with("[run_quality]"));
    }

    #[tokio::test]
    async fn moonmind_ci_requires_signal_tag() {
        let repo = test_repo().await;
        let qcfg = queue_config();
        let queue = QueueService::new(&repo, &qcfg);
        let pcfg = proposal_config();
        let service = ProposalService::new(&repo, &queue, &pcfg);

        let err = service
            .create_proposal(CreateProposalRequest {
                title: "Random failure".to_string(),
                summary: "Something broke".to_string(),
                category: None,
                tags: vec!["unrelated".to_string()],
                task_create_request: task_request("MoonMind/moonmind-ci"),
                origin_source: OriginSource::Workflow,
                origin_id: Some("job-123".to_string()),
                origin_metadata: Some(json!({
                    "triggerRepo": "MoonMind/moonmind-ci",
                    "triggerJobId": "job-123",
                    "signal": {"severity": "low"}
                })),
                review_priority: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn promote_then_dismiss_is_rejected() {
        let repo = test_repo().await;
        let qcfg = queue_config();
        let queue = QueueService::new(&repo, &qcfg);
        let pcfg = proposal_config();
        let service = ProposalService::new(&repo, &queue, &pcfg);

        let proposal = service
            .create_proposal(CreateProposalRequest {
                title: "Improve docs".to_string(),
                summary: "The onboarding guide is stale".to_string(),
                category: Some("docs".to_string()),
                tags: vec![],
                task_create_request: task_request("Moon/Widgets"),
                origin_source: OriginSource::Manual,
                origin_id: None,
                origin_metadata: None,
                review_priority: None,
            })
            .await
            .unwrap();

        let (promoted, job) = service
            .promote_proposal(proposal.id, "user-1", None, None, None)
            .await
            .unwrap();
        assert_eq!(promoted.status, ProposalStatus::Promoted);
        assert_eq!(promoted.promoted_job_id, Some(job.id));

        let err = service.dismiss_proposal(proposal.id, "user-1").await.unwrap_err();
        assert!(matches!(err, Error::State { .. }));

        // Promoting again is idempotent.
        let (again, job_again) = service
            .promote_proposal(proposal.id, "user-1", None, None, None)
            .await
            .unwrap();
        assert_eq!(again.status, ProposalStatus::Promoted);
        assert_eq!(job_again.id, job.id);
    }

    #[tokio::test]
    async fn snooze_requires_future_timestamp() {
        let repo = test_repo().await;
        let qcfg = queue_config();
        let queue = QueueService::new(&repo, &qcfg);
        let pcfg = proposal_config();
        let service = ProposalService::new(&repo, &queue, &pcfg);

        let proposal = service
            .create_proposal(CreateProposalRequest {
                title: "Investigate slow build".to_string(),
                summary: "CI takes 20 minutes longer than last week".to_string(),
                category: None,
                tags: vec![],
                task_create_request: task_request("Moon/Widgets"),
                origin_source: OriginSource::Manual,
                origin_id: None,
                origin_metadata: None,
                review_priority: None,
            })
            .await
            .unwrap();

        let err = service
            .snooze_proposal(proposal.id, Utc::now() - chrono::Duration::seconds(5), "user-1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let until = Utc::now() + chrono::Duration::days(1);
        let snoozed = service.snooze_proposal(proposal.id, until, "user-1").await.unwrap();
        assert_eq!(snoozed.snoozed_until, Some(until));
        assert_eq!(snoozed.snooze_history.len(), 1);

        let unsnoozed = service.unsnooze_proposal(proposal.id, "user-1").await.unwrap();
        assert!(unsnoozed.snoozed_until.is_none());
        assert_eq!(unsnoozed.snooze_history.len(), 2);
    }

    #[tokio::test]
    async fn list_proposals_paginates_with_cursor() {
        let repo = test_repo().await;
        let qcfg = queue_config();
        let queue = QueueService::new(&repo, &qcfg);
        let pcfg = proposal_config();
        let service = ProposalService::new(&repo, &queue, &pcfg);

        for i in 0..3 {
            service
                .create_proposal(CreateProposalRequest {
                    title: format!("Proposal {i}"),
                    summary: "Summary text".to_string(),
                    category: None,
                    tags: vec![],
                    task_create_request: task_request("Moon/Widgets"),
                    origin_source: OriginSource::Manual,
                    origin_id: None,
                    origin_metadata: None,
                    review_priority: None,
                })
                .await
                .unwrap();
        }

        let (first_page, cursor) = service
            .list_proposals(None, None, None, None, None, 2, false, false)
            .await
            .unwrap();
        assert_eq!(first_page.len(), 2);
        let cursor = cursor.expect("a third row remains");

        let (second_page, next_cursor) = service
            .list_proposals(None, None, None, None, Some(&cursor), 2, false, false)
            .await
            .unwrap();
        assert_eq!(second_page.len(), 1);
        assert!(next_cursor.is_none());
    }

    #[test]
    fn normalize_tags_dedupes_case_insensitively() {
        let tags = vec!["Flaky".to_string(), "flaky".to_string(), "gap".to_string()];
        let normalized = normalize_tags(&tags).unwrap();
        assert_eq!(normalized, vec!["flaky".to_string(), "gap".to_string()]);
    }
}

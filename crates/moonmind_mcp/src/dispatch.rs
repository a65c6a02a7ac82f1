//! Dispatches a `{tool, arguments}` call to the matching queue verb (spec §6), mapping
//! `moonmind_core::error::Error` through `crate::rest::map_error` so the MCP error
//! envelope and the REST one never drift.
//!
//! Grounded on the shape of `casparian_mcp::server::handle_tools_call` (parse args,
//! call into the domain layer, map errors) narrowed to this crate's closed, fixed verb
//! set — a flat match replaces the teacher's dynamic `McpTool` trait registry since
//! there is no plugin surface left to abstract over.

use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde_json::Value;

use moonmind_core::ids::JobId;
use moonmind_core::job::{JobStatus, JobType};
use moonmind_db::Repository;
use moonmind_queue::{ArtifactStore, QueueService, QueueServiceConfig};

use crate::protocol::JsonRpcError;
use crate::rest::{invalid_arguments, map_error, tool_not_found};

pub struct DispatchContext<'a> {
    pub repo: &'a Repository,
    pub queue_config: &'a QueueServiceConfig,
    pub artifacts: &'a ArtifactStore,
}

fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T, JsonRpcError> {
    serde_json::from_value(arguments).map_err(|e| invalid_arguments(e.to_string()))
}

fn parse_job_id(raw: &str) -> Result<JobId, JsonRpcError> {
    JobId::from_str(raw).map_err(|e| invalid_arguments(format!("invalid jobId: {e}")))
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueArgs {
    #[serde(rename = "type")]
    job_type: String,
    #[serde(default)]
    priority: i32,
    payload: Value,
    #[serde(default)]
    affinity_key: Option<String>,
    #[serde(default = "default_max_attempts")]
    max_attempts: i32,
    #[serde(default)]
    created_by_user_id: Option<String>,
    #[serde(default)]
    requested_by_user_id: Option<String>,
}

fn default_max_attempts() -> i32 {
    5
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimArgs {
    worker_token: String,
    lease_seconds: i64,
    #[serde(default)]
    allowed_types: Option<Vec<String>>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatArgs {
    worker_token: String,
    job_id: String,
    lease_seconds: i64,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteArgs {
    worker_token: String,
    job_id: String,
    #[serde(default)]
    result_summary: Option<Value>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailArgs {
    worker_token: String,
    job_id: String,
    error_message: String,
    #[serde(default)]
    retryable: bool,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelArgs {
    job_id: String,
    #[serde(default)]
    requested_by_user_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetArgs {
    job_id: String,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListArgs {
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "type", default)]
    job_type: Option<String>,
    limit: i64,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadArtifactArgs {
    worker_token: String,
    job_id: String,
    name: String,
    content_base64: String,
    #[serde(default)]
    #[allow(dead_code)]
    content_type: Option<String>,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct ClaimResult {
    job: Option<moonmind_core::job::Job>,
}

#[derive(serde::Serialize)]
struct ListResult {
    items: Vec<moonmind_core::job::Job>,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadArtifactResult {
    path: String,
}

/// Dispatch one MCP tool call. `arguments` must already be a JSON object (it is
/// `serde_json::Value::Null` when the caller omits `arguments`, which fails every
/// verb's required-field deserialization with a clear `invalid_tool_arguments`).
pub async fn dispatch_tool_call(
    ctx: &DispatchContext<'_>,
    name: &str,
    arguments: Value,
) -> Result<Value, JsonRpcError> {
    let queue = QueueService::new(ctx.repo, ctx.queue_config);

    match name {
        "queue.enqueue" => {
            let args: EnqueueArgs = parse_args(arguments)?;
            let job_type = JobType::from_str(&args.job_type).map_err(|e| invalid_arguments(e.to_string()))?;
            let job = queue
                .create_job(
                    job_type,
                    args.payload,
                    args.priority,
                    args.created_by_user_id,
                    args.requested_by_user_id,
                    args.affinity_key,
                    args.max_attempts,
                )
                .await
                .map_err(|e| map_error(&e))?;
            serde_json::to_value(job).map_err(|e| invalid_arguments(e.to_string()))
        }
        "queue.claim" => {
            let args: ClaimArgs = parse_args(arguments)?;
            let policy = queue
                .resolve_worker_token(&args.worker_token)
                .await
                .map_err(|e| map_error(&e))?;
            let job = queue
                .claim_job(&policy, args.lease_seconds, args.allowed_types.as_deref())
                .await
                .map_err(|e| map_error(&e))?;
            serde_json::to_value(ClaimResult { job }).map_err(|e| invalid_arguments(e.to_string()))
        }
        "queue.heartbeat" => {
            let args: HeartbeatArgs = parse_args(arguments)?;
            let policy = queue
                .resolve_worker_token(&args.worker_token)
                .await
                .map_err(|e| map_error(&e))?;
            let job_id = parse_job_id(&args.job_id)?;
            let job = queue
                .heartbeat(&policy, job_id, args.lease_seconds)
                .await
                .map_err(|e| map_error(&e))?;
            serde_json::to_value(job).map_err(|e| invalid_arguments(e.to_string()))
        }
        "queue.complete" => {
            let args: CompleteArgs = parse_args(arguments)?;
            let policy = queue
                .resolve_worker_token(&args.worker_token)
                .await
                .map_err(|e| map_error(&e))?;
            let job_id = parse_job_id(&args.job_id)?;
            let job = queue
                .complete_job(&policy, job_id, args.result_summary)
                .await
                .map_err(|e| map_error(&e))?;
            serde_json::to_value(job).map_err(|e| invalid_arguments(e.to_string()))
        }
        "queue.fail" => {
            let args: FailArgs = parse_args(arguments)?;
            if args.error_message.trim().is_empty() {
                return Err(invalid_arguments("errorMessage must not be blank"));
            }
            let policy = queue
                .resolve_worker_token(&args.worker_token)
                .await
                .map_err(|e| map_error(&e))?;
            let job_id = parse_job_id(&args.job_id)?;
            let job = queue
                .fail_job(&policy, job_id, &args.error_message, args.retryable)
                .await
                .map_err(|e| map_error(&e))?;
            serde_json::to_value(job).map_err(|e| invalid_arguments(e.to_string()))
        }
        "queue.cancel" => {
            let args: CancelArgs = parse_args(arguments)?;
            let job_id = parse_job_id(&args.job_id)?;
            let job = queue
                .request_cancel(job_id, args.requested_by_user_id, args.reason)
                .await
                .map_err(|e| map_error(&e))?;
            serde_json::to_value(job).map_err(|e| invalid_arguments(e.to_string()))
        }
        "queue.get" => {
            let args: GetArgs = parse_args(arguments)?;
            let job_id = parse_job_id(&args.job_id)?;
            let job = queue.get_job(job_id).await.map_err(|e| map_error(&e))?;
            serde_json::to_value(job).map_err(|e| invalid_arguments(e.to_string()))
        }
        "queue.list" => {
            let args: ListArgs = parse_args(arguments)?;
            let status = args
                .status
                .as_deref()
                .map(JobStatus::from_str)
                .transpose()
                .map_err(|e| invalid_arguments(e.to_string()))?;
            let job_type = args
                .job_type
                .as_deref()
                .map(JobType::from_str)
                .transpose()
                .map_err(|e| invalid_arguments(e.to_string()))?;
            let items = queue
                .list_jobs(status, job_type, args.limit)
                .await
                .map_err(|e| map_error(&e))?;
            serde_json::to_value(ListResult { items }).map_err(|e| invalid_arguments(e.to_string()))
        }
        "queue.upload_artifact" => {
            let args: UploadArtifactArgs = parse_args(arguments)?;
            let policy = queue
                .resolve_worker_token(&args.worker_token)
                .await
                .map_err(|e| map_error(&e))?;
            let job_id = parse_job_id(&args.job_id)?;
            let bytes = {
                use base64::{engine::general_purpose, Engine as _};
                general_purpose::STANDARD
                    .decode(args.content_base64.as_bytes())
                    .map_err(|e| invalid_arguments(format!("invalid base64 content: {e}")))?
            };
            let path = ctx
                .artifacts
                .write_artifact(ctx.repo, job_id, &args.name, &bytes, Some(&policy.worker_id))
                .await
                .map_err(|e| map_error(&e))?;
            serde_json::to_value(UploadArtifactResult { path })
                .map_err(|e| invalid_arguments(e.to_string()))
        }
        other => Err(tool_not_found(other)),
    }
}

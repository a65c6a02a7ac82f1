//! End-to-end coverage of the 9 queue verbs through `dispatch_tool_call` (spec §6),
//! the MCP-layer counterpart to `moonmind_queue::service::tests`'s repository-level
//! coverage.

use serde_json::json;

use moonmind_mcp::dispatch::{dispatch_tool_call, DispatchContext};
use moonmind_queue::{ArtifactStore, QueueServiceConfig};
use moonmind_test_utils::{create_worker_token_fixture, sample_task_payload, test_repository};

fn queue_config() -> QueueServiceConfig {
    QueueServiceConfig {
        default_target_runtime: "codex".to_string(),
        default_publish_mode: "pr".to_string(),
        artifact_max_bytes: 1024 * 1024,
        allow_manifest_path_source: false,
        retry_backoff_base_seconds: 5,
        retry_backoff_max_seconds: 900,
    }
}

#[tokio::test]
async fn enqueue_claim_heartbeat_complete_round_trip() {
    let repo = test_repository().await;
    let config = queue_config();
    let artifact_dir = tempfile::tempdir().unwrap();
    let artifacts = ArtifactStore::new(artifact_dir.path(), config.artifact_max_bytes);
    let ctx = DispatchContext {
        repo: &repo,
        queue_config: &config,
        artifacts: &artifacts,
    };

    let token = create_worker_token_fixture(&repo, "worker-1", &[]).await;

    let enqueued = dispatch_tool_call(
        &ctx,
        "queue.enqueue",
        json!({"type": "task", "payload": sample_task_payload("octo/repo")}),
    )
    .await
    .unwrap();
    let job_id = enqueued["id"].as_str().unwrap().to_string();

    let claimed = dispatch_tool_call(
        &ctx,
        "queue.claim",
        json!({"workerToken": token, "leaseSeconds": 60}),
    )
    .await
    .unwrap();
    assert_eq!(claimed["job"]["id"].as_str().unwrap(), job_id);

    let beat = dispatch_tool_call(
        &ctx,
        "queue.heartbeat",
        json!({"workerToken": token, "jobId": job_id, "leaseSeconds": 90}),
    )
    .await
    .unwrap();
    assert_eq!(beat["status"].as_str().unwrap(), "running");

    let completed = dispatch_tool_call(
        &ctx,
        "queue.complete",
        json!({"workerToken": token, "jobId": job_id, "resultSummary": {"ok": true}}),
    )
    .await
    .unwrap();
    assert_eq!(completed["status"].as_str().unwrap(), "succeeded");

    let fetched = dispatch_tool_call(&ctx, "queue.get", json!({"jobId": job_id}))
        .await
        .unwrap();
    assert_eq!(fetched["status"].as_str().unwrap(), "succeeded");
}

#[tokio::test]
async fn unknown_tool_is_rejected() {
    let repo = test_repository().await;
    let config = queue_config();
    let artifact_dir = tempfile::tempdir().unwrap();
    let artifacts = ArtifactStore::new(artifact_dir.path(), config.artifact_max_bytes);
    let ctx = DispatchContext {
        repo: &repo,
        queue_config: &config,
        artifacts: &artifacts,
    };

    let err = dispatch_tool_call(&ctx, "queue.bogus", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.data.unwrap()["httpStatus"], 404);
}

#[tokio::test]
async fn missing_required_argument_is_invalid_not_internal() {
    let repo = test_repository().await;
    let config = queue_config();
    let artifact_dir = tempfile::tempdir().unwrap();
    let artifacts = ArtifactStore::new(artifact_dir.path(), config.artifact_max_bytes);
    let ctx = DispatchContext {
        repo: &repo,
        queue_config: &config,
        artifacts: &artifacts,
    };

    let err = dispatch_tool_call(&ctx, "queue.get", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.data.unwrap()["httpStatus"], 422);
}

#[tokio::test]
async fn get_on_unknown_job_maps_to_404() {
    let repo = test_repository().await;
    let config = queue_config();
    let artifact_dir = tempfile::tempdir().unwrap();
    let artifacts = ArtifactStore::new(artifact_dir.path(), config.artifact_max_bytes);
    let ctx = DispatchContext {
        repo: &repo,
        queue_config: &config,
        artifacts: &artifacts,
    };

    let err = dispatch_tool_call(
        &ctx,
        "queue.get",
        json!({"jobId": "00000000-0000-0000-0000-000000000000"}),
    )
    .await
    .unwrap_err();
    assert_eq!(err.data.unwrap()["httpStatus"], 404);
}

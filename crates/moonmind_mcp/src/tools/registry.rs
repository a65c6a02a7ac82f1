//! The fixed MCP tool surface (spec §6): the 9 queue verbs, each with a JSON Schema
//! for `tools/list` discovery. Grounded on the shape of `casparian_mcp::tools::registry`
//! (a static catalog of tool definitions) narrowed to this domain's closed verb set.

use serde_json::{json, Value};

use crate::protocol::ToolDefinition;

fn tool(name: &str, description: &str, input_schema: Value) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

/// All 9 queue verbs, in the order spec §6 lists them.
pub fn list_tools() -> Vec<ToolDefinition> {
    vec![
        tool(
            "queue.enqueue",
            "Create a new job (user-auth).",
            json!({
                "type": "object",
                "required": ["type", "payload"],
                "properties": {
                    "type": {"type": "string"},
                    "priority": {"type": "integer"},
                    "payload": {"type": "object"},
                    "affinityKey": {"type": "string"},
                    "maxAttempts": {"type": "integer"},
                    "createdByUserId": {"type": "string"},
                    "requestedByUserId": {"type": "string"}
                }
            }),
        ),
        tool(
            "queue.claim",
            "Claim the next eligible job for a worker (worker-auth).",
            json!({
                "type": "object",
                "required": ["workerToken", "leaseSeconds"],
                "properties": {
                    "workerToken": {"type": "string"},
                    "leaseSeconds": {"type": "integer", "minimum": 1},
                    "allowedTypes": {"type": "array", "items": {"type": "string"}}
                }
            }),
        ),
        tool(
            "queue.heartbeat",
            "Extend a running job's lease (worker-auth).",
            json!({
                "type": "object",
                "required": ["workerToken", "jobId", "leaseSeconds"],
                "properties": {
                    "workerToken": {"type": "string"},
                    "jobId": {"type": "string"},
                    "leaseSeconds": {"type": "integer", "minimum": 1}
                }
            }),
        ),
        tool(
            "queue.complete",
            "Mark a claimed job succeeded (worker-auth).",
            json!({
                "type": "object",
                "required": ["workerToken", "jobId"],
                "properties": {
                    "workerToken": {"type": "string"},
                    "jobId": {"type": "string"},
                    "resultSummary": {"type": "object"}
                }
            }),
        ),
        tool(
            "queue.fail",
            "Mark a claimed job failed, optionally retryable (worker-auth).",
            json!({
                "type": "object",
                "required": ["workerToken", "jobId", "errorMessage"],
                "properties": {
                    "workerToken": {"type": "string"},
                    "jobId": {"type": "string"},
                    "errorMessage": {"type": "string"},
                    "retryable": {"type": "boolean"}
                }
            }),
        ),
        tool(
            "queue.cancel",
            "Request cancellation of a job (user-auth).",
            json!({
                "type": "object",
                "required": ["jobId"],
                "properties": {
                    "jobId": {"type": "string"},
                    "requestedByUserId": {"type": "string"},
                    "reason": {"type": "string"}
                }
            }),
        ),
        tool(
            "queue.get",
            "Fetch a single job by id.",
            json!({
                "type": "object",
                "required": ["jobId"],
                "properties": {"jobId": {"type": "string"}}
            }),
        ),
        tool(
            "queue.list",
            "List jobs, optionally filtered by status/type.",
            json!({
                "type": "object",
                "required": ["limit"],
                "properties": {
                    "status": {"type": "string"},
                    "type": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1}
                }
            }),
        ),
        tool(
            "queue.upload_artifact",
            "Upload a job artifact (worker-auth, base64-encoded content).",
            json!({
                "type": "object",
                "required": ["workerToken", "jobId", "name", "contentBase64"],
                "properties": {
                    "workerToken": {"type": "string"},
                    "jobId": {"type": "string"},
                    "name": {"type": "string"},
                    "contentBase64": {"type": "string"},
                    "contentType": {"type": "string"}
                }
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_all_nine_queue_verbs() {
        let names: Vec<_> = list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec![
                "queue.enqueue",
                "queue.claim",
                "queue.heartbeat",
                "queue.complete",
                "queue.fail",
                "queue.cancel",
                "queue.get",
                "queue.list",
                "queue.upload_artifact",
            ]
        );
    }
}

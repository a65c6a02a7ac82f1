//! MCP server: JSON-RPC 2.0 over stdio, dispatching the 9 queue verbs (spec §6).
//!
//! Grounded on `casparian_mcp::server`'s shape (read a line, parse, dispatch, write a
//! line) but adapted from its synchronous thread-owned-Core design to a native async
//! loop: every queue verb here is an `sqlx` call, so there is no blocking executor
//! thread left to own — `tokio::io`'s async stdio takes the place of
//! `std::io::{stdin, stdout}` plus the Core message-passing channel.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use moonmind_db::Repository;
use moonmind_queue::{ArtifactStore, QueueServiceConfig};

use crate::dispatch::{dispatch_tool_call, DispatchContext};
use crate::protocol::{
    methods, ContentBlock, InitializeParams, InitializeResult, JsonRpcError, JsonRpcRequest,
    JsonRpcResponse, ServerCapabilities, ServerInfo, ToolCallParams, ToolCallResult,
    ToolsCapability, ToolsListResult, JSONRPC_VERSION, MCP_PROTOCOL_VERSION,
};
use crate::rest::tool_not_found;

#[derive(Debug, Clone)]
pub struct McpServerConfig {
    pub server_name: String,
    pub server_version: String,
    /// Maximum serialized tool result size before the response is flagged truncated.
    pub max_response_bytes: usize,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            server_name: "moonmind-mcp".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            max_response_bytes: 1024 * 1024,
        }
    }
}

pub struct McpServer {
    config: McpServerConfig,
    repo: Repository,
    queue_config: QueueServiceConfig,
    artifacts: ArtifactStore,
    initialized: bool,
}

impl McpServer {
    pub fn new(
        config: McpServerConfig,
        repo: Repository,
        queue_config: QueueServiceConfig,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            config,
            repo,
            queue_config,
            artifacts,
            initialized: false,
        }
    }

    /// Run the server: read newline-delimited JSON-RPC requests from stdin, write
    /// responses to stdout, until stdin closes.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut lines = BufReader::new(stdin).lines();

        info!("MCP server starting");

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            debug!("received: {}", line);

            let request: JsonRpcRequest = match serde_json::from_str(&line) {
                Ok(req) => req,
                Err(e) => {
                    let response = JsonRpcResponse::error(
                        None,
                        JsonRpcError::new(
                            crate::protocol::ErrorCode::ParseError,
                            format!("invalid JSON: {e}"),
                        ),
                    );
                    write_response(&mut stdout, &response).await?;
                    continue;
                }
            };

            let response = self.handle_request(request).await;
            if response.id.is_none() && response.result.is_none() && response.error.is_none() {
                continue;
            }
            write_response(&mut stdout, &response).await?;
        }

        info!("MCP server shutting down");
        Ok(())
    }

    async fn handle_request(&mut self, request: JsonRpcRequest) -> JsonRpcResponse {
        if request.jsonrpc != JSONRPC_VERSION {
            return JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(
                    crate::protocol::ErrorCode::InvalidRequest,
                    format!("invalid JSON-RPC version: {}", request.jsonrpc),
                ),
            );
        }

        match request.method.as_str() {
            methods::INITIALIZE => self.handle_initialize(request),
            methods::INITIALIZED => {
                if request.id.is_none() {
                    return JsonRpcResponse {
                        jsonrpc: JSONRPC_VERSION.to_string(),
                        id: None,
                        result: None,
                        error: None,
                    };
                }
                JsonRpcResponse::success(request.id, serde_json::Value::Null)
            }
            methods::TOOLS_LIST => self.handle_tools_list(request),
            methods::TOOLS_CALL => self.handle_tools_call(request).await,
            methods::PING => JsonRpcResponse::success(request.id, serde_json::json!({})),
            _ => JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(
                    crate::protocol::ErrorCode::MethodNotFound,
                    format!("unknown method: {}", request.method),
                ),
            ),
        }
    }

    fn handle_initialize(&mut self, request: JsonRpcRequest) -> JsonRpcResponse {
        let params: InitializeParams = match request.params {
            Some(p) => match serde_json::from_value(p) {
                Ok(params) => params,
                Err(e) => {
                    return JsonRpcResponse::error(
                        request.id,
                        JsonRpcError::new(
                            crate::protocol::ErrorCode::InvalidParams,
                            format!("invalid initialize params: {e}"),
                        ),
                    );
                }
            },
            None => {
                return JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::new(
                        crate::protocol::ErrorCode::InvalidParams,
                        "missing initialize params",
                    ),
                );
            }
        };

        info!(
            "initialize from {} v{} (protocol {})",
            params.client_info.name, params.client_info.version, params.protocol_version
        );
        self.initialized = true;

        let result = InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: false }),
                resources: None,
                prompts: None,
                logging: None,
            },
            server_info: ServerInfo {
                name: self.config.server_name.clone(),
                version: self.config.server_version.clone(),
            },
        };
        JsonRpcResponse::success(request.id, serde_json::to_value(result).unwrap())
    }

    fn handle_tools_list(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let result = ToolsListResult {
            tools: crate::tools::list_tools(),
        };
        JsonRpcResponse::success(request.id, serde_json::to_value(result).unwrap())
    }

    async fn handle_tools_call(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        if !self.initialized {
            return JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(
                    crate::protocol::ErrorCode::ServerError(-32002),
                    "server not initialized",
                ),
            );
        }

        let params: ToolCallParams = match request.params {
            Some(p) => match serde_json::from_value(p) {
                Ok(params) => params,
                Err(e) => {
                    return JsonRpcResponse::error(
                        request.id,
                        JsonRpcError::new(
                            crate::protocol::ErrorCode::InvalidParams,
                            format!("invalid tool call params: {e}"),
                        ),
                    );
                }
            },
            None => {
                return JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::new(crate::protocol::ErrorCode::InvalidParams, "missing tool call params"),
                );
            }
        };

        info!("tool call: {}", params.name);

        if !crate::tools::list_tools().iter().any(|t| t.name == params.name) {
            let err = tool_not_found(&params.name);
            return JsonRpcResponse::error(request.id, err);
        }

        let ctx = DispatchContext {
            repo: &self.repo,
            queue_config: &self.queue_config,
            artifacts: &self.artifacts,
        };

        match dispatch_tool_call(&ctx, &params.name, params.arguments).await {
            Ok(value) => {
                let json = serde_json::to_string(&value).unwrap_or_else(|e| {
                    error!("failed to serialize tool result: {e}");
                    "{}".to_string()
                });
                let (content, was_truncated) = if json.len() > self.config.max_response_bytes {
                    warn!(
                        "response truncated from {} to {} bytes",
                        json.len(),
                        self.config.max_response_bytes
                    );
                    let truncated = serde_json::json!({
                        "truncated": true,
                        "maxBytes": self.config.max_response_bytes,
                        "originalBytes": json.len(),
                    });
                    (serde_json::to_string(&truncated).unwrap(), true)
                } else {
                    (json, false)
                };
                let tool_result = ToolCallResult {
                    content: vec![ContentBlock::text(content)],
                    is_error: was_truncated,
                };
                JsonRpcResponse::success(request.id, serde_json::to_value(tool_result).unwrap())
            }
            Err(err) => JsonRpcResponse::error(request.id, err),
        }
    }
}

async fn write_response<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    response: &JsonRpcResponse,
) -> anyhow::Result<()> {
    let json = serde_json::to_string(response)?;
    debug!("sending: {}", json);
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_matches_server_name() {
        let config = McpServerConfig::default();
        assert_eq!(config.server_name, "moonmind-mcp");
        assert_eq!(config.max_response_bytes, 1024 * 1024);
    }
}

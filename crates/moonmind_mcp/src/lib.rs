//! MCP JSON-RPC tool registry for the queue core (spec §6, §7).
//!
//! Exposes the 9 queue verbs (`queue.enqueue`, `queue.claim`, `queue.heartbeat`,
//! `queue.complete`, `queue.fail`, `queue.cancel`, `queue.get`, `queue.list`,
//! `queue.upload_artifact`) as MCP tools over JSON-RPC 2.0/stdio, with schema-validated
//! arguments and a REST-equivalent error envelope shared between this transport and
//! the (thinly reimplemented elsewhere) REST adapter.

pub mod dispatch;
pub mod protocol;
pub mod rest;
pub mod server;
pub mod tools;

pub use dispatch::{dispatch_tool_call, DispatchContext};
pub use protocol::{ErrorCode, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use server::{McpServer, McpServerConfig};

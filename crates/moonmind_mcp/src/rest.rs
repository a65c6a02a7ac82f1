//! Single error-envelope mapping shared by the MCP dispatcher and the (out-of-scope,
//! thinly reimplemented elsewhere) REST adapter — spec §7: "The REST mapping is a
//! single function from this sum to `{http_status, code, message}`; the MCP dispatcher
//! reuses it."

use moonmind_core::error::Error;
use serde_json::{json, Value};

use crate::protocol::{ErrorCode, JsonRpcError};

/// REST-equivalent `{detail:{code, message}}` body, independent of transport.
pub fn error_envelope(err: &Error) -> Value {
    json!({
        "detail": {
            "code": err.code(),
            "message": err.to_string(),
        }
    })
}

/// Map a domain error onto a JSON-RPC error object. The JSON-RPC `code` carries the
/// generic RPC classification (method/params/application); the REST-equivalent
/// `{httpStatus, code, message}` triple rides along in `data` so callers that care
/// about the normative status codes (spec §6) can still read them off the wire.
pub fn map_error(err: &Error) -> JsonRpcError {
    JsonRpcError::with_data(
        ErrorCode::ServerError(-32000),
        err.to_string(),
        json!({
            "httpStatus": err.http_status(),
            "code": err.code(),
            "message": err.to_string(),
        }),
    )
}

/// Unknown tool name (spec §6: "Unknown tool ⇒ 404").
pub fn tool_not_found(name: &str) -> JsonRpcError {
    JsonRpcError::with_data(
        ErrorCode::MethodNotFound,
        format!("unknown tool: {name}"),
        json!({"httpStatus": 404u16, "code": "tool_not_found", "message": format!("unknown tool: {name}")}),
    )
}

/// Argument schema/shape violation (spec §6: "invalid args ⇒ 422").
pub fn invalid_arguments(message: impl Into<String>) -> JsonRpcError {
    let message = message.into();
    JsonRpcError::with_data(
        ErrorCode::InvalidParams,
        message.clone(),
        json!({"httpStatus": 422u16, "code": "invalid_tool_arguments", "message": message}),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_not_found_to_404_in_data() {
        let err = Error::not_found("job_not_found", "job 123 not found");
        let mapped = map_error(&err);
        assert_eq!(mapped.data.unwrap()["httpStatus"], 404);
    }

    #[test]
    fn tool_not_found_uses_method_not_found_rpc_code() {
        let err = tool_not_found("queue.bogus");
        assert_eq!(err.code, ErrorCode::MethodNotFound.as_i32());
    }
}

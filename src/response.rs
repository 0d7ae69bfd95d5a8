use rmcp::model::{CallToolResult, Content};
use serde::Serialize;

use crate::error::GaleError;

/// Uniform tool response envelope. All tools return `Content::text` holding
/// this JSON, so clients parse one shape everywhere.
#[derive(Debug, Serialize)]
pub struct ToolResponse {
    pub status: &'static str,
    pub content: String,
    pub content_type: &'static str,
    pub metadata: ToolMetadata,
}

#[derive(Debug, Serialize)]
pub struct ToolMetadata {
    pub tool_name: String,
    pub duration_seconds: f64,
    /// Error classification (`invalid_argument`, `process_not_found`, …);
    /// absent on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl ToolResponse {
    pub fn success(content: String, tool_name: &str, duration_seconds: f64) -> Self {
        Self {
            status: "success",
            content,
            content_type: "text",
            metadata: ToolMetadata {
                tool_name: tool_name.to_string(),
                duration_seconds,
                error_kind: None,
            },
        }
    }

    pub fn error(err: &GaleError, tool_name: &str, duration_seconds: f64) -> Self {
        Self {
            status: "error",
            content: err.user_message(),
            content_type: "text",
            metadata: ToolMetadata {
                tool_name: tool_name.to_string(),
                duration_seconds,
                error_kind: Some(err.kind().to_string()),
            },
        }
    }

    /// Error envelope with a caller-provided body, for errors that carry
    /// payload (a timed-out execute still returns its partial output).
    pub fn error_with_content(
        err: &GaleError,
        content: String,
        tool_name: &str,
        duration_seconds: f64,
    ) -> Self {
        Self {
            status: "error",
            content,
            content_type: "text",
            metadata: ToolMetadata {
                tool_name: tool_name.to_string(),
                duration_seconds,
                error_kind: Some(err.kind().to_string()),
            },
        }
    }

    /// Convert to an MCP CallToolResult. Always success at the transport
    /// level; the error classification travels inside the JSON payload where
    /// the client can read it without a protocol failure.
    pub fn into_call_tool_result(mut self) -> CallToolResult {
        if !self.metadata.duration_seconds.is_finite() {
            self.metadata.duration_seconds = 0.0;
        }
        match serde_json::to_string(&self) {
            Ok(json) => CallToolResult::success(vec![Content::text(json)]),
            Err(e) => CallToolResult::success(vec![Content::text(format!(
                r#"{{"status":"error","content":"serialization failed: {e}","content_type":"text","metadata":{{}}}}"#
            ))]),
        }
    }
}

//! MCP protocol types and message definitions.
//!
//! Based on the Model Context Protocol specification, revision 2025-03-26
//! (the first revision with the streamable HTTP transport).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use crate::mcp::progress::ProgressToken;

/// JSON-RPC version.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol version.
pub const MCP_VERSION: &str = "2025-03-26";

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.to_string()
}

/// Keeps an explicit `null` as `Some(Value::Null)` so presence can be checked.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

// ===== JSON-RPC Base Types =====

/// A JSON-RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC response.
///
/// Exactly one of `result` and `error` is set. `id` is `None` (serialized as
/// `null`) only when the failing frame carried no readable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// A successful response.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// An error response.
    pub fn failure(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_some()
    }
}

/// A JSON-RPC notification (no id, no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Request ID (can be string or number).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// A message that can be sent or received.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl Message {
    /// The request id this message is correlated with, if any.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(req) => Some(&req.id),
            Self::Response(resp) => resp.id.as_ref(),
            Self::Notification(_) => None,
        }
    }
}

// ===== MCP-Specific Types =====

/// Server capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
}

/// Tools capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    #[serde(default)]
    pub list_changed: bool,
}

/// Server info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Initialize result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
}

/// Tool definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Tool call result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
}

/// Content block in a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

/// List tools result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
}

/// Request metadata carried in `params._meta`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_token: Option<ProgressToken>,
}

/// Call tool params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RequestMeta>,
}

/// Params of `notifications/cancelled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ===== Method Names =====

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const NOTIFY_INITIALIZED: &str = "notifications/initialized";
    pub const NOTIFY_CANCELLED: &str = "notifications/cancelled";
    pub const NOTIFY_PROGRESS: &str = "notifications/progress";
}

// ===== Error Codes =====

/// JSON-RPC error codes, standard and server-defined.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    /// Generic failure inside a tool handler.
    pub const HANDLER_ERROR: i32 = -32000;
    pub const SESSION_CLOSED: i32 = -32001;
    pub const TOOL_NOT_FOUND: i32 = -32002;
    pub const REQUEST_CANCELLED: i32 = -32800;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_jsonrpc_request_serialization() {
        let request = JsonRpcRequest::new(1, "tools/call", Some(json!({"name": "add"})));

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"tools/call\""));

        let parsed: JsonRpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_request_without_jsonrpc_field() {
        let parsed: JsonRpcRequest =
            serde_json::from_str(r#"{"id":1,"method":"add","params":{"a":2,"b":3}}"#).unwrap();
        assert_eq!(parsed.jsonrpc, JSONRPC_VERSION);
        assert_eq!(parsed.id, RequestId::Number(1));
    }

    #[test]
    fn test_jsonrpc_response_success() {
        let response = JsonRpcResponse::success(RequestId::Number(1), json!({"ok": true}));

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"result\""));
        assert!(!json.contains("\"error\""));
        assert!(response.is_success());
    }

    #[test]
    fn test_jsonrpc_response_error() {
        let response = JsonRpcResponse::failure(
            Some(RequestId::String("abc".to_string())),
            JsonRpcError {
                code: error_codes::TOOL_NOT_FOUND,
                message: "Tool not found: foo".to_string(),
                data: None,
            },
        );

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"error\""));
        assert!(json.contains("-32002"));
        assert!(!response.is_success());
    }

    #[test]
    fn test_null_result_is_present() {
        let parsed: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":null}"#).unwrap();
        assert_eq!(parsed.result, Some(Value::Null));
        assert!(parsed.error.is_none());
    }

    #[test]
    fn test_response_without_id_serializes_null() {
        let response = JsonRpcResponse::failure(
            None,
            JsonRpcError {
                code: error_codes::PARSE_ERROR,
                message: "bad".to_string(),
                data: None,
            },
        );
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"id\":null"));
    }

    #[test]
    fn test_request_id_variants() {
        let id_num = RequestId::Number(42);
        let id_str = RequestId::String("request-1".to_string());

        assert_eq!(serde_json::to_string(&id_num).unwrap(), "42");
        assert_eq!(serde_json::to_string(&id_str).unwrap(), "\"request-1\"");
        assert_eq!(id_num.to_string(), "42");
        assert_eq!(id_str.to_string(), "request-1");
    }

    #[test]
    fn test_tool_definition() {
        let tool = Tool {
            name: "add".to_string(),
            description: "add two numbers".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "a": { "type": "number" } }
            }),
        };

        let json = serde_json::to_string(&tool).unwrap();
        assert!(json.contains("\"name\":\"add\""));
        assert!(json.contains("\"inputSchema\""));
    }

    #[test]
    fn test_content_block_variants() {
        let text = ContentBlock::Text {
            text: "Hello".to_string(),
        };
        let image = ContentBlock::Image {
            data: "base64data".to_string(),
            mime_type: "image/png".to_string(),
        };

        let text_json = serde_json::to_string(&text).unwrap();
        assert_eq!(text_json, r#"{"type":"text","text":"Hello"}"#);

        let image_json = serde_json::to_string(&image).unwrap();
        assert!(image_json.contains("\"type\":\"image\""));
        assert!(image_json.contains("\"mimeType\":\"image/png\""));
    }

    #[test]
    fn test_initialize_result() {
        let result = InitializeResult {
            protocol_version: MCP_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: false }),
            },
            server_info: ServerInfo {
                name: "calculator".to_string(),
                version: "1.0.0".to_string(),
            },
        };

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"protocolVersion\""));
        assert!(json.contains("\"serverInfo\""));
        assert!(json.contains("\"listChanged\":false"));
    }

    #[test]
    fn test_call_tool_params_with_meta() {
        let params: CallToolParams = serde_json::from_value(json!({
            "name": "sum",
            "arguments": { "numbers": [1, 2] },
            "_meta": { "progressToken": "p-1" }
        }))
        .unwrap();

        assert_eq!(params.name, "sum");
        assert!(params.arguments.is_some());
        assert_eq!(
            params.meta.and_then(|m| m.progress_token),
            Some(ProgressToken::String("p-1".to_string()))
        );
    }

    #[test]
    fn test_cancelled_params() {
        let params: CancelledParams =
            serde_json::from_value(json!({"requestId": 7, "reason": "user"})).unwrap();
        assert_eq!(params.request_id, RequestId::Number(7));
        assert_eq!(params.reason.as_deref(), Some("user"));
    }

    #[test]
    fn test_jsonrpc_notification() {
        let notification = JsonRpcNotification::new(methods::NOTIFY_INITIALIZED, None);

        let json = serde_json::to_string(&notification).unwrap();
        assert!(!json.contains("\"id\""));
        assert!(json.contains("\"method\""));
    }

    #[test]
    fn test_message_request_id() {
        let req = Message::Request(JsonRpcRequest::new(5, "ping", None));
        let note = Message::Notification(JsonRpcNotification::new("x", None));
        assert_eq!(req.request_id(), Some(&RequestId::Number(5)));
        assert!(note.request_id().is_none());
    }
}

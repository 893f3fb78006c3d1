//! Error types for the streamable MCP server.

use thiserror::Error;

use crate::mcp::protocol::{error_codes, JsonRpcError};

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the server.
#[derive(Error, Debug)]
pub enum Error {
    // ===== Wire Errors =====
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error("Frame too large: exceeds maximum of {max} bytes")]
    FrameTooLarge { max: usize },

    // ===== Dispatch Errors =====
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("{message}")]
    Handler { code: i32, message: String },

    #[error("Duplicate request id: {0}")]
    DuplicateRequestId(String),

    #[error("Cancelled: request was cancelled")]
    Cancelled,

    #[error("Timeout: request exceeded its deadline of {millis} ms")]
    Timeout { millis: u64 },

    // ===== Session Errors =====
    #[error("Session closed")]
    SessionClosed,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Server is shutting down")]
    ShuttingDown,

    // ===== Registration Errors =====
    #[error("Duplicate tool: {0}")]
    DuplicateTool(String),

    // ===== I/O Errors =====
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP server error: {0}")]
    HttpServer(String),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a domain error raised by a tool handler.
    pub fn handler(code: i32, message: impl Into<String>) -> Self {
        Self::Handler {
            code,
            message: message.into(),
        }
    }

    /// Error used when a handler faults without producing its own error.
    pub fn handler_fault(message: impl Into<String>) -> Self {
        Self::handler(error_codes::HANDLER_ERROR, message)
    }

    /// The JSON-RPC error code reported to the client.
    pub fn code(&self) -> i32 {
        match self {
            Self::Decode(_) | Self::FrameTooLarge { .. } => error_codes::PARSE_ERROR,
            Self::SchemaViolation(_) | Self::DuplicateRequestId(_) => error_codes::INVALID_REQUEST,
            Self::InvalidParams(_) => error_codes::INVALID_PARAMS,
            Self::ToolNotFound(_) => error_codes::TOOL_NOT_FOUND,
            Self::Handler { code, .. } => *code,
            Self::Cancelled | Self::Timeout { .. } => error_codes::REQUEST_CANCELLED,
            Self::SessionClosed | Self::SessionNotFound(_) | Self::ShuttingDown => {
                error_codes::SESSION_CLOSED
            }
            _ => error_codes::INTERNAL_ERROR,
        }
    }

    /// Convert into the error object carried by a response envelope.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        JsonRpcError {
            code: self.code(),
            message: self.to_string(),
            data: None,
        }
    }

    /// Whether the error leaves the byte stream in an unknown state.
    pub fn is_fatal_to_stream(&self) -> bool {
        matches!(self, Self::FrameTooLarge { .. } | Self::Io(_))
    }
}

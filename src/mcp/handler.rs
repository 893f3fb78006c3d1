//! Tool handlers and the tool registry.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::mcp::progress::ProgressReporter;
use crate::mcp::protocol::{ContentBlock, JsonRpcNotification, Message, RequestId, Tool, ToolResult};
use crate::mcp::session::Session;

/// Handler for MCP tool calls.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Get the tool definition.
    fn definition(&self) -> Tool;

    /// Execute the tool with arguments that already passed schema validation.
    async fn execute(&self, ctx: ToolContext, arguments: Value) -> Result<ToolResult>;
}

/// Per-invocation context handed to a tool handler.
#[derive(Clone)]
pub struct ToolContext {
    session: Arc<Session>,
    request_id: RequestId,
    cancel: CancellationToken,
    progress: ProgressReporter,
}

impl ToolContext {
    pub fn new(
        session: Arc<Session>,
        request_id: RequestId,
        cancel: CancellationToken,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            session,
            request_id,
            cancel,
            progress,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the request is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Fails with [`Error::Cancelled`] once the request is cancelled.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Send a notification on this request's stream.
    pub async fn notify(&self, method: impl Into<String>, params: Option<Value>) -> Result<()> {
        self.checkpoint()?;
        self.session
            .sink(Some(self.request_id.clone()))
            .send(Message::Notification(JsonRpcNotification::new(method, params)))
            .await
    }
}

/// A registered tool: its definition plus the handler capability.
pub struct ToolDescriptor {
    definition: Tool,
    handler: Arc<dyn ToolHandler>,
}

impl ToolDescriptor {
    pub fn definition(&self) -> &Tool {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub async fn invoke(&self, ctx: ToolContext, arguments: Value) -> Result<ToolResult> {
        self.handler.execute(ctx, arguments).await
    }
}

/// Registry of tool handlers.
///
/// Populated at startup, then moved into the server where it is only read.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolDescriptor>>,
}

impl ToolRegistry {
    /// Create a new, empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool handler.
    pub fn register<T: ToolHandler + 'static>(&mut self, handler: T) -> Result<()> {
        self.register_arc(Arc::new(handler))
    }

    /// Register a tool handler (Arc version).
    pub fn register_arc(&mut self, handler: Arc<dyn ToolHandler>) -> Result<()> {
        let definition = handler.definition();
        if self.tools.contains_key(&definition.name) {
            return Err(Error::DuplicateTool(definition.name));
        }
        self.tools.insert(
            definition.name.clone(),
            Arc::new(ToolDescriptor {
                definition,
                handler,
            }),
        );
        Ok(())
    }

    /// Look up a tool by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<ToolDescriptor>> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))
    }

    /// All tool definitions, sorted by name.
    pub fn list(&self) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self
            .tools
            .values()
            .map(|d| d.definition.clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Check if a tool exists.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Get the number of registered tools.
    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper to create a text content block.
pub fn text_content(text: impl Into<String>) -> ContentBlock {
    ContentBlock::Text { text: text.into() }
}

/// Helper to create a successful tool result.
pub fn success_result(text: impl Into<String>) -> ToolResult {
    ToolResult {
        content: vec![text_content(text)],
    }
}

/// Decode validated arguments into the tool's argument type.
pub fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T> {
    serde_json::from_value(arguments).map_err(|e| Error::InvalidParams(e.to_string()))
}

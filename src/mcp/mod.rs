//! Model Context Protocol (MCP) implementation.
//!
//! # Architecture
//!
//! - `protocol` - JSON-RPC envelopes and MCP message types
//! - `codec` - Envelope classification and newline framing
//! - `schema` - Tool input schemas and argument validation
//! - `handler` - Tool handlers and the tool registry
//! - `session` - Per-connection queues and in-flight requests
//! - `progress` - Progress notifications from running tools
//! - `dispatcher` - Routes requests to tools
//! - `transport` - Line-delimited byte stream transport (stdio)
//! - `server` - Session ownership and lifecycle

pub mod codec;
pub mod dispatcher;
pub mod handler;
pub mod progress;
pub mod protocol;
pub mod schema;
pub mod server;
pub mod session;
pub mod transport;

pub use handler::{ToolContext, ToolHandler, ToolRegistry};
pub use protocol::*;
pub use server::McpServer;
pub use session::Session;
pub use transport::{LineTransport, Transport};

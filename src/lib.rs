//! Streamable MCP tool server.
//!
//! A Model Context Protocol server exposing typed tools over JSON-RPC, with
//! per-session ordering, concurrent dispatch, cooperative cancellation and
//! progress streaming. Sessions are served over stdio or streamable HTTP.
//!
//! # Architecture
//!
//! 1. **MCP Layer** (`mcp`) - Codec, sessions, dispatcher, transports, server
//! 2. **HTTP Layer** (`http`) - `/mcp` endpoint with SSE streaming
//! 3. **Tools Layer** (`tools`) - Calculator and greeting tools
//! 4. **Ambient** (`config`, `error`, `metrics`)

pub mod config;
pub mod error;
pub mod http;
pub mod mcp;
pub mod metrics;
pub mod tools;

pub use error::{Error, Result};

/// Server version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name reported in `initialize`.
pub const SERVER_NAME: &str = "calculator";

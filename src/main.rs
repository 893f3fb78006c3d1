//! Streamable MCP calculator server.
//!
//! Serves the greeting and arithmetic tools over streamable HTTP (default) or
//! over stdio.

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use streamable_mcp::config::{Args, Config, LogFormat, Transport};
use streamable_mcp::error::{Error, Result};
use streamable_mcp::mcp::handler::ToolRegistry;
use streamable_mcp::mcp::server::McpServer;
use streamable_mcp::mcp::transport::LineTransport;
use streamable_mcp::tools;
use streamable_mcp::{SERVER_NAME, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::load(args)?;

    init_tracing(&config)?;

    info!("{} MCP server v{}", SERVER_NAME, VERSION);
    info!("Transport: {:?}", config.transport);

    let mut registry = ToolRegistry::new();
    tools::register_all_tools(&mut registry)?;
    let tool_names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();

    let server = Arc::new(McpServer::new(registry, &config));

    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            stopper.stop().await;
        }
    });

    match config.transport {
        Transport::Stdio => {
            info!("Available tools: {}", tool_names.join(", "));
            let transport = LineTransport::stdio(config.max_frame_bytes);
            if let Err(e) = server.serve_transport(transport).await {
                error!("Stdio session ended with error: {}", e);
            }
            server.stop().await;
        }
        Transport::Http => {
            let listener = server.bind(config.listen).await?;
            let addr = listener.local_addr()?;
            info!("Starting MCP {} server on {}", SERVER_NAME, addr);
            info!("Connect to http://localhost:{}/mcp", addr.port());
            info!("Available tools: {}", tool_names.join(", "));
            Arc::clone(&server).serve(listener).await?;
            server.stop().await;
        }
    }

    info!("Server stopped");
    Ok(())
}

/// Install the global subscriber on stderr; stdout belongs to the stdio transport.
fn init_tracing(config: &Config) -> Result<()> {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = match config.log_format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))
}

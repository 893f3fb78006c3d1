//! Configuration management for the streamable MCP server.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::mcp::dispatcher::DispatchConfig;
use crate::mcp::session::SessionLimits;

/// Command-line arguments for the server.
#[derive(Parser, Debug, Clone)]
#[command(name = "streamable-mcp")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Streaming MCP tool server with cancellation, progress and streamable HTTP")]
pub struct Args {
    /// YAML configuration file (replaces the flags below when present)
    #[arg(short, long, env = "STREAMABLE_MCP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Transport mode: http or stdio
    #[arg(short, long, default_value = "http", env = "STREAMABLE_MCP_TRANSPORT")]
    pub transport: Transport,

    /// Listen address (only for http transport)
    #[arg(short, long, default_value = "0.0.0.0:8080", env = "STREAMABLE_MCP_LISTEN")]
    pub listen: SocketAddr,

    /// Enable debug logging
    #[arg(short, long, env = "STREAMABLE_MCP_DEBUG")]
    pub debug: bool,

    /// Log output format
    #[arg(long, default_value = "text", env = "STREAMABLE_MCP_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Capacity of each session's inbound queue
    #[arg(long, default_value = "64", env = "STREAMABLE_MCP_INBOUND_QUEUE")]
    pub inbound_queue: usize,

    /// Capacity of each session's outbound queue
    #[arg(long, default_value = "64", env = "STREAMABLE_MCP_OUTBOUND_QUEUE")]
    pub outbound_queue: usize,

    /// Buffered events per HTTP stream
    #[arg(long, default_value = "32", env = "STREAMABLE_MCP_STREAM_BUFFER")]
    pub stream_buffer: usize,

    /// Requests executing concurrently per session
    #[arg(long, default_value = "32", env = "STREAMABLE_MCP_MAX_IN_FLIGHT")]
    pub max_in_flight: usize,

    /// Per-request deadline in milliseconds
    #[arg(long, env = "STREAMABLE_MCP_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: Option<u64>,

    /// Close HTTP sessions idle for this many seconds
    #[arg(long, env = "STREAMABLE_MCP_SESSION_IDLE_TIMEOUT_SECS")]
    pub session_idle_timeout_secs: Option<u64>,

    /// Maximum size of one frame or request body (bytes)
    #[arg(long, default_value = "1048576", env = "STREAMABLE_MCP_MAX_FRAME_BYTES")]
    pub max_frame_bytes: usize,

    /// Expose Prometheus metrics on /metrics
    #[arg(long, env = "STREAMABLE_MCP_METRICS")]
    pub metrics: bool,
}

/// Transport mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Http,
    Stdio,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transport mode
    pub transport: Transport,
    /// HTTP listen address
    pub listen: SocketAddr,
    /// Debug mode
    pub debug: bool,
    /// Log format
    pub log_format: LogFormat,
    /// Inbound queue capacity per session
    pub inbound_queue: usize,
    /// Outbound queue capacity per session
    pub outbound_queue: usize,
    /// Buffered events per HTTP stream
    pub stream_buffer: usize,
    /// Concurrent requests per session
    pub max_in_flight: usize,
    /// Per-request deadline
    pub request_timeout_ms: Option<u64>,
    /// Idle session expiry
    pub session_idle_timeout_secs: Option<u64>,
    /// Maximum frame size
    pub max_frame_bytes: usize,
    /// Metrics enabled
    pub metrics: bool,
}

impl Config {
    /// Build the configuration from arguments, reading a YAML file when one
    /// is given or exists at the default location.
    pub fn load(args: Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => Some(path.clone()),
            None => Self::default_path().filter(|p| p.is_file()),
        };

        let config = match file {
            Some(path) => {
                debug!("Loading configuration from {:?}", path);
                let mut config = Self::from_file(&path)?;
                config.debug |= args.debug;
                config
            }
            None => Self::from(args),
        };
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML configuration file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&text)?;
        Ok(config)
    }

    /// `<config dir>/streamable-mcp/config.yaml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("streamable-mcp").join("config.yaml"))
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let capacities = [
            ("inbound_queue", self.inbound_queue),
            ("outbound_queue", self.outbound_queue),
            ("stream_buffer", self.stream_buffer),
            ("max_in_flight", self.max_in_flight),
            ("max_frame_bytes", self.max_frame_bytes),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.request_timeout_ms == Some(0) {
            return Err(Error::Config(
                "request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.session_idle_timeout_secs == Some(0) {
            return Err(Error::Config(
                "session_idle_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            inbound_capacity: self.inbound_queue,
            outbound_capacity: self.outbound_queue,
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            max_in_flight: self.max_in_flight,
            request_timeout: self.request_timeout(),
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn session_idle_timeout(&self) -> Option<Duration> {
        self.session_idle_timeout_secs.map(Duration::from_secs)
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            transport: args.transport,
            listen: args.listen,
            debug: args.debug,
            log_format: args.log_format,
            inbound_queue: args.inbound_queue,
            outbound_queue: args.outbound_queue,
            stream_buffer: args.stream_buffer,
            max_in_flight: args.max_in_flight,
            request_timeout_ms: args.request_timeout_ms,
            session_idle_timeout_secs: args.session_idle_timeout_secs,
            max_frame_bytes: args.max_frame_bytes,
            metrics: args.metrics,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: Transport::Http,
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            debug: false,
            log_format: LogFormat::Text,
            inbound_queue: 64,
            outbound_queue: 64,
            stream_buffer: 32,
            max_in_flight: 32,
            request_timeout_ms: None,
            session_idle_timeout_secs: None,
            max_frame_bytes: 1024 * 1024,
            metrics: false,
        }
    }
}

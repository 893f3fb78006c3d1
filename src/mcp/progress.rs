//! MCP Progress Notifications
//!
//! Support for streaming progress updates from a running tool handler. Every
//! report is also a cancellation checkpoint.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::mcp::protocol::{methods, JsonRpcNotification, Message};
use crate::mcp::session::OutboundSink;

/// Progress token for tracking operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum ProgressToken {
    String(String),
    Number(i64),
}

/// Progress notification params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    pub progress_token: ProgressToken,
    pub progress: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressParams {
    /// Wraps the params in a `notifications/progress` envelope.
    pub fn into_notification(self) -> Result<JsonRpcNotification> {
        Ok(JsonRpcNotification::new(
            methods::NOTIFY_PROGRESS,
            Some(serde_json::to_value(self)?),
        ))
    }
}

/// Progress reporter handed to a tool handler.
///
/// Reports are only emitted when the client supplied a `progressToken`;
/// without one every report is a no-op apart from the cancellation check.
/// Clones share the last reported value, and a report that does not move
/// progress forward is skipped.
#[derive(Clone)]
pub struct ProgressReporter {
    token: Option<ProgressToken>,
    sink: OutboundSink,
    cancel: CancellationToken,
    total: Option<u64>,
    /// Last reported progress plus one; zero before the first report.
    last: Arc<AtomicU64>,
}

impl ProgressReporter {
    pub fn new(token: Option<ProgressToken>, sink: OutboundSink, cancel: CancellationToken) -> Self {
        Self {
            token,
            sink,
            cancel,
            total: None,
            last: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Set the total number of work units reported alongside each update.
    pub fn with_total(mut self, total: Option<u64>) -> Self {
        self.total = total;
        self
    }

    pub fn token(&self) -> Option<&ProgressToken> {
        self.token.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    /// Send a progress notification.
    ///
    /// Fails with [`Error::Cancelled`] if the request has been cancelled, so
    /// handlers can use `?` to stop at this checkpoint.
    pub async fn report(&self, progress: u64, message: Option<&str>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some(token) = self.token.clone() else {
            return Ok(());
        };
        let mark = progress.saturating_add(1);
        if self.last.fetch_max(mark, Ordering::AcqRel) >= mark {
            debug!("Skipping progress {} that does not advance", progress);
            return Ok(());
        }

        let notification = ProgressParams {
            progress_token: token,
            progress,
            total: self.total,
            message: message.map(String::from),
        }
        .into_notification()?;

        self.sink.send(Message::Notification(notification)).await
    }
}

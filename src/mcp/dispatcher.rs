//! Request dispatch.
//!
//! One dispatch loop runs per session. It pulls envelopes off the inbound
//! queue in arrival order, handles notifications inline and runs each request
//! as its own task, bounded by a per-session semaphore.

use futures::FutureExt;
use serde_json::{json, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mcp::handler::{ToolContext, ToolRegistry};
use crate::mcp::progress::{ProgressReporter, ProgressToken};
use crate::mcp::protocol::*;
use crate::mcp::schema;
use crate::mcp::session::{InFlight, Outbound, Session};
use crate::metrics::{Metrics, Timer};
use crate::{SERVER_NAME, VERSION};

/// Dispatch limits.
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// Requests executing concurrently per session.
    pub max_in_flight: usize,
    /// Deadline applied to each tool invocation.
    pub request_timeout: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 32,
            request_timeout: None,
        }
    }
}

/// Routes requests to tools.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    config: DispatchConfig,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>, config: DispatchConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            registry,
            config,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Run the dispatch loop for `session` until it closes.
    ///
    /// `alive` keeps the session from settling while the loop still holds an
    /// envelope it has not answered; request tasks are spawned on `tasks`.
    pub async fn run(self: Arc<Self>, session: Arc<Session>, tasks: TaskTracker, alive: TaskTrackerToken) {
        let permits = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        debug!("Dispatch loop started for session {}", session.id());

        while let Some(message) = session.next_inbound().await {
            match message {
                Message::Request(req) => {
                    let in_flight = match session.begin(&req.id) {
                        Ok(in_flight) => in_flight,
                        Err(e) => {
                            self.reject(&session, req.id, e).await;
                            continue;
                        }
                    };

                    // A full semaphore stops the loop, which lets the inbound
                    // queue fill up and push back on the transport.
                    let permit = tokio::select! {
                        biased;
                        _ = in_flight.token().cancelled() => None,
                        permit = Arc::clone(&permits).acquire_owned() => permit.ok(),
                    };
                    let Some(permit) = permit else {
                        let id = in_flight.id().clone();
                        in_flight
                            .finish(JsonRpcResponse::failure(
                                Some(id),
                                Error::Cancelled.to_rpc_error(),
                            ))
                            .await;
                        continue;
                    };

                    let dispatcher = Arc::clone(&self);
                    tasks.spawn(dispatcher.handle(in_flight, req, permit));
                }
                Message::Notification(notif) => self.handle_notification(&session, notif),
                Message::Response(resp) => {
                    warn!(
                        "Ignoring unexpected response (id: {:?}) on session {}",
                        resp.id,
                        session.id()
                    );
                }
            }
        }

        debug!("Dispatch loop finished for session {}", session.id());
        drop(alive);
    }

    async fn reject(&self, session: &Session, id: RequestId, error: Error) {
        debug!("Rejecting request {}: {}", id, error);
        let outbound = Outbound {
            related: Some(id.clone()),
            message: Message::Response(JsonRpcResponse::failure(Some(id), error.to_rpc_error())),
        };
        if session.send_outbound(outbound).await.is_err() {
            debug!("Session {} has no reader for rejection", session.id());
        }
    }

    fn handle_notification(&self, session: &Session, notif: JsonRpcNotification) {
        match notif.method.as_str() {
            methods::NOTIFY_CANCELLED => {
                let params = notif
                    .params
                    .map(serde_json::from_value::<CancelledParams>)
                    .transpose();
                match params {
                    Ok(Some(params)) => {
                        if session.cancel(&params.request_id) {
                            debug!(
                                "Cancelled request {} ({})",
                                params.request_id,
                                params.reason.as_deref().unwrap_or("no reason given")
                            );
                        } else {
                            debug!(
                                "Cancellation for unknown request {}",
                                params.request_id
                            );
                        }
                    }
                    _ => warn!("Malformed cancellation notification"),
                }
            }
            methods::NOTIFY_INITIALIZED => {
                info!("Client initialized on session {}", session.id());
            }
            other => debug!("Ignoring notification: {}", other),
        }
    }

    /// Execute one request and emit its terminal response.
    async fn handle(
        self: Arc<Self>,
        in_flight: InFlight,
        req: JsonRpcRequest,
        _permit: OwnedSemaphorePermit,
    ) {
        let timer = Timer::start();
        let id = in_flight.id().clone();
        let method = req.method.clone();
        self.metrics.inc_requests();
        self.metrics.request_started();

        let response = match self.route(&in_flight, req).await {
            Ok(result) => {
                self.metrics.inc_success();
                JsonRpcResponse::success(id.clone(), result)
            }
            Err(e) => {
                if matches!(e, Error::Cancelled | Error::Timeout { .. }) {
                    self.metrics.inc_cancelled();
                } else {
                    self.metrics.inc_failed();
                }
                debug!("Request {} ({}) failed: {}", id, method, e);
                JsonRpcResponse::failure(Some(id.clone()), e.to_rpc_error())
            }
        };

        self.metrics.request_finished();
        debug!(
            "Request {} ({}) completed in {}ms",
            id,
            method,
            timer.elapsed_ms()
        );
        in_flight.finish(response).await;
    }

    async fn route(&self, in_flight: &InFlight, req: JsonRpcRequest) -> Result<Value> {
        match req.method.as_str() {
            methods::INITIALIZE => Ok(serde_json::to_value(self.initialize_result())?),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => Ok(serde_json::to_value(ListToolsResult {
                tools: self.registry.list(),
            })?),
            methods::TOOLS_CALL => {
                let params: CallToolParams =
                    serde_json::from_value(req.params.unwrap_or(Value::Null))
                        .map_err(|e| Error::InvalidParams(e.to_string()))?;
                let progress_token = params.meta.and_then(|m| m.progress_token);
                self.call_tool(in_flight, &params.name, params.arguments, progress_token)
                    .await
            }
            // Any other method names a tool directly.
            name => {
                let (arguments, progress_token) = split_meta(req.params);
                self.call_tool(in_flight, name, arguments, progress_token)
                    .await
            }
        }
    }

    fn initialize_result(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: MCP_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
            },
            server_info: ServerInfo {
                name: SERVER_NAME.to_string(),
                version: VERSION.to_string(),
            },
        }
    }

    async fn call_tool(
        &self,
        in_flight: &InFlight,
        name: &str,
        arguments: Option<Value>,
        progress_token: Option<ProgressToken>,
    ) -> Result<Value> {
        let tool = self.registry.resolve(name)?;
        let arguments = match arguments {
            None | Some(Value::Null) => json!({}),
            Some(arguments) => arguments,
        };
        schema::validate(&tool.definition().input_schema, &arguments)?;
        in_flight.checkpoint()?;

        self.metrics.inc_tool_calls();
        let id = in_flight.id().clone();
        let token = in_flight.token().clone();
        let session = Arc::clone(in_flight.session());
        let progress = ProgressReporter::new(
            progress_token,
            session.sink(Some(id.clone())),
            token.clone(),
        );
        let ctx = ToolContext::new(session, id, token.clone(), progress);

        let invocation = AssertUnwindSafe(tool.invoke(ctx, arguments)).catch_unwind();
        let timeout = self.config.request_timeout;
        let deadline = async move {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            _ = deadline => {
                token.cancel();
                Err(Error::Timeout {
                    millis: timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
                })
            }
            outcome = invocation => match outcome {
                Ok(result) => result,
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    warn!("Tool '{}' panicked: {}", name, reason);
                    Err(Error::handler_fault(format!("Tool '{name}' failed: {reason}")))
                }
            },
        };

        Ok(serde_json::to_value(result?)?)
    }
}

/// Split `_meta` off direct-invocation params.
fn split_meta(params: Option<Value>) -> (Option<Value>, Option<ProgressToken>) {
    match params {
        Some(Value::Object(mut map)) => {
            let token = map
                .remove("_meta")
                .and_then(|meta| serde_json::from_value::<RequestMeta>(meta).ok())
                .and_then(|meta| meta.progress_token);
            (Some(Value::Object(map)), token)
        }
        other => (other, None),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_meta_extracts_progress_token() {
        let (args, token) = split_meta(Some(json!({
            "a": 2,
            "b": 3,
            "_meta": {"progressToken": "p-1"}
        })));
        assert_eq!(args, Some(json!({"a": 2, "b": 3})));
        assert_eq!(token, Some(ProgressToken::String("p-1".to_string())));
    }

    #[test]
    fn test_split_meta_without_meta() {
        let (args, token) = split_meta(Some(json!({"name": "Ada"})));
        assert_eq!(args, Some(json!({"name": "Ada"})));
        assert!(token.is_none());

        let (args, token) = split_meta(Some(json!([1, 2])));
        assert_eq!(args, Some(json!([1, 2])));
        assert!(token.is_none());

        assert_eq!(split_meta(None), (None, None));
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");

        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "handler panicked");
    }

    #[test]
    fn test_initialize_result_advertises_tools() {
        let dispatcher = Dispatcher::new(
            Arc::new(ToolRegistry::new()),
            DispatchConfig::default(),
            Metrics::new(),
        );
        let value = serde_json::to_value(dispatcher.initialize_result()).unwrap();
        assert_eq!(value["protocolVersion"], MCP_VERSION);
        assert_eq!(value["serverInfo"]["name"], SERVER_NAME);
        assert_eq!(value["capabilities"]["tools"]["listChanged"], false);
    }
}

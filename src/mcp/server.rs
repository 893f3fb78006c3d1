//! MCP server implementation.
//!
//! The server owns the tool registry, the live sessions and every task that
//! serves them, so `stop` can close sessions and wait for all work to finish.

use dashmap::DashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::http;
use crate::mcp::dispatcher::Dispatcher;
use crate::mcp::handler::ToolRegistry;
use crate::mcp::session::{Session, SessionId};
use crate::mcp::transport::Transport;
use crate::metrics::Metrics;
use crate::{SERVER_NAME, VERSION};

/// MCP server.
pub struct McpServer {
    registry: Arc<ToolRegistry>,
    dispatcher: Arc<Dispatcher>,
    sessions: DashMap<SessionId, Arc<Session>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    config: Config,
    metrics: Arc<Metrics>,
}

impl McpServer {
    /// Create a new MCP server. The registry is read-only from here on.
    pub fn new(registry: ToolRegistry, config: &Config) -> Self {
        let registry = Arc::new(registry);
        let metrics = Metrics::new();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            config.dispatch_config(),
            Arc::clone(&metrics),
        ));

        Self {
            registry,
            dispatcher,
            sessions: DashMap::new(),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            config: config.clone(),
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Create a session and start its dispatch loop.
    pub fn open_session(&self) -> Result<Arc<Session>> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        let session = Session::new(self.config.session_limits());
        // Taken before the loop is spawned so the session cannot settle early.
        let alive = session.hold();
        self.sessions
            .insert(session.id().to_string(), Arc::clone(&session));
        self.metrics.session_opened();

        self.tasks.spawn(Arc::clone(&self.dispatcher).run(
            Arc::clone(&session),
            self.tasks.clone(),
            alive,
        ));

        // `stop` may have swept the session table before the insert.
        if self.is_shutting_down() {
            let closing = Arc::clone(&session);
            self.tasks.spawn(async move {
                closing.close().await;
            });
            self.forget_session(session.id());
            return Err(Error::ShuttingDown);
        }

        info!("Opened session {}", session.id());
        Ok(session)
    }

    /// Look up a live session.
    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Close a session and remove it from the table.
    pub async fn close_session(&self, id: &str) -> Result<()> {
        let session = self
            .forget_session(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        session.close().await;
        info!("Closed session {}", id);
        Ok(())
    }

    fn forget_session(&self, id: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(id)?;
        self.metrics.session_closed();
        Some(session)
    }

    /// Run one session over `transport` until the transport ends.
    pub async fn serve_transport<T: Transport>(&self, transport: T) -> Result<()> {
        let session = self.open_session()?;
        let result = transport.serve(Arc::clone(&session)).await;
        if self.close_session(session.id()).await.is_err() {
            debug!("Session {} was already removed", session.id());
        }
        result
    }

    /// Track a background task so `stop` waits for it.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Bind the HTTP listener.
    pub async fn bind(&self, addr: SocketAddr) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| Error::HttpServer(format!("failed to bind {addr}: {e}")))
    }

    /// Serve streamable HTTP on `listener` until `stop` is called.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("Starting {} v{} on {}", SERVER_NAME, VERSION, addr);

        if let Some(idle) = self.config.session_idle_timeout() {
            self.spawn(Arc::clone(&self).reap_idle(idle));
        }

        let app = http::router(Arc::clone(&self));
        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| Error::HttpServer(e.to_string()))?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Bind `addr` and serve streamable HTTP on it.
    pub async fn start(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = self.bind(addr).await?;
        self.serve(listener).await
    }

    /// Stop accepting sessions, close the live ones and wait for every task.
    pub async fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Stopping server ({} live sessions)", self.session_count());
        }
        self.shutdown.cancel();

        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.close_session(&id).await;
        }

        self.tasks.close();
        self.tasks.wait().await;
        debug!("All session tasks finished");
    }

    async fn reap_idle(self: Arc<Self>, idle: Duration) {
        let mut ticker = tokio::time::interval((idle / 2).max(Duration::from_millis(100)));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let expired: Vec<SessionId> = self
                .sessions
                .iter()
                .filter(|e| e.value().in_flight_count() == 0 && e.value().idle_for() >= idle)
                .map(|e| e.key().clone())
                .collect();
            for id in expired {
                info!("Session {} idle for {:?}, closing", id, idle);
                let _ = self.close_session(&id).await;
            }
        }
    }
}

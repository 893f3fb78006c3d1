//! Streamable HTTP transport.
//!
//! `POST /mcp` carries one envelope per request body. Requests are answered
//! either with an SSE stream of the request's notifications followed by its
//! response, or with the response alone as JSON. `GET /mcp` opens a
//! standalone SSE stream and `DELETE /mcp` ends the session. Sessions are
//! identified by the `Mcp-Session-Id` header, which is handed out in answer
//! to a header-less `initialize`.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{stream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::mcp::codec;
use crate::mcp::protocol::{methods, JsonRpcRequest, JsonRpcResponse, Message, RequestId};
use crate::mcp::server::McpServer;
use crate::mcp::session::{Outbound, Session, SessionId};
use crate::{SERVER_NAME, VERSION};

/// Header carrying the session id.
pub const SESSION_HEADER: &str = "mcp-session-id";

const EVENT_STREAM: &str = "text/event-stream";

/// HTTP server state.
#[derive(Clone)]
pub struct HttpState {
    server: Arc<McpServer>,
    streams: Arc<DashMap<SessionId, Arc<StreamRoutes>>>,
}

struct Route {
    serial: u64,
    tx: mpsc::Sender<Message>,
}

/// Open SSE streams of one session.
struct StreamRoutes {
    buffer: usize,
    next_serial: AtomicU64,
    requests: DashMap<RequestId, Route>,
    standalone: Mutex<Option<mpsc::Sender<Message>>>,
}

impl StreamRoutes {
    fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            next_serial: AtomicU64::new(0),
            requests: DashMap::new(),
            standalone: Mutex::new(None),
        }
    }

    /// Register the stream for request `id`. Fails if one is already open.
    fn register(&self, id: &RequestId) -> Option<(u64, mpsc::Receiver<Message>)> {
        let entry = match self.requests.entry(id.clone()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(entry) => entry,
        };
        let (tx, rx) = mpsc::channel(self.buffer);
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        entry.insert(Route { serial, tx });
        Some((serial, rx))
    }

    /// Remove the route for `id` if it is still the one tagged `serial`.
    fn unregister(&self, id: &RequestId, serial: u64) -> bool {
        self.requests
            .remove_if(id, |_, route| route.serial == serial)
            .is_some()
    }

    fn open_standalone(&self) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.buffer);
        // Replacing the sender ends any previous standalone stream.
        *self.standalone.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    fn standalone(&self) -> Option<mpsc::Sender<Message>> {
        self.standalone
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn clear(&self) {
        self.requests.clear();
        self.standalone
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl HttpState {
    pub fn new(server: Arc<McpServer>) -> Self {
        Self {
            server,
            streams: Arc::new(DashMap::new()),
        }
    }

    fn lookup(&self, id: &str) -> Option<(Arc<Session>, Arc<StreamRoutes>)> {
        let session = self.server.session(id)?;
        let routes = self.streams.get(id).map(|r| Arc::clone(r.value()))?;
        Some((session, routes))
    }

    fn open(&self) -> Result<(Arc<Session>, Arc<StreamRoutes>)> {
        let session = self.server.open_session()?;
        let outbound = session
            .take_outbound()
            .ok_or_else(|| Error::Internal("outbound queue already taken".to_string()))?;
        let routes = Arc::new(StreamRoutes::new(self.server.config().stream_buffer));
        self.streams
            .insert(session.id().to_string(), Arc::clone(&routes));
        self.server.spawn(pump(
            Arc::clone(&session),
            outbound,
            Arc::clone(&routes),
            Arc::clone(&self.streams),
        ));
        Ok((session, routes))
    }
}

/// Build the router serving `/mcp`, `/health` and optionally `/metrics`.
pub fn router(server: Arc<McpServer>) -> Router {
    let max_body = server.config().max_frame_bytes;
    let metrics_enabled = server.config().metrics;
    let state = HttpState::new(server);

    let mut app = Router::new()
        .route("/health", get(health_check))
        .route(
            "/mcp",
            post(handle_post).get(handle_get).delete(handle_delete),
        );
    if metrics_enabled {
        app = app.route("/metrics", get(metrics));
    }

    app.layer(DefaultBodyLimit::max(max_body))
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any)
                    .expose_headers(Any),
            ),
        )
        .with_state(state)
}

/// Health check endpoint.
async fn health_check(State(state): State<HttpState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "name": SERVER_NAME,
        "version": VERSION,
        "sessions": state.server.session_count(),
    }))
}

/// Prometheus metrics endpoint.
async fn metrics(State(state): State<HttpState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.server.metrics().to_prometheus(),
    )
}

async fn handle_post(State(state): State<HttpState>, headers: HeaderMap, body: Bytes) -> Response {
    let message = match codec::decode(&body) {
        Ok(message) => message,
        Err(e) => {
            debug!("Rejected undecodable body: {}", e);
            return rpc_error(StatusCode::BAD_REQUEST, None, &e);
        }
    };

    let known = match session_header(&headers) {
        Some(id) => match state.lookup(id) {
            Some(found) => Some(found),
            None => {
                return rpc_error(
                    StatusCode::NOT_FOUND,
                    None,
                    &Error::SessionNotFound(id.to_string()),
                )
            }
        },
        None => None,
    };

    // Without a session header only `initialize` opens a lasting session.
    // Any other request runs in a one-shot session released with its stream.
    let (session, routes, one_shot) = match known {
        Some((session, routes)) => (session, routes, false),
        None => {
            let initialize =
                matches!(&message, Message::Request(req) if req.method == methods::INITIALIZE);
            if !initialize && !matches!(message, Message::Request(_)) {
                debug!("Accepted message without a session, nothing to deliver it to");
                return StatusCode::ACCEPTED.into_response();
            }
            match state.open() {
                Ok((session, routes)) => (session, routes, !initialize),
                Err(e) => return rpc_error(StatusCode::SERVICE_UNAVAILABLE, None, &e),
            }
        }
    };

    let response = match message {
        Message::Request(req) => {
            let event_stream = wants_event_stream(&headers);
            let release = one_shot.then(|| Arc::clone(&state.server));
            post_request(Arc::clone(&session), routes, req, event_stream, release).await
        }
        other => match session.enqueue_inbound(other).await {
            Ok(()) => StatusCode::ACCEPTED.into_response(),
            Err(e) => rpc_error(StatusCode::NOT_FOUND, None, &e),
        },
    };
    if one_shot {
        response
    } else {
        with_session(response, session.id())
    }
}

async fn post_request(
    session: Arc<Session>,
    routes: Arc<StreamRoutes>,
    req: JsonRpcRequest,
    event_stream: bool,
    release: Option<Arc<McpServer>>,
) -> Response {
    let id = req.id.clone();
    let Some((serial, mut rx)) = routes.register(&id) else {
        return rpc_error(
            StatusCode::CONFLICT,
            Some(id.clone()),
            &Error::DuplicateRequestId(id.to_string()),
        );
    };
    let mut guard = RequestStream {
        session: Arc::clone(&session),
        routes,
        id: id.clone(),
        serial,
        completed: false,
        release,
    };

    if let Err(e) = session.enqueue_inbound(Message::Request(req)).await {
        guard.complete();
        guard.routes.unregister(&id, serial);
        return rpc_error(StatusCode::NOT_FOUND, Some(id), &e);
    }

    if event_stream {
        let events = stream::unfold((rx, guard), |(mut rx, mut guard)| async move {
            if guard.completed {
                return None;
            }
            let message = rx.recv().await?;
            if matches!(message, Message::Response(_)) {
                guard.complete();
            }
            Some((sse_event(&message), (rx, guard)))
        });
        return Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response();
    }

    // Plain JSON: only the terminal response is returned.
    while let Some(message) = rx.recv().await {
        if let Message::Response(response) = message {
            guard.complete();
            return Json(response).into_response();
        }
    }
    guard.complete();
    rpc_error(StatusCode::OK, Some(id), &Error::SessionClosed)
}

async fn handle_get(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let (session, routes) = match resolve(&state, &headers) {
        Ok(found) => found,
        Err(response) => return response,
    };

    let events = ReceiverStream::new(routes.open_standalone()).map(|m| sse_event(&m));
    let response = Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response();
    with_session(response, session.id())
}

async fn handle_delete(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let (session, _) = match resolve(&state, &headers) {
        Ok(found) => found,
        Err(response) => return response,
    };

    match state.server.close_session(session.id()).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => rpc_error(StatusCode::NOT_FOUND, None, &e),
    }
}

fn resolve(
    state: &HttpState,
    headers: &HeaderMap,
) -> std::result::Result<(Arc<Session>, Arc<StreamRoutes>), Response> {
    let Some(id) = session_header(headers) else {
        return Err(rpc_error(
            StatusCode::BAD_REQUEST,
            None,
            &Error::SchemaViolation(format!("missing {SESSION_HEADER} header")),
        ));
    };
    state.lookup(id).ok_or_else(|| {
        rpc_error(
            StatusCode::NOT_FOUND,
            None,
            &Error::SessionNotFound(id.to_string()),
        )
    })
}

/// Moves a session's outbound queue onto its open streams.
async fn pump(
    session: Arc<Session>,
    mut outbound: mpsc::Receiver<Outbound>,
    routes: Arc<StreamRoutes>,
    streams: Arc<DashMap<SessionId, Arc<StreamRoutes>>>,
) {
    loop {
        tokio::select! {
            biased;
            next = outbound.recv() => match next {
                Some(out) => deliver(&routes, out).await,
                None => break,
            },
            _ = session.settled() => break,
        }
    }
    while let Ok(out) = outbound.try_recv() {
        deliver(&routes, out).await;
    }

    routes.clear();
    streams.remove(session.id());
    debug!("Stream pump for session {} finished", session.id());
}

async fn deliver(routes: &StreamRoutes, out: Outbound) {
    let terminal = out.is_terminal();
    let route = out.related.as_ref().and_then(|id| {
        if terminal {
            // Freed before delivery so the id can be reused as soon as the
            // client sees the response.
            routes.requests.remove(id).map(|(_, route)| route.tx)
        } else {
            routes.requests.get(id).map(|route| route.tx.clone())
        }
    });

    let target = route.or_else(|| routes.standalone());
    match target {
        Some(tx) => {
            if tx.send(out.message).await.is_err() {
                debug!("Stream for {:?} is gone", out.related);
            }
        }
        None => debug!("No open stream for message related to {:?}", out.related),
    }
}

/// The client side of one request's stream. Dropping it before the response
/// was delivered cancels the request. A one-shot session is closed along
/// with its only stream.
struct RequestStream {
    session: Arc<Session>,
    routes: Arc<StreamRoutes>,
    id: RequestId,
    serial: u64,
    completed: bool,
    release: Option<Arc<McpServer>>,
}

impl RequestStream {
    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for RequestStream {
    fn drop(&mut self) {
        if !self.completed
            && self.routes.unregister(&self.id, self.serial)
            && self.session.cancel(&self.id)
        {
            warn!(
                "Client dropped the stream for request {}, cancelled it",
                self.id
            );
        }

        let Some(server) = self.release.take() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let id = self.session.id().to_string();
        let closer = Arc::clone(&server);
        server.spawn(async move {
            if let Err(e) = closer.close_session(&id).await {
                debug!("One-shot session {} already gone: {}", id, e);
            }
        });
    }
}

fn sse_event(message: &Message) -> Result<Event> {
    Ok(Event::default().data(codec::encode_to_string(message)?))
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains(EVENT_STREAM))
}

fn with_session(mut response: Response, id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

fn rpc_error(status: StatusCode, id: Option<RequestId>, error: &Error) -> Response {
    (status, Json(JsonRpcResponse::failure(id, error.to_rpc_error()))).into_response()
}

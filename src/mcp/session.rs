//! Per-connection session state.
//!
//! A session owns a bounded inbound queue (transport → dispatcher), a bounded
//! outbound queue (dispatcher → transport) and the table of in-flight
//! requests with their cancellation tokens.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::mcp::protocol::{JsonRpcResponse, Message, RequestId};

/// Opaque session identifier.
pub type SessionId = String;

/// A message leaving the session, tagged with the request it belongs to.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub related: Option<RequestId>,
    pub message: Message,
}

impl Outbound {
    /// Whether this is the final message for its request.
    pub fn is_terminal(&self) -> bool {
        matches!(self.message, Message::Response(_))
    }
}

/// Sending half of the outbound queue, bound to one request.
#[derive(Clone)]
pub struct OutboundSink {
    tx: mpsc::Sender<Outbound>,
    related: Option<RequestId>,
}

impl OutboundSink {
    pub fn new(tx: mpsc::Sender<Outbound>, related: Option<RequestId>) -> Self {
        Self { tx, related }
    }

    pub async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(Outbound {
                related: self.related.clone(),
                message,
            })
            .await
            .map_err(|_| Error::SessionClosed)
    }
}

/// Queue bounds for a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            inbound_capacity: 64,
            outbound_capacity: 64,
        }
    }
}

#[derive(Default)]
struct SessionState {
    closed: bool,
    in_flight: HashMap<RequestId, CancellationToken>,
    /// Requests waiting in the inbound queue, flagged when cancelled there.
    queued: HashMap<RequestId, bool>,
}

/// One logical client connection.
pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    last_activity: AtomicI64,
    inbound_tx: mpsc::Sender<Message>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    state: Mutex<SessionState>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Session {
    /// Create a new session with a fresh random id.
    pub fn new(limits: SessionLimits) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(limits.inbound_capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(limits.outbound_capacity.max(1));
        let now = Utc::now();

        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            state: Mutex::new(SessionState::default()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity.load(Ordering::Relaxed))
            .unwrap_or(self.created_at)
    }

    /// Time since the last inbound or outbound message.
    pub fn idle_for(&self) -> Duration {
        (Utc::now() - self.last_activity())
            .to_std()
            .unwrap_or_default()
    }

    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ===== Inbound =====

    /// Queue a decoded envelope for the dispatcher.
    ///
    /// Waits while the queue is full, which is how transports apply
    /// backpressure to their readers.
    pub async fn enqueue_inbound(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        self.touch();
        let queued = match &message {
            Message::Request(req) => {
                self.state().queued.entry(req.id.clone()).or_insert(false);
                Some(req.id.clone())
            }
            _ => None,
        };
        let sent = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Error::SessionClosed),
            sent = self.inbound_tx.send(message) => sent.map_err(|_| Error::SessionClosed),
        };
        if let (Err(_), Some(id)) = (&sent, queued) {
            self.state().queued.remove(&id);
        }
        sent
    }

    /// Next queued envelope in arrival order, or `None` once closed.
    pub async fn next_inbound(&self) -> Option<Message> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            message = rx.recv() => message,
        }
    }

    // ===== Outbound =====

    /// Hand the outbound queue to the transport. Only the first call succeeds.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<Outbound>> {
        self.outbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub async fn send_outbound(&self, outbound: Outbound) -> Result<()> {
        self.touch();
        self.outbound_tx
            .send(outbound)
            .await
            .map_err(|_| Error::SessionClosed)
    }

    /// A sink whose messages are tagged with `related`.
    pub fn sink(&self, related: Option<RequestId>) -> OutboundSink {
        OutboundSink::new(self.outbound_tx.clone(), related)
    }

    // ===== Cancellation and lifecycle =====

    /// Mark a request cancelled. Returns `false` for unknown ids.
    ///
    /// A request still waiting in the inbound queue is answered with
    /// `Cancelled` when the dispatcher reaches it.
    pub fn cancel(&self, id: &RequestId) -> bool {
        let mut state = self.state();
        if let Some(token) = state.in_flight.get(id) {
            token.cancel();
            return true;
        }
        match state.queued.get_mut(id) {
            Some(cancelled) => {
                *cancelled = true;
                true
            }
            None => false,
        }
    }

    pub fn is_in_flight(&self, id: &RequestId) -> bool {
        self.state().in_flight.contains_key(id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.state().in_flight.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Resolves once the session is closed and every in-flight request has
    /// emitted its terminal response.
    pub async fn settled(&self) {
        self.shutdown.cancelled().await;
        self.tasks.wait().await;
    }

    /// Close the session.
    ///
    /// In-flight requests are cancelled and answer with `Cancelled`; queued
    /// requests that never reached the dispatcher are answered with
    /// `SessionClosed`. Returns `false` if the session was already closed.
    pub async fn close(&self) -> bool {
        {
            let mut state = self.state();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.queued.clear();
        }
        self.shutdown.cancel();

        // Nobody will ever read an outbound queue that was never taken.
        drop(self.take_outbound());

        let mut rx = self.inbound_rx.lock().await;
        rx.close();
        let mut rejected = 0usize;
        while let Ok(message) = rx.try_recv() {
            if let Message::Request(req) = message {
                let response =
                    JsonRpcResponse::failure(Some(req.id.clone()), Error::SessionClosed.to_rpc_error());
                let outbound = Outbound {
                    related: Some(req.id),
                    message: Message::Response(response),
                };
                if self.outbound_tx.send(outbound).await.is_err() {
                    break;
                }
                rejected += 1;
            }
        }
        drop(rx);

        self.tasks.close();
        debug!(
            "Session {} closed ({} queued requests rejected)",
            self.id, rejected
        );
        true
    }

    /// Register a request as in flight.
    pub(crate) fn begin(self: &Arc<Self>, id: &RequestId) -> Result<InFlight> {
        let mut state = self.state();
        if state.closed {
            return Err(Error::SessionClosed);
        }
        if state.queued.remove(id) == Some(true) {
            return Err(Error::Cancelled);
        }
        if state.in_flight.contains_key(id) {
            return Err(Error::DuplicateRequestId(id.to_string()));
        }

        let token = self.shutdown.child_token();
        state.in_flight.insert(id.clone(), token.clone());
        Ok(InFlight {
            session: Arc::clone(self),
            id: id.clone(),
            token,
            finished: false,
            _guard: self.tasks.token(),
        })
    }

    /// Keeps `settled` pending while held.
    pub(crate) fn hold(&self) -> TaskTrackerToken {
        self.tasks.token()
    }

    fn forget(&self, id: &RequestId) {
        self.state().in_flight.remove(id);
    }
}

/// A request between dispatch and its terminal response.
///
/// `finish` consumes the guard, so a request can produce at most one terminal
/// response. A guard dropped without finishing sends `Cancelled` instead.
pub struct InFlight {
    session: Arc<Session>,
    id: RequestId,
    token: CancellationToken,
    finished: bool,
    _guard: TaskTrackerToken,
}

impl InFlight {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fails with [`Error::Cancelled`] once the request is cancelled.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Emit the terminal response.
    pub async fn finish(mut self, response: JsonRpcResponse) {
        self.finished = true;
        self.session.forget(&self.id);
        let outbound = Outbound {
            related: Some(self.id.clone()),
            message: Message::Response(response),
        };
        if self.session.send_outbound(outbound).await.is_err() {
            debug!(
                "Session {} has no reader for response {}",
                self.session.id, self.id
            );
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.session.forget(&self.id);
        let response =
            JsonRpcResponse::failure(Some(self.id.clone()), Error::Cancelled.to_rpc_error());
        let outbound = Outbound {
            related: Some(self.id.clone()),
            message: Message::Response(response),
        };
        if self.session.outbound_tx.try_send(outbound).is_err() {
            warn!(
                "Could not deliver cancellation for request {} on session {}",
                self.id, self.session.id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{error_codes, JsonRpcNotification, JsonRpcRequest};
    use serde_json::json;

    fn request(id: i64) -> Message {
        Message::Request(JsonRpcRequest::new(id, "ping", None))
    }

    fn error_code(outbound: &Outbound) -> Option<i32> {
        match &outbound.message {
            Message::Response(resp) => resp.error.as_ref().map(|e| e.code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_inbound_is_fifo() {
        let session = Session::new(SessionLimits::default());
        for id in 1..=5 {
            session.enqueue_inbound(request(id)).await.unwrap();
        }
        for id in 1..=5 {
            let message = session.next_inbound().await.unwrap();
            assert_eq!(message.request_id(), Some(&RequestId::Number(id)));
        }
    }

    #[tokio::test]
    async fn test_sessions_get_unique_ids() {
        let a = Session::new(SessionLimits::default());
        let b = Session::new(SessionLimits::default());
        assert_ne!(a.id(), b.id());
        assert!(a.last_activity() >= a.created_at());
    }

    #[tokio::test]
    async fn test_full_inbound_queue_applies_backpressure() {
        let session = Session::new(SessionLimits {
            inbound_capacity: 1,
            outbound_capacity: 4,
        });
        session.enqueue_inbound(request(1)).await.unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            session.enqueue_inbound(request(2)),
        )
        .await;
        assert!(blocked.is_err(), "second enqueue should wait for space");

        session.next_inbound().await.unwrap();
        session.enqueue_inbound(request(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = Session::new(SessionLimits::default());
        assert!(session.close().await);
        assert!(!session.close().await);
        assert!(session.is_closed());
        assert!(session.next_inbound().await.is_none());
        assert!(matches!(
            session.enqueue_inbound(request(1)).await,
            Err(Error::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_rejects_queued_requests() {
        let session = Session::new(SessionLimits::default());
        let mut outbound = session.take_outbound().unwrap();

        session.enqueue_inbound(request(1)).await.unwrap();
        session
            .enqueue_inbound(Message::Notification(JsonRpcNotification::new(
                "notifications/initialized",
                Some(json!({})),
            )))
            .await
            .unwrap();
        session.enqueue_inbound(request(2)).await.unwrap();

        session.close().await;

        let first = outbound.recv().await.unwrap();
        let second = outbound.recv().await.unwrap();
        assert_eq!(first.related, Some(RequestId::Number(1)));
        assert_eq!(second.related, Some(RequestId::Number(2)));
        assert_eq!(error_code(&first), Some(error_codes::SESSION_CLOSED));
        assert_eq!(error_code(&second), Some(error_codes::SESSION_CLOSED));

        session.settled().await;
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_outstanding_id_is_rejected() {
        let session = Session::new(SessionLimits::default());
        let _outbound = session.take_outbound().unwrap();
        let id = RequestId::Number(7);

        let in_flight = session.begin(&id).unwrap();
        assert!(matches!(
            session.begin(&id),
            Err(Error::DuplicateRequestId(_))
        ));

        in_flight
            .finish(JsonRpcResponse::success(id.clone(), json!({})))
            .await;
        assert!(!session.is_in_flight(&id));
        assert!(session.begin(&id).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_marks_in_flight_request() {
        let session = Session::new(SessionLimits::default());
        let id = RequestId::String("a".to_string());
        let in_flight = session.begin(&id).unwrap();

        assert!(!in_flight.is_cancelled());
        assert!(session.cancel(&id));
        assert!(in_flight.is_cancelled());
        assert!(matches!(in_flight.checkpoint(), Err(Error::Cancelled)));

        assert!(!session.cancel(&RequestId::Number(99)));
    }

    #[tokio::test]
    async fn test_cancel_reaches_queued_request() {
        let session = Session::new(SessionLimits::default());
        session.enqueue_inbound(request(3)).await.unwrap();
        session.enqueue_inbound(request(4)).await.unwrap();

        let id = RequestId::Number(3);
        assert!(!session.is_in_flight(&id));
        assert!(session.cancel(&id));

        session.next_inbound().await.unwrap();
        assert!(matches!(session.begin(&id), Err(Error::Cancelled)));
        assert!(!session.is_in_flight(&id));

        // Only the cancelled one is affected, and the mark is used up.
        session.next_inbound().await.unwrap();
        assert!(session.begin(&RequestId::Number(4)).is_ok());
        assert!(!session.cancel(&RequestId::Number(5)));
        assert!(session.begin(&id).is_ok());
    }

    #[tokio::test]
    async fn test_close_cancels_in_flight_and_waits_for_them() {
        let session = Session::new(SessionLimits::default());
        let mut outbound = session.take_outbound().unwrap();
        let id = RequestId::Number(7);
        let in_flight = session.begin(&id).unwrap();

        session.close().await;
        assert!(in_flight.is_cancelled());
        assert!(matches!(session.begin(&RequestId::Number(8)), Err(Error::SessionClosed)));

        let settled = tokio::time::timeout(Duration::from_millis(50), session.settled()).await;
        assert!(settled.is_err(), "settled must wait for the in-flight request");

        in_flight
            .finish(JsonRpcResponse::failure(
                Some(id.clone()),
                Error::Cancelled.to_rpc_error(),
            ))
            .await;
        session.settled().await;

        let response = outbound.recv().await.unwrap();
        assert_eq!(response.related, Some(id));
        assert_eq!(error_code(&response), Some(error_codes::REQUEST_CANCELLED));
    }

    #[tokio::test]
    async fn test_dropped_in_flight_reports_cancellation() {
        let session = Session::new(SessionLimits::default());
        let mut outbound = session.take_outbound().unwrap();
        let id = RequestId::Number(3);

        drop(session.begin(&id).unwrap());

        let response = outbound.recv().await.unwrap();
        assert!(response.is_terminal());
        assert_eq!(error_code(&response), Some(error_codes::REQUEST_CANCELLED));
        assert_eq!(session.in_flight_count(), 0);
    }
}

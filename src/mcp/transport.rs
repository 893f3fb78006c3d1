//! MCP transport layer implementations.
//!
//! A transport binds one session to a byte stream: it decodes frames into the
//! session's inbound queue and writes the session's outbound queue back out.
//! The streamable HTTP transport lives in [`crate::http`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, Stdin, Stdout};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::mcp::codec::{Frame, JsonRpcCodec};
use crate::mcp::protocol::{JsonRpcResponse, Message};
use crate::mcp::session::{Outbound, Session};

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send {
    /// Serve `session` until the peer disconnects or the session closes.
    async fn serve(self, session: Arc<Session>) -> Result<()>;
}

/// Newline-delimited JSON-RPC over any async byte stream.
pub struct LineTransport<R, W> {
    reader: R,
    writer: W,
    max_frame: usize,
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W, max_frame: usize) -> Self {
        Self {
            reader,
            writer,
            max_frame,
        }
    }
}

impl LineTransport<Stdin, Stdout> {
    /// Transport over the process's stdin and stdout.
    pub fn stdio(max_frame: usize) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), max_frame)
    }
}

#[async_trait]
impl<R, W> Transport for LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn serve(self, session: Arc<Session>) -> Result<()> {
        let outbound = session
            .take_outbound()
            .ok_or_else(|| Error::Internal("outbound queue already taken".to_string()))?;

        let reader = FramedRead::new(self.reader, JsonRpcCodec::new(self.max_frame));
        let writer = FramedWrite::new(self.writer, JsonRpcCodec::new(self.max_frame));
        let writer_task = tokio::spawn(write_loop(writer, outbound, Arc::clone(&session)));

        let read_result = read_loop(reader, &session).await;
        session.close().await;

        let write_result = writer_task
            .await
            .map_err(|e| Error::Internal(format!("writer task failed: {e}")))?;
        debug!("Line transport for session {} stopped", session.id());
        read_result.and(write_result)
    }
}

async fn read_loop<R>(mut reader: FramedRead<R, JsonRpcCodec>, session: &Session) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = session.closed() => return Ok(()),
            frame = reader.next() => frame,
        };

        match frame {
            None => {
                debug!("EOF on session {}", session.id());
                return Ok(());
            }
            Some(Ok(Frame::Message(message))) => {
                trace!("Received: {:?}", message);
                // Waits while the inbound queue is full, which stops reads.
                if session.enqueue_inbound(message).await.is_err() {
                    return Ok(());
                }
            }
            Some(Ok(Frame::Invalid(response))) => {
                warn!(
                    "Rejected invalid frame on session {}: {:?}",
                    session.id(),
                    response.error.as_ref().map(|e| &e.message)
                );
                if send_rejection(session, response).await.is_err() {
                    return Ok(());
                }
            }
            Some(Err(e)) => {
                error!("Unrecoverable framing error on session {}: {}", session.id(), e);
                if matches!(e, Error::FrameTooLarge { .. }) {
                    let response = JsonRpcResponse::failure(None, e.to_rpc_error());
                    if send_rejection(session, response).await.is_err() {
                        debug!("Session {} has no reader for the framing error", session.id());
                    }
                }
                return Err(e);
            }
        }
    }
}

async fn send_rejection(session: &Session, response: JsonRpcResponse) -> Result<()> {
    session
        .send_outbound(Outbound {
            related: None,
            message: Message::Response(response),
        })
        .await
}

async fn write_loop<W>(
    mut writer: FramedWrite<W, JsonRpcCodec>,
    mut outbound: mpsc::Receiver<Outbound>,
    session: Arc<Session>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result: Result<()> = async {
        loop {
            tokio::select! {
                biased;
                next = outbound.recv() => match next {
                    Some(out) => writer.send(out.message).await?,
                    None => break,
                },
                _ = session.settled() => break,
            }
        }
        // Everything emitted before the session settled is still queued.
        while let Ok(out) = outbound.try_recv() {
            writer.send(out.message).await?;
        }
        Ok(())
    }
    .await;

    if let Err(ref e) = result {
        error!("Write failed on session {}: {}", session.id(), e);
        drop(outbound);
        session.close().await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{error_codes, RequestId};
    use crate::mcp::session::SessionLimits;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_invalid_frame_gets_error_response_and_eof_closes() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, mut client_write) = tokio::io::split(client);

        let session = Session::new(SessionLimits::default());
        let transport = LineTransport::new(server_read, server_write, 1024);
        let serving = tokio::spawn(transport.serve(Arc::clone(&session)));

        client_write
            .write_all(b"not json\n{\"id\":4,\"method\":\"ping\"}\n")
            .await
            .unwrap();
        client_write.shutdown().await.unwrap();

        serving.await.unwrap().unwrap();
        assert!(session.is_closed());

        let mut lines = BufReader::new(client_read).lines();
        let first: JsonRpcResponse =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.id, None);
        assert_eq!(first.error.unwrap().code, error_codes::PARSE_ERROR);

        // Nothing dispatched the ping, so close rejected it.
        let second: JsonRpcResponse =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second.id, Some(RequestId::Number(4)));
        assert_eq!(second.error.unwrap().code, error_codes::SESSION_CLOSED);

        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_session() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, mut client_write) = tokio::io::split(client);

        let session = Session::new(SessionLimits::default());
        let transport = LineTransport::new(server_read, server_write, 16);
        let serving = tokio::spawn(transport.serve(Arc::clone(&session)));

        client_write
            .write_all(b"{\"id\":1,\"method\":\"this-line-is-far-too-long\"}\n")
            .await
            .unwrap();

        let result = serving.await.unwrap();
        assert!(matches!(result, Err(Error::FrameTooLarge { max: 16 })));
        assert!(session.is_closed());

        let mut lines = BufReader::new(client_read).lines();
        let response: JsonRpcResponse =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(response.id, None);
        assert_eq!(response.error.unwrap().code, error_codes::PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_closing_session_stops_transport() {
        let (_client, server) = tokio::io::duplex(64);
        let (server_read, server_write) = tokio::io::split(server);

        let session = Session::new(SessionLimits::default());
        let transport = LineTransport::new(server_read, server_write, 1024);
        let serving = tokio::spawn(transport.serve(Arc::clone(&session)));

        session.close().await;
        serving.await.unwrap().unwrap();
    }
}

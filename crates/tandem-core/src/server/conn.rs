//! Server side of one connection.
//!
//! Requests are read one at a time and handed to the pipeline. Responses may
//! be produced by several tasks at once, so every write goes through the
//! connection's [`ResponseWriter`] lock.

use super::pipeline::Handler;
use crate::cancel::CancellationToken;
use crate::error::{Result, TandemError};
use crate::protocol::{write_message, MessageReader, Request, Response};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct WriterState {
    writer: Mutex<BoxedWriter>,
    /// Cancelled once the connection stops accepting responses.
    closed: CancellationToken,
    peer: String,
}

/// Shared, serialized write side of a server connection.
#[derive(Clone)]
pub struct ResponseWriter {
    inner: Arc<WriterState>,
}

impl ResponseWriter {
    pub(crate) fn new<W>(writer: W, peer: impl Into<String>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(WriterState {
                writer: Mutex::new(Box::new(writer)),
                closed: CancellationToken::new(),
                peer: peer.into(),
            }),
        }
    }

    /// Write one response.
    ///
    /// Closing the connection aborts a write that is waiting for the lock or
    /// for the peer to drain its buffer.
    pub async fn write(&self, response: &Response) -> Result<()> {
        if self.is_closed() {
            return Err(TandemError::Shutdown);
        }
        let closed = &self.inner.closed;
        let mut writer = tokio::select! {
            biased;
            _ = closed.cancelled() => return Err(TandemError::Shutdown),
            writer = self.inner.writer.lock() => writer,
        };
        tokio::select! {
            biased;
            _ = closed.cancelled() => Err(TandemError::Shutdown),
            result = write_message(&mut *writer, response) => result,
        }
    }

    /// Write one response, closing the connection if that fails.
    pub async fn respond(&self, response: Response) {
        match self.write(&response).await {
            Ok(()) => {}
            Err(TandemError::Shutdown) => {
                debug!(
                    "Dropping response {} for {}: connection closed",
                    response.id, self.inner.peer
                );
            }
            Err(e) => {
                warn!("Failed to write response to {}: {}", self.inner.peer, e);
                self.close();
            }
        }
    }

    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub(crate) async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Close and shut down the underlying write half.
    ///
    /// Closing first makes any in-flight write give up the lock.
    pub(crate) async fn shutdown(&self) {
        self.close();
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Read requests from `stream` and dispatch them until the stream ends, a
/// response write fails, or `stop` is cancelled.
pub(crate) async fn serve_connection<S>(
    stream: S,
    peer: String,
    handler: Arc<dyn Handler>,
    stop: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    let mut reader = MessageReader::new(read);
    let writer = ResponseWriter::new(write, peer.clone());

    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!("Connection {} stopped by server shutdown", peer);
                break;
            }
            _ = writer.closed() => {
                debug!("Connection {} closed after a failed write", peer);
                break;
            }
            next = reader.next::<Request>() => next,
        };

        match next {
            Ok(Some(request)) => {
                // Sequential handlers run inline and may block on a full pipe.
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => {
                        debug!("Connection {} stopped by server shutdown", peer);
                        break;
                    }
                    _ = handler.handle(request, &writer) => {}
                }
            }
            Ok(None) => {
                debug!("Connection {} closed by peer", peer);
                break;
            }
            Err(e) => {
                debug!("Connection {} read failed: {}", peer, e);
                break;
            }
        }
    }

    writer.shutdown().await;
}

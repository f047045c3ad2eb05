//! Client side of one connection.
//!
//! Requests from many tasks share a single stream. Writes are serialized by a
//! lock; a dedicated reader task decodes responses and routes them through
//! the [`CallbackRegistry`] by id, so responses may arrive in any order.
//!
//! # Lifecycle
//!
//! A connection is open until its reader fails (EOF, reset, undecodable
//! input), a write hits a disconnect, or [`ClientConn::close`] is called.
//! Closing is one-way: every pending call is released with the failure and
//! every later `send` fails with [`TandemError::Shutdown`] without touching
//! the stream.

use super::callbacks::{CallbackRegistry, Delivery};
use super::caller::Caller;
use crate::cancel::{CallContext, CancellationToken};
use crate::config::ClientConfig;
use crate::error::{Result, TandemError};
use crate::protocol::{encode_message, MessageReader, Request, Response};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// State shared between the connection handle and its reader task.
struct ConnShared {
    callbacks: Arc<CallbackRegistry>,
    closed: AtomicBool,
    writer: Mutex<BoxedWriter>,
    /// Tells the reader task to stop after a local close.
    stop: CancellationToken,
    peer: String,
}

impl ConnShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// One multiplexed client connection.
pub struct ClientConn {
    shared: Arc<ConnShared>,
    sequence: AtomicU64,
}

impl ClientConn {
    /// Wrap an established stream and start its reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let shared = Arc::new(ConnShared {
            callbacks: Arc::new(CallbackRegistry::new()),
            closed: AtomicBool::new(false),
            writer: Mutex::new(Box::new(writer)),
            stop: CancellationToken::new(),
            peer: peer.into(),
        });

        tokio::spawn(receive_loop(MessageReader::new(reader), Arc::clone(&shared)));

        Self {
            shared,
            sequence: AtomicU64::new(0),
        }
    }

    /// Dial `addr` over TCP.
    ///
    /// The dial honors the context deadline, capped at
    /// [`ClientConfig::CONNECT_TIMEOUT`].
    pub async fn connect(addr: &str, ctx: &CallContext) -> Result<Self> {
        let ctx = ctx.with_timeout(ClientConfig::CONNECT_TIMEOUT);
        let stream = ctx.run(async { Ok(TcpStream::connect(addr).await?) }).await?;
        stream.set_nodelay(true)?;

        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        debug!("Client connection established to {}", peer);

        Ok(Self::new(stream, peer))
    }

    /// Write a request and return a handle to its eventual response.
    ///
    /// Waiting for the write lock and the write itself are bounded by `ctx`.
    /// Giving up before any byte is written leaves the connection usable;
    /// giving up part way through a message closes it.
    pub async fn send(
        &self,
        method: &str,
        ctx: &CallContext,
        params: Vec<Value>,
    ) -> Result<PendingCall> {
        ctx.check()?;
        ctx.run(self.write_request(method, params)).await
    }

    async fn write_request(&self, method: &str, params: Vec<Value>) -> Result<PendingCall> {
        if self.shared.is_closed() {
            return Err(TandemError::Shutdown);
        }

        let mut writer = self.shared.writer.lock().await;
        // Re-check under the lock: the reader may have closed us meanwhile.
        if self.shared.is_closed() {
            return Err(TandemError::Shutdown);
        }

        let id = self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let rx = self.shared.callbacks.register(id)?;
        // Dropping `pending` on any early return de-registers the entry.
        let pending = PendingCall {
            id,
            rx,
            callbacks: Arc::clone(&self.shared.callbacks),
        };

        let bytes = encode_message(&Request::new(method, params, id))?;
        let mut progress = PartialWrite::new(&self.shared, bytes.len());
        while progress.written < bytes.len() {
            match writer.write(&bytes[progress.written..]).await {
                Ok(0) => {
                    return Err(self.write_failed(std::io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => progress.written += n,
                Err(e) => return Err(self.write_failed(e)),
            }
        }
        progress.complete();

        if let Err(e) = writer.flush().await {
            return Err(self.write_failed(e));
        }

        Ok(pending)
    }

    fn write_failed(&self, e: std::io::Error) -> TandemError {
        let e = TandemError::from(e);
        if e.is_terminal() {
            warn!("Write to {} failed, closing connection: {}", self.shared.peer, e);
            self.shared.mark_closed();
            self.shared.stop.cancel();
        }
        e
    }

    /// Send a request and wait for its result.
    pub async fn call(&self, method: &str, ctx: &CallContext, params: Vec<Value>) -> Result<Value> {
        let pending = self.send(method, ctx, params).await?;
        pending.wait(ctx).await
    }

    /// Like [`ClientConn::call`], decoding the result into `R`.
    pub async fn call_as<R: DeserializeOwned>(
        &self,
        method: &str,
        ctx: &CallContext,
        params: Vec<Value>,
    ) -> Result<R> {
        let value = self.call(method, ctx, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Close the connection locally.
    ///
    /// Pending calls fail with [`TandemError::Shutdown`].
    pub fn close(&self) {
        self.shared.mark_closed();
        self.shared.stop.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Number of calls waiting for a response.
    pub fn pending(&self) -> usize {
        self.shared.callbacks.len()
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }
}

impl Drop for ClientConn {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConn")
            .field("peer", &self.shared.peer)
            .field("closed", &self.is_closed())
            .field("pending", &self.pending())
            .finish()
    }
}

#[async_trait]
impl Caller for ClientConn {
    async fn call(&self, method: &str, ctx: &CallContext, params: Vec<Value>) -> Result<Value> {
        ClientConn::call(self, method, ctx, params).await
    }

    fn is_closed(&self) -> bool {
        ClientConn::is_closed(self)
    }
}

/// A request that has been written and is waiting for its response.
///
/// Dropping it before the response arrives abandons the call: the registry
/// entry is removed and a late response is discarded.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<Delivery>,
    callbacks: Arc<CallbackRegistry>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response, giving up when `ctx` expires.
    pub async fn wait(mut self, ctx: &CallContext) -> Result<Value> {
        let rx = &mut self.rx;
        let delivery = ctx
            .run(async { rx.await.map_err(|_| TandemError::Shutdown) })
            .await?;
        delivery?.into_result()
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.callbacks.remove(self.id);
    }
}

/// Closes the connection if a message write stops part way through.
///
/// Once some bytes of a message are on the stream, the rest must follow or
/// the peer can no longer find message boundaries.
struct PartialWrite<'a> {
    shared: &'a ConnShared,
    written: usize,
    len: usize,
    complete: bool,
}

impl<'a> PartialWrite<'a> {
    fn new(shared: &'a ConnShared, len: usize) -> Self {
        Self {
            shared,
            written: 0,
            len,
            complete: false,
        }
    }

    fn complete(&mut self) {
        self.complete = true;
    }
}

impl Drop for PartialWrite<'_> {
    fn drop(&mut self) {
        if self.complete || self.written == 0 {
            return;
        }
        warn!(
            "Abandoned write to {} after {} of {} bytes, closing connection",
            self.shared.peer, self.written, self.len
        );
        self.shared.mark_closed();
        self.shared.stop.cancel();
    }
}

/// Reader task: route responses until the stream fails, then release everyone.
async fn receive_loop<R>(mut reader: MessageReader<R>, shared: Arc<ConnShared>)
where
    R: AsyncRead + Unpin,
{
    let failure = loop {
        let next = tokio::select! {
            next = reader.next::<Response>() => next,
            _ = shared.stop.cancelled() => break TandemError::Shutdown,
        };

        match next {
            Ok(Some(response)) => {
                let id = response.id;
                if !shared.callbacks.deliver(response) {
                    debug!("Dropping response {} from {}: no waiting call", id, shared.peer);
                }
            }
            Ok(None) => break TandemError::Shutdown,
            // Any I/O failure on the read side means the peer is gone.
            Err(TandemError::Transport { .. }) => break TandemError::Shutdown,
            Err(e) => break e,
        }
    };

    shared.mark_closed();
    let released = shared.callbacks.release_all(failure.clone());
    debug!(
        "Client connection to {} closed ({}), released {} pending calls",
        shared.peer, failure, released
    );

    let mut writer = shared.writer.lock().await;
    let _ = writer.shutdown().await;
}

//! RPC server: service registration plus the TCP accept loop.
//!
//! # Thread Safety
//!
//! The server runs on the tokio runtime. Each connection is handled in its own
//! spawned task, and with concurrent dispatch each request gets a task too.
//! Registered services are shared via `Arc` and must synchronize their own
//! state.

use super::conn::serve_connection;
use super::limit::Limiter;
use super::pipeline::{Handler, Pipeline};
use super::table::{MethodTable, NameFilter, Service};
use crate::cancel::CancellationToken;
use crate::config::ServerConfig;
use crate::error::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handle to a running server.
///
/// One stop token covers both the accept loop and every connection it
/// spawned. Dropping the handle stops the server.
pub struct ServerHandle {
    addr: SocketAddr,
    stop: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting and close every open connection. Safe to call twice.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

/// An RPC server owning its method table and dispatch policy.
pub struct Server {
    table: Arc<MethodTable>,
    name_filter: Option<NameFilter>,
    limiter: Option<Arc<dyn Limiter>>,
    method_limiters: HashMap<String, Arc<dyn Limiter>>,
    sequential: bool,
    max_connections: usize,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            table: Arc::new(MethodTable::new()),
            name_filter: None,
            limiter: None,
            method_limiters: HashMap::new(),
            sequential: false,
            max_connections: ServerConfig::MAX_CONNECTIONS,
        }
    }

    /// Rewrite method names at registration. Affects later `register` calls.
    pub fn with_name_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.name_filter = Some(Arc::new(filter));
        self
    }

    /// Admission policy applied to every request.
    pub fn with_limiter(mut self, limiter: impl Limiter + 'static) -> Self {
        self.limiter = Some(Arc::new(limiter));
        self
    }

    /// Admission policy for one fully qualified method.
    pub fn with_method_limiter(mut self, method: impl Into<String>, limiter: impl Limiter + 'static) -> Self {
        self.method_limiters.insert(method.into(), Arc::new(limiter));
        self
    }

    /// Handle each connection's requests one after another on its reader task.
    pub fn with_sequential_dispatch(mut self) -> Self {
        self.sequential = true;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Register `service` under `name`. Returns the number of methods added.
    pub fn register<S: Service>(&self, name: &str, service: Arc<S>) -> Result<usize> {
        let count = self
            .table
            .register(name, service, self.name_filter.as_ref())?;
        info!("Registered service {} with {} methods", name, count);
        Ok(count)
    }

    pub fn methods(&self) -> &MethodTable {
        &self.table
    }

    /// The configured handler stack.
    pub fn handler(&self) -> Arc<dyn Handler> {
        let pipeline = Pipeline::new(Arc::clone(&self.table))
            .recover_panics()
            .limit(self.limiter.clone(), self.method_limiters.clone());

        if self.sequential {
            pipeline.into_handler()
        } else {
            pipeline.spawned().into_handler()
        }
    }

    /// Serve a single already-established stream until it closes.
    pub async fn serve_conn<S>(&self, stream: S, peer: impl Into<String>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        serve_connection(stream, peer.into(), self.handler(), CancellationToken::new()).await;
    }

    /// Start accepting TCP connections on `addr`.
    ///
    /// Returns once the listener is bound. Services registered afterwards are
    /// still visible to new requests; limiter changes are not.
    pub async fn listen(&self, addr: &str) -> Result<ServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!("RPC server listening on {}", addr);

        let stop = CancellationToken::new();
        let acceptor = Acceptor {
            listener,
            handler: self.handler(),
            stop: stop.clone(),
            open: Arc::new(AtomicUsize::new(0)),
            max_connections: self.max_connections,
        };

        Ok(ServerHandle {
            addr,
            stop,
            accept_task: Some(tokio::spawn(acceptor.run())),
        })
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("table", &self.table)
            .field("sequential", &self.sequential)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Counts toward the connection cap for as long as it is held.
struct ConnectionSlot {
    open: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    fn acquire(open: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        open.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < max).then_some(n + 1)
        })
        .ok()?;
        Some(Self {
            open: Arc::clone(open),
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Acceptor {
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    stop: CancellationToken,
    open: Arc<AtomicUsize>,
    max_connections: usize,
}

impl Acceptor {
    async fn run(self) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }

        info!(
            "RPC server stopped accepting, {} connections still closing",
            self.open.load(Ordering::Acquire)
        );
    }

    /// Hand `stream` to its own task, or drop it when the server is full.
    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let Some(slot) = ConnectionSlot::acquire(&self.open, self.max_connections) else {
            warn!(
                "Refusing {}: {} connections already open",
                peer, self.max_connections
            );
            return;
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("TCP_NODELAY not set for {}: {}", peer, e);
        }

        let handler = Arc::clone(&self.handler);
        let stop = self.stop.clone();
        tokio::spawn(async move {
            let _slot = slot;
            debug!("Serving {}", peer);
            serve_connection(stream, peer.to_string(), handler, stop).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CallContext;
    use crate::client::ClientConn;
    use crate::server::Registrar;
    use serde_json::json;

    struct Echo;

    impl Service for Echo {
        fn register_methods(self: Arc<Self>, registrar: &mut Registrar<'_>) {
            registrar.method_sync("Echo", |(value,): (serde_json::Value,)| {
                Ok::<_, String>(value)
            });
        }
    }

    #[tokio::test]
    async fn test_server_start_and_shutdown() {
        let server = Server::new();
        server.register("echo", Arc::new(Echo)).unwrap();
        let handle = server.listen("127.0.0.1:0").await.unwrap();

        assert!(handle.port() > 0);

        let conn = ClientConn::connect(&handle.addr().to_string(), &CallContext::background())
            .await
            .unwrap();
        let value = conn
            .call("echo.Echo", &CallContext::background(), vec![json!({"k": 1})])
            .await
            .unwrap();
        assert_eq!(value, json!({"k": 1}));

        handle.shutdown();
        handle.shutdown();
        assert!(handle.is_shut_down());
        // Existing connections are told to close as well.
        let result = conn
            .call("echo.Echo", &CallContext::background(), vec![json!(1)])
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_connection_slot_counts_until_dropped() {
        let open = Arc::new(AtomicUsize::new(0));
        let first = ConnectionSlot::acquire(&open, 2).unwrap();
        let second = ConnectionSlot::acquire(&open, 2).unwrap();
        assert!(ConnectionSlot::acquire(&open, 2).is_none());
        assert_eq!(open.load(Ordering::Acquire), 2);

        drop(first);
        assert_eq!(open.load(Ordering::Acquire), 1);
        let third = ConnectionSlot::acquire(&open, 2).unwrap();
        drop(second);
        drop(third);
        assert_eq!(open.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_closed_connection_frees_its_slot() {
        let server = Server::new().with_max_connections(1);
        server.register("echo", Arc::new(Echo)).unwrap();
        let handle = server.listen("127.0.0.1:0").await.unwrap();
        let addr = handle.addr().to_string();
        let ctx = CallContext::background();

        let first = ClientConn::connect(&addr, &ctx).await.unwrap();
        assert_eq!(
            first.call("echo.Echo", &ctx, vec![json!(1)]).await.unwrap(),
            json!(1)
        );
        drop(first);

        // The server notices the close and releases the slot shortly after.
        let mut served = false;
        for _ in 0..50 {
            let conn = ClientConn::connect(&addr, &ctx).await.unwrap();
            if let Ok(value) = conn.call("echo.Echo", &ctx, vec![json!(2)]).await {
                assert_eq!(value, json!(2));
                served = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(served);
    }

    #[tokio::test]
    async fn test_connection_cap() {
        let server = Server::new().with_max_connections(0);
        server.register("echo", Arc::new(Echo)).unwrap();
        let handle = server.listen("127.0.0.1:0").await.unwrap();

        let conn = ClientConn::connect(&handle.addr().to_string(), &CallContext::background())
            .await
            .unwrap();
        let result = conn
            .call("echo.Echo", &CallContext::background(), vec![json!(1)])
            .await;
        assert!(result.unwrap_err().is_terminal());
    }

    #[tokio::test]
    async fn test_sequential_dispatch_serves_duplex() {
        let server = Server::new().with_sequential_dispatch();
        server.register("echo", Arc::new(Echo)).unwrap();

        let (client_io, server_io) = tokio::io::duplex(4096);
        let conn = ClientConn::new(client_io, "duplex");
        let serving = server.serve_conn(server_io, "duplex");
        let calling = async {
            let value = conn
                .call("echo.Echo", &CallContext::background(), vec![json!("hi")])
                .await;
            conn.close();
            value
        };

        let ((), value) = tokio::join!(serving, calling);
        assert_eq!(value.unwrap(), json!("hi"));
    }
}

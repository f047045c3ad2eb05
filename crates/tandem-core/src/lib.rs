//! Tandem Core - JSON-RPC runtime over plain byte streams.
//!
//! This crate provides a multiplexed client connection, a lazily reconnecting
//! connection pool, typed client stubs bound from descriptor structs, and a
//! server with a composable dispatch pipeline (panic isolation, admission
//! limits, concurrent execution).
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tandem_core::{descriptor, ConnectionPool, Registrar, Server, Service, StubBinder};
//!
//! struct Arith;
//!
//! impl Service for Arith {
//!     fn register_methods(self: Arc<Self>, registrar: &mut Registrar<'_>) {
//!         registrar.method_sync("Double", |(n,): (i64,)| Ok::<_, String>(n * 2));
//!     }
//! }
//!
//! descriptor! {
//!     pub struct ArithClient {
//!         #[rpc = "Double"]
//!         pub double: fn(i64) -> i64,
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> tandem_core::Result<()> {
//!     let server = Server::new();
//!     server.register("arith", Arc::new(Arith))?;
//!     let handle = server.listen("127.0.0.1:0").await?;
//!
//!     let pool = ConnectionPool::connect(handle.addr().to_string(), 2)?;
//!     let mut client = ArithClient::default();
//!     StubBinder::new(Arc::new(pool)).bind("arith", &mut client)?;
//!
//!     assert_eq!(client.double.call(21).await?, 42);
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod stub;

// Re-export commonly used types
pub use cancel::{CallContext, CancellationToken};
pub use client::{factory_fn, Caller, CallerFactory, ClientConn, PendingCall, TcpCallerFactory};
pub use config::{ClientConfig, ProtocolConfig, ServerConfig};
pub use error::{Result, TandemError};
pub use pool::{ConnectionPool, LazySlot, VersionedCaller};
pub use protocol::{codes, ErrorObject, Request, Response};
pub use server::{Limiter, RateLimiter, Registrar, Server, ServerHandle, Service};
pub use stub::{sender_fn, Descriptor, Sender, Stub, StubBinder};

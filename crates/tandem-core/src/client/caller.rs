//! Traits at the seam between the pool and concrete connections.

use super::conn::ClientConn;
use crate::cancel::CallContext;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Something that can carry a call to a remote method.
#[async_trait]
pub trait Caller: Send + Sync {
    async fn call(&self, method: &str, ctx: &CallContext, params: Vec<Value>) -> Result<Value>;

    /// Whether this caller has stopped accepting calls for good.
    fn is_closed(&self) -> bool;
}

/// Produces fresh callers for the pool.
#[async_trait]
pub trait CallerFactory: Send + Sync {
    async fn create(&self, ctx: &CallContext) -> Result<Arc<dyn Caller>>;
}

/// Adapts an async closure into a [`CallerFactory`].
pub fn factory_fn<F, Fut>(f: F) -> FnFactory<F>
where
    F: Fn(CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Arc<dyn Caller>>> + Send + 'static,
{
    FnFactory(f)
}

pub struct FnFactory<F>(F);

#[async_trait]
impl<F, Fut> CallerFactory for FnFactory<F>
where
    F: Fn(CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Arc<dyn Caller>>> + Send + 'static,
{
    async fn create(&self, ctx: &CallContext) -> Result<Arc<dyn Caller>> {
        (self.0)(ctx.clone()).await
    }
}

/// Dials a TCP address and wraps the stream in a [`ClientConn`].
#[derive(Debug, Clone)]
pub struct TcpCallerFactory {
    addr: String,
}

impl TcpCallerFactory {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl CallerFactory for TcpCallerFactory {
    async fn create(&self, ctx: &CallContext) -> Result<Arc<dyn Caller>> {
        let conn = ClientConn::connect(&self.addr, ctx).await?;
        Ok(Arc::new(conn))
    }
}

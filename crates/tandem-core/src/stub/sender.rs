//! The transport a bound stub sends through.

use crate::cancel::CallContext;
use crate::client::ClientConn;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;

/// Carries one call for a stub: fully qualified method name, context and
/// positional params in, raw result out.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, method: &str, ctx: &CallContext, params: Vec<Value>) -> Result<Value>;
}

/// Adapts an async closure into a [`Sender`].
///
/// Arguments are passed owned so the returned future need not borrow.
pub fn sender_fn<F, Fut>(f: F) -> FnSender<F>
where
    F: Fn(String, CallContext, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    FnSender(f)
}

pub struct FnSender<F>(F);

#[async_trait]
impl<F, Fut> Sender for FnSender<F>
where
    F: Fn(String, CallContext, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn send(&self, method: &str, ctx: &CallContext, params: Vec<Value>) -> Result<Value> {
        (self.0)(method.to_string(), ctx.clone(), params).await
    }
}

#[async_trait]
impl Sender for ClientConn {
    async fn send(&self, method: &str, ctx: &CallContext, params: Vec<Value>) -> Result<Value> {
        self.call(method, ctx, params).await
    }
}

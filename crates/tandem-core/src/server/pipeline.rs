//! Composable request handlers.
//!
//! The server's default stack, outermost first:
//!
//! ```text
//! Spawned -> Admission -> PanicGuard -> MethodTable
//! ```
//!
//! Every layer writes exactly one response per request, either its own or
//! the one produced further in.

use super::conn::ResponseWriter;
use super::limit::Limiter;
use super::table::MethodTable;
use crate::protocol::{ErrorObject, Request, Response};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Handle one request and write its response.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Request, writer: &ResponseWriter);
}

#[async_trait]
impl Handler for MethodTable {
    async fn handle(&self, request: Request, writer: &ResponseWriter) {
        let Request {
            method, params, id, ..
        } = request;

        let response = match self.lookup(&method) {
            None => {
                debug!("Method not found: {}", method);
                Response::failure(id, ErrorObject::method_not_found(&method))
            }
            Some(executor) => match executor(params).await {
                Ok(result) => Response::success(id, result),
                Err(error) => Response::failure(id, error),
            },
        };

        writer.respond(response).await;
    }
}

/// Turns a panic anywhere inside `inner` into a HandlerPanicked response.
pub struct PanicGuard {
    inner: Arc<dyn Handler>,
}

impl PanicGuard {
    pub fn new(inner: Arc<dyn Handler>) -> Self {
        Self { inner }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl Handler for PanicGuard {
    async fn handle(&self, request: Request, writer: &ResponseWriter) {
        let id = request.id;
        let method = request.method.clone();

        let outcome = AssertUnwindSafe(self.inner.handle(request, writer))
            .catch_unwind()
            .await;

        if let Err(payload) = outcome {
            let message = panic_message(&*payload);
            error!("Method {} panicked: {}", method, message);
            writer
                .respond(Response::failure(id, ErrorObject::handler_panicked(message)))
                .await;
        }
    }
}

/// Rejects requests its limiters refuse with OverServerLimit.
///
/// A per-method limiter, when one matches, is consulted before the global
/// one. Rejected requests never reach `inner`.
pub struct Admission {
    inner: Arc<dyn Handler>,
    global: Option<Arc<dyn Limiter>>,
    per_method: HashMap<String, Arc<dyn Limiter>>,
}

impl Admission {
    pub fn new(
        inner: Arc<dyn Handler>,
        global: Option<Arc<dyn Limiter>>,
        per_method: HashMap<String, Arc<dyn Limiter>>,
    ) -> Self {
        Self {
            inner,
            global,
            per_method,
        }
    }

    fn admit(&self, method: &str) -> bool {
        if let Some(limiter) = self.per_method.get(method) {
            if !limiter.allow() {
                return false;
            }
        }
        self.global.as_ref().map_or(true, |limiter| limiter.allow())
    }
}

#[async_trait]
impl Handler for Admission {
    async fn handle(&self, request: Request, writer: &ResponseWriter) {
        if self.admit(&request.method) {
            self.inner.handle(request, writer).await;
            return;
        }

        warn!("Rejected {} from {}: over server limit", request.method, writer.peer());
        writer
            .respond(Response::failure(request.id, ErrorObject::over_server_limit()))
            .await;
    }
}

/// Runs `inner` on its own task so the reader can move on at once.
///
/// Responses may then leave in a different order than requests arrived.
pub struct Spawned {
    inner: Arc<dyn Handler>,
}

impl Spawned {
    pub fn new(inner: Arc<dyn Handler>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Handler for Spawned {
    async fn handle(&self, request: Request, writer: &ResponseWriter) {
        let inner = Arc::clone(&self.inner);
        let writer = writer.clone();
        tokio::spawn(async move {
            inner.handle(request, &writer).await;
        });
    }
}

/// Builder for a handler stack around a method table.
pub struct Pipeline {
    handler: Arc<dyn Handler>,
}

impl Pipeline {
    pub fn new(table: Arc<MethodTable>) -> Self {
        Self { handler: table }
    }

    pub fn recover_panics(self) -> Self {
        Self {
            handler: Arc::new(PanicGuard::new(self.handler)),
        }
    }

    /// Add admission control. Without any limiter this is a no-op.
    pub fn limit(
        self,
        global: Option<Arc<dyn Limiter>>,
        per_method: HashMap<String, Arc<dyn Limiter>>,
    ) -> Self {
        if global.is_none() && per_method.is_empty() {
            return self;
        }
        Self {
            handler: Arc::new(Admission::new(self.handler, global, per_method)),
        }
    }

    pub fn spawned(self) -> Self {
        Self {
            handler: Arc::new(Spawned::new(self.handler)),
        }
    }

    pub fn into_handler(self) -> Arc<dyn Handler> {
        self.handler
    }
}

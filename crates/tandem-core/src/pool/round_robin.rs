//! Fixed-size pool of lazily created connections, picked round robin.

use super::slot::LazySlot;
use crate::cancel::CallContext;
use crate::client::{CallerFactory, TcpCallerFactory};
use crate::error::{Result, TandemError};
use crate::stub::Sender;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Spreads calls over `size` slots.
///
/// A call that fails terminally invalidates the slot it went through, so the
/// next call routed there dials a fresh connection. The failed call itself is
/// not retried.
pub struct ConnectionPool {
    slots: Vec<LazySlot>,
    next: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(size: usize, factory: Arc<dyn CallerFactory>) -> Result<Self> {
        if size == 0 {
            return Err(TandemError::Config {
                message: "pool size must be at least 1".to_string(),
            });
        }

        let slots = (0..size).map(|_| LazySlot::new(Arc::clone(&factory))).collect();
        Ok(Self {
            slots,
            next: AtomicUsize::new(0),
        })
    }

    /// Pool of TCP connections to `addr`. Nothing is dialed until first use.
    pub fn connect(addr: impl Into<String>, size: usize) -> Result<Self> {
        Self::new(size, Arc::new(TcpCallerFactory::new(addr)))
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    fn pick(&self) -> (usize, &LazySlot) {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        (index, &self.slots[index])
    }

    /// Route one call through the next slot.
    pub async fn dispatch(&self, method: &str, ctx: &CallContext, params: Vec<Value>) -> Result<Value> {
        let (index, slot) = self.pick();
        let handle = slot.get(ctx).await?;

        let result = handle.caller.call(method, ctx, params).await;
        if let Err(e) = &result {
            if (e.is_terminal() || handle.caller.is_closed()) && slot.clear(handle.generation).await {
                warn!(
                    "Pool slot {} invalidated at generation {}: {}",
                    index, handle.generation, e
                );
            }
        }

        result
    }

    /// Like [`ConnectionPool::dispatch`], decoding the result into `R`.
    pub async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        ctx: &CallContext,
        params: Vec<Value>,
    ) -> Result<R> {
        let value = self.dispatch(method, ctx, params).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("slots", &self.slots)
            .finish()
    }
}

#[async_trait]
impl Sender for ConnectionPool {
    async fn send(&self, method: &str, ctx: &CallContext, params: Vec<Value>) -> Result<Value> {
        self.dispatch(method, ctx, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{factory_fn, Caller};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    /// Caller that answers with its own tag and can be made to fail terminally.
    struct Tagged {
        tag: usize,
        broken: AtomicBool,
    }

    #[async_trait]
    impl Caller for Tagged {
        async fn call(&self, method: &str, _ctx: &CallContext, _params: Vec<Value>) -> Result<Value> {
            if method == "svc.Break" {
                self.broken.store(true, Ordering::SeqCst);
            }
            if self.broken.load(Ordering::SeqCst) {
                return Err(TandemError::Shutdown);
            }
            Ok(Value::from(self.tag))
        }

        fn is_closed(&self) -> bool {
            self.broken.load(Ordering::SeqCst)
        }
    }

    fn tagging_factory(created: Arc<Mutex<Vec<usize>>>) -> Arc<dyn CallerFactory> {
        Arc::new(factory_fn(move |_ctx| {
            let mut created = created.lock().unwrap();
            let tag = created.len();
            created.push(tag);
            async move {
                Ok(Arc::new(Tagged {
                    tag,
                    broken: AtomicBool::new(false),
                }) as Arc<dyn Caller>)
            }
        }))
    }

    #[test]
    fn test_zero_size_rejected() {
        let factory = tagging_factory(Arc::new(Mutex::new(Vec::new())));
        assert!(matches!(
            ConnectionPool::new(0, factory),
            Err(TandemError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_round_robin_covers_every_slot() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let pool = ConnectionPool::new(3, tagging_factory(Arc::clone(&created))).unwrap();
        let ctx = CallContext::background();

        let mut seen = Vec::new();
        for _ in 0..6 {
            let tag: usize = pool.call("svc.Tag", &ctx, vec![]).await.unwrap();
            seen.push(tag);
        }

        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 3);
        assert_eq!(created.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_terminal_failure_recreates_slot() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let pool = ConnectionPool::new(1, tagging_factory(Arc::clone(&created))).unwrap();
        let ctx = CallContext::background();

        let first: usize = pool.call("svc.Tag", &ctx, vec![]).await.unwrap();
        assert_eq!(first, 0);

        let err = pool.dispatch("svc.Break", &ctx, vec![]).await.unwrap_err();
        assert!(matches!(err, TandemError::Shutdown));

        let next: usize = pool.call("svc.Tag", &ctx, vec![]).await.unwrap();
        assert_eq!(next, 1);
        assert_eq!(created.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_hangup_invalidates_slot() {
        let factory: Arc<dyn CallerFactory> = Arc::new(factory_fn(|_ctx| async {
            // The peer end is dropped at once, so the first call sees a hangup.
            let (client_io, _) = tokio::io::duplex(64);
            let caller = crate::client::ClientConn::new(client_io, "hangup");
            Ok(Arc::new(caller) as Arc<dyn Caller>)
        }));
        let pool = ConnectionPool::new(1, factory).unwrap();
        let ctx = CallContext::background();

        let err = pool.dispatch("svc.Any", &ctx, vec![]).await.unwrap_err();
        assert!(err.is_terminal(), "got {:?}", err);
        assert_eq!(pool.slots[0].generation(), 1);
    }
}

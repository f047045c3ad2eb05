//! Binding descriptor fields to a [`Sender`].

use super::descriptor::{Descriptor, FieldVisitor};
use super::sender::Sender;
use crate::cancel::CallContext;
use crate::config::ClientConfig;
use crate::error::{Result, TandemError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Maps a field name to a remote method name.
pub type NameMapper = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Everything a bound stub needs to issue its call.
pub(crate) struct Binding {
    pub(crate) method: String,
    pub(crate) sender: Arc<dyn Sender>,
    pub(crate) base: CallContext,
    pub(crate) timeout: Duration,
}

/// A remote method taking `A` and returning `R`.
///
/// The default value is unbound: calling it fails with
/// [`TandemError::UnboundStub`] until a [`StubBinder`] fills it in.
pub struct Stub<A, R> {
    binding: Option<Arc<Binding>>,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> Stub<A, R> {
    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// Fully qualified remote method name, once bound.
    pub fn method_name(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.method.as_str())
    }

    pub(crate) fn set_binding(&mut self, binding: Binding) {
        self.binding = Some(Arc::new(binding));
    }
}

impl<A, R> Stub<A, R>
where
    A: Serialize,
    R: DeserializeOwned,
{
    /// Invoke the remote method with `arg` as its single positional param.
    ///
    /// The call runs under the binder's base context narrowed by its timeout.
    pub async fn call(&self, arg: A) -> Result<R> {
        let binding = self.binding.as_ref().ok_or(TandemError::UnboundStub)?;
        let ctx = binding.base.with_timeout(binding.timeout);
        let params = vec![serde_json::to_value(arg)?];

        let value = ctx
            .run(binding.sender.send(&binding.method, &ctx, params))
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl<A, R> Default for Stub<A, R> {
    fn default() -> Self {
        Self {
            binding: None,
            _marker: PhantomData,
        }
    }
}

impl<A, R> Clone for Stub<A, R> {
    fn clone(&self) -> Self {
        Self {
            binding: self.binding.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, R> fmt::Debug for Stub<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.method_name() {
            Some(method) => write!(f, "Stub({})", method),
            None => write!(f, "Stub(unbound)"),
        }
    }
}

/// Fills descriptor stubs with calls through one [`Sender`].
pub struct StubBinder {
    sender: Arc<dyn Sender>,
    ctx: CallContext,
    timeout: Duration,
    mapper: Option<NameMapper>,
}

impl StubBinder {
    pub fn new(sender: Arc<dyn Sender>) -> Self {
        Self {
            sender,
            ctx: CallContext::background(),
            timeout: ClientConfig::DEFAULT_CALL_TIMEOUT,
            mapper: None,
        }
    }

    /// Per-call timeout applied on top of the base context.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Base context every bound call derives from.
    pub fn with_context(mut self, ctx: CallContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Name policy for fields without an explicit `rpc` name.
    pub fn with_name_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.mapper = Some(Arc::new(mapper));
        self
    }

    /// Bind every stub of `descriptor` under `service`.
    ///
    /// All names are checked before any stub is touched, so a rejected
    /// descriptor is left exactly as it was.
    pub fn bind<D>(&self, service: &str, descriptor: &mut D) -> Result<()>
    where
        D: Descriptor + ?Sized,
    {
        if service.is_empty() {
            return Err(TandemError::invalid_descriptor("service name is empty"));
        }

        let mut check = FieldVisitor::validate(service, self.mapper.as_ref());
        descriptor.describe(&mut check);
        check.finish()?;

        let mut visitor = FieldVisitor::bind(
            service,
            self.mapper.as_ref(),
            &self.sender,
            &self.ctx,
            self.timeout,
        );
        descriptor.describe(&mut visitor);
        let bound = visitor.finish()?;
        debug!("Bound {} stubs for service {}", bound, service);

        Ok(())
    }
}

impl fmt::Debug for StubBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubBinder")
            .field("timeout", &self.timeout)
            .field("has_mapper", &self.mapper.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::sender_fn;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    crate::descriptor! {
        struct Greeter {
            hello: fn(String) -> String,
            #[rpc = "Stall"]
            wait: fn(()) -> (),
        }
    }

    type Log = Arc<Mutex<Vec<(String, Vec<Value>)>>>;

    fn recording_sender(log: Log) -> Arc<dyn Sender> {
        Arc::new(sender_fn(move |method, _ctx, params| {
            log.lock().unwrap().push((method.clone(), params.clone()));
            async move {
                match method.as_str() {
                    "greeter.Stall" => std::future::pending().await,
                    _ => Ok(json!(format!("hi {}", params[0].as_str().unwrap_or("?")))),
                }
            }
        }))
    }

    #[tokio::test]
    async fn test_bound_stub_round_trip() {
        let log = Log::default();
        let binder = StubBinder::new(recording_sender(Arc::clone(&log)))
            .with_name_mapper(|field| {
                let mut chars = field.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                }
            });

        let mut greeter = Greeter::default();
        binder.bind("greeter", &mut greeter).unwrap();

        assert_eq!(greeter.hello.call("ada".to_string()).await.unwrap(), "hi ada");
        let log = log.lock().unwrap();
        assert_eq!(log[0].0, "greeter.Hello");
        assert_eq!(log[0].1, vec![json!("ada")]);
    }

    #[tokio::test]
    async fn test_unbound_stub_fails() {
        let greeter = Greeter::default();
        assert!(matches!(
            greeter.hello.call("x".to_string()).await,
            Err(TandemError::UnboundStub)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stub_deadline() {
        let binder = StubBinder::new(recording_sender(Log::default()))
            .with_timeout(Duration::from_millis(250));
        let mut greeter = Greeter::default();
        binder.bind("greeter", &mut greeter).unwrap();

        let started = tokio::time::Instant::now();
        let result = greeter.wait.call(()).await;
        assert!(matches!(result, Err(TandemError::DeadlineExceeded)));
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_base_context_cancellation() {
        let ctx = CallContext::background();
        let binder = StubBinder::new(recording_sender(Log::default())).with_context(ctx.clone());
        let mut greeter = Greeter::default();
        binder.bind("greeter", &mut greeter).unwrap();

        ctx.token().cancel();
        assert!(matches!(
            greeter.wait.call(()).await,
            Err(TandemError::Cancelled)
        ));
    }

    #[test]
    fn test_invalid_descriptor_leaves_stubs_unbound() {
        // `hello` maps onto the name `wait` already claims explicitly.
        let binder = StubBinder::new(recording_sender(Log::default()))
            .with_name_mapper(|_field| "Stall".to_string());
        let mut greeter = Greeter::default();

        let err = binder.bind("greeter", &mut greeter).unwrap_err();
        assert!(matches!(err, TandemError::InvalidDescriptor { .. }));
        assert!(!greeter.hello.is_bound());
        assert!(!greeter.wait.is_bound());
    }

    #[test]
    fn test_empty_service_rejected() {
        let mut greeter = Greeter::default();
        let err = StubBinder::new(recording_sender(Log::default()))
            .bind("", &mut greeter)
            .unwrap_err();
        assert!(matches!(err, TandemError::InvalidDescriptor { .. }));
    }
}

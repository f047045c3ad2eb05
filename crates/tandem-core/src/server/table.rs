//! Method registration and lookup.
//!
//! Services register their methods explicitly through a [`Registrar`]. Each
//! method becomes an executor keyed `"service.Method"` that decodes the
//! positional params, runs the method and encodes its result.

use crate::error::{Result, TandemError};
use crate::protocol::ErrorObject;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Outcome of one method invocation, ready to be put on the wire.
pub type MethodResult = std::result::Result<Value, ErrorObject>;

/// Type-erased method: positional params in, encoded result out.
pub type Executor = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, MethodResult> + Send + Sync>;

/// Rewrites method names at registration.
pub type NameFilter = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Argument lists decodable from positional params.
///
/// Param `i` decodes into element `i` of the tuple. Missing params and params
/// of the wrong shape are rejected; trailing extra params are ignored.
pub trait FromParams: Sized {
    fn from_params(params: Vec<Value>) -> std::result::Result<Self, ErrorObject>;
}

fn decode_param<T: DeserializeOwned>(
    index: usize,
    param: Option<Value>,
) -> std::result::Result<T, ErrorObject> {
    let value = param.ok_or_else(|| ErrorObject::invalid_params(format!("missing param {}", index)))?;
    serde_json::from_value(value)
        .map_err(|e| ErrorObject::invalid_params(format!("param {}: {}", index, e)))
}

impl FromParams for () {
    fn from_params(_params: Vec<Value>) -> std::result::Result<Self, ErrorObject> {
        Ok(())
    }
}

macro_rules! impl_from_params {
    ($($index:tt $ty:ident),+) => {
        impl<$($ty: DeserializeOwned),+> FromParams for ($($ty,)+) {
            fn from_params(params: Vec<Value>) -> std::result::Result<Self, ErrorObject> {
                let mut params = params.into_iter();
                Ok(($(decode_param::<$ty>($index, params.next())?,)+))
            }
        }
    };
}

impl_from_params!(0 A);
impl_from_params!(0 A, 1 B);
impl_from_params!(0 A, 1 B, 2 C);
impl_from_params!(0 A, 1 B, 2 C, 3 D);
impl_from_params!(0 A, 1 B, 2 C, 3 D, 4 E);
impl_from_params!(0 A, 1 B, 2 C, 3 D, 4 E, 5 F);

/// An object exposing methods to remote callers.
pub trait Service: Send + Sync + 'static {
    fn register_methods(self: Arc<Self>, registrar: &mut Registrar<'_>);
}

/// Collects one service's methods during registration.
pub struct Registrar<'a> {
    service: &'a str,
    filter: Option<&'a NameFilter>,
    methods: Vec<(String, Executor)>,
}

impl<'a> Registrar<'a> {
    fn new(service: &'a str, filter: Option<&'a NameFilter>) -> Self {
        Self {
            service,
            filter,
            methods: Vec::new(),
        }
    }

    fn qualify(&self, name: &str) -> String {
        match self.filter {
            Some(filter) => format!("{}.{}", self.service, (**filter)(name)),
            None => format!("{}.{}", self.service, name),
        }
    }

    /// Register an async method.
    ///
    /// A returned `Err` is sent back as a handler error carrying its
    /// `Display` text.
    pub fn method<Args, T, E, F, Fut>(&mut self, name: &str, f: F) -> &mut Self
    where
        Args: FromParams + Send + 'static,
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let f = Arc::new(f);
        let executor: Executor = Arc::new(move |params: Vec<Value>| -> BoxFuture<'static, MethodResult> {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let args = Args::from_params(params)?;
                match f(args).await {
                    Ok(value) => serde_json::to_value(value)
                        .map_err(|e| ErrorObject::internal(format!("failed to encode result: {}", e))),
                    Err(e) => Err(ErrorObject::handler_error(e.to_string())),
                }
            })
        });

        let key = self.qualify(name);
        self.methods.push((key, executor));
        self
    }

    /// Register a method that completes without awaiting.
    pub fn method_sync<Args, T, E, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        Args: FromParams + Send + 'static,
        F: Fn(Args) -> std::result::Result<T, E> + Send + Sync + 'static,
        T: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.method(name, move |args| std::future::ready(f(args)))
    }
}

/// Registered methods by fully qualified name.
#[derive(Default)]
pub struct MethodTable {
    methods: RwLock<HashMap<String, Executor>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every method `service` exposes under `name`.
    ///
    /// Returns how many methods were added. A method already present under
    /// the same key is replaced.
    pub fn register<S: Service>(
        &self,
        name: &str,
        service: Arc<S>,
        filter: Option<&NameFilter>,
    ) -> Result<usize> {
        if name.is_empty() {
            return Err(TandemError::Config {
                message: "service name is empty".to_string(),
            });
        }

        let mut registrar = Registrar::new(name, filter);
        service.register_methods(&mut registrar);

        let count = registrar.methods.len();
        let mut methods = self.methods.write().unwrap_or_else(PoisonError::into_inner);
        for (key, executor) in registrar.methods {
            debug!("Registered method {}", key);
            if methods.insert(key.clone(), executor).is_some() {
                warn!("Method {} registered twice, keeping the latest", key);
            }
        }

        Ok(count)
    }

    pub(crate) fn lookup(&self, method: &str) -> Option<Executor> {
        let methods = self.methods.read().unwrap_or_else(PoisonError::into_inner);
        methods.get(method).cloned()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.lookup(method).is_some()
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<String> {
        let methods = self.methods.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = methods.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codes;
    use serde_json::json;

    struct Calc;

    impl Calc {
        async fn add(&self, a: i64, b: i64) -> std::result::Result<i64, String> {
            Ok(a + b)
        }
    }

    impl Service for Calc {
        fn register_methods(self: Arc<Self>, registrar: &mut Registrar<'_>) {
            let this = Arc::clone(&self);
            registrar
                .method("Add", move |(a, b): (i64, i64)| {
                    let this = Arc::clone(&this);
                    async move { this.add(a, b).await }
                })
                .method_sync("Div", |(a, b): (i64, i64)| {
                    if b == 0 {
                        Err("division by zero")
                    } else {
                        Ok(a / b)
                    }
                })
                .method_sync("Ping", |()| Ok::<_, String>("pong"));
        }
    }

    async fn invoke(table: &MethodTable, method: &str, params: Vec<Value>) -> MethodResult {
        let executor = table.lookup(method).expect("method registered");
        executor(params).await
    }

    #[test]
    fn test_register_qualifies_names() {
        let table = MethodTable::new();
        assert_eq!(table.register("calc", Arc::new(Calc), None).unwrap(), 3);
        assert_eq!(table.names(), vec!["calc.Add", "calc.Div", "calc.Ping"]);
    }

    #[test]
    fn test_name_filter_applies() {
        let table = MethodTable::new();
        let lower: NameFilter = Arc::new(|name: &str| name.to_lowercase());
        table.register("calc", Arc::new(Calc), Some(&lower)).unwrap();
        assert!(table.contains("calc.add"));
        assert!(!table.contains("calc.Add"));
    }

    #[test]
    fn test_empty_service_name_rejected() {
        let table = MethodTable::new();
        assert!(matches!(
            table.register("", Arc::new(Calc), None),
            Err(TandemError::Config { .. })
        ));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_executor_decodes_positional_params() {
        let table = MethodTable::new();
        table.register("calc", Arc::new(Calc), None).unwrap();

        let sum = invoke(&table, "calc.Add", vec![json!(40), json!(2)]).await;
        assert_eq!(sum, Ok(json!(42)));

        // Trailing params are ignored.
        let sum = invoke(&table, "calc.Add", vec![json!(1), json!(2), json!("extra")]).await;
        assert_eq!(sum, Ok(json!(3)));

        let pong = invoke(&table, "calc.Ping", vec![]).await;
        assert_eq!(pong, Ok(json!("pong")));
    }

    #[tokio::test]
    async fn test_bad_params_are_invalid_params() {
        let table = MethodTable::new();
        table.register("calc", Arc::new(Calc), None).unwrap();

        let missing = invoke(&table, "calc.Add", vec![json!(1)]).await.unwrap_err();
        assert_eq!(missing.code, codes::INVALID_PARAMS);

        let wrong = invoke(&table, "calc.Add", vec![json!("one"), json!(2)]).await.unwrap_err();
        assert_eq!(wrong.code, codes::INVALID_PARAMS);
        assert!(wrong.message.starts_with("param 0"));
    }

    #[tokio::test]
    async fn test_method_error_is_handler_error() {
        let table = MethodTable::new();
        table.register("calc", Arc::new(Calc), None).unwrap();

        let err = invoke(&table, "calc.Div", vec![json!(1), json!(0)]).await.unwrap_err();
        assert_eq!(err.code, codes::HANDLER_RETURNED_ERROR);
        assert_eq!(err.message, "division by zero");
    }
}

//! Server: method registration, dispatch pipeline and TCP serving.

mod conn;
mod limit;
mod pipeline;
mod table;
mod tcp;

pub use conn::ResponseWriter;
pub use limit::{Limiter, RateLimiter};
pub use pipeline::{Admission, Handler, PanicGuard, Pipeline, Spawned};
pub use table::{Executor, FromParams, MethodResult, MethodTable, NameFilter, Registrar, Service};
pub use tcp::{Server, ServerHandle};

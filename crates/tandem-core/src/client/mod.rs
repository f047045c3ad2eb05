//! Client connection, response correlation and caller traits.

mod callbacks;
mod caller;
mod conn;

pub use callbacks::CallbackRegistry;
pub use caller::{factory_fn, Caller, CallerFactory, FnFactory, TcpCallerFactory};
pub use conn::{ClientConn, PendingCall};

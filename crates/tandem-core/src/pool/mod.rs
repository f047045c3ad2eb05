//! Client connection pooling.

mod round_robin;
mod slot;

pub use round_robin::ConnectionPool;
pub use slot::{LazySlot, VersionedCaller};

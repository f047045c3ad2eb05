//! Typed client stubs bound from descriptor structs.

mod binder;
mod descriptor;
mod sender;

pub use binder::{NameMapper, Stub, StubBinder};
pub use descriptor::{Descriptor, FieldVisitor};
pub use sender::{sender_fn, FnSender, Sender};

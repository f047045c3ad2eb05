//! Capability descriptors: structs whose fields are remote method stubs.
//!
//! A descriptor lists its RPC fields through [`Descriptor::describe`]. Fields
//! that are not stubs are simply not visited, so a descriptor may carry
//! auxiliary state alongside its stubs. The [`descriptor!`](crate::descriptor)
//! macro writes the struct and the `describe` body in one go:
//!
//! ```
//! use tandem_core::descriptor;
//!
//! descriptor! {
//!     pub struct ArithClient {
//!         pub add: fn((i64, i64)) -> i64,
//!         #[rpc = "Halve"]
//!         pub half: fn(f64) -> f64,
//!     }
//! }
//!
//! let client = ArithClient::default();
//! assert!(!client.add.is_bound());
//! ```

use super::binder::{Binding, NameMapper, Stub};
use super::sender::Sender;
use crate::cancel::CallContext;
use crate::error::TandemError;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// A struct whose stub fields can be bound to remote methods.
pub trait Descriptor {
    /// Visit every stub field, in declaration order.
    fn describe(&mut self, visitor: &mut FieldVisitor<'_>);
}

enum Mode<'a> {
    Validate,
    Bind {
        sender: &'a Arc<dyn Sender>,
        ctx: &'a CallContext,
        timeout: Duration,
    },
}

/// Walks a descriptor's stub fields on behalf of the binder.
pub struct FieldVisitor<'a> {
    service: &'a str,
    mapper: Option<&'a NameMapper>,
    mode: Mode<'a>,
    seen: HashSet<String>,
    error: Option<TandemError>,
}

impl<'a> FieldVisitor<'a> {
    pub(crate) fn validate(service: &'a str, mapper: Option<&'a NameMapper>) -> Self {
        Self::with_mode(service, mapper, Mode::Validate)
    }

    pub(crate) fn bind(
        service: &'a str,
        mapper: Option<&'a NameMapper>,
        sender: &'a Arc<dyn Sender>,
        ctx: &'a CallContext,
        timeout: Duration,
    ) -> Self {
        Self::with_mode(
            service,
            mapper,
            Mode::Bind {
                sender,
                ctx,
                timeout,
            },
        )
    }

    fn with_mode(service: &'a str, mapper: Option<&'a NameMapper>, mode: Mode<'a>) -> Self {
        Self {
            service,
            mapper,
            mode,
            seen: HashSet::new(),
            error: None,
        }
    }

    /// Visit one stub field.
    ///
    /// `rpc_name` overrides the remote method name; otherwise the binder's
    /// name mapper, or else the field name itself, is used.
    pub fn visit<A, R>(&mut self, field: &str, rpc_name: Option<&str>, stub: &mut Stub<A, R>) {
        if self.error.is_some() {
            return;
        }

        let name = match (rpc_name, self.mapper) {
            (Some(explicit), _) => explicit.to_string(),
            (None, Some(mapper)) => (**mapper)(field),
            (None, None) => field.to_string(),
        };
        if name.is_empty() {
            self.error = Some(TandemError::invalid_descriptor(format!(
                "field `{}` resolves to an empty method name",
                field
            )));
            return;
        }

        let method = format!("{}.{}", self.service, name);
        if !self.seen.insert(method.clone()) {
            self.error = Some(TandemError::invalid_descriptor(format!(
                "field `{}` duplicates remote method `{}`",
                field, method
            )));
            return;
        }

        if let Mode::Bind {
            sender,
            ctx,
            timeout,
        } = &self.mode
        {
            stub.set_binding(Binding {
                method,
                sender: Arc::clone(sender),
                base: (*ctx).clone(),
                timeout: *timeout,
            });
        }
    }

    pub(crate) fn finish(self) -> Result<usize, TandemError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.seen.len()),
        }
    }
}

/// Declare a descriptor struct of remote method stubs.
///
/// Each field is written `name: fn(Arg) -> Ret` and becomes a
/// `Stub<Arg, Ret>`. An optional `#[rpc = "Name"]` on a field sets the
/// remote method name explicitly.
#[macro_export]
macro_rules! descriptor {
    (@rpc) => { ::core::option::Option::None };
    (@rpc $rpc:literal) => { ::core::option::Option::Some($rpc) };
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[rpc = $rpc:literal])?
                $fvis:vis $field:ident : fn($arg:ty) -> $ret:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Default, Clone, Debug)]
        $vis struct $name {
            $( $fvis $field: $crate::stub::Stub<$arg, $ret>, )*
        }

        impl $crate::stub::Descriptor for $name {
            fn describe(&mut self, visitor: &mut $crate::stub::FieldVisitor<'_>) {
                $(
                    visitor.visit(
                        stringify!($field),
                        $crate::descriptor!(@rpc $($rpc)?),
                        &mut self.$field,
                    );
                )*
            }
        }
    };
}

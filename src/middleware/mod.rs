//! Middleware layer.
//!
//! Middleware decorates handlers with cross-cutting behavior. A
//! [`Middleware`] turns one [`BoxedHandler`] into another with the same
//! external contract; [`Router::layer`](crate::Router::layer) applies it to
//! every route registered so far.
//!
//! Built-in middleware:
//! - [`ClientClosedRequest`]: logs the in-flight trace of handlers whose
//!   client disconnected before they finished.

use std::fmt;
use std::sync::Arc;

use crate::handler::BoxedHandler;

pub mod client_closed_request;

pub use client_closed_request::ClientClosedRequest;

/// Decorates handlers.
pub trait Middleware {
    /// Returns a handler that behaves like `next` plus this middleware's
    /// side effects.
    #[track_caller]
    fn apply(&self, next: BoxedHandler) -> BoxedHandler;
}

/// Sink for diagnostics emitted by middleware.
///
/// Takes preformatted arguments so implementations decide whether and where
/// to render them. Implementations must not fail.
pub trait Logger: Send + Sync + 'static {
    fn info(&self, args: fmt::Arguments<'_>);
}

impl<L: Logger + ?Sized> Logger for Arc<L> {
    fn info(&self, args: fmt::Arguments<'_>) {
        (**self).info(args);
    }
}

/// Forwards to `tracing::info!` under the middleware's target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn info(&self, args: fmt::Arguments<'_>) {
        tracing::info!("{args}");
    }
}

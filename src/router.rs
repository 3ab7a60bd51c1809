//! Radix-tree request router.
//!
//! One tree per HTTP method. O(path-length) lookup. You register a path, you
//! get a handler; [`Router::layer`] decorates what is registered so far.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use matchit::Router as MatchitRouter;

use crate::handler::{BoxedHandler, Handler};
use crate::middleware::Middleware;

/// Outcome of a route lookup.
pub(crate) enum Route {
    Found(BoxedHandler, HashMap<String, String>),
    /// The path exists, but not for this method.
    MethodNotAllowed,
    NotFound,
}

/// The application router.
///
/// Build it once at startup; pass it to [`Server::serve`](crate::Server::serve).
/// Each registration returns `self` so calls chain naturally.
pub struct Router {
    // Trees map a path to an index into `handlers`, so middleware can
    // replace handlers without rebuilding the trees.
    trees: HashMap<Method, MatchitRouter<usize>>,
    handlers: Vec<BoxedHandler>,
}

impl Router {
    pub fn new() -> Self {
        Self { trees: HashMap::new(), handlers: Vec::new() }
    }

    /// Register a handler for a method + path pair.
    ///
    /// Path parameters use `{name}` syntax; `req.param("name")` retrieves them.
    ///
    /// # Panics
    ///
    /// Panics if `path` is not a valid route or conflicts with one already
    /// registered for `method`.
    pub fn on(mut self, method: Method, path: &str, handler: impl Handler) -> Self {
        let index = self.handlers.len();
        self.trees
            .entry(method)
            .or_default()
            .insert(path, index)
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
        self.handlers.push(handler.into_boxed_handler());
        self
    }

    /// Shorthand for [`Router::on`] with `GET`.
    pub fn get(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::GET, path, handler)
    }

    /// Decorates every handler registered so far with `middleware`. Routes
    /// added afterwards are not affected; later layers wrap earlier ones.
    #[track_caller]
    pub fn layer(mut self, middleware: impl Middleware) -> Self {
        for handler in &mut self.handlers {
            *handler = middleware.apply(Arc::clone(handler));
        }
        self
    }

    pub(crate) fn lookup(&self, method: &Method, path: &str) -> Route {
        if let Some(matched) = self.trees.get(method).and_then(|tree| tree.at(path).ok()) {
            let handler = Arc::clone(&self.handlers[*matched.value]);
            let params = matched.params.iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect();
            return Route::Found(handler, params);
        }

        if self.trees.values().any(|tree| tree.at(path).is_ok()) {
            Route::MethodNotAllowed
        } else {
            Route::NotFound
        }
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

//! Detects requests whose client went away before the handler finished.
//!
//! # Outcome race
//!
//! The wrapped handler runs on its own task while the calling task waits for
//! whichever comes first: the handler finishing, or the request's
//! [`Cancellation`] firing. Exactly one of two outcomes is recorded per
//! request:
//!
//! | First event | Outcome |
//! |---|---|
//! | handler finished | silent, the response is returned as is |
//! | cancellation | one diagnostic with the handler's live trace |
//!
//! `tokio::select!` alone does not decide the order: both events can already
//! be ready when it polls. The winner is settled by a compare-and-swap on
//! [`Outcome`]. The handler task claims completion only if cancellation had
//! not fired when the handler returned; the waiting side claims cancellation
//! when it sees the signal, or when the handler returned after the signal.
//!
//! In every case the decorated call returns only after the handler task has
//! finished. Cancellation never aborts the handler.
//!
//! # Diagnostic
//!
//! ```text
//! client closed request in GET /metrics:
//!     kube_trivy_exporter::trace::scope::{{closure}}
//!         src/telemetry.rs:58
//!     kube_trivy_exporter::telemetry::endpoint::{{closure}}
//!         src/main.rs:61
//!   - context canceled
//! ```
//!
//! # Panics
//!
//! A panic in the handler is resumed unchanged on the caller's task. A
//! handler that ends by panicking never produces a diagnostic unless the
//! cancellation had already been reported while it was still running.

use std::panic::{self, Location};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use http::{Method, StatusCode};
use tracing::warn;

use crate::cancel::{CancelError, Cancellation};
use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler, Handler, private};
use crate::middleware::{Logger, Middleware};
use crate::request::Request;
use crate::response::Response;
use crate::trace::{self, CapturedTrace, Frame, TaskStack};

/// Middleware that logs a diagnostic when a request is cancelled while its
/// handler is still running.
///
/// ```rust,no_run
/// use http::Method;
/// use kube_trivy_exporter::middleware::{ClientClosedRequest, TracingLogger};
/// use kube_trivy_exporter::{Request, Response, Router};
///
/// # async fn metrics(_: Request) -> Response { Response::text("") }
/// let app = Router::new()
///     .on(Method::GET, "/metrics", metrics)
///     .layer(ClientClosedRequest::new(TracingLogger));
/// ```
pub struct ClientClosedRequest<L> {
    logger: Arc<L>,
}

impl<L: Logger> ClientClosedRequest<L> {
    pub fn new(logger: L) -> Self {
        Self { logger: Arc::new(logger) }
    }

    /// Decorates a single handler. The caller's location becomes the entry
    /// frame of every trace this handler reports.
    #[track_caller]
    pub fn wrap(&self, next: impl Handler) -> Monitored<L> {
        Monitored {
            logger: Arc::clone(&self.logger),
            next: next.into_boxed_handler(),
            site: Location::caller(),
        }
    }
}

impl<L: Logger> Middleware for ClientClosedRequest<L> {
    #[track_caller]
    fn apply(&self, next: BoxedHandler) -> BoxedHandler {
        Arc::new(Monitored {
            logger: Arc::clone(&self.logger),
            next,
            site: Location::caller(),
        })
    }
}

/// A handler decorated by [`ClientClosedRequest`].
pub struct Monitored<L> {
    logger: Arc<L>,
    next: BoxedHandler,
    site: &'static Location<'static>,
}

impl<L: Logger> private::Sealed for Monitored<L> {}

impl<L: Logger> Handler for Monitored<L> {
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(self)
    }
}

impl<L: Logger> ErasedHandler for Monitored<L> {
    fn call(&self, req: Request) -> BoxFuture {
        let entry = Frame::new(self.next.name(), self.site);
        Box::pin(monitor(Arc::clone(&self.logger), Arc::clone(&self.next), entry, req))
    }

    fn name(&self) -> &'static str {
        self.next.name()
    }
}

// ── Outcome ───────────────────────────────────────────────────────────────────

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;

/// Single-winner flag deciding between a silent return and a diagnostic.
#[derive(Debug, Default)]
struct Outcome(AtomicU8);

impl Outcome {
    /// Records `winner` if nothing was recorded yet. Returns whether this
    /// call won.
    fn claim(&self, winner: u8) -> bool {
        self.0
            .compare_exchange(PENDING, winner, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// ── Monitor ───────────────────────────────────────────────────────────────────

async fn monitor<L: Logger>(
    logger: Arc<L>,
    next: BoxedHandler,
    entry: Frame,
    req: Request,
) -> Response {
    let method = req.method().clone();
    let path = req.path().to_owned();
    let signal = req.cancellation().clone();
    let stack = TaskStack::with_entry(entry);
    let outcome = Arc::new(Outcome::default());

    let mut task = tokio::spawn(trace::instrument(Arc::clone(&stack), {
        let signal = signal.clone();
        let outcome = Arc::clone(&outcome);
        async move {
            let response = next.call(req).await;
            if !signal.is_cancelled() {
                outcome.claim(COMPLETED);
            }
            response
        }
    }));

    let joined = tokio::select! {
        joined = &mut task => {
            // The handler may have returned after the signal fired; it left
            // the outcome unclaimed in that case.
            if joined.is_ok() && outcome.claim(CANCELLED) {
                report(&*logger, &method, &path, &stack.snapshot(), &signal);
            }
            joined
        }
        () = signal.cancelled() => {
            if outcome.claim(CANCELLED) {
                report(&*logger, &method, &path, &stack.snapshot(), &signal);
            }
            task.await
        }
    };

    match joined {
        Ok(response) => response,
        Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
        Err(e) => {
            // Only reachable when the runtime shuts down under the handler.
            warn!(%method, %path, "handler task did not finish: {e}");
            Response::status(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

fn report<L: Logger + ?Sized>(
    logger: &L,
    method: &Method,
    path: &str,
    trace: &CapturedTrace,
    signal: &Cancellation,
) {
    let cause = signal.cause().unwrap_or(CancelError::Canceled);
    logger.info(format_args!("client closed request in {method} {path}:\n{trace}  - {cause}\n"));
}

#[cfg(test)]
mod tests {
    use std::fmt;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Logger for Recorder {
        fn info(&self, args: fmt::Arguments<'_>) {
            self.0.lock().unwrap().push(args.to_string());
        }
    }

    async fn noop(_req: Request) -> Response {
        Response::text("done")
    }

    #[test]
    fn outcome_has_a_single_winner() {
        let outcome = Outcome::default();
        assert!(outcome.claim(COMPLETED));
        assert!(!outcome.claim(CANCELLED));
        assert!(!outcome.claim(COMPLETED));
    }

    #[test]
    fn report_renders_trace_and_cause() {
        let recorder = Recorder::default();
        let location = Location::caller();
        let stack = TaskStack::with_entry(Frame::new("handler", location));
        let signal = Cancellation::new();
        signal.cancel_with(CancelError::DeadlineExceeded);

        report(&recorder, &Method::POST, "/scan", &stack.snapshot(), &signal);

        let logs = recorder.0.lock().unwrap();
        assert_eq!(
            logs[0],
            format!(
                "client closed request in POST /scan:\n    handler\n        {}:{}\n  - context deadline exceeded\n",
                location.file(),
                location.line()
            )
        );
    }

    #[tokio::test]
    async fn decorated_handler_keeps_its_name() {
        let middleware = ClientClosedRequest::new(Recorder::default());
        let handler = middleware.wrap(noop).into_boxed_handler();
        assert!(handler.name().ends_with("noop"));
        let res = handler.call(Request::new(Method::GET, "/")).await;
        assert_eq!(res.body(), b"done");
    }
}

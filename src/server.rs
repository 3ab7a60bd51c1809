//! HTTP server and graceful shutdown.
//!
//! # Request cancellation
//!
//! hyper drops a request's service future when the client connection goes
//! away. Each request is therefore dispatched on its own task, and the hyper
//! future only holds a [`CancelOnDrop`](crate::CancelOnDrop) guard plus the
//! receiving end of the task's reply. A drop fires the request's
//! [`Cancellation`] with `context canceled` while the handler keeps running
//! to completion on its task. With [`Server::request_timeout`] set, a request
//! that outlives the deadline is cancelled with `context deadline exceeded`
//! and answered with `504 Gateway Timeout`.
//!
//! A handler that outlives its response keeps running on a tracked task. Its
//! panics are still logged, and shutdown waits for it.
//!
//! # Graceful shutdown and Kubernetes
//!
//! When Kubernetes terminates a pod it sends **SIGTERM** and waits
//! `terminationGracePeriodSeconds` (default 30 s) before sending SIGKILL.
//!
//! The server reacts by:
//! 1. Immediately stopping `listener.accept()`; no new connections are made.
//! 2. Asking every open connection to finish its in-flight request and close.
//! 3. Waiting for handlers whose clients already left.
//! 4. Returning from [`Server::serve`], which lets `main` exit cleanly.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::cancel::{CancelError, Cancellation};
use crate::error::Error;
use crate::handler::BoxFuture;
use crate::request::Request;
use crate::response::Response;
use crate::router::{Route, Router};

enum Bind {
    Addr(SocketAddr),
    Listener(TcpListener),
}

/// The HTTP server.
pub struct Server {
    bind: Bind,
    request_timeout: Option<Duration>,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    pub fn bind(addr: SocketAddr) -> Self {
        Self { bind: Bind::Addr(addr), request_timeout: None }
    }

    /// Serves on an already bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self { bind: Bind::Listener(listener), request_timeout: None }
    }

    /// Cancels requests still running after `timeout` and answers them with
    /// `504 Gateway Timeout`.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Starts accepting connections and dispatching them through `router`.
    ///
    /// Returns only after a full graceful shutdown (SIGTERM or Ctrl-C,
    /// followed by all in-flight requests completing).
    pub async fn serve(self, router: Router) -> Result<(), Error> {
        self.serve_with_shutdown(router, shutdown_signal()).await
    }

    /// Like [`serve`](Server::serve), but stops when `shutdown` resolves.
    pub async fn serve_with_shutdown<F>(self, router: Router, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let listener = match self.bind {
            Bind::Addr(addr) => TcpListener::bind(addr).await?,
            Bind::Listener(listener) => listener,
        };
        let addr = listener.local_addr()?;
        let router = Arc::new(router);
        let request_timeout = self.request_timeout;

        info!(%addr, "kube-trivy-exporter listening");

        let mut tasks = tokio::task::JoinSet::new();
        // Handler tasks, which may outlive their connection.
        let requests = TaskTracker::new();
        // Flipped once on shutdown; every connection task watches it.
        let (draining_tx, draining_rx) = watch::channel(false);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Check shutdown first so a SIGTERM stops accepting at once,
                // even if more connections are queued.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let router = Arc::clone(&router);
                    let requests = requests.clone();
                    let mut draining = draining_rx.clone();
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        // Called once per request on the connection.
                        let svc = service_fn(move |req| {
                            dispatch(Arc::clone(&router), requests.clone(), req, request_timeout)
                        });

                        // `auto::Builder` serves HTTP/1.1 and HTTP/2 alike.
                        let builder = ConnBuilder::new(TokioExecutor::new());
                        let conn = builder.serve_connection(io, svc);
                        tokio::pin!(conn);

                        let res = tokio::select! {
                            res = conn.as_mut() => res,
                            _ = draining.changed() => {
                                conn.as_mut().graceful_shutdown();
                                conn.await
                            }
                        };
                        if let Err(e) = res {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connection tasks so the JoinSet does not grow
                // without bound on long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        let _ = draining_tx.send(true);
        while tasks.join_next().await.is_some() {}

        requests.close();
        if !requests.is_empty() {
            info!(handlers = requests.len(), "waiting for abandoned handlers");
        }
        requests.wait().await;

        info!("kube-trivy-exporter stopped");
        Ok(())
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Routes one request and produces one response.
///
/// The error type is [`Infallible`]: every failure becomes a status code, so
/// hyper never sees an error.
async fn dispatch(
    router: Arc<Router>,
    requests: TaskTracker,
    req: hyper::Request<Incoming>,
    request_timeout: Option<Duration>,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let cancellation = Cancellation::new();
    // Dropped by hyper together with this future if the client goes away.
    let guard = cancellation.cancel_on_drop();

    let (handler, params) = match router.lookup(req.method(), req.uri().path()) {
        Route::Found(handler, params) => (handler, params),
        Route::MethodNotAllowed => return Ok(Response::status(StatusCode::METHOD_NOT_ALLOWED).into_hyper()),
        Route::NotFound => return Ok(Response::status(StatusCode::NOT_FOUND).into_hyper()),
    };

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("failed to read request body: {e}");
            guard.disarm();
            return Ok(Response::status(StatusCode::BAD_REQUEST).into_hyper());
        }
    };

    let method = parts.method.clone();
    let path = parts.uri.path().to_owned();
    let request = Request::from_parts(parts, body, params, cancellation.clone());
    let (reply, mut reply_rx) = oneshot::channel();
    requests.spawn(supervise(handler.call(request), method.clone(), path.clone(), reply));

    let replied = match request_timeout {
        Some(timeout) => tokio::select! {
            replied = &mut reply_rx => replied,
            () = tokio::time::sleep(timeout) => {
                cancellation.cancel_with(CancelError::DeadlineExceeded);
                guard.disarm();
                debug!(%method, %path, ?timeout, "request deadline exceeded");
                return Ok(Response::status(StatusCode::GATEWAY_TIMEOUT).into_hyper());
            }
        },
        None => reply_rx.await,
    };
    guard.disarm();

    let response = replied.unwrap_or_else(|_| {
        error!(%method, %path, "handler task dropped without a response");
        Response::status(StatusCode::INTERNAL_SERVER_ERROR)
    });
    Ok(response.into_hyper())
}

/// Runs `handler` on its own task and sends its response on `reply`.
///
/// Handler panics end here as a `500`, whether or not anyone still waits for
/// the reply.
async fn supervise(
    handler: BoxFuture,
    method: Method,
    path: String,
    reply: oneshot::Sender<Response>,
) {
    let response = match tokio::spawn(handler).await {
        Ok(response) => response,
        Err(e) if e.is_panic() => {
            error!(%method, %path, "handler panicked");
            Response::status(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(e) => {
            error!(%method, %path, "handler task failed: {e}");
            Response::status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    };
    // The receiver is gone after a deadline or a disconnect.
    let _ = reply.send(response);
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** (sent by the Kubernetes control
/// plane) and **SIGINT** (Ctrl-C, for local dev). If a handler cannot be
/// installed, that signal is logged and ignored.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    // `pending()` never resolves; on non-Unix platforms the SIGTERM arm is
    // effectively disabled.
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}

//! # kube-trivy-exporter
//!
//! Scans container images with [trivy](https://trivy.dev) and exposes the
//! findings to Prometheus.
//!
//! ## The pieces
//!
//! - [`collector`]: periodic scans with bounded concurrency, published as
//!   gauges through the [`metrics`] facade
//! - [`trivy`]: runs the trivy binary and decodes its JSON report
//! - A small HTTP stack on hyper: [`Router`], [`Request`], [`Response`],
//!   [`Server`] with graceful shutdown and per-request [`Cancellation`]
//! - [`middleware::ClientClosedRequest`]: logs the in-flight [`trace`] of
//!   handlers whose client disconnected before they finished
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use kube_trivy_exporter::middleware::{ClientClosedRequest, TracingLogger};
//! use kube_trivy_exporter::{Router, Server, health, telemetry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), kube_trivy_exporter::Error> {
//!     let metrics = telemetry::install()?;
//!     let app = Router::new()
//!         .get("/metrics", telemetry::endpoint(metrics))
//!         .get("/healthz", health::liveness)
//!         .layer(ClientClosedRequest::new(TracingLogger));
//!
//!     Server::bind("0.0.0.0:9217".parse().unwrap()).serve(app).await
//! }
//! ```

mod cancel;
mod error;
mod handler;
mod request;
mod response;
mod router;
mod server;

pub mod collector;
pub mod config;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod telemetry;
pub mod trace;
pub mod trivy;

pub use cancel::{CancelError, CancelOnDrop, Cancellation};
pub use error::Error;
pub use handler::{BoxFuture, BoxedHandler, ErasedHandler, Handler};
pub use request::Request;
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use router::Router;
pub use server::Server;

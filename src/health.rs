//! Kubernetes health-check handlers.
//!
//! | Probe | Path | Question |
//! |---|---|---|
//! | **Liveness** | `/healthz` | Is the process alive? Failure → restart. |
//! | **Readiness** | `/readyz` | Has the first collection finished? Failure → pulled from load-balancer. |
//!
//! A fresh pod has no findings yet; reporting ready before the first
//! collection would let Prometheus scrape an empty exporter and record every
//! series as absent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use http::StatusCode;

use crate::handler::Handler;
use crate::request::Request;
use crate::response::Response;

/// Kubernetes liveness probe handler.
///
/// Always returns `200 OK` with body `"ok"`. If the process can respond to
/// HTTP at all, it is alive.
pub async fn liveness(_req: Request) -> Response {
    Response::text("ok")
}

/// Readiness flag shared between the collector and the `/readyz` handler.
#[derive(Clone, Debug, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Kubernetes readiness probe handler: `200 "ready"` once
    /// [`mark_ready`](Readiness::mark_ready) was called, `503` before.
    pub fn handler(&self) -> impl Handler {
        let readiness = self.clone();
        move |_req: Request| {
            let ready = readiness.is_ready();
            async move {
                if ready {
                    Response::text("ready")
                } else {
                    Response::status(StatusCode::SERVICE_UNAVAILABLE)
                }
            }
        }
    }
}

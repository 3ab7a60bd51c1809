//! Prometheus metrics.
//!
//! The recorder is installed once per process; the exporter's own HTTP server
//! renders it on `/metrics`, so scrapes go through the same router and
//! middleware as every other route.

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::error::Error;
use crate::handler::Handler;
use crate::request::Request;
use crate::response::{ContentType, Response};
use crate::trace;

/// Findings per image, target, package and vulnerability.
pub const VULNERABILITIES: &str = "trivy_vulnerabilities";
/// Findings per image and severity.
pub const IMAGE_VULNERABILITIES: &str = "trivy_image_vulnerabilities";
/// Failed scans per image.
pub const SCAN_ERRORS: &str = "trivy_scan_errors_total";
/// Wall-clock time of one image scan.
pub const SCAN_DURATION: &str = "trivy_scan_duration_seconds";

/// Installs the global Prometheus recorder and registers metric
/// descriptions.
///
/// # Errors
///
/// Fails if a global recorder is already installed.
pub fn install() -> Result<PrometheusHandle, Error> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_all();
    info!("prometheus recorder installed");
    Ok(handle)
}

fn describe_all() {
    describe_gauge!(VULNERABILITIES, "Vulnerabilities found by trivy, one series per finding.");
    describe_gauge!(IMAGE_VULNERABILITIES, "Vulnerabilities found by trivy, by image and severity.");
    describe_counter!(SCAN_ERRORS, "Trivy scans that failed.");
    describe_histogram!(SCAN_DURATION, Unit::Seconds, "Duration of one trivy image scan.");
}

/// Handler rendering `handle` in the Prometheus text format.
pub fn endpoint(handle: PrometheusHandle) -> impl Handler {
    move |_req: Request| {
        let handle = handle.clone();
        trace::scope("kube_trivy_exporter::telemetry::render", async move {
            Response::builder().bytes(ContentType::Prometheus, handle.render())
        })
    }
}

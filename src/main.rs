use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kube_trivy_exporter::collector::{Collector, StaticImages};
use kube_trivy_exporter::config::Config;
use kube_trivy_exporter::health::{self, Readiness};
use kube_trivy_exporter::middleware::{ClientClosedRequest, TracingLogger};
use kube_trivy_exporter::trivy::{CommandExecutor, TrivyClient};
use kube_trivy_exporter::{Router, Server, logging, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    config.validate()?;
    logging::init(&config.log_level, config.log_format)?;

    let metrics = telemetry::install().context("failed to install metrics recorder")?;
    let readiness = Readiness::default();

    if config.images.is_empty() {
        tracing::warn!("no images configured; the exporter will publish no findings");
    }
    info!(images = config.images.len(), trivy = %config.trivy_path, "starting collector");

    let collector = Collector::new(
        TrivyClient::new(CommandExecutor, config.trivy_path.clone()),
        StaticImages::new(config.images.clone()),
        config.collector(),
        readiness.clone(),
    );
    let shutdown = CancellationToken::new();
    let collecting = tokio::spawn(collector.run(shutdown.clone()));

    let app = Router::new()
        .get("/metrics", telemetry::endpoint(metrics))
        .get("/healthz", health::liveness)
        .get("/readyz", readiness.handler())
        .layer(ClientClosedRequest::new(TracingLogger));

    let mut server = Server::bind(config.listen);
    if let Some(timeout) = config.request_timeout() {
        server = server.request_timeout(timeout);
    }
    let served = server.serve(app).await;

    shutdown.cancel();
    collecting.await.context("collector task failed")?;
    served.context("server failed")?;
    Ok(())
}

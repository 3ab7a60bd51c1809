//! Periodic vulnerability collection.
//!
//! Every interval the [`Collector`] asks its [`ImageSource`] for images,
//! scans them with bounded concurrency and publishes the findings as
//! Prometheus gauges. A series that disappears between two collections is set
//! to `0`, since the recorder cannot delete series. An image whose scan fails
//! keeps its previous findings until a later scan succeeds.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::health::Readiness;
use crate::telemetry::{IMAGE_VULNERABILITIES, SCAN_DURATION, SCAN_ERRORS, VULNERABILITIES};
use crate::trivy::{Executor, TrivyClient, TrivyError, TrivyResponse};

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("image source error: {0}")]
    Source(String),
}

/// Supplies the images to scan.
pub trait ImageSource: Send + Sync + 'static {
    fn images(&self) -> impl Future<Output = Result<Vec<String>, CollectorError>> + Send;
}

/// A fixed list of images.
#[derive(Clone, Debug, Default)]
pub struct StaticImages(Vec<String>);

impl StaticImages {
    pub fn new(images: Vec<String>) -> Self {
        Self(images)
    }
}

impl ImageSource for StaticImages {
    async fn images(&self) -> Result<Vec<String>, CollectorError> {
        Ok(self.0.clone())
    }
}

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    /// Time between the starts of two collections.
    pub interval: Duration,
    /// Maximum number of trivy processes running at once.
    pub concurrency: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            concurrency: 10,
        }
    }
}

/// Labels of one `trivy_vulnerabilities` series, minus the image.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Finding {
    pub target: String,
    pub vulnerability_id: String,
    pub pkg_name: String,
    pub installed_version: String,
    pub fixed_version: String,
    pub severity: String,
}

/// Findings of one image.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImageReport {
    pub findings: BTreeMap<Finding, u64>,
    pub severities: BTreeMap<String, u64>,
}

impl ImageReport {
    fn from_responses(responses: Vec<TrivyResponse>) -> Self {
        let mut report = Self::default();
        for response in responses {
            for vuln in response.vulnerabilities {
                *report.severities.entry(vuln.severity.clone()).or_default() += 1;
                let finding = Finding {
                    target: response.target.clone(),
                    vulnerability_id: vuln.vulnerability_id,
                    pkg_name: vuln.pkg_name,
                    installed_version: vuln.installed_version,
                    fixed_version: vuln.fixed_version,
                    severity: vuln.severity,
                };
                *report.findings.entry(finding).or_default() += 1;
            }
        }
        report
    }
}

/// Counts from one collection, for logging.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CollectionSummary {
    pub scanned: usize,
    pub failed: usize,
    pub findings: u64,
}

/// Scans images and publishes their findings.
pub struct Collector<E, S> {
    client: Arc<TrivyClient<E>>,
    source: S,
    config: CollectorConfig,
    readiness: Readiness,
    published: BTreeMap<String, ImageReport>,
}

impl<E: Executor, S: ImageSource> Collector<E, S> {
    pub fn new(client: TrivyClient<E>, source: S, config: CollectorConfig, readiness: Readiness) -> Self {
        Self {
            client: Arc::new(client),
            source,
            config,
            readiness,
            published: BTreeMap::new(),
        }
    }

    /// Findings as of the last collection, by image.
    pub fn published(&self) -> &BTreeMap<String, ImageReport> {
        &self.published
    }

    /// Runs one collection and publishes its results.
    pub async fn collect(&mut self) -> Result<CollectionSummary, CollectorError> {
        let images: BTreeSet<String> = self.source.images().await?.into_iter().collect();
        let concurrency = self.config.concurrency.max(1);
        debug!(images = images.len(), concurrency, "collection started");

        let mut summary = CollectionSummary::default();
        let mut reports = BTreeMap::new();
        let mut scans = JoinSet::new();

        for image in images {
            if scans.len() >= concurrency {
                if let Some(joined) = scans.join_next().await {
                    self.record(joined, &mut reports, &mut summary);
                }
            }
            let client = Arc::clone(&self.client);
            scans.spawn(async move {
                let started = Instant::now();
                let result = client.scan(&image).await;
                histogram!(SCAN_DURATION, "image" => image.clone()).record(started.elapsed().as_secs_f64());
                (image, result)
            });
        }
        while let Some(joined) = scans.join_next().await {
            self.record(joined, &mut reports, &mut summary);
        }

        summary.findings = reports.values().flat_map(|r| r.findings.values()).sum();
        publish(&self.published, &reports);
        self.published = reports;
        Ok(summary)
    }

    fn record(
        &self,
        joined: Result<(String, Result<Vec<TrivyResponse>, TrivyError>), JoinError>,
        reports: &mut BTreeMap<String, ImageReport>,
        summary: &mut CollectionSummary,
    ) {
        match joined {
            Ok((image, Ok(responses))) => {
                summary.scanned += 1;
                reports.insert(image, ImageReport::from_responses(responses));
            }
            Ok((image, Err(e))) => {
                summary.failed += 1;
                warn!(%image, "scan failed: {e}");
                counter!(SCAN_ERRORS, "image" => image.clone()).increment(1);
                if let Some(previous) = self.published.get(&image) {
                    reports.insert(image, previous.clone());
                }
            }
            Err(e) => {
                summary.failed += 1;
                error!("scan task failed: {e}");
            }
        }
    }

    /// Collects every interval until `shutdown` fires. Marks the exporter
    /// ready after the first successful collection.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                result = self.collect() => match result {
                    Ok(summary) => {
                        info!(
                            scanned = summary.scanned,
                            failed = summary.failed,
                            findings = summary.findings,
                            "collection finished"
                        );
                        self.readiness.mark_ready();
                    }
                    Err(e) => error!("collection failed: {e}"),
                },
            }
        }
        info!("collector stopped");
    }
}

fn vulnerability_gauge(image: &str, finding: &Finding) -> metrics::Gauge {
    gauge!(
        VULNERABILITIES,
        "image" => image.to_owned(),
        "target" => finding.target.clone(),
        "vulnerability_id" => finding.vulnerability_id.clone(),
        "pkg_name" => finding.pkg_name.clone(),
        "installed_version" => finding.installed_version.clone(),
        "fixed_version" => finding.fixed_version.clone(),
        "severity" => finding.severity.clone()
    )
}

fn severity_gauge(image: &str, severity: &str) -> metrics::Gauge {
    gauge!(IMAGE_VULNERABILITIES, "image" => image.to_owned(), "severity" => severity.to_owned())
}

/// Sets every current series and zeroes the ones that vanished since
/// `previous`.
fn publish(previous: &BTreeMap<String, ImageReport>, current: &BTreeMap<String, ImageReport>) {
    let empty = ImageReport::default();

    for (image, report) in current {
        for (finding, count) in &report.findings {
            vulnerability_gauge(image, finding).set(*count as f64);
        }
        for (severity, count) in &report.severities {
            severity_gauge(image, severity).set(*count as f64);
        }
    }

    for (image, old) in previous {
        let new = current.get(image).unwrap_or(&empty);
        for finding in old.findings.keys().filter(|f| !new.findings.contains_key(*f)) {
            vulnerability_gauge(image, finding).set(0.0);
        }
        for severity in old.severities.keys().filter(|s| !new.severities.contains_key(*s)) {
            severity_gauge(image, severity).set(0.0);
        }
    }
}

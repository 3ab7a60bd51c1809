//! Command-line and environment configuration.
//!
//! Every flag has a `KUBE_TRIVY_EXPORTER_*` environment variable so the
//! exporter can be configured from a pod spec without arguments.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::collector::CollectorConfig;
use crate::logging::LogFormat;

/// Configuration errors caught by [`Config::validate`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config error: {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Prometheus exporter that scans container images with trivy.
#[derive(Clone, Debug, Parser)]
#[command(name = "kube-trivy-exporter", version, about, long_about = None)]
pub struct Config {
    /// Address the HTTP server listens on.
    #[arg(long, env = "KUBE_TRIVY_EXPORTER_LISTEN", default_value = "0.0.0.0:9217")]
    pub listen: SocketAddr,

    /// Path or name of the trivy binary.
    #[arg(long, env = "KUBE_TRIVY_EXPORTER_TRIVY_PATH", default_value = "trivy")]
    pub trivy_path: String,

    /// Maximum number of concurrent trivy scans.
    #[arg(long, env = "KUBE_TRIVY_EXPORTER_TRIVY_CONCURRENCY", default_value_t = 10)]
    pub trivy_concurrency: usize,

    /// Seconds between the starts of two collections.
    #[arg(long, env = "KUBE_TRIVY_EXPORTER_COLLECTOR_INTERVAL_SECS", default_value_t = 3600)]
    pub collector_interval_secs: u64,

    /// Image to scan. Repeat the flag or separate with commas.
    #[arg(long = "image", env = "KUBE_TRIVY_EXPORTER_IMAGES", value_delimiter = ',')]
    pub images: Vec<String>,

    /// Cancel HTTP requests running longer than this many seconds.
    #[arg(long, env = "KUBE_TRIVY_EXPORTER_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    /// Log level or filter directive; `RUST_LOG` takes precedence.
    #[arg(long, env = "KUBE_TRIVY_EXPORTER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "KUBE_TRIVY_EXPORTER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trivy_concurrency == 0 {
            return Err(invalid("trivy_concurrency", "must be at least 1"));
        }
        if self.collector_interval_secs == 0 {
            return Err(invalid("collector_interval_secs", "must be at least 1"));
        }
        if self.request_timeout_secs == Some(0) {
            return Err(invalid("request_timeout_secs", "must be at least 1 when set"));
        }
        if self.trivy_path.trim().is_empty() {
            return Err(invalid("trivy_path", "must not be empty"));
        }
        if let Some(image) = self.images.iter().find(|i| i.trim().is_empty()) {
            return Err(invalid("image", format!("empty image reference in {image:?}")));
        }
        Ok(())
    }

    pub fn collector(&self) -> CollectorConfig {
        CollectorConfig {
            interval: Duration::from_secs(self.collector_interval_secs),
            concurrency: self.trivy_concurrency,
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("kube-trivy-exporter").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.listen, "0.0.0.0:9217".parse().unwrap());
        assert_eq!(config.trivy_path, "trivy");
        assert_eq!(config.trivy_concurrency, 10);
        assert_eq!(config.collector().interval, Duration::from_secs(3600));
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn images_accept_repeats_and_commas() {
        let config = parse(&["--image", "nginx:1.25,alpine:3.19", "--image", "redis:7"]);
        assert_eq!(config.images, ["nginx:1.25", "alpine:3.19", "redis:7"]);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = parse(&["--trivy-concurrency", "0"]).validate().unwrap_err();
        assert_eq!(err.to_string(), "config error: trivy_concurrency: must be at least 1");
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(parse(&["--request-timeout-secs", "0"]).validate().is_err());
        assert_eq!(
            parse(&["--request-timeout-secs", "30"]).request_timeout(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn json_log_format() {
        assert_eq!(parse(&["--log-format", "json"]).log_format, LogFormat::Json);
    }
}

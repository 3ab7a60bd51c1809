//! Unified error type.

/// The error type returned by the exporter's infrastructure operations.
///
/// Application-level failures (404, 503, etc.) are expressed as HTTP
/// [`Response`](crate::Response) values, not as `Error`s. This type surfaces
/// process-level failures: binding a port, installing the metrics recorder,
/// setting up logging.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("invalid log filter: {0}")]
    LogFilter(#[from] tracing_subscriber::filter::ParseError),

    #[error("logging already initialized: {0}")]
    LogInit(#[from] tracing_subscriber::util::TryInitError),
}

//! Trivy client.
//!
//! Runs the `trivy` binary against one image and decodes its JSON report.
//! Process execution sits behind the [`Executor`] trait so the client can be
//! driven by canned output in tests.

use std::future::Future;
use std::io;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

mod types;

pub use types::{TrivyResponse, TrivyVulnerability, parse_report};

/// Errors returned by [`TrivyClient::scan`].
#[derive(Debug, thiserror::Error)]
pub enum TrivyError {
    #[error("could not execute trivy command: {0}")]
    Execute(#[source] io::Error),

    #[error("could not parse trivy response: {0}")]
    Parse(#[source] serde_json::Error),
}

/// Runs a program and returns its standard output.
pub trait Executor: Send + Sync + 'static {
    fn execute(
        &self,
        program: &str,
        args: &[&str],
    ) -> impl Future<Output = io::Result<Vec<u8>>> + Send;
}

/// [`Executor`] backed by `tokio::process`. A non-zero exit status is an
/// error carrying the program's stderr.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommandExecutor;

impl Executor for CommandExecutor {
    async fn execute(&self, program: &str, args: &[&str]) -> io::Result<Vec<u8>> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(io::Error::other(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// Scans images with trivy.
#[derive(Debug)]
pub struct TrivyClient<E> {
    executor: E,
    program: String,
}

impl<E: Executor> TrivyClient<E> {
    pub fn new(executor: E, program: impl Into<String>) -> Self {
        Self { executor, program: program.into() }
    }

    /// Scans `image` and returns one entry per scanned target.
    pub async fn scan(&self, image: &str) -> Result<Vec<TrivyResponse>, TrivyError> {
        let args = ["--quiet", "image", "--format", "json", image];
        debug!(program = %self.program, image, "running trivy");

        let output = self
            .executor
            .execute(&self.program, &args)
            .await
            .map_err(TrivyError::Execute)?;
        parse_report(&output).map_err(TrivyError::Parse)
    }
}

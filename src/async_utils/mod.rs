//! Asynchronous utilities for use with Tokio.
//!
//! The pipeline is a set of tasks connected by queues. The plumbing that makes
//! that pleasant (worker handles, blocking-pool helpers, external command
//! checks, cancellation) lives here.

use std::{pin::Pin, process::Output, sync::LazyLock};

use regex::Regex;
use tokio::task::JoinHandle;

use crate::prelude::*;

pub mod cancel;
pub mod io;

/// A type alias for a boxed future. This is used to make it easier to work
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A handle for a background worker. This can be awaited to wait for the
/// worker to complete normally.
pub struct JoinWorker {
    future: BoxedFuture<Result<()>>,
}

impl JoinWorker {
    /// Create a new worker handle from a [`JoinHandle`].
    pub fn from_handle(handle: JoinHandle<Result<()>>) -> Self {
        Self {
            future: Box::pin(async move { handle.await.context("could not join task")? }),
        }
    }

    /// Wait for the worker to complete.
    pub async fn join(self) -> Result<()> {
        self.future.await
    }
}

/// Run a blocking function on Tokio's blocking pool, re-raising any panic in
/// the calling task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        // Blocking tasks are only cancelled when the runtime shuts down.
        Err(err) => panic!("blocking task failed: {err}"),
    }
}

static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Poppler reports damaged cross-reference tables as errors, but recovers.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line of command output describe a real error?
pub fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Report any command failures, and include any error output.
///
/// Standard output and standard error are logged. If `error_line` is given,
/// a command that exits successfully but prints a matching line to standard
/// error is still treated as failed.
pub fn check_for_command_failure(
    command_name: &str,
    output: &Output,
    error_line: Option<&dyn Fn(&str) -> bool>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(command_name, output = %stdout, "Standard output from command");
    if !stderr.trim().is_empty() {
        warn!(command_name, output = %stderr, "Standard error from command");
    }

    if output.status.success() {
        if let Some(error_line) = error_line
            && stderr.lines().any(error_line)
        {
            return Err(anyhow!("{} printed error output:\n{}", command_name, stderr));
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!("{} failed with error output:\n{}", command_name, stderr))
    }
}

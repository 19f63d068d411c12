//! Progress bars, and a stderr writer that plays nicely with them.
//!
//! The stderr writer is adapted from `substudy` by Eric Kidd, which is
//! licensed under Apache-2.0 OR MIT. Used with permission.

use std::{borrow::Cow, io, sync::Arc, time::Duration};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::pipeline::{IngestOutcome, IngestStatus};

/// Application UI state.
#[derive(Clone)]
pub struct Ui {
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    pub fn init() -> Ui {
        Ui {
            multi_progress: Arc::new(MultiProgress::new()),
        }
    }

    /// Hide all our progress bars completely, for when we're writing actual
    /// output to `stdout`.
    pub fn hide_progress_bars(&self) {
        self.multi_progress
            .set_draw_target(ProgressDrawTarget::hidden());
    }

    /// Get a writer that can be used to write to stderr, for use with
    /// `tracing`.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// Create a progress bar counting documents.
    pub fn new_document_progress_bar(&self, len: usize) -> ProgressBar {
        let pb = ProgressBar::new(len as u64).with_style(progress_style());
        let pb = self.multi_progress.add(pb);
        pb.set_prefix("📄");
        pb.set_message("Ingesting documents");
        pb.enable_steady_tick(Duration::from_millis(250));
        pb.with_finish(indicatif::ProgressFinish::WithMessage(Cow::Borrowed(
            "Ingested documents",
        )))
    }

    /// Print a one-line summary of an ingestion run, without disturbing any
    /// progress bars.
    pub fn print_summary(&self, summary: &IngestSummary) {
        self.multi_progress
            .suspend(|| eprintln!("{summary}"));
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {prefix:3}{msg:25} {pos:>4}/{len:4} {elapsed_precise} {wide_bar:.cyan/blue} {eta_precise}")
        .expect("bad progress bar template")
}

/// Counts of ingestion outcomes by status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub ingested: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl IngestSummary {
    pub fn from_outcomes(outcomes: &[IngestOutcome]) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            match outcome.status {
                IngestStatus::Ingested => summary.ingested += 1,
                IngestStatus::Skipped => summary.skipped += 1,
                IngestStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

impl std::fmt::Display for IngestSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ingested, {} skipped, {} failed",
            self.ingested, self.skipped, self.failed
        )
    }
}

/// A writer which can be used to write to `stderr`. It hides and shows
/// progress bars as needed, so that they don't interfere with the output.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.multi_progress.suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.multi_progress.suspend(|| io::stderr().flush())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui.multi_progress.suspend(|| io::stderr().write_all(buf))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

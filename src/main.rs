use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{async_utils::cancel::CancelSignal, prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod cpu_limit;
mod dedup;
mod error;
mod index;
mod model;
mod normalize;
mod pipeline;
mod prelude;
mod rasterize;
mod rate_limit;
mod recognize;
mod retry;
mod search;
mod storage;
#[cfg(test)]
mod testing;
mod ui;

/// Recognize text in PDFs and images, and search it.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OCR_INDEXER_DATABASE (optional): The SQLite database to use.
  - GOOGLE_VISION_API_KEY: The Google Cloud Vision key to use.
  - GOOGLE_VISION_API_BASE (optional): Override the Vision server URL.

  Standard AWS environment variables and credential files
  are used for `--engine textract`.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    /// The SQLite database holding the index.
    #[clap(
        long,
        global = true,
        env = "OCR_INDEXER_DATABASE",
        default_value = "ocr-index.db"
    )]
    database: String,

    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Recognize documents and store their text.
    Ingest(cmd::ingest::IngestOpts),
    /// Delete a document and its text.
    Delete(cmd::documents::DocumentOpts),
    /// Check whether a document has been ingested.
    Exists(cmd::documents::DocumentOpts),
    /// List the documents containing any of the given tokens.
    Find(cmd::search::SearchOpts),
    /// Print every stored token matching any of the given tokens.
    Search(cmd::search::SearchOpts),
    /// Print a document's text, one string per page.
    Text(cmd::documents::ReadOpts),
    /// Print a document's tokens and their bounding boxes.
    Records(cmd::documents::ReadOpts),
    /// Check whether a document contains any of the given tokens.
    Contains(cmd::documents::ContainsOpts),
}

impl Cmd {
    /// Are we using stdout for output that a progress bar could garble?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Ingest(opts) => opts.output_path.is_none(),
            _ => true,
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Documents already in flight finish normally after Ctrl-C. The rest
    // are reported as cancelled.
    let (canceller, cancel) = CancelSignal::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing documents already in progress");
            canceller.cancel();
        }
    });

    let database = opts.database.as_str();
    match &opts.subcmd {
        Cmd::Ingest(ingest_opts) => {
            cmd::ingest::cmd_ingest(&ui, database, ingest_opts, cancel).await?;
        }
        Cmd::Delete(doc_opts) => cmd::documents::cmd_delete(database, doc_opts).await?,
        Cmd::Exists(doc_opts) => cmd::documents::cmd_exists(database, doc_opts).await?,
        Cmd::Find(search_opts) => cmd::search::cmd_find(database, search_opts).await?,
        Cmd::Search(search_opts) => cmd::search::cmd_search(database, search_opts).await?,
        Cmd::Text(read_opts) => {
            cmd::documents::cmd_text(database, read_opts, cancel).await?;
        }
        Cmd::Records(read_opts) => {
            cmd::documents::cmd_records(database, read_opts, cancel).await?;
        }
        Cmd::Contains(contains_opts) => {
            cmd::documents::cmd_contains(database, contains_opts, cancel).await?;
        }
    }
    Ok(())
}

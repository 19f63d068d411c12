//! The `ingest` subcommand.

use clap::Args;
use futures::stream;

use crate::{
    async_utils::{
        cancel::CancelSignal,
        io::{read_path_list, write_output},
    },
    cmd::{ScanOpts, open_index},
    prelude::*,
    ui::{IngestSummary, Ui},
};

/// Recognize documents and store their text.
#[derive(Args, Clone, Debug)]
pub struct IngestOpts {
    /// PDFs or images to ingest.
    pub paths: Vec<PathBuf>,

    /// Also read paths from this file, one per line. Use "-" for stdin.
    #[clap(long)]
    pub paths_from: Option<PathBuf>,

    /// Replace documents which have already been ingested, instead of
    /// skipping them.
    #[clap(long)]
    pub override_existing: bool,

    /// Only ingest this page (counting from 0) of a single document.
    #[clap(long)]
    pub page: Option<usize>,

    /// Write one JSON outcome per document here, instead of to stdout.
    #[clap(short = 'o', long = "output")]
    pub output_path: Option<PathBuf>,

    #[command(flatten)]
    pub scan: ScanOpts,
}

/// The `ingest` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ingest(
    ui: &Ui,
    database: &str,
    opts: &IngestOpts,
    cancel: CancelSignal,
) -> Result<()> {
    let mut paths = opts.paths.clone();
    if let Some(list) = &opts.paths_from {
        paths.extend(read_path_list(list).await?);
    }

    if opts.page.is_some() && paths.len() != 1 {
        return Err(anyhow!(
            "--page needs exactly one document, but {} were given",
            paths.len()
        ));
    }

    let index = open_index(database, Some(&opts.scan), cancel).await?;
    let pb = ui.new_document_progress_bar(paths.len());
    let outcomes = if let [path] = paths.as_slice() {
        // No need for the concurrent pipeline.
        let outcome = index
            .ingest_one(path, opts.override_existing, opts.page)
            .await?;
        pb.inc(1);
        vec![outcome]
    } else {
        index.ingest(&paths, opts.override_existing, &pb).await?
    };
    drop(pb);

    write_output(
        opts.output_path.as_deref(),
        stream::iter(outcomes.iter().map(Ok)),
    )
    .await?;
    ui.print_summary(&IngestSummary::from_outcomes(&outcomes));
    Ok(())
}

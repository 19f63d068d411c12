//! Subcommands which work on a single document.

use clap::Args;
use futures::stream;

use crate::{
    async_utils::{
        cancel::CancelSignal,
        io::{write_json, write_output},
    },
    cmd::{ScanOpts, open_index},
    prelude::*,
};

/// Options naming a single document.
#[derive(Args, Clone, Debug)]
pub struct DocumentOpts {
    /// The document's path. Only the file name matters.
    pub path: PathBuf,
}

/// Options for reading a document's text.
#[derive(Args, Clone, Debug)]
pub struct ReadOpts {
    /// The document's path.
    pub path: PathBuf,

    /// Recognize the document again instead of reading stored text. Nothing
    /// is written to the database.
    #[clap(long)]
    pub live: bool,

    /// Write output here instead of to stdout.
    #[clap(short = 'o', long = "output")]
    pub output_path: Option<PathBuf>,

    #[command(flatten)]
    pub scan: ScanOpts,
}

/// Options for checking a document for tokens.
#[derive(Args, Clone, Debug)]
pub struct ContainsOpts {
    /// The document's path.
    pub path: PathBuf,

    /// Tokens to look for. Matching is exact but case-insensitive.
    #[clap(required = true)]
    pub tokens: Vec<String>,

    /// Recognize the document again instead of reading stored text.
    #[clap(long)]
    pub live: bool,

    #[command(flatten)]
    pub scan: ScanOpts,
}

/// The `delete` subcommand. Prints whether anything was deleted.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_delete(database: &str, opts: &DocumentOpts) -> Result<()> {
    let index = open_index(database, None, CancelSignal::never()).await?;
    let deleted = index.delete(&opts.path).await?;
    if !deleted {
        warn!(path = %opts.path.display(), "No such document");
    }
    write_json(None, &deleted).await
}

/// The `exists` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_exists(database: &str, opts: &DocumentOpts) -> Result<()> {
    let index = open_index(database, None, CancelSignal::never()).await?;
    write_json(None, &index.exists(&opts.path).await?).await
}

/// The `text` subcommand. Prints a JSON array with one string per page.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_text(database: &str, opts: &ReadOpts, cancel: CancelSignal) -> Result<()> {
    let index = open_index(database, Some(&opts.scan), cancel).await?;
    let pages = index.get_document_text(&opts.path, !opts.live).await?;
    write_json(opts.output_path.as_deref(), &pages).await
}

/// The `records` subcommand. Prints one JSON record per token.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_records(database: &str, opts: &ReadOpts, cancel: CancelSignal) -> Result<()> {
    let index = open_index(database, Some(&opts.scan), cancel).await?;
    let records = index
        .get_document_page_records(&opts.path, !opts.live)
        .await?;
    write_output(
        opts.output_path.as_deref(),
        stream::iter(records.into_iter().map(Ok)),
    )
    .await
}

/// The `contains` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_contains(
    database: &str,
    opts: &ContainsOpts,
    cancel: CancelSignal,
) -> Result<()> {
    let index = open_index(database, Some(&opts.scan), cancel).await?;
    let found = index
        .document_contains(&opts.path, &opts.tokens, !opts.live)
        .await?;
    write_json(None, &found).await
}

//! The `find` and `search` subcommands.

use clap::Args;
use futures::stream;

use crate::{
    async_utils::{
        cancel::CancelSignal,
        io::{write_json, write_output},
    },
    cmd::open_index,
    prelude::*,
};

/// Options for searching stored text.
#[derive(Args, Clone, Debug)]
pub struct SearchOpts {
    /// Tokens to search for. Punctuation is ignored and matching is exact but
    /// case-insensitive.
    #[clap(required = true)]
    pub tokens: Vec<String>,

    /// Only search these document keys. May be repeated.
    #[clap(long = "scope", value_name = "KEY")]
    pub scope: Vec<String>,

    /// Write output here instead of to stdout.
    #[clap(short = 'o', long = "output")]
    pub output_path: Option<PathBuf>,
}

impl SearchOpts {
    fn scope(&self) -> Option<&[String]> {
        (!self.scope.is_empty()).then_some(self.scope.as_slice())
    }
}

/// The `find` subcommand. Prints a JSON object mapping each matching
/// document to the tokens it contains.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_find(database: &str, opts: &SearchOpts) -> Result<()> {
    let index = open_index(database, None, CancelSignal::never()).await?;
    let found = index.find_documents(&opts.tokens, opts.scope()).await?;
    write_json(opts.output_path.as_deref(), &found).await
}

/// The `search` subcommand. Prints every matching record as JSONL.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_search(database: &str, opts: &SearchOpts) -> Result<()> {
    let index = open_index(database, None, CancelSignal::never()).await?;
    let records = index.search_documents(&opts.tokens, opts.scope()).await?;
    write_output(
        opts.output_path.as_deref(),
        stream::iter(records.into_iter().map(Ok)),
    )
    .await
}

//! Command-line entry points.

use std::sync::Arc;

use clap::Args;

use crate::{
    async_utils::cancel::CancelSignal,
    index::PageIndex,
    pipeline::PipelineOptions,
    prelude::*,
    rasterize::{PopplerRasterizer, RasterizeOpts},
    recognize::{EngineKind, RecognizeOpts, recognizer_for_opts},
    storage::{Storage, sqlite::SqliteStorage},
};

pub mod documents;
pub mod ingest;
pub mod search;

/// Options for commands which may need to rasterize and recognize documents.
#[derive(Args, Clone, Debug)]
pub struct ScanOpts {
    #[command(flatten)]
    pub recognize: RecognizeOpts,

    #[command(flatten)]
    pub rasterize: RasterizeOpts,

    /// Max number of pages of a document to recognize at a time.
    #[clap(short = 'j', long = "jobs", default_value = "8")]
    pub job_count: usize,
}

impl ScanOpts {
    fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            dpi: self.rasterize.dpi,
            jobs: self.job_count,
            adapter_timeout: self.recognize.timeout(),
        }
    }
}

/// Open the index stored at `database`.
///
/// Without `scan`, the index can only answer from storage, and anything
/// needing recognition fails with a configuration error.
#[instrument(level = "debug", skip(scan, cancel))]
pub async fn open_index(
    database: &str,
    scan: Option<&ScanOpts>,
    cancel: CancelSignal,
) -> Result<PageIndex> {
    let storage: Arc<dyn Storage> = Arc::new(
        SqliteStorage::open(database)
            .with_context(|| format!("failed to open database {database:?}"))?,
    );
    let index = match scan {
        Some(scan) => {
            let recognizer = recognizer_for_opts(&scan.recognize).await?;
            if recognizer.is_none() {
                debug!(engine = ?scan.recognize.engine, "No recognition credential found");
            }
            PageIndex::new(
                storage,
                Arc::new(PopplerRasterizer::new(&scan.rasterize)),
                recognizer,
                scan.recognize.engine,
                scan.pipeline_options(),
                cancel,
            )
        }
        None => PageIndex::new(
            storage,
            Arc::new(PopplerRasterizer::default()),
            None,
            EngineKind::default(),
            PipelineOptions::default(),
            cancel,
        ),
    };
    Ok(index)
}

//! Document-level operations: ingest, delete, search and read back.

use std::{collections::BTreeMap, sync::Arc};

use indicatif::ProgressBar;

use crate::{
    async_utils::cancel::CancelSignal,
    dedup::resolve_paths,
    error::IndexError,
    model::{PageText, document_key, page_texts},
    pipeline::{IngestOutcome, Pipeline, PipelineOptions},
    prelude::*,
    rasterize::Rasterizer,
    recognize::{EngineKind, Recognizer, missing_credential_error},
    search,
    storage::{Storage, TextPredicate},
};

/// A searchable index of recognized documents.
///
/// Everything here can be shared between tasks, so independent batches may
/// run concurrently. Callers must not ingest and delete the same document at
/// the same time.
#[derive(Clone)]
pub struct PageIndex {
    storage: Arc<dyn Storage>,
    rasterizer: Arc<dyn Rasterizer>,
    /// `None` if no recognition credential was available. Operations which
    /// don't need recognition still work.
    recognizer: Option<Arc<dyn Recognizer>>,
    engine: EngineKind,
    opts: PipelineOptions,
    cancel: CancelSignal,
}

impl PageIndex {
    pub fn new(
        storage: Arc<dyn Storage>,
        rasterizer: Arc<dyn Rasterizer>,
        recognizer: Option<Arc<dyn Recognizer>>,
        engine: EngineKind,
        opts: PipelineOptions,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            storage,
            rasterizer,
            recognizer,
            engine,
            opts,
            cancel,
        }
    }

    /// Build a pipeline, or fail if we have no way to recognize text.
    fn pipeline(&self) -> Result<Pipeline, IndexError> {
        let recognizer = self
            .recognizer
            .clone()
            .ok_or_else(|| missing_credential_error(self.engine))?;
        Ok(Pipeline {
            rasterizer: self.rasterizer.clone(),
            recognizer,
            storage: self.storage.clone(),
            opts: self.opts.clone(),
            cancel: self.cancel.clone(),
        })
    }

    /// Ingest a batch of documents, returning one outcome per path in input
    /// order.
    ///
    /// Failures of individual documents are reported in their outcomes.
    /// Errors are returned only for problems affecting the whole batch, and
    /// wrap an [`IndexError`] where one applies.
    pub async fn ingest(
        &self,
        paths: &[PathBuf],
        override_existing: bool,
        progress: &ProgressBar,
    ) -> Result<Vec<IngestOutcome>> {
        // Check this before touching storage, so a misconfigured run can't
        // purge anything.
        let pipeline = self.pipeline()?;
        let resolved = resolve_paths(self.storage.as_ref(), paths, override_existing).await?;
        info!(
            to_process = resolved.to_process.len(),
            skipped = resolved.skipped.len(),
            rejected = resolved.rejected.len(),
            "Resolved input paths"
        );

        let mut outcomes = resolved
            .skipped
            .into_iter()
            .map(|skipped| (skipped.candidate.index, IngestOutcome::skipped(skipped)))
            .chain(
                resolved
                    .rejected
                    .into_iter()
                    .map(|rejected| (rejected.index, IngestOutcome::rejected(rejected))),
            )
            .collect::<Vec<_>>();
        progress.inc(outcomes.len() as u64);
        if !resolved.to_process.is_empty() {
            outcomes.extend(pipeline.ingest_batch(resolved.to_process, progress).await?);
        }
        outcomes.sort_by_key(|(index, _)| *index);
        Ok(outcomes.into_iter().map(|(_, outcome)| outcome).collect())
    }

    /// Ingest a single document without the batch machinery.
    ///
    /// If `page` is given, only that 0-based page is rendered and recognized,
    /// and the stored document covers the pages up to and including it.
    pub async fn ingest_one(
        &self,
        path: &Path,
        override_existing: bool,
        page: Option<usize>,
    ) -> Result<IngestOutcome, IndexError> {
        let pipeline = self.pipeline()?;
        let resolved = resolve_paths(
            self.storage.as_ref(),
            &[path.to_owned()],
            override_existing,
        )
        .await?;
        if let Some(candidate) = resolved.to_process.first() {
            return Ok(pipeline.ingest_one(candidate, page).await);
        }
        if let Some(rejected) = resolved.rejected.into_iter().next() {
            return Ok(IngestOutcome::rejected(rejected));
        }
        let skipped = resolved.skipped.into_iter().next().ok_or_else(|| {
            IndexError::Validation(format!("nothing to ingest for {:?}", path.display()))
        })?;
        Ok(IngestOutcome::skipped(skipped))
    }

    /// Delete the document for `path` and all of its records.
    pub async fn delete(&self, path: &Path) -> Result<bool, IndexError> {
        let deleted = self.storage.delete(&document_key(path)?).await?;
        debug!(path = %path.display(), deleted, "Deleted document");
        Ok(deleted)
    }

    /// Has the document for `path` been ingested?
    pub async fn exists(&self, path: &Path) -> Result<bool, IndexError> {
        self.storage.exists(&document_key(path)?).await
    }

    /// See [`search::find_documents`].
    pub async fn find_documents<S: AsRef<str> + Sync>(
        &self,
        tokens: &[S],
        scope: Option<&[String]>,
    ) -> Result<BTreeMap<String, Vec<String>>, IndexError> {
        search::find_documents(self.storage.as_ref(), tokens, scope).await
    }

    /// See [`search::search_documents`].
    pub async fn search_documents<S: AsRef<str> + Sync>(
        &self,
        tokens: &[S],
        scope: Option<&[String]>,
    ) -> Result<Vec<PageText>, IndexError> {
        search::search_documents(self.storage.as_ref(), tokens, scope).await
    }

    /// Get the page count and records for `path`, from storage if
    /// `prefer_stored` is set and we have the document, or by scanning it
    /// again otherwise.
    #[instrument(level = "debug", skip_all, fields(path = %path.display(), prefer_stored))]
    async fn page_records(
        &self,
        path: &Path,
        prefer_stored: bool,
    ) -> Result<(usize, Vec<PageText>), IndexError> {
        let key = document_key(path)?;
        if prefer_stored && let Some(document) = self.storage.document(&key).await? {
            let records = self.storage.query_by_key_ordered(&key).await?;
            return Ok((document.page_count, records));
        }
        debug!("Scanning document live");
        self.pipeline()?.scan_live(path).await
    }

    /// The text of each page of `path`, with tokens joined by single spaces.
    /// Pages without text are empty strings.
    pub async fn get_document_text(
        &self,
        path: &Path,
        prefer_stored: bool,
    ) -> Result<Vec<String>, IndexError> {
        let (page_count, records) = self.page_records(path, prefer_stored).await?;
        Ok(page_texts(page_count, &records))
    }

    /// Every record of `path`, in page and reading order.
    pub async fn get_document_page_records(
        &self,
        path: &Path,
        prefer_stored: bool,
    ) -> Result<Vec<PageText>, IndexError> {
        Ok(self.page_records(path, prefer_stored).await?.1)
    }

    /// Does `path` contain any of `tokens`?
    pub async fn document_contains<S: AsRef<str> + Sync>(
        &self,
        path: &Path,
        tokens: &[S],
        prefer_stored: bool,
    ) -> Result<bool, IndexError> {
        let predicate = TextPredicate::token_in(tokens);
        if predicate.is_empty() {
            return Ok(false);
        }
        let key = document_key(path)?;
        if prefer_stored && self.storage.exists(&key).await? {
            let matches = self.storage.query_by_keys(&[key], &predicate).await?;
            return Ok(!matches.is_empty());
        }
        let (_, records) = self.pipeline()?.scan_live(path).await?;
        Ok(records.iter().any(|record| predicate.matches(record)))
    }
}

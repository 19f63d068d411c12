//! The ingestion pipeline.
//!
//! A batch flows through three concurrently running stages connected by
//! bounded queues:
//!
//! 1. **Rasterize**: one document at a time, render pages into a scratch
//!    directory.
//! 2. **Recognize**: recognize and normalize every page of a document
//!    concurrently, deleting each page image once it's been read.
//! 3. **Persist**: insert each document and its records atomically.
//!
//! Documents overlap across stages, so while one document is being persisted
//! the next can be recognized and a third rasterized. Every document produces
//! exactly one [`IngestOutcome`], and a failure in one document never stops
//! the others.

use std::{sync::Arc, time::Duration};

use futures::{
    SinkExt as _, StreamExt as _,
    channel::mpsc::{self, UnboundedSender},
    stream,
};
use indicatif::ProgressBar;
use serde::{Serialize, Serializer};
use tempfile::TempDir;
use tokio::time;

use crate::{
    async_utils::{JoinWorker, cancel::CancelSignal},
    dedup::{Candidate, RejectedPath, SkippedCandidate},
    error::{AdapterStage, IndexError},
    model::{Document, PageText, document_key},
    normalize::normalize_annotation,
    prelude::*,
    rasterize::{DEFAULT_DPI, PageImage, Rasterizer},
    recognize::Recognizer,
    storage::Storage,
};

/// Tuning for a pipeline run.
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Rasterization resolution.
    pub dpi: u32,
    /// How many pages of a document to recognize at once. Also the capacity
    /// of each queue between stages.
    pub jobs: usize,
    /// Deadline for each adapter call.
    pub adapter_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            dpi: DEFAULT_DPI,
            jobs: 8,
            adapter_timeout: Duration::from_secs(120),
        }
    }
}

/// What happened to one document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Ingested,
    Skipped,
    Failed,
}

/// The result of ingesting one document.
#[derive(Debug, Serialize)]
pub struct IngestOutcome {
    pub path: PathBuf,
    /// Empty if no key could be derived from `path`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key: String,
    pub status: IngestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_count: Option<usize>,
    /// Why the document was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_error"
    )]
    pub error: Option<IndexError>,
}

impl IngestOutcome {
    fn new(candidate: &Candidate, status: IngestStatus) -> Self {
        Self {
            path: candidate.path.clone(),
            key: candidate.key.clone(),
            status,
            page_count: None,
            record_count: None,
            reason: None,
            error: None,
        }
    }

    pub fn ingested(candidate: &Candidate, page_count: usize, record_count: usize) -> Self {
        Self {
            page_count: Some(page_count),
            record_count: Some(record_count),
            ..Self::new(candidate, IngestStatus::Ingested)
        }
    }

    pub fn skipped(skipped: SkippedCandidate) -> Self {
        Self {
            reason: Some(skipped.reason),
            ..Self::new(&skipped.candidate, IngestStatus::Skipped)
        }
    }

    pub fn rejected(rejected: RejectedPath) -> Self {
        Self {
            path: rejected.path,
            key: String::new(),
            status: IngestStatus::Failed,
            page_count: None,
            record_count: None,
            reason: None,
            error: Some(rejected.error),
        }
    }

    pub fn failed(candidate: &Candidate, error: IndexError) -> Self {
        warn!(key = %candidate.key, "Failed to ingest document: {error}");
        Self {
            error: Some(error),
            ..Self::new(candidate, IngestStatus::Failed)
        }
    }
}

fn serialize_error<S: Serializer>(
    error: &Option<IndexError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.serialize_str(&error.to_string()),
        None => serializer.serialize_none(),
    }
}

/// An outcome tagged with its candidate's position in the input.
pub type IndexedOutcome = (usize, IngestOutcome);

/// A rasterized document waiting for recognition. Dropping `scratch` removes
/// any page images that weren't discarded.
struct Rasterized {
    candidate: Candidate,
    scratch: TempDir,
    pages: Vec<PageImage>,
}

/// A recognized document waiting to be persisted.
struct Recognized {
    candidate: Candidate,
    document: Document,
    records: Vec<PageText>,
}

/// Everything a pipeline run needs. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    pub rasterizer: Arc<dyn Rasterizer>,
    pub recognizer: Arc<dyn Recognizer>,
    pub storage: Arc<dyn Storage>,
    pub opts: PipelineOptions,
    pub cancel: CancelSignal,
}

impl Pipeline {
    /// Ingest a batch of documents through the three concurrent stages.
    ///
    /// Returns one outcome per candidate, in no particular order. Only a
    /// broken pipeline (a panicked stage) is reported as an error.
    #[instrument(level = "debug", skip_all, fields(documents = candidates.len()))]
    pub async fn ingest_batch(
        &self,
        candidates: Vec<Candidate>,
        progress: &ProgressBar,
    ) -> Result<Vec<IndexedOutcome>> {
        let capacity = self.opts.jobs.max(1);
        let (rasterized_tx, rasterized_rx) = mpsc::channel(capacity);
        let (recognized_tx, recognized_rx) = mpsc::channel(capacity);
        let (outcome_tx, outcome_rx) = mpsc::unbounded();

        let workers = [
            JoinWorker::from_handle(tokio::spawn(self.clone().rasterize_stage(
                candidates,
                rasterized_tx,
                outcome_tx.clone(),
            ))),
            JoinWorker::from_handle(tokio::spawn(self.clone().recognize_stage(
                rasterized_rx,
                recognized_tx,
                outcome_tx.clone(),
            ))),
            JoinWorker::from_handle(tokio::spawn(
                self.clone().persist_stage(recognized_rx, outcome_tx),
            )),
        ];

        // The outcome stream ends once every stage has dropped its sender.
        let outcomes = outcome_rx
            .inspect(|_| progress.inc(1))
            .collect::<Vec<_>>()
            .await;
        for worker in workers {
            worker.join().await?;
        }
        Ok(outcomes)
    }

    /// Ingest a single document, one step after another. If `page` is given,
    /// only that page is rendered and recognized.
    #[instrument(level = "debug", skip_all, fields(key = %candidate.key, page = ?page))]
    pub async fn ingest_one(&self, candidate: &Candidate, page: Option<usize>) -> IngestOutcome {
        match self.process_one(candidate, page).await {
            Ok((page_count, record_count)) => {
                IngestOutcome::ingested(candidate, page_count, record_count)
            }
            Err(err) => IngestOutcome::failed(candidate, err),
        }
    }

    async fn process_one(
        &self,
        candidate: &Candidate,
        page: Option<usize>,
    ) -> Result<(usize, usize), IndexError> {
        self.check_cancelled()?;
        let (scratch, pages) = self
            .rasterize_document(&candidate.path, &candidate.key, page)
            .await?;
        // A single page keeps its number, so the pages before it read as empty.
        let page_count = page.map_or(pages.len(), |page_idx| page_idx + 1);
        let records = self.recognize_pages(&candidate.key, pages).await?;
        drop(scratch);
        let document = Document {
            file_name: candidate.key.clone(),
            page_count,
        };
        self.storage.insert_atomic(&document, &records).await?;
        Ok((page_count, records.len()))
    }

    /// Rasterize, recognize and normalize a document without storing
    /// anything. Returns the page count and the records in page order.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn scan_live(&self, path: &Path) -> Result<(usize, Vec<PageText>), IndexError> {
        let key = document_key(path)?;
        self.check_cancelled()?;
        let (scratch, pages) = self.rasterize_document(path, &key, None).await?;
        let page_count = pages.len();
        let records = self.recognize_pages(&key, pages).await?;
        drop(scratch);
        Ok((page_count, records))
    }

    fn check_cancelled(&self) -> Result<(), IndexError> {
        if self.cancel.is_cancelled() {
            Err(IndexError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run an adapter call under our deadline, folding its errors into
    /// [`IndexError`].
    async fn with_timeout<T>(
        &self,
        key: &str,
        stage: AdapterStage,
        future: impl Future<Output = Result<T>>,
    ) -> Result<T, IndexError> {
        match time::timeout(self.opts.adapter_timeout, future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(IndexError::adapter(key, stage, err)),
            Err(_elapsed) => Err(IndexError::AdapterTimeout {
                key: key.to_owned(),
                stage,
                timeout: self.opts.adapter_timeout,
            }),
        }
    }

    /// Render a document's pages, or just `page`, into a fresh scratch
    /// directory.
    #[instrument(level = "debug", skip_all, fields(key = %key, page = ?page))]
    async fn rasterize_document(
        &self,
        path: &Path,
        key: &str,
        page: Option<usize>,
    ) -> Result<(TempDir, Vec<PageImage>), IndexError> {
        let scratch = TempDir::with_prefix("ocr-pages")
            .context("failed to create scratch directory")
            .map_err(|err| IndexError::adapter(key, AdapterStage::Rasterize, err))?;
        let (output_dir, dpi) = (scratch.path(), self.opts.dpi);
        let pages = match page {
            None => {
                self.with_timeout(
                    key,
                    AdapterStage::Rasterize,
                    self.rasterizer.rasterize(path, output_dir, dpi),
                )
                .await?
            }
            Some(page_idx) => vec![
                self.with_timeout(
                    key,
                    AdapterStage::Rasterize,
                    self.rasterizer.rasterize_page(path, output_dir, dpi, page_idx),
                )
                .await?,
            ],
        };
        Ok((scratch, pages))
    }

    /// Recognize and normalize every page, up to `jobs` at a time, and
    /// concatenate the records in page order.
    ///
    /// Every page image is discarded, whether or not recognition succeeded.
    #[instrument(level = "debug", skip_all, fields(key = %key, pages = pages.len()))]
    async fn recognize_pages(
        &self,
        key: &str,
        pages: Vec<PageImage>,
    ) -> Result<Vec<PageText>, IndexError> {
        let page_futures = pages
            .into_iter()
            .map(|page| self.recognize_page(key, page))
            .collect::<Vec<_>>();
        let per_page = stream::iter(page_futures)
            .buffered(self.opts.jobs.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut records = vec![];
        for page_records in per_page {
            records.extend(page_records?);
        }
        debug!(records = records.len(), "Recognized document");
        Ok(records)
    }

    /// Recognize and normalize one page, then delete its image.
    async fn recognize_page(
        &self,
        key: &str,
        page: PageImage,
    ) -> Result<Vec<PageText>, IndexError> {
        let annotation = self
            .with_timeout(key, AdapterStage::Recognize, self.recognizer.recognize(&page))
            .await;
        let page_idx = page.page_idx;
        page.discard().await;
        Ok(normalize_annotation(&annotation?, key, page_idx))
    }

    /// Stage 1: rasterize documents in input order.
    async fn rasterize_stage(
        self,
        candidates: Vec<Candidate>,
        mut tx: mpsc::Sender<Rasterized>,
        outcomes: UnboundedSender<IndexedOutcome>,
    ) -> Result<()> {
        for candidate in candidates {
            let rasterized = match self.check_cancelled() {
                Ok(()) => {
                    self.rasterize_document(&candidate.path, &candidate.key, None)
                        .await
                }
                Err(err) => Err(err),
            };
            match rasterized {
                Ok((scratch, pages)) => {
                    tx.send(Rasterized {
                        candidate,
                        scratch,
                        pages,
                    })
                    .await
                    .context("recognition stage exited early")?;
                }
                Err(err) => report(&outcomes, IngestOutcome::failed(&candidate, err), &candidate)?,
            }
        }
        // Dropping `tx` tells the recognition stage we're done.
        Ok(())
    }

    /// Stage 2: recognize one document at a time, with its pages in
    /// parallel.
    async fn recognize_stage(
        self,
        mut rx: mpsc::Receiver<Rasterized>,
        mut tx: mpsc::Sender<Recognized>,
        outcomes: UnboundedSender<IndexedOutcome>,
    ) -> Result<()> {
        while let Some(Rasterized {
            candidate,
            scratch,
            pages,
        }) = rx.next().await
        {
            if let Err(err) = self.check_cancelled() {
                drop(scratch);
                report(&outcomes, IngestOutcome::failed(&candidate, err), &candidate)?;
                continue;
            }
            let page_count = pages.len();
            let recognized = self.recognize_pages(&candidate.key, pages).await;
            drop(scratch);
            match recognized {
                Ok(records) => {
                    let document = Document {
                        file_name: candidate.key.clone(),
                        page_count,
                    };
                    tx.send(Recognized {
                        candidate,
                        document,
                        records,
                    })
                    .await
                    .context("persistence stage exited early")?;
                }
                Err(err) => report(&outcomes, IngestOutcome::failed(&candidate, err), &candidate)?,
            }
        }
        Ok(())
    }

    /// Stage 3: persist each document atomically.
    async fn persist_stage(
        self,
        mut rx: mpsc::Receiver<Recognized>,
        outcomes: UnboundedSender<IndexedOutcome>,
    ) -> Result<()> {
        while let Some(Recognized {
            candidate,
            document,
            records,
        }) = rx.next().await
        {
            let outcome = match self.storage.insert_atomic(&document, &records).await {
                Ok(()) => {
                    info!(key = %candidate.key, records = records.len(), "Ingested document");
                    IngestOutcome::ingested(&candidate, document.page_count, records.len())
                }
                Err(err) => IngestOutcome::failed(&candidate, err),
            };
            report(&outcomes, outcome, &candidate)?;
        }
        Ok(())
    }
}

/// Send an outcome to the collector.
fn report(
    outcomes: &UnboundedSender<IndexedOutcome>,
    outcome: IngestOutcome,
    candidate: &Candidate,
) -> Result<()> {
    outcomes
        .unbounded_send((candidate.index, outcome))
        .map_err(|_| anyhow!("outcome collector exited early"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        async_utils::cancel::CancelSignal,
        model::page_texts,
        storage::TextPredicate,
        testing::{FakeDocument, FakeServices},
    };

    fn candidates(keys: &[&str]) -> Vec<Candidate> {
        keys.iter()
            .enumerate()
            .map(|(index, key)| Candidate {
                index,
                path: PathBuf::from(format!("/in/{key}.pdf")),
                key: (*key).to_owned(),
            })
            .collect()
    }

    fn sorted(mut outcomes: Vec<IndexedOutcome>) -> Vec<IngestOutcome> {
        outcomes.sort_by_key(|(index, _)| *index);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }

    fn statuses(outcomes: &[IngestOutcome]) -> Vec<IngestStatus> {
        outcomes.iter().map(|o| o.status).collect()
    }

    #[tokio::test]
    async fn batch_isolates_rasterization_failures() {
        let services = FakeServices::new(vec![
            ("one", FakeDocument::with_pages(&[&["alpha"], &["beta"]])),
            (
                "two",
                FakeDocument {
                    fail_rasterize: true,
                    ..FakeDocument::with_pages(&[&["never"]])
                },
            ),
            ("three", FakeDocument::with_pages(&[&["gamma", "delta"]])),
        ]);
        let pipeline = services.pipeline(PipelineOptions::default(), CancelSignal::never());
        let outcomes = pipeline
            .ingest_batch(candidates(&["one", "two", "three"]), &ProgressBar::hidden())
            .await
            .unwrap();
        let outcomes = sorted(outcomes);
        assert_eq!(
            statuses(&outcomes),
            vec![IngestStatus::Ingested, IngestStatus::Failed, IngestStatus::Ingested]
        );
        assert!(matches!(
            outcomes[1].error,
            Some(IndexError::Adapter {
                stage: AdapterStage::Rasterize,
                ..
            })
        ));
        assert_eq!(outcomes[0].page_count, Some(2));
        assert_eq!(outcomes[2].record_count, Some(2));

        let storage = &pipeline.storage;
        assert!(storage.exists("one").await.unwrap());
        assert!(!storage.exists("two").await.unwrap());
        assert!(storage.exists("three").await.unwrap());
        assert!(services.leftover_images().is_empty());
    }

    #[tokio::test]
    async fn recognition_failure_fails_only_that_document() {
        let services = FakeServices::new(vec![
            (
                "bad",
                FakeDocument {
                    fail_recognize_page: Some(1),
                    ..FakeDocument::with_pages(&[&["ok"], &["broken"], &["ok"]])
                },
            ),
            ("good", FakeDocument::with_pages(&[&["fine"]])),
        ]);
        let pipeline = services.pipeline(PipelineOptions::default(), CancelSignal::never());
        let outcomes = sorted(
            pipeline
                .ingest_batch(candidates(&["bad", "good"]), &ProgressBar::hidden())
                .await
                .unwrap(),
        );
        assert_eq!(
            statuses(&outcomes),
            vec![IngestStatus::Failed, IngestStatus::Ingested]
        );
        // No partial document is left behind.
        assert!(!pipeline.storage.exists("bad").await.unwrap());
        assert!(services.leftover_images().is_empty());
    }

    #[tokio::test]
    async fn records_keep_page_and_reading_order() {
        let services = FakeServices::new(vec![(
            "A",
            FakeDocument::with_pages(&[&["Hello", "World,"], &["Foo"], &[]]),
        )]);
        let pipeline = services.pipeline(
            PipelineOptions {
                jobs: 3,
                ..PipelineOptions::default()
            },
            CancelSignal::never(),
        );
        let outcome = pipeline.ingest_one(&candidates(&["A"])[0], None).await;
        assert_eq!(outcome.status, IngestStatus::Ingested);
        assert_eq!(outcome.page_count, Some(3));

        let records = pipeline.storage.query_by_key_ordered("A").await.unwrap();
        let found = records
            .iter()
            .map(|r| (r.page_number, r.text.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(found, vec![(0, "Hello"), (0, "World"), (1, "Foo")]);
        assert!(records.iter().all(|r| r.bbox.is_normalized()));
        assert_eq!(
            pipeline.storage.document("A").await.unwrap().unwrap().page_count,
            3
        );
    }

    #[tokio::test]
    async fn single_page_keeps_its_page_number() {
        let services = FakeServices::new(vec![(
            "A",
            FakeDocument::with_pages(&[&["Hello"], &["Foo", "Bar"], &["baz"]]),
        )]);
        let pipeline = services.pipeline(PipelineOptions::default(), CancelSignal::never());
        let outcome = pipeline.ingest_one(&candidates(&["A"])[0], Some(1)).await;
        assert_eq!(outcome.status, IngestStatus::Ingested);
        assert_eq!(outcome.page_count, Some(2));
        assert_eq!(outcome.record_count, Some(2));
        assert_eq!(services.recognized_pages(), 1);
        assert!(services.leftover_images().is_empty());

        let records = pipeline.storage.query_by_key_ordered("A").await.unwrap();
        assert!(records.iter().all(|r| r.page_number == 1));
        let stored = pipeline.storage.document("A").await.unwrap().unwrap();
        assert_eq!(
            page_texts(stored.page_count, &records),
            vec!["".to_owned(), "Foo Bar".to_owned()]
        );
    }

    #[tokio::test]
    async fn missing_page_fails_the_document() {
        let services = FakeServices::new(vec![("A", FakeDocument::with_pages(&[&["Hello"]]))]);
        let pipeline = services.pipeline(PipelineOptions::default(), CancelSignal::never());
        let outcome = pipeline.ingest_one(&candidates(&["A"])[0], Some(4)).await;
        assert_eq!(outcome.status, IngestStatus::Failed);
        assert!(matches!(
            outcome.error,
            Some(IndexError::Adapter {
                stage: AdapterStage::Rasterize,
                ..
            })
        ));
        assert!(!pipeline.storage.exists("A").await.unwrap());
        assert!(services.leftover_images().is_empty());
    }

    #[tokio::test]
    async fn slow_recognition_times_out_one_document() {
        let services = FakeServices::new(vec![
            (
                "slow",
                FakeDocument {
                    recognize_delay: Some(Duration::from_secs(5)),
                    ..FakeDocument::with_pages(&[&["late"]])
                },
            ),
            ("fast", FakeDocument::with_pages(&[&["quick"]])),
        ]);
        let pipeline = services.pipeline(
            PipelineOptions {
                adapter_timeout: Duration::from_millis(100),
                ..PipelineOptions::default()
            },
            CancelSignal::never(),
        );
        let outcomes = sorted(
            pipeline
                .ingest_batch(candidates(&["slow", "fast"]), &ProgressBar::hidden())
                .await
                .unwrap(),
        );
        assert!(matches!(
            outcomes[0].error,
            Some(IndexError::AdapterTimeout {
                stage: AdapterStage::Recognize,
                ..
            })
        ));
        assert_eq!(outcomes[1].status, IngestStatus::Ingested);
    }

    #[tokio::test]
    async fn cancellation_fails_unstarted_documents() {
        let services = FakeServices::new(vec![
            ("one", FakeDocument::with_pages(&[&["a"]])),
            ("two", FakeDocument::with_pages(&[&["b"]])),
        ]);
        let (canceller, signal) = CancelSignal::new();
        canceller.cancel();
        let pipeline = services.pipeline(PipelineOptions::default(), signal);
        let outcomes = sorted(
            pipeline
                .ingest_batch(candidates(&["one", "two"]), &ProgressBar::hidden())
                .await
                .unwrap(),
        );
        assert!(
            outcomes
                .iter()
                .all(|o| matches!(o.error, Some(IndexError::Cancelled)))
        );
        assert!(services.rasterized().is_empty());
        assert!(
            pipeline
                .storage
                .query_all(&TextPredicate::Any)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn live_scan_never_writes() {
        let services =
            FakeServices::new(vec![("A", FakeDocument::with_pages(&[&["Hello"], &["Foo"]]))]);
        let pipeline = services.pipeline(PipelineOptions::default(), CancelSignal::never());
        let (page_count, records) = pipeline.scan_live(Path::new("/in/A.png")).await.unwrap();
        assert_eq!(page_count, 2);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.id.is_none()));
        assert!(!pipeline.storage.exists("A").await.unwrap());
        assert_eq!(services.recognized_pages(), 2);
    }

    #[test]
    fn outcomes_serialize_errors_as_text() {
        let candidate = &candidates(&["A"])[0];
        let outcome = IngestOutcome::failed(candidate, IndexError::Cancelled);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "operation cancelled");
        assert!(json.get("page_count").is_none());
    }
}

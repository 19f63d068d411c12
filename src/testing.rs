//! In-process stand-ins for the rasterization and recognition services.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    async_utils::cancel::CancelSignal,
    model::document_key,
    pipeline::{Pipeline, PipelineOptions},
    prelude::*,
    rasterize::{PageImage, Rasterizer},
    recognize::{
        AnnotatedPage, Block, BoundingPoly, Paragraph, Recognizer, Symbol, TextAnnotation,
        Vertex, Word,
    },
    storage::{Storage, sqlite::SqliteStorage},
};

/// How a fake document behaves.
#[derive(Clone, Debug, Default)]
pub struct FakeDocument {
    /// Words on each page.
    pub pages: Vec<Vec<&'static str>>,
    pub fail_rasterize: bool,
    pub fail_recognize_page: Option<usize>,
    /// Sleep this long in every recognition call.
    pub recognize_delay: Option<Duration>,
}

impl FakeDocument {
    pub fn with_pages(pages: &[&[&'static str]]) -> Self {
        Self {
            pages: pages.iter().map(|words| words.to_vec()).collect(),
            ..Self::default()
        }
    }
}

/// Serves both adapters from a table of [`FakeDocument`]s keyed by document
/// key, and remembers every page image it wrote.
#[derive(Clone, Default)]
pub struct FakeServices {
    documents: Arc<HashMap<String, FakeDocument>>,
    written: Arc<Mutex<Vec<PathBuf>>>,
    rasterized: Arc<Mutex<Vec<String>>>,
    recognized: Arc<Mutex<HashSet<(String, usize)>>>,
}

impl FakeServices {
    pub fn new(documents: Vec<(&str, FakeDocument)>) -> Self {
        Self {
            documents: Arc::new(
                documents
                    .into_iter()
                    .map(|(key, doc)| (key.to_owned(), doc))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    fn document(&self, path: &Path) -> Result<&FakeDocument> {
        let key = document_key(path)?;
        self.documents
            .get(&key)
            .ok_or_else(|| anyhow!("no such fake document {key:?}"))
    }

    /// Page images we wrote which still exist.
    pub fn leftover_images(&self) -> Vec<PathBuf> {
        let written = self.written.lock().expect("lock poisoned");
        written.iter().filter(|p| p.exists()).cloned().collect()
    }

    /// Keys we were asked to rasterize, in order.
    pub fn rasterized(&self) -> Vec<String> {
        self.rasterized.lock().expect("lock poisoned").clone()
    }

    /// Number of pages we were asked to recognize.
    pub fn recognized_pages(&self) -> usize {
        self.recognized.lock().expect("lock poisoned").len()
    }

    /// Build a pipeline over these fakes and an in-memory database.
    pub fn pipeline(&self, opts: PipelineOptions, cancel: CancelSignal) -> Pipeline {
        let storage: Arc<dyn Storage> =
            Arc::new(SqliteStorage::open_in_memory().expect("in-memory database"));
        Pipeline {
            rasterizer: Arc::new(self.clone()),
            recognizer: Arc::new(self.clone()),
            storage,
            opts,
            cancel,
        }
    }
}

#[async_trait]
impl Rasterizer for FakeServices {
    async fn rasterize(
        &self,
        path: &Path,
        output_dir: &Path,
        _dpi: u32,
    ) -> Result<Vec<PageImage>> {
        self.rasterized
            .lock()
            .expect("lock poisoned")
            .push(document_key(path)?);
        let document = self.document(path)?;
        if document.fail_rasterize {
            return Err(anyhow!("corrupt document {:?}", path.display()));
        }
        let mut images = vec![];
        for page_idx in 0..document.pages.len() {
            let image = output_dir.join(format!("page-{page_idx}.png"));
            tokio::fs::write(&image, b"fake image").await?;
            self.written.lock().expect("lock poisoned").push(image.clone());
            images.push(PageImage {
                source: path.to_owned(),
                page_idx,
                path: image,
                mime_type: "image/png".to_owned(),
            });
        }
        Ok(images)
    }
}

#[async_trait]
impl Recognizer for FakeServices {
    async fn recognize(&self, image: &PageImage) -> Result<TextAnnotation> {
        let document = self.document(&image.source)?;
        if let Some(delay) = document.recognize_delay {
            tokio::time::sleep(delay).await;
        }
        if document.fail_recognize_page == Some(image.page_idx) {
            return Err(anyhow!("service rejected page {}", image.page_idx));
        }
        self.recognized
            .lock()
            .expect("lock poisoned")
            .insert((document_key(&image.source)?, image.page_idx));

        // Lay words out left to right on a 1000×1000 page.
        let words = document.pages[image.page_idx]
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let left = 100.0 * i as f64;
                Word {
                    symbols: vec![Symbol {
                        text: (*text).to_owned(),
                    }],
                    bounding_box: BoundingPoly {
                        vertices: vec![
                            Vertex { x: left, y: 100.0 },
                            Vertex {
                                x: left + 80.0,
                                y: 100.0,
                            },
                            Vertex {
                                x: left + 80.0,
                                y: 150.0,
                            },
                            Vertex { x: left, y: 150.0 },
                        ],
                    },
                }
            })
            .collect();
        Ok(TextAnnotation {
            pages: vec![AnnotatedPage {
                width: 1000.0,
                height: 1000.0,
                blocks: vec![Block {
                    paragraphs: vec![Paragraph { words }],
                }],
            }],
            text: document.pages[image.page_idx].join(" "),
        })
    }
}

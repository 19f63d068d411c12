//! A recognizer that replays stored annotations instead of calling a service.
//!
//! For a source document `scans/letter.pdf`, annotations are read from
//! `scans/letter.ocr.json`, a JSON array holding one [`TextAnnotation`] per
//! page. This makes the whole pipeline testable offline.

use crate::{prelude::*, rasterize::PageImage};

use super::{Recognizer, TextAnnotation};

/// Replays `<stem>.ocr.json` files stored next to each source document.
pub struct FixtureRecognizer;

impl FixtureRecognizer {
    /// Where we look for the annotations of `source`.
    pub fn annotations_path(source: &Path) -> PathBuf {
        source.with_extension("ocr.json")
    }
}

#[async_trait]
impl Recognizer for FixtureRecognizer {
    #[instrument(level = "debug", skip_all, fields(source = %image.source.display(), page = %image.page_idx))]
    async fn recognize(&self, image: &PageImage) -> Result<TextAnnotation> {
        let path = Self::annotations_path(&image.source);
        let data = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read annotations from {:?}", path.display()))?;
        let mut pages: Vec<TextAnnotation> = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse annotations in {:?}", path.display()))?;
        if image.page_idx >= pages.len() {
            return Err(anyhow!(
                "{:?} has no annotation for page {}",
                path.display(),
                image.page_idx
            ));
        }
        Ok(pages.swap_remove(image.page_idx))
    }
}

//! Recognition using AWS Textract.

use std::collections::HashMap;

use aws_config::BehaviorVersion;
use aws_sdk_textract::{
    primitives::Blob,
    types::{Block as TextractBlock, BlockType, RelationshipType},
};
use leaky_bucket::RateLimiter;

use crate::{prelude::*, rasterize::PageImage, rate_limit::RateLimit};

use super::{
    AnnotatedPage, Block, BoundingPoly, Paragraph, Recognizer, Symbol, TextAnnotation, Vertex,
    Word,
};

/// Recognizer wrapping Textract's `DetectDocumentText`.
pub struct TextractRecognizer {
    client: aws_sdk_textract::Client,
    rate_limiter: RateLimiter,
}

impl TextractRecognizer {
    /// Create a recognizer from the standard AWS configuration sources.
    ///
    /// Returns `None` if no region or credential provider could be found.
    pub async fn from_env(rate_limit: &RateLimit) -> Result<Option<Self>> {
        let config = aws_config::load_defaults(BehaviorVersion::v2025_01_17()).await;
        if config.region().is_none() || config.credentials_provider().is_none() {
            return Ok(None);
        }
        Ok(Some(Self {
            client: aws_sdk_textract::Client::new(&config),
            rate_limiter: rate_limit.to_rate_limiter(),
        }))
    }
}

#[async_trait]
impl Recognizer for TextractRecognizer {
    #[instrument(level = "debug", skip_all, fields(source = %image.source.display(), page = %image.page_idx))]
    async fn recognize(&self, image: &PageImage) -> Result<TextAnnotation> {
        let document = aws_sdk_textract::types::Document::builder()
            .bytes(Blob::new(image.read().await?))
            .build();

        self.rate_limiter.acquire_one().await;
        let response = self
            .client
            .detect_document_text()
            .document(document)
            .send()
            .await
            .map_err(|e| anyhow!("AWS Textract error: {e:?}"))?;
        trace!("Document response: {response:#?}");
        annotation_from_blocks(response.blocks())
    }
}

/// Convert Textract blocks into a [`TextAnnotation`].
///
/// Each `LINE` becomes a paragraph holding its child `WORD`s. Textract
/// polygons are already fractions of the page, so the page is 1×1.
fn annotation_from_blocks(blocks: &[TextractBlock]) -> Result<TextAnnotation> {
    let blocks_by_id = blocks
        .iter()
        .filter_map(|block| Some((block.id()?, block)))
        .collect::<HashMap<_, _>>();

    let mut paragraphs = vec![];
    let mut lines = vec![];
    for line in blocks
        .iter()
        .filter(|b| b.block_type() == Some(&BlockType::Line))
    {
        let mut words = vec![];
        for relationship in line.relationships() {
            if relationship.r#type() != Some(&RelationshipType::Child) {
                continue;
            }
            for id in relationship.ids() {
                let child = blocks_by_id
                    .get(id.as_str())
                    .ok_or_else(|| anyhow!("Textract child block {} not found", id))?;
                if child.block_type() == Some(&BlockType::Word) {
                    words.push(word_from_block(child));
                }
            }
        }
        if let Some(text) = line.text() {
            lines.push(text);
        }
        paragraphs.push(Paragraph { words });
    }

    Ok(TextAnnotation {
        pages: vec![AnnotatedPage {
            width: 1.0,
            height: 1.0,
            blocks: vec![Block { paragraphs }],
        }],
        text: lines.join("\n"),
    })
}

fn word_from_block(block: &TextractBlock) -> Word {
    let vertices = block
        .geometry()
        .map(|geometry| {
            geometry
                .polygon()
                .iter()
                .map(|point| Vertex {
                    x: f64::from(point.x()),
                    y: f64::from(point.y()),
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    Word {
        symbols: vec![Symbol {
            text: block.text().unwrap_or_default().to_owned(),
        }],
        bounding_box: BoundingPoly { vertices },
    }
}

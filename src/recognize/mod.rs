//! Text recognition engines.
//!
//! Every engine turns one page image into a [`TextAnnotation`], which follows
//! the shape of Google Cloud Vision's `fullTextAnnotation`: pages contain
//! blocks, blocks contain paragraphs, paragraphs contain words, and each word
//! has symbol fragments plus a four-vertex bounding polygon in pixels.

use std::{sync::Arc, time::Duration};

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::{error::IndexError, prelude::*, rasterize::PageImage, rate_limit::RateLimit};

pub mod fixture;
pub mod textract;
pub mod vision;

/// The result of recognizing a single page image.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextAnnotation {
    #[serde(default)]
    pub pages: Vec<AnnotatedPage>,
    /// Plain text as reported by the service. Informational only.
    #[serde(default)]
    pub text: String,
}

/// One page of a [`TextAnnotation`]. Dimensions are in the same units as
/// the word vertices.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotatedPage {
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub blocks: Vec<Block>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    #[serde(default)]
    pub paragraphs: Vec<Paragraph>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paragraph {
    #[serde(default)]
    pub words: Vec<Word>,
}

/// A recognized word.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Word {
    #[serde(default)]
    pub symbols: Vec<Symbol>,
    /// Vertices in order: upper-left, upper-right, lower-right, lower-left
    /// relative to the text's reading direction. Not necessarily
    /// axis-aligned.
    #[serde(default)]
    pub bounding_box: BoundingPoly,
}

impl Word {
    /// Concatenate all our symbol fragments.
    pub fn text(&self) -> String {
        self.symbols.iter().map(|s| s.text.as_str()).collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    #[serde(default)]
    pub text: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingPoly {
    #[serde(default)]
    pub vertices: Vec<Vertex>,
}

/// A polygon vertex. Vision omits coordinates that are zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

/// Interface to a text recognition service.
#[async_trait]
pub trait Recognizer: Send + Sync + 'static {
    /// Recognize the text on a single page image.
    async fn recognize(&self, image: &PageImage) -> Result<TextAnnotation>;
}

/// Which recognition engine to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// Google Cloud Vision document text detection.
    #[default]
    Vision,
    /// AWS Textract.
    Textract,
    /// Read `<name>.ocr.json` files stored next to each input.
    Fixture,
}

/// Options for recognition.
#[derive(Args, Clone, Debug)]
pub struct RecognizeOpts {
    /// Recognition engine.
    #[clap(long, value_enum, default_value_t = EngineKind::default())]
    pub engine: EngineKind,

    /// Google Cloud Vision API key.
    #[clap(long, env = "GOOGLE_VISION_API_KEY", hide_env_values = true)]
    pub vision_api_key: Option<String>,

    /// Override the Google Cloud Vision server URL.
    #[clap(
        long,
        env = "GOOGLE_VISION_API_BASE",
        default_value = vision::DEFAULT_API_BASE
    )]
    pub vision_api_base: String,

    /// Rate limit for recognition requests, e.g. "10/s" or "600/m".
    #[clap(long, default_value = "10/s")]
    pub rate_limit: RateLimit,

    /// Deadline in seconds for each rasterization or recognition call.
    /// Vision retries transient errors within this deadline, backing off
    /// for at most half of it.
    #[clap(long, default_value = "120")]
    pub timeout: u64,
}

impl RecognizeOpts {
    /// Per-call adapter deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Build the configured recognizer.
///
/// Returns `Ok(None)` when the engine has no usable credential. Operations
/// that need recognition report that as [`IndexError::Configuration`], so
/// storage-only commands still work without one.
pub async fn recognizer_for_opts(
    opts: &RecognizeOpts,
) -> Result<Option<Arc<dyn Recognizer>>> {
    match opts.engine {
        EngineKind::Vision => Ok(opts.vision_api_key.as_deref().map(|key| {
            Arc::new(vision::VisionRecognizer::new(
                &opts.vision_api_base,
                key,
                &opts.rate_limit,
                opts.timeout(),
            )) as Arc<dyn Recognizer>
        })),
        EngineKind::Textract => {
            Ok(textract::TextractRecognizer::from_env(&opts.rate_limit)
                .await?
                .map(|engine| Arc::new(engine) as Arc<dyn Recognizer>))
        }
        EngineKind::Fixture => Ok(Some(Arc::new(fixture::FixtureRecognizer))),
    }
}

/// Describe why [`recognizer_for_opts`] returned nothing.
pub fn missing_credential_error(engine: EngineKind) -> IndexError {
    let hint = match engine {
        EngineKind::Vision => "set GOOGLE_VISION_API_KEY or pass --vision-api-key",
        EngineKind::Textract => "no AWS credentials or region were found",
        EngineKind::Fixture => "fixture engine unavailable",
    };
    IndexError::Configuration(hint.to_owned())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn parses_vision_annotation_with_missing_zero_coordinates() {
        let json = r#"{
            "pages": [{
                "width": 100,
                "height": 200,
                "blocks": [{
                    "paragraphs": [{
                        "words": [{
                            "boundingBox": {
                                "vertices": [
                                    {"y": 10},
                                    {"x": 20, "y": 10},
                                    {"x": 20, "y": 30},
                                    {"y": 30}
                                ]
                            },
                            "symbols": [{"text": "H"}, {"text": "i"}]
                        }]
                    }]
                }]
            }],
            "text": "Hi\n"
        }"#;
        let annotation: TextAnnotation = serde_json::from_str(json).unwrap();
        let page = &annotation.pages[0];
        assert_eq!(page.width, 100.0);
        let word = &page.blocks[0].paragraphs[0].words[0];
        assert_eq!(word.text(), "Hi");
        assert_eq!(word.bounding_box.vertices[0], Vertex { x: 0.0, y: 10.0 });
    }

    #[tokio::test]
    async fn vision_without_key_is_unconfigured() {
        let opts = RecognizeOpts {
            engine: EngineKind::Vision,
            vision_api_key: None,
            vision_api_base: vision::DEFAULT_API_BASE.to_owned(),
            rate_limit: RateLimit::from_str("1/s").unwrap(),
            timeout: 1,
        };
        assert!(recognizer_for_opts(&opts).await.unwrap().is_none());
        assert!(matches!(
            missing_credential_error(opts.engine),
            IndexError::Configuration(_)
        ));
    }
}

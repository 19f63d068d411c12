//! Documents and the positioned text records we store for them.

use serde::{Deserialize, Serialize};

use crate::{error::IndexError, prelude::*};

/// A processed source file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Key derived from the file name. See [`document_key`].
    pub file_name: String,
    /// Number of pages we rasterized, including pages with no text.
    pub page_count: usize,
}

/// A fractional bounding box, with the origin at the top-left of the page.
///
/// All coordinates lie in `[0, 1]`, with `left <= right` and `top <= bottom`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl BoundingBox {
    /// Do our coordinates satisfy our invariants?
    #[cfg(test)]
    pub fn is_normalized(&self) -> bool {
        let unit = 0.0..=1.0;
        unit.contains(&self.left)
            && unit.contains(&self.top)
            && unit.contains(&self.right)
            && unit.contains(&self.bottom)
            && self.left <= self.right
            && self.top <= self.bottom
    }
}

/// A single recognized token on a page.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageText {
    /// Insertion-order identifier. `None` until the record is persisted, and
    /// always `None` for records produced by a live scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// The key of the owning [`Document`].
    pub document_id: String,
    /// 0-based page number.
    pub page_number: usize,
    /// Sanitized token text. Never empty.
    pub text: String,
    #[serde(flatten)]
    pub bbox: BoundingBox,
}

/// Derive a document key from a path: the file name without its final
/// extension, with surrounding whitespace trimmed.
///
/// Keys are case-sensitive, so `Report.pdf` and `report.pdf` are different
/// documents.
pub fn document_key(path: &Path) -> Result<String, IndexError> {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().trim().to_owned())
        .unwrap_or_default();
    if stem.is_empty() {
        return Err(IndexError::Validation(format!(
            "cannot derive a document key from {:?}",
            path.display()
        )));
    }
    Ok(stem)
}

/// Group a document's records into per-page text, joining tokens on each page
/// with a single space.
///
/// `records` must already be in `(page_number, id)` order. Pages without any
/// records come back as empty strings.
pub fn page_texts(page_count: usize, records: &[PageText]) -> Vec<String> {
    let last_page = records.iter().map(|r| r.page_number + 1).max().unwrap_or(0);
    let mut pages = vec![String::new(); page_count.max(last_page)];
    for record in records {
        let page = &mut pages[record.page_number];
        if !page.is_empty() {
            page.push(' ');
        }
        page.push_str(&record.text);
    }
    pages
}

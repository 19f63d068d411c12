//! Turn raw recognition output into sanitized, resolution-independent
//! [`PageText`] records.

use crate::{
    model::{BoundingBox, PageText},
    prelude::*,
    recognize::{TextAnnotation, Vertex},
};

/// Keep only ASCII letters, digits, spaces and hyphens.
pub fn sanitize_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ' || *c == '-')
        .collect()
}

/// Normalize a search term the way stored tokens are compared: trimmed,
/// sanitized and uppercased. Returns `None` if nothing is left.
pub fn normalize_query_token(raw: &str) -> Option<String> {
    let token = sanitize_token(raw.trim()).to_ascii_uppercase();
    if token.is_empty() { None } else { Some(token) }
}

/// Compute a fractional bounding box from a word polygon.
///
/// Vertices are paired across the polygon's diagonals, so slightly rotated
/// words still get a box that covers them. Each axis is then put in order,
/// since the first vertex of upside-down text is at its lower right. Returns
/// `None` for degenerate input.
pub fn bounding_box(vertices: &[Vertex], width: f64, height: f64) -> Option<BoundingBox> {
    let [v0, v1, v2, v3] = vertices else {
        return None;
    };
    if !(width > 0.0 && height > 0.0) {
        return None;
    }

    // Services occasionally report vertices a pixel or two outside the image.
    let frac = |value: f64, extent: f64| (value / extent).clamp(0.0, 1.0);
    let (x0, x1) = (v0.x.min(v3.x), v2.x.max(v1.x));
    let (y0, y1) = (v0.y.min(v1.y), v2.y.max(v3.y));
    Some(BoundingBox {
        left: frac(x0.min(x1), width),
        top: frac(y0.min(y1), height),
        right: frac(x0.max(x1), width),
        bottom: frac(y0.max(y1), height),
    })
}

/// Convert every word in `annotation` into a [`PageText`] for `page_number`
/// of document `key`, in reading order.
///
/// Words that sanitize to nothing are dropped, as are words whose geometry
/// we can't interpret.
pub fn normalize_annotation(
    annotation: &TextAnnotation,
    key: &str,
    page_number: usize,
) -> Vec<PageText> {
    let mut records = vec![];
    for page in &annotation.pages {
        let words = page
            .blocks
            .iter()
            .flat_map(|block| &block.paragraphs)
            .flat_map(|paragraph| &paragraph.words);
        for word in words {
            let text = sanitize_token(&word.text());
            if text.is_empty() {
                continue;
            }
            let Some(bbox) =
                bounding_box(&word.bounding_box.vertices, page.width, page.height)
            else {
                debug!(
                    key,
                    page_number,
                    %text,
                    vertices = word.bounding_box.vertices.len(),
                    width = page.width,
                    height = page.height,
                    "Skipping word with unusable geometry"
                );
                continue;
            };
            records.push(PageText {
                id: None,
                document_id: key.to_owned(),
                page_number,
                text,
                bbox,
            });
        }
    }
    records
}

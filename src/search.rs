//! Token search over stored records.

use std::collections::{BTreeMap, HashSet};

use crate::{
    error::IndexError,
    model::PageText,
    prelude::*,
    storage::{Storage, TextPredicate},
};

/// Group matching records by document, keeping each document's distinct
/// tokens in the order they were first seen.
///
/// `records` should be in `(document, page, id)` order. Tokens are
/// deduplicated by their exact stored text, so "Hello" and "HELLO" are both
/// kept.
pub fn group_tokens_by_document(records: &[PageText]) -> BTreeMap<String, Vec<String>> {
    let mut found: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut seen = HashSet::new();
    for record in records {
        if seen.insert((record.document_id.as_str(), record.text.as_str())) {
            found
                .entry(record.document_id.clone())
                .or_default()
                .push(record.text.clone());
        }
    }
    found
}

/// Fetch every record matching `predicate`, optionally limited to the
/// documents in `scope`.
async fn query_scoped(
    storage: &dyn Storage,
    predicate: &TextPredicate,
    scope: Option<&[String]>,
) -> Result<Vec<PageText>, IndexError> {
    if predicate.is_empty() {
        return Ok(vec![]);
    }
    match scope {
        Some(keys) => storage.query_by_keys(keys, predicate).await,
        None => storage.query_all(predicate).await,
    }
}

/// Which documents contain any of `tokens`, and which of the tokens did
/// each contain?
///
/// Matching is case-insensitive but exact: "hell" does not find "Hello".
#[instrument(level = "debug", skip_all, fields(tokens = tokens.len()))]
pub async fn find_documents<S: AsRef<str> + Sync>(
    storage: &dyn Storage,
    tokens: &[S],
    scope: Option<&[String]>,
) -> Result<BTreeMap<String, Vec<String>>, IndexError> {
    let predicate = TextPredicate::token_in(tokens);
    let records = query_scoped(storage, &predicate, scope).await?;
    let found = group_tokens_by_document(&records);
    debug!(documents = found.len(), "Found documents");
    Ok(found)
}

/// Every record matching any of `tokens`.
#[instrument(level = "debug", skip_all, fields(tokens = tokens.len()))]
pub async fn search_documents<S: AsRef<str> + Sync>(
    storage: &dyn Storage,
    tokens: &[S],
    scope: Option<&[String]>,
) -> Result<Vec<PageText>, IndexError> {
    let predicate = TextPredicate::token_in(tokens);
    query_scoped(storage, &predicate, scope).await
}

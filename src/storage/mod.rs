//! Persistence for documents and their page text.

use std::collections::HashSet;

use crate::{
    error::IndexError,
    model::{Document, PageText},
    normalize::normalize_query_token,
    prelude::*,
};

pub mod sqlite;

/// Which records a query should return.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TextPredicate {
    /// Every record.
    Any,
    /// Records whose uppercased text equals one of these tokens. Tokens must
    /// already be normalized with [`normalize_query_token`].
    TokenIn(Vec<String>),
}

impl TextPredicate {
    /// Build a [`TextPredicate::TokenIn`] from raw search terms, dropping
    /// terms that normalize to nothing and duplicates.
    pub fn token_in<S: AsRef<str>>(tokens: &[S]) -> Self {
        let mut seen = HashSet::new();
        TextPredicate::TokenIn(
            tokens
                .iter()
                .filter_map(|t| normalize_query_token(t.as_ref()))
                .filter(|t| seen.insert(t.clone()))
                .collect(),
        )
    }

    /// Would this predicate match nothing at all?
    pub fn is_empty(&self) -> bool {
        matches!(self, TextPredicate::TokenIn(tokens) if tokens.is_empty())
    }

    /// Does `record` satisfy this predicate?
    pub fn matches(&self, record: &PageText) -> bool {
        match self {
            TextPredicate::Any => true,
            TextPredicate::TokenIn(tokens) => {
                let text = record.text.to_ascii_uppercase();
                tokens.iter().any(|t| *t == text)
            }
        }
    }
}

/// A store for [`Document`]s and their [`PageText`] records.
///
/// Implementations must make [`insert_atomic`](Self::insert_atomic) all or
/// nothing, and deleting a document must remove its records.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Is there a document with this key?
    async fn exists(&self, key: &str) -> Result<bool, IndexError>;

    /// Look up a document.
    async fn document(&self, key: &str) -> Result<Option<Document>, IndexError>;

    /// Delete a document and all its records. Returns `false` if there was
    /// nothing to delete.
    async fn delete(&self, key: &str) -> Result<bool, IndexError>;

    /// Insert a document and its records as a single unit.
    async fn insert_atomic(
        &self,
        document: &Document,
        records: &[PageText],
    ) -> Result<(), IndexError>;

    /// Records belonging to any of `keys` that match `predicate`, ordered by
    /// document, page and id.
    async fn query_by_keys(
        &self,
        keys: &[String],
        predicate: &TextPredicate,
    ) -> Result<Vec<PageText>, IndexError>;

    /// All records matching `predicate`, ordered by document, page and id.
    async fn query_all(&self, predicate: &TextPredicate)
    -> Result<Vec<PageText>, IndexError>;

    /// All records of one document, ordered by page and id.
    async fn query_by_key_ordered(&self, key: &str) -> Result<Vec<PageText>, IndexError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::record;

    #[test]
    fn token_predicates_are_normalized_and_deduplicated() {
        let predicate = TextPredicate::token_in(&["hello", " HELLO ", "wor,ld", "??"]);
        assert_eq!(
            predicate,
            TextPredicate::TokenIn(vec!["HELLO".to_owned(), "WORLD".to_owned()])
        );
        assert!(TextPredicate::token_in(&["!!"]).is_empty());
        assert!(!TextPredicate::Any.is_empty());
    }

    #[test]
    fn predicates_match_exact_tokens_only() {
        let predicate = TextPredicate::token_in(&["world"]);
        assert!(predicate.matches(&record("A", 0, "World")));
        assert!(!predicate.matches(&record("A", 0, "Worldwide")));
        assert!(TextPredicate::Any.matches(&record("A", 0, "anything")));
    }
}

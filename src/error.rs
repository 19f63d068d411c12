//! Typed errors for indexing and search.
//!
//! Adapters (rasterization, recognition) return [`anyhow::Result`] with as
//! much context as they can gather. The pipeline folds those into
//! [`IndexError`], which is what callers of [`crate::index::PageIndex`] see.

use std::{fmt, time::Duration};

use serde::Serialize;
use thiserror::Error;

/// The adapter call that failed for a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterStage {
    Rasterize,
    Recognize,
}

impl fmt::Display for AdapterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterStage::Rasterize => write!(f, "rasterization"),
            AdapterStage::Recognize => write!(f, "recognition"),
        }
    }
}

/// Everything that can go wrong while indexing or searching documents.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The recognition service cannot be used (missing credential, bad
    /// endpoint). Raised before any work begins.
    #[error("recognition is not configured: {0}")]
    Configuration(String),

    /// An adapter call failed for a single document.
    #[error("{stage} failed for {key:?}: {detail}")]
    Adapter {
        key: String,
        stage: AdapterStage,
        detail: String,
    },

    /// An adapter call ran past its deadline.
    #[error("{stage} timed out for {key:?} after {}s", .timeout.as_secs())]
    AdapterTimeout {
        key: String,
        stage: AdapterStage,
        timeout: Duration,
    },

    /// The storage back end failed. Never retried.
    #[error("storage error: {0}")]
    Storage(String),

    /// The caller passed something we can't work with.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Cancellation was requested before this document finished an
    /// adapter stage.
    #[error("operation cancelled")]
    Cancelled,
}

impl IndexError {
    /// Wrap an adapter failure for the document `key`.
    pub fn adapter(key: &str, stage: AdapterStage, err: anyhow::Error) -> Self {
        IndexError::Adapter {
            key: key.to_owned(),
            stage,
            // `{:?}` on `anyhow::Error` includes the whole context chain.
            detail: format!("{err:?}"),
        }
    }
}

impl From<rusqlite::Error> for IndexError {
    fn from(err: rusqlite::Error) -> Self {
        IndexError::Storage(err.to_string())
    }
}

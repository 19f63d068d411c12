//! Decide which candidate paths an ingestion run should actually process.

use std::collections::HashSet;

use crate::{error::IndexError, model::document_key, prelude::*, storage::Storage};

/// A candidate path with its derived document key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// Position in the caller's input, so outcomes can be reported in order.
    pub index: usize,
    pub path: PathBuf,
    pub key: String,
}

/// A candidate we won't process, and why.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedCandidate {
    pub candidate: Candidate,
    pub reason: String,
}

/// An input path we can't derive a document key from.
#[derive(Debug)]
pub struct RejectedPath {
    pub index: usize,
    pub path: PathBuf,
    pub error: IndexError,
}

/// The result of [`resolve_paths`].
#[derive(Debug, Default)]
pub struct ResolvedPaths {
    pub to_process: Vec<Candidate>,
    pub skipped: Vec<SkippedCandidate>,
    pub rejected: Vec<RejectedPath>,
}

/// Filter or purge candidates against what's already stored.
///
/// With `override_existing`, every stored document matching a candidate is
/// deleted (with its records), and all candidates are returned. Otherwise,
/// candidates whose document already exists are skipped.
///
/// Either way, only the first of several candidates sharing a key is
/// processed. Paths without a usable file name are rejected individually,
/// and keys are derived for every path before anything is deleted.
#[instrument(level = "debug", skip_all, fields(candidates = paths.len(), override_existing))]
pub async fn resolve_paths(
    storage: &dyn Storage,
    paths: &[PathBuf],
    override_existing: bool,
) -> Result<ResolvedPaths, IndexError> {
    if paths.is_empty() {
        return Err(IndexError::Validation("no document paths given".to_owned()));
    }

    let mut resolved = ResolvedPaths::default();
    let mut candidates = vec![];
    let mut seen_keys = HashSet::new();
    for (index, path) in paths.iter().enumerate() {
        let key = match document_key(path) {
            Ok(key) => key,
            Err(error) => {
                warn!(path = %path.display(), "Rejecting path: {error}");
                resolved.rejected.push(RejectedPath {
                    index,
                    path: path.clone(),
                    error,
                });
                continue;
            }
        };
        let candidate = Candidate {
            index,
            path: path.clone(),
            key,
        };
        if seen_keys.insert(candidate.key.clone()) {
            candidates.push(candidate);
        } else {
            resolved.skipped.push(SkippedCandidate {
                reason: format!(
                    "another path in this batch already has document key {:?}",
                    candidate.key
                ),
                candidate,
            });
        }
    }

    for candidate in candidates {
        if override_existing {
            if storage.delete(&candidate.key).await? {
                debug!(key = %candidate.key, "Purged existing document");
            }
        } else if storage.exists(&candidate.key).await? {
            resolved.skipped.push(SkippedCandidate {
                reason: format!("document {:?} is already indexed", candidate.key),
                candidate,
            });
            continue;
        }
        resolved.to_process.push(candidate);
    }

    if resolved.to_process.is_empty() {
        info!("Nothing to process");
    }
    Ok(resolved)
}

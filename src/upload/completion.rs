//! Completion Index
//!
//! Tracks which fingerprints already have a merged artifact. There is no
//! ledger: a fingerprint is complete when `<root>/merged/<fingerprint>/`
//! holds a committed file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;

use super::types::{Fingerprint, UploadError};

/// Directory under the storage root holding completed artifacts
pub const MERGED_DIR: &str = "merged";

/// Content-addressed record of finished uploads
#[derive(Clone)]
pub struct CompletionIndex {
    inner: Arc<CompletionIndexInner>,
}

struct CompletionIndexInner {
    /// `<storage root>/merged`
    base_path: PathBuf,
}

impl CompletionIndex {
    pub fn new(storage_root: impl AsRef<Path>) -> Self {
        Self {
            inner: Arc::new(CompletionIndexInner {
                base_path: storage_root.as_ref().join(MERGED_DIR),
            }),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.inner.base_path
    }

    pub fn namespace_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.inner.base_path.join(fingerprint.as_str())
    }

    /// Final location of an artifact
    pub fn artifact_path(&self, fingerprint: &Fingerprint, file_name: &str) -> PathBuf {
        self.namespace_path(fingerprint).join(file_name)
    }

    /// Where a merge writes before committing.
    ///
    /// Hidden, so it never counts towards completion.
    pub fn staging_path(&self, fingerprint: &Fingerprint, file_name: &str) -> PathBuf {
        self.namespace_path(fingerprint)
            .join(format!(".{file_name}.partial"))
    }

    /// True iff a committed artifact exists for `fingerprint`
    pub async fn is_complete(&self, fingerprint: &Fingerprint) -> Result<bool, UploadError> {
        Ok(!self.artifacts(fingerprint).await?.is_empty())
    }

    /// Names of committed artifacts for `fingerprint`, sorted
    pub async fn artifacts(&self, fingerprint: &Fingerprint) -> Result<Vec<String>, UploadError> {
        let mut entries = match fs::read_dir(self.namespace_path(fingerprint)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type().await?.is_file() {
                continue;
            }
            names.push(name);
        }

        names.sort();
        Ok(names)
    }

    /// Remove the artifact namespace if a failed merge left it empty
    pub async fn prune_empty_namespace(&self, fingerprint: &Fingerprint) {
        let namespace = self.namespace_path(fingerprint);
        match fs::remove_dir(&namespace).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            // Usually non-empty: an earlier artifact lives here
            Err(e) => tracing::debug!(
                path = %namespace.display(),
                error = %e,
                "Artifact namespace kept"
            ),
        }
    }
}

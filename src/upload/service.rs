//! Upload Service
//!
//! The three protocol operations (check, upload chunk, merge) on top of the
//! chunk store, merge engine and completion index, plus expiry of chunk
//! sets that were abandoned half-way.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};

use super::chunk_store::ChunkStore;
use super::completion::CompletionIndex;
use super::locks::FingerprintLocks;
use super::merge::MergeEngine;
use super::types::{CheckStatus, ChunkIndex, Fingerprint, MergeOutcome, UploadError};

/// Entry point for the chunked upload protocol
#[derive(Clone)]
pub struct UploadService {
    storage_root: PathBuf,
    chunk_store: ChunkStore,
    completion: CompletionIndex,
    merge_engine: MergeEngine,
    locks: FingerprintLocks,
}

impl UploadService {
    /// Create a service storing everything under `storage_root`
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        let storage_root = storage_root.into();
        let chunk_store = ChunkStore::new(&storage_root);
        let completion = CompletionIndex::new(&storage_root);
        let locks = FingerprintLocks::new();
        let merge_engine = MergeEngine::new(chunk_store.clone(), completion.clone(), locks.clone());

        Self {
            storage_root,
            chunk_store,
            completion,
            merge_engine,
            locks,
        }
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.chunk_store
    }

    pub fn completion(&self) -> &CompletionIndex {
        &self.completion
    }

    /// Create both namespace roots
    pub async fn prepare(&self) -> Result<(), UploadError> {
        tokio::fs::create_dir_all(self.chunk_store.base_path()).await?;
        tokio::fs::create_dir_all(self.completion.base_path()).await?;
        Ok(())
    }

    // ========================================================================
    // Protocol
    // ========================================================================

    /// Where is the upload for `fingerprint` at?
    ///
    /// A committed artifact wins over any stale chunk namespace.
    pub async fn check(&self, fingerprint: &Fingerprint) -> Result<CheckStatus, UploadError> {
        if self.completion.is_complete(fingerprint).await? {
            tracing::debug!(fingerprint = %fingerprint, "Artifact exists, upload can be skipped");
            return Ok(CheckStatus::Complete);
        }

        let status = match self.chunk_store.has_chunks(fingerprint).await? {
            None => CheckStatus::NotStarted,
            Some(present) => CheckStatus::InProgress(present),
        };

        tracing::debug!(
            fingerprint = %fingerprint,
            result_code = status.result_code(),
            "Upload checked"
        );

        Ok(status)
    }

    /// Store one chunk and return how many chunks are present afterwards.
    ///
    /// `checksum`, when given, is the SHA-256 hex digest of `data`. Chunks
    /// arriving while a merge holds the fingerprint are rejected.
    pub async fn upload_chunk(
        &self,
        fingerprint: &Fingerprint,
        index: ChunkIndex,
        data: &[u8],
        checksum: Option<&str>,
    ) -> Result<usize, UploadError> {
        if let Some(expected) = checksum {
            let actual = compute_hash(data);
            if !actual.eq_ignore_ascii_case(expected) {
                tracing::warn!(
                    fingerprint = %fingerprint,
                    chunk_index = %index,
                    expected = %expected,
                    actual = %actual,
                    "Chunk checksum mismatch"
                );
                return Err(UploadError::ChunkHashMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let _permit = self.locks.begin_upload(fingerprint).inspect_err(|e| {
            tracing::warn!(fingerprint = %fingerprint, chunk_index = %index, error = %e, "Chunk rejected");
        })?;

        self.chunk_store.put_chunk(fingerprint, index, data).await
    }

    /// Merge every stored chunk of `fingerprint` into `file_name`
    pub async fn merge(
        &self,
        fingerprint: &Fingerprint,
        file_name: &str,
    ) -> Result<MergeOutcome, UploadError> {
        self.merge_engine.merge(fingerprint, file_name).await
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Remove chunk namespaces untouched for at least `max_age`.
    ///
    /// Fingerprints with an upload or merge in flight are skipped. Returns
    /// the number of namespaces removed.
    pub async fn sweep_stale(&self, max_age: Duration) -> Result<usize, UploadError> {
        let mut removed = 0;

        for fingerprint in self.chunk_store.stale_namespaces(max_age).await? {
            let Some(_permit) = self.locks.try_begin_merge(&fingerprint) else {
                tracing::debug!(fingerprint = %fingerprint, "Skipping busy fingerprint");
                continue;
            };

            match self.chunk_store.delete_namespace(&fingerprint).await {
                Ok(true) => {
                    tracing::debug!(fingerprint = %fingerprint, "Removed abandoned chunks");
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    fingerprint = %fingerprint,
                    error = %e,
                    "Failed to remove abandoned chunks"
                ),
            }
        }

        if removed > 0 {
            tracing::info!(count = removed, "Swept abandoned chunk namespaces");
        }

        Ok(removed)
    }

    /// Start background sweeping of abandoned uploads
    pub fn start_sweeper(self, interval: Duration, max_age: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_stale(max_age).await {
                    tracing::warn!(error = %e, "Chunk sweep failed");
                }
            }
        })
    }
}

/// Compute SHA-256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ============================================================================
// Tests
// ============================================================================

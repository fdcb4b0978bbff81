//! Merge Engine
//!
//! Concatenates every stored chunk of a fingerprint, in ascending index
//! order, into one artifact file.
//!
//! The output is assembled under a hidden staging name inside the artifact
//! namespace and renamed into place once every chunk has been appended;
//! that rename is what makes the fingerprint complete. Chunks are deleted
//! as soon as they have been transferred. Any I/O failure aborts the merge
//! and removes the staging output together with the whole chunk namespace,
//! so a failed merge always leaves the fingerprint in the `NotStarted`
//! state. A committed artifact is never replaced: merging a fingerprint
//! that is already complete discards its chunks and fails with
//! `AlreadyMerged`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use tokio::fs;

use super::chunk_store::{ChunkStore, StoredChunk};
use super::completion::CompletionIndex;
use super::locks::FingerprintLocks;
use super::types::{validate_file_name, Fingerprint, MergeOutcome, UploadError};

/// Assembles chunk sets into artifacts
#[derive(Clone)]
pub struct MergeEngine {
    chunk_store: ChunkStore,
    completion: CompletionIndex,
    locks: FingerprintLocks,
}

impl MergeEngine {
    pub fn new(chunk_store: ChunkStore, completion: CompletionIndex, locks: FingerprintLocks) -> Self {
        Self {
            chunk_store,
            completion,
            locks,
        }
    }

    /// Merge all chunks of `fingerprint` into `<merged>/<fingerprint>/<file_name>`.
    ///
    /// Completeness is the caller's business: whatever chunks are present
    /// get merged. `EmptyUpload` and `MalformedIndex` are detected before
    /// anything on disk is touched.
    pub async fn merge(
        &self,
        fingerprint: &Fingerprint,
        file_name: &str,
    ) -> Result<MergeOutcome, UploadError> {
        validate_file_name(file_name)?;

        let _permit = self.locks.begin_merge(fingerprint).await?;

        if self.completion.is_complete(fingerprint).await? {
            self.discard_stale_chunks(fingerprint).await;
            return Err(UploadError::AlreadyMerged(fingerprint.clone()));
        }

        let chunks = self.chunk_store.list_chunks(fingerprint).await?;
        if chunks.is_empty() {
            return Err(UploadError::EmptyUpload(fingerprint.clone()));
        }

        tracing::info!(
            fingerprint = %fingerprint,
            file_name = %file_name,
            chunks = chunks.len(),
            "Merging chunks"
        );

        let started = Instant::now();
        match self.assemble(fingerprint, file_name, &chunks).await {
            Ok(outcome) => {
                tracing::info!(
                    fingerprint = %fingerprint,
                    file_name = %file_name,
                    chunks = outcome.chunks_merged,
                    bytes = outcome.bytes_written,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Merge complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(
                    fingerprint = %fingerprint,
                    file_name = %file_name,
                    error = %e,
                    "Merge failed, discarding upload"
                );
                self.abort(fingerprint, file_name).await;
                Err(e)
            }
        }
    }

    async fn assemble(
        &self,
        fingerprint: &Fingerprint,
        file_name: &str,
        chunks: &[StoredChunk],
    ) -> Result<MergeOutcome, UploadError> {
        fs::create_dir_all(self.completion.namespace_path(fingerprint)).await?;

        let staging = self.completion.staging_path(fingerprint, file_name);
        let mut output = fs::File::create(&staging).await?.into_std().await;
        let mut bytes_written = 0u64;

        for chunk in chunks {
            let (returned, copied) = append_chunk(output, chunk.path.clone()).await?;
            output = returned;
            bytes_written += copied;

            self.chunk_store.delete_chunk(fingerprint, chunk.index).await?;

            tracing::trace!(
                fingerprint = %fingerprint,
                chunk_index = %chunk.index,
                bytes = copied,
                "Chunk appended"
            );
        }

        fs::File::from_std(output).sync_all().await?;

        let artifact_path = self.completion.artifact_path(fingerprint, file_name);
        fs::rename(&staging, &artifact_path).await?;

        // The artifact is committed; leftover chunk data no longer matters.
        if let Err(e) = self.chunk_store.delete_namespace(fingerprint).await {
            tracing::warn!(
                fingerprint = %fingerprint,
                error = %e,
                "Failed to remove chunk namespace after merge"
            );
        }

        Ok(MergeOutcome {
            fingerprint: fingerprint.clone(),
            file_name: file_name.to_string(),
            artifact_path,
            chunks_merged: chunks.len(),
            bytes_written,
            completed_at: Utc::now(),
        })
    }

    /// Drop chunks uploaded after the fingerprint was already merged
    async fn discard_stale_chunks(&self, fingerprint: &Fingerprint) {
        match self.chunk_store.delete_namespace(fingerprint).await {
            Ok(true) => tracing::info!(
                fingerprint = %fingerprint,
                "Fingerprint already merged, discarded stale chunks"
            ),
            Ok(false) => {}
            Err(e) => tracing::warn!(
                fingerprint = %fingerprint,
                error = %e,
                "Failed to remove stale chunks of merged fingerprint"
            ),
        }
    }

    /// Best-effort removal of everything a failed merge touched
    async fn abort(&self, fingerprint: &Fingerprint, file_name: &str) {
        let staging = self.completion.staging_path(fingerprint, file_name);
        remove_file_logged(&staging).await;

        match self.chunk_store.delete_namespace(fingerprint).await {
            Ok(_) => {}
            Err(e) => tracing::warn!(
                fingerprint = %fingerprint,
                error = %e,
                "Failed to remove chunk namespace after failed merge"
            ),
        }

        self.completion.prune_empty_namespace(fingerprint).await;
    }
}

/// Append one chunk file to `output`.
///
/// Runs on the blocking pool; `std::io::copy` between two files lowers to
/// `copy_file_range`/`sendfile` on Linux and a buffered copy elsewhere.
async fn append_chunk(
    output: std::fs::File,
    source: PathBuf,
) -> Result<(std::fs::File, u64), UploadError> {
    let transferred = tokio::task::spawn_blocking(move || {
        let mut output = output;
        let mut input = std::fs::File::open(&source)?;
        let copied = std::io::copy(&mut input, &mut output)?;
        Ok::<_, std::io::Error>((output, copied))
    })
    .await
    .map_err(|e| std::io::Error::other(format!("chunk transfer task failed: {e}")))?;

    Ok(transferred?)
}

async fn remove_file_logged(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            path = %path.display(),
            error = %e,
            "Failed to remove partial merge output"
        ),
    }
}

// ============================================================================
// Tests
// ============================================================================

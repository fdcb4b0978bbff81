//! Chunk Store
//!
//! Filesystem storage for uploaded chunks before they are merged.
//!
//! Each fingerprint gets its own directory under `<root>/chunks/`, and every
//! chunk is a file named after its index. Presence is structural: the set of
//! uploaded indices is whatever the directory holds, with no manifest to keep
//! in sync.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::types::{ChunkIndex, Fingerprint, UploadError};

/// Directory under the storage root holding in-progress chunk sets
pub const CHUNKS_DIR: &str = "chunks";

// ============================================================================
// Stored Chunk
// ============================================================================

/// A chunk as found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    pub index: ChunkIndex,
    pub path: PathBuf,
    pub size: u64,
}

// ============================================================================
// Chunk Store
// ============================================================================

/// Fingerprint-scoped chunk storage on the local filesystem
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    /// `<storage root>/chunks`
    base_path: PathBuf,
}

impl ChunkStore {
    /// Create a store rooted at `<storage_root>/chunks`
    pub fn new(storage_root: impl AsRef<Path>) -> Self {
        Self {
            inner: Arc::new(ChunkStoreInner {
                base_path: storage_root.as_ref().join(CHUNKS_DIR),
            }),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.inner.base_path
    }

    /// Directory holding every chunk of `fingerprint`
    pub fn namespace_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.inner.base_path.join(fingerprint.as_str())
    }

    pub fn chunk_path(&self, fingerprint: &Fingerprint, index: ChunkIndex) -> PathBuf {
        self.namespace_path(fingerprint).join(index.entry_name())
    }

    /// Present indices for `fingerprint`, or `None` if no namespace exists
    pub async fn has_chunks(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<BTreeSet<ChunkIndex>>, UploadError> {
        Ok(self
            .read_namespace(fingerprint)
            .await?
            .map(|chunks| chunks.into_iter().map(|c| c.index).collect()))
    }

    /// Write (or overwrite) one chunk.
    ///
    /// The payload goes to a hidden staging file first and is renamed into
    /// place, so listings never see a partially written chunk. Returns the
    /// number of chunks present after the write.
    pub async fn put_chunk(
        &self,
        fingerprint: &Fingerprint,
        index: ChunkIndex,
        data: &[u8],
    ) -> Result<usize, UploadError> {
        let namespace = self.namespace_path(fingerprint);
        fs::create_dir_all(&namespace).await?;

        let staging = namespace.join(format!(".{}.{}.part", index, Uuid::new_v4()));
        if let Err(e) = write_synced(&staging, data).await {
            remove_staging(&staging).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&staging, self.chunk_path(fingerprint, index)).await {
            remove_staging(&staging).await;
            return Err(e.into());
        }

        // The chunk is committed; a namespace that no longer lists cleanly
        // only affects the reported count.
        let count = match self.chunk_count(fingerprint).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(
                    fingerprint = %fingerprint,
                    chunk_index = %index,
                    error = %e,
                    "Chunk stored but namespace listing failed"
                );
                count_chunk_entries(&namespace).await.unwrap_or(1)
            }
        };

        tracing::debug!(
            fingerprint = %fingerprint,
            chunk_index = %index,
            size = data.len(),
            chunks_present = count,
            "Chunk stored"
        );

        Ok(count)
    }

    /// Every chunk stored for `fingerprint`, in ascending numeric index order
    pub async fn list_chunks(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<StoredChunk>, UploadError> {
        Ok(self.read_namespace(fingerprint).await?.unwrap_or_default())
    }

    pub async fn chunk_count(&self, fingerprint: &Fingerprint) -> Result<usize, UploadError> {
        Ok(self.list_chunks(fingerprint).await?.len())
    }

    pub async fn present_indices(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<BTreeSet<ChunkIndex>, UploadError> {
        Ok(self.has_chunks(fingerprint).await?.unwrap_or_default())
    }

    /// Remove a single chunk; a chunk that is already gone is not an error
    pub async fn delete_chunk(
        &self,
        fingerprint: &Fingerprint,
        index: ChunkIndex,
    ) -> Result<(), UploadError> {
        match fs::remove_file(self.chunk_path(fingerprint, index)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove all chunk data and the namespace itself.
    ///
    /// Returns `false` if there was nothing to remove.
    pub async fn delete_namespace(&self, fingerprint: &Fingerprint) -> Result<bool, UploadError> {
        match fs::remove_dir_all(self.namespace_path(fingerprint)).await {
            Ok(()) => {
                tracing::debug!(fingerprint = %fingerprint, "Chunk namespace removed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Namespaces not modified for at least `max_age`
    pub async fn stale_namespaces(
        &self,
        max_age: Duration,
    ) -> Result<Vec<Fingerprint>, UploadError> {
        let mut entries = match fs::read_dir(&self.inner.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        let mut stale = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(fingerprint) = name.to_str().and_then(|n| Fingerprint::parse(n).ok()) else {
                tracing::warn!(
                    path = %entry.path().display(),
                    "Ignoring unexpected directory in chunk store"
                );
                continue;
            };

            let modified = entry.metadata().await?.modified()?;
            // Clock skew can put mtime in the future; treat that as fresh.
            if let Ok(age) = now.duration_since(modified) {
                if age >= max_age {
                    stale.push(fingerprint);
                }
            }
        }

        stale.sort();
        Ok(stale)
    }

    async fn read_namespace(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Vec<StoredChunk>>, UploadError> {
        let namespace = self.namespace_path(fingerprint);
        let mut entries = match fs::read_dir(&namespace).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                return Err(UploadError::MalformedIndex {
                    fingerprint: fingerprint.clone(),
                    name: name.to_string_lossy().into_owned(),
                });
            };

            // Staging files of in-flight writes
            if name.starts_with('.') {
                continue;
            }

            let index = ChunkIndex::from_entry_name(name).ok_or_else(|| {
                UploadError::MalformedIndex {
                    fingerprint: fingerprint.clone(),
                    name: name.to_string(),
                }
            })?;

            chunks.push(StoredChunk {
                index,
                path: entry.path(),
                size: entry.metadata().await?.len(),
            });
        }

        chunks.sort_by_key(|c| c.index);
        Ok(Some(chunks))
    }
}

async fn remove_staging(staging: &Path) {
    if let Err(e) = fs::remove_file(staging).await {
        if e.kind() != ErrorKind::NotFound {
            tracing::warn!(
                path = %staging.display(),
                error = %e,
                "Failed to remove staging chunk"
            );
        }
    }
}

/// Entries under `namespace` named like a chunk, ignoring anything else
async fn count_chunk_entries(namespace: &Path) -> std::io::Result<usize> {
    let mut entries = fs::read_dir(namespace).await?;
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry
            .file_name()
            .to_str()
            .and_then(ChunkIndex::from_entry_name)
            .is_some()
        {
            count += 1;
        }
    }
    Ok(count)
}

/// Create `path`, write `data` and flush it to disk
async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fp(raw: &str) -> Fingerprint {
        Fingerprint::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_has_chunks_absent_namespace() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path());

        assert_eq!(store.has_chunks(&fp("abc")).await.unwrap(), None);
        assert!(store.list_chunks(&fp("abc")).await.unwrap().is_empty());
        assert!(store.present_indices(&fp("abc")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_chunk_returns_running_count() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path());
        let f = fp("abc");

        assert_eq!(store.put_chunk(&f, ChunkIndex(0), b"AB").await.unwrap(), 1);
        assert_eq!(store.put_chunk(&f, ChunkIndex(5), b"CD").await.unwrap(), 2);

        let present = store.has_chunks(&f).await.unwrap().unwrap();
        assert_eq!(present.into_iter().collect::<Vec<_>>(), vec![ChunkIndex(0), ChunkIndex(5)]);

        let on_disk = std::fs::read(temp_dir.path().join("chunks/abc/5")).unwrap();
        assert_eq!(on_disk, b"CD");
    }

    #[tokio::test]
    async fn test_reupload_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path());
        let f = fp("abc");

        store.put_chunk(&f, ChunkIndex(1), b"old").await.unwrap();
        let count = store.put_chunk(&f, ChunkIndex(1), b"new!").await.unwrap();
        assert_eq!(count, 1);

        let chunks = store.list_chunks(&f).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].size, 4);
        assert_eq!(std::fs::read(&chunks[0].path).unwrap(), b"new!");
    }

    #[tokio::test]
    async fn test_list_chunks_sorts_numerically() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path());
        let f = fp("abc");

        for i in [10, 2, 1, 0, 20] {
            store.put_chunk(&f, ChunkIndex(i), b"x").await.unwrap();
        }

        let order: Vec<u32> = store
            .list_chunks(&f)
            .await
            .unwrap()
            .iter()
            .map(|c| c.index.0)
            .collect();
        assert_eq!(order, vec![0, 1, 2, 10, 20]);
    }

    #[tokio::test]
    async fn test_staging_files_are_invisible() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path());
        let f = fp("abc");

        store.put_chunk(&f, ChunkIndex(0), b"x").await.unwrap();
        std::fs::write(store.namespace_path(&f).join(".1.tmp.part"), b"partial").unwrap();

        assert_eq!(store.chunk_count(&f).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_entry_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path());
        let f = fp("abc");

        store.put_chunk(&f, ChunkIndex(0), b"x").await.unwrap();
        std::fs::write(store.namespace_path(&f).join("notes.txt"), b"?").unwrap();

        let result = store.list_chunks(&f).await;
        assert!(matches!(
            result,
            Err(UploadError::MalformedIndex { ref name, .. }) if name == "notes.txt"
        ));
    }

    #[tokio::test]
    async fn test_put_chunk_survives_foreign_entry() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path());
        let f = fp("abc");

        store.put_chunk(&f, ChunkIndex(0), b"x").await.unwrap();
        std::fs::write(store.namespace_path(&f).join("notes.txt"), b"?").unwrap();

        let count = store.put_chunk(&f, ChunkIndex(1), b"y").await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(std::fs::read(store.chunk_path(&f, ChunkIndex(1))).unwrap(), b"y");
    }

    #[tokio::test]
    async fn test_failed_rename_removes_staging() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path());
        let f = fp("abc");

        // A non-empty directory where the chunk should land blocks the rename
        let blocked = store.chunk_path(&f, ChunkIndex(1));
        std::fs::create_dir_all(blocked.join("inner")).unwrap();

        let result = store.put_chunk(&f, ChunkIndex(1), b"y").await;
        assert!(matches!(result, Err(UploadError::IoFailure(_))));

        let leftovers: Vec<_> = std::fs::read_dir(store.namespace_path(&f))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "staging files left: {leftovers:?}");
    }

    #[tokio::test]
    async fn test_delete_namespace() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path());
        let f = fp("abc");

        store.put_chunk(&f, ChunkIndex(0), b"x").await.unwrap();
        store.put_chunk(&f, ChunkIndex(1), b"y").await.unwrap();

        assert!(store.delete_namespace(&f).await.unwrap());
        assert!(!store.namespace_path(&f).exists());
        assert_eq!(store.has_chunks(&f).await.unwrap(), None);

        // Second delete is a no-op
        assert!(!store.delete_namespace(&f).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_chunk_tolerates_missing() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path());
        let f = fp("abc");

        store.put_chunk(&f, ChunkIndex(0), b"x").await.unwrap();
        store.delete_chunk(&f, ChunkIndex(0)).await.unwrap();
        store.delete_chunk(&f, ChunkIndex(0)).await.unwrap();

        // Namespace survives as an empty directory
        assert_eq!(store.has_chunks(&f).await.unwrap(), Some(BTreeSet::new()));
    }

    #[tokio::test]
    async fn test_concurrent_distinct_indices() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path());
        let f = fp("abc");

        let writes = (0..32u32).map(|i| {
            let store = store.clone();
            let f = f.clone();
            async move {
                let payload = vec![i as u8; 1024];
                store.put_chunk(&f, ChunkIndex(i), &payload).await
            }
        });
        let handles: Vec<_> = writes.map(tokio::spawn).collect();
        for result in futures::future::join_all(handles).await {
            result.unwrap().unwrap();
        }

        let chunks = store.list_chunks(&f).await.unwrap();
        assert_eq!(chunks.len(), 32);
        for chunk in chunks {
            let data = std::fs::read(&chunk.path).unwrap();
            assert_eq!(data, vec![chunk.index.0 as u8; 1024]);
        }
    }

    #[tokio::test]
    async fn test_stale_namespaces() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path());

        assert!(store.stale_namespaces(Duration::ZERO).await.unwrap().is_empty());

        store.put_chunk(&fp("bbb"), ChunkIndex(0), b"x").await.unwrap();
        store.put_chunk(&fp("aaa"), ChunkIndex(0), b"x").await.unwrap();

        let stale = store.stale_namespaces(Duration::ZERO).await.unwrap();
        assert_eq!(stale, vec![fp("aaa"), fp("bbb")]);

        let fresh = store.stale_namespaces(Duration::from_secs(3600)).await.unwrap();
        assert!(fresh.is_empty());
    }
}

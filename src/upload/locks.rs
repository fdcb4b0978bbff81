//! Per-fingerprint exclusion
//!
//! Chunk uploads for one fingerprint may run concurrently with each other,
//! but never alongside a merge of that fingerprint, and at most one merge
//! per fingerprint runs at a time.
//!
//! Each fingerprint with a live permit has a gate (`RwLock<()>`): uploads
//! hold it shared, a merge holds it exclusively. A separate marker set
//! records which fingerprints have a merge scheduled so that a second merge
//! fails fast instead of queueing, and so new uploads are turned away while
//! the merge waits for in-flight writes to drain.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::types::{Fingerprint, UploadError};

/// Lock table keyed by fingerprint
#[derive(Clone, Default)]
pub struct FingerprintLocks {
    inner: Arc<Mutex<LocksInner>>,
}

#[derive(Default)]
struct LocksInner {
    gates: HashMap<Fingerprint, Arc<RwLock<()>>>,
    merging: HashSet<Fingerprint>,
}

impl LocksInner {
    fn gate(&mut self, fingerprint: &Fingerprint) -> Arc<RwLock<()>> {
        self.gates
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Drop the gate once nothing but the table refers to it
    fn prune(&mut self, fingerprint: &Fingerprint) {
        let unused = self
            .gates
            .get(fingerprint)
            .is_some_and(|gate| Arc::strong_count(gate) == 1);
        if unused {
            self.gates.remove(fingerprint);
        }
    }
}

impl FingerprintLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared permit for writing a chunk.
    ///
    /// Never waits: if a merge is scheduled or running the chunk is rejected.
    pub fn begin_upload(&self, fingerprint: &Fingerprint) -> Result<UploadPermit, UploadError> {
        let mut inner = self.inner.lock();
        if inner.merging.contains(fingerprint) {
            return Err(UploadError::MergeInProgress(fingerprint.clone()));
        }
        let gate = inner.gate(fingerprint);
        match gate.try_read_owned() {
            Ok(guard) => Ok(UploadPermit {
                guard: Some(guard),
                fingerprint: fingerprint.clone(),
                locks: self.clone(),
            }),
            Err(_) => Err(UploadError::MergeInProgress(fingerprint.clone())),
        }
    }

    /// Exclusive permit for merging (or sweeping) a fingerprint.
    ///
    /// Fails with `ConcurrentMergeConflict` if another merge holds or awaits
    /// the fingerprint; otherwise waits for in-flight uploads to finish.
    pub async fn begin_merge(&self, fingerprint: &Fingerprint) -> Result<MergePermit, UploadError> {
        let gate = {
            let mut inner = self.inner.lock();
            if !inner.merging.insert(fingerprint.clone()) {
                return Err(UploadError::ConcurrentMergeConflict(fingerprint.clone()));
            }
            inner.gate(fingerprint)
        };

        // The permit owns the marker from here on, so cancelling this
        // future while it waits still clears it.
        let mut permit = MergePermit {
            guard: None,
            fingerprint: fingerprint.clone(),
            locks: self.clone(),
        };
        permit.guard = Some(gate.write_owned().await);
        Ok(permit)
    }

    /// Exclusive permit without waiting; `None` if the fingerprint is busy
    pub fn try_begin_merge(&self, fingerprint: &Fingerprint) -> Option<MergePermit> {
        let mut inner = self.inner.lock();
        if inner.merging.contains(fingerprint) {
            return None;
        }
        let gate = inner.gate(fingerprint);
        match gate.try_write_owned() {
            Ok(guard) => {
                inner.merging.insert(fingerprint.clone());
                Some(MergePermit {
                    guard: Some(guard),
                    fingerprint: fingerprint.clone(),
                    locks: self.clone(),
                })
            }
            Err(_) => {
                inner.prune(fingerprint);
                None
            }
        }
    }

    /// True if a merge for `fingerprint` is scheduled or running
    pub fn is_merging(&self, fingerprint: &Fingerprint) -> bool {
        self.inner.lock().merging.contains(fingerprint)
    }

    /// Number of fingerprints with a live gate
    pub fn active_count(&self) -> usize {
        self.inner.lock().gates.len()
    }
}

/// Held while a chunk is being written
pub struct UploadPermit {
    guard: Option<OwnedRwLockReadGuard<()>>,
    fingerprint: Fingerprint,
    locks: FingerprintLocks,
}

impl Drop for UploadPermit {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.inner.lock().prune(&self.fingerprint);
    }
}

/// Held for the whole duration of a merge
pub struct MergePermit {
    guard: Option<OwnedRwLockWriteGuard<()>>,
    fingerprint: Fingerprint,
    locks: FingerprintLocks,
}

impl MergePermit {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl Drop for MergePermit {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut inner = self.locks.inner.lock();
        inner.merging.remove(&self.fingerprint);
        inner.prune(&self.fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fp(raw: &str) -> Fingerprint {
        Fingerprint::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_uploads_share_the_gate() {
        let locks = FingerprintLocks::new();
        let a = locks.begin_upload(&fp("abc")).unwrap();
        let b = locks.begin_upload(&fp("abc")).unwrap();
        assert_eq!(locks.active_count(), 1);

        drop(a);
        drop(b);
        assert_eq!(locks.active_count(), 0);
    }

    #[tokio::test]
    async fn test_upload_rejected_during_merge() {
        let locks = FingerprintLocks::new();
        let merge = locks.begin_merge(&fp("abc")).await.unwrap();

        assert!(matches!(
            locks.begin_upload(&fp("abc")),
            Err(UploadError::MergeInProgress(_))
        ));
        // Other fingerprints are unaffected
        assert!(locks.begin_upload(&fp("other")).is_ok());

        drop(merge);
        assert!(locks.begin_upload(&fp("abc")).is_ok());
    }

    #[tokio::test]
    async fn test_second_merge_conflicts() {
        let locks = FingerprintLocks::new();
        let first = locks.begin_merge(&fp("abc")).await.unwrap();

        assert!(matches!(
            locks.begin_merge(&fp("abc")).await,
            Err(UploadError::ConcurrentMergeConflict(_))
        ));
        assert!(locks.try_begin_merge(&fp("abc")).is_none());

        drop(first);
        assert!(!locks.is_merging(&fp("abc")));
        assert!(locks.begin_merge(&fp("abc")).await.is_ok());
    }

    #[tokio::test]
    async fn test_merge_waits_for_inflight_upload() {
        let locks = FingerprintLocks::new();
        let upload = locks.begin_upload(&fp("abc")).unwrap();

        let merge_locks = locks.clone();
        let merge = tokio::spawn(async move { merge_locks.begin_merge(&fp("abc")).await.map(|_| ()) });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!merge.is_finished());
        // Scheduled merge already turns new chunks away
        assert!(locks.is_merging(&fp("abc")));
        assert!(locks.begin_upload(&fp("abc")).is_err());

        drop(upload);
        merge.await.unwrap().unwrap();
        assert_eq!(locks.active_count(), 0);
    }

    #[tokio::test]
    async fn test_try_merge_skips_busy_fingerprint() {
        let locks = FingerprintLocks::new();
        let upload = locks.begin_upload(&fp("abc")).unwrap();

        assert!(locks.try_begin_merge(&fp("abc")).is_none());
        assert!(!locks.is_merging(&fp("abc")));

        drop(upload);
        let permit = locks.try_begin_merge(&fp("abc")).unwrap();
        assert_eq!(permit.fingerprint(), &fp("abc"));
    }
}

//! Upload types for the chunked upload protocol

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Maximum fingerprint length in bytes
pub const MAX_FINGERPRINT_LEN: usize = 128;

/// Maximum output file name length in bytes
pub const MAX_FILE_NAME_LEN: usize = 255;

// ============================================================================
// Fingerprint
// ============================================================================

/// Content hash identifying a logical file across upload attempts.
///
/// Always a single safe path component: ASCII alphanumerics, `-` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn parse(raw: &str) -> Result<Self, UploadError> {
        if raw.is_empty() {
            return Err(UploadError::InvalidFingerprint("empty fingerprint".into()));
        }
        if raw.len() > MAX_FINGERPRINT_LEN {
            return Err(UploadError::InvalidFingerprint(format!(
                "fingerprint longer than {MAX_FINGERPRINT_LEN} bytes"
            )));
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(UploadError::InvalidFingerprint(format!(
                "unsupported characters in fingerprint: {raw}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// Chunk Index
// ============================================================================

/// Position of a chunk within its file, 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkIndex(pub u32);

impl ChunkIndex {
    /// Parse a stored entry name.
    ///
    /// Only the canonical decimal form is accepted, so `"07"` and `"+7"`
    /// are malformed even though they would parse as integers.
    pub fn from_entry_name(name: &str) -> Option<Self> {
        let value: u32 = name.parse().ok()?;
        (value.to_string() == name).then_some(Self(value))
    }

    /// Name of the stored entry for this index
    pub fn entry_name(self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for ChunkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Output File Name
// ============================================================================

/// Validate the name an artifact is stored under.
///
/// Rejects anything that is not a single, visible path component.
pub fn validate_file_name(name: &str) -> Result<(), UploadError> {
    if name.is_empty() {
        return Err(UploadError::InvalidFileName("empty file name".into()));
    }
    if name.len() > MAX_FILE_NAME_LEN {
        return Err(UploadError::InvalidFileName(format!(
            "file name longer than {MAX_FILE_NAME_LEN} bytes"
        )));
    }
    if name.starts_with('.') {
        return Err(UploadError::InvalidFileName(format!(
            "hidden file names are reserved: {name}"
        )));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(UploadError::InvalidFileName(format!(
            "path separators not allowed: {name}"
        )));
    }
    Ok(())
}

// ============================================================================
// Check Protocol
// ============================================================================

/// Three-way answer to "where is this upload at?"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckStatus {
    /// A merged artifact exists; skip the upload entirely
    Complete,
    /// No chunks stored; upload from chunk 0
    NotStarted,
    /// Some chunks stored; upload only the missing indices
    InProgress(BTreeSet<ChunkIndex>),
}

impl CheckStatus {
    /// Wire code used by the `/bigfile/check` endpoint
    pub fn result_code(&self) -> i32 {
        match self {
            Self::NotStarted => 0,
            Self::Complete => 1,
            Self::InProgress(_) => 2,
        }
    }

    /// Indices the client still has to send, given its total chunk count
    pub fn missing(&self, total_chunks: u32) -> Vec<ChunkIndex> {
        match self {
            Self::Complete => Vec::new(),
            Self::NotStarted => (0..total_chunks).map(ChunkIndex).collect(),
            Self::InProgress(present) => (0..total_chunks)
                .map(ChunkIndex)
                .filter(|i| !present.contains(i))
                .collect(),
        }
    }
}

// ============================================================================
// Merge Result
// ============================================================================

/// Result of a successful merge
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    pub fingerprint: Fingerprint,
    pub file_name: String,
    pub artifact_path: PathBuf,
    pub chunks_merged: usize,
    pub bytes_written: u64,
    pub completed_at: DateTime<Utc>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("No chunks stored for {0}")]
    EmptyUpload(Fingerprint),

    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),

    #[error("Malformed chunk entry {name:?} under {fingerprint}")]
    MalformedIndex { fingerprint: Fingerprint, name: String },

    #[error("Merge already running for {0}")]
    ConcurrentMergeConflict(Fingerprint),

    #[error("Merge in progress for {0}, chunk rejected")]
    MergeInProgress(Fingerprint),

    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("Invalid file name: {0}")]
    InvalidFileName(String),

    #[error("Chunk hash mismatch: expected {expected}, got {actual}")]
    ChunkHashMismatch { expected: String, actual: String },

    #[error("{0} is already merged")]
    AlreadyMerged(Fingerprint),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::EmptyUpload(_) => StatusCode::NOT_FOUND,
            Self::IoFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::MalformedIndex { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ConcurrentMergeConflict(_) => StatusCode::CONFLICT,
            Self::MergeInProgress(_) => StatusCode::CONFLICT,
            Self::InvalidFingerprint(_) => StatusCode::BAD_REQUEST,
            Self::InvalidFileName(_) => StatusCode::BAD_REQUEST,
            Self::ChunkHashMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::AlreadyMerged(_) => StatusCode::CONFLICT,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyUpload(_) => "EMPTY_UPLOAD",
            Self::IoFailure(_) => "IO_FAILURE",
            Self::MalformedIndex { .. } => "MALFORMED_INDEX",
            Self::ConcurrentMergeConflict(_) => "CONCURRENT_MERGE_CONFLICT",
            Self::MergeInProgress(_) => "MERGE_IN_PROGRESS",
            Self::InvalidFingerprint(_) => "INVALID_FINGERPRINT",
            Self::InvalidFileName(_) => "INVALID_FILE_NAME",
            Self::ChunkHashMismatch { .. } => "CHUNK_HASH_MISMATCH",
            Self::AlreadyMerged(_) => "ALREADY_MERGED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_accepts_md5_hex() {
        let fp = Fingerprint::parse("9e107d9d372bb6826bd81d3542a419d6").unwrap();
        assert_eq!(fp.as_str(), "9e107d9d372bb6826bd81d3542a419d6");
    }

    #[test]
    fn test_fingerprint_rejects_path_tricks() {
        for raw in ["", "..", "a/b", "a\\b", "a.b", "../etc", "sp ace"] {
            assert!(
                matches!(Fingerprint::parse(raw), Err(UploadError::InvalidFingerprint(_))),
                "{raw:?} should be rejected"
            );
        }
        let long = "a".repeat(MAX_FINGERPRINT_LEN + 1);
        assert!(Fingerprint::parse(&long).is_err());
    }

    #[test]
    fn test_chunk_index_canonical_names_only() {
        assert_eq!(ChunkIndex::from_entry_name("0"), Some(ChunkIndex(0)));
        assert_eq!(ChunkIndex::from_entry_name("10"), Some(ChunkIndex(10)));
        assert_eq!(ChunkIndex::from_entry_name("07"), None);
        assert_eq!(ChunkIndex::from_entry_name("+7"), None);
        assert_eq!(ChunkIndex::from_entry_name("-1"), None);
        assert_eq!(ChunkIndex::from_entry_name("abc"), None);
        assert_eq!(ChunkIndex::from_entry_name(""), None);
    }

    #[test]
    fn test_chunk_index_orders_numerically() {
        let mut indices = vec![ChunkIndex(10), ChunkIndex(2), ChunkIndex(1)];
        indices.sort();
        assert_eq!(indices, vec![ChunkIndex(1), ChunkIndex(2), ChunkIndex(10)]);
    }

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("out.bin").is_ok());
        assert!(validate_file_name("movie (1).mp4").is_ok());
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name(".hidden").is_err());
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name("a/b").is_err());
        assert!(validate_file_name("a\\b").is_err());
        assert!(validate_file_name(&"x".repeat(MAX_FILE_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_missing_chunks() {
        let present: BTreeSet<_> = [ChunkIndex(0), ChunkIndex(2)].into_iter().collect();
        let status = CheckStatus::InProgress(present);
        assert_eq!(status.missing(4), vec![ChunkIndex(1), ChunkIndex(3)]);
        assert_eq!(CheckStatus::NotStarted.missing(2), vec![ChunkIndex(0), ChunkIndex(1)]);
        assert!(CheckStatus::Complete.missing(5).is_empty());
    }

    #[test]
    fn test_result_codes() {
        assert_eq!(CheckStatus::NotStarted.result_code(), 0);
        assert_eq!(CheckStatus::Complete.result_code(), 1);
        assert_eq!(CheckStatus::InProgress(BTreeSet::new()).result_code(), 2);
    }
}

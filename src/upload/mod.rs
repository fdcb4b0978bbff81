//! Chunked Upload Module
//!
//! Implements resumable uploads of large files:
//! - Chunks stored per content fingerprint, uploadable in any order
//! - Resume by listing which chunk indices are already present
//! - Server-side merge into a byte-identical artifact
//! - Content-addressed dedup: a fingerprint with an artifact skips upload
//!
//! Protocol Flow:
//! 1. Client checks the fingerprint (complete / not started / in progress)
//! 2. Client uploads the chunks the server does not have yet
//! 3. Client asks for a merge once it has sent every chunk
//! 4. Server concatenates the chunks, commits the artifact, drops the chunks

pub mod chunk_store;
pub mod completion;
pub mod locks;
pub mod merge;
pub mod service;
pub mod types;

pub use chunk_store::{ChunkStore, StoredChunk};
pub use completion::CompletionIndex;
pub use locks::{FingerprintLocks, MergePermit, UploadPermit};
pub use merge::MergeEngine;
pub use service::{compute_hash, UploadService};
pub use types::*;

//! Bigfile Server Library
//!
//! Resumable chunked uploads: clients split a file into numbered chunks,
//! upload them in any order across any number of sessions, and ask the
//! server to assemble them once every chunk is present.
//!
//! # Modules
//!
//! - `upload`: Chunk storage, completion tracking, and the merge engine
//! - `routes`: HTTP surface (`/bigfile/check`, `/bigfile/upload`, `/bigfile/merge`)
//! - `config`: Environment-driven configuration

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod upload;

pub use routes::app;

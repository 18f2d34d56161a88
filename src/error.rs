//! Error types for depot-sync
//!
//! This module provides the error taxonomy for a depot sync:
//! - Resolution errors (manifest or key unavailable) stop a sync before any download
//! - Authorization errors (401/403) are fatal for the whole depot
//! - Transport errors are retryable and never surface unless retries run out
//! - Pool exhaustion is fatal and reported distinctly from authorization failures
//! - Materializer errors are scoped to the file being written

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{ChunkId, DepotId};

/// Result type alias for depot-sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for depot-sync
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_concurrent_files")
        key: Option<String>,
    },

    /// The manifest or depot key could not be resolved
    #[error("resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// The manifest failed structural validation before download
    #[error("invalid manifest: {0}")]
    InvalidManifest(#[from] ManifestError),

    /// The remote refused our credentials (HTTP 401/403)
    #[error("unauthorized for depot {depot_id}: {reason}")]
    Unauthorized {
        /// Depot the request was made for
        depot_id: DepotId,
        /// What was being fetched when access was denied
        reason: String,
    },

    /// No endpoint in the connection pool remains viable
    #[error("connection pool exhausted for depot {depot_id}")]
    PoolExhausted {
        /// Depot the pool was serving
        depot_id: DepotId,
    },

    /// The retry policy gave up on a chunk
    #[error("chunk {chunk} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Chunk that could not be fetched
        chunk: ChunkId,
        /// Number of fetch attempts made
        attempts: u32,
        /// The last retryable error observed
        last_error: String,
    },

    /// Writing a file to disk failed
    #[error("materialize error: {0}")]
    Materialize(#[from] MaterializeError),

    /// The sync was cancelled before the operation could complete
    #[error("sync cancelled")]
    Cancelled,

    /// Network error from the HTTP transport
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the remote rejected our credentials.
    ///
    /// Lets callers tell "bad credentials" apart from "network flaky".
    pub fn is_authorization(&self) -> bool {
        matches!(self, Error::Unauthorized { .. })
    }

    /// True for errors that end the whole depot sync, not just one file.
    pub fn is_depot_fatal(&self) -> bool {
        matches!(
            self,
            Error::Unauthorized { .. }
                | Error::PoolExhausted { .. }
                | Error::Cancelled
                | Error::Resolution(_)
                | Error::InvalidManifest(_)
                | Error::RetriesExhausted { .. }
        )
    }
}

/// Manifest and key resolution errors
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// No manifest exists for the requested branch
    #[error("no manifest for depot {depot_id} on branch '{branch}'")]
    ManifestNotFound {
        /// Depot that was requested
        depot_id: DepotId,
        /// Branch that was requested
        branch: String,
    },

    /// Every endpoint failed to serve the manifest
    #[error("manifest for depot {depot_id} unavailable: {reason}")]
    ManifestUnavailable {
        /// Depot that was requested
        depot_id: DepotId,
        /// Why the manifest could not be fetched
        reason: String,
    },

    /// The depot decryption key was missing or malformed
    #[error("depot key unavailable for depot {depot_id}")]
    KeyUnavailable {
        /// Depot that was requested
        depot_id: DepotId,
    },
}

/// Structural manifest problems detected before any download starts
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    /// A chunk starts after the end of the previous chunk
    #[error("{path}: gap between byte {expected} and chunk at {found}")]
    Gap {
        /// File containing the gap
        path: PathBuf,
        /// Offset the next chunk should have started at
        expected: u64,
        /// Offset the chunk actually starts at
        found: u64,
    },

    /// A chunk starts before the end of the previous chunk
    #[error("{path}: chunk at {found} overlaps previous chunk ending at {expected}")]
    Overlap {
        /// File containing the overlap
        path: PathBuf,
        /// Offset the previous chunk ends at
        expected: u64,
        /// Offset the overlapping chunk starts at
        found: u64,
    },

    /// Chunks do not reach the declared file size
    #[error("{path}: chunks cover {covered} of {total_size} bytes")]
    Truncated {
        /// File whose chunks are short
        path: PathBuf,
        /// Bytes covered by the chunk list
        covered: u64,
        /// Declared uncompressed file size
        total_size: u64,
    },

    /// A directory marker carries chunk data
    #[error("{path}: directory entry has {count} chunks")]
    DirectoryWithChunks {
        /// Offending directory entry
        path: PathBuf,
        /// Number of chunks attached to it
        count: usize,
    },

    /// A chunk's end offset does not fit in a `u64`
    #[error("{path}: chunk at {offset} with length {length} overflows the file offset range")]
    OffsetOverflow {
        /// File containing the chunk
        path: PathBuf,
        /// Declared chunk offset
        offset: u64,
        /// Declared uncompressed length
        length: u32,
    },

    /// A relative path escapes the output directory
    #[error("unsafe path in manifest: {path}")]
    UnsafePath {
        /// Offending path
        path: PathBuf,
    },
}

/// File materialization errors
#[derive(Debug, Error)]
pub enum MaterializeError {
    /// Creating or truncating the target file failed
    #[error("failed to open {path}: {source}")]
    Open {
        /// Target file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A positional write failed
    #[error("failed to write {len} bytes at offset {offset} in {path}: {source}")]
    Write {
        /// Target file
        path: PathBuf,
        /// Byte offset of the write
        offset: u64,
        /// Number of bytes being written
        len: usize,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A write would extend past the declared file size
    #[error("write of {len} bytes at offset {offset} exceeds size {total_size} of {path}")]
    OutOfBounds {
        /// Target file
        path: PathBuf,
        /// Byte offset of the write
        offset: u64,
        /// Number of bytes being written
        len: usize,
        /// Declared file size
        total_size: u64,
    },

    /// Flushing or closing the file failed
    #[error("failed to close {path}: {source}")]
    Close {
        /// Target file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The blocking write task panicked or was aborted
    #[error("write task for {path} failed: {reason}")]
    TaskFailed {
        /// Target file
        path: PathBuf,
        /// Join error description
        reason: String,
    },
}

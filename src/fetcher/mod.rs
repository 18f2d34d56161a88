//! Chunk fetching seam and failure classification.
//!
//! The engine never speaks the wire protocol itself. A [`ChunkFetcher`] performs
//! one round-trip against one endpoint and reports either the decrypted,
//! decompressed bytes or a [`FetchError`]. The retry state machine only looks at
//! the variant of that error.

mod http;

pub use http::{ChunkDecoder, HttpChunkFetcher, HttpManifestSource, PassthroughDecoder};

use thiserror::Error;

use crate::retry::IsRetryable;
use crate::types::{ChunkDescriptor, DepotId, DepotKey, ServerEndpoint};

/// Classified failure of a single fetch attempt
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The remote rejected our credentials (HTTP 401)
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The remote denied access to the resource (HTTP 403)
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The resource does not exist on this endpoint (HTTP 404)
    #[error("not found: {0}")]
    NotFound(String),

    /// Timeout, reset, malformed response, short read
    #[error("transport error: {0}")]
    Transport(String),

    /// Anything else the transport could not classify
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, context: impl Into<String>) -> Self {
        let context = context.into();
        match status {
            401 => FetchError::Unauthorized(context),
            403 => FetchError::Forbidden(context),
            404 => FetchError::NotFound(context),
            408 | 429 | 500..=599 => FetchError::Transport(format!("HTTP {status}: {context}")),
            _ => FetchError::Other(format!("HTTP {status}: {context}")),
        }
    }

    /// True for 401/403-equivalent failures
    pub fn is_authorization(&self) -> bool {
        matches!(self, FetchError::Unauthorized(_) | FetchError::Forbidden(_))
    }
}

/// Authorization failures end the sync; every other failure is worth another
/// endpoint. A chunk missing from one endpoint may exist on the next.
impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        !self.is_authorization()
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return FetchError::from_status(status.as_u16(), e.to_string());
        }
        FetchError::Transport(e.to_string())
    }
}

/// Abstraction over one chunk round-trip, enabling testability.
#[async_trait::async_trait]
pub trait ChunkFetcher: Send + Sync {
    /// Fetch `chunk` from `endpoint` and return its decrypted, decompressed bytes.
    async fn fetch_chunk(
        &self,
        endpoint: &ServerEndpoint,
        depot_id: DepotId,
        chunk: &ChunkDescriptor,
        depot_key: &DepotKey,
    ) -> Result<Vec<u8>, FetchError>;
}

/// Adler-32 with a zero seed, the checksum manifests record for each chunk.
pub fn chunk_checksum(data: &[u8]) -> u32 {
    const MOD_ADLER: u32 = 65521;
    // Largest block that cannot overflow the u32 accumulators
    const NMAX: usize = 5552;

    let mut a: u32 = 0;
    let mut b: u32 = 0;
    for block in data.chunks(NMAX) {
        for &byte in block {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD_ADLER;
        b %= MOD_ADLER;
    }
    (b << 16) | a
}

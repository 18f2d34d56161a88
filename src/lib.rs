//! # depot-sync
//!
//! Concurrent depot download engine for content-delivery networks.
//!
//! ## Design Philosophy
//!
//! depot-sync is designed to be:
//! - **Two-level concurrent** - A bounded number of files at once, every chunk of a file in flight
//! - **Failure-classified** - Transient chunk failures retry on another endpoint, authorization failures stop everything
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use depot_sync::{
//!     AppId, DepotDownloadRequest, DepotId, DepotKey, DepotSync, FileFilter,
//!     HttpChunkFetcher, HttpManifestSource, ServerEndpoint, SyncConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::default();
//!     let engine = DepotSync::new(
//!         config.clone(),
//!         vec![ServerEndpoint::new("cdn.example.com", 80)],
//!         Arc::new(HttpManifestSource::new(&config.http)?),
//!         Arc::new(HttpChunkFetcher::new(&config.http)?),
//!     )?;
//!
//!     // Subscribe to events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let request = DepotDownloadRequest::new(
//!         "./depots/453094",
//!         AppId(453090),
//!         DepotId(453094),
//!         DepotKey::new(vec![0u8; 32]),
//!     )
//!     .with_filter(FileFilter::extension("dll"));
//!
//!     let result = engine.sync(request).await?;
//!     println!("Downloaded {} bytes", result.bytes_uncompressed);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Chunk and manifest transport
pub mod fetcher;
/// Manifest model and validation
pub mod manifest;
/// Positional file writes
pub mod materializer;
/// Endpoint connection pool
pub mod pool;
/// Retry logic with exponential backoff
pub mod retry;
/// Depot sync orchestration
pub mod sync;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{HttpConfig, PoolConfig, RetryConfig, SyncConfig};
pub use error::{Error, ManifestError, MaterializeError, ResolutionError, Result};
pub use fetcher::{
    ChunkDecoder, ChunkFetcher, FetchError, HttpChunkFetcher, HttpManifestSource,
    PassthroughDecoder, chunk_checksum,
};
pub use manifest::{Manifest, ManifestSource, StaticManifest};
pub use materializer::{FileHandle, FileMaterializer};
pub use pool::{ConnectionPool, EndpointStatus, PooledEndpoint};
pub use retry::{IsRetryable, RetryPolicy};
pub use sync::{DepotSync, ProgressAccumulator, ProgressSnapshot};
pub use types::{
    AppId, ChunkDescriptor, ChunkId, DepotDownloadRequest, DepotId, DepotKey, Event, FileEntry,
    FileFilter, FileFlags, ManifestId, ServerEndpoint, SyncResult,
};

/// Helper function to run a sync that stops cleanly on a termination signal.
///
/// On a signal the engine is cancelled and the sync is awaited until every
/// in-flight chunk write has finished, so the call returns [`Error::Cancelled`]
/// rather than abandoning files mid-write.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use depot_sync::{
///     AppId, DepotDownloadRequest, DepotId, DepotKey, DepotSync, HttpChunkFetcher,
///     HttpManifestSource, ServerEndpoint, SyncConfig, sync_with_shutdown,
/// };
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = SyncConfig::default();
///     let engine = DepotSync::new(
///         config.clone(),
///         vec![ServerEndpoint::new("cdn.example.com", 80)],
///         Arc::new(HttpManifestSource::new(&config.http)?),
///         Arc::new(HttpChunkFetcher::new(&config.http)?),
///     )?;
///     let request = DepotDownloadRequest::new(
///         "./out",
///         AppId(453090),
///         DepotId(453094),
///         DepotKey::new(vec![0u8; 32]),
///     );
///
///     // Run with automatic signal handling
///     sync_with_shutdown(&engine, request).await?;
///
///     Ok(())
/// }
/// ```
pub async fn sync_with_shutdown(
    engine: &DepotSync,
    request: DepotDownloadRequest,
) -> Result<SyncResult> {
    let sync = engine.sync(request);
    tokio::pin!(sync);

    tokio::select! {
        result = &mut sync => result,
        _ = wait_for_signal() => {
            engine.cancel();
            sync.await
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}

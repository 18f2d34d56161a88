//! Depot synchronization engine.
//!
//! [`DepotSync`] turns a [`DepotDownloadRequest`] into files on disk:
//! resolve the manifest, create directories, then download files under a
//! bounded admission gate, with every chunk of an admitted file in flight at
//! once.

mod chunk_worker;
mod context;
mod file_task;
mod orchestration;
mod progress;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

pub use progress::{ProgressAccumulator, ProgressSnapshot};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::fetcher::ChunkFetcher;
use crate::manifest::ManifestSource;
use crate::retry::RetryPolicy;
use crate::types::{DepotDownloadRequest, Event, ServerEndpoint, SyncResult};

/// Downloads depots from a set of content endpoints.
///
/// Cheap to clone; clones share configuration, event channel and the root
/// cancellation token. Each [`sync`](Self::sync) call gets its own connection
/// pool and its own child token, so concurrent syncs never interfere.
#[derive(Clone)]
pub struct DepotSync {
    pub(crate) config: Arc<SyncConfig>,
    pub(crate) endpoints: Arc<Vec<ServerEndpoint>>,
    pub(crate) manifests: Arc<dyn ManifestSource>,
    pub(crate) fetcher: Arc<dyn ChunkFetcher>,
    pub(crate) retry: Arc<dyn RetryPolicy>,
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    root_token: CancellationToken,
}

impl DepotSync {
    /// Create a sync engine over `endpoints`.
    ///
    /// The retry policy defaults to `config.retry`; replace it with
    /// [`with_retry_policy`](Self::with_retry_policy).
    pub fn new(
        config: SyncConfig,
        endpoints: Vec<ServerEndpoint>,
        manifests: Arc<dyn ManifestSource>,
        fetcher: Arc<dyn ChunkFetcher>,
    ) -> Result<Self> {
        config.validate()?;
        let (event_tx, _rx) = tokio::sync::broadcast::channel(config.event_buffer);
        let retry: Arc<dyn RetryPolicy> = Arc::new(config.retry.clone());

        Ok(Self {
            config: Arc::new(config),
            endpoints: Arc::new(endpoints),
            manifests,
            fetcher,
            retry,
            event_tx,
            root_token: CancellationToken::new(),
        })
    }

    /// Replace the retry policy applied to retryable chunk failures
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry = policy;
        self
    }

    /// Subscribe to sync events
    ///
    /// Returns a broadcast receiver. Multiple subscribers are supported; slow
    /// subscribers miss events rather than stall the sync.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Current configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Cancel every running and future sync on this engine
    pub fn cancel(&self) {
        tracing::info!("Cancelling all depot syncs");
        self.root_token.cancel();
    }

    /// Download the depot described by `request` into `request.output_dir`.
    ///
    /// Returns totals on success. Authorization failures, pool exhaustion and
    /// cancellation always fail the whole sync; file failures do too unless
    /// `fail_fast` is disabled.
    pub async fn sync(&self, request: DepotDownloadRequest) -> Result<SyncResult> {
        let depot_id = request.depot_id;
        tracing::info!(
            app_id = %request.app_id,
            depot_id = %depot_id,
            branch = %request.branch,
            output_dir = %request.output_dir.display(),
            "Starting depot sync"
        );
        self.event_tx
            .send(Event::SyncStarted {
                depot_id,
                branch: request.branch.clone(),
            })
            .ok();

        let cancel_token = self.root_token.child_token();
        match self.run_sync(request, cancel_token).await {
            Ok(result) => {
                tracing::info!(
                    depot_id = %depot_id,
                    files = result.files_completed,
                    "Downloaded {} bytes ({} uncompressed)",
                    result.bytes_compressed,
                    result.bytes_uncompressed
                );
                self.event_tx
                    .send(Event::SyncComplete {
                        depot_id,
                        bytes_compressed: result.bytes_compressed,
                        bytes_uncompressed: result.bytes_uncompressed,
                    })
                    .ok();
                Ok(result)
            }
            Err(SyncFailure { error, bytes_uncompressed }) => {
                if matches!(error, Error::Cancelled) {
                    tracing::info!(depot_id = %depot_id, "Depot sync cancelled");
                } else {
                    tracing::error!(depot_id = %depot_id, error = %error, "Depot sync failed");
                }
                self.event_tx
                    .send(Event::SyncFailed {
                        depot_id,
                        error: error.to_string(),
                        bytes_uncompressed,
                    })
                    .ok();
                Err(error)
            }
        }
    }
}

/// A failed sync with the progress it made before stopping
pub(crate) struct SyncFailure {
    pub(crate) error: Error,
    pub(crate) bytes_uncompressed: u64,
}

impl From<Error> for SyncFailure {
    fn from(error: Error) -> Self {
        Self {
            error,
            bytes_uncompressed: 0,
        }
    }
}

impl std::fmt::Debug for DepotSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepotSync")
            .field("config", &self.config)
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

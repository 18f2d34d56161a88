//! Shared state for a single depot sync, reducing parameter passing between
//! the orchestrator, file tasks and chunk workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::Error;
use crate::fetcher::{ChunkFetcher, FetchError};
use crate::materializer::FileMaterializer;
use crate::pool::ConnectionPool;
use crate::retry::RetryPolicy;
use crate::types::{AppId, DepotId, DepotKey, Event};

use super::progress::ProgressAccumulator;

pub(crate) struct SyncContext {
    pub(crate) app_id: AppId,
    pub(crate) depot_id: DepotId,
    pub(crate) depot_key: DepotKey,
    pub(crate) config: Arc<SyncConfig>,
    pub(crate) pool: ConnectionPool,
    pub(crate) fetcher: Arc<dyn ChunkFetcher>,
    pub(crate) retry: Arc<dyn RetryPolicy>,
    pub(crate) materializer: FileMaterializer,
    pub(crate) progress: Arc<ProgressAccumulator>,
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Single token for the whole sync; set once, never unset
    pub(crate) cancel_token: CancellationToken,
    auth_failure_logged: AtomicBool,
}

pub(crate) struct SyncContextParams {
    pub app_id: AppId,
    pub depot_id: DepotId,
    pub depot_key: DepotKey,
    pub config: Arc<SyncConfig>,
    pub pool: ConnectionPool,
    pub fetcher: Arc<dyn ChunkFetcher>,
    pub retry: Arc<dyn RetryPolicy>,
    pub materializer: FileMaterializer,
    pub progress: Arc<ProgressAccumulator>,
    pub event_tx: tokio::sync::broadcast::Sender<Event>,
    pub cancel_token: CancellationToken,
}

impl SyncContext {
    pub(crate) fn new(params: SyncContextParams) -> Self {
        let SyncContextParams {
            app_id,
            depot_id,
            depot_key,
            config,
            pool,
            fetcher,
            retry,
            materializer,
            progress,
            event_tx,
            cancel_token,
        } = params;
        Self {
            app_id,
            depot_id,
            depot_key,
            config,
            pool,
            fetcher,
            retry,
            materializer,
            progress,
            event_tx,
            cancel_token,
            auth_failure_logged: AtomicBool::new(false),
        }
    }

    /// Stop the whole sync on an authorization failure.
    ///
    /// Many in-flight chunks tend to hit the same 401/403 at once; only the
    /// first one is logged.
    pub(crate) fn abort_unauthorized(&self, cause: &FetchError) -> Error {
        if !self.auth_failure_logged.swap(true, Ordering::SeqCst) {
            tracing::error!(
                depot_id = %self.depot_id,
                error = %cause,
                "Access denied to depot, cancelling sync"
            );
        }
        self.cancel_token.cancel();
        Error::Unauthorized {
            depot_id: self.depot_id,
            reason: cause.to_string(),
        }
    }

    pub(crate) fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}

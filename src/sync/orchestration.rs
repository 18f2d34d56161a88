//! Sync orchestration: the top-level lifecycle of one depot download.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ResolutionError, Result};
use crate::fetcher::FetchError;
use crate::manifest::Manifest;
use crate::materializer::FileMaterializer;
use crate::pool::ConnectionPool;
use crate::types::{
    AppId, DepotDownloadRequest, DepotId, DepotKey, Event, FileEntry, SyncResult,
};

use super::context::{SyncContext, SyncContextParams};
use super::file_task::download_file;
use super::progress::{ProgressAccumulator, ProgressReporterParams, spawn_progress_reporter};
use super::{DepotSync, SyncFailure};

/// Aggregated outcome of every admitted file task.
#[derive(Default)]
struct FileResults {
    completed: u64,
    failed: u64,
    errors: Vec<Error>,
}

/// Which error explains a failed sync best. Lower wins.
fn error_rank(error: &Error) -> u8 {
    match error {
        Error::Unauthorized { .. } => 0,
        Error::PoolExhausted { .. } => 1,
        Error::Cancelled => 3,
        _ => 2,
    }
}

impl FileResults {
    fn take_primary_error(&mut self) -> Option<Error> {
        let index = self
            .errors
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| error_rank(e))
            .map(|(i, _)| i)?;
        Some(self.errors.swap_remove(index))
    }
}

impl DepotSync {
    /// Phases:
    /// 1. Prepare the output directory and check the depot key
    /// 2. Resolve and validate the manifest
    /// 3. Create directory entries, one at a time
    /// 4. Download included files behind the admission gate
    /// 5. Fold file outcomes into a result or the error that explains the failure
    pub(super) async fn run_sync(
        &self,
        request: DepotDownloadRequest,
        cancel_token: CancellationToken,
    ) -> std::result::Result<SyncResult, SyncFailure> {
        let DepotDownloadRequest {
            output_dir,
            app_id,
            depot_id,
            branch,
            depot_key,
            include,
        } = request;

        // Phase 1
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(Error::from)?;
        if !depot_key.is_valid() {
            return Err(Error::from(ResolutionError::KeyUnavailable { depot_id }).into());
        }

        // Phase 2
        let pool = ConnectionPool::new(
            self.endpoints.as_ref().clone(),
            self.config.pool.clone(),
            cancel_token.clone(),
        );
        let manifest = self
            .resolve_manifest(&pool, app_id, depot_id, &branch, &depot_key, &cancel_token)
            .await?;
        manifest.validate().map_err(Error::from)?;

        let files: Vec<FileEntry> = manifest
            .included_files(&include)
            .into_iter()
            .cloned()
            .collect();
        let total_bytes: u64 = files.iter().map(|f| f.total_size).sum();
        tracing::info!(
            depot_id = %depot_id,
            manifest_id = %manifest.manifest_id,
            files = files.len(),
            total_bytes,
            "Manifest resolved"
        );
        self.event_tx
            .send(Event::ManifestResolved {
                depot_id,
                manifest_id: manifest.manifest_id,
                files: files.len(),
                total_bytes,
            })
            .ok();

        // Phase 3
        let materializer = FileMaterializer::new(&output_dir);
        let mut directories_created = 0;
        for dir in manifest.directories() {
            if cancel_token.is_cancelled() {
                return Err(Error::Cancelled.into());
            }
            materializer
                .create_dir(&dir.path)
                .await
                .map_err(Error::from)?;
            directories_created += 1;
            self.event_tx
                .send(Event::DirectoryCreated {
                    path: dir.path.clone(),
                })
                .ok();
        }

        // Phase 4
        let progress = Arc::new(ProgressAccumulator::new(total_bytes));
        let ctx = Arc::new(SyncContext::new(SyncContextParams {
            app_id,
            depot_id,
            depot_key,
            config: Arc::clone(&self.config),
            pool: pool.clone(),
            fetcher: Arc::clone(&self.fetcher),
            retry: Arc::clone(&self.retry),
            materializer,
            progress: Arc::clone(&progress),
            event_tx: self.event_tx.clone(),
            cancel_token: cancel_token.clone(),
        }));

        let reporter_stop = cancel_token.child_token();
        let reporter = spawn_progress_reporter(ProgressReporterParams {
            progress: Arc::clone(&progress),
            interval: self.config.progress_interval,
            event_tx: self.event_tx.clone(),
            stop: reporter_stop.clone(),
        });

        let mut results = admit_files(&ctx, files).await;

        reporter_stop.cancel();
        if let Err(e) = reporter.await {
            tracing::warn!(depot_id = %depot_id, error = %e, "Progress reporter task failed");
        }

        // Phase 5
        let snapshot = progress.snapshot();
        let mut primary = results.take_primary_error();
        if pool.is_exhausted() && !primary.as_ref().is_some_and(Error::is_authorization) {
            primary = Some(Error::PoolExhausted { depot_id });
        }
        let cancelled = cancel_token.is_cancelled();

        let failure = match primary {
            Some(Error::Cancelled) | None if cancelled => Some(Error::Cancelled),
            Some(e) if cancelled || self.config.fail_fast || e.is_depot_fatal() => Some(e),
            _ => None,
        };
        if let Some(error) = failure {
            return Err(SyncFailure {
                error,
                bytes_uncompressed: snapshot.bytes_uncompressed,
            });
        }

        Ok(SyncResult {
            bytes_compressed: snapshot.bytes_compressed,
            bytes_uncompressed: snapshot.bytes_uncompressed,
            files_completed: results.completed,
            files_failed: results.failed,
            directories_created,
        })
    }

    /// Fetch the manifest through the pool, retrying transport failures on
    /// other endpoints the same way chunk downloads do.
    async fn resolve_manifest(
        &self,
        pool: &ConnectionPool,
        app_id: AppId,
        depot_id: DepotId,
        branch: &str,
        depot_key: &DepotKey,
        cancel_token: &CancellationToken,
    ) -> Result<Manifest> {
        let mut retries: u32 = 0;
        let mut last_error: Option<FetchError> = None;

        let unavailable = |last_error: Option<FetchError>| -> Error {
            ResolutionError::ManifestUnavailable {
                depot_id,
                reason: last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no content endpoints available".to_string()),
            }
            .into()
        };

        loop {
            let lease = match pool.acquire(app_id, depot_id, cancel_token).await {
                Ok(lease) => lease,
                Err(Error::PoolExhausted { .. }) => return Err(unavailable(last_error)),
                Err(e) => return Err(e),
            };

            let fetched = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => return Err(Error::Cancelled),
                result = self.manifests.fetch_manifest(lease.endpoint(), app_id, depot_id, branch, depot_key) => result,
            };

            match fetched {
                Ok(manifest) => {
                    pool.release(lease, true);
                    return Ok(manifest);
                }
                Err(FetchError::NotFound(_)) => {
                    pool.release(lease, true);
                    return Err(ResolutionError::ManifestNotFound {
                        depot_id,
                        branch: branch.to_string(),
                    }
                    .into());
                }
                Err(e) if e.is_authorization() => {
                    pool.release(lease, false);
                    return Err(Error::Unauthorized {
                        depot_id,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        depot_id = %depot_id,
                        endpoint = %lease.endpoint(),
                        error = %e,
                        "Manifest request failed, will retry"
                    );
                    pool.release(lease, false);
                    last_error = Some(e);
                }
            }

            retries = retries.saturating_add(1);
            match self.retry.delay_for(retries) {
                None => return Err(unavailable(last_error)),
                Some(delay) if delay.is_zero() => tokio::task::yield_now().await,
                Some(delay) => {
                    tokio::select! {
                        _ = cancel_token.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Run file tasks behind the admission gate until every file is done or the
/// sync is cancelled. Files not yet admitted when cancellation fires are
/// never started.
async fn admit_files(ctx: &Arc<SyncContext>, files: Vec<FileEntry>) -> FileResults {
    let gate = Arc::new(Semaphore::new(ctx.config.max_concurrent_files));
    let mut tasks = JoinSet::new();

    for entry in files {
        let permit = tokio::select! {
            biased;
            _ = ctx.cancel_token.cancelled() => break,
            permit = Arc::clone(&gate).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let ctx = Arc::clone(ctx);
        tasks.spawn(async move {
            let _permit = permit;
            let result = download_file(&ctx, &entry).await;
            if let Err(e) = &result
                && !matches!(e, Error::Cancelled)
                && (ctx.config.fail_fast || e.is_depot_fatal())
            {
                ctx.cancel_token.cancel();
            }
            result
        });
    }

    let mut results = FileResults::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(_)) => results.completed += 1,
            Ok(Err(Error::Cancelled)) => results.errors.push(Error::Cancelled),
            Ok(Err(e)) => {
                results.failed += 1;
                results.errors.push(e);
            }
            Err(join_err) => {
                tracing::error!(depot_id = %ctx.depot_id, error = %join_err, "File task panicked");
                if ctx.config.fail_fast {
                    ctx.cancel_token.cancel();
                }
                results.failed += 1;
                results
                    .errors
                    .push(Error::Other(format!("file task failed: {join_err}")));
            }
        }
    }
    results
}

//! One file: open, fan out a worker per chunk, fan in, then close or discard.

use futures::stream::{FuturesUnordered, StreamExt};

use crate::error::{Error, Result};
use crate::materializer::FileHandle;
use crate::types::{Event, FileEntry};

use super::chunk_worker::download_chunk;
use super::context::SyncContext;

/// Download every chunk of `entry` and return the uncompressed bytes written.
///
/// Chunks within the file are not bounded. The first failure cancels the
/// file's remaining chunks; the partially written file is then removed.
pub(crate) async fn download_file(ctx: &SyncContext, entry: &FileEntry) -> Result<u64> {
    if ctx.cancel_token.is_cancelled() {
        return Err(Error::Cancelled);
    }

    ctx.emit(Event::FileStarted {
        path: entry.path.clone(),
        total_size: entry.total_size,
    });

    let handle = match ctx.materializer.open(&entry.path, entry.total_size).await {
        Ok(handle) => handle,
        Err(e) => {
            ctx.emit(Event::FileFailed {
                path: entry.path.clone(),
                error: e.to_string(),
            });
            return Err(e.into());
        }
    };

    let file_cancel = ctx.cancel_token.child_token();
    let mut workers: FuturesUnordered<_> = entry
        .chunks
        .iter()
        .map(|chunk| download_chunk(ctx, &file_cancel, &handle, chunk))
        .collect();

    let mut written: u64 = 0;
    let mut first_error: Option<Error> = None;

    // Drain every worker, even after a failure, so no write is left mid-flight
    while let Some(result) = workers.next().await {
        match result {
            Ok(bytes) => {
                written += bytes;
                if first_error.is_none() && entry.total_size > 0 {
                    ctx.emit(Event::FileProgress {
                        path: entry.path.clone(),
                        percent: (written as f32 / entry.total_size as f32) * 100.0,
                    });
                }
            }
            Err(e) => {
                file_cancel.cancel();
                // Siblings report Cancelled once the file token fires; keep the cause
                if first_error
                    .as_ref()
                    .is_none_or(|first| matches!(first, Error::Cancelled))
                {
                    first_error = Some(e);
                }
            }
        }
    }
    drop(workers);

    let outcome = match first_error {
        Some(e) => Err(e),
        None => finish(&handle, entry.flags.executable).await,
    };

    if let Err(e) = outcome {
        handle.discard().await;
        if !matches!(e, Error::Cancelled) {
            tracing::warn!(
                depot_id = %ctx.depot_id,
                path = %entry.path.display(),
                error = %e,
                "File failed"
            );
        }
        ctx.emit(Event::FileFailed {
            path: entry.path.clone(),
            error: e.to_string(),
        });
        return Err(e);
    }
    drop(handle);

    ctx.progress.file_completed();
    let overall_percent = ctx.progress.snapshot().percent;
    tracing::info!(
        depot_id = %ctx.depot_id,
        path = %entry.path.display(),
        percent = overall_percent,
        "File complete"
    );
    ctx.emit(Event::FileComplete {
        path: entry.path.clone(),
        overall_percent,
    });

    Ok(written)
}

/// Apply file flags and flush to disk. A failure here fails the file like a
/// chunk failure would.
async fn finish(handle: &FileHandle, executable: bool) -> Result<()> {
    if executable {
        handle.set_executable().await?;
    }
    handle.close().await?;
    Ok(())
}

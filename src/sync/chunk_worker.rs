//! Per-chunk retry state machine.
//!
//! ```text
//! Pending -> Acquiring -> Fetching -> Succeeded
//!               ^            |
//!               |            +-> RetryableFailure --(policy allows)--+
//!               |            |                                       |
//!               +------------|---------------------------------------+
//!                            +-> FatalFailure
//! ```
//!
//! Authorization failures and an exhausted pool are fatal; everything else
//! hands the endpoint back as broken and tries again on whichever endpoint the
//! pool offers next.

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::fetcher::chunk_checksum;
use crate::materializer::FileHandle;
use crate::pool::PooledEndpoint;
use crate::retry::IsRetryable;
use crate::types::ChunkDescriptor;

use super::context::SyncContext;

#[derive(Debug)]
pub(crate) enum ChunkState {
    Pending,
    Acquiring,
    Fetching(PooledEndpoint),
    Succeeded(Vec<u8>),
    RetryableFailure(String),
    FatalFailure(Error),
}

/// Check the decoded bytes against the manifest's length and checksum.
fn verify(ctx: &SyncContext, chunk: &ChunkDescriptor, data: &[u8]) -> std::result::Result<(), String> {
    if data.len() != chunk.uncompressed_length as usize {
        return Err(format!(
            "length mismatch: got {} bytes, expected {}",
            data.len(),
            chunk.uncompressed_length
        ));
    }
    if ctx.config.verify_checksums {
        let actual = chunk_checksum(data);
        if actual != chunk.checksum {
            return Err(format!(
                "checksum mismatch: got {actual:08x}, expected {:08x}",
                chunk.checksum
            ));
        }
    }
    Ok(())
}

/// Download one chunk into `file`, retrying per the sync's retry policy.
///
/// `cancel` is the owning file's token, a child of the sync token. Returns the
/// number of uncompressed bytes written.
pub(crate) async fn download_chunk(
    ctx: &SyncContext,
    cancel: &CancellationToken,
    file: &FileHandle,
    chunk: &ChunkDescriptor,
) -> Result<u64> {
    let mut state = ChunkState::Pending;
    let mut retries: u32 = 0;

    loop {
        state = match state {
            ChunkState::Pending => ChunkState::Acquiring,

            ChunkState::Acquiring => match ctx.pool.acquire(ctx.app_id, ctx.depot_id, cancel).await {
                Ok(lease) => ChunkState::Fetching(lease),
                Err(e) => ChunkState::FatalFailure(e),
            },

            ChunkState::Fetching(lease) => {
                let fetched = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = ctx.fetcher.fetch_chunk(lease.endpoint(), ctx.depot_id, chunk, &ctx.depot_key) => Some(result),
                };

                match fetched {
                    // Dropping the lease frees the slot without judging the endpoint
                    None => ChunkState::FatalFailure(Error::Cancelled),
                    Some(Ok(data)) => match verify(ctx, chunk, &data) {
                        Ok(()) => {
                            ctx.pool.release(lease, true);
                            ChunkState::Succeeded(data)
                        }
                        Err(reason) => {
                            ctx.pool.release(lease, false);
                            ChunkState::RetryableFailure(reason)
                        }
                    },
                    Some(Err(e)) if !e.is_retryable() => {
                        let fatal = ctx.abort_unauthorized(&e);
                        ctx.pool.release(lease, false);
                        ChunkState::FatalFailure(fatal)
                    }
                    Some(Err(e)) => {
                        tracing::warn!(
                            chunk = %chunk.id,
                            endpoint = %lease.endpoint(),
                            error = %e,
                            "Chunk fetch failed, will retry"
                        );
                        ctx.pool.release(lease, false);
                        ChunkState::RetryableFailure(e.to_string())
                    }
                }
            }

            ChunkState::Succeeded(data) => {
                // Never raced against cancellation: a started write always finishes
                file.write_at(chunk.offset, data).await?;
                let uncompressed = u64::from(chunk.uncompressed_length);
                ctx.progress
                    .add_chunk(u64::from(chunk.compressed_length), uncompressed);
                tracing::debug!(
                    chunk = %chunk.id,
                    path = %file.path().display(),
                    offset = chunk.offset,
                    retries,
                    "Chunk written"
                );
                return Ok(uncompressed);
            }

            ChunkState::RetryableFailure(reason) => {
                retries = retries.saturating_add(1);
                match ctx.retry.delay_for(retries) {
                    None => {
                        tracing::error!(
                            chunk = %chunk.id,
                            attempts = retries,
                            error = %reason,
                            "Giving up on chunk"
                        );
                        ChunkState::FatalFailure(Error::RetriesExhausted {
                            chunk: chunk.id,
                            attempts: retries,
                            last_error: reason,
                        })
                    }
                    Some(delay) if delay.is_zero() => {
                        // Immediate retries still give sibling tasks a turn
                        tokio::task::yield_now().await;
                        ChunkState::Acquiring
                    }
                    Some(delay) => {
                        tracing::debug!(
                            chunk = %chunk.id,
                            retry = retries,
                            delay_ms = delay.as_millis() as u64,
                            "Backing off before retry"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => ChunkState::FatalFailure(Error::Cancelled),
                            _ = tokio::time::sleep(delay) => ChunkState::Acquiring,
                        }
                    }
                }
            }

            ChunkState::FatalFailure(e) => return Err(e),
        };
    }
}

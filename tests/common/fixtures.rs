//! Manifest fixtures and a scripted in-memory chunk fetcher

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use depot_sync::{
    AppId, ChunkDescriptor, ChunkFetcher, ChunkId, DepotDownloadRequest, DepotId, DepotKey,
    DepotSync, FetchError, FileEntry, FileFlags, Manifest, ManifestId, ServerEndpoint,
    StaticManifest, SyncConfig, chunk_checksum,
};

/// App the test depot belongs to
pub const APP: AppId = AppId(453090);
/// Test depot
pub const DEPOT: DepotId = DepotId(453094);

/// Chunk id derived from a one-byte seed
pub fn chunk_id(seed: u8) -> ChunkId {
    ChunkId([seed; 20])
}

/// Bytes a seeded chunk serves
pub fn chunk_bytes(seed: u8, len: u32) -> Vec<u8> {
    vec![seed; len as usize]
}

fn file(path: &str, chunks: &[(u8, u32)]) -> FileEntry {
    let mut offset = 0u64;
    let chunks = chunks
        .iter()
        .map(|&(seed, len)| {
            let descriptor = ChunkDescriptor {
                id: chunk_id(seed),
                checksum: chunk_checksum(&chunk_bytes(seed, len)),
                offset,
                compressed_length: len,
                uncompressed_length: len,
            };
            offset += u64::from(len);
            descriptor
        })
        .collect();
    FileEntry {
        path: PathBuf::from(path),
        total_size: offset,
        flags: FileFlags::default(),
        chunks,
    }
}

/// A: 10 bytes in one chunk (seed 1). B: 20 bytes in two 10-byte chunks (seeds 2, 3).
pub fn two_file_manifest() -> Manifest {
    Manifest {
        depot_id: DEPOT,
        manifest_id: ManifestId(1_234_567_890),
        files: vec![file("A", &[(1, 10)]), file("B", &[(2, 10), (3, 10)])],
    }
}

/// Expected on-disk bytes of file B
pub fn file_b_bytes() -> Vec<u8> {
    let mut bytes = chunk_bytes(2, 10);
    bytes.extend(chunk_bytes(3, 10));
    bytes
}

/// Depot key of the right length
pub fn depot_key() -> DepotKey {
    DepotKey::new(vec![0x42; 32])
}

/// Request for the test depot into `output_dir`
pub fn request(output_dir: &std::path::Path) -> DepotDownloadRequest {
    DepotDownloadRequest::new(output_dir, APP, DEPOT, depot_key())
}

/// In-memory fetcher that serves seeded chunk bytes after any scripted failures.
#[derive(Default)]
pub struct ScriptedFetcher {
    failures: Mutex<HashMap<ChunkId, VecDeque<FetchError>>>,
    delays: Mutex<HashMap<ChunkId, Duration>>,
    lengths: HashMap<ChunkId, u32>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    /// Fetcher for every chunk in `manifest`
    pub fn for_manifest(manifest: &Manifest) -> Self {
        let lengths = manifest
            .files
            .iter()
            .flat_map(|f| f.chunks.iter())
            .map(|c| (c.id, c.uncompressed_length))
            .collect();
        Self {
            lengths,
            ..Self::default()
        }
    }

    /// Fail the next fetch of `chunk` with `error`
    pub fn fail_next(&self, chunk: ChunkId, error: FetchError) {
        self.failures
            .lock()
            .unwrap()
            .entry(chunk)
            .or_default()
            .push_back(error);
    }

    /// Hold every fetch of `chunk` for `delay`
    pub fn delay(&self, chunk: ChunkId, delay: Duration) {
        self.delays.lock().unwrap().insert(chunk, delay);
    }

    /// Number of fetch attempts so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ChunkFetcher for ScriptedFetcher {
    async fn fetch_chunk(
        &self,
        _endpoint: &ServerEndpoint,
        _depot_id: DepotId,
        chunk: &ChunkDescriptor,
        _depot_key: &DepotKey,
    ) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().unwrap().get(&chunk.id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&chunk.id)
            .and_then(VecDeque::pop_front);
        if let Some(error) = failure {
            return Err(error);
        }
        let len = self
            .lengths
            .get(&chunk.id)
            .copied()
            .ok_or_else(|| FetchError::NotFound(chunk.id.to_string()))?;
        Ok(chunk_bytes(chunk.id.0[0], len))
    }
}

/// Fast, jitter-free config for tests
pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig {
        progress_interval: Duration::from_millis(10),
        ..SyncConfig::default()
    };
    config.retry.jitter = false;
    config.pool.penalty = Duration::ZERO;
    config
}

/// Engine serving `manifest` from memory through `fetcher`, over two endpoints
pub fn engine(manifest: Manifest, fetcher: Arc<ScriptedFetcher>) -> DepotSync {
    DepotSync::new(
        test_config(),
        vec![
            ServerEndpoint::new("cache1.cdn.test", 80),
            ServerEndpoint::new("cache2.cdn.test", 80),
        ],
        Arc::new(StaticManifest::new(manifest)),
        fetcher,
    )
    .unwrap()
}

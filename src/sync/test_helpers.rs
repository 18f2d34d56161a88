//! Shared helpers for building manifests and scripted fetchers in sync tests.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::SyncConfig;
use crate::fetcher::{ChunkFetcher, FetchError, chunk_checksum};
use crate::manifest::{Manifest, ManifestSource, StaticManifest};
use crate::sync::DepotSync;
use crate::types::{
    AppId, CHUNK_ID_LEN, ChunkDescriptor, ChunkId, DEPOT_KEY_LEN, DepotDownloadRequest, DepotId,
    DepotKey, FileEntry, FileFlags, ManifestId, ServerEndpoint,
};

pub(crate) const APP: AppId = AppId(453090);
pub(crate) const DEPOT: DepotId = DepotId(453094);

/// One scripted response, consumed before the chunk's real bytes are served
#[derive(Clone, Debug)]
pub(crate) enum Scripted {
    Fail(FetchError),
    Corrupt,
}

/// Builds a manifest and remembers the bytes each chunk should serve.
#[derive(Default)]
pub(crate) struct ManifestBuilder {
    files: Vec<FileEntry>,
    data: HashMap<ChunkId, Vec<u8>>,
    next_seed: u8,
}

impl ManifestBuilder {
    /// Add a file split into chunks of the given sizes, each filled with a distinct byte
    pub(crate) fn file(mut self, path: &str, chunk_sizes: &[u32]) -> Self {
        let mut offset = 0u64;
        let mut chunks = Vec::new();
        for &size in chunk_sizes {
            self.next_seed = self.next_seed.wrapping_add(1);
            let seed = self.next_seed;
            let bytes = vec![seed; size as usize];
            let id = ChunkId([seed; CHUNK_ID_LEN]);
            chunks.push(ChunkDescriptor {
                id,
                checksum: chunk_checksum(&bytes),
                offset,
                compressed_length: size,
                uncompressed_length: size,
            });
            self.data.insert(id, bytes);
            offset += u64::from(size);
        }
        self.files.push(FileEntry {
            path: PathBuf::from(path),
            total_size: offset,
            flags: FileFlags::default(),
            chunks,
        });
        self
    }

    /// Mark the most recently added file executable
    pub(crate) fn executable(mut self) -> Self {
        if let Some(last) = self.files.last_mut() {
            last.flags.executable = true;
        }
        self
    }

    pub(crate) fn directory(mut self, path: &str) -> Self {
        self.files.push(FileEntry {
            path: PathBuf::from(path),
            total_size: 0,
            flags: FileFlags {
                directory: true,
                executable: false,
            },
            chunks: vec![],
        });
        self
    }

    pub(crate) fn build(self) -> (Manifest, ScriptedFetcher) {
        let manifest = Manifest {
            depot_id: DEPOT,
            manifest_id: ManifestId(7_600_000_000_000_000_001),
            files: self.files,
        };
        (manifest, ScriptedFetcher::new(self.data))
    }
}

/// Two files: `A.dll` (10 bytes, one chunk) and `B.dll` (20 bytes, two chunks)
pub(crate) fn two_file_manifest() -> (Manifest, ScriptedFetcher) {
    ManifestBuilder::default()
        .file("A.dll", &[10])
        .file("B.dll", &[10, 10])
        .build()
}

/// Serves known chunk bytes, with optional scripted failures and delays.
pub(crate) struct ScriptedFetcher {
    data: HashMap<ChunkId, Vec<u8>>,
    script: Mutex<HashMap<ChunkId, VecDeque<Scripted>>>,
    delays: Mutex<HashMap<ChunkId, Duration>>,
    default_delay: Mutex<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedFetcher {
    fn new(data: HashMap<ChunkId, Vec<u8>>) -> Self {
        Self {
            data,
            script: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            default_delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn script(&self, chunk: ChunkId, outcomes: impl IntoIterator<Item = Scripted>) {
        self.script
            .lock()
            .unwrap()
            .entry(chunk)
            .or_default()
            .extend(outcomes);
    }

    pub(crate) fn fail_always(&self, chunk: ChunkId, error: FetchError) {
        self.script(chunk, std::iter::repeat_n(Scripted::Fail(error), 10_000));
    }

    pub(crate) fn delay(&self, chunk: ChunkId, delay: Duration) {
        self.delays.lock().unwrap().insert(chunk, delay);
    }

    pub(crate) fn delay_all(&self, delay: Duration) {
        *self.default_delay.lock().unwrap() = delay;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
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
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self
            .delays
            .lock()
            .unwrap()
            .get(&chunk.id)
            .copied()
            .unwrap_or(*self.default_delay.lock().unwrap());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&chunk.id)
            .and_then(VecDeque::pop_front);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let data = self
            .data
            .get(&chunk.id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(chunk.id.to_string()))?;
        match scripted {
            Some(Scripted::Fail(e)) => Err(e),
            Some(Scripted::Corrupt) => Ok(data.iter().map(|b| b ^ 0xff).collect()),
            None => Ok(data),
        }
    }
}

pub(crate) fn key() -> DepotKey {
    DepotKey::new(vec![0x5a; DEPOT_KEY_LEN])
}

pub(crate) fn endpoints(n: u16) -> Vec<ServerEndpoint> {
    (0..n)
        .map(|i| ServerEndpoint::new(format!("cache{i}.cdn.test"), 80))
        .collect()
}

pub(crate) fn request(output_dir: &std::path::Path) -> DepotDownloadRequest {
    DepotDownloadRequest::new(output_dir, APP, DEPOT, key())
}

/// Engine over `manifest` and `fetcher` with two endpoints.
pub(crate) fn engine(
    config: SyncConfig,
    manifest: Manifest,
    fetcher: Arc<ScriptedFetcher>,
) -> DepotSync {
    engine_with_source(config, Arc::new(StaticManifest::new(manifest)), fetcher)
}

pub(crate) fn engine_with_source(
    config: SyncConfig,
    source: Arc<dyn ManifestSource>,
    fetcher: Arc<ScriptedFetcher>,
) -> DepotSync {
    DepotSync::new(config, endpoints(2), source, fetcher).unwrap()
}

/// Config tuned for fast tests: quick progress ticks, no jitter
pub(crate) fn test_config() -> SyncConfig {
    let mut config = SyncConfig {
        progress_interval: Duration::from_millis(10),
        ..SyncConfig::default()
    };
    config.retry.jitter = false;
    config.pool.penalty = Duration::ZERO;
    config.pool.max_endpoint_failures = 1_000;
    config
}

//! Core types for depot-sync

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Application identifier on the content service
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(pub u32);

/// Depot identifier on the content service
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DepotId(pub u32);

/// Identifier of one depot version
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestId(pub u64);

macro_rules! numeric_id {
    ($name:ident, $inner:ty) => {
        impl From<$inner> for $name {
            fn from(id: $inner) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<$inner>().map(Self)
            }
        }
    };
}

numeric_id!(AppId, u32);
numeric_id!(DepotId, u32);
numeric_id!(ManifestId, u64);

/// Length in bytes of a chunk fingerprint
pub const CHUNK_ID_LEN: usize = 20;

/// Content fingerprint of a chunk (SHA-1 sized), displayed as lowercase hex
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(pub [u8; CHUNK_ID_LEN]);

impl ChunkId {
    /// Lowercase hex form used in URLs and logs
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 40-character hex fingerprint
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; CHUNK_ID_LEN];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChunkId({})", self.to_hex())
    }
}

impl std::str::FromStr for ChunkId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ChunkId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// One content-addressed byte range of a file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// Content fingerprint
    pub id: ChunkId,
    /// Adler-32 (seed 0) of the uncompressed bytes
    pub checksum: u32,
    /// Byte offset within the reconstructed file
    pub offset: u64,
    /// Length on the wire
    pub compressed_length: u32,
    /// Length once decrypted and decompressed
    pub uncompressed_length: u32,
}

impl ChunkDescriptor {
    /// Exclusive end offset of this chunk in the reconstructed file, or
    /// `None` if it does not fit in a `u64`
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(u64::from(self.uncompressed_length))
    }
}

/// Flags carried by a manifest file entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFlags {
    /// Entry only marks a directory to create
    #[serde(default)]
    pub directory: bool,
    /// Entry should be marked executable once written
    #[serde(default)]
    pub executable: bool,
}

/// One file (or directory marker) described by a manifest
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the output directory
    pub path: PathBuf,
    /// Uncompressed size of the reconstructed file
    pub total_size: u64,
    /// Entry flags
    #[serde(default)]
    pub flags: FileFlags,
    /// Chunks covering `[0, total_size)`
    #[serde(default)]
    pub chunks: Vec<ChunkDescriptor>,
}

impl FileEntry {
    /// True for entries that only cause directory creation
    pub fn is_directory(&self) -> bool {
        self.flags.directory
    }

    /// Sum of compressed chunk lengths (bytes on the wire)
    pub fn compressed_size(&self) -> u64 {
        self.chunks
            .iter()
            .map(|c| u64::from(c.compressed_length))
            .sum()
    }
}

/// Opaque handle for one reachable content host
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// Hostname or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Use HTTPS rather than plain HTTP
    #[serde(default)]
    pub https: bool,
    /// Lower values are preferred when several endpoints are healthy
    #[serde(default)]
    pub priority: i32,
}

impl ServerEndpoint {
    /// Create a plain-HTTP endpoint with default priority
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            https: false,
            priority: 0,
        }
    }

    /// Base URL for requests against this endpoint
    pub fn base_url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Length in bytes of a depot decryption key
pub const DEPOT_KEY_LEN: usize = 32;

/// Symmetric key used to decrypt a depot's chunks
#[derive(Clone, PartialEq, Eq)]
pub struct DepotKey(Vec<u8>);

impl DepotKey {
    /// Wrap raw key material
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw key material
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True when the key has the expected length
    pub fn is_valid(&self) -> bool {
        self.0.len() == DEPOT_KEY_LEN
    }
}

impl std::fmt::Debug for DepotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DepotKey(<{} bytes redacted>)", self.0.len())
    }
}

/// Caller-supplied predicate deciding which manifest files to download
#[derive(Clone)]
pub struct FileFilter(Arc<dyn Fn(&Path) -> bool + Send + Sync>);

impl FileFilter {
    /// Wrap an arbitrary predicate over the relative path
    pub fn new(predicate: impl Fn(&Path) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Accept every file
    pub fn all() -> Self {
        Self::new(|_| true)
    }

    /// Accept files with the given extension (case-insensitive, without the dot)
    pub fn extension(ext: impl Into<String>) -> Self {
        let ext = ext.into();
        Self::new(move |path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(&ext))
        })
    }

    /// Evaluate the predicate
    pub fn includes(&self, path: &Path) -> bool {
        (self.0)(path)
    }
}

impl Default for FileFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl std::fmt::Debug for FileFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FileFilter(..)")
    }
}

/// Everything needed to sync one depot, fixed for the duration of the sync
#[derive(Clone, Debug)]
pub struct DepotDownloadRequest {
    /// Directory files are materialized under
    pub output_dir: PathBuf,
    /// Owning application
    pub app_id: AppId,
    /// Depot to download
    pub depot_id: DepotId,
    /// Release channel, e.g. "public"
    pub branch: String,
    /// Chunk decryption key
    pub depot_key: DepotKey,
    /// Which files to download
    pub include: FileFilter,
}

impl DepotDownloadRequest {
    /// Request every file of `depot_id` on the public branch
    pub fn new(
        output_dir: impl Into<PathBuf>,
        app_id: AppId,
        depot_id: DepotId,
        depot_key: DepotKey,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            app_id,
            depot_id,
            branch: "public".to_string(),
            depot_key,
            include: FileFilter::all(),
        }
    }

    /// Use a different branch
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    /// Restrict which files are downloaded
    pub fn with_filter(mut self, include: FileFilter) -> Self {
        self.include = include;
        self
    }
}

/// Totals reported by a successful sync
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Bytes transferred on the wire
    pub bytes_compressed: u64,
    /// Bytes written to disk
    pub bytes_uncompressed: u64,
    /// Content files fully written
    pub files_completed: u64,
    /// Content files that failed and were removed (only non-zero without `fail_fast`)
    pub files_failed: u64,
    /// Directory markers created
    pub directories_created: u64,
}

/// Event emitted during a depot sync
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Sync accepted and output directory prepared
    SyncStarted {
        /// Depot being synced
        depot_id: DepotId,
        /// Branch being synced
        branch: String,
    },

    /// Manifest fetched and validated
    ManifestResolved {
        /// Depot being synced
        depot_id: DepotId,
        /// Manifest version
        manifest_id: ManifestId,
        /// Content files selected by the inclusion predicate
        files: usize,
        /// Sum of `total_size` over the selected files
        total_bytes: u64,
    },

    /// Directory marker created on disk
    DirectoryCreated {
        /// Relative path of the directory
        path: PathBuf,
    },

    /// File admitted through the concurrency gate
    FileStarted {
        /// Relative path of the file
        path: PathBuf,
        /// Declared size
        total_size: u64,
    },

    /// A chunk of a file landed on disk
    FileProgress {
        /// Relative path of the file
        path: PathBuf,
        /// File completion (0.0 to 100.0)
        percent: f32,
    },

    /// File fully written and closed
    FileComplete {
        /// Relative path of the file
        path: PathBuf,
        /// Depot completion at the time this file finished (0.0 to 100.0)
        overall_percent: f32,
    },

    /// File could not be completed
    FileFailed {
        /// Relative path of the file
        path: PathBuf,
        /// Error message
        error: String,
    },

    /// Periodic depot-wide progress
    Progress {
        /// Bytes transferred on the wire so far
        bytes_compressed: u64,
        /// Bytes written to disk so far
        bytes_uncompressed: u64,
        /// Depot completion (0.0 to 100.0)
        percent: f32,
    },

    /// Sync finished
    SyncComplete {
        /// Depot that was synced
        depot_id: DepotId,
        /// Bytes transferred on the wire
        bytes_compressed: u64,
        /// Bytes written to disk
        bytes_uncompressed: u64,
    },

    /// Sync stopped on an error
    SyncFailed {
        /// Depot that was being synced
        depot_id: DepotId,
        /// Error message
        error: String,
        /// Bytes written before the failure
        bytes_uncompressed: u64,
    },
}

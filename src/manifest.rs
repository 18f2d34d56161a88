//! Depot manifests and the seam for resolving them.
//!
//! A [`Manifest`] is immutable once handed to the engine. [`Manifest::validate`]
//! runs before any download starts and rejects manifests whose chunk lists do
//! not tile each file exactly, or whose paths would escape the output directory.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

use crate::error::ManifestError;
use crate::fetcher::FetchError;
use crate::types::{AppId, DepotId, DepotKey, FileEntry, FileFilter, ManifestId, ServerEndpoint};

/// Files and chunks of one depot version
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Depot this manifest belongs to
    pub depot_id: DepotId,
    /// Version identifier
    pub manifest_id: ManifestId,
    /// Entries in manifest order
    pub files: Vec<FileEntry>,
}

impl Manifest {
    /// Check every entry for safe paths and exact chunk coverage.
    ///
    /// Chunks may be listed in any order; they are checked sorted by offset.
    pub fn validate(&self) -> Result<(), ManifestError> {
        for entry in &self.files {
            validate_path(&entry.path)?;
            if entry.is_directory() {
                if !entry.chunks.is_empty() {
                    return Err(ManifestError::DirectoryWithChunks {
                        path: entry.path.clone(),
                        count: entry.chunks.len(),
                    });
                }
                continue;
            }
            validate_coverage(entry)?;
        }
        Ok(())
    }

    /// Directory markers, in manifest order
    pub fn directories(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.iter().filter(|f| f.is_directory())
    }

    /// Content files accepted by `filter`, evaluated once per entry
    pub fn included_files(&self, filter: &FileFilter) -> Vec<&FileEntry> {
        self.files
            .iter()
            .filter(|f| !f.is_directory() && filter.includes(&f.path))
            .collect()
    }
}

/// Reject absolute paths and any `..`, root, or prefix component.
fn validate_path(path: &Path) -> Result<(), ManifestError> {
    let unsafe_component = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if unsafe_component || path.is_absolute() || path.as_os_str().is_empty() {
        return Err(ManifestError::UnsafePath {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn validate_coverage(entry: &FileEntry) -> Result<(), ManifestError> {
    let mut ranges = entry
        .chunks
        .iter()
        .map(|c| {
            c.end()
                .map(|end| (c.offset, end))
                .ok_or_else(|| ManifestError::OffsetOverflow {
                    path: entry.path.clone(),
                    offset: c.offset,
                    length: c.uncompressed_length,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    ranges.sort_unstable();

    let mut cursor = 0u64;
    for (start, end) in ranges {
        if start > cursor {
            return Err(ManifestError::Gap {
                path: entry.path.clone(),
                expected: cursor,
                found: start,
            });
        }
        if start < cursor {
            return Err(ManifestError::Overlap {
                path: entry.path.clone(),
                expected: cursor,
                found: start,
            });
        }
        cursor = end;
    }

    if cursor != entry.total_size {
        return Err(ManifestError::Truncated {
            path: entry.path.clone(),
            covered: cursor,
            total_size: entry.total_size,
        });
    }
    Ok(())
}

/// Abstraction over manifest retrieval, enabling testability.
///
/// Implementations locate the manifest for `branch` and decrypt its metadata;
/// the engine only drives retries and endpoint failover around this call.
#[async_trait::async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetch the manifest from one endpoint.
    ///
    /// Return [`FetchError::NotFound`] when the branch has no manifest; other
    /// variants are classified like chunk fetch failures.
    async fn fetch_manifest(
        &self,
        endpoint: &ServerEndpoint,
        app_id: AppId,
        depot_id: DepotId,
        branch: &str,
        depot_key: &DepotKey,
    ) -> Result<Manifest, FetchError>;
}

/// [`ManifestSource`] that serves a manifest already resolved by the caller.
pub struct StaticManifest {
    manifest: Manifest,
}

impl StaticManifest {
    /// Serve `manifest` for its own depot, on any branch
    pub fn new(manifest: Manifest) -> Self {
        Self { manifest }
    }
}

#[async_trait::async_trait]
impl ManifestSource for StaticManifest {
    async fn fetch_manifest(
        &self,
        _endpoint: &ServerEndpoint,
        _app_id: AppId,
        depot_id: DepotId,
        _branch: &str,
        _depot_key: &DepotKey,
    ) -> Result<Manifest, FetchError> {
        if depot_id != self.manifest.depot_id {
            return Err(FetchError::NotFound(format!(
                "no manifest for depot {depot_id}"
            )));
        }
        Ok(self.manifest.clone())
    }
}

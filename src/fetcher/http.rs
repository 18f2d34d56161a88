//! HTTP transport for chunks and manifests.
//!
//! Requests are plain GETs against an endpoint's base URL:
//! - `/depot/{depot_id}/chunk/{chunk_id_hex}` returns the raw chunk body
//! - `/depot/{depot_id}/manifest/{branch}` returns a JSON [`Manifest`]
//!
//! Turning a raw chunk body into file bytes (decryption, decompression) is
//! delegated to a [`ChunkDecoder`].

use std::sync::Arc;

use crate::config::HttpConfig;
use crate::error::Result;
use crate::manifest::{Manifest, ManifestSource};
use crate::types::{AppId, ChunkDescriptor, DepotId, DepotKey, ServerEndpoint};

use super::{ChunkFetcher, FetchError};

/// Turns a raw chunk body into the chunk's uncompressed bytes.
pub trait ChunkDecoder: Send + Sync {
    /// Decrypt and decompress `body` for `chunk`
    fn decode(
        &self,
        chunk: &ChunkDescriptor,
        depot_key: &DepotKey,
        body: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, FetchError>;
}

/// [`ChunkDecoder`] for endpoints that already serve plain chunk bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughDecoder;

impl ChunkDecoder for PassthroughDecoder {
    fn decode(
        &self,
        _chunk: &ChunkDescriptor,
        _depot_key: &DepotKey,
        body: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, FetchError> {
        Ok(body)
    }
}

fn build_client(config: &HttpConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(config.timeout)
        .user_agent(config.user_agent.clone())
        .build()?)
}

/// Build a request URL from path segments. Each segment is percent-encoded,
/// so `/`, `?` and `#` inside one stay inside it.
fn endpoint_url(
    endpoint: &ServerEndpoint,
    segments: &[&str],
) -> std::result::Result<url::Url, FetchError> {
    let mut url = url::Url::parse(&endpoint.base_url())
        .map_err(|e| FetchError::Other(format!("invalid endpoint {endpoint}: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| FetchError::Other(format!("endpoint {endpoint} cannot carry a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn get_bytes(
    client: &reqwest::Client,
    url: url::Url,
) -> std::result::Result<Vec<u8>, FetchError> {
    let response = client.get(url.clone()).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::from_status(status.as_u16(), url.to_string()));
    }
    Ok(response.bytes().await?.to_vec())
}

/// Production [`ChunkFetcher`] over HTTP.
pub struct HttpChunkFetcher {
    client: reqwest::Client,
    decoder: Arc<dyn ChunkDecoder>,
}

impl HttpChunkFetcher {
    /// Create a fetcher that serves chunk bodies unchanged
    pub fn new(config: &HttpConfig) -> Result<Self> {
        Self::with_decoder(config, Arc::new(PassthroughDecoder))
    }

    /// Create a fetcher with a custom decrypt/decompress step
    pub fn with_decoder(config: &HttpConfig, decoder: Arc<dyn ChunkDecoder>) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            decoder,
        })
    }
}

#[async_trait::async_trait]
impl ChunkFetcher for HttpChunkFetcher {
    async fn fetch_chunk(
        &self,
        endpoint: &ServerEndpoint,
        depot_id: DepotId,
        chunk: &ChunkDescriptor,
        depot_key: &DepotKey,
    ) -> std::result::Result<Vec<u8>, FetchError> {
        let depot = depot_id.to_string();
        let chunk_id = chunk.id.to_string();
        let url = endpoint_url(endpoint, &["depot", &depot, "chunk", &chunk_id])?;
        let body = get_bytes(&self.client, url).await?;

        if body.len() != chunk.compressed_length as usize {
            return Err(FetchError::Transport(format!(
                "short body for chunk {}: got {} of {} bytes",
                chunk.id,
                body.len(),
                chunk.compressed_length
            )));
        }

        self.decoder.decode(chunk, depot_key, body)
    }
}

/// [`ManifestSource`] that reads JSON manifests over HTTP.
pub struct HttpManifestSource {
    client: reqwest::Client,
}

impl HttpManifestSource {
    /// Create a manifest source with the given transport settings
    pub fn new(config: &HttpConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
        })
    }
}

#[async_trait::async_trait]
impl ManifestSource for HttpManifestSource {
    async fn fetch_manifest(
        &self,
        endpoint: &ServerEndpoint,
        _app_id: AppId,
        depot_id: DepotId,
        branch: &str,
        _depot_key: &DepotKey,
    ) -> std::result::Result<Manifest, FetchError> {
        let depot = depot_id.to_string();
        let url = endpoint_url(endpoint, &["depot", &depot, "manifest", branch])?;
        let body = get_bytes(&self.client, url).await?;
        serde_json::from_slice(&body)
            .map_err(|e| FetchError::Transport(format!("malformed manifest body: {e}")))
    }
}
